//! SQLite database operations
//!
//! All database access goes through this module.
//! Lookups return `Ok(None)` when no row matches; storage failures are
//! the only errors.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Get account by ID
    pub async fn get_account_by_id(&self, id: &str) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(account)
    }

    /// Get account by canonical ActivityPub URI
    pub async fn get_account_by_uri(&self, uri: &str) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(account)
    }

    /// Get account by `(username, domain)`
    ///
    /// # Arguments
    /// * `username` - Compared case-insensitively
    /// * `domain` - Punycode domain, or `""` for local accounts
    pub async fn get_account_by_username_domain(
        &self,
        username: &str,
        domain: &str,
    ) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE username = ? COLLATE NOCASE AND domain = ?",
        )
        .bind(username)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    /// Get a local account by username
    pub async fn get_local_account(&self, username: &str) -> Result<Option<Account>, AppError> {
        self.get_account_by_username_domain(username, "").await
    }

    /// Get the local account that owns the given inbox URI
    pub async fn get_local_account_by_inbox(
        &self,
        inbox_uri: &str,
    ) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE domain = '' AND inbox_uri = ?",
        )
        .bind(inbox_uri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    /// Get the local account that owns the given outbox URI
    pub async fn get_local_account_by_outbox(
        &self,
        outbox_uri: &str,
    ) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE domain = '' AND outbox_uri = ?",
        )
        .bind(outbox_uri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    /// Insert a new account
    ///
    /// # Errors
    /// `AppError::Conflict` if the URI or `(username, domain)` already exists
    pub async fn insert_account(&self, account: &Account) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                id, uri, url, username, domain, display_name, note,
                locked, bot, discoverable,
                inbox_uri, outbox_uri, shared_inbox_uri, followers_uri, following_uri, featured_uri,
                public_key_uri, public_key_pem, private_key_pem,
                avatar_remote_url, avatar_media_id, header_remote_url, header_media_id,
                created_at, updated_at, fetched_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(&account.uri)
        .bind(&account.url)
        .bind(&account.username)
        .bind(&account.domain)
        .bind(&account.display_name)
        .bind(&account.note)
        .bind(account.locked)
        .bind(account.bot)
        .bind(account.discoverable)
        .bind(&account.inbox_uri)
        .bind(&account.outbox_uri)
        .bind(&account.shared_inbox_uri)
        .bind(&account.followers_uri)
        .bind(&account.following_uri)
        .bind(&account.featured_uri)
        .bind(&account.public_key_uri)
        .bind(&account.public_key_pem)
        .bind(&account.private_key_pem)
        .bind(&account.avatar_remote_url)
        .bind(&account.avatar_media_id)
        .bind(&account.header_remote_url)
        .bind(&account.header_media_id)
        .bind(account.created_at)
        .bind(account.updated_at)
        .bind(account.fetched_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Overwrite the mutable fields of an existing account, keyed by ID
    ///
    /// # Returns
    /// `true` if a row was updated
    pub async fn update_account(&self, account: &Account) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts SET
                url = ?, username = ?, display_name = ?, note = ?,
                locked = ?, bot = ?, discoverable = ?,
                inbox_uri = ?, outbox_uri = ?, shared_inbox_uri = ?,
                followers_uri = ?, following_uri = ?, featured_uri = ?,
                public_key_uri = ?, public_key_pem = ?,
                avatar_remote_url = ?, avatar_media_id = ?,
                header_remote_url = ?, header_media_id = ?,
                updated_at = ?, fetched_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&account.url)
        .bind(&account.username)
        .bind(&account.display_name)
        .bind(&account.note)
        .bind(account.locked)
        .bind(account.bot)
        .bind(account.discoverable)
        .bind(&account.inbox_uri)
        .bind(&account.outbox_uri)
        .bind(&account.shared_inbox_uri)
        .bind(&account.followers_uri)
        .bind(&account.following_uri)
        .bind(&account.featured_uri)
        .bind(&account.public_key_uri)
        .bind(&account.public_key_pem)
        .bind(&account.avatar_remote_url)
        .bind(&account.avatar_media_id)
        .bind(&account.header_remote_url)
        .bind(&account.header_media_id)
        .bind(account.updated_at)
        .bind(account.fetched_at)
        .bind(&account.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Statuses
    // =========================================================================

    /// Get status by ID
    pub async fn get_status_by_id(&self, id: &str) -> Result<Option<Status>, AppError> {
        let status = sqlx::query_as::<_, Status>("SELECT * FROM statuses WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(status)
    }

    /// Get status by ActivityPub URI
    pub async fn get_status_by_uri(&self, uri: &str) -> Result<Option<Status>, AppError> {
        let status = sqlx::query_as::<_, Status>("SELECT * FROM statuses WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(status)
    }

    /// Get the boost of `boost_of_id` made by `account_id`, if any
    pub async fn get_boost(
        &self,
        account_id: &str,
        boost_of_id: &str,
    ) -> Result<Option<Status>, AppError> {
        let status = sqlx::query_as::<_, Status>(
            "SELECT * FROM statuses WHERE account_id = ? AND boost_of_id = ?",
        )
        .bind(account_id)
        .bind(boost_of_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status)
    }

    /// Insert a new status
    ///
    /// # Errors
    /// `AppError::Conflict` if the URI already exists
    pub async fn insert_status(&self, status: &Status) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO statuses (
                id, uri, url, content, content_warning, sensitive, visibility, language,
                account_id, account_uri, is_local,
                in_reply_to_id, in_reply_to_uri, in_reply_to_account_id,
                boost_of_id, boost_of_uri, boost_of_account_id,
                attachment_ids, emoji_ids, created_at, updated_at, fetched_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&status.id)
        .bind(&status.uri)
        .bind(&status.url)
        .bind(&status.content)
        .bind(&status.content_warning)
        .bind(status.sensitive)
        .bind(&status.visibility)
        .bind(&status.language)
        .bind(&status.account_id)
        .bind(&status.account_uri)
        .bind(status.is_local)
        .bind(&status.in_reply_to_id)
        .bind(&status.in_reply_to_uri)
        .bind(&status.in_reply_to_account_id)
        .bind(&status.boost_of_id)
        .bind(&status.boost_of_uri)
        .bind(&status.boost_of_account_id)
        .bind(&status.attachment_ids)
        .bind(&status.emoji_ids)
        .bind(status.created_at)
        .bind(status.updated_at)
        .bind(status.fetched_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Overwrite the mutable fields of an existing status, keyed by ID
    pub async fn update_status(&self, status: &Status) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE statuses SET
                url = ?, content = ?, content_warning = ?, sensitive = ?,
                visibility = ?, language = ?,
                in_reply_to_id = ?, in_reply_to_uri = ?, in_reply_to_account_id = ?,
                attachment_ids = ?, emoji_ids = ?, updated_at = ?, fetched_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&status.url)
        .bind(&status.content)
        .bind(&status.content_warning)
        .bind(status.sensitive)
        .bind(&status.visibility)
        .bind(&status.language)
        .bind(&status.in_reply_to_id)
        .bind(&status.in_reply_to_uri)
        .bind(&status.in_reply_to_account_id)
        .bind(&status.attachment_ids)
        .bind(&status.emoji_ids)
        .bind(status.updated_at)
        .bind(status.fetched_at)
        .bind(&status.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Link a reply to its now-resolved parent
    pub async fn set_status_parent(
        &self,
        status_id: &str,
        parent_id: &str,
        parent_account_id: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE statuses SET in_reply_to_id = ?, in_reply_to_account_id = ? WHERE id = ?",
        )
        .bind(parent_id)
        .bind(parent_account_id)
        .bind(status_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Point a boost at its now-resolved target
    pub async fn set_status_boost(
        &self,
        status_id: &str,
        boost_of_id: &str,
        boost_of_account_id: &str,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE statuses SET boost_of_id = ?, boost_of_account_id = ? WHERE id = ?")
            .bind(boost_of_id)
            .bind(boost_of_account_id)
            .bind(status_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Delete a status together with its poll, faves and boosts
    pub async fn delete_status(&self, id: &str) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM poll_options WHERE status_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM polls WHERE status_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM faves WHERE status_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM statuses WHERE boost_of_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM statuses WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Follows
    // =========================================================================

    /// Get follow by activity URI
    pub async fn get_follow_by_uri(&self, uri: &str) -> Result<Option<Follow>, AppError> {
        let follow = sqlx::query_as::<_, Follow>("SELECT * FROM follows WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(follow)
    }

    /// Get the follow edge `account_id -> target_account_id`
    pub async fn get_follow(
        &self,
        account_id: &str,
        target_account_id: &str,
    ) -> Result<Option<Follow>, AppError> {
        let follow = sqlx::query_as::<_, Follow>(
            "SELECT * FROM follows WHERE account_id = ? AND target_account_id = ?",
        )
        .bind(account_id)
        .bind(target_account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(follow)
    }

    /// Check whether `account_id` follows `target_account_id`
    pub async fn is_following(
        &self,
        account_id: &str,
        target_account_id: &str,
    ) -> Result<bool, AppError> {
        Ok(self.get_follow(account_id, target_account_id).await?.is_some())
    }

    /// Insert a new follow
    pub async fn insert_follow(&self, follow: &Follow) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO follows (id, uri, account_id, target_account_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&follow.id)
        .bind(&follow.uri)
        .bind(&follow.account_id)
        .bind(&follow.target_account_id)
        .bind(follow.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete follow by activity URI
    ///
    /// # Returns
    /// `true` if a row was deleted
    pub async fn delete_follow_by_uri(&self, uri: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM follows WHERE uri = ?")
            .bind(uri)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Follows made by `account_id`, oldest first
    pub async fn get_account_follows(&self, account_id: &str) -> Result<Vec<Follow>, AppError> {
        let follows = sqlx::query_as::<_, Follow>(
            "SELECT * FROM follows WHERE account_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(follows)
    }

    /// Follows targeting `account_id`, oldest first
    pub async fn get_account_followers(&self, account_id: &str) -> Result<Vec<Follow>, AppError> {
        let follows = sqlx::query_as::<_, Follow>(
            "SELECT * FROM follows WHERE target_account_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(follows)
    }

    // =========================================================================
    // Follow requests
    // =========================================================================

    /// Get follow request by activity URI
    pub async fn get_follow_request_by_uri(
        &self,
        uri: &str,
    ) -> Result<Option<FollowRequest>, AppError> {
        let request =
            sqlx::query_as::<_, FollowRequest>("SELECT * FROM follow_requests WHERE uri = ?")
                .bind(uri)
                .fetch_optional(&self.pool)
                .await?;

        Ok(request)
    }

    /// Get the pending request `account_id -> target_account_id`
    pub async fn get_follow_request(
        &self,
        account_id: &str,
        target_account_id: &str,
    ) -> Result<Option<FollowRequest>, AppError> {
        let request = sqlx::query_as::<_, FollowRequest>(
            "SELECT * FROM follow_requests WHERE account_id = ? AND target_account_id = ?",
        )
        .bind(account_id)
        .bind(target_account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(request)
    }

    /// Insert a new follow request
    pub async fn insert_follow_request(&self, request: &FollowRequest) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO follow_requests (id, uri, account_id, target_account_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&request.id)
        .bind(&request.uri)
        .bind(&request.account_id)
        .bind(&request.target_account_id)
        .bind(request.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete follow request by activity URI
    pub async fn delete_follow_request_by_uri(&self, uri: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM follow_requests WHERE uri = ?")
            .bind(uri)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Turn a pending request into an established follow atomically
    ///
    /// # Returns
    /// The new follow, or `None` if no request with this URI exists
    pub async fn accept_follow_request(&self, uri: &str) -> Result<Option<Follow>, AppError> {
        let mut tx = self.pool.begin().await?;

        let Some(request) =
            sqlx::query_as::<_, FollowRequest>("SELECT * FROM follow_requests WHERE uri = ?")
                .bind(uri)
                .fetch_optional(&mut *tx)
                .await?
        else {
            return Ok(None);
        };

        let follow = Follow {
            id: EntityId::new().0,
            uri: request.uri.clone(),
            account_id: request.account_id.clone(),
            target_account_id: request.target_account_id.clone(),
            created_at: Utc::now(),
        };

        sqlx::query("DELETE FROM follow_requests WHERE id = ?")
            .bind(&request.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO follows (id, uri, account_id, target_account_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(account_id, target_account_id) DO NOTHING
            "#,
        )
        .bind(&follow.id)
        .bind(&follow.uri)
        .bind(&follow.account_id)
        .bind(&follow.target_account_id)
        .bind(follow.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(follow))
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Insert a new block, dropping any follow edges between the two accounts
    pub async fn insert_block(&self, block: &Block) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO blocks (id, uri, account_id, target_account_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&block.id)
        .bind(&block.uri)
        .bind(&block.account_id)
        .bind(&block.target_account_id)
        .bind(block.created_at)
        .execute(&mut *tx)
        .await?;

        for table in ["follows", "follow_requests"] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE (account_id = ? AND target_account_id = ?) OR (account_id = ? AND target_account_id = ?)"
            ))
            .bind(&block.account_id)
            .bind(&block.target_account_id)
            .bind(&block.target_account_id)
            .bind(&block.account_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Get block by activity URI
    pub async fn get_block_by_uri(&self, uri: &str) -> Result<Option<Block>, AppError> {
        let block = sqlx::query_as::<_, Block>("SELECT * FROM blocks WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(block)
    }

    /// Delete block by activity URI
    pub async fn delete_block_by_uri(&self, uri: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM blocks WHERE uri = ?")
            .bind(uri)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Check whether either account blocks the other
    pub async fn is_blocked(&self, account_a: &str, account_b: &str) -> Result<bool, AppError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM blocks
            WHERE (account_id = ? AND target_account_id = ?)
               OR (account_id = ? AND target_account_id = ?)
            "#,
        )
        .bind(account_a)
        .bind(account_b)
        .bind(account_b)
        .bind(account_a)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    // =========================================================================
    // Faves
    // =========================================================================

    /// Insert a new fave
    pub async fn insert_fave(&self, fave: &Fave) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO faves (id, uri, account_id, status_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&fave.id)
        .bind(&fave.uri)
        .bind(&fave.account_id)
        .bind(&fave.status_id)
        .bind(fave.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get fave by activity URI
    pub async fn get_fave_by_uri(&self, uri: &str) -> Result<Option<Fave>, AppError> {
        let fave = sqlx::query_as::<_, Fave>("SELECT * FROM faves WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(fave)
    }

    /// Delete fave by activity URI
    pub async fn delete_fave_by_uri(&self, uri: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM faves WHERE uri = ?")
            .bind(uri)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Domain blocks
    // =========================================================================

    /// Get all blocked domains
    pub async fn get_blocked_domains(&self) -> Result<Vec<String>, AppError> {
        let domains = sqlx::query_scalar::<_, String>(
            "SELECT domain FROM domain_blocks ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(domains)
    }

    /// Get a domain block by its (punycode) domain
    pub async fn get_domain_block(&self, domain: &str) -> Result<Option<DomainBlock>, AppError> {
        let block = sqlx::query_as::<_, DomainBlock>("SELECT * FROM domain_blocks WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;

        Ok(block)
    }

    /// Insert a domain block
    ///
    /// # Errors
    /// `AppError::Conflict` if the domain is already blocked
    pub async fn insert_domain_block(&self, block: &DomainBlock) -> Result<(), AppError> {
        sqlx::query("INSERT INTO domain_blocks (id, domain, created_at) VALUES (?, ?, ?)")
            .bind(&block.id)
            .bind(&block.domain)
            .bind(block.created_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Remove a domain block
    ///
    /// # Returns
    /// `true` if the domain was blocked
    pub async fn delete_domain_block(&self, domain: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM domain_blocks WHERE domain = ?")
            .bind(domain)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Get instance by domain
    pub async fn get_instance(&self, domain: &str) -> Result<Option<Instance>, AppError> {
        let instance = sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;

        Ok(instance)
    }

    /// Insert or refresh an instance, keyed by domain
    pub async fn upsert_instance(&self, instance: &Instance) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO instances (
                id, domain, uri, title, description, version, contact_email,
                created_at, updated_at, fetched_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(domain) DO UPDATE SET
                uri = excluded.uri,
                title = excluded.title,
                description = excluded.description,
                version = excluded.version,
                contact_email = excluded.contact_email,
                updated_at = excluded.updated_at,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.domain)
        .bind(&instance.uri)
        .bind(&instance.title)
        .bind(&instance.description)
        .bind(&instance.version)
        .bind(&instance.contact_email)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .bind(instance.fetched_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Media
    // =========================================================================

    /// Insert a media attachment
    pub async fn insert_media(&self, media: &MediaAttachment) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO media_attachments (
                id, account_id, remote_url, file_path, content_type, file_size,
                description, blurhash, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&media.id)
        .bind(&media.account_id)
        .bind(&media.remote_url)
        .bind(&media.file_path)
        .bind(&media.content_type)
        .bind(media.file_size)
        .bind(&media.description)
        .bind(&media.blurhash)
        .bind(media.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get media attachment by ID
    pub async fn get_media(&self, id: &str) -> Result<Option<MediaAttachment>, AppError> {
        let media =
            sqlx::query_as::<_, MediaAttachment>("SELECT * FROM media_attachments WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(media)
    }

    // =========================================================================
    // Emojis
    // =========================================================================

    /// Get emoji by shortcode and domain
    pub async fn get_emoji(&self, shortcode: &str, domain: &str) -> Result<Option<Emoji>, AppError> {
        let emoji =
            sqlx::query_as::<_, Emoji>("SELECT * FROM emojis WHERE shortcode = ? AND domain = ?")
                .bind(shortcode)
                .bind(domain)
                .fetch_optional(&self.pool)
                .await?;

        Ok(emoji)
    }

    /// Insert or refresh an emoji, keyed by `(shortcode, domain)`
    ///
    /// # Returns
    /// The stored row (with the original ID when it already existed)
    pub async fn upsert_emoji(&self, emoji: &Emoji) -> Result<Emoji, AppError> {
        sqlx::query(
            r#"
            INSERT INTO emojis (
                id, shortcode, domain, uri, image_remote_url, file_path, content_type,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(shortcode, domain) DO UPDATE SET
                uri = excluded.uri,
                image_remote_url = excluded.image_remote_url,
                file_path = excluded.file_path,
                content_type = excluded.content_type,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&emoji.id)
        .bind(&emoji.shortcode)
        .bind(&emoji.domain)
        .bind(&emoji.uri)
        .bind(&emoji.image_remote_url)
        .bind(&emoji.file_path)
        .bind(&emoji.content_type)
        .bind(emoji.created_at)
        .bind(emoji.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_emoji(&emoji.shortcode, &emoji.domain)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("emoji vanished after upsert")))
    }

    // =========================================================================
    // Polls
    // =========================================================================

    /// Get poll by status ID
    pub async fn get_poll(&self, status_id: &str) -> Result<Option<Poll>, AppError> {
        let poll = sqlx::query_as::<_, Poll>("SELECT * FROM polls WHERE status_id = ?")
            .bind(status_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(poll)
    }

    /// Get poll options ordered by position
    pub async fn get_poll_options(&self, status_id: &str) -> Result<Vec<PollOption>, AppError> {
        let options = sqlx::query_as::<_, PollOption>(
            "SELECT * FROM poll_options WHERE status_id = ? ORDER BY position ASC",
        )
        .bind(status_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(options)
    }

    /// Replace a status' poll and its options
    pub async fn put_poll(&self, poll: &Poll, options: &[PollOption]) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO polls (status_id, multiple, expires_at, closed_at, voters_count)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(status_id) DO UPDATE SET
                multiple = excluded.multiple,
                expires_at = excluded.expires_at,
                closed_at = excluded.closed_at,
                voters_count = excluded.voters_count
            "#,
        )
        .bind(&poll.status_id)
        .bind(poll.multiple)
        .bind(poll.expires_at)
        .bind(poll.closed_at)
        .bind(poll.voters_count)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM poll_options WHERE status_id = ?")
            .bind(&poll.status_id)
            .execute(&mut *tx)
            .await?;

        for option in options {
            sqlx::query(
                "INSERT INTO poll_options (status_id, position, title, votes_count) VALUES (?, ?, ?, ?)",
            )
            .bind(&option.status_id)
            .bind(option.position)
            .bind(&option.title)
            .bind(option.votes_count)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Update vote tallies on an existing poll
    ///
    /// Options are matched by title; unknown titles are ignored.
    ///
    /// # Returns
    /// `false` if the status has no poll
    pub async fn update_poll_tallies(
        &self,
        status_id: &str,
        tallies: &[(String, i64)],
        voters_count: Option<i64>,
        closed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE polls SET voters_count = COALESCE(?, voters_count), closed_at = COALESCE(?, closed_at) WHERE status_id = ?",
        )
        .bind(voters_count)
        .bind(closed_at)
        .bind(status_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        for (title, votes) in tallies {
            sqlx::query(
                "UPDATE poll_options SET votes_count = ? WHERE status_id = ? AND title = ?",
            )
            .bind(votes)
            .bind(status_id)
            .bind(title)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

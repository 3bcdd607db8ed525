//! Account resolution

use chrono::Utc;
use futures::FutureExt;
use url::Url;

use super::{Dereferencer, domain_of, handshake};
use crate::data::{Account, EntityId};
use crate::error::{AppError, ErrorKind};
use crate::federation::domain_block::punify;
use crate::federation::objects::ActorObject;
use crate::metrics::observe_dereference;

impl Dereferencer {
    /// Resolve an account by its actor IRI
    ///
    /// A stored account that is still fresh is returned as is. Otherwise
    /// the actor is fetched (or an in-flight fetch joined), checked and
    /// stored. A failed fetch falls back to the stored record if there is
    /// one.
    ///
    /// # Errors
    /// - `AppError::Blocked` if the IRI's domain is blocked; nothing is fetched
    /// - `AppError::NotFound`/`Gone` if the remote has no such actor, or
    ///   the IRI is local and unknown
    /// - `AppError::Federation` for unreachable or misbehaving remotes
    pub async fn resolve_account_by_uri(
        &self,
        requester: &str,
        uri: &Url,
    ) -> Result<Account, AppError> {
        self.inner.blocks.ensure_uri_allowed(uri).await?;

        let existing = self.inner.db.get_account_by_uri(uri.as_str()).await?;
        if let Some(account) = &existing {
            if account.is_fresh(Utc::now(), self.inner.federation.account_refresh_interval()) {
                observe_dereference("account", "cached");
                return Ok(account.clone());
            }
        }

        if self.is_local_url(uri) {
            return existing.ok_or(AppError::NotFound);
        }

        if handshake::in_chain(uri.as_str()) {
            tracing::debug!(uri = %uri, requester, "Actor already being resolved, not re-entering");
            observe_dereference("account", "handshake");
            return existing.ok_or_else(|| AppError::Gone(format!("handshake in progress: {uri}")));
        }

        match self.fetch_account(requester, uri).await {
            Ok(account) => Ok(account),
            Err(error) => self.stale_account_or(existing, error),
        }
    }

    /// Resolve an account by `username@domain`
    ///
    /// Local handles are only looked up in storage. Remote ones are
    /// discovered through webfinger and resolved by IRI.
    pub async fn resolve_account_by_handle(
        &self,
        requester: &str,
        username: &str,
        domain: &str,
    ) -> Result<Account, AppError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AppError::Validation("Empty username in handle".to_string()));
        }
        let domain = punify(domain)?;

        if self.is_local_domain(&domain) {
            return self
                .inner
                .db
                .get_local_account(username)
                .await?
                .ok_or(AppError::NotFound);
        }

        if self.inner.blocks.is_blocked(&domain).await? {
            return Err(AppError::Blocked(domain));
        }

        let existing = self
            .inner
            .db
            .get_account_by_username_domain(username, &domain)
            .await?;
        if let Some(account) = &existing {
            if account.is_fresh(Utc::now(), self.inner.federation.account_refresh_interval()) {
                observe_dereference("account", "cached");
                return Ok(account.clone());
            }
        }

        let resolved = async {
            let uri = self
                .inner
                .transport
                .finger(requester, username, &domain)
                .await?;
            self.resolve_account_by_uri(requester, &uri).await
        }
        .await;

        match resolved {
            Ok(account) => Ok(account),
            Err(error) => self.stale_account_or(existing, error),
        }
    }

    /// Build an updated copy of `account` from a fresh actor document
    ///
    /// The actor is fetched when `actor` is `None`. Avatar and header are
    /// (re)fetched when their URL changed. The result is not stored.
    pub async fn refresh_account(
        &self,
        requester: &str,
        actor: Option<&ActorObject>,
        account: &Account,
    ) -> Result<Account, AppError> {
        let fetched;
        let actor = match actor {
            Some(actor) => actor,
            None => {
                let uri = Url::parse(&account.uri)
                    .map_err(|e| AppError::Validation(format!("Stored account IRI: {e}")))?;
                self.inner.blocks.ensure_uri_allowed(&uri).await?;
                fetched = self.fetch_actor(requester, &uri).await?;
                &fetched
            }
        };

        let avatar_media_id = match actor.icon_url.as_deref() {
            Some(url) if account.avatar_remote_url.as_deref() != Some(url)
                || account.avatar_media_id.is_none() =>
            {
                self.fetch_profile_image(requester, &account.id, url, false)
                    .await
            }
            Some(_) => account.avatar_media_id.clone(),
            None => None,
        };
        let header_media_id = match actor.image_url.as_deref() {
            Some(url) if account.header_remote_url.as_deref() != Some(url)
                || account.header_media_id.is_none() =>
            {
                self.fetch_profile_image(requester, &account.id, url, true)
                    .await
            }
            Some(_) => account.header_media_id.clone(),
            None => None,
        };

        let now = Utc::now();
        Ok(Account {
            id: account.id.clone(),
            uri: actor.id.to_string(),
            url: actor.url.clone(),
            username: actor.preferred_username.clone(),
            domain: domain_of(&actor.id)?,
            display_name: actor.name.clone(),
            note: actor.summary.clone(),
            locked: actor.manually_approves_followers,
            bot: actor.is_bot(),
            discoverable: actor.discoverable,
            inbox_uri: actor.inbox.clone(),
            outbox_uri: actor.outbox.clone(),
            shared_inbox_uri: actor.shared_inbox.clone(),
            followers_uri: actor.followers.clone(),
            following_uri: actor.following.clone(),
            featured_uri: actor.featured.clone(),
            public_key_uri: actor.public_key_id.clone(),
            public_key_pem: actor.public_key_pem.clone(),
            private_key_pem: None,
            avatar_remote_url: actor.icon_url.clone(),
            avatar_media_id,
            header_remote_url: actor.image_url.clone(),
            header_media_id,
            created_at: account.created_at,
            updated_at: now,
            fetched_at: Some(now),
        })
    }

    /// Fetch and store an actor, sharing the fetch with concurrent callers
    async fn fetch_account(&self, requester: &str, uri: &Url) -> Result<Account, AppError> {
        let this = self.clone();
        let owned_requester = requester.to_string();
        let owned_uri = uri.clone();

        self.inner
            .accounts
            .run(uri.as_str(), move || {
                let chain_requester = owned_requester.clone();
                let chain_uri = owned_uri.to_string();
                handshake::scoped(
                    &chain_requester,
                    &chain_uri,
                    async move {
                        let _handshake = this.inner.handshakes.start(&owned_requester, &owned_uri);
                        this.dereference_account(&owned_requester, &owned_uri).await
                    },
                )
                .boxed()
            })
            .await
    }

    async fn dereference_account(&self, requester: &str, uri: &Url) -> Result<Account, AppError> {
        let actor = match self.fetch_actor(requester, uri).await {
            Ok(actor) => actor,
            Err(error) => {
                observe_dereference("account", "failed");
                return Err(error);
            }
        };

        let existing = self.inner.db.get_account_by_uri(uri.as_str()).await?;
        let base = existing.clone().unwrap_or_else(|| placeholder_account(&actor));
        let refreshed = self.refresh_account(requester, Some(&actor), &base).await?;
        let account = self.store_account(refreshed, existing.is_some()).await?;

        if existing.is_none() {
            self.resolve_instance_in_background(requester, uri);
        }

        observe_dereference("account", "fetched");
        tracing::info!(uri = %uri, username = %account.username, domain = %account.domain, "Dereferenced account");
        Ok(account)
    }

    /// Fetch an actor document and check it describes `uri`
    async fn fetch_actor(&self, requester: &str, uri: &Url) -> Result<ActorObject, AppError> {
        let value = self.inner.transport.dereference(requester, uri).await?;
        let actor = ActorObject::parse(&value)?;

        if actor.id != *uri {
            return Err(AppError::Federation(format!(
                "Actor document for {uri} claims id {}",
                actor.id
            )));
        }
        if actor.public_key_owner != actor.id.as_str() {
            return Err(AppError::Federation(format!(
                "Key {} of {uri} is owned by {}",
                actor.public_key_id, actor.public_key_owner
            )));
        }

        Ok(actor)
    }

    /// Insert or update, recovering from a concurrent insert of the same IRI
    async fn store_account(&self, mut account: Account, exists: bool) -> Result<Account, AppError> {
        if exists && self.inner.db.update_account(&account).await? {
            return Ok(account);
        }

        match self.inner.db.insert_account(&account).await {
            Ok(()) => Ok(account),
            Err(AppError::Conflict(message)) => {
                let Some(stored) = self.inner.db.get_account_by_uri(&account.uri).await? else {
                    return Err(AppError::Conflict(message));
                };
                account.id = stored.id;
                account.created_at = stored.created_at;
                self.inner.db.update_account(&account).await?;
                Ok(account)
            }
            Err(error) => Err(error),
        }
    }

    fn stale_account_or(
        &self,
        existing: Option<Account>,
        error: AppError,
    ) -> Result<Account, AppError> {
        match existing {
            Some(stale) if error.kind() != ErrorKind::Blocked => {
                tracing::warn!(%error, uri = %stale.uri, "Refresh failed, using stored account");
                observe_dereference("account", "stale");
                Ok(stale)
            }
            _ => Err(error),
        }
    }
}

/// Skeleton for an actor seen for the first time
fn placeholder_account(actor: &ActorObject) -> Account {
    let now = Utc::now();
    Account {
        id: EntityId::new().0,
        uri: actor.id.to_string(),
        url: None,
        username: actor.preferred_username.clone(),
        domain: String::new(),
        display_name: None,
        note: None,
        locked: false,
        bot: false,
        discoverable: false,
        inbox_uri: None,
        outbox_uri: None,
        shared_inbox_uri: None,
        followers_uri: None,
        following_uri: None,
        featured_uri: None,
        public_key_uri: actor.public_key_id.clone(),
        public_key_pem: actor.public_key_pem.clone(),
        private_key_pem: None,
        avatar_remote_url: None,
        avatar_media_id: None,
        header_remote_url: None,
        header_media_id: None,
        created_at: now,
        updated_at: now,
        fetched_at: None,
    }
}

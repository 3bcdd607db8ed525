//! Domain Block Guard
//!
//! Decides whether a remote domain is federation-blocked. The set of
//! blocked domains is hydrated lazily from storage and dropped wholesale on
//! every block-list mutation, so the next query reloads it.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use url::Url;

use crate::config::ServerConfig;
use crate::data::{Database, DomainBlock, EntityId};
use crate::error::AppError;
use crate::metrics::{DOMAIN_BLOCK_CACHE_CLEARS, DOMAIN_BLOCK_CACHE_TOTAL};

/// Callback returning every stored blocked domain
pub type BlockLoader =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<String>, AppError>> + Send + Sync>;

/// Normalize a domain to its lowercase punycode form
///
/// Trailing dots and surrounding whitespace are ignored. The empty string
/// normalizes to itself.
///
/// # Errors
/// `AppError::Validation` if the input is not a valid host
pub fn punify(domain: &str) -> Result<String, AppError> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Ok(String::new());
    }

    match url::Host::parse(trimmed) {
        Ok(url::Host::Domain(ascii)) => Ok(ascii.to_ascii_lowercase()),
        Ok(host) => Ok(host.to_string()),
        Err(e) => Err(AppError::Validation(format!(
            "Malformed domain {:?}: {}",
            domain, e
        ))),
    }
}

/// Federation-level domain block check with an invalidatable cache
pub struct DomainBlockGuard {
    db: Arc<Database>,
    host: String,
    account_domain: String,
    loader: BlockLoader,
    /// `None` until hydrated, and again after every mutation
    cache: RwLock<Option<HashSet<String>>>,
}

impl DomainBlockGuard {
    /// Create a guard that hydrates from the `domain_blocks` table
    pub fn new(server: &ServerConfig, db: Arc<Database>) -> Result<Self, AppError> {
        let loader_db = db.clone();
        let loader: BlockLoader = Arc::new(move || {
            let db = loader_db.clone();
            Box::pin(async move { db.get_blocked_domains().await })
        });
        Self::with_loader(server, db, loader)
    }

    /// Create a guard with a custom hydration callback
    pub fn with_loader(
        server: &ServerConfig,
        db: Arc<Database>,
        loader: BlockLoader,
    ) -> Result<Self, AppError> {
        Ok(Self {
            db,
            host: punify(&server.domain)?,
            account_domain: punify(server.account_domain())?,
            loader,
            cache: RwLock::new(None),
        })
    }

    /// The empty domain and our own host/account domain are never blocked.
    fn is_exempt(&self, domain: &str) -> bool {
        domain.is_empty() || domain == self.host || domain == self.account_domain
    }

    /// Check whether a domain, or any parent domain of it, is blocked
    pub async fn is_blocked(&self, domain: &str) -> Result<bool, AppError> {
        let domain = punify(domain)?;
        if self.is_exempt(&domain) {
            return Ok(false);
        }

        {
            let cache = self.cache.read().await;
            if let Some(blocked) = cache.as_ref() {
                DOMAIN_BLOCK_CACHE_TOTAL.with_label_values(&["hit"]).inc();
                return Ok(matches_blocked(blocked, &domain));
            }
        }

        let mut cache = self.cache.write().await;
        // Another task may have hydrated while we waited for the write lock
        if cache.is_none() {
            DOMAIN_BLOCK_CACHE_TOTAL.with_label_values(&["miss"]).inc();
            let domains = (self.loader)().await?;
            let blocked = domains
                .iter()
                .filter_map(|stored| punify(stored).ok())
                .filter(|stored| !stored.is_empty())
                .collect::<HashSet<_>>();
            tracing::debug!(count = blocked.len(), "Hydrated domain block cache");
            *cache = Some(blocked);
        }

        Ok(cache
            .as_ref()
            .is_some_and(|blocked| matches_blocked(blocked, &domain)))
    }

    /// True if any of the given domains is blocked
    pub async fn is_blocked_any<I, S>(&self, domains: I) -> Result<bool, AppError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for domain in domains {
            if self.is_blocked(domain.as_ref()).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Check the host of a URI
    pub async fn is_uri_blocked(&self, uri: &Url) -> Result<bool, AppError> {
        self.is_blocked(uri.host_str().unwrap_or_default()).await
    }

    /// True if the host of any of the given URIs is blocked
    pub async fn is_uri_blocked_any(&self, uris: &[Url]) -> Result<bool, AppError> {
        for uri in uris {
            if self.is_uri_blocked(uri).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Fail with `AppError::Blocked` if the URI's host is blocked
    pub async fn ensure_uri_allowed(&self, uri: &Url) -> Result<(), AppError> {
        if self.is_uri_blocked(uri).await? {
            tracing::debug!(uri = %uri, "Refusing to contact blocked domain");
            return Err(AppError::Blocked(
                uri.host_str().unwrap_or_default().to_string(),
            ));
        }
        Ok(())
    }

    /// Look up the stored block row for a domain
    pub async fn get_domain_block(&self, domain: &str) -> Result<Option<DomainBlock>, AppError> {
        let domain = punify(domain)?;
        if self.is_exempt(&domain) {
            return Ok(None);
        }
        self.db.get_domain_block(&domain).await
    }

    /// Block a domain
    ///
    /// The write lock is held across the insert and the cache clear so no
    /// reader can observe the old block list once this returns.
    ///
    /// # Errors
    /// - `AppError::Validation` if the domain is malformed or empty
    /// - `AppError::Conflict` if the domain is already blocked
    pub async fn create_domain_block(&self, domain: &str) -> Result<DomainBlock, AppError> {
        let domain = punify(domain)?;
        if domain.is_empty() {
            return Err(AppError::Validation("Cannot block empty domain".to_string()));
        }

        let block = DomainBlock {
            id: EntityId::new().0,
            domain,
            created_at: chrono::Utc::now(),
        };

        let mut cache = self.cache.write().await;
        self.db.insert_domain_block(&block).await?;
        *cache = None;
        DOMAIN_BLOCK_CACHE_CLEARS.inc();

        tracing::info!(domain = %block.domain, "Domain blocked");
        Ok(block)
    }

    /// Unblock a domain
    ///
    /// # Returns
    /// `true` if the domain was blocked
    pub async fn delete_domain_block(&self, domain: &str) -> Result<bool, AppError> {
        let domain = punify(domain)?;

        let mut cache = self.cache.write().await;
        let deleted = self.db.delete_domain_block(&domain).await?;
        *cache = None;
        DOMAIN_BLOCK_CACHE_CLEARS.inc();

        tracing::info!(domain = %domain, deleted, "Domain unblocked");
        Ok(deleted)
    }
}

/// Exact match, or a blocked parent at a label boundary
/// (`evil.example` blocks `media.evil.example`).
fn matches_blocked(blocked: &HashSet<String>, domain: &str) -> bool {
    let mut candidate = domain;
    loop {
        if blocked.contains(candidate) {
            return true;
        }
        match candidate.split_once('.') {
            Some((_, parent)) if !parent.is_empty() => candidate = parent,
            _ => return false,
        }
    }
}

//! Dereferencer
//!
//! Turns remote identifiers into stored, reasonably fresh records:
//! accounts, statuses (with their reply chains), instances, media and
//! emoji. Every entry point checks the domain block guard before touching
//! the network.
//!
//! Concurrent requests for the same resource share a single fetch, and a
//! resolution that loops back onto an actor it is already resolving is
//! cut short instead of recursing.

mod account;
mod handshake;
mod inflight;
mod instance;
mod media;
mod status;
mod thread;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use url::Url;

use crate::config::{FederationConfig, ServerConfig};
use crate::data::{Account, Database, Emoji, Instance, MediaAttachment, Status};
use crate::error::AppError;
use crate::federation::domain_block::{DomainBlockGuard, punify};
use crate::federation::media::MediaManager;
use crate::federation::transport::Transport;

use handshake::Handshakes;
use inflight::InFlight;
use media::JobMap;

pub use thread::{ThreadResolution, ThreadStop};

/// Cheaply cloneable handle to the resolution engine
#[derive(Clone)]
pub struct Dereferencer {
    inner: Arc<Inner>,
}

struct Inner {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    media: Arc<dyn MediaManager>,
    blocks: Arc<DomainBlockGuard>,
    federation: FederationConfig,
    host: String,
    account_domain: String,

    accounts: InFlight<Account>,
    statuses: InFlight<Status>,
    instances: InFlight<Instance>,

    avatars: JobMap<MediaAttachment>,
    headers: JobMap<MediaAttachment>,
    attachments: JobMap<MediaAttachment>,
    emojis: JobMap<Emoji>,

    handshakes: Handshakes,
}

impl Dereferencer {
    pub fn new(
        server: &ServerConfig,
        federation: FederationConfig,
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        media: Arc<dyn MediaManager>,
        blocks: Arc<DomainBlockGuard>,
    ) -> Result<Self, AppError> {
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                transport,
                media,
                blocks,
                federation,
                host: punify(&server.domain)?,
                account_domain: punify(server.account_domain())?,
                accounts: InFlight::new("account"),
                statuses: InFlight::new("status"),
                instances: InFlight::new("instance"),
                avatars: JobMap::new("avatar"),
                headers: JobMap::new("header"),
                attachments: JobMap::new("attachment"),
                emojis: JobMap::new("emoji"),
                handshakes: Handshakes::default(),
            }),
        })
    }

    /// Whether `username` is currently in the middle of dereferencing `uri`
    ///
    /// Inbound deliveries signed by an actor we are still fetching should
    /// use the stored key instead of triggering another fetch.
    pub fn is_handshaking(&self, username: &str, uri: &Url) -> bool {
        self.inner.handshakes.is_handshaking(username, uri)
    }

    /// Whether a domain (already punified) is this node's own
    fn is_local_domain(&self, domain: &str) -> bool {
        domain.is_empty() || domain == self.inner.host || domain == self.inner.account_domain
    }

    fn is_local_url(&self, url: &Url) -> bool {
        url.host_str()
            .and_then(|host| punify(host).ok())
            .is_some_and(|host| self.is_local_domain(&host))
    }
}

/// Punified host of a URL
fn domain_of(url: &Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation(format!("IRI without host: {url}")))?;
    punify(host)
}

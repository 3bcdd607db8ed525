//! Handshake tracking
//!
//! While a (local actor, remote actor) pair is being dereferenced the pair
//! is recorded twice: in a shared map that answers `is_handshaking` for
//! other requests, and in a task-local chain that lets a nested resolution
//! running inside the same operation notice it is re-entering.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use url::Url;

tokio::task_local! {
    static CHAIN: Vec<(String, String)>;
}

/// `(requester, uri)` pairs entered by the current operation
fn current_chain() -> Vec<(String, String)> {
    CHAIN.try_with(Clone::clone).unwrap_or_default()
}

/// Whether the current operation is already resolving `uri`
pub(crate) fn in_chain(uri: &str) -> bool {
    CHAIN
        .try_with(|chain| chain.iter().any(|(_, entered)| entered == uri))
        .unwrap_or(false)
}

/// Run `fut` with `(requester, uri)` appended to the current chain
///
/// The chain is captured when this is called, so the returned future can be
/// moved to another task.
pub(crate) fn scoped<F: Future>(
    requester: &str,
    uri: &str,
    fut: F,
) -> impl Future<Output = F::Output> + use<F> {
    let mut chain = current_chain();
    chain.push((requester.to_string(), uri.to_string()));
    CHAIN.scope(chain, fut)
}

/// Carry the current chain into a future that will run elsewhere
pub(crate) fn inherit<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    CHAIN.scope(current_chain(), fut)
}

/// Process-wide record of in-progress handshakes, keyed by local username
#[derive(Default)]
pub(crate) struct Handshakes {
    pairs: Arc<Mutex<HashMap<String, Vec<Url>>>>,
}

/// Removes its pair from [`Handshakes`] when dropped
pub(crate) struct HandshakeGuard {
    pairs: Arc<Mutex<HashMap<String, Vec<Url>>>>,
    username: String,
    uri: Url,
}

impl Handshakes {
    pub(crate) fn is_handshaking(&self, username: &str, uri: &Url) -> bool {
        self.pairs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .is_some_and(|uris| uris.contains(uri))
    }

    pub(crate) fn start(&self, username: &str, uri: &Url) -> HandshakeGuard {
        self.pairs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(username.to_string())
            .or_default()
            .push(uri.clone());

        HandshakeGuard {
            pairs: self.pairs.clone(),
            username: username.to_string(),
            uri: uri.clone(),
        }
    }
}

impl Drop for HandshakeGuard {
    fn drop(&mut self) {
        let mut pairs = self.pairs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(uris) = pairs.get_mut(&self.username) {
            if let Some(position) = uris.iter().position(|uri| *uri == self.uri) {
                uris.swap_remove(position);
            }
            if uris.is_empty() {
                pairs.remove(&self.username);
            }
        }
    }
}

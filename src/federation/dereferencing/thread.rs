//! Reply chain ascension
//!
//! The walk is an explicit loop over parents with a visited set and a
//! depth limit. Each resolved parent is linked to its child only after
//! checking that the link would not close a loop in stored data.

use std::collections::HashSet;

use super::Dereferencer;
use crate::data::Status;
use crate::error::{AppError, ErrorKind};
use crate::federation::objects::parse_iri;

/// Why a thread walk stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStop {
    /// The topmost status has no parent
    ReachedRoot,
    /// Reached a stored status whose own ancestry is already linked
    KnownAncestor,
    /// Gave up after the configured number of ancestors
    MaxDepth,
    /// The chain loops back on itself
    Cycle,
    /// An ancestor could not be resolved; earlier ones are kept
    Failed(ErrorKind),
}

/// Outcome of a thread walk
#[derive(Debug, Clone)]
pub struct ThreadResolution {
    /// Ancestors linked by this walk, nearest first
    pub ancestors: Vec<Status>,
    pub stop: ThreadStop,
}

impl Dereferencer {
    /// Walk and link the reply chain above `status`
    ///
    /// Never fails as a whole: a failing ancestor ends the walk with
    /// [`ThreadStop::Failed`] and keeps whatever was linked so far.
    pub async fn resolve_thread(&self, requester: &str, status: &Status) -> ThreadResolution {
        let max_depth = self.inner.federation.max_thread_depth;
        let mut visited = HashSet::from([status.uri.clone()]);
        let mut ancestors = Vec::new();
        let mut current = status.clone();

        let stop = loop {
            let Some(parent_uri) = current.in_reply_to_uri.clone() else {
                break ThreadStop::ReachedRoot;
            };
            if ancestors.len() >= max_depth {
                break ThreadStop::MaxDepth;
            }
            if !visited.insert(parent_uri.clone()) {
                break ThreadStop::Cycle;
            }

            let (parent, known_before) = match self.parent_of(requester, &parent_uri).await {
                Ok(found) => found,
                Err(error) => {
                    tracing::warn!(%error, parent = %parent_uri, child = %current.uri, "Thread walk stopped");
                    break ThreadStop::Failed(error.kind());
                }
            };
            if parent.uri != parent_uri && !visited.insert(parent.uri.clone()) {
                break ThreadStop::Cycle;
            }

            match self.reaches(&parent, &current.id).await {
                Ok(false) => {}
                Ok(true) => {
                    tracing::warn!(parent = %parent.uri, child = %current.uri, "Reply chain loops, not linking");
                    break ThreadStop::Cycle;
                }
                Err(error) => break ThreadStop::Failed(error.kind()),
            }

            if current.in_reply_to_id.as_deref() != Some(parent.id.as_str()) {
                if let Err(error) = self
                    .inner
                    .db
                    .set_status_parent(&current.id, &parent.id, &parent.account_id)
                    .await
                {
                    break ThreadStop::Failed(error.kind());
                }
            }
            tracing::debug!(child = %current.uri, parent = %parent.uri, "Linked reply to parent");
            ancestors.push(parent.clone());

            if !parent.is_reply() {
                break ThreadStop::ReachedRoot;
            }
            if known_before && parent.in_reply_to_id.is_some() {
                break ThreadStop::KnownAncestor;
            }
            current = parent;
        };

        tracing::debug!(uri = %status.uri, ancestors = ancestors.len(), ?stop, "Thread walk finished");
        ThreadResolution { ancestors, stop }
    }

    /// The parent status, and whether it was stored before this walk
    async fn parent_of(&self, requester: &str, parent_uri: &str) -> Result<(Status, bool), AppError> {
        if let Some(parent) = self.inner.db.get_status_by_uri(parent_uri).await? {
            return Ok((parent, true));
        }
        let url = parse_iri(parent_uri)?;
        let parent = self
            .resolve_status_inner(requester, &url, false, None)
            .await?;
        Ok((parent, false))
    }

    /// Whether following stored parent links from `from` reaches `target_id`
    async fn reaches(&self, from: &Status, target_id: &str) -> Result<bool, AppError> {
        let mut seen = HashSet::new();
        let mut next = Some(from.id.clone());

        while let Some(id) = next {
            if id == target_id {
                return Ok(true);
            }
            // A loop already stored above us cannot pass through the target
            if !seen.insert(id.clone()) {
                return Ok(false);
            }
            next = match self.inner.db.get_status_by_id(&id).await? {
                Some(status) => status.in_reply_to_id,
                None => None,
            };
        }
        Ok(false)
    }
}

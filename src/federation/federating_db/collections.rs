//! Followers and Following collections of local actors

use serde_json::{Value, json};
use url::Url;

use super::FederatingDb;
use crate::error::AppError;
use crate::federation::objects::ACTIVITYSTREAMS_CONTEXT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Edge {
    Followers,
    Following,
}

impl Edge {
    fn path(self) -> &'static str {
        match self {
            Edge::Followers => "followers",
            Edge::Following => "following",
        }
    }
}

impl FederatingDb {
    /// Build the ordered collection of peer IRIs for one side of the
    /// follow graph of a local actor, oldest edge first
    ///
    /// # Errors
    /// - `AppError::Validation` if `actor` is not a local actor IRI
    /// - `AppError::NotFound` if the local account does not exist
    pub(super) async fn collection(&self, actor: &Url, edge: Edge) -> Result<Value, AppError> {
        let account = self.local_account(actor).await?;

        let follows = match edge {
            Edge::Followers => self.db.get_account_followers(&account.id).await?,
            Edge::Following => self.db.get_account_follows(&account.id).await?,
        };

        let mut items = Vec::with_capacity(follows.len());
        for follow in &follows {
            let peer_id = match edge {
                Edge::Followers => &follow.account_id,
                Edge::Following => &follow.target_account_id,
            };
            match self.db.get_account_by_id(peer_id).await? {
                Some(peer) => items.push(peer.uri),
                None => {
                    tracing::warn!(follow = %follow.uri, peer = %peer_id, "Follow edge without account");
                }
            }
        }

        let id = match edge {
            Edge::Followers => account.followers_uri.clone(),
            Edge::Following => account.following_uri.clone(),
        }
        .unwrap_or_else(|| format!("{}/{}", account.uri, edge.path()));

        Ok(json!({
            "@context": ACTIVITYSTREAMS_CONTEXT,
            "type": "OrderedCollection",
            "id": id,
            "totalItems": items.len(),
            "orderedItems": items
        }))
    }
}

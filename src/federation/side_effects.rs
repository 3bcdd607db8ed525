//! Async side-effect channel
//!
//! Federation-triggered mutations are handed to downstream processing
//! (timelines, notifications, delivery) through a single ordered channel.
//! Events are only published after the mutation they describe committed.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use url::Url;

use crate::data::{Account, Block, EntityId, Fave, Follow, FollowRequest, Status};
use crate::error::AppError;
use crate::federation::objects::{ACTIVITYSTREAMS_CONTEXT, ActivityType, ObjectType};
use crate::federation::transport::Transport;
use crate::metrics::SIDE_EFFECTS_PUBLISHED;

/// The domain model affected by a federated activity
#[derive(Debug, Clone, PartialEq)]
pub enum FederatedModel {
    Account(Account),
    Status(Status),
    Follow(Follow),
    FollowRequest(FollowRequest),
    Fave(Fave),
    Block(Block),
}

/// One committed federation event
#[derive(Debug, Clone)]
pub struct FromFederator {
    pub activity_type: ActivityType,
    pub object_type: ObjectType,
    pub model: FederatedModel,
    /// Remote account the activity came from
    pub origin_account: Option<Account>,
    /// Local account the activity was addressed to
    pub target_account: Option<Account>,
}

pub type SideEffectReceiver = mpsc::UnboundedReceiver<FromFederator>;

/// Publishing half of the channel, cheap to clone
#[derive(Debug, Clone)]
pub struct SideEffectSender {
    tx: mpsc::UnboundedSender<FromFederator>,
}

/// Create a connected sender/receiver pair
pub fn channel() -> (SideEffectSender, SideEffectReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SideEffectSender { tx }, rx)
}

impl SideEffectSender {
    /// Hand an event downstream
    ///
    /// # Errors
    /// `AppError::Internal` if the receiving side is gone; the event is
    /// never dropped silently.
    pub fn publish(&self, event: FromFederator) -> Result<(), AppError> {
        let activity_type = event.activity_type.as_str();
        let object_type = event.object_type.as_str();

        self.tx.send(event).map_err(|_| {
            tracing::error!(activity_type, object_type, "Side effect channel closed");
            AppError::Internal(anyhow::anyhow!("side effect channel closed"))
        })?;

        SIDE_EFFECTS_PUBLISHED
            .with_label_values(&[activity_type, object_type])
            .inc();
        tracing::debug!(activity_type, object_type, "Published side effect");
        Ok(())
    }
}

/// Drain the channel until every sender is gone
///
/// Follows of unlocked local accounts are answered with an Accept
/// delivered to the follower. Every other event is only logged; timelines
/// and notifications live outside this crate.
pub async fn process_side_effects(mut receiver: SideEffectReceiver, transport: Arc<dyn Transport>) {
    while let Some(event) = receiver.recv().await {
        tracing::info!(
            activity_type = event.activity_type.as_str(),
            object_type = event.object_type.as_str(),
            origin = event.origin_account.as_ref().map(|a| a.uri.as_str()),
            target = event.target_account.as_ref().map(|a| a.uri.as_str()),
            "Federation side effect"
        );

        if let Err(error) = handle_side_effect(&event, transport.as_ref()).await {
            tracing::warn!(%error, activity_type = event.activity_type.as_str(), "Side effect processing failed");
        }
    }
    tracing::info!("Side effect channel closed");
}

async fn handle_side_effect(event: &FromFederator, transport: &dyn Transport) -> Result<(), AppError> {
    let (ActivityType::Create, FederatedModel::Follow(follow)) = (event.activity_type, &event.model)
    else {
        return Ok(());
    };
    let (Some(follower), Some(followee)) = (&event.origin_account, &event.target_account) else {
        return Ok(());
    };

    let inbox = follower
        .inbox_uri
        .as_deref()
        .or(follower.shared_inbox_uri.as_deref())
        .ok_or_else(|| AppError::Validation(format!("{} has no inbox", follower.uri)))?;
    let inbox = Url::parse(inbox).map_err(|e| AppError::Validation(format!("Invalid inbox: {e}")))?;

    transport
        .deliver(&followee.username, &inbox, &accept_follow(followee, follower, follow))
        .await?;
    tracing::info!(follower = %follower.uri, followee = %followee.uri, "Accepted follow");
    Ok(())
}

/// Accept activity answering an inbound Follow
fn accept_follow(followee: &Account, follower: &Account, follow: &Follow) -> Value {
    json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "id": format!("{}#accepts/follows/{}", followee.uri, EntityId::new().0),
        "type": "Accept",
        "actor": followee.uri,
        "object": {
            "id": follow.uri,
            "type": "Follow",
            "actor": follower.uri,
            "object": followee.uri
        }
    })
}

//! Inbound activity handlers
//!
//! Each handler validates the activity against the verified deliverer,
//! applies one domain mutation, and publishes a side effect only once
//! that mutation has been committed. Redelivered activities and
//! uniqueness conflicts are treated as already applied.

use chrono::Utc;
use serde_json::Value;
use sqlx::types::Json;
use url::Url;

use super::{FederatingDb, InboundContext};
use crate::data::{Account, Block, EntityId, Fave, Follow, FollowRequest, Status};
use crate::error::AppError;
use crate::federation::domain_block::punify;
use crate::federation::objects::{
    ActivityType, ActorObject, ObjectType, extract_visibility, id_of, iri_of, is_actor_type,
    parse_iri, parse_poll, type_of,
};
use crate::federation::side_effects::FederatedModel;
use crate::metrics::ACTIVITIES_RECEIVED;

impl FederatingDb {
    /// Route one inbound activity to its handler
    ///
    /// Activity types this node does not understand are accepted and
    /// ignored.
    ///
    /// # Errors
    /// - `AppError::Validation` if the activity has no type, actor or object
    /// - `AppError::Forbidden` if the actor is not the verified deliverer,
    ///   or acts on something it does not own
    /// - `AppError::Blocked` if the deliverer's domain is blocked
    pub async fn process(&self, ctx: &InboundContext, activity: &Value) -> Result<(), AppError> {
        let type_name = type_of(activity)
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?;
        let activity_type = ActivityType::parse(type_name);
        ACTIVITIES_RECEIVED
            .with_label_values(&[activity_type.map_or("Other", |t| t.as_str())])
            .inc();

        let Some(activity_type) = activity_type else {
            tracing::debug!(activity_type = type_name, "Ignoring unsupported activity");
            return Ok(());
        };

        let requester_uri = parse_iri(&ctx.requester.uri)?;
        self.blocks.ensure_uri_allowed(&requester_uri).await?;

        // A Question is its own object and carries no actor
        if activity_type == ActivityType::Question {
            return self.question(ctx, activity).await;
        }
        ensure_actor(ctx, activity)?;

        tracing::debug!(
            activity_type = activity_type.as_str(),
            actor = %ctx.requester.uri,
            "Processing inbound activity"
        );

        match activity_type {
            ActivityType::Create => self.create_object(ctx, object_of(activity)?).await,
            ActivityType::Follow | ActivityType::Like | ActivityType::Block => {
                self.create_object(ctx, activity).await
            }
            ActivityType::Update => self.update_object(ctx, object_of(activity)?).await,
            ActivityType::Delete => self.delete_object(ctx, activity).await,
            ActivityType::Undo => self.undo(ctx, activity).await,
            ActivityType::Accept => self.accept(ctx, activity).await,
            ActivityType::Reject => self.reject(ctx, activity).await,
            ActivityType::Announce => self.announce(ctx, activity).await,
            ActivityType::Question => self.question(ctx, activity).await,
        }
    }

    // =========================================================================
    // Create
    // =========================================================================

    pub(super) async fn create_object(
        &self,
        ctx: &InboundContext,
        object: &Value,
    ) -> Result<(), AppError> {
        if object.is_string() {
            return self.create_status(ctx, object).await;
        }

        match type_of(object) {
            Some(kind) if ObjectType::status_type(kind).is_some() => {
                self.create_status(ctx, object).await
            }
            Some("Follow") => self.create_follow(ctx, object).await,
            Some("Like") => self.create_fave(ctx, object).await,
            Some("Block") => self.create_block(ctx, object).await,
            other => {
                tracing::debug!(object_type = ?other, "Ignoring create of unsupported object");
                Ok(())
            }
        }
    }

    async fn create_status(&self, ctx: &InboundContext, object: &Value) -> Result<(), AppError> {
        let uri = iri_of(object)?;
        if self.db.get_status_by_uri(uri.as_str()).await?.is_some() {
            tracing::debug!(uri = %uri, "Status already known, ignoring create");
            return Ok(());
        }

        // Forwarded objects are only trusted when fetched from their origin
        let embedded_by_author = object
            .get("attributedTo")
            .and_then(id_of)
            .is_some_and(|author| author == ctx.requester.uri);

        let (status, thread) = if embedded_by_author {
            self.dereferencer
                .resolve_status_with_object(ctx.fetch_as(), object.clone(), true)
                .await?
        } else {
            self.dereferencer
                .resolve_status(ctx.fetch_as(), &uri, true, true)
                .await?
        };

        if let Some(thread) = thread {
            tracing::debug!(uri = %status.uri, stop = ?thread.stop, "Resolved thread of new status");
        }

        let object_type = type_of(object)
            .and_then(ObjectType::status_type)
            .unwrap_or(ObjectType::Note);
        self.publish(
            ctx,
            ActivityType::Create,
            object_type,
            FederatedModel::Status(status),
            None,
        )
    }

    async fn create_follow(&self, ctx: &InboundContext, follow: &Value) -> Result<(), AppError> {
        let uri = id_of(follow)
            .ok_or_else(|| AppError::Validation("Follow without id".to_string()))?;
        ensure_same_origin(ctx, uri)?;
        let target = self.local_account(&iri_of(object_of(follow)?)?).await?;
        let requester = &ctx.requester;

        if self.db.is_blocked(&target.id, &requester.id).await? {
            tracing::info!(follower = %requester.uri, target = %target.uri, "Ignoring follow across a block");
            return Ok(());
        }
        if self.db.get_follow(&requester.id, &target.id).await?.is_some()
            || self
                .db
                .get_follow_request(&requester.id, &target.id)
                .await?
                .is_some()
        {
            tracing::debug!(follower = %requester.uri, target = %target.uri, "Follow already recorded");
            return Ok(());
        }

        let model = if target.locked {
            let request = FollowRequest {
                id: EntityId::new().0,
                uri: uri.to_string(),
                account_id: requester.id.clone(),
                target_account_id: target.id.clone(),
                created_at: Utc::now(),
            };
            if !applied(self.db.insert_follow_request(&request).await)? {
                return Ok(());
            }
            FederatedModel::FollowRequest(request)
        } else {
            let follow = Follow {
                id: EntityId::new().0,
                uri: uri.to_string(),
                account_id: requester.id.clone(),
                target_account_id: target.id.clone(),
                created_at: Utc::now(),
            };
            if !applied(self.db.insert_follow(&follow).await)? {
                return Ok(());
            }
            FederatedModel::Follow(follow)
        };

        tracing::info!(follower = %requester.uri, target = %target.uri, locked = target.locked, "Recorded inbound follow");
        self.publish(
            ctx,
            ActivityType::Create,
            ObjectType::Follow,
            model,
            Some(target),
        )
    }

    async fn create_fave(&self, ctx: &InboundContext, like: &Value) -> Result<(), AppError> {
        let uri = id_of(like).ok_or_else(|| AppError::Validation("Like without id".to_string()))?;
        ensure_same_origin(ctx, uri)?;
        let target = iri_of(object_of(like)?)?;

        let Some(status) = self.db.get_status_by_uri(target.as_str()).await? else {
            tracing::debug!(status = %target, "Like of unknown status, ignoring");
            return Ok(());
        };
        if !status.is_local {
            tracing::debug!(status = %target, "Like of remote status, ignoring");
            return Ok(());
        }
        if self.db.get_fave_by_uri(uri).await?.is_some() {
            return Ok(());
        }

        let fave = Fave {
            id: EntityId::new().0,
            uri: uri.to_string(),
            account_id: ctx.requester.id.clone(),
            status_id: status.id.clone(),
            created_at: Utc::now(),
        };
        if !applied(self.db.insert_fave(&fave).await)? {
            return Ok(());
        }

        let author = self.db.get_account_by_id(&status.account_id).await?;
        self.publish(
            ctx,
            ActivityType::Create,
            ObjectType::Like,
            FederatedModel::Fave(fave),
            author,
        )
    }

    async fn create_block(&self, ctx: &InboundContext, block: &Value) -> Result<(), AppError> {
        let uri = id_of(block).ok_or_else(|| AppError::Validation("Block without id".to_string()))?;
        ensure_same_origin(ctx, uri)?;
        let target = self.local_account(&iri_of(object_of(block)?)?).await?;

        if self.db.get_block_by_uri(uri).await?.is_some() {
            return Ok(());
        }

        let block = Block {
            id: EntityId::new().0,
            uri: uri.to_string(),
            account_id: ctx.requester.id.clone(),
            target_account_id: target.id.clone(),
            created_at: Utc::now(),
        };
        if !applied(self.db.insert_block(&block).await)? {
            return Ok(());
        }

        tracing::info!(blocker = %ctx.requester.uri, target = %target.uri, "Recorded inbound block");
        self.publish(
            ctx,
            ActivityType::Create,
            ObjectType::Block,
            FederatedModel::Block(block),
            Some(target),
        )
    }

    // =========================================================================
    // Update
    // =========================================================================

    pub(super) async fn update_object(
        &self,
        ctx: &InboundContext,
        object: &Value,
    ) -> Result<(), AppError> {
        if let Value::String(raw) = object {
            if *raw == ctx.requester.uri {
                return self.update_actor(ctx, None).await;
            }
            return self.update_status(ctx, object).await;
        }

        match type_of(object) {
            Some(kind) if is_actor_type(kind) => {
                let actor = ActorObject::parse(object)?;
                self.update_actor(ctx, Some(actor)).await
            }
            Some("Question") => self.question(ctx, object).await,
            Some(kind) if ObjectType::status_type(kind).is_some() => {
                self.update_status(ctx, object).await
            }
            other => {
                tracing::debug!(object_type = ?other, "Ignoring update of unsupported object");
                Ok(())
            }
        }
    }

    async fn update_actor(
        &self,
        ctx: &InboundContext,
        actor: Option<ActorObject>,
    ) -> Result<(), AppError> {
        if let Some(actor) = &actor {
            if actor.id.as_str() != ctx.requester.uri {
                return Err(AppError::Forbidden);
            }
        }

        let refreshed = self
            .dereferencer
            .refresh_account(ctx.fetch_as(), actor.as_ref(), &ctx.requester)
            .await?;
        if !self.db.update_account(&refreshed).await? {
            return Err(AppError::NotFound);
        }

        tracing::info!(actor = %refreshed.uri, "Applied profile update");
        self.publish(
            ctx,
            ActivityType::Update,
            ObjectType::Profile,
            FederatedModel::Account(refreshed),
            None,
        )
    }

    async fn update_status(&self, ctx: &InboundContext, object: &Value) -> Result<(), AppError> {
        let uri = iri_of(object)?;
        let Some(existing) = self.db.get_status_by_uri(uri.as_str()).await? else {
            tracing::debug!(uri = %uri, "Update of unknown status, ignoring");
            return Ok(());
        };
        if existing.account_id != ctx.requester.id {
            return Err(AppError::Forbidden);
        }

        let (status, _) = match object.get("attributedTo").and_then(id_of) {
            Some(author) if author != ctx.requester.uri => return Err(AppError::Forbidden),
            Some(_) => {
                self.dereferencer
                    .resolve_status_with_object(ctx.fetch_as(), object.clone(), false)
                    .await?
            }
            None => {
                self.dereferencer
                    .resolve_status(ctx.fetch_as(), &uri, true, false)
                    .await?
            }
        };

        let object_type = type_of(object)
            .and_then(ObjectType::status_type)
            .unwrap_or(ObjectType::Note);
        self.publish(
            ctx,
            ActivityType::Update,
            object_type,
            FederatedModel::Status(status),
            None,
        )
    }

    // =========================================================================
    // Delete
    // =========================================================================

    pub(super) async fn delete_object(
        &self,
        ctx: &InboundContext,
        activity: &Value,
    ) -> Result<(), AppError> {
        let target = id_of(object_of(activity)?)
            .ok_or_else(|| AppError::Validation("Delete without target".to_string()))?;

        // Removing the account itself is left to downstream processing
        if target == ctx.requester.uri {
            tracing::info!(actor = %target, "Remote actor deleted itself");
            return self.publish(
                ctx,
                ActivityType::Delete,
                ObjectType::Profile,
                FederatedModel::Account(ctx.requester.clone()),
                None,
            );
        }

        let Some(status) = self.db.get_status_by_uri(target).await? else {
            tracing::debug!(uri = %target, "Delete of unknown object, ignoring");
            return Ok(());
        };
        if status.account_id != ctx.requester.id {
            return Err(AppError::Forbidden);
        }
        if !self.db.delete_status(&status.id).await? {
            return Ok(());
        }

        tracing::info!(uri = %status.uri, "Deleted remote status");
        self.publish(
            ctx,
            ActivityType::Delete,
            ObjectType::Note,
            FederatedModel::Status(status),
            None,
        )
    }

    // =========================================================================
    // Undo
    // =========================================================================

    /// Revert an earlier Follow, Like, Block or Announce by the requester
    pub async fn undo(&self, ctx: &InboundContext, activity: &Value) -> Result<(), AppError> {
        let object = object_of(activity)?;
        let uri = id_of(object)
            .ok_or_else(|| AppError::Validation("Undo without object id".to_string()))?;

        let handled = match type_of(object) {
            Some("Follow") => self.undo_follow(ctx, uri, Some(object)).await?,
            Some("Like") => self.undo_fave(ctx, uri).await?,
            Some("Block") => self.undo_block(ctx, uri).await?,
            Some("Announce") => self.undo_announce(ctx, uri).await?,
            Some(other) => {
                tracing::debug!(object_type = other, "Ignoring undo of unsupported object");
                return Ok(());
            }
            None => {
                self.undo_follow(ctx, uri, None).await?
                    || self.undo_fave(ctx, uri).await?
                    || self.undo_block(ctx, uri).await?
                    || self.undo_announce(ctx, uri).await?
            }
        };

        if !handled {
            tracing::debug!(uri, "Nothing to undo");
        }
        Ok(())
    }

    async fn undo_follow(
        &self,
        ctx: &InboundContext,
        uri: &str,
        object: Option<&Value>,
    ) -> Result<bool, AppError> {
        let requester = &ctx.requester;

        let mut follow = self.db.get_follow_by_uri(uri).await?;
        let mut request = self.db.get_follow_request_by_uri(uri).await?;

        // Some servers mint a new id when undoing; fall back to the pair
        if follow.is_none() && request.is_none() {
            let target = match object.and_then(|follow| follow.get("object")).map(iri_of) {
                Some(Ok(target)) => self.local_account(&target).await.ok(),
                _ => None,
            };
            if let Some(target) = target {
                follow = self.db.get_follow(&requester.id, &target.id).await?;
                request = self.db.get_follow_request(&requester.id, &target.id).await?;
            }
        }

        if let Some(follow) = follow {
            if follow.account_id != requester.id {
                return Err(AppError::Forbidden);
            }
            if self.db.delete_follow_by_uri(&follow.uri).await? {
                let target = self.db.get_account_by_id(&follow.target_account_id).await?;
                tracing::info!(follower = %requester.uri, follow = %follow.uri, "Follow undone");
                self.publish(
                    ctx,
                    ActivityType::Undo,
                    ObjectType::Follow,
                    FederatedModel::Follow(follow),
                    target,
                )?;
            }
            return Ok(true);
        }

        if let Some(request) = request {
            if request.account_id != requester.id {
                return Err(AppError::Forbidden);
            }
            if self.db.delete_follow_request_by_uri(&request.uri).await? {
                let target = self.db.get_account_by_id(&request.target_account_id).await?;
                self.publish(
                    ctx,
                    ActivityType::Undo,
                    ObjectType::Follow,
                    FederatedModel::FollowRequest(request),
                    target,
                )?;
            }
            return Ok(true);
        }

        Ok(false)
    }

    async fn undo_fave(&self, ctx: &InboundContext, uri: &str) -> Result<bool, AppError> {
        let Some(fave) = self.db.get_fave_by_uri(uri).await? else {
            return Ok(false);
        };
        if fave.account_id != ctx.requester.id {
            return Err(AppError::Forbidden);
        }
        if self.db.delete_fave_by_uri(uri).await? {
            self.publish(
                ctx,
                ActivityType::Undo,
                ObjectType::Like,
                FederatedModel::Fave(fave),
                None,
            )?;
        }
        Ok(true)
    }

    async fn undo_block(&self, ctx: &InboundContext, uri: &str) -> Result<bool, AppError> {
        let Some(block) = self.db.get_block_by_uri(uri).await? else {
            return Ok(false);
        };
        if block.account_id != ctx.requester.id {
            return Err(AppError::Forbidden);
        }
        if self.db.delete_block_by_uri(uri).await? {
            let target = self.db.get_account_by_id(&block.target_account_id).await?;
            self.publish(
                ctx,
                ActivityType::Undo,
                ObjectType::Block,
                FederatedModel::Block(block),
                target,
            )?;
        }
        Ok(true)
    }

    async fn undo_announce(&self, ctx: &InboundContext, uri: &str) -> Result<bool, AppError> {
        let Some(boost) = self.db.get_status_by_uri(uri).await? else {
            return Ok(false);
        };
        if !boost.is_boost() {
            return Ok(false);
        }
        if boost.account_id != ctx.requester.id {
            return Err(AppError::Forbidden);
        }
        if self.db.delete_status(&boost.id).await? {
            self.publish(
                ctx,
                ActivityType::Undo,
                ObjectType::Announce,
                FederatedModel::Status(boost),
                None,
            )?;
        }
        Ok(true)
    }

    // =========================================================================
    // Accept / Reject
    // =========================================================================

    /// The requester accepted a follow request sent by a local account
    pub async fn accept(&self, ctx: &InboundContext, activity: &Value) -> Result<(), AppError> {
        let object = object_of(activity)?;
        let Some(request) = self.outgoing_request(ctx, object).await? else {
            tracing::debug!(actor = %ctx.requester.uri, "Accept of unknown follow request, ignoring");
            return Ok(());
        };

        let Some(follow) = self.db.accept_follow_request(&request.uri).await? else {
            return Ok(());
        };
        let follower = self.db.get_account_by_id(&follow.account_id).await?;

        tracing::info!(followee = %ctx.requester.uri, follow = %follow.uri, "Follow request accepted");
        self.publish(
            ctx,
            ActivityType::Accept,
            ObjectType::Follow,
            FederatedModel::Follow(follow),
            follower,
        )
    }

    /// The requester rejected a follow request, or removed an established
    /// follower
    pub async fn reject(&self, ctx: &InboundContext, activity: &Value) -> Result<(), AppError> {
        let object = object_of(activity)?;

        if let Some(request) = self.outgoing_request(ctx, object).await? {
            if self.db.delete_follow_request_by_uri(&request.uri).await? {
                let follower = self.db.get_account_by_id(&request.account_id).await?;
                tracing::info!(followee = %ctx.requester.uri, follow = %request.uri, "Follow request rejected");
                self.publish(
                    ctx,
                    ActivityType::Reject,
                    ObjectType::Follow,
                    FederatedModel::FollowRequest(request),
                    follower,
                )?;
            }
            return Ok(());
        }

        let Some(uri) = id_of(object) else {
            return Ok(());
        };
        let Some(follow) = self.db.get_follow_by_uri(uri).await? else {
            tracing::debug!(actor = %ctx.requester.uri, "Reject of unknown follow, ignoring");
            return Ok(());
        };
        if follow.target_account_id != ctx.requester.id {
            return Err(AppError::Forbidden);
        }
        if self.db.delete_follow_by_uri(uri).await? {
            let follower = self.db.get_account_by_id(&follow.account_id).await?;
            self.publish(
                ctx,
                ActivityType::Reject,
                ObjectType::Follow,
                FederatedModel::Follow(follow),
                follower,
            )?;
        }
        Ok(())
    }

    /// Pending request from a local account to the requester named by an
    /// Accept or Reject object
    async fn outgoing_request(
        &self,
        ctx: &InboundContext,
        object: &Value,
    ) -> Result<Option<FollowRequest>, AppError> {
        let mut request = match id_of(object) {
            Some(uri) => self.db.get_follow_request_by_uri(uri).await?,
            None => None,
        };

        if request.is_none() && type_of(object) == Some("Follow") {
            let follower = match object.get("actor").map(iri_of) {
                Some(Ok(actor)) => self.local_account(&actor).await.ok(),
                _ => None,
            };
            if let Some(follower) = follower {
                request = self
                    .db
                    .get_follow_request(&follower.id, &ctx.requester.id)
                    .await?;
            }
        }

        match request {
            Some(request) if request.target_account_id != ctx.requester.id => {
                Err(AppError::Forbidden)
            }
            other => Ok(other),
        }
    }

    // =========================================================================
    // Announce
    // =========================================================================

    /// Record a boost by the requester
    pub async fn announce(&self, ctx: &InboundContext, activity: &Value) -> Result<(), AppError> {
        let uri = iri_of(activity)?;
        ensure_same_origin(ctx, uri.as_str())?;
        let boosted = iri_of(object_of(activity)?)?;
        let requester = &ctx.requester;

        if let Some(existing) = self.db.get_status_by_uri(uri.as_str()).await? {
            if existing.account_id != requester.id {
                return Err(AppError::Forbidden);
            }
            if existing.boost_of_id.is_none() && existing.boost_of_uri.is_some() {
                let linked = self
                    .dereferencer
                    .resolve_announce(ctx.fetch_as(), &existing)
                    .await?;
                if let (Some(boost_of_id), Some(boost_of_account_id)) =
                    (&linked.boost_of_id, &linked.boost_of_account_id)
                {
                    self.db
                        .set_status_boost(&existing.id, boost_of_id, boost_of_account_id)
                        .await?;
                }
            }
            return Ok(());
        }

        let boost = boost_status(requester, &uri, &boosted, activity);
        let boost = self
            .dereferencer
            .resolve_announce(ctx.fetch_as(), &boost)
            .await?;

        if let Some(boost_of_id) = &boost.boost_of_id {
            if self.db.get_boost(&requester.id, boost_of_id).await?.is_some() {
                tracing::debug!(booster = %requester.uri, boosted = %boosted, "Boost already recorded");
                return Ok(());
            }
        }
        if !applied(self.db.insert_status(&boost).await)? {
            return Ok(());
        }

        let boosted_author = match &boost.boost_of_account_id {
            Some(id) => self.db.get_account_by_id(id).await?,
            None => None,
        };
        tracing::info!(booster = %requester.uri, boosted = %boosted, "Recorded boost");
        self.publish(
            ctx,
            ActivityType::Announce,
            ObjectType::Note,
            FederatedModel::Status(boost),
            boosted_author,
        )
    }

    // =========================================================================
    // Question
    // =========================================================================

    /// Apply new poll tallies from a Question object
    ///
    /// An unknown poll is resolved and stored with its options.
    pub async fn question(&self, ctx: &InboundContext, question: &Value) -> Result<(), AppError> {
        let uri = iri_of(question)?;
        if let Some(author) = question.get("attributedTo").and_then(id_of) {
            if author != ctx.requester.uri {
                return Err(AppError::Forbidden);
            }
        }

        let Some(status) = self.db.get_status_by_uri(uri.as_str()).await? else {
            let (status, _) = self
                .dereferencer
                .resolve_status_with_object(ctx.fetch_as(), question.clone(), true)
                .await?;
            return self.publish(
                ctx,
                ActivityType::Create,
                ObjectType::Question,
                FederatedModel::Status(status),
                None,
            );
        };
        if status.account_id != ctx.requester.id {
            return Err(AppError::Forbidden);
        }

        let poll = parse_poll(question);
        let updated = self
            .db
            .update_poll_tallies(&status.id, &poll.options, poll.voters_count, poll.closed_at)
            .await?;
        let status = if updated {
            status
        } else {
            // Known status that has no poll yet
            self.dereferencer
                .resolve_status_with_object(ctx.fetch_as(), question.clone(), false)
                .await?
                .0
        };

        tracing::debug!(uri = %uri, options = poll.options.len(), "Updated poll tallies");
        self.publish(
            ctx,
            ActivityType::Update,
            ObjectType::Question,
            FederatedModel::Status(status),
            None,
        )
    }
}

/// `object` of an activity
fn object_of(activity: &Value) -> Result<&Value, AppError> {
    activity
        .get("object")
        .filter(|object| !object.is_null())
        .ok_or_else(|| AppError::Validation("Missing object".to_string()))
}

/// The activity's actor must be the account that signed the delivery
fn ensure_actor(ctx: &InboundContext, activity: &Value) -> Result<(), AppError> {
    let actor = activity
        .get("actor")
        .and_then(id_of)
        .ok_or_else(|| AppError::Validation("Missing actor".to_string()))?;
    if actor != ctx.requester.uri {
        tracing::warn!(actor, deliverer = %ctx.requester.uri, "Activity actor does not match deliverer");
        return Err(AppError::Forbidden);
    }
    Ok(())
}

/// Activities a peer creates must carry an id on the peer's own host
fn ensure_same_origin(ctx: &InboundContext, id: &str) -> Result<(), AppError> {
    let host = |raw: &str| -> Result<String, AppError> {
        let url = parse_iri(raw)?;
        let host = url
            .host_str()
            .ok_or_else(|| AppError::Validation(format!("IRI without host: {url}")))?;
        punify(host)
    };
    if host(id)? != host(&ctx.requester.uri)? {
        tracing::warn!(id, deliverer = %ctx.requester.uri, "Activity id is not on the deliverer's host");
        return Err(AppError::Forbidden);
    }
    Ok(())
}

/// Whether an insert took effect; a uniqueness conflict means it was
/// already applied
fn applied(result: Result<(), AppError>) -> Result<bool, AppError> {
    match result {
        Ok(()) => Ok(true),
        Err(AppError::Conflict(message)) => {
            tracing::debug!(%message, "Already applied");
            Ok(false)
        }
        Err(error) => Err(error),
    }
}

/// Unstored boost status for an Announce, pointing at the boosted IRI
fn boost_status(requester: &Account, uri: &Url, boosted: &Url, activity: &Value) -> Status {
    let now = Utc::now();
    let published = activity
        .get("published")
        .and_then(Value::as_str)
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
        .map_or(now, |published| published.with_timezone(&Utc));

    Status {
        id: EntityId::new().0,
        uri: uri.to_string(),
        url: Some(uri.to_string()),
        content: String::new(),
        content_warning: None,
        sensitive: false,
        visibility: extract_visibility(activity, requester.followers_uri.as_deref())
            .as_str()
            .to_string(),
        language: None,
        account_id: requester.id.clone(),
        account_uri: requester.uri.clone(),
        is_local: false,
        in_reply_to_id: None,
        in_reply_to_uri: None,
        in_reply_to_account_id: None,
        boost_of_id: None,
        boost_of_uri: Some(boosted.to_string()),
        boost_of_account_id: None,
        attachment_ids: Json(Vec::new()),
        emoji_ids: Json(Vec::new()),
        created_at: published,
        updated_at: now,
        fetched_at: Some(now),
    }
}

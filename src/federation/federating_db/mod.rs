//! Federating store adapter
//!
//! The protocol layer talks to storage only through [`FederatingDatabase`]:
//! object lookups, ownership checks, relationship tests, the Followers and
//! Following collections, and the create/update/delete hooks for inbound
//! activities. [`FederatingDb`] is the implementation backed by the
//! [`Database`], resolving unknown remote actors and objects through the
//! [`Dereferencer`].
//!
//! Activity types outside the generic contract (Undo, Accept, Reject,
//! Announce, Question) have their own handlers; [`FederatingDb::process`]
//! routes any inbound activity to the right one.
//!
//! Every handler publishes its side effect only after the mutation it
//! describes has been committed.

mod activities;
mod collections;
mod render;


use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::config::ServerConfig;
use crate::data::{Account, Database, EntityId};
use crate::error::AppError;
use crate::federation::dereferencing::Dereferencer;
use crate::federation::domain_block::{DomainBlockGuard, punify};
use crate::federation::objects::{ObjectType, id_of, type_of};
use crate::federation::side_effects::{FederatedModel, FromFederator, SideEffectSender};
use crate::federation::objects::ActivityType;

pub use render::{render_actor, render_status};

/// Storage contract the protocol layer depends on
#[async_trait]
pub trait FederatingDatabase: Send + Sync {
    /// Whether an object with this IRI is stored
    async fn exists(&self, id: &Url) -> Result<bool, AppError>;

    /// Protocol JSON of a local object
    ///
    /// # Errors
    /// `AppError::NotFound` if the IRI names nothing served by this node
    async fn get(&self, id: &Url) -> Result<Value, AppError>;

    /// Whether the IRI belongs to this node
    async fn owns(&self, id: &Url) -> Result<bool, AppError>;

    /// Local actor owning an inbox
    async fn actor_for_inbox(&self, inbox: &Url) -> Result<Url, AppError>;

    /// Local actor owning an outbox
    async fn actor_for_outbox(&self, outbox: &Url) -> Result<Url, AppError>;

    /// Fresh IRI for an outgoing activity or object
    async fn new_id(&self, activity: &Value) -> Result<Url, AppError>;

    /// Followers collection of a local actor
    ///
    /// # Errors
    /// `AppError::Validation` if the IRI is not a local actor path
    async fn followers(&self, actor: &Url) -> Result<Value, AppError>;

    /// Following collection of a local actor
    async fn following(&self, actor: &Url) -> Result<Value, AppError>;

    async fn is_following(&self, follower: &Url, followee: &Url) -> Result<bool, AppError>;

    /// Whether either actor blocks the other
    async fn is_blocked(&self, actor: &Url, other: &Url) -> Result<bool, AppError>;

    /// Store an inbound object: a status, or a Follow, Like or Block
    async fn create(&self, ctx: &InboundContext, object: &Value) -> Result<(), AppError>;

    /// Apply an inbound update of an actor or status
    async fn update(&self, ctx: &InboundContext, object: &Value) -> Result<(), AppError>;

    /// Apply an inbound Delete activity
    async fn delete(&self, ctx: &InboundContext, activity: &Value) -> Result<(), AppError>;
}

/// Who delivered an inbound activity, and to whom
#[derive(Debug, Clone)]
pub struct InboundContext {
    /// Remote account whose signature was verified
    pub requester: Account,
    /// Local account whose inbox received the activity; `None` for the
    /// shared inbox
    pub receiving: Option<Account>,
}

impl InboundContext {
    pub fn new(requester: Account, receiving: Option<Account>) -> Self {
        Self {
            requester,
            receiving,
        }
    }

    /// Local username that follow-up fetches are signed as
    ///
    /// Empty for the shared inbox, which signs as the instance actor.
    pub fn fetch_as(&self) -> &str {
        self.receiving
            .as_ref()
            .map_or("", |account| account.username.as_str())
    }
}

/// [`FederatingDatabase`] backed by SQLite and the dereferencer
#[derive(Clone)]
pub struct FederatingDb {
    db: Arc<Database>,
    dereferencer: Dereferencer,
    blocks: Arc<DomainBlockGuard>,
    side_effects: SideEffectSender,
    base_url: String,
    host: String,
}

impl FederatingDb {
    pub fn new(
        server: &ServerConfig,
        db: Arc<Database>,
        dereferencer: Dereferencer,
        blocks: Arc<DomainBlockGuard>,
        side_effects: SideEffectSender,
    ) -> Result<Self, AppError> {
        Ok(Self {
            db,
            dereferencer,
            blocks,
            side_effects,
            base_url: server.base_url(),
            host: punify(&server.domain)?,
        })
    }

    fn is_local(&self, iri: &Url) -> bool {
        iri.host_str()
            .and_then(|host| punify(host).ok())
            .is_some_and(|host| host == self.host)
    }

    /// Path segments after `/users/{username}` of a local IRI
    fn local_user_path<'a>(&self, iri: &'a Url) -> Option<(&'a str, Vec<&'a str>)> {
        if !self.is_local(iri) {
            return None;
        }
        let mut segments = iri.path_segments()?.filter(|segment| !segment.is_empty());
        if segments.next()? != "users" {
            return None;
        }
        let username = segments.next()?;
        Some((username, segments.collect()))
    }

    /// Stored local account named by an actor IRI
    ///
    /// # Errors
    /// - `AppError::Validation` if the IRI is not of the local actor shape
    /// - `AppError::NotFound` if no such local account exists
    async fn local_account(&self, actor: &Url) -> Result<Account, AppError> {
        let username = match self.local_user_path(actor) {
            Some((username, rest)) if rest.is_empty() => username,
            _ => {
                return Err(AppError::Validation(format!(
                    "{actor} is not a local actor"
                )));
            }
        };
        self.db
            .get_local_account(username)
            .await?
            .ok_or(AppError::NotFound)
    }

    fn publish(
        &self,
        ctx: &InboundContext,
        activity_type: ActivityType,
        object_type: ObjectType,
        model: FederatedModel,
        target: Option<Account>,
    ) -> Result<(), AppError> {
        self.side_effects.publish(FromFederator {
            activity_type,
            object_type,
            model,
            origin_account: Some(ctx.requester.clone()),
            target_account: target.or_else(|| ctx.receiving.clone()),
        })
    }
}

#[async_trait]
impl FederatingDatabase for FederatingDb {
    async fn exists(&self, id: &Url) -> Result<bool, AppError> {
        if self.db.get_status_by_uri(id.as_str()).await?.is_some() {
            return Ok(true);
        }
        Ok(self.db.get_account_by_uri(id.as_str()).await?.is_some())
    }

    async fn get(&self, id: &Url) -> Result<Value, AppError> {
        if !self.is_local(id) {
            return Err(AppError::NotFound);
        }

        if let Some(status) = self.db.get_status_by_uri(id.as_str()).await? {
            let author = self
                .db
                .get_account_by_id(&status.account_id)
                .await?
                .ok_or_else(|| {
                    AppError::Internal(anyhow::anyhow!("status {} has no author", status.uri))
                })?;
            return Ok(render_status(&status, &author));
        }

        match self.local_user_path(id) {
            Some((_, rest)) if rest.is_empty() => {
                Ok(render_actor(&self.local_account(id).await?))
            }
            Some((username, rest)) if rest == ["followers"] || rest == ["following"] => {
                let actor = Url::parse(&format!("{}/users/{}", self.base_url, username))
                    .map_err(|e| AppError::Validation(format!("Invalid actor IRI: {e}")))?;
                if rest == ["followers"] {
                    self.followers(&actor).await
                } else {
                    self.following(&actor).await
                }
            }
            _ => Err(AppError::NotFound),
        }
    }

    async fn owns(&self, id: &Url) -> Result<bool, AppError> {
        Ok(self.is_local(id))
    }

    async fn actor_for_inbox(&self, inbox: &Url) -> Result<Url, AppError> {
        let account = self
            .db
            .get_local_account_by_inbox(inbox.as_str())
            .await?
            .ok_or(AppError::NotFound)?;
        Url::parse(&account.uri).map_err(|e| AppError::Internal(e.into()))
    }

    async fn actor_for_outbox(&self, outbox: &Url) -> Result<Url, AppError> {
        let account = self
            .db
            .get_local_account_by_outbox(outbox.as_str())
            .await?
            .ok_or(AppError::NotFound)?;
        Url::parse(&account.uri).map_err(|e| AppError::Internal(e.into()))
    }

    async fn new_id(&self, activity: &Value) -> Result<Url, AppError> {
        let collection = match type_of(activity) {
            Some("Note" | "Article" | "Question") => "statuses",
            Some("Follow") => "follows",
            Some("Like") => "likes",
            Some("Block") => "blocks",
            _ => "activities",
        };
        let actor = activity
            .get("actor")
            .or_else(|| activity.get("attributedTo"))
            .and_then(id_of)
            .and_then(|raw| Url::parse(raw).ok());

        let id = EntityId::new().0;
        let raw = match actor.as_ref().and_then(|actor| self.local_user_path(actor)) {
            Some((username, rest)) if rest.is_empty() => {
                format!("{}/users/{username}/{collection}/{id}", self.base_url)
            }
            _ => format!("{}/{collection}/{id}", self.base_url),
        };
        Url::parse(&raw).map_err(|e| AppError::Internal(e.into()))
    }

    async fn followers(&self, actor: &Url) -> Result<Value, AppError> {
        self.collection(actor, collections::Edge::Followers).await
    }

    async fn following(&self, actor: &Url) -> Result<Value, AppError> {
        self.collection(actor, collections::Edge::Following).await
    }

    async fn is_following(&self, follower: &Url, followee: &Url) -> Result<bool, AppError> {
        let (Some(follower), Some(followee)) = (
            self.db.get_account_by_uri(follower.as_str()).await?,
            self.db.get_account_by_uri(followee.as_str()).await?,
        ) else {
            return Ok(false);
        };
        self.db.is_following(&follower.id, &followee.id).await
    }

    async fn is_blocked(&self, actor: &Url, other: &Url) -> Result<bool, AppError> {
        let (Some(actor), Some(other)) = (
            self.db.get_account_by_uri(actor.as_str()).await?,
            self.db.get_account_by_uri(other.as_str()).await?,
        ) else {
            return Ok(false);
        };
        self.db.is_blocked(&actor.id, &other.id).await
    }

    async fn create(&self, ctx: &InboundContext, object: &Value) -> Result<(), AppError> {
        self.create_object(ctx, object).await
    }

    async fn update(&self, ctx: &InboundContext, object: &Value) -> Result<(), AppError> {
        self.update_object(ctx, object).await
    }

    async fn delete(&self, ctx: &InboundContext, activity: &Value) -> Result<(), AppError> {
        self.delete_object(ctx, activity).await
    }
}

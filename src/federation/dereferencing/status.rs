//! Status resolution

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use sqlx::types::Json;
use url::Url;

use super::{Dereferencer, ThreadResolution, handshake};
use crate::data::{Account, EntityId, Poll, PollOption, Status};
use crate::error::AppError;
use crate::federation::media::MediaInfo;
use crate::federation::objects::{StatusObject, extract_visibility, iri_of, parse_iri};
use crate::metrics::observe_dereference;

impl Dereferencer {
    /// Resolve a status by IRI
    ///
    /// Known statuses are returned from storage unless `refetch` is set.
    /// With `include_parent`, the reply chain above the status is walked
    /// and linked; the walk's outcome is returned alongside the status.
    ///
    /// # Errors
    /// - `AppError::Blocked` if the IRI's domain is blocked
    /// - `AppError::NotFound`/`Gone` if the status does not exist
    /// - `AppError::Federation` if the remote is unreachable or the
    ///   document is unusable (including authorship on another host)
    pub async fn resolve_status(
        &self,
        requester: &str,
        uri: &Url,
        refetch: bool,
        include_parent: bool,
    ) -> Result<(Status, Option<ThreadResolution>), AppError> {
        let status = self.resolve_status_inner(requester, uri, refetch, None).await?;
        self.with_thread(requester, status, include_parent).await
    }

    /// Resolve a status from a document already in hand, e.g. the object
    /// embedded in an inbound `Create`
    pub async fn resolve_status_with_object(
        &self,
        requester: &str,
        object: Value,
        include_parent: bool,
    ) -> Result<(Status, Option<ThreadResolution>), AppError> {
        let uri = iri_of(&object)?;
        let status = self
            .resolve_status_inner(requester, &uri, true, Some(object))
            .await?;
        self.with_thread(requester, status, include_parent).await
    }

    /// Re-resolve author, attachments and emoji of a known remote status
    pub async fn enrich_remote_status(
        &self,
        requester: &str,
        status: &Status,
        include_parent: bool,
    ) -> Result<(Status, Option<ThreadResolution>), AppError> {
        if status.is_local {
            return Ok((status.clone(), None));
        }
        let uri = parse_iri(&status.uri)?;
        self.resolve_status(requester, &uri, true, include_parent)
            .await
    }

    /// Fill in the boosted status of an `Announce`
    ///
    /// The boosted status is resolved if unknown. The returned boost is
    /// not stored.
    pub async fn resolve_announce(&self, requester: &str, boost: &Status) -> Result<Status, AppError> {
        let target = boost
            .boost_of_uri
            .as_deref()
            .ok_or_else(|| AppError::Validation(format!("{} is not a boost", boost.uri)))?;
        let target = parse_iri(target)?;

        let (boosted, _) = self.resolve_status(requester, &target, false, false).await?;

        let mut boost = boost.clone();
        boost.boost_of_id = Some(boosted.id);
        boost.boost_of_uri = Some(boosted.uri);
        boost.boost_of_account_id = Some(boosted.account_id);
        boost.visibility = boosted.visibility;
        boost.sensitive = boosted.sensitive;
        Ok(boost)
    }

    async fn with_thread(
        &self,
        requester: &str,
        status: Status,
        include_parent: bool,
    ) -> Result<(Status, Option<ThreadResolution>), AppError> {
        if !include_parent || !status.has_unresolved_parent() {
            return Ok((status, None));
        }

        let thread = self.resolve_thread(requester, &status).await;
        let status = if thread.ancestors.is_empty() {
            status
        } else {
            match self.inner.db.get_status_by_id(&status.id).await? {
                Some(linked) => linked,
                None => status,
            }
        };
        Ok((status, Some(thread)))
    }

    /// Status lookup and fetch, without any thread walking
    pub(super) async fn resolve_status_inner(
        &self,
        requester: &str,
        uri: &Url,
        refetch: bool,
        prefetched: Option<Value>,
    ) -> Result<Status, AppError> {
        self.inner.blocks.ensure_uri_allowed(uri).await?;

        let existing = self.inner.db.get_status_by_uri(uri.as_str()).await?;
        if let Some(status) = &existing {
            if status.is_local || !refetch {
                observe_dereference("status", "cached");
                return Ok(status.clone());
            }
        }

        if self.is_local_url(uri) {
            return existing.ok_or(AppError::NotFound);
        }

        if handshake::in_chain(uri.as_str()) {
            tracing::debug!(uri = %uri, requester, "Status already being resolved, not re-entering");
            return existing.ok_or_else(|| AppError::Gone(format!("status resolution in progress: {uri}")));
        }

        match self.fetch_status(requester, uri, prefetched).await {
            Ok(status) => Ok(status),
            Err(error) => match existing {
                Some(stale) => {
                    tracing::warn!(%error, uri = %uri, "Refetch failed, using stored status");
                    observe_dereference("status", "stale");
                    Ok(stale)
                }
                None => Err(error),
            },
        }
    }

    async fn fetch_status(
        &self,
        requester: &str,
        uri: &Url,
        prefetched: Option<Value>,
    ) -> Result<Status, AppError> {
        let this = self.clone();
        let owned_requester = requester.to_string();
        let owned_uri = uri.clone();

        self.inner
            .statuses
            .run(uri.as_str(), move || {
                let chain_requester = owned_requester.clone();
                let chain_uri = owned_uri.to_string();
                handshake::scoped(&chain_requester, &chain_uri, async move {
                    this.dereference_status(&owned_requester, &owned_uri, prefetched)
                        .await
                })
                .boxed()
            })
            .await
    }

    async fn dereference_status(
        &self,
        requester: &str,
        uri: &Url,
        prefetched: Option<Value>,
    ) -> Result<Status, AppError> {
        let value = match prefetched {
            Some(value) => value,
            None => self.inner.transport.dereference(requester, uri).await?,
        };
        let object = StatusObject::parse(&value)?;

        if object.id.host_str() != uri.host_str() {
            return Err(AppError::Federation(format!(
                "Status fetched from {uri} claims id {}",
                object.id
            )));
        }
        if object.attributed_to.host_str() != object.id.host_str() {
            return Err(AppError::Federation(format!(
                "Status {} is attributed to {} on another host",
                object.id, object.attributed_to
            )));
        }

        let author = self
            .resolve_account_by_uri(requester, &object.attributed_to)
            .await?;
        let existing = self
            .inner
            .db
            .get_status_by_uri(object.id.as_str())
            .await?;

        let status = self
            .build_status(requester, &object, &author, existing.as_ref())
            .await?;
        let status = self.store_status(status, existing.is_some()).await?;

        if let Some(poll) = &object.poll {
            let options = poll
                .options
                .iter()
                .enumerate()
                .map(|(position, (title, votes))| PollOption {
                    status_id: status.id.clone(),
                    position: position as i64,
                    title: title.clone(),
                    votes_count: *votes,
                })
                .collect::<Vec<_>>();
            let stored_poll = Poll {
                status_id: status.id.clone(),
                multiple: poll.multiple,
                expires_at: poll.expires_at,
                closed_at: poll.closed_at,
                voters_count: poll.voters_count,
            };
            self.inner.db.put_poll(&stored_poll, &options).await?;
        }

        observe_dereference("status", "fetched");
        tracing::info!(uri = %status.uri, author = %author.uri, "Dereferenced status");
        Ok(status)
    }

    async fn build_status(
        &self,
        requester: &str,
        object: &StatusObject,
        author: &Account,
        existing: Option<&Status>,
    ) -> Result<Status, AppError> {
        let mut attachment_ids = Vec::with_capacity(object.attachments.len());
        for attachment in &object.attachments {
            let info = MediaInfo {
                description: attachment.description.clone(),
                blurhash: attachment.blurhash.clone(),
            };
            if let Some(id) = self
                .load_attachment(requester, &author.id, &attachment.url, info)
                .await
            {
                attachment_ids.push(id);
            }
        }

        let mut emoji_ids = Vec::with_capacity(object.emojis.len());
        for emoji in &object.emojis {
            if let Some(id) = self
                .load_emoji(
                    requester,
                    &emoji.shortcode,
                    &author.domain,
                    &emoji.icon_url,
                    emoji.uri.as_deref(),
                )
                .await
            {
                emoji_ids.push(id);
            }
        }

        let in_reply_to_uri = object.in_reply_to.as_ref().map(Url::to_string);
        // Parent links are only made by the thread walk, which checks for
        // cycles first.
        let (in_reply_to_id, in_reply_to_account_id) = match existing {
            Some(status) if status.in_reply_to_uri == in_reply_to_uri => (
                status.in_reply_to_id.clone(),
                status.in_reply_to_account_id.clone(),
            ),
            _ => (None, None),
        };

        let now = Utc::now();
        Ok(Status {
            id: existing
                .map(|status| status.id.clone())
                .unwrap_or_else(|| EntityId::new().0),
            uri: object.id.to_string(),
            url: object.url.clone(),
            content: object.content.clone(),
            content_warning: object.summary.clone(),
            sensitive: object.sensitive,
            visibility: extract_visibility(&object.raw, author.followers_uri.as_deref())
                .as_str()
                .to_string(),
            language: object.language.clone(),
            account_id: author.id.clone(),
            account_uri: author.uri.clone(),
            is_local: false,
            in_reply_to_id,
            in_reply_to_uri,
            in_reply_to_account_id,
            boost_of_id: existing.and_then(|status| status.boost_of_id.clone()),
            boost_of_uri: existing.and_then(|status| status.boost_of_uri.clone()),
            boost_of_account_id: existing.and_then(|status| status.boost_of_account_id.clone()),
            attachment_ids: Json(attachment_ids),
            emoji_ids: Json(emoji_ids),
            created_at: existing
                .map(|status| status.created_at)
                .or(object.published)
                .unwrap_or(now),
            updated_at: now,
            fetched_at: Some(now),
        })
    }

    async fn store_status(&self, mut status: Status, exists: bool) -> Result<Status, AppError> {
        if exists && self.inner.db.update_status(&status).await? {
            return Ok(status);
        }

        match self.inner.db.insert_status(&status).await {
            Ok(()) => Ok(status),
            Err(AppError::Conflict(message)) => {
                let Some(stored) = self.inner.db.get_status_by_uri(&status.uri).await? else {
                    return Err(AppError::Conflict(message));
                };
                status.id = stored.id;
                status.created_at = stored.created_at;
                status.in_reply_to_id = stored.in_reply_to_id;
                status.in_reply_to_account_id = stored.in_reply_to_account_id;
                self.inner.db.update_status(&status).await?;
                Ok(status)
            }
            Err(error) => Err(error),
        }
    }
}

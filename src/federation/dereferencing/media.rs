//! Remote media and emoji resolution
//!
//! Jobs are keyed by remote URL (or `shortcode@domain` for emoji) so that a
//! file referenced by many requests at once is only downloaded once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::Dereferencer;
use crate::error::AppError;
use crate::federation::domain_block::punify;
use crate::federation::media::{
    EmojiInfo, MediaInfo, ProcessingEmoji, ProcessingJob, ProcessingMedia,
};
use crate::federation::objects::{is_valid_shortcode, parse_iri};
use crate::metrics::DEREFERENCE_JOINED_TOTAL;

type Jobs<T> = Arc<Mutex<HashMap<String, ProcessingJob<T>>>>;

/// Keyed map of running processing jobs
pub(crate) struct JobMap<T> {
    kind: &'static str,
    jobs: Jobs<T>,
}

impl<T> JobMap<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The running job for `key`, or a new one from `start`
    ///
    /// The entry is dropped once the job finishes, whatever its outcome.
    pub(crate) fn get_or_start(
        &self,
        key: &str,
        start: impl FnOnce() -> ProcessingJob<T>,
    ) -> ProcessingJob<T> {
        let job = {
            let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(job) = jobs.get(key) {
                DEREFERENCE_JOINED_TOTAL
                    .with_label_values(&[self.kind])
                    .inc();
                tracing::debug!(kind = self.kind, key, "Joined running media job");
                return job.clone();
            }

            let job = start();
            jobs.insert(key.to_string(), job.clone());
            job
        };

        let jobs = self.jobs.clone();
        let key = key.to_string();
        let watched = job.clone();
        tokio::spawn(async move {
            let _ = watched.load().await;
            let mut jobs = jobs.lock().unwrap_or_else(PoisonError::into_inner);
            if jobs.get(&key).is_some_and(|job| job.id() == watched.id()) {
                jobs.remove(&key);
            }
        });

        job
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Dereferencer {
    /// Start (or join) processing of a remote attachment
    ///
    /// # Errors
    /// - `AppError::Validation` if `remote_url` is not an http(s) URL
    /// - `AppError::Blocked` if its host is blocked
    pub async fn resolve_remote_media(
        &self,
        requester: &str,
        owner_account_id: &str,
        remote_url: &str,
        info: MediaInfo,
    ) -> Result<ProcessingMedia, AppError> {
        let url = parse_iri(remote_url)?;
        self.inner.blocks.ensure_uri_allowed(&url).await?;

        Ok(self.inner.attachments.get_or_start(url.as_str(), || {
            self.inner
                .media
                .process_remote_media(requester, owner_account_id, &url, info)
        }))
    }

    /// Start (or join) processing of a remote custom emoji
    ///
    /// An emoji already stored from the same image is returned as a
    /// completed job unless `refresh` is set.
    pub async fn resolve_remote_emoji(
        &self,
        requester: &str,
        shortcode: &str,
        domain: &str,
        remote_url: &str,
        emoji_uri: Option<&str>,
        refresh: bool,
    ) -> Result<ProcessingEmoji, AppError> {
        let domain = punify(domain)?;
        if !is_valid_shortcode(shortcode) || domain.is_empty() {
            return Err(AppError::Validation(format!(
                "Remote emoji needs a valid shortcode and domain, got {shortcode:?}@{domain:?}"
            )));
        }
        let url = parse_iri(remote_url)?;
        self.inner.blocks.ensure_uri_allowed(&url).await?;

        let existing = self.inner.db.get_emoji(shortcode, &domain).await?;
        if let Some(emoji) = &existing {
            if !refresh && emoji.image_remote_url.as_deref() == Some(url.as_str()) {
                return Ok(ProcessingJob::completed(emoji.id.clone(), emoji.clone()));
            }
        }

        let key = format!("{shortcode}@{domain}");
        Ok(self.inner.emojis.get_or_start(&key, || {
            self.inner.media.process_remote_emoji(
                requester,
                shortcode,
                &domain,
                &url,
                EmojiInfo {
                    uri: emoji_uri.map(str::to_string),
                    existing,
                },
            )
        }))
    }

    /// Fetch an account avatar or header and wait for it
    ///
    /// Failures are logged and yield `None`; a profile is still usable
    /// without its images.
    pub(super) async fn fetch_profile_image(
        &self,
        requester: &str,
        account_id: &str,
        remote_url: &str,
        header: bool,
    ) -> Option<String> {
        let url = match parse_iri(remote_url) {
            Ok(url) => url,
            Err(error) => {
                tracing::warn!(%error, url = remote_url, "Skipping unusable profile image");
                return None;
            }
        };
        match self.inner.blocks.is_uri_blocked(&url).await {
            Ok(false) => {}
            Ok(true) => return None,
            Err(error) => {
                tracing::warn!(%error, url = %url, "Skipping profile image");
                return None;
            }
        }

        let map = if header {
            &self.inner.headers
        } else {
            &self.inner.avatars
        };
        let job = map.get_or_start(url.as_str(), || {
            self.inner
                .media
                .process_remote_media(requester, account_id, &url, MediaInfo::default())
        });

        match job.load().await {
            Ok(media) => Some(media.id),
            Err(error) => {
                tracing::warn!(%error, url = %url, header, "Failed to fetch profile image");
                None
            }
        }
    }

    /// Resolve one attachment of a status and wait for it
    pub(super) async fn load_attachment(
        &self,
        requester: &str,
        owner_account_id: &str,
        remote_url: &str,
        info: MediaInfo,
    ) -> Option<String> {
        let job = self
            .resolve_remote_media(requester, owner_account_id, remote_url, info)
            .await;
        match job {
            Ok(job) => match job.load().await {
                Ok(media) => Some(media.id),
                Err(error) => {
                    tracing::warn!(%error, url = remote_url, "Skipping failed attachment");
                    None
                }
            },
            Err(error) => {
                tracing::warn!(%error, url = remote_url, "Skipping attachment");
                None
            }
        }
    }

    /// Resolve one emoji of a status and wait for it
    pub(super) async fn load_emoji(
        &self,
        requester: &str,
        shortcode: &str,
        domain: &str,
        remote_url: &str,
        emoji_uri: Option<&str>,
    ) -> Option<String> {
        let job = self
            .resolve_remote_emoji(requester, shortcode, domain, remote_url, emoji_uri, false)
            .await;
        match job {
            Ok(job) => match job.load().await {
                Ok(emoji) => Some(emoji.id),
                Err(error) => {
                    tracing::warn!(%error, shortcode, "Skipping failed emoji");
                    None
                }
            },
            Err(error) => {
                tracing::warn!(%error, shortcode, "Skipping emoji");
                None
            }
        }
    }
}


//! Media manager capability
//!
//! Remote media (avatars, headers, attachments) and custom emoji are
//! downloaded in background jobs. Callers get a [`ProcessingJob`] handle
//! back immediately; they can peek at its state or wait for it to finish.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use url::Url;

use crate::data::{Database, Emoji, EntityId, MediaAttachment};
use crate::error::{AppError, SharedError};
use crate::federation::transport::Transport;

/// Current state of a processing job
#[derive(Debug, Clone)]
pub enum JobState<T> {
    Processing,
    Complete(T),
    Failed(SharedError),
}

/// State of a processing job, without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Processing,
    Complete,
    Failed,
}

/// Cloneable handle to an in-progress or finished media job
#[derive(Debug, Clone)]
pub struct ProcessingJob<T> {
    id: String,
    rx: watch::Receiver<JobState<T>>,
}

pub type ProcessingMedia = ProcessingJob<MediaAttachment>;
pub type ProcessingEmoji = ProcessingJob<Emoji>;

impl<T> ProcessingJob<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Run `fut` on the runtime and track its outcome
    pub fn spawn<F>(id: String, fut: F) -> Self
    where
        F: Future<Output = Result<T, AppError>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(JobState::Processing);
        tokio::spawn(async move {
            let state = match fut.await {
                Ok(value) => JobState::Complete(value),
                Err(error) => {
                    tracing::warn!(%error, "Media processing failed");
                    JobState::Failed(SharedError::from(&error))
                }
            };
            tx.send_replace(state);
        });

        Self { id, rx }
    }

    /// A job that has already finished
    pub fn completed(id: String, value: T) -> Self {
        let (_tx, rx) = watch::channel(JobState::Complete(value));
        Self { id, rx }
    }

    /// ID the resulting record is (or will be) stored under
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Non-blocking status query
    pub fn status(&self) -> JobStatus {
        match &*self.rx.borrow() {
            JobState::Processing => JobStatus::Processing,
            JobState::Complete(_) => JobStatus::Complete,
            JobState::Failed(_) => JobStatus::Failed,
        }
    }

    /// Wait for the job to finish
    ///
    /// # Errors
    /// The job's own error, or `Internal` if the job was torn down before
    /// reporting a result.
    pub async fn load(&self) -> Result<T, AppError> {
        let mut rx = self.rx.clone();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                JobState::Complete(value) => return Ok(value),
                JobState::Failed(error) => return Err(error.into()),
                JobState::Processing => {}
            }

            if rx.changed().await.is_err() {
                return match rx.borrow().clone() {
                    JobState::Complete(value) => Ok(value),
                    JobState::Failed(error) => Err(error.into()),
                    JobState::Processing => Err(AppError::Internal(anyhow::anyhow!(
                        "media job {} abandoned",
                        self.id
                    ))),
                };
            }
        }
    }
}

/// Metadata carried alongside a remote attachment
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub description: Option<String>,
    pub blurhash: Option<String>,
}

/// Metadata carried alongside a remote emoji
#[derive(Debug, Clone, Default)]
pub struct EmojiInfo {
    /// The emoji's own IRI, if the remote advertised one
    pub uri: Option<String>,
    /// Stored row being refreshed, if any
    pub existing: Option<Emoji>,
}

/// Starts media processing jobs; never blocks on the download itself
pub trait MediaManager: Send + Sync {
    fn process_remote_media(
        &self,
        requester: &str,
        owner_account_id: &str,
        remote_url: &Url,
        info: MediaInfo,
    ) -> ProcessingMedia;

    fn process_remote_emoji(
        &self,
        requester: &str,
        shortcode: &str,
        domain: &str,
        remote_url: &Url,
        info: EmojiInfo,
    ) -> ProcessingEmoji;
}

/// Downloads through the transport and stores files on local disk
pub struct RemoteMediaManager {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    directory: PathBuf,
}

impl RemoteMediaManager {
    pub fn new(db: Arc<Database>, transport: Arc<dyn Transport>, directory: PathBuf) -> Self {
        Self {
            db,
            transport,
            directory,
        }
    }
}

fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/avif" => "avif",
        "image/svg+xml" => "svg",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        _ => "bin",
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| AppError::Internal(e.into()))
}

impl MediaManager for RemoteMediaManager {
    fn process_remote_media(
        &self,
        requester: &str,
        owner_account_id: &str,
        remote_url: &Url,
        info: MediaInfo,
    ) -> ProcessingMedia {
        let id = EntityId::new().0;

        let db = self.db.clone();
        let transport = self.transport.clone();
        let directory = self.directory.clone();
        let requester = requester.to_string();
        let owner_account_id = owner_account_id.to_string();
        let remote_url = remote_url.clone();
        let media_id = id.clone();

        ProcessingJob::spawn(id, async move {
            let fetched = transport.fetch_media(&requester, &remote_url).await?;
            let path = directory
                .join("attachments")
                .join(format!("{}.{}", media_id, extension_for(&fetched.content_type)));
            write_file(&path, &fetched.bytes).await?;

            let media = MediaAttachment {
                id: media_id,
                account_id: owner_account_id,
                remote_url: Some(remote_url.to_string()),
                file_path: path.to_string_lossy().into_owned(),
                content_type: fetched.content_type,
                file_size: fetched.bytes.len() as i64,
                description: info.description,
                blurhash: info.blurhash,
                created_at: Utc::now(),
            };
            db.insert_media(&media).await?;

            tracing::info!(media_id = %media.id, url = %remote_url, "Stored remote media");
            Ok(media)
        })
    }

    fn process_remote_emoji(
        &self,
        requester: &str,
        shortcode: &str,
        domain: &str,
        remote_url: &Url,
        info: EmojiInfo,
    ) -> ProcessingEmoji {
        let id = info
            .existing
            .as_ref()
            .map(|emoji| emoji.id.clone())
            .unwrap_or_else(|| EntityId::new().0);

        let db = self.db.clone();
        let transport = self.transport.clone();
        let directory = self.directory.clone();
        let requester = requester.to_string();
        let shortcode = shortcode.to_string();
        let domain = domain.to_string();
        let remote_url = remote_url.clone();
        let emoji_id = id.clone();

        ProcessingJob::spawn(id, async move {
            let fetched = transport.fetch_media(&requester, &remote_url).await?;
            let path = directory
                .join("emoji")
                .join(format!("{}.{}", emoji_id, extension_for(&fetched.content_type)));
            write_file(&path, &fetched.bytes).await?;

            let now = Utc::now();
            let created_at = info
                .existing
                .as_ref()
                .map(|emoji| emoji.created_at)
                .unwrap_or(now);
            let emoji = Emoji {
                id: emoji_id,
                uri: info.uri.unwrap_or_else(|| remote_url.to_string()),
                shortcode,
                domain,
                image_remote_url: Some(remote_url.to_string()),
                file_path: path.to_string_lossy().into_owned(),
                content_type: fetched.content_type,
                created_at,
                updated_at: now,
            };

            db.upsert_emoji(&emoji).await
        })
    }
}

//! Data models
//!
//! Rust structs representing stored federation entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Account
// =============================================================================

/// A local or remote actor
///
/// Exactly one row exists per canonical `uri`. Local accounts have an empty
/// `domain` and carry a private key; remote accounts carry `fetched_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: String,
    /// Canonical ActivityPub actor IRI
    pub uri: String,
    /// Human-facing profile URL
    pub url: Option<String>,
    pub username: String,
    /// Empty for local accounts
    pub domain: String,
    pub display_name: Option<String>,
    pub note: Option<String>,
    /// Follow requests need manual approval
    pub locked: bool,
    pub bot: bool,
    pub discoverable: bool,
    pub inbox_uri: Option<String>,
    pub outbox_uri: Option<String>,
    pub shared_inbox_uri: Option<String>,
    pub followers_uri: Option<String>,
    pub following_uri: Option<String>,
    pub featured_uri: Option<String>,
    pub public_key_uri: String,
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    /// RSA private key (PEM format), local accounts only
    pub private_key_pem: Option<String>,
    pub avatar_remote_url: Option<String>,
    pub avatar_media_id: Option<String>,
    pub header_remote_url: Option<String>,
    pub header_media_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When this remote account was last dereferenced
    pub fetched_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn is_local(&self) -> bool {
        self.domain.is_empty()
    }

    /// Whether a remote account was fetched within `interval` of `now`.
    ///
    /// Local accounts are always fresh; remote accounts that were never
    /// fetched never are.
    pub fn is_fresh(&self, now: DateTime<Utc>, interval: chrono::Duration) -> bool {
        if self.is_local() {
            return true;
        }
        self.fetched_at
            .is_some_and(|fetched_at| now.signed_duration_since(fetched_at) < interval)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Unlisted,
    FollowersOnly,
    Direct,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Unlisted => "unlisted",
            Self::FollowersOnly => "private",
            Self::Direct => "direct",
        }
    }
}

/// A federated post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Status {
    pub id: String,
    /// ActivityPub URI (globally unique)
    pub uri: String,
    pub url: Option<String>,
    /// Sanitized HTML content
    pub content: String,
    /// Content warning text
    pub content_warning: Option<String>,
    pub sensitive: bool,
    /// Visibility: public, unlisted, private, direct
    pub visibility: String,
    /// Language code (ISO 639-1)
    pub language: Option<String>,
    pub account_id: String,
    pub account_uri: String,
    pub is_local: bool,
    pub in_reply_to_id: Option<String>,
    pub in_reply_to_uri: Option<String>,
    pub in_reply_to_account_id: Option<String>,
    pub boost_of_id: Option<String>,
    pub boost_of_uri: Option<String>,
    pub boost_of_account_id: Option<String>,
    pub attachment_ids: Json<Vec<String>>,
    pub emoji_ids: Json<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When this remote status was fetched
    pub fetched_at: Option<DateTime<Utc>>,
}

impl Status {
    pub fn is_boost(&self) -> bool {
        self.boost_of_uri.is_some()
    }

    pub fn is_reply(&self) -> bool {
        self.in_reply_to_uri.is_some()
    }

    /// Reply whose parent has not been linked yet
    pub fn has_unresolved_parent(&self) -> bool {
        self.in_reply_to_uri.is_some() && self.in_reply_to_id.is_none()
    }
}

// =============================================================================
// Relationships
// =============================================================================

/// Established follow: `account_id` follows `target_account_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follow {
    pub id: String,
    /// ActivityPub Follow activity URI
    pub uri: String,
    pub account_id: String,
    pub target_account_id: String,
    pub created_at: DateTime<Utc>,
}

/// Pending follow awaiting Accept or Reject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowRequest {
    pub id: String,
    /// ActivityPub Follow activity URI
    pub uri: String,
    pub account_id: String,
    pub target_account_id: String,
    pub created_at: DateTime<Utc>,
}

/// `account_id` blocks `target_account_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Block {
    pub id: String,
    pub uri: String,
    pub account_id: String,
    pub target_account_id: String,
    pub created_at: DateTime<Utc>,
}

/// Favourite (Like) of a status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Fave {
    pub id: String,
    pub uri: String,
    pub account_id: String,
    pub status_id: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Federation bookkeeping
// =============================================================================

/// Blocked remote domain, stored in punycode form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DomainBlock {
    pub id: String,
    pub domain: String,
    pub created_at: DateTime<Utc>,
}

/// Remote instance metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Instance {
    pub id: String,
    pub domain: String,
    pub uri: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Software name and version as advertised
    pub version: Option<String>,
    pub contact_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

impl Instance {
    pub fn is_fresh(&self, now: DateTime<Utc>, interval: chrono::Duration) -> bool {
        now.signed_duration_since(self.fetched_at) < interval
    }
}

// =============================================================================
// Media
// =============================================================================

/// Stored copy of a remote media file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MediaAttachment {
    pub id: String,
    /// Account that owns this media
    pub account_id: String,
    pub remote_url: Option<String>,
    /// Local path of the stored file
    pub file_path: String,
    /// MIME type (e.g., "image/webp")
    pub content_type: String,
    /// File size in bytes
    pub file_size: i64,
    /// Alt text description
    pub description: Option<String>,
    /// Blurhash for placeholder
    pub blurhash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Custom emoji
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Emoji {
    pub id: String,
    pub shortcode: String,
    /// Empty for local emoji
    pub domain: String,
    pub uri: String,
    pub image_remote_url: Option<String>,
    pub file_path: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Polls
// =============================================================================

/// Poll attached to a status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Poll {
    pub status_id: String,
    /// `anyOf` polls allow multiple choices
    pub multiple: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub voters_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PollOption {
    pub status_id: String,
    pub position: i64,
    pub title: String,
    pub votes_count: i64,
}

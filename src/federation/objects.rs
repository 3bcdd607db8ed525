//! Typed views over ActivityStreams JSON
//!
//! Remote objects arrive as `serde_json::Value`. The helpers here pull out
//! the fields the engine relies on and reject documents that lack them.
//! Remote HTML is sanitized on the way in.

use chrono::{DateTime, Utc};
use serde_json::Value;
use url::Url;

use crate::data::Visibility;
use crate::error::AppError;

pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Inbound activity types the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityType {
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Reject,
    Undo,
    Like,
    Announce,
    Block,
    Question,
}

impl ActivityType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Create" => Some(Self::Create),
            "Update" => Some(Self::Update),
            "Delete" => Some(Self::Delete),
            "Follow" => Some(Self::Follow),
            "Accept" => Some(Self::Accept),
            "Reject" => Some(Self::Reject),
            "Undo" => Some(Self::Undo),
            "Like" => Some(Self::Like),
            "Announce" => Some(Self::Announce),
            "Block" => Some(Self::Block),
            "Question" => Some(Self::Question),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Undo => "Undo",
            Self::Like => "Like",
            Self::Announce => "Announce",
            Self::Block => "Block",
            Self::Question => "Question",
        }
    }
}

/// Object types carried inside activities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Profile,
    Note,
    Article,
    Question,
    Follow,
    Like,
    Block,
    Announce,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "Profile",
            Self::Note => "Note",
            Self::Article => "Article",
            Self::Question => "Question",
            Self::Follow => "Follow",
            Self::Like => "Like",
            Self::Block => "Block",
            Self::Announce => "Announce",
        }
    }

    /// Status-like object types
    pub fn status_type(s: &str) -> Option<Self> {
        match s {
            "Note" | "Page" => Some(Self::Note),
            "Article" => Some(Self::Article),
            "Question" => Some(Self::Question),
            _ => None,
        }
    }
}

pub fn is_actor_type(s: &str) -> bool {
    matches!(
        s,
        "Person" | "Service" | "Application" | "Group" | "Organization"
    )
}

// =============================================================================
// Field helpers
// =============================================================================

/// `type` of an object, if present
pub fn type_of(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

/// ID of a property that is either an IRI string or an object with `id`
pub fn id_of(value: &Value) -> Option<&str> {
    match value {
        Value::String(iri) => Some(iri),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

/// Parse an IRI property as an absolute http(s) URL
pub fn iri_of(value: &Value) -> Result<Url, AppError> {
    let raw = id_of(value).ok_or_else(|| AppError::Validation("Missing IRI".to_string()))?;
    parse_iri(raw)
}

/// Parse a raw IRI, accepting only http(s) URLs with a host
pub fn parse_iri(raw: &str) -> Result<Url, AppError> {
    let url =
        Url::parse(raw).map_err(|e| AppError::Validation(format!("Invalid IRI {raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(AppError::Validation(format!("Unsupported IRI: {raw}"))),
    }
}

/// First IRI of a property that may be a single value or an array
fn first_iri(value: &Value) -> Option<&str> {
    match value {
        Value::Array(entries) => entries.iter().find_map(id_of),
        other => id_of(other),
    }
}

/// `url` may be a string, a Link object or an array of either
fn url_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("href")
            .or_else(|| map.get("url"))
            .and_then(url_of),
        Value::Array(entries) => entries.iter().find_map(url_of),
        _ => None,
    }
}

/// All IRIs listed in an audience property (`to`, `cc`)
pub fn audience(value: &Value, field: &str) -> Vec<String> {
    match value.get(field) {
        Some(Value::String(iri)) => vec![iri.clone()],
        Some(Value::Array(entries)) => entries
            .iter()
            .filter_map(id_of)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn time_field(value: &Value, field: &str) -> Option<DateTime<Utc>> {
    value
        .get(field)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

pub fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}

/// Derive visibility from the addressing of an object
///
/// Public in `to` is public, public in `cc` is unlisted, the author's
/// followers collection is followers-only, anything else is direct.
pub fn extract_visibility(object: &Value, followers_uri: Option<&str>) -> Visibility {
    let to = audience(object, "to");
    let cc = audience(object, "cc");

    if to.iter().any(|iri| iri == PUBLIC_AUDIENCE) {
        Visibility::Public
    } else if cc.iter().any(|iri| iri == PUBLIC_AUDIENCE) {
        Visibility::Unlisted
    } else if followers_uri.is_some_and(|followers| to.iter().chain(&cc).any(|iri| iri == followers))
    {
        Visibility::FollowersOnly
    } else {
        Visibility::Direct
    }
}

// =============================================================================
// Actors
// =============================================================================

/// Fields of a remote actor document
#[derive(Debug, Clone, PartialEq)]
pub struct ActorObject {
    pub id: Url,
    pub actor_type: String,
    pub preferred_username: String,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub inbox: Option<String>,
    pub outbox: Option<String>,
    pub shared_inbox: Option<String>,
    pub followers: Option<String>,
    pub following: Option<String>,
    pub featured: Option<String>,
    pub public_key_id: String,
    pub public_key_owner: String,
    pub public_key_pem: String,
    pub icon_url: Option<String>,
    pub image_url: Option<String>,
    pub manually_approves_followers: bool,
    pub discoverable: bool,
}

impl ActorObject {
    /// # Errors
    /// `AppError::Federation` if the document is not a usable actor
    pub fn parse(value: &Value) -> Result<Self, AppError> {
        let malformed = |what: &str| AppError::Federation(format!("Malformed actor: {what}"));

        let actor_type = type_of(value).ok_or_else(|| malformed("missing type"))?;
        if !is_actor_type(actor_type) {
            return Err(malformed(&format!("unexpected type {actor_type}")));
        }

        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing id"))
            .and_then(|raw| parse_iri(raw).map_err(|_| malformed("invalid id")))?;

        let preferred_username =
            string_field(value, "preferredUsername").ok_or_else(|| malformed("missing preferredUsername"))?;

        let public_key = value
            .get("publicKey")
            .map(|key| match key {
                Value::Array(keys) => keys.first().unwrap_or(&Value::Null),
                other => other,
            })
            .ok_or_else(|| malformed("missing publicKey"))?;
        let public_key_id =
            string_field(public_key, "id").ok_or_else(|| malformed("missing publicKey.id"))?;
        let public_key_owner = string_field(public_key, "owner")
            .ok_or_else(|| malformed("missing publicKey.owner"))?;
        let public_key_pem = string_field(public_key, "publicKeyPem")
            .ok_or_else(|| malformed("missing publicKey.publicKeyPem"))?;

        let shared_inbox = value
            .get("endpoints")
            .and_then(|endpoints| string_field(endpoints, "sharedInbox"));

        Ok(Self {
            id,
            actor_type: actor_type.to_string(),
            preferred_username,
            name: string_field(value, "name"),
            summary: string_field(value, "summary").map(|s| sanitize_remote_html(&s)),
            url: value.get("url").and_then(url_of),
            inbox: string_field(value, "inbox"),
            outbox: string_field(value, "outbox"),
            shared_inbox,
            followers: string_field(value, "followers"),
            following: string_field(value, "following"),
            featured: string_field(value, "featured"),
            public_key_id,
            public_key_owner,
            public_key_pem,
            icon_url: value.get("icon").and_then(url_of),
            image_url: value.get("image").and_then(url_of),
            manually_approves_followers: value
                .get("manuallyApprovesFollowers")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            discoverable: value
                .get("discoverable")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    pub fn is_bot(&self) -> bool {
        matches!(self.actor_type.as_str(), "Service" | "Application")
    }
}

// =============================================================================
// Statuses
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentObject {
    pub url: String,
    pub media_type: Option<String>,
    pub description: Option<String>,
    pub blurhash: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmojiObject {
    /// Shortcode without surrounding colons
    pub shortcode: String,
    pub uri: Option<String>,
    pub icon_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollObject {
    pub multiple: bool,
    pub options: Vec<(String, i64)>,
    pub voters_count: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Fields of a remote Note, Article or Question
#[derive(Debug, Clone, PartialEq)]
pub struct StatusObject {
    pub id: Url,
    pub object_type: ObjectType,
    pub attributed_to: Url,
    pub in_reply_to: Option<Url>,
    pub url: Option<String>,
    pub content: String,
    pub summary: Option<String>,
    pub sensitive: bool,
    pub language: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub attachments: Vec<AttachmentObject>,
    pub emojis: Vec<EmojiObject>,
    pub poll: Option<PollObject>,
    /// Raw document, kept for audience inspection
    pub raw: Value,
}

impl StatusObject {
    /// # Errors
    /// `AppError::Federation` if the document is not a usable status
    pub fn parse(value: &Value) -> Result<Self, AppError> {
        let malformed = |what: &str| AppError::Federation(format!("Malformed status: {what}"));

        let object_type = type_of(value)
            .and_then(ObjectType::status_type)
            .ok_or_else(|| malformed("unsupported type"))?;

        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing id"))
            .and_then(|raw| parse_iri(raw).map_err(|_| malformed("invalid id")))?;

        let attributed_to = value
            .get("attributedTo")
            .and_then(first_iri)
            .ok_or_else(|| malformed("missing attributedTo"))
            .and_then(|raw| parse_iri(raw).map_err(|_| malformed("invalid attributedTo")))?;

        let in_reply_to = match value.get("inReplyTo").and_then(first_iri) {
            Some(raw) => Some(parse_iri(raw).map_err(|_| malformed("invalid inReplyTo"))?),
            None => None,
        };

        let content = value
            .get("content")
            .and_then(Value::as_str)
            .map(sanitize_remote_html)
            .unwrap_or_default();

        let language = value
            .get("contentMap")
            .and_then(Value::as_object)
            .and_then(|map| map.keys().next().cloned());

        let attachments = match value.get("attachment") {
            Some(Value::Array(entries)) => entries.iter().filter_map(parse_attachment).collect(),
            Some(single @ Value::Object(_)) => parse_attachment(single).into_iter().collect(),
            _ => Vec::new(),
        };

        let emojis = match value.get("tag") {
            Some(Value::Array(entries)) => entries.iter().filter_map(parse_emoji).collect(),
            Some(single @ Value::Object(_)) => parse_emoji(single).into_iter().collect(),
            _ => Vec::new(),
        };

        let poll = if object_type == ObjectType::Question {
            Some(parse_poll(value))
        } else {
            None
        };

        Ok(Self {
            id,
            object_type,
            attributed_to,
            in_reply_to,
            url: value.get("url").and_then(url_of),
            content,
            summary: string_field(value, "summary").map(|s| sanitize_remote_html(&s)),
            sensitive: value
                .get("sensitive")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            language,
            published: time_field(value, "published"),
            attachments,
            emojis,
            poll,
            raw: value.clone(),
        })
    }
}

fn parse_attachment(value: &Value) -> Option<AttachmentObject> {
    Some(AttachmentObject {
        url: value.get("url").and_then(url_of)?,
        media_type: string_field(value, "mediaType"),
        description: string_field(value, "name").or_else(|| string_field(value, "summary")),
        blurhash: string_field(value, "blurhash"),
    })
}

/// Custom emoji shortcodes are `[A-Za-z0-9_]+`
pub fn is_valid_shortcode(shortcode: &str) -> bool {
    !shortcode.is_empty()
        && shortcode
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_emoji(value: &Value) -> Option<EmojiObject> {
    if type_of(value) != Some("Emoji") {
        return None;
    }
    let shortcode = string_field(value, "name")?
        .trim_matches(':')
        .to_string();
    if !is_valid_shortcode(&shortcode) {
        tracing::debug!(shortcode, "Skipping emoji with invalid shortcode");
        return None;
    }
    Some(EmojiObject {
        shortcode,
        uri: string_field(value, "id"),
        icon_url: value.get("icon").and_then(url_of)?,
    })
}

/// Poll options from `oneOf`/`anyOf`, with `replies.totalItems` as tallies
pub fn parse_poll(value: &Value) -> PollObject {
    let (multiple, choices) = match (value.get("anyOf"), value.get("oneOf")) {
        (Some(Value::Array(choices)), _) => (true, choices.as_slice()),
        (_, Some(Value::Array(choices))) => (false, choices.as_slice()),
        _ => (false, &[][..]),
    };

    let options = choices
        .iter()
        .filter_map(|choice| {
            let title = string_field(choice, "name")?;
            let votes = choice
                .get("replies")
                .and_then(|replies| replies.get("totalItems"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Some((title, votes))
        })
        .collect();

    let closed_at = time_field(value, "closed").or_else(|| {
        value
            .get("closed")
            .and_then(Value::as_bool)
            .filter(|closed| *closed)
            .map(|_| Utc::now())
    });

    PollObject {
        multiple,
        options,
        voters_count: value.get("votersCount").and_then(Value::as_i64),
        expires_at: time_field(value, "endTime"),
        closed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn actor_json() -> Value {
        json!({
            "@context": [ACTIVITYSTREAMS_CONTEXT],
            "id": "https://remote.example/users/alice",
            "type": "Person",
            "preferredUsername": "alice",
            "name": "Alice",
            "summary": "<p>hi</p><script>alert(1)</script>",
            "inbox": "https://remote.example/users/alice/inbox",
            "followers": "https://remote.example/users/alice/followers",
            "endpoints": { "sharedInbox": "https://remote.example/inbox" },
            "icon": { "type": "Image", "url": "https://remote.example/avatar.png" },
            "publicKey": {
                "id": "https://remote.example/users/alice#main-key",
                "owner": "https://remote.example/users/alice",
                "publicKeyPem": "PEM"
            }
        })
    }

    #[test]
    fn parses_actor_and_sanitizes_summary() {
        let actor = ActorObject::parse(&actor_json()).unwrap();
        assert_eq!(actor.preferred_username, "alice");
        assert_eq!(actor.shared_inbox.as_deref(), Some("https://remote.example/inbox"));
        assert_eq!(actor.icon_url.as_deref(), Some("https://remote.example/avatar.png"));
        assert!(!actor.summary.unwrap().contains("script"));
    }

    #[test]
    fn emoji_with_path_like_shortcode_is_skipped() {
        let emoji = |name: &str| {
            json!({
                "type": "Emoji",
                "name": name,
                "icon": { "type": "Image", "url": "https://remote.example/emoji/x.png" }
            })
        };

        assert_eq!(parse_emoji(&emoji(":blob_cat:")).unwrap().shortcode, "blob_cat");
        assert!(parse_emoji(&emoji(":../../../escape:")).is_none());
        assert!(parse_emoji(&emoji(":a/b:")).is_none());
        assert!(parse_emoji(&emoji("::")).is_none());
    }

    #[test]
    fn actor_without_key_is_malformed() {
        let mut value = actor_json();
        value.as_object_mut().unwrap().remove("publicKey");
        let error = ActorObject::parse(&value).unwrap_err();
        assert_eq!(error.kind(), crate::error::ErrorKind::Network);
    }

    #[test]
    fn parses_question_with_tallies() {
        let value = json!({
            "id": "https://remote.example/notes/poll",
            "type": "Question",
            "attributedTo": "https://remote.example/users/alice",
            "content": "pick one",
            "oneOf": [
                { "type": "Note", "name": "yes", "replies": { "type": "Collection", "totalItems": 4 } },
                { "type": "Note", "name": "no", "replies": { "type": "Collection", "totalItems": 1 } }
            ],
            "votersCount": 5,
            "endTime": "2030-01-01T00:00:00Z"
        });
        let status = StatusObject::parse(&value).unwrap();
        let poll = status.poll.unwrap();
        assert!(!poll.multiple);
        assert_eq!(poll.options, vec![("yes".to_string(), 4), ("no".to_string(), 1)]);
        assert_eq!(poll.voters_count, Some(5));
        assert!(poll.expires_at.is_some());
    }

    #[test]
    fn parses_attachments_and_emoji_tags() {
        let value = json!({
            "id": "https://remote.example/notes/1",
            "type": "Note",
            "attributedTo": ["https://remote.example/users/alice"],
            "inReplyTo": "https://remote.example/notes/0",
            "content": "<p>hello :blobcat:</p>",
            "attachment": [
                { "type": "Document", "mediaType": "image/png", "url": "https://remote.example/a.png", "name": "alt" }
            ],
            "tag": [
                { "type": "Mention", "href": "https://remote.example/users/bob" },
                { "type": "Emoji", "name": ":blobcat:", "id": "https://remote.example/emoji/blobcat",
                  "icon": { "type": "Image", "url": "https://remote.example/blobcat.png" } }
            ]
        });
        let status = StatusObject::parse(&value).unwrap();
        assert_eq!(status.attributed_to.as_str(), "https://remote.example/users/alice");
        assert_eq!(
            status.in_reply_to.as_ref().map(Url::as_str),
            Some("https://remote.example/notes/0")
        );
        assert_eq!(status.attachments[0].description.as_deref(), Some("alt"));
        assert_eq!(status.emojis[0].shortcode, "blobcat");
    }

    #[test]
    fn visibility_follows_addressing() {
        let followers = "https://remote.example/users/alice/followers";
        assert_eq!(
            extract_visibility(&json!({ "to": [PUBLIC_AUDIENCE] }), Some(followers)),
            Visibility::Public
        );
        assert_eq!(
            extract_visibility(&json!({ "to": [followers], "cc": PUBLIC_AUDIENCE }), Some(followers)),
            Visibility::Unlisted
        );
        assert_eq!(
            extract_visibility(&json!({ "to": [followers] }), Some(followers)),
            Visibility::FollowersOnly
        );
        assert_eq!(
            extract_visibility(&json!({ "to": ["https://local.example/users/bob"] }), Some(followers)),
            Visibility::Direct
        );
    }

    #[test]
    fn iri_must_be_http() {
        assert!(parse_iri("https://remote.example/x").is_ok());
        assert!(matches!(parse_iri("ftp://remote.example/x"), Err(AppError::Validation(_))));
        assert!(matches!(parse_iri("not a url"), Err(AppError::Validation(_))));
    }
}

//! Protocol JSON for local objects served to peers

use serde_json::{Value, json};

use crate::data::{Account, Status};
use crate::federation::objects::{ACTIVITYSTREAMS_CONTEXT, PUBLIC_AUDIENCE};

const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

/// Render a local account as a Person (or Service for bots)
pub fn render_actor(account: &Account) -> Value {
    let actor_type = if account.bot { "Service" } else { "Person" };

    let mut actor = json!({
        "@context": [ACTIVITYSTREAMS_CONTEXT, SECURITY_CONTEXT],
        "id": account.uri,
        "type": actor_type,
        "preferredUsername": account.username,
        "name": account.display_name.clone().unwrap_or_default(),
        "summary": account.note.clone().unwrap_or_default(),
        "url": account.url,
        "inbox": account.inbox_uri,
        "outbox": account.outbox_uri,
        "followers": account.followers_uri,
        "following": account.following_uri,
        "manuallyApprovesFollowers": account.locked,
        "discoverable": account.discoverable,
        "publicKey": {
            "id": account.public_key_uri,
            "owner": account.uri,
            "publicKeyPem": account.public_key_pem
        }
    });

    if let Some(shared_inbox) = &account.shared_inbox_uri {
        actor["endpoints"] = json!({ "sharedInbox": shared_inbox });
    }

    actor
}

/// Render a status as a Note addressed according to its visibility
pub fn render_status(status: &Status, author: &Account) -> Value {
    let followers = author
        .followers_uri
        .clone()
        .unwrap_or_else(|| format!("{}/followers", author.uri));

    let (to, cc): (Vec<String>, Vec<String>) = match status.visibility.as_str() {
        "public" => (vec![PUBLIC_AUDIENCE.to_string()], vec![followers]),
        "unlisted" => (vec![followers], vec![PUBLIC_AUDIENCE.to_string()]),
        "private" => (vec![followers], Vec::new()),
        _ => (Vec::new(), Vec::new()),
    };

    json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "id": status.uri,
        "type": "Note",
        "attributedTo": author.uri,
        "content": status.content,
        "summary": status.content_warning,
        "sensitive": status.sensitive,
        "inReplyTo": status.in_reply_to_uri,
        "published": status.created_at.to_rfc3339(),
        "url": status.url.clone().unwrap_or_else(|| status.uri.clone()),
        "to": to,
        "cc": cc
    })
}

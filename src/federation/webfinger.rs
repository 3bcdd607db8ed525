//! WebFinger documents
//!
//! Used to discover ActivityPub actor URIs from `username@domain` handles,
//! and to answer the same question about local accounts.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;
use crate::federation::objects::ACTIVITY_JSON;

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl WebFingerResponse {
    /// The `self` link pointing at the ActivityPub actor
    ///
    /// `application/ld+json` profiles are accepted as well, as some
    /// servers only advertise that form.
    pub fn actor_uri(&self) -> Result<Url, AppError> {
        self.links
            .iter()
            .filter(|link| link.rel == "self")
            .filter(|link| {
                link.link_type.as_deref().is_some_and(|t| {
                    t == ACTIVITY_JSON || t.starts_with("application/ld+json")
                })
            })
            .find_map(|link| link.href.as_deref())
            .ok_or_else(|| {
                AppError::Federation(format!("No actor link in webfinger for {}", self.subject))
            })
            .and_then(|href| {
                Url::parse(href).map_err(|e| {
                    AppError::Federation(format!("Invalid actor link {href:?}: {e}"))
                })
            })
    }
}

/// Split an `acct:` resource (or bare handle) into `(username, domain)`
pub fn parse_resource(resource: &str) -> Result<(String, String), AppError> {
    let handle = resource.strip_prefix("acct:").unwrap_or(resource);
    let handle = handle.strip_prefix('@').unwrap_or(handle);

    match handle.split_once('@') {
        Some((username, domain))
            if !username.is_empty() && !domain.is_empty() && !domain.contains('@') =>
        {
            Ok((username.to_string(), domain.to_string()))
        }
        _ => Err(AppError::Validation(format!(
            "Unparseable handle: {resource}"
        ))),
    }
}

/// Generate WebFinger response for a local account.
///
/// # Arguments
/// * `username` - Local username
/// * `account_domain` - Domain used in handles
/// * `actor_uri` - The account's actor IRI
pub fn generate_webfinger_response(
    username: &str,
    account_domain: &str,
    actor_uri: &str,
) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, account_domain),
        aliases: Some(vec![actor_uri.to_string()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some(ACTIVITY_JSON.to_string()),
                href: Some(actor_uri.to_string()),
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(actor_uri.to_string()),
            },
        ],
    }
}

//! Transport capability
//!
//! Authenticated fetches, handle discovery and delivery. Every request is
//! made on behalf of a local actor and signed with that actor's key.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::redirect::Policy;
use serde_json::Value;
use url::Url;

use crate::config::AppConfig;
use crate::data::Database;
use crate::error::AppError;
use crate::federation::objects::ACTIVITY_JSON;
use crate::federation::signature::sign_request;
use crate::federation::webfinger::WebFingerResponse;
use crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS;

const ACCEPT_ACTIVITY: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Raw bytes of a fetched media file
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Network access used by the dereferencer
///
/// `requester` is the username of the local actor the request is made
/// for; an empty string means the instance actor.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch a protocol object by IRI
    ///
    /// # Errors
    /// - `AppError::Gone` if the remote answers 404 or 410
    /// - `AppError::Federation` if the remote is unreachable, times out,
    ///   answers with another non-2xx status or with an unparseable body
    async fn dereference(&self, requester: &str, iri: &Url) -> Result<Value, AppError>;

    /// Download a media file
    async fn fetch_media(&self, requester: &str, url: &Url) -> Result<FetchedMedia, AppError>;

    /// Discover the actor IRI for `username@domain`
    async fn finger(&self, requester: &str, username: &str, domain: &str)
    -> Result<Url, AppError>;

    /// POST an activity to a remote inbox
    async fn deliver(&self, requester: &str, inbox: &Url, activity: &Value)
    -> Result<(), AppError>;
}

/// Username of the actor that signs requests made on behalf of the node
pub fn instance_actor_username(config: &AppConfig) -> String {
    config.server.domain.clone()
}

/// Redirect hops followed before a fetch gives up
const MAX_REDIRECTS: usize = 5;

/// `reqwest`-backed transport with HTTP signatures
pub struct HttpTransport {
    client: reqwest::Client,
    db: Arc<Database>,
    instance_username: String,
    max_body_bytes: usize,
}

impl HttpTransport {
    pub fn new(config: &AppConfig, db: Arc<Database>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .user_agent(config.federation.user_agent.clone())
            .timeout(config.federation.fetch_timeout())
            .redirect(redirect_policy())
            .build()?;

        Ok(Self {
            client,
            db,
            instance_username: instance_actor_username(config),
            max_body_bytes: config.federation.max_body_bytes,
        })
    }

    /// Key ID and private key of the local actor a request is signed as
    async fn signer(&self, requester: &str) -> Result<(String, String), AppError> {
        let username = if requester.is_empty() {
            self.instance_username.as_str()
        } else {
            requester
        };

        let account = self.db.get_local_account(username).await?.ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("No local account {username:?} to sign as"))
        })?;
        let private_key_pem = account.private_key_pem.ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("Local account {username:?} has no private key"))
        })?;

        Ok((account.public_key_uri, private_key_pem))
    }

    async fn signed_get(
        &self,
        requester: &str,
        url: &Url,
        accept: &str,
    ) -> Result<reqwest::Response, AppError> {
        let (key_id, private_key_pem) = self.signer(requester).await?;
        let signed = sign_request("GET", url, None, &private_key_pem, &key_id)?;

        let _timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .start_timer();

        let response = self
            .client
            .get(url.clone())
            .header("Accept", accept)
            .header("Host", signed.host)
            .header("Date", signed.date)
            .header("Signature", signed.signature)
            .send()
            .await
            .map_err(|e| network_error(url, e))?;

        check_status(url, response)
    }
}

/// Follow redirects only within the host that was asked
///
/// Domain blocks are checked against the requested IRI, so a hop to
/// another host would bypass them. Such a response is returned as is and
/// fails the status check.
fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let same_origin = attempt.previous().first().is_some_and(|first| {
            first.host_str() == attempt.url().host_str()
                && first.port_or_known_default() == attempt.url().port_or_known_default()
        });
        if same_origin {
            attempt.follow()
        } else {
            tracing::warn!(to = %attempt.url(), "Refusing cross-host redirect");
            attempt.stop()
        }
    })
}

/// Read a response body, giving up past `limit` bytes
async fn read_body(
    url: &Url,
    mut response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, AppError> {
    let too_large = || AppError::Federation(format!("Body from {url} exceeds {limit} bytes"));

    if response.content_length().is_some_and(|length| length > limit as u64) {
        return Err(too_large());
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| network_error(url, e))? {
        if body.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn network_error(url: &Url, error: reqwest::Error) -> AppError {
    if error.is_timeout() {
        AppError::Federation(format!("Timed out fetching {url}"))
    } else {
        AppError::Federation(format!("Failed to fetch {url}: {error}"))
    }
}

fn check_status(url: &Url, response: reqwest::Response) -> Result<reqwest::Response, AppError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(AppError::Gone(url.to_string())),
        status => Err(AppError::Federation(format!(
            "{url} answered HTTP {status}"
        ))),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn dereference(&self, requester: &str, iri: &Url) -> Result<Value, AppError> {
        let response = self.signed_get(requester, iri, ACCEPT_ACTIVITY).await?;
        let body = read_body(iri, response, self.max_body_bytes).await?;
        let value = serde_json::from_slice::<Value>(&body)
            .map_err(|e| AppError::Federation(format!("Malformed body from {iri}: {e}")))?;

        tracing::debug!(iri = %iri, requester, "Dereferenced remote object");
        Ok(value)
    }

    async fn fetch_media(&self, requester: &str, url: &Url) -> Result<FetchedMedia, AppError> {
        let response = self.signed_get(requester, url, "*/*").await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = read_body(url, response, self.max_body_bytes).await?;

        Ok(FetchedMedia {
            bytes,
            content_type,
        })
    }

    async fn finger(
        &self,
        requester: &str,
        username: &str,
        domain: &str,
    ) -> Result<Url, AppError> {
        let mut url = Url::parse(&format!("https://{domain}/.well-known/webfinger"))
            .map_err(|e| AppError::Validation(format!("Invalid domain {domain:?}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("resource", &format!("acct:{username}@{domain}"));

        let response = self
            .signed_get(requester, &url, "application/jrd+json, application/json")
            .await?;
        let body = read_body(&url, response, self.max_body_bytes).await?;
        let document = serde_json::from_slice::<WebFingerResponse>(&body)
            .map_err(|e| AppError::Federation(format!("Malformed webfinger from {domain}: {e}")))?;

        document.actor_uri()
    }

    async fn deliver(&self, requester: &str, inbox: &Url, activity: &Value) -> Result<(), AppError> {
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Unserializable activity: {e}")))?;
        let (key_id, private_key_pem) = self.signer(requester).await?;
        let signed = sign_request("POST", inbox, Some(&body), &private_key_pem, &key_id)?;

        let _timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["delivery"])
            .start_timer();

        let mut request = self
            .client
            .post(inbox.clone())
            .header("Content-Type", ACTIVITY_JSON)
            .header("Host", signed.host)
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| network_error(inbox, e))?;
        check_status(inbox, response)?;

        tracing::info!(inbox = %inbox, requester, "Delivered activity");
        Ok(())
    }
}

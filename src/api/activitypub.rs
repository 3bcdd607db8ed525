//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving)
//! - Followers/Following collections

use axum::body::Bytes;
use chrono::Utc;
use axum::{
    Router,
    extract::{Path, State},
    http::{Uri, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use http::HeaderMap;
use serde_json::Value;
use url::Url;

use crate::AppState;
use crate::data::Account;
use crate::error::AppError;
use crate::federation::FederatingDatabase;
use crate::federation::federating_db::InboundContext;
use crate::federation::objects::{ACTIVITY_JSON, id_of, parse_iri};
use crate::federation::signature::{key_id_matches_actor, signature_params, verify_signature};
use crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS;

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor profile
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
}

fn activity_json(value: Value) -> Response {
    ([(header::CONTENT_TYPE, ACTIVITY_JSON)], Json(value)).into_response()
}

fn actor_url(state: &AppState, username: &str) -> Result<Url, AppError> {
    Url::parse(&format!("{}/users/{}", state.config.server.base_url(), username))
        .map_err(|e| AppError::Validation(format!("Invalid username: {e}")))
}

/// GET /users/:username
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let actor = state.federating_db.get(&actor_url(&state, &username)?).await?;
    Ok(activity_json(actor))
}

/// GET /users/:username/followers
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let collection = state
        .federating_db
        .followers(&actor_url(&state, &username)?)
        .await?;
    Ok(activity_json(collection))
}

/// GET /users/:username/following
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let collection = state
        .federating_db
        .following(&actor_url(&state, &username)?)
        .await?;
    Ok(activity_json(collection))
}

/// POST /users/:username/inbox
///
/// # Steps
/// 1. Verify HTTP Signature against the deliverer's key
/// 2. Parse activity
/// 3. Hand it to the federating store
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(), AppError> {
    let receiving = state
        .db
        .get_local_account(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    receive(&state, Some(receiving), &uri, &headers, &body).await
}

/// POST /inbox
///
/// Shared inbox for all users on this instance. Follow-up fetches are
/// signed as the instance actor.
async fn shared_inbox(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(), AppError> {
    receive(&state, None, &uri, &headers, &body).await
}

async fn receive(
    state: &AppState,
    receiving: Option<Account>,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AppError> {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    // Reject unsigned requests before parsing anything
    let params = signature_params(headers)?;

    let activity: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {e}")))?;
    let actor_id = activity
        .get("actor")
        .or_else(|| activity.get("attributedTo"))
        .and_then(id_of)
        .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?;

    if !key_id_matches_actor(&params.key_id, actor_id) {
        tracing::warn!(key_id = %params.key_id, actor = actor_id, "Signature keyId actor mismatch");
        return Err(AppError::Validation(
            "Signature keyId actor mismatch".to_string(),
        ));
    }

    // Blocked peers are refused before any key fetch
    let actor_uri = parse_iri(params.key_owner())?;
    state.blocks.ensure_uri_allowed(&actor_uri).await?;

    let requester = receiving
        .as_ref()
        .map_or("", |account| account.username.as_str());
    let handshaking = state.dereferencer.is_handshaking(requester, &actor_uri);
    let deliverer = deliverer(state, requester, &actor_uri, handshaking).await?;

    let path_and_query = uri
        .path_and_query()
        .map_or_else(|| uri.path(), |path| path.as_str());
    let verify = |public_key_pem: &str| {
        verify_signature("POST", path_and_query, headers, Some(body), public_key_pem)
    };

    let deliverer = match verify(&deliverer.public_key_pem) {
        Ok(()) => deliverer,
        Err(error) if !handshaking && key_may_have_rotated(&deliverer) => {
            tracing::info!(actor = %actor_uri, %error, "Signature did not verify, refreshing deliverer key");
            let refreshed = match state
                .dereferencer
                .refresh_account(requester, None, &deliverer)
                .await
            {
                Ok(refreshed) => refreshed,
                Err(refresh_error) => {
                    tracing::warn!(actor = %actor_uri, error = %refresh_error, "Could not refresh deliverer key");
                    return Err(error);
                }
            };
            state.db.update_account(&refreshed).await?;
            verify(&refreshed.public_key_pem)?;
            refreshed
        }
        Err(error) => return Err(error),
    };

    let ctx = InboundContext::new(deliverer, receiving);
    state.federating_db.process(&ctx, &activity).await
}

/// A stored key fetched within this many seconds is not refetched when a
/// signature fails to verify against it
const KEY_REFRESH_COOLDOWN_SECONDS: i64 = 60;

/// Whether a failed verification may be caused by a rotated key
fn key_may_have_rotated(deliverer: &Account) -> bool {
    deliverer.fetched_at.is_none_or(|fetched_at| {
        Utc::now() - fetched_at > chrono::Duration::seconds(KEY_REFRESH_COOLDOWN_SECONDS)
    })
}

/// Account whose key signed an inbound delivery
///
/// While we are still fetching that actor ourselves, the stored key is
/// used instead of starting a second fetch.
async fn deliverer(
    state: &AppState,
    requester: &str,
    actor_uri: &Url,
    handshaking: bool,
) -> Result<Account, AppError> {
    if handshaking {
        tracing::debug!(actor = %actor_uri, requester, "Deliverer is mid-handshake, using stored key");
        return state
            .db
            .get_account_by_uri(actor_uri.as_str())
            .await?
            .ok_or(AppError::Unauthorized);
    }

    state
        .dereferencer
        .resolve_account_by_uri(requester, actor_uri)
        .await
}

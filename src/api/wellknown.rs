//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::{
    Router,
    extract::{Query, State},
    response::Json,
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::domain_block::punify;
use crate::federation::webfinger::{WebFingerResponse, generate_webfinger_response, parse_resource};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for local accounts.
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Json<WebFingerResponse>, AppError> {
    let (username, domain) = parse_resource(&query.resource)?;

    let server = &state.config.server;
    let domain = punify(&domain)?;
    if domain != punify(&server.domain)? && domain != punify(server.account_domain())? {
        return Err(AppError::NotFound);
    }

    let account = state
        .db
        .get_local_account(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(Json(generate_webfinger_response(
        &account.username,
        server.account_domain(),
        &account.uri,
    )))
}

//! rustfed - the federated resolution engine of an ActivityPub node
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub inboxes, actors and collections              │
//! │  - WebFinger, metrics                                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Domain block guard                                       │
//! │  - Dereferencer (accounts, statuses, threads, media)        │
//! │  - Federating store adapter + side-effect channel           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! │  - Remote media on local disk                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub and WebFinger
//! - `federation`: domain blocks, dereferencing, the federating store
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use axum::Router;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use config::AppConfig;
use data::{Account, Database, EntityId};
use error::AppError;
use federation::side_effects::{self, SideEffectReceiver};
use federation::signature::generate_keypair;
use federation::transport::instance_actor_username;
use federation::{
    Dereferencer, DomainBlockGuard, FederatingDb, HttpTransport, RemoteMediaManager, Transport,
};

/// Largest inbound activity body accepted
const MAX_INBOX_BODY_BYTES: usize = 1024 * 1024;

/// Shared application state
///
/// Cheap to clone; every component is behind an `Arc` or is itself a
/// cloneable handle.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<Database>,
    pub transport: Arc<dyn Transport>,
    pub blocks: Arc<DomainBlockGuard>,
    pub dereferencer: Dereferencer,
    pub federating_db: Arc<FederatingDb>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Ensure the instance actor exists
    /// 3. Wire transport, media manager, block guard, dereferencer and
    ///    federating store
    ///
    /// The returned receiver is the downstream end of the side-effect
    /// channel.
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: AppConfig) -> Result<(Self, SideEffectReceiver), AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(Database::connect(&config.database.path).await?);
        Self::ensure_instance_actor(&db, &config).await?;

        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config, db.clone())?);
        let parts = Self::from_parts(config, db, transport)?;

        tracing::info!("Application state initialized successfully");
        Ok(parts)
    }

    /// Wire the engine around an existing database and transport
    pub fn from_parts(
        config: AppConfig,
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, SideEffectReceiver), AppError> {
        let media = Arc::new(RemoteMediaManager::new(
            db.clone(),
            transport.clone(),
            config.media.directory.clone(),
        ));
        let blocks = Arc::new(DomainBlockGuard::new(&config.server, db.clone())?);
        let dereferencer = Dereferencer::new(
            &config.server,
            config.federation.clone(),
            db.clone(),
            transport.clone(),
            media,
            blocks.clone(),
        )?;

        let (sender, receiver) = side_effects::channel();
        let federating_db = Arc::new(FederatingDb::new(
            &config.server,
            db.clone(),
            dereferencer.clone(),
            blocks.clone(),
            sender,
        )?);

        let state = Self {
            config: Arc::new(config),
            db,
            transport,
            blocks,
            dereferencer,
            federating_db,
        };
        Ok((state, receiver))
    }

    /// Create the actor that signs requests made on behalf of the node
    ///
    /// Generates an RSA keypair the first time.
    async fn ensure_instance_actor(db: &Database, config: &AppConfig) -> Result<(), AppError> {
        let username = instance_actor_username(config);
        if db.get_local_account(&username).await?.is_some() {
            tracing::info!(%username, "Instance actor exists");
            return Ok(());
        }

        tracing::info!(%username, "Creating instance actor...");
        let (private_key_pem, public_key_pem) = generate_keypair(2048)?;

        let base_url = config.server.base_url();
        let uri = format!("{base_url}/users/{username}");
        let now = chrono::Utc::now();
        let account = Account {
            id: EntityId::new().0,
            url: Some(uri.clone()),
            username: username.clone(),
            domain: String::new(),
            display_name: None,
            note: None,
            locked: true,
            bot: true,
            discoverable: false,
            inbox_uri: Some(format!("{uri}/inbox")),
            outbox_uri: Some(format!("{uri}/outbox")),
            shared_inbox_uri: Some(format!("{base_url}/inbox")),
            followers_uri: Some(format!("{uri}/followers")),
            following_uri: Some(format!("{uri}/following")),
            featured_uri: None,
            public_key_uri: format!("{uri}#main-key"),
            public_key_pem,
            private_key_pem: Some(private_key_pem),
            avatar_remote_url: None,
            avatar_media_id: None,
            header_remote_url: None,
            header_media_id: None,
            created_at: now,
            updated_at: now,
            fetched_at: None,
            uri,
        };
        db.insert_account(&account).await?;

        tracing::info!(uri = %account.uri, "Instance actor created");
        Ok(())
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(RequestBodyLimitLayer::new(MAX_INBOX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}

//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustfed::config;
use rustfed::data::{Account, Database, EntityId};
use rustfed::error::AppError;
use rustfed::federation::objects::ACTIVITY_JSON;
use rustfed::federation::signature::{generate_keypair, sign_request};
use rustfed::federation::transport::{FetchedMedia, Transport};
use rustfed::federation::SideEffectReceiver;
use rustfed::AppState;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use url::Url;

/// Remote network as seen by the server under test
///
/// Serves registered actor documents and records outbound deliveries.
#[derive(Default)]
pub struct FakeTransport {
    objects: Mutex<HashMap<String, Value>>,
    fetches: Mutex<Vec<String>>,
    delivered: Mutex<Vec<(String, Value)>>,
}

impl FakeTransport {
    pub fn serve(&self, iri: &str, document: Value) {
        self.objects.lock().unwrap().insert(iri.to_string(), document);
    }

    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<(String, Value)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn dereference(&self, _requester: &str, iri: &Url) -> Result<Value, AppError> {
        self.fetches.lock().unwrap().push(iri.to_string());
        self.objects
            .lock()
            .unwrap()
            .get(iri.as_str())
            .cloned()
            .ok_or_else(|| AppError::Gone(iri.to_string()))
    }

    async fn fetch_media(&self, _requester: &str, url: &Url) -> Result<FetchedMedia, AppError> {
        Err(AppError::Gone(url.to_string()))
    }

    async fn finger(
        &self,
        _requester: &str,
        username: &str,
        domain: &str,
    ) -> Result<Url, AppError> {
        Err(AppError::Gone(format!("{username}@{domain}")))
    }

    async fn deliver(&self, _requester: &str, inbox: &Url, activity: &Value) -> Result<(), AppError> {
        self.delivered
            .lock()
            .unwrap()
            .push((inbox.to_string(), activity.clone()));
        Ok(())
    }
}

/// Remote actor holding a real signing key
pub struct RemoteActor {
    pub uri: String,
    pub key_id: String,
    pub public_key_pem: String,
    private_key_pem: String,
}

impl RemoteActor {
    pub fn new(uri: &str) -> Self {
        let (private_key_pem, public_key_pem) = generate_keypair(2048).unwrap();
        Self {
            uri: uri.to_string(),
            key_id: format!("{uri}#main-key"),
            public_key_pem,
            private_key_pem,
        }
    }

    /// Actor document served at `uri`
    pub fn document(&self) -> Value {
        let uri = &self.uri;
        let username = uri.rsplit('/').next().unwrap_or_default();
        json!({
            "@context": [
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ],
            "id": uri,
            "type": "Person",
            "preferredUsername": username,
            "name": username,
            "inbox": format!("{uri}/inbox"),
            "outbox": format!("{uri}/outbox"),
            "followers": format!("{uri}/followers"),
            "following": format!("{uri}/following"),
            "publicKey": {
                "id": self.key_id,
                "owner": uri,
                "publicKeyPem": self.public_key_pem
            }
        })
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub transport: Arc<FakeTransport>,
    pub side_effects: SideEffectReceiver,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
                domain: "localhost".to_string(),
                account_domain: None,
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig {
                path: db_path.clone(),
            },
            federation: config::FederationConfig::default(),
            media: config::MediaConfig {
                directory: temp_dir.path().join("media"),
            },
            logging: config::LoggingConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
            },
        };

        let db = Arc::new(Database::connect(&db_path).await.unwrap());
        let transport = Arc::new(FakeTransport::default());
        let (state, side_effects) =
            AppState::from_parts(config, db, transport.clone()).unwrap();

        let app = rustfed::build_router(state.clone());

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait for server to be ready
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr: addr_str,
            state,
            transport,
            side_effects,
            _temp_dir: temp_dir,
            client: reqwest::Client::new(),
        }
    }

    /// Get full URL for a path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Insert a local account
    pub async fn create_local_account(&self, username: &str) -> Account {
        let base_url = self.state.config.server.base_url();
        let uri = format!("{base_url}/users/{username}");
        let now = chrono::Utc::now();
        let account = Account {
            id: EntityId::new().0,
            url: Some(format!("{base_url}/@{username}")),
            username: username.to_string(),
            domain: String::new(),
            display_name: Some(username.to_string()),
            note: None,
            locked: false,
            bot: false,
            discoverable: true,
            inbox_uri: Some(format!("{uri}/inbox")),
            outbox_uri: Some(format!("{uri}/outbox")),
            shared_inbox_uri: Some(format!("{base_url}/inbox")),
            followers_uri: Some(format!("{uri}/followers")),
            following_uri: Some(format!("{uri}/following")),
            featured_uri: None,
            public_key_uri: format!("{uri}#main-key"),
            public_key_pem: "-----BEGIN PUBLIC KEY-----\nlocal\n-----END PUBLIC KEY-----\n"
                .to_string(),
            private_key_pem: None,
            avatar_remote_url: None,
            avatar_media_id: None,
            header_remote_url: None,
            header_media_id: None,
            created_at: now,
            updated_at: now,
            fetched_at: None,
            uri,
        };
        self.state.db.insert_account(&account).await.unwrap();
        account
    }

    /// Create a remote actor and publish its document on the fake network
    pub fn remote_actor(&self, uri: &str) -> RemoteActor {
        let actor = RemoteActor::new(uri);
        self.transport.serve(uri, actor.document());
        actor
    }

    /// POST an activity signed by `actor`
    pub async fn deliver(&self, path: &str, actor: &RemoteActor, activity: &Value) -> reqwest::Response {
        let url = Url::parse(&self.url(path)).unwrap();
        let body = serde_json::to_vec(activity).unwrap();
        let signed = sign_request(
            "POST",
            &url,
            Some(&body),
            &actor.private_key_pem,
            &actor.key_id,
        )
        .unwrap();

        self.client
            .post(url)
            .header("Content-Type", ACTIVITY_JSON)
            .header("Date", signed.date)
            .header("Digest", signed.digest.unwrap())
            .header("Signature", signed.signature)
            .body(body)
            .send()
            .await
            .unwrap()
    }
}

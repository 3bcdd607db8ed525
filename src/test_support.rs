//! Shared fixtures for unit tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use sqlx::types::Json;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use url::Url;

use crate::config::AppConfig;
use crate::config::tests::valid_config;
use crate::data::{Account, Database, EntityId, Status};
use crate::error::{AppError, ErrorKind};
use crate::federation::dereferencing::Dereferencer;
use crate::federation::domain_block::DomainBlockGuard;
use crate::federation::media::RemoteMediaManager;
use crate::federation::transport::{FetchedMedia, Transport};

pub(crate) const TEST_PUBLIC_KEY_PEM: &str =
    "-----BEGIN PUBLIC KEY-----\nMFwwDQYJKoZIhvcNAQEBBQADSwAwSAJBAL0test\n-----END PUBLIC KEY-----\n";

pub(crate) async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

pub(crate) fn remote_account(username: &str, domain: &str) -> Account {
    let now = Utc::now();
    let uri = format!("https://{domain}/users/{username}");
    Account {
        id: EntityId::new().0,
        url: Some(format!("https://{domain}/@{username}")),
        username: username.to_string(),
        domain: domain.to_string(),
        display_name: Some(username.to_string()),
        note: None,
        locked: false,
        bot: false,
        discoverable: true,
        inbox_uri: Some(format!("{uri}/inbox")),
        outbox_uri: Some(format!("{uri}/outbox")),
        shared_inbox_uri: Some(format!("https://{domain}/inbox")),
        followers_uri: Some(format!("{uri}/followers")),
        following_uri: Some(format!("{uri}/following")),
        featured_uri: None,
        public_key_uri: format!("{uri}#main-key"),
        public_key_pem: TEST_PUBLIC_KEY_PEM.to_string(),
        private_key_pem: None,
        avatar_remote_url: None,
        avatar_media_id: None,
        header_remote_url: None,
        header_media_id: None,
        created_at: now,
        updated_at: now,
        fetched_at: Some(now),
        uri,
    }
}

pub(crate) fn local_account(username: &str, host: &str) -> Account {
    let uri = format!("http://{host}/users/{username}");
    Account {
        url: Some(format!("http://{host}/@{username}")),
        domain: String::new(),
        inbox_uri: Some(format!("{uri}/inbox")),
        outbox_uri: Some(format!("{uri}/outbox")),
        shared_inbox_uri: Some(format!("http://{host}/inbox")),
        followers_uri: Some(format!("{uri}/followers")),
        following_uri: Some(format!("{uri}/following")),
        public_key_uri: format!("{uri}#main-key"),
        private_key_pem: Some("local-private-key".to_string()),
        fetched_at: None,
        uri,
        ..remote_account(username, host)
    }
}

pub(crate) fn remote_status(author: &Account, uri: &str, in_reply_to_uri: Option<&str>) -> Status {
    let now = Utc::now();
    Status {
        id: EntityId::new().0,
        uri: uri.to_string(),
        url: Some(uri.to_string()),
        content: "<p>hello</p>".to_string(),
        content_warning: None,
        sensitive: false,
        visibility: "public".to_string(),
        language: Some("en".to_string()),
        account_id: author.id.clone(),
        account_uri: author.uri.clone(),
        is_local: author.is_local(),
        in_reply_to_id: None,
        in_reply_to_uri: in_reply_to_uri.map(str::to_string),
        in_reply_to_account_id: None,
        boost_of_id: None,
        boost_of_uri: None,
        boost_of_account_id: None,
        attachment_ids: Json(Vec::new()),
        emoji_ids: Json(Vec::new()),
        created_at: now,
        updated_at: now,
        fetched_at: Some(now),
    }
}

/// Actor document as a remote server would serve it
pub(crate) fn actor_json(uri: &str, username: &str) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": uri,
        "type": "Person",
        "preferredUsername": username,
        "name": username,
        "inbox": format!("{uri}/inbox"),
        "outbox": format!("{uri}/outbox"),
        "followers": format!("{uri}/followers"),
        "following": format!("{uri}/following"),
        "publicKey": {
            "id": format!("{uri}#main-key"),
            "owner": uri,
            "publicKeyPem": TEST_PUBLIC_KEY_PEM
        }
    })
}

/// Public Note document
pub(crate) fn note_json(uri: &str, author_uri: &str, in_reply_to: Option<&str>) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": uri,
        "type": "Note",
        "attributedTo": author_uri,
        "inReplyTo": in_reply_to,
        "content": "<p>hello from afar</p>",
        "published": "2026-01-02T03:04:05Z",
        "to": ["https://www.w3.org/ns/activitystreams#Public"],
        "cc": [format!("{author_uri}/followers")]
    })
}

type FetchHook = Arc<dyn Fn(Url) -> BoxFuture<'static, ()> + Send + Sync>;

/// In-memory remote network
///
/// Serves registered documents, counts requests per URL, can hold
/// requests open until released and can run a hook inside a fetch.
#[derive(Default)]
pub(crate) struct FakeTransport {
    objects: Mutex<HashMap<String, Value>>,
    failures: Mutex<HashMap<String, ErrorKind>>,
    fingers: Mutex<HashMap<String, Url>>,
    calls: Mutex<HashMap<String, usize>>,
    delivered: Mutex<Vec<(String, Value)>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    hook: Mutex<Option<FetchHook>>,
}

impl FakeTransport {
    pub(crate) fn serve(&self, uri: &str, value: Value) {
        self.objects.lock().unwrap().insert(uri.to_string(), value);
    }

    pub(crate) fn serve_actor(&self, uri: &str, username: &str) {
        self.serve(uri, actor_json(uri, username));
    }

    pub(crate) fn fail(&self, uri: &str, kind: ErrorKind) {
        self.failures.lock().unwrap().insert(uri.to_string(), kind);
    }

    pub(crate) fn recover(&self, uri: &str) {
        self.failures.lock().unwrap().remove(uri);
    }

    pub(crate) fn register_handle(&self, username: &str, domain: &str, uri: &str) {
        self.fingers
            .lock()
            .unwrap()
            .insert(format!("{username}@{domain}"), Url::parse(uri).unwrap());
    }

    pub(crate) fn calls(&self, uri: &str) -> usize {
        self.calls.lock().unwrap().get(uri).copied().unwrap_or(0)
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub(crate) fn delivered(&self) -> Vec<(String, Value)> {
        self.delivered.lock().unwrap().clone()
    }

    /// Hold every fetch until permits are added to the returned gate
    pub(crate) fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub(crate) fn on_fetch(&self, hook: FetchHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    async fn request(&self, url: &Url) -> Result<(), AppError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default() += 1;

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.unwrap();
        }

        let hook = self.hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(url.clone()).await;
        }

        let failure = self.failures.lock().unwrap().get(url.as_str()).copied();
        match failure {
            Some(ErrorKind::NotFound) => Err(AppError::Gone(url.to_string())),
            Some(ErrorKind::Network) => Err(AppError::Federation(format!("{url} unreachable"))),
            Some(kind) => Err(AppError::Internal(anyhow::anyhow!("{kind:?} for {url}"))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn dereference(&self, _requester: &str, iri: &Url) -> Result<Value, AppError> {
        self.request(iri).await?;
        self.objects
            .lock()
            .unwrap()
            .get(iri.as_str())
            .cloned()
            .ok_or_else(|| AppError::Gone(iri.to_string()))
    }

    async fn fetch_media(&self, _requester: &str, url: &Url) -> Result<FetchedMedia, AppError> {
        self.request(url).await?;
        Ok(FetchedMedia {
            bytes: b"\x89PNG fake".to_vec(),
            content_type: "image/png".to_string(),
        })
    }

    async fn finger(
        &self,
        _requester: &str,
        username: &str,
        domain: &str,
    ) -> Result<Url, AppError> {
        let resource = Url::parse(&format!(
            "https://{domain}/.well-known/webfinger?resource=acct:{username}@{domain}"
        ))
        .unwrap();
        self.request(&resource).await?;
        self.fingers
            .lock()
            .unwrap()
            .get(&format!("{username}@{domain}"))
            .cloned()
            .ok_or_else(|| AppError::Gone(format!("{username}@{domain}")))
    }

    async fn deliver(&self, _requester: &str, inbox: &Url, activity: &Value) -> Result<(), AppError> {
        self.delivered
            .lock()
            .unwrap()
            .push((inbox.to_string(), activity.clone()));
        Ok(())
    }
}

/// Dereferencer wired to a fake network and a temporary database
pub(crate) struct TestEngine {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub transport: Arc<FakeTransport>,
    pub blocks: Arc<DomainBlockGuard>,
    pub dereferencer: Dereferencer,
    pub _temp_dir: TempDir,
}

pub(crate) async fn test_engine() -> TestEngine {
    test_engine_with(|_| {}).await
}

pub(crate) async fn test_engine_with(configure: impl FnOnce(&mut AppConfig)) -> TestEngine {
    let (db, temp_dir) = create_test_db().await;
    let db = Arc::new(db);
    let mut config = valid_config();
    config.media.directory = temp_dir.path().join("media");
    configure(&mut config);

    let transport = Arc::new(FakeTransport::default());
    let media = Arc::new(RemoteMediaManager::new(
        db.clone(),
        transport.clone(),
        config.media.directory.clone(),
    ));
    let blocks = Arc::new(DomainBlockGuard::new(&config.server, db.clone()).unwrap());
    let dereferencer = Dereferencer::new(
        &config.server,
        config.federation.clone(),
        db.clone(),
        transport.clone(),
        media,
        blocks.clone(),
    )
    .unwrap();

    TestEngine {
        config,
        db,
        transport,
        blocks,
        dereferencer,
        _temp_dir: temp_dir,
    }
}

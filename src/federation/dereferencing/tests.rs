//! Dereferencer tests against an in-memory remote network

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use url::Url;

use super::ThreadStop;
use crate::data::Emoji;
use crate::error::{AppError, ErrorKind};
use crate::federation::media::{JobStatus, MediaInfo};
use crate::test_support::{
    note_json, remote_account, remote_status, test_engine, test_engine_with,
};

const BOB: &str = "https://remote.example/users/bob";

fn url(raw: &str) -> Url {
    Url::parse(raw).unwrap()
}

fn note_uri(n: usize) -> String {
    format!("{BOB}/statuses/{n}")
}

/// Serve notes `0..len` where each replies to the next one
fn serve_reply_chain(transport: &crate::test_support::FakeTransport, len: usize) {
    for n in 0..len {
        let parent = (n + 1 < len).then(|| note_uri(n + 1));
        transport.serve(&note_uri(n), note_json(&note_uri(n), BOB, parent.as_deref()));
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// Accounts
// =============================================================================

#[tokio::test]
async fn test_concurrent_account_lookups_share_one_fetch() {
    let engine = test_engine().await;
    engine.transport.serve_actor(BOB, "bob");
    let gate = engine.transport.hold();

    let lookups = (0..8)
        .map(|_| {
            let dereferencer = engine.dereferencer.clone();
            tokio::spawn(async move { dereferencer.resolve_account_by_uri("alice", &url(BOB)).await })
        })
        .collect::<Vec<_>>();

    while engine.transport.calls(BOB) == 0 {
        tokio::task::yield_now().await;
    }
    settle().await;
    gate.add_permits(64);

    let mut ids = HashSet::new();
    for lookup in lookups {
        ids.insert(lookup.await.unwrap().unwrap().id);
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(engine.transport.calls(BOB), 1);

    let stored = engine.db.get_account_by_uri(BOB).await.unwrap().unwrap();
    assert!(ids.contains(&stored.id));
    assert_eq!(stored.domain, "remote.example");
    assert!(stored.fetched_at.is_some());
}

#[tokio::test]
async fn test_fresh_account_is_not_refetched() {
    let engine = test_engine().await;
    let account = remote_account("bob", "remote.example");
    engine.db.insert_account(&account).await.unwrap();

    let resolved = engine
        .dereferencer
        .resolve_account_by_uri("alice", &url(BOB))
        .await
        .unwrap();

    assert_eq!(resolved.id, account.id);
    assert_eq!(engine.transport.total_calls(), 0);
}

#[tokio::test]
async fn test_stale_account_is_refetched() {
    let engine = test_engine().await;
    let mut account = remote_account("bob", "remote.example");
    account.display_name = Some("Old Bob".to_string());
    account.fetched_at = Some(Utc::now() - chrono::Duration::hours(3));
    engine.db.insert_account(&account).await.unwrap();
    engine.transport.serve_actor(BOB, "bob");

    let resolved = engine
        .dereferencer
        .resolve_account_by_uri("alice", &url(BOB))
        .await
        .unwrap();

    assert_eq!(engine.transport.calls(BOB), 1);
    assert_eq!(resolved.id, account.id);
    assert_eq!(resolved.display_name.as_deref(), Some("bob"));
    assert!(resolved.fetched_at.unwrap() > account.fetched_at.unwrap());
}

#[tokio::test]
async fn test_failed_refresh_falls_back_to_stored_account() {
    let engine = test_engine().await;
    let mut account = remote_account("bob", "remote.example");
    account.fetched_at = Some(Utc::now() - chrono::Duration::days(2));
    engine.db.insert_account(&account).await.unwrap();
    engine.transport.fail(BOB, ErrorKind::Network);

    let resolved = engine
        .dereferencer
        .resolve_account_by_uri("alice", &url(BOB))
        .await
        .unwrap();

    assert_eq!(resolved.id, account.id);
    assert_eq!(resolved.public_key_pem, account.public_key_pem);
    assert_eq!(engine.transport.calls(BOB), 1);
}

#[tokio::test]
async fn test_unknown_account_reports_not_found() {
    let engine = test_engine().await;
    engine.transport.fail(BOB, ErrorKind::NotFound);

    let error = engine
        .dereferencer
        .resolve_account_by_uri("alice", &url(BOB))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::NotFound);
    assert!(engine.db.get_account_by_uri(BOB).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unreachable_unknown_account_reports_network_error() {
    let engine = test_engine().await;
    engine.transport.fail(BOB, ErrorKind::Network);

    let error = engine
        .dereferencer
        .resolve_account_by_uri("alice", &url(BOB))
        .await
        .unwrap_err();

    // Retryable, unlike a remote that answered 404/410
    assert_eq!(error.kind(), ErrorKind::Network);
    assert!(error.is_retryable());
    assert!(engine.db.get_account_by_uri(BOB).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_fetch_is_not_remembered() {
    let engine = test_engine().await;
    engine.transport.serve_actor(BOB, "bob");
    engine.transport.fail(BOB, ErrorKind::Network);

    let error = engine
        .dereferencer
        .resolve_account_by_uri("alice", &url(BOB))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Network);

    engine.transport.recover(BOB);
    let account = engine
        .dereferencer
        .resolve_account_by_uri("alice", &url(BOB))
        .await
        .unwrap();
    assert_eq!(account.uri, BOB);
    assert_eq!(engine.transport.calls(BOB), 2);
}

#[tokio::test]
async fn test_blocked_domain_is_never_fetched() {
    let engine = test_engine().await;
    engine.transport.serve_actor(BOB, "bob");
    engine.blocks.create_domain_block("remote.example").await.unwrap();

    let error = engine
        .dereferencer
        .resolve_account_by_uri("alice", &url(BOB))
        .await
        .unwrap_err();
    assert!(matches!(error, AppError::Blocked(_)));

    let error = engine
        .dereferencer
        .resolve_account_by_handle("alice", "bob", "remote.example")
        .await
        .unwrap_err();
    assert!(matches!(error, AppError::Blocked(_)));

    assert_eq!(engine.transport.total_calls(), 0);
}

#[tokio::test]
async fn test_blocked_domain_hides_stored_account() {
    let engine = test_engine().await;
    let mut account = remote_account("bob", "remote.example");
    account.fetched_at = Some(Utc::now() - chrono::Duration::days(2));
    engine.db.insert_account(&account).await.unwrap();
    engine.blocks.create_domain_block("remote.example").await.unwrap();

    let error = engine
        .dereferencer
        .resolve_account_by_uri("alice", &url(BOB))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Blocked);
}

#[tokio::test]
async fn test_actor_claiming_another_id_is_rejected() {
    let engine = test_engine().await;
    let mallory = "https://remote.example/users/mallory";
    engine
        .transport
        .serve(BOB, crate::test_support::actor_json(mallory, "mallory"));

    let error = engine
        .dereferencer
        .resolve_account_by_uri("alice", &url(BOB))
        .await
        .unwrap_err();

    assert!(matches!(error, AppError::Federation(_)));
    assert!(engine.db.get_account_by_uri(BOB).await.unwrap().is_none());
    assert!(engine.db.get_account_by_uri(mallory).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_local_account_is_not_fetched() {
    let engine = test_engine().await;

    let error = engine
        .dereferencer
        .resolve_account_by_uri("alice", &url("http://localhost/users/nobody"))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::NotFound);
    assert_eq!(engine.transport.total_calls(), 0);
}

#[tokio::test]
async fn test_account_by_handle_uses_webfinger() {
    let engine = test_engine().await;
    engine.transport.serve_actor(BOB, "bob");
    engine
        .transport
        .register_handle("bob", "remote.example", BOB);

    let account = engine
        .dereferencer
        .resolve_account_by_handle("alice", "bob", "Remote.Example")
        .await
        .unwrap();

    assert_eq!(account.uri, BOB);
    assert_eq!(account.username, "bob");
    assert_eq!(engine.transport.calls(BOB), 1);

    // Second lookup is served from storage
    let again = engine
        .dereferencer
        .resolve_account_by_handle("alice", "bob", "remote.example")
        .await
        .unwrap();
    assert_eq!(again.id, account.id);
    assert_eq!(engine.transport.calls(BOB), 1);
}

#[tokio::test]
async fn test_local_handle_is_looked_up_in_storage() {
    let engine = test_engine().await;
    let carol = crate::test_support::local_account("carol", "localhost");
    engine.db.insert_account(&carol).await.unwrap();

    let account = engine
        .dereferencer
        .resolve_account_by_handle("alice", "carol", "localhost")
        .await
        .unwrap();
    assert_eq!(account.id, carol.id);

    let error = engine
        .dereferencer
        .resolve_account_by_handle("alice", "nobody", "localhost")
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);

    let error = engine
        .dereferencer
        .resolve_account_by_handle("alice", " ", "remote.example")
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidInput);

    assert_eq!(engine.transport.total_calls(), 0);
}

#[tokio::test]
async fn test_avatar_is_fetched_with_account() {
    let engine = test_engine().await;
    let mut actor = crate::test_support::actor_json(BOB, "bob");
    actor["icon"] = json!({ "type": "Image", "url": "https://remote.example/media/bob.png" });
    engine.transport.serve(BOB, actor);

    let account = engine
        .dereferencer
        .resolve_account_by_uri("alice", &url(BOB))
        .await
        .unwrap();

    let media_id = account.avatar_media_id.expect("avatar stored");
    let media = engine.db.get_media(&media_id).await.unwrap().unwrap();
    assert_eq!(media.account_id, account.id);
    assert_eq!(
        media.remote_url.as_deref(),
        Some("https://remote.example/media/bob.png")
    );
    assert_eq!(media.content_type, "image/png");
}

#[tokio::test]
async fn test_refresh_account_does_not_store() {
    let engine = test_engine().await;
    let account = remote_account("bob", "remote.example");
    engine.db.insert_account(&account).await.unwrap();
    let mut actor = crate::test_support::actor_json(BOB, "bob");
    actor["name"] = json!("Robert");
    engine.transport.serve(BOB, actor);

    let refreshed = engine
        .dereferencer
        .refresh_account("alice", None, &account)
        .await
        .unwrap();

    assert_eq!(refreshed.id, account.id);
    assert_eq!(refreshed.display_name.as_deref(), Some("Robert"));
    let stored = engine.db.get_account_by_uri(BOB).await.unwrap().unwrap();
    assert_eq!(stored.display_name.as_deref(), Some("bob"));
}

// =============================================================================
// Handshakes
// =============================================================================

#[tokio::test]
async fn test_nested_lookup_of_same_actor_does_not_refetch() {
    let engine = test_engine().await;
    engine.transport.serve_actor(BOB, "bob");

    let nested = Arc::new(Mutex::new(None));
    let dereferencer = engine.dereferencer.clone();
    let seen = nested.clone();
    engine.transport.on_fetch(Arc::new(move |fetched: Url| {
        let dereferencer = dereferencer.clone();
        let seen = seen.clone();
        async move {
            if fetched.as_str() != BOB {
                return;
            }
            let handshaking = dereferencer.is_handshaking("alice", &fetched);
            let result = dereferencer
                .resolve_account_by_uri("alice", &fetched)
                .await
                .map(|account| account.id)
                .map_err(|error| error.kind());
            *seen.lock().unwrap() = Some((handshaking, result));
        }
        .boxed()
    }));

    let account = tokio::time::timeout(
        Duration::from_secs(5),
        engine.dereferencer.resolve_account_by_uri("alice", &url(BOB)),
    )
    .await
    .expect("nested lookup must not deadlock")
    .unwrap();

    assert_eq!(account.uri, BOB);
    assert_eq!(engine.transport.calls(BOB), 1);

    let (handshaking, result) = nested.lock().unwrap().take().unwrap();
    assert!(handshaking);
    assert_eq!(result, Err(ErrorKind::NotFound));
    assert!(!engine.dereferencer.is_handshaking("alice", &url(BOB)));
}

#[tokio::test]
async fn test_nested_lookup_of_same_status_does_not_deadlock() {
    let engine = test_engine().await;
    let note = note_uri(1);
    engine.transport.serve_actor(BOB, "bob");
    engine.transport.serve(&note, note_json(&note, BOB, None));

    let nested = Arc::new(Mutex::new(None));
    let dereferencer = engine.dereferencer.clone();
    let seen = nested.clone();
    let target = note.clone();
    engine.transport.on_fetch(Arc::new(move |fetched: Url| {
        let dereferencer = dereferencer.clone();
        let seen = seen.clone();
        let target = url(&target);
        async move {
            // Resolving the author leads back to the status being resolved
            if fetched.as_str() != BOB {
                return;
            }
            let result = dereferencer
                .resolve_status("alice", &target, false, false)
                .await
                .map(|(status, _)| status.id)
                .map_err(|error| error.kind());
            *seen.lock().unwrap() = Some(result);
        }
        .boxed()
    }));

    let (status, _) = tokio::time::timeout(
        Duration::from_secs(5),
        engine.dereferencer.resolve_status("alice", &url(&note), false, false),
    )
    .await
    .expect("nested lookup must not deadlock")
    .unwrap();

    assert_eq!(status.uri, note);
    assert_eq!(engine.transport.calls(&note), 1);
    assert_eq!(
        nested.lock().unwrap().take().unwrap(),
        Err(ErrorKind::NotFound)
    );
}

// =============================================================================
// Statuses and threads
// =============================================================================

#[tokio::test]
async fn test_status_is_stored_with_author() {
    let engine = test_engine().await;
    let note = note_uri(1);
    engine.transport.serve_actor(BOB, "bob");
    let mut object = note_json(&note, BOB, None);
    object["attachment"] = json!([{
        "type": "Document",
        "mediaType": "image/png",
        "url": "https://remote.example/media/1.png",
        "name": "a cat"
    }]);
    engine.transport.serve(&note, object);

    let (status, thread) = engine
        .dereferencer
        .resolve_status("alice", &url(&note), false, true)
        .await
        .unwrap();

    assert!(thread.is_none());
    assert!(!status.is_local);
    assert_eq!(status.visibility, "public");
    assert_eq!(status.account_uri, BOB);
    assert_eq!(status.attachment_ids.0.len(), 1);

    let media = engine
        .db
        .get_media(&status.attachment_ids.0[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(media.description.as_deref(), Some("a cat"));

    let author = engine.db.get_account_by_uri(BOB).await.unwrap().unwrap();
    assert_eq!(status.account_id, author.id);
}

#[tokio::test]
async fn test_known_status_is_not_refetched_unless_asked() {
    let engine = test_engine().await;
    let note = note_uri(1);
    engine.transport.serve_actor(BOB, "bob");
    engine.transport.serve(&note, note_json(&note, BOB, None));

    let (first, _) = engine
        .dereferencer
        .resolve_status("alice", &url(&note), false, false)
        .await
        .unwrap();
    let (second, _) = engine
        .dereferencer
        .resolve_status("alice", &url(&note), false, false)
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(engine.transport.calls(&note), 1);

    let (third, _) = engine
        .dereferencer
        .resolve_status("alice", &url(&note), true, false)
        .await
        .unwrap();
    assert_eq!(third.id, first.id);
    assert_eq!(engine.transport.calls(&note), 2);
}

#[tokio::test]
async fn test_enrich_remote_status_refetches_and_links_parent() {
    let engine = test_engine().await;
    engine.transport.serve_actor(BOB, "bob");
    serve_reply_chain(&engine.transport, 2);

    let (reply, _) = engine
        .dereferencer
        .resolve_status("alice", &url(&note_uri(0)), false, false)
        .await
        .unwrap();
    assert!(reply.has_unresolved_parent());

    let (enriched, thread) = engine
        .dereferencer
        .enrich_remote_status("alice", &reply, true)
        .await
        .unwrap();
    assert_eq!(enriched.id, reply.id);
    assert_eq!(engine.transport.calls(&note_uri(0)), 2);

    let thread = thread.expect("reply should walk its thread");
    assert_eq!(thread.stop, ThreadStop::ReachedRoot);
    assert_eq!(thread.ancestors.len(), 1);
    assert_eq!(thread.ancestors[0].uri, note_uri(1));
}

#[tokio::test]
async fn test_enrich_local_status_is_a_no_op() {
    let engine = test_engine().await;
    let author = remote_account("alice", "localhost");
    let mut status = remote_status(&author, "http://localhost/users/alice/statuses/1", None);
    status.is_local = true;

    let (same, thread) = engine
        .dereferencer
        .enrich_remote_status("alice", &status, true)
        .await
        .unwrap();
    assert_eq!(same, status);
    assert!(thread.is_none());
    assert_eq!(engine.transport.total_calls(), 0);
}

#[tokio::test]
async fn test_status_attributed_to_another_host_is_rejected() {
    let engine = test_engine().await;
    let note = note_uri(1);
    let eve = "https://other.example/users/eve";
    engine.transport.serve_actor(eve, "eve");
    engine.transport.serve(&note, note_json(&note, eve, None));

    let error = engine
        .dereferencer
        .resolve_status("alice", &url(&note), false, false)
        .await
        .unwrap_err();

    assert!(matches!(error, AppError::Federation(_)));
    assert_eq!(engine.transport.calls(eve), 0);
    assert!(engine.db.get_status_by_uri(&note).await.unwrap().is_none());
}

#[tokio::test]
async fn test_prefetched_status_is_not_fetched_again() {
    let engine = test_engine().await;
    engine
        .db
        .insert_account(&remote_account("bob", "remote.example"))
        .await
        .unwrap();
    let note = note_uri(1);

    let (status, _) = engine
        .dereferencer
        .resolve_status_with_object("alice", note_json(&note, BOB, None), false)
        .await
        .unwrap();

    assert_eq!(status.uri, note);
    assert_eq!(engine.transport.total_calls(), 0);
}

#[tokio::test]
async fn test_reply_chain_is_walked_and_linked() {
    let engine = test_engine().await;
    engine.transport.serve_actor(BOB, "bob");
    serve_reply_chain(&engine.transport, 5);

    let (status, thread) = engine
        .dereferencer
        .resolve_status("alice", &url(&note_uri(0)), false, true)
        .await
        .unwrap();

    let thread = thread.unwrap();
    assert_eq!(thread.stop, ThreadStop::ReachedRoot);
    assert_eq!(
        thread
            .ancestors
            .iter()
            .map(|ancestor| ancestor.uri.clone())
            .collect::<Vec<_>>(),
        (1..5).map(note_uri).collect::<Vec<_>>()
    );
    assert_eq!(status.in_reply_to_id.as_deref(), Some(thread.ancestors[0].id.as_str()));

    for n in 0..4 {
        let child = engine.db.get_status_by_uri(&note_uri(n)).await.unwrap().unwrap();
        let parent = engine.db.get_status_by_uri(&note_uri(n + 1)).await.unwrap().unwrap();
        assert_eq!(child.in_reply_to_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(engine.transport.calls(&note_uri(n)), 1);
    }
}

#[tokio::test]
async fn test_reply_chain_stops_at_max_depth() {
    let engine = test_engine_with(|config| config.federation.max_thread_depth = 2).await;
    engine.transport.serve_actor(BOB, "bob");
    serve_reply_chain(&engine.transport, 6);

    let (_, thread) = engine
        .dereferencer
        .resolve_status("alice", &url(&note_uri(0)), false, true)
        .await
        .unwrap();

    let thread = thread.unwrap();
    assert_eq!(thread.stop, ThreadStop::MaxDepth);
    assert_eq!(thread.ancestors.len(), 2);
    assert_eq!(engine.transport.calls(&note_uri(3)), 0);
}

#[tokio::test]
async fn test_reply_cycle_terminates() {
    let engine = test_engine().await;
    engine.transport.serve_actor(BOB, "bob");
    let (a, b, c) = (note_uri(1), note_uri(2), note_uri(3));
    engine.transport.serve(&a, note_json(&a, BOB, Some(&b)));
    engine.transport.serve(&b, note_json(&b, BOB, Some(&c)));
    engine.transport.serve(&c, note_json(&c, BOB, Some(&a)));

    let (_, thread) = tokio::time::timeout(
        Duration::from_secs(5),
        engine.dereferencer.resolve_status("alice", &url(&a), false, true),
    )
    .await
    .expect("cycle must terminate")
    .unwrap();

    let thread = thread.unwrap();
    assert_eq!(thread.stop, ThreadStop::Cycle);
    assert_eq!(thread.ancestors.len(), 2);
    for uri in [&a, &b, &c] {
        assert_eq!(engine.transport.calls(uri), 1);
    }

    let last = engine.db.get_status_by_uri(&c).await.unwrap().unwrap();
    assert!(last.in_reply_to_id.is_none());
}

#[tokio::test]
async fn test_status_is_never_linked_under_its_own_reply() {
    let engine = test_engine().await;
    let bob = remote_account("bob", "remote.example");
    engine.db.insert_account(&bob).await.unwrap();

    let x = remote_status(&bob, &note_uri(1), Some(&note_uri(2)));
    let mut y = remote_status(&bob, &note_uri(2), Some(&note_uri(1)));
    y.in_reply_to_id = Some(x.id.clone());
    engine.db.insert_status(&x).await.unwrap();
    engine.db.insert_status(&y).await.unwrap();

    let thread = engine.dereferencer.resolve_thread("alice", &x).await;

    assert_eq!(thread.stop, ThreadStop::Cycle);
    assert!(thread.ancestors.is_empty());
    let stored = engine.db.get_status_by_id(&x.id).await.unwrap().unwrap();
    assert!(stored.in_reply_to_id.is_none());
    assert_eq!(engine.transport.total_calls(), 0);
}

#[tokio::test]
async fn test_reply_chain_stops_at_known_ancestor() {
    let engine = test_engine().await;
    let bob = remote_account("bob", "remote.example");
    engine.db.insert_account(&bob).await.unwrap();

    let root = remote_status(&bob, &note_uri(3), None);
    let mut parent = remote_status(&bob, &note_uri(2), Some(&note_uri(3)));
    parent.in_reply_to_id = Some(root.id.clone());
    engine.db.insert_status(&root).await.unwrap();
    engine.db.insert_status(&parent).await.unwrap();

    let reply = note_uri(1);
    engine
        .transport
        .serve(&reply, note_json(&reply, BOB, Some(&note_uri(2))));

    let (status, thread) = engine
        .dereferencer
        .resolve_status("alice", &url(&reply), false, true)
        .await
        .unwrap();

    let thread = thread.unwrap();
    assert_eq!(thread.stop, ThreadStop::KnownAncestor);
    assert_eq!(thread.ancestors.len(), 1);
    assert_eq!(status.in_reply_to_id.as_deref(), Some(parent.id.as_str()));
    assert_eq!(engine.transport.calls(&note_uri(2)), 0);
    assert_eq!(engine.transport.calls(&note_uri(3)), 0);
}

#[tokio::test]
async fn test_unreachable_parent_keeps_the_reply() {
    let engine = test_engine().await;
    engine.transport.serve_actor(BOB, "bob");
    let (reply, parent) = (note_uri(1), note_uri(2));
    engine
        .transport
        .serve(&reply, note_json(&reply, BOB, Some(&parent)));
    engine.transport.fail(&parent, ErrorKind::Network);

    let (status, thread) = engine
        .dereferencer
        .resolve_status("alice", &url(&reply), false, true)
        .await
        .unwrap();

    assert_eq!(thread.unwrap().stop, ThreadStop::Failed(ErrorKind::Network));
    assert!(status.has_unresolved_parent());
    assert!(engine.db.get_status_by_uri(&reply).await.unwrap().is_some());
}

#[tokio::test]
async fn test_announce_resolves_boosted_status_without_storing_boost() {
    let engine = test_engine().await;
    let bob = remote_account("bob", "remote.example");
    engine.db.insert_account(&bob).await.unwrap();
    let note = note_uri(1);
    engine.transport.serve(&note, note_json(&note, BOB, None));

    let mut boost = remote_status(&bob, &format!("{BOB}/statuses/9/activity"), None);
    boost.boost_of_uri = Some(note.clone());

    let resolved = engine
        .dereferencer
        .resolve_announce("alice", &boost)
        .await
        .unwrap();

    let boosted = engine.db.get_status_by_uri(&note).await.unwrap().unwrap();
    assert_eq!(resolved.boost_of_id.as_deref(), Some(boosted.id.as_str()));
    assert_eq!(resolved.boost_of_account_id.as_deref(), Some(bob.id.as_str()));
    assert!(engine.db.get_status_by_uri(&boost.uri).await.unwrap().is_none());

    let plain = remote_status(&bob, &note_uri(5), None);
    let error = engine
        .dereferencer
        .resolve_announce("alice", &plain)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidInput);
}

// =============================================================================
// Media and emoji
// =============================================================================

#[tokio::test]
async fn test_concurrent_media_requests_share_one_job() {
    let engine = test_engine().await;
    let remote = "https://remote.example/media/cat.png";
    let gate = engine.transport.hold();

    let first = engine
        .dereferencer
        .resolve_remote_media("alice", "owner", remote, MediaInfo::default())
        .await
        .unwrap();
    let second = engine
        .dereferencer
        .resolve_remote_media("alice", "owner", remote, MediaInfo::default())
        .await
        .unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(first.status(), JobStatus::Processing);

    gate.add_permits(8);
    let media = first.load().await.unwrap();
    assert_eq!(second.load().await.unwrap().id, media.id);
    assert_eq!(first.status(), JobStatus::Complete);
    assert_eq!(engine.transport.calls(remote), 1);
    assert!(engine.db.get_media(&media.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_media_from_blocked_domain_is_refused() {
    let engine = test_engine().await;
    engine.blocks.create_domain_block("evil.example").await.unwrap();

    let error = engine
        .dereferencer
        .resolve_remote_media("alice", "owner", "https://cdn.evil.example/x.png", MediaInfo::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Blocked);

    let error = engine
        .dereferencer
        .resolve_remote_media("alice", "owner", "not a url", MediaInfo::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidInput);
    assert_eq!(engine.transport.total_calls(), 0);
}

#[tokio::test]
async fn test_known_emoji_is_reused_unless_refreshed() {
    let engine = test_engine().await;
    let image = "https://remote.example/emoji/blob.png";
    let now = Utc::now();
    let stored = engine
        .db
        .upsert_emoji(&Emoji {
            id: "01EMOJI".to_string(),
            shortcode: "blob".to_string(),
            domain: "remote.example".to_string(),
            uri: "https://remote.example/emoji/1".to_string(),
            image_remote_url: Some(image.to_string()),
            file_path: "/tmp/blob.png".to_string(),
            content_type: "image/png".to_string(),
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

    let job = engine
        .dereferencer
        .resolve_remote_emoji("alice", "blob", "remote.example", image, None, false)
        .await
        .unwrap();
    assert_eq!(job.status(), JobStatus::Complete);
    assert_eq!(job.load().await.unwrap().id, stored.id);
    assert_eq!(engine.transport.total_calls(), 0);

    let job = engine
        .dereferencer
        .resolve_remote_emoji("alice", "blob", "remote.example", image, None, true)
        .await
        .unwrap();
    let refreshed = job.load().await.unwrap();
    assert_eq!(refreshed.id, stored.id);
    assert_eq!(engine.transport.calls(image), 1);
}

#[tokio::test]
async fn test_emoji_with_path_like_shortcode_is_refused() {
    let engine = test_engine().await;
    let image = "https://remote.example/emoji/escape.png";

    for shortcode in ["../../../escape", "a/b", "blob.png", ""] {
        let error = engine
            .dereferencer
            .resolve_remote_emoji("alice", shortcode, "remote.example", image, None, false)
            .await
            .err()
            .expect("shortcode should be refused");
        assert_eq!(error.kind(), ErrorKind::InvalidInput);
    }
    assert_eq!(engine.transport.total_calls(), 0);
}

#[tokio::test]
async fn test_emoji_file_stays_inside_media_directory() {
    let engine = test_engine().await;
    let image = "https://remote.example/emoji/blob_cat.png";

    let job = engine
        .dereferencer
        .resolve_remote_emoji("alice", "blob_cat", "remote.example", image, None, false)
        .await
        .unwrap();
    let emoji = job.load().await.unwrap();

    let path = std::path::Path::new(&emoji.file_path);
    assert!(path.starts_with(&engine.config.media.directory));
    assert_eq!(
        path.file_stem().and_then(|stem| stem.to_str()),
        Some(emoji.id.as_str())
    );
    assert!(path.exists());
}

// =============================================================================
// Instances
// =============================================================================

#[tokio::test]
async fn test_instance_falls_back_to_nodeinfo() {
    let engine = test_engine().await;
    engine.transport.serve(
        "https://remote.example/.well-known/nodeinfo",
        json!({ "links": [{
            "rel": "http://nodeinfo.diaspora.software/ns/schema/2.1",
            "href": "https://remote.example/nodeinfo/2.1"
        }]}),
    );
    engine.transport.serve(
        "https://remote.example/nodeinfo/2.1",
        json!({
            "software": { "name": "pleroma", "version": "2.6.0" },
            "metadata": { "nodeName": "Remote Town" }
        }),
    );

    let instance = engine
        .dereferencer
        .resolve_instance("alice", &url(BOB))
        .await
        .unwrap();

    assert_eq!(instance.domain, "remote.example");
    assert_eq!(instance.version.as_deref(), Some("pleroma 2.6.0"));
    assert_eq!(instance.title.as_deref(), Some("Remote Town"));
    assert_eq!(
        engine.transport.calls("https://remote.example/api/v1/instance"),
        1
    );

    let calls = engine.transport.total_calls();
    let again = engine
        .dereferencer
        .resolve_instance("alice", &url(BOB))
        .await
        .unwrap();
    assert_eq!(again.id, instance.id);
    assert_eq!(engine.transport.total_calls(), calls);
}

#[tokio::test]
async fn test_own_instance_is_not_resolved() {
    let engine = test_engine().await;

    let error = engine
        .dereferencer
        .resolve_instance("alice", &url("http://localhost/users/alice"))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::InvalidInput);
    assert_eq!(engine.transport.total_calls(), 0);
}

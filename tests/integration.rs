// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for the Replicator
//!
//! Every test runs a real `Puller` or `Pusher` over HTTP against a
//! wiremock server playing the remote database.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//!
//! # Run specific test
//! cargo test --test integration pull_
//! ```
//!
//! # Test Organization
//! - `pull_*` - change feed, revision fetches, local inserts
//! - `push_*` - `_revs_diff`, uploads, rejections
//! - `checkpoint_*` - remote checkpoint saves and conflicts
//! - `session_*` - cookie login before replicating

mod common;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use common::{change, init_tracing, json_response, not_found, wait_stopped, TestRemote, SYNC_GATEWAY};
use couch_replicator::{
    Authenticator, LocalStore, MemoryStore, Puller, Pusher, ReplicationConfig, SessionAuthenticator,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header_regex, method, path, path_regex, query_param};
use wiremock::{Mock, ResponseTemplate};

// =============================================================================
// Pull Tests
// =============================================================================

#[tokio::test]
async fn pull_one_shot_inserts_and_checkpoints() {
    init_tracing();
    let remote = TestRemote::start().await;
    remote.without_checkpoint().await;
    remote.accept_checkpoint_saves().await;
    remote
        .changes("GET", json!([change(1, "doc1", "1-abc")]), json!(1))
        .await;
    Mock::given(method("GET"))
        .and(path("/db/doc1"))
        .and(query_param("rev", "1-abc"))
        .and(query_param("revs", "true"))
        .respond_with(json_response(
            200,
            json!({"_id": "doc1", "_rev": "1-abc", "title": "hi", "_revisions": {"start": 1, "ids": ["abc"]}}),
        ))
        .expect(1)
        .mount(&remote.server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let puller = Puller::connect(Arc::clone(&store) as Arc<dyn LocalStore>, remote.config(), None).unwrap();
    puller.start().unwrap();
    wait_stopped(&puller).await;

    let doc = store.get_revision("doc1", "1-abc").expect("pulled revision");
    assert_eq!(doc.properties.unwrap()["title"], json!("hi"));
    assert!(puller.last_error().is_none());
    assert_eq!(puller.last_sequence().as_deref(), Some("1"));

    let saves = remote.checkpoint_saves().await;
    assert_eq!(saves.last().unwrap()["lastSequence"], json!("1"));
    let local = store
        .last_sequence_with_checkpoint_id(puller.checkpoint_id(), false)
        .await
        .unwrap();
    assert_eq!(local.as_deref(), Some("1"));
}

#[tokio::test]
async fn pull_first_generations_via_all_docs() {
    init_tracing();
    let remote = TestRemote::start().await;
    remote.without_checkpoint().await;
    remote.accept_checkpoint_saves().await;
    remote
        .changes(
            "GET",
            json!([change(1, "a", "1-aa"), change(2, "b", "1-bb")]),
            json!(2),
        )
        .await;
    Mock::given(method("POST"))
        .and(path("/db/_all_docs"))
        .and(query_param("include_docs", "true"))
        .and(body_partial_json(json!({"keys": ["a", "b"]})))
        .respond_with(json_response(
            200,
            json!({"rows": [
                {"id": "a", "key": "a", "value": {"rev": "1-aa"}, "doc": {"_id": "a", "_rev": "1-aa", "n": 1}},
                {"id": "b", "key": "b", "value": {"rev": "1-bb"}, "doc": {"_id": "b", "_rev": "1-bb", "n": 2}}
            ]}),
        ))
        .expect(1)
        .mount(&remote.server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let puller = Puller::connect(Arc::clone(&store) as Arc<dyn LocalStore>, remote.config(), None).unwrap();
    puller.start().unwrap();
    wait_stopped(&puller).await;

    assert_eq!(store.document_count(), 2);
    assert_eq!(puller.last_sequence().as_deref(), Some("2"));
    assert!(remote.requests_to("GET", "/db/a").await.is_empty());
}

#[tokio::test]
async fn pull_uses_bulk_get_on_sync_gateway() {
    init_tracing();
    let remote = TestRemote::start().await;
    remote.with_sync_gateway_checkpoint("0").await;
    remote.accept_checkpoint_saves().await;
    // Sync Gateway 0.93 and later take the feed options as a POST body.
    remote
        .changes(
            "POST",
            json!([change(1, "a", "2-aa"), change(2, "b", "1-bb")]),
            json!("2"),
        )
        .await;
    Mock::given(method("POST"))
        .and(path("/db/_bulk_get"))
        .respond_with(json_response(
            200,
            json!({"results": [
                {"id": "a", "docs": [{"ok": {"_id": "a", "_rev": "2-aa", "_revisions": {"start": 2, "ids": ["aa", "a0"]}}}]},
                {"id": "b", "docs": [{"ok": {"_id": "b", "_rev": "1-bb", "_revisions": {"start": 1, "ids": ["bb"]}}}]}
            ]}),
        ))
        .expect(1)
        .mount(&remote.server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let puller = Puller::connect(Arc::clone(&store) as Arc<dyn LocalStore>, remote.config(), None).unwrap();
    puller.start().unwrap();
    wait_stopped(&puller).await;

    assert!(puller.last_error().is_none());
    assert!(store.get_revision("a", "2-aa").is_some());
    assert!(store.get_revision("b", "1-bb").is_some());
    assert_eq!(puller.last_sequence().as_deref(), Some("2"));

    let changes = remote.requests_to("POST", "/db/_changes").await;
    let body: Value = serde_json::from_slice(&changes[0].body).unwrap();
    assert_eq!(body["style"], json!("all_docs"));
    assert_eq!(body["feed"], json!("normal"));
}

#[tokio::test]
async fn pull_unauthorized_change_feed_stops_with_error() {
    let remote = TestRemote::start().await;
    remote.without_checkpoint().await;
    Mock::given(method("GET"))
        .and(path("/db/_changes"))
        .respond_with(json_response(401, json!({"error": "unauthorized", "reason": "login required"})))
        .mount(&remote.server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let puller = Puller::connect(store, remote.config(), None).unwrap();
    puller.start().unwrap();
    wait_stopped(&puller).await;

    let error = puller.last_error().expect("error recorded");
    assert!(error.is_http_status(401));
    assert_eq!(puller.last_sequence(), None);
}

// =============================================================================
// Push Tests
// =============================================================================

#[tokio::test]
async fn push_one_shot_uploads_missing_revisions() {
    init_tracing();
    let remote = TestRemote::start().await;
    remote.without_checkpoint().await;
    remote.accept_checkpoint_saves().await;

    let store = Arc::new(MemoryStore::new());
    let a = store.put("a", json!({"n": 1}), None).unwrap();
    let b = store.put("b", json!({"n": 2}), None).unwrap();

    // The remote already has "b".
    Mock::given(method("POST"))
        .and(path("/db/_revs_diff"))
        .respond_with(json_response(200, json!({"a": {"missing": [&a.rev_id]}})))
        .expect(1)
        .mount(&remote.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/db/_bulk_docs"))
        .respond_with(json_response(201, json!([{"id": "a", "rev": &a.rev_id}])))
        .expect(1)
        .mount(&remote.server)
        .await;

    let pusher = Pusher::connect(Arc::clone(&store) as Arc<dyn LocalStore>, remote.config(), None).unwrap();
    pusher.start().unwrap();
    wait_stopped(&pusher).await;

    assert!(pusher.last_error().is_none());
    assert_eq!(pusher.pending_count(), 0);
    assert_eq!(pusher.last_sequence().as_deref(), Some("2"));

    let diff = remote.requests_to("POST", "/db/_revs_diff").await;
    let diff: Value = serde_json::from_slice(&diff[0].body).unwrap();
    assert_eq!(diff, json!({"a": [&a.rev_id], "b": [&b.rev_id]}));

    let bulk = remote.requests_to("POST", "/db/_bulk_docs").await;
    let bulk: Value = serde_json::from_slice(&bulk[0].body).unwrap();
    assert_eq!(bulk["new_edits"], json!(false));
    let docs = bulk["docs"].as_array().unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["_id"], json!("a"));
    assert_eq!(docs[0]["_revisions"]["start"], json!(1));
}

#[tokio::test]
async fn push_creates_target_when_asked() {
    let remote = TestRemote::start().await;
    remote.without_checkpoint().await;
    Mock::given(method("PUT"))
        .and(path("/db/"))
        .respond_with(json_response(412, json!({"error": "file_exists"})))
        .expect(1)
        .mount(&remote.server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let config = ReplicationConfig {
        create_target: true,
        ..remote.config()
    };
    let pusher = Pusher::connect(store, config, None).unwrap();
    pusher.start().unwrap();
    wait_stopped(&pusher).await;

    // An existing database is not an error.
    assert!(pusher.last_error().is_none());
}

#[tokio::test]
async fn push_rejected_revision_still_advances_checkpoint() {
    let remote = TestRemote::start().await;
    remote.without_checkpoint().await;
    remote.accept_checkpoint_saves().await;

    let store = Arc::new(MemoryStore::new());
    let a = store.put("a", json!({}), None).unwrap();
    Mock::given(method("POST"))
        .and(path("/db/_revs_diff"))
        .respond_with(json_response(200, json!({"a": {"missing": [&a.rev_id]}})))
        .mount(&remote.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/db/_bulk_docs"))
        .respond_with(json_response(
            201,
            json!([{"id": "a", "error": "forbidden", "reason": "no access", "status": 403}]),
        ))
        .mount(&remote.server)
        .await;

    let pusher = Pusher::connect(Arc::clone(&store) as Arc<dyn LocalStore>, remote.config(), None).unwrap();
    pusher.start().unwrap();
    wait_stopped(&pusher).await;

    assert!(pusher.last_error().is_none());
    assert_eq!(pusher.last_sequence().as_deref(), Some("1"));
}

#[tokio::test]
async fn push_multipart_falls_back_after_415() {
    init_tracing();
    let remote = TestRemote::start().await;
    remote.without_checkpoint().await;
    remote.accept_checkpoint_saves().await;

    let store = Arc::new(MemoryStore::new());
    let attachment = |text: &str| {
        json!({"_attachments": {"a.txt": {"content_type": "text/plain", "data": BASE64.encode(text)}}})
    };
    let first = store.put("first", attachment("one"), None).unwrap();
    let second = store.put("second", attachment("two"), None).unwrap();

    Mock::given(method("POST"))
        .and(path("/db/_revs_diff"))
        .respond_with(json_response(
            200,
            json!({
                "first": {"missing": [&first.rev_id]},
                "second": {"missing": [&second.rev_id]}
            }),
        ))
        .mount(&remote.server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/db/(first|second)$"))
        .and(header_regex("content-type", "^multipart/related"))
        .respond_with(json_response(415, json!({"error": "unsupported_media_type"})))
        .with_priority(1)
        .mount(&remote.server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/db/(first|second)$"))
        .respond_with(json_response(201, json!({"ok": true})))
        .mount(&remote.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/db/_bulk_docs"))
        .respond_with(json_response(201, json!([])))
        .mount(&remote.server)
        .await;

    let pusher = Pusher::connect(Arc::clone(&store) as Arc<dyn LocalStore>, remote.config(), None).unwrap();
    pusher.start().unwrap();
    wait_stopped(&pusher).await;

    assert!(pusher.last_error().is_none());
    assert!(pusher.sends_json_only());
    assert_eq!(pusher.pending_count(), 0);
    assert_eq!(pusher.last_sequence().as_deref(), Some("2"));

    // One multipart attempt, retried as JSON; nothing after it is multipart.
    let puts = remote.requests_to("PUT", "/db/first").await;
    let kinds: Vec<bool> = puts
        .iter()
        .map(|r| {
            r.headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.starts_with("multipart/"))
        })
        .collect();
    assert_eq!(kinds, vec![true, false]);
    let retried: Value = serde_json::from_slice(&puts[1].body).unwrap();
    assert_eq!(retried["_attachments"]["a.txt"]["data"], json!(BASE64.encode("one")));
    assert!(remote.requests_to("PUT", "/db/second").await.is_empty());

    let bulk = remote.requests_to("POST", "/db/_bulk_docs").await;
    let bulk: Value = serde_json::from_slice(&bulk[0].body).unwrap();
    assert_eq!(bulk["docs"][0]["_id"], json!("second"));
    assert_eq!(bulk["docs"][0]["_attachments"]["a.txt"]["data"], json!(BASE64.encode("two")));
}

// =============================================================================
// Checkpoint Tests
// =============================================================================

#[tokio::test]
async fn checkpoint_conflict_refreshes_revision() {
    init_tracing();
    let remote = TestRemote::start().await;
    // Missing at startup, then someone else writes it before our save.
    Mock::given(method("GET"))
        .and(path_regex(r"^/db/_local/.+$"))
        .respond_with(not_found())
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&remote.server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/db/_local/.+$"))
        .respond_with(json_response(200, json!({"_rev": "0-7", "lastSequence": "0"})))
        .mount(&remote.server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/db/_local/.+$"))
        .respond_with(json_response(409, json!({"error": "conflict"})))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&remote.server)
        .await;
    remote.accept_checkpoint_saves().await;

    let store = Arc::new(MemoryStore::new());
    let a = store.put("a", json!({}), None).unwrap();
    Mock::given(method("POST"))
        .and(path("/db/_revs_diff"))
        .respond_with(json_response(200, json!({"a": {"missing": [&a.rev_id]}})))
        .mount(&remote.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/db/_bulk_docs"))
        .respond_with(json_response(201, json!([])))
        .mount(&remote.server)
        .await;

    let pusher = Pusher::connect(Arc::clone(&store) as Arc<dyn LocalStore>, remote.config(), None).unwrap();
    pusher.start().unwrap();
    wait_stopped(&pusher).await;

    // The retried save may still be in flight when Stopped is published.
    let mut saves = remote.checkpoint_saves().await;
    for _ in 0..100 {
        if saves.last().is_some_and(|s| s.get("_rev").is_some()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        saves = remote.checkpoint_saves().await;
    }
    assert!(saves.len() >= 2, "expected a retried save, got {saves:?}");
    assert!(saves[0].get("_rev").is_none());
    let last = saves.last().unwrap();
    assert_eq!(last["_rev"], json!("0-7"));
    assert_eq!(last["lastSequence"], json!("1"));
}

#[tokio::test]
async fn checkpoint_resumes_when_remote_matches_local() {
    let remote = TestRemote::start().await;
    let store = Arc::new(MemoryStore::new());
    let config = remote.config();
    let probe = Puller::connect(Arc::clone(&store) as Arc<dyn LocalStore>, config.clone(), None).unwrap();
    store
        .set_last_sequence("7", probe.checkpoint_id(), false)
        .await
        .unwrap();
    drop(probe);

    Mock::given(method("GET"))
        .and(path_regex(r"^/db/_local/.+$"))
        .respond_with(json_response(200, json!({"_rev": "0-3", "lastSequence": "7"})))
        .mount(&remote.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/db/_changes"))
        .and(query_param("since", "7"))
        .respond_with(json_response(200, json!({"results": [], "last_seq": 7})))
        .expect(1)
        .mount(&remote.server)
        .await;

    let puller = Puller::connect(store, config, None).unwrap();
    puller.start().unwrap();
    wait_stopped(&puller).await;

    assert_eq!(puller.last_sequence().as_deref(), Some("7"));
}

// =============================================================================
// Session Tests
// =============================================================================

#[tokio::test]
async fn session_login_precedes_replication() {
    let remote = TestRemote::start().await;
    remote.without_checkpoint().await;
    remote.changes("GET", json!([]), json!(0)).await;
    Mock::given(method("GET"))
        .and(path("/db/_session"))
        .respond_with(json_response(200, json!({"ok": true, "userCtx": {"name": null}})))
        .mount(&remote.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/db/_session"))
        .and(body_partial_json(json!({"name": "alice", "password": "secret"})))
        .respond_with(
            json_response(200, json!({"ok": true, "userCtx": {"name": "alice"}}))
                .insert_header("Set-Cookie", "SyncGatewaySession=abc; Path=/db"),
        )
        .expect(1)
        .mount(&remote.server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let auth: Arc<dyn Authenticator> = Arc::new(SessionAuthenticator::new("alice", "secret"));
    let puller = Puller::connect(store, remote.config(), Some(auth)).unwrap();
    puller.start().unwrap();
    wait_stopped(&puller).await;

    assert!(puller.last_error().is_none());
    let changes = remote.requests_to("GET", "/db/_changes").await;
    let cookie = changes[0]
        .headers
        .get("cookie")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(cookie.contains("SyncGatewaySession=abc"));
}

#[tokio::test]
async fn pull_feed_uses_get_without_server_identity() {
    let remote = TestRemote::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/db/_local/.+$"))
        .respond_with(ResponseTemplate::new(404).insert_header("Server", SYNC_GATEWAY))
        .mount(&remote.server)
        .await;
    remote.changes("GET", json!([]), json!(0)).await;

    let store = Arc::new(MemoryStore::new());
    let puller = Puller::connect(store, remote.config(), None).unwrap();
    puller.start().unwrap();
    wait_stopped(&puller).await;

    // Error responses carry no server identity, so the GET feed is used.
    assert_eq!(remote.requests_to("GET", "/db/_changes").await.len(), 1);
}

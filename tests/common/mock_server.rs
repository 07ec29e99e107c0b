// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wiremock remote database.
//!
//! Mounts the endpoints every replication touches (checkpoint document,
//! checkpoint save) and records what the replicator sent.

#![allow(dead_code)] // Not every test binary uses every helper

use couch_replicator::{Replication, ReplicationConfig, ReplicationStatus};
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

pub const SYNC_GATEWAY: &str = "Couchbase Sync Gateway/1.2";

/// Remote database at `<server>/db`.
pub struct TestRemote {
    pub server: MockServer,
}

impl TestRemote {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn url(&self) -> String {
        format!("{}/db", self.server.uri())
    }

    pub fn config(&self) -> ReplicationConfig {
        ReplicationConfig::for_testing(self.url())
    }

    /// No checkpoint yet: `GET _local/<id>` answers 404.
    pub async fn without_checkpoint(&self) {
        Mock::given(method("GET"))
            .and(path_regex(r"^/db/_local/.+$"))
            .respond_with(not_found())
            .mount(&self.server)
            .await;
    }

    /// Existing checkpoint document, served with a Sync Gateway `Server` header.
    pub async fn with_sync_gateway_checkpoint(&self, last_sequence: &str) {
        Mock::given(method("GET"))
            .and(path_regex(r"^/db/_local/.+$"))
            .respond_with(
                json_response(200, json!({"_rev": "0-1", "lastSequence": last_sequence}))
                    .insert_header("Server", SYNC_GATEWAY),
            )
            .mount(&self.server)
            .await;
    }

    /// Accept every checkpoint save.
    pub async fn accept_checkpoint_saves(&self) {
        Mock::given(method("PUT"))
            .and(path_regex(r"^/db/_local/.+$"))
            .respond_with(json_response(201, json!({"ok": true, "id": "_local/x", "rev": "0-2"})))
            .mount(&self.server)
            .await;
    }

    /// One-shot `_changes` answer.
    pub async fn changes(&self, http_method: &str, results: Value, last_seq: Value) {
        Mock::given(method(http_method))
            .and(path("/db/_changes"))
            .respond_with(json_response(200, json!({"results": results, "last_seq": last_seq})))
            .mount(&self.server)
            .await;
    }

    /// Requests whose path ends with `suffix`.
    pub async fn requests_to(&self, http_method: &str, suffix: &str) -> Vec<Request> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.method.as_str() == http_method && r.url.path().ends_with(suffix))
            .collect()
    }

    /// Bodies of checkpoint saves, oldest first.
    pub async fn checkpoint_saves(&self) -> Vec<Value> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.method.as_str() == "PUT" && r.url.path().starts_with("/db/_local/"))
            .filter_map(|r| serde_json::from_slice(&r.body).ok())
            .collect()
    }
}

pub fn json_response(status: u16, body: Value) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(body)
}

pub fn not_found() -> ResponseTemplate {
    json_response(404, json!({"error": "not_found", "reason": "missing"}))
}

/// Change feed row for a single leaf revision.
pub fn change(seq: u64, doc_id: &str, rev_id: &str) -> Value {
    json!({"seq": seq, "id": doc_id, "changes": [{"rev": rev_id}]})
}

/// Wait for the replication to publish `Stopped`.
pub async fn wait_stopped(replication: &Replication) {
    tokio::time::timeout(Duration::from_secs(10), replication.wait_until_stopped())
        .await
        .expect("replication did not stop in time");
    assert_eq!(replication.status(), ReplicationStatus::Stopped);
}

/// Install a fmt subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

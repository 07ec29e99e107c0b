//! Push replication: local to remote.
//!
//! Local changes reach the inbox from `changes_since` at startup and,
//! for continuous replications, from the store's change stream. Each
//! inbox batch is diffed against the remote with `_revs_diff`; missing
//! revisions are uploaded through `_bulk_docs`, or one by one as
//! `multipart/related` when they carry attachment bodies.
//!
//! The checkpoint is a local sequence: it advances to just below the
//! lowest sequence still being pushed.

use super::{Direction, Replication, ReplicationDriver};
use crate::auth::Authenticator;
use crate::config::ReplicationConfig;
use crate::error::{status, status_from_bulk_docs_item, ReplicationError, Result};
use crate::metrics;
use crate::multipart::MultipartWriter;
use crate::remote::{HttpRemote, RemoteClient, RemoteRequest};
use crate::revision::{
    attachment_data, find_common_ancestor, make_revision_history_dict, set_missing_revpos,
    stub_attachments_before_revpos, Properties, Revision, RevisionList,
};
use crate::store::{ChangesOptions, LocalStore, ReplicationFilter};
use crate::BoxFuture;
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Rewrites a revision before it is pushed. Returning `None` skips it.
pub type RevisionTransformer = Arc<dyn Fn(Revision) -> Option<Revision> + Send + Sync>;

#[derive(Default)]
struct PushState {
    /// Local sequences queued or being uploaded.
    pending: BTreeSet<i64>,
    max_pending: i64,
    /// Revisions that failed; re-sent by `retry()`.
    failed: Vec<Revision>,
}

/// Pushes local revisions to a remote database.
///
/// Derefs to [`Replication`] for the lifecycle calls.
pub struct Pusher {
    core: Replication,
    state: Mutex<PushState>,
    filter: Mutex<Option<ReplicationFilter>>,
    transformer: Mutex<Option<RevisionTransformer>>,
    /// Set after the remote rejected a multipart upload with 415.
    dont_send_multipart: AtomicBool,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl Deref for Pusher {
    type Target = Replication;

    fn deref(&self) -> &Replication {
        &self.core
    }
}

impl Pusher {
    /// Must be called inside a Tokio runtime.
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        config: ReplicationConfig,
    ) -> Result<Arc<Self>> {
        Self::with_authenticator(store, remote, None, config)
    }

    pub fn with_authenticator(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        authenticator: Option<Arc<dyn Authenticator>>,
        config: ReplicationConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new_cyclic(|weak: &Weak<Pusher>| {
            let driver: Weak<dyn ReplicationDriver> = weak.clone();
            Pusher {
                core: Replication::new(Direction::Push, store, remote, authenticator, config, driver),
                state: Mutex::new(PushState::default()),
                filter: Mutex::new(None),
                transformer: Mutex::new(None),
                dont_send_multipart: AtomicBool::new(false),
                observer: Mutex::new(None),
            }
        }))
    }

    /// Pusher talking HTTP to `config.remote_url`.
    pub fn connect(
        store: Arc<dyn LocalStore>,
        config: ReplicationConfig,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let remote = HttpRemote::new(
            &config.remote_url,
            authenticator.clone(),
            &config.request_headers,
            config.settings.request.timeout(),
        )?;
        Self::with_authenticator(store, Arc::new(remote), authenticator, config)
    }

    pub fn set_revision_transformer(&self, transformer: Option<RevisionTransformer>) {
        *self.transformer.lock() = transformer;
    }

    /// Local sequences not yet confirmed by the remote.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// True once a 415 made this replication fall back to JSON uploads.
    pub fn sends_json_only(&self) -> bool {
        self.dont_send_multipart.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Change Sources
    // =========================================================================

    /// True if the configured doc ids and filter let `revision` through.
    fn passes(&self, revision: &Revision) -> bool {
        let config = self.core.config();
        if !config.doc_ids.is_empty() && !config.doc_ids.contains(&revision.doc_id) {
            return false;
        }
        match self.filter.lock().as_ref() {
            Some(filter) => filter(revision, &config.filter_params),
            None => true,
        }
    }

    fn queue_changes(&self, changes: RevisionList) {
        let changes: RevisionList = changes.into_iter().filter(|r| self.passes(r)).collect();
        if changes.is_empty() {
            return;
        }
        debug!(session_id = %self.core.session_id(), count = changes.len(), "Queueing local changes");
        self.core.add_changes_count(changes.len());
        for revision in changes {
            self.core.add_to_inbox(revision);
        }
    }

    async fn queue_changes_since_checkpoint(&self) -> Result<()> {
        let since = self
            .core
            .last_sequence()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let options = ChangesOptions {
            include_conflicts: true,
            limit: None,
        };
        let changes = self.core.store().changes_since(since, options).await?;
        self.queue_changes(changes);
        Ok(())
    }

    /// Feed locally authored changes into the inbox as they happen.
    fn start_observing(self: &Arc<Self>) {
        let mut changes = self.core.store().subscribe_changes();
        let pusher = Arc::downgrade(self);
        let remote_url = self.core.remote_url().to_string();

        let handle = tokio::spawn(async move {
            loop {
                let received = changes.recv().await;
                let Some(pusher) = pusher.upgrade() else {
                    break;
                };
                match received {
                    // Pulled from this same remote: pushing it back would echo.
                    Ok(change) if change.source.as_deref() == Some(remote_url.as_str()) => {}
                    Ok(change) => {
                        trace!(doc_id = %change.revision.doc_id, rev_id = %change.revision.rev_id, "Observed local change");
                        pusher.queue_changes(vec![change.revision]);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Change observer lagged, rescanning from checkpoint");
                        let rescan = Arc::clone(&pusher);
                        tokio::spawn(async move {
                            if let Err(e) = rescan.queue_changes_since_checkpoint().await {
                                rescan.core.report_error(e);
                            }
                        });
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.observer.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_observing(&self) {
        if let Some(observer) = self.observer.lock().take() {
            observer.abort();
        }
    }

    async fn begin(self: Arc<Self>) -> Result<()> {
        let config = self.core.config();
        let filter = match config.filter.as_deref() {
            Some(name) => Some(
                self.core
                    .store()
                    .replication_filter(name)
                    .ok_or_else(|| ReplicationError::Config(format!("no filter named {name}")))?,
            ),
            None => None,
        };
        *self.filter.lock() = filter;

        // Subscribe first so nothing committed during the scan is missed.
        if config.continuous {
            self.start_observing();
        }
        self.queue_changes_since_checkpoint().await?;
        self.core.flush_inbox();
        Ok(())
    }

    // =========================================================================
    // Pending Sequences
    // =========================================================================

    fn add_pending(&self, revisions: &[Revision]) {
        let mut state = self.state.lock();
        for revision in revisions {
            state.pending.insert(revision.sequence);
            state.max_pending = state.max_pending.max(revision.sequence);
        }
    }

    /// Resolve a local sequence; removing the lowest one advances the checkpoint.
    fn remove_pending(&self, sequence: i64) {
        let checkpoint = {
            let mut state = self.state.lock();
            let was_first = state.pending.first() == Some(&sequence);
            if !state.pending.remove(&sequence) {
                trace!(seq = sequence, "Sequence already resolved");
                return;
            }
            was_first.then(|| match state.pending.first() {
                Some(first) => first - 1,
                None => state.max_pending,
            })
        };
        if let Some(sequence) = checkpoint {
            self.core.set_last_sequence(sequence.to_string());
        }
    }

    fn revision_failed(&self, revision: Revision, error: ReplicationError) {
        warn!(
            session_id = %self.core.session_id(),
            doc_id = %revision.doc_id,
            rev_id = %revision.rev_id,
            error = %error,
            "Failed to push revision"
        );
        metrics::record_revision_failed(&self.core.session_id(), "push");
        self.state.lock().failed.push(revision);
        self.core.set_error(error);
    }

    // =========================================================================
    // Inbox
    // =========================================================================

    async fn handle_inbox(&self, inbox: RevisionList) {
        let count = inbox.len();
        self.add_pending(&inbox);

        let mut diffs = Map::new();
        for revision in &inbox {
            if let Value::Array(revs) = diffs
                .entry(revision.doc_id.clone())
                .or_insert_with(|| Value::Array(Vec::new()))
            {
                revs.push(Value::String(revision.rev_id.clone()));
            }
        }
        debug!(session_id = %self.core.session_id(), count, "Sending _revs_diff");

        let result = async {
            self.core
                .send_request(RemoteRequest::post("_revs_diff", Value::Object(diffs)))
                .await?
                .json_value()
        }
        .await;
        let results = match result {
            Ok(Value::Object(results)) => Ok(results),
            Ok(other) => Err(ReplicationError::Upstream(format!(
                "_revs_diff returned {} instead of an object",
                json_kind(&other)
            ))),
            Err(e) => Err(e),
        };
        let results = match results {
            Ok(results) => results,
            Err(ReplicationError::Cancelled) => {
                debug!(session_id = %self.core.session_id(), count, "_revs_diff cancelled");
                return;
            }
            Err(e) => {
                self.state.lock().failed.extend(inbox);
                self.core.set_error(e);
                self.core.add_completed_changes_count(count);
                return;
            }
        };

        let mut prepared = Vec::new();
        for revision in inbox {
            let diff = results.get(&revision.doc_id);
            let missing = diff
                .and_then(|d| d.get("missing"))
                .and_then(Value::as_array)
                .is_some_and(|m| m.iter().any(|r| r.as_str() == Some(revision.rev_id.as_str())));
            if !missing {
                self.remove_pending(revision.sequence);
                continue;
            }
            let possible_ancestors: Vec<String> = diff
                .and_then(|d| d.get("possible_ancestors"))
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();

            let sequence = revision.sequence;
            match self.prepare(revision.clone(), &possible_ancestors).await {
                Ok(Some(revision)) => prepared.push(revision),
                Ok(None) => {
                    debug!(doc_id = %revision.doc_id, rev_id = %revision.rev_id, "Transformer skipped revision");
                    self.remove_pending(sequence);
                }
                Err(e) => self.revision_failed(revision, e),
            }
        }

        // Checked per revision: a 415 earlier in the batch switches the rest to JSON.
        let mut bulk = Vec::new();
        for revision in prepared {
            if has_inline_attachments(&revision) && !self.sends_json_only() {
                self.upload_multipart(revision).await;
            } else {
                bulk.push(revision);
            }
        }
        self.upload_bulk_docs(bulk).await;
        self.core.add_completed_changes_count(count);
    }

    /// Load the body and shape it for upload against what the remote has.
    async fn prepare(&self, revision: Revision, possible_ancestors: &[String]) -> Result<Option<Revision>> {
        let store = self.core.store();
        let mut revision = if revision.deleted {
            let mut deleted = revision;
            deleted.properties = Some(Properties::new());
            deleted
        } else {
            let loaded = store.load_revision_body(revision).await?;
            let transformer = self.transformer.lock().clone();
            let mut loaded = match transformer {
                Some(transform) => match transform(loaded) {
                    Some(transformed) => transformed,
                    None => return Ok(None),
                },
                None => loaded,
            };
            set_missing_revpos(&mut loaded);
            loaded
        };

        let history = store.revision_history(&revision).await?;
        let properties = revision.properties.get_or_insert_with(Properties::new);
        properties.insert("_revisions".into(), make_revision_history_dict(&history, &[]));

        let common = find_common_ancestor(&revision, possible_ancestors);
        let stubbed = stub_attachments_before_revpos(&mut revision, common + 1);
        if stubbed > 0 {
            trace!(doc_id = %revision.doc_id, stubbed, "Stubbed attachments the remote already has");
        }
        if let Some(properties) = revision.properties.as_mut() {
            properties.insert(
                "_revisions".into(),
                make_revision_history_dict(&history, possible_ancestors),
            );
        }
        Ok(Some(revision))
    }

    // =========================================================================
    // Uploads
    // =========================================================================

    async fn upload_bulk_docs(&self, revisions: Vec<Revision>) {
        if revisions.is_empty() {
            return;
        }
        let session_id = self.core.session_id();
        let docs: Vec<Value> = revisions.iter().map(|r| Value::Object(r.body())).collect();
        info!(session_id = %session_id, count = docs.len(), "Uploading revisions via _bulk_docs");

        let request = RemoteRequest::post("_bulk_docs", json!({ "docs": docs, "new_edits": false }));
        let result = async { self.core.send_request(request).await?.json_value() }.await;
        let items = match result {
            Ok(Value::Array(items)) => Ok(items),
            Ok(other) => Err(ReplicationError::Upstream(format!(
                "_bulk_docs returned {} instead of an array",
                json_kind(&other)
            ))),
            Err(e) => Err(e),
        };
        let items = match items {
            Ok(items) => items,
            Err(ReplicationError::Cancelled) => return,
            Err(e) => {
                let error = Arc::new(e);
                for revision in revisions {
                    metrics::record_revision_failed(&session_id, "push");
                    self.state.lock().failed.push(revision);
                }
                self.core.set_error_arc(error);
                return;
            }
        };

        let mut pushed = 0;
        for revision in revisions {
            // Items are keyed by doc id; the rev only breaks ties between
            // several revisions of one document.
            let mut same_doc = items
                .iter()
                .filter(|item| item.get("id").and_then(Value::as_str) == Some(revision.doc_id.as_str()))
                .peekable();
            let first = same_doc.peek().copied();
            let item = same_doc
                .find(|item| item.get("rev").and_then(Value::as_str) == Some(revision.rev_id.as_str()))
                .or(first);
            let code = item.map_or(status::OK, status_from_bulk_docs_item);
            match code {
                code if code < 300 => {
                    pushed += 1;
                    self.remove_pending(revision.sequence);
                }
                status::FORBIDDEN => {
                    info!(doc_id = %revision.doc_id, rev_id = %revision.rev_id, "Remote rejected revision");
                    metrics::record_revision_rejected(&session_id);
                    self.remove_pending(revision.sequence);
                }
                code => {
                    let reason = item
                        .and_then(|i| i.get("reason").or_else(|| i.get("error")))
                        .and_then(Value::as_str)
                        .unwrap_or("bulk_docs item failed")
                        .to_string();
                    self.revision_failed(revision, ReplicationError::http(code, reason));
                }
            }
        }
        metrics::record_revisions_pushed(&session_id, pushed);
    }

    async fn upload_multipart(&self, revision: Revision) {
        let path = format!("{}?new_edits=false", urlencoding::encode(&revision.doc_id));
        let result = match multipart_body(&revision) {
            Ok((content_type, body)) => {
                debug!(doc_id = %revision.doc_id, rev_id = %revision.rev_id, "Uploading multipart revision");
                let request = RemoteRequest::new(Method::PUT, path.as_str()).bytes(content_type, body);
                self.core.send_request(request).await
            }
            Err(e) => Err(e),
        };

        let result = match result {
            Err(e) if e.is_http_status(status::UNSUPPORTED_MEDIA_TYPE) => {
                info!(
                    session_id = %self.core.session_id(),
                    "Remote does not accept multipart uploads, switching to JSON"
                );
                self.dont_send_multipart.store(true, Ordering::SeqCst);
                metrics::record_multipart_fallback(&self.core.session_id());
                self.core
                    .send_request(RemoteRequest::put(path, Value::Object(revision.body())))
                    .await
            }
            other => other,
        };

        match result {
            Ok(_) => {
                metrics::record_revisions_pushed(&self.core.session_id(), 1);
                self.remove_pending(revision.sequence);
            }
            Err(e) if e.is_http_status(status::FORBIDDEN) => {
                info!(doc_id = %revision.doc_id, rev_id = %revision.rev_id, "Remote rejected revision");
                metrics::record_revision_rejected(&self.core.session_id());
                self.remove_pending(revision.sequence);
            }
            Err(ReplicationError::Cancelled) => {}
            Err(e) => self.revision_failed(revision, e),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn has_inline_attachments(revision: &Revision) -> bool {
    revision
        .attachments()
        .is_some_and(|atts| atts.values().any(|meta| meta.get("data").is_some()))
}

/// JSON part with `follows` markers, then one part per attachment body.
fn multipart_body(revision: &Revision) -> Result<(String, bytes::Bytes)> {
    let mut body = revision.body();
    let mut files = Vec::new();
    if let Some(attachments) = body.get_mut("_attachments").and_then(Value::as_object_mut) {
        for (name, meta) in attachments.iter_mut() {
            let Some(meta) = meta.as_object_mut() else {
                continue;
            };
            let Some(data) = attachment_data(meta) else {
                continue;
            };
            meta.remove("data");
            meta.insert("follows".into(), Value::Bool(true));
            meta.insert("length".into(), json!(data.len()));
            let content_type = meta
                .get("content_type")
                .and_then(Value::as_str)
                .map(str::to_string);
            files.push((name.clone(), content_type, data));
        }
    }

    let mut writer = MultipartWriter::new();
    writer.add_json(&Value::Object(body))?;
    for (name, content_type, data) in &files {
        writer.add_attachment(name, content_type.as_deref(), data);
    }
    Ok((writer.content_type(), writer.finish()))
}

impl ReplicationDriver for Pusher {
    fn core(&self) -> &Replication {
        &self.core
    }

    fn reset(&self) {
        *self.state.lock() = PushState::default();
    }

    fn begin_replicating(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(self.begin())
    }

    fn process_inbox(self: Arc<Self>, inbox: RevisionList) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.handle_inbox(inbox).await;
            Ok(())
        })
    }

    fn maybe_create_remote_db(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if !self.core.config().create_target {
                return Ok(());
            }
            info!(session_id = %self.core.session_id(), "Creating remote database");
            match self.core.send_request(RemoteRequest::new(Method::PUT, "")).await {
                Ok(_) => Ok(()),
                Err(e) if e.is_http_status(status::PRECONDITION_FAILED) => Ok(()),
                Err(e) => Err(e),
            }
        })
    }

    fn stopping(&self) {
        self.stop_observing();
    }

    fn suspend(&self) {
        self.stop_observing();
    }

    fn retry(self: Arc<Self>) {
        self.core.clear_error();
        let failed = std::mem::take(&mut self.state.lock().failed);
        info!(session_id = %self.core.session_id(), count = failed.len(), "Retrying push");
        if failed.is_empty() {
            return;
        }
        self.core.async_task_started();
        tokio::spawn(async move {
            self.handle_inbox(failed).await;
            self.core.async_task_finished(1);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::{json_response, MockRemote};
    use crate::remote::{RemoteResponse, RequestBody};
    use crate::store::MemoryStore;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use std::time::Duration;

    fn not_found() -> Result<RemoteResponse> {
        Err(ReplicationError::http(404, "not_found"))
    }

    fn created(body: Value) -> Result<RemoteResponse> {
        json_response(body).map(|mut response| {
            response.status = 201;
            response
        })
    }

    fn pusher_with(
        store: Arc<MemoryStore>,
        config: ReplicationConfig,
        responder: impl Fn(&RemoteRequest) -> Result<RemoteResponse> + Send + Sync + 'static,
    ) -> (Arc<Pusher>, Arc<MockRemote>) {
        let remote = MockRemote::new(responder);
        let pusher = Pusher::new(store, remote.clone(), config).unwrap();
        (pusher, remote)
    }

    fn config() -> ReplicationConfig {
        ReplicationConfig::for_testing("http://mock.local/db")
    }

    fn json_body(request: &RemoteRequest) -> Option<Value> {
        match &request.body {
            RequestBody::Json(body) => Some(body.clone()),
            _ => None,
        }
    }

    fn missing_everything(request: &RemoteRequest) -> Result<RemoteResponse> {
        let body = json_body(request).unwrap_or_default();
        let diff: Map<String, Value> = body
            .as_object()
            .into_iter()
            .flatten()
            .map(|(doc_id, revs)| (doc_id.clone(), json!({ "missing": revs })))
            .collect();
        json_response(Value::Object(diff))
    }

    #[tokio::test]
    async fn test_push_one_revision_via_bulk_docs() {
        let store = Arc::new(MemoryStore::new());
        let rev = store.put("doc1", json!({"title": "hello"}), None).unwrap();
        let (pusher, remote) = pusher_with(Arc::clone(&store), config(), |req| {
            match req.path.as_str() {
                "_revs_diff" => missing_everything(req),
                "_bulk_docs" => created(json!([])),
                p if p.starts_with("_local/") && req.method == Method::GET => not_found(),
                _ => json_response(json!({"ok": true, "rev": "0-1"})),
            }
        });

        pusher.start().unwrap();
        tokio::time::timeout(Duration::from_secs(5), pusher.wait_until_stopped())
            .await
            .unwrap();

        let requests = remote.requests.lock();
        let bulk: Vec<&RemoteRequest> = requests.iter().filter(|r| r.path == "_bulk_docs").collect();
        assert_eq!(bulk.len(), 1);
        let body = json_body(bulk[0]).unwrap();
        assert_eq!(body["new_edits"], json!(false));
        assert_eq!(body["docs"][0]["_id"], json!("doc1"));
        assert_eq!(body["docs"][0]["_rev"], json!(rev.rev_id));
        assert_eq!(body["docs"][0]["_revisions"]["start"], json!(1));
        drop(requests);

        assert_eq!(pusher.pending_count(), 0);
        assert_eq!(pusher.last_sequence().as_deref(), Some("1"));
        assert!(pusher.last_error().is_none());
    }

    #[tokio::test]
    async fn test_nothing_missing_advances_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let rev = store.put("doc1", json!({}), None).unwrap();
        let (pusher, remote) = pusher_with(Arc::clone(&store), config(), |_| json_response(json!({})));
        pusher.core.state.lock().running = true;

        pusher.handle_inbox(vec![rev]).await;

        assert_eq!(pusher.pending_count(), 0);
        assert_eq!(pusher.last_sequence().as_deref(), Some("1"));
        assert!(remote.paths().iter().all(|p| p != "_bulk_docs"));
    }

    #[tokio::test]
    async fn test_forbidden_item_is_not_a_failure() {
        let store = Arc::new(MemoryStore::new());
        let a = store.put("a", json!({}), None).unwrap();
        let b = store.put("b", json!({}), None).unwrap();
        let b_rev = b.rev_id.clone();
        let (pusher, _remote) = pusher_with(Arc::clone(&store), config(), move |req| match req.path.as_str() {
            "_revs_diff" => missing_everything(req),
            _ => created(json!([
                {"id": "a", "error": "forbidden", "reason": "read only", "status": 403},
                {"id": "b", "rev": b_rev}
            ])),
        });
        pusher.core.state.lock().running = true;

        pusher.handle_inbox(vec![a, b.clone()]).await;

        assert_eq!(pusher.pending_count(), 0);
        assert!(pusher.last_error().is_none());
        assert_eq!(pusher.last_sequence().as_deref(), Some(b.sequence.to_string().as_str()));
    }

    #[tokio::test]
    async fn test_bulk_docs_error_fails_revision_by_doc_id() {
        let store = Arc::new(MemoryStore::new());
        let a = store.put("a", json!({}), None).unwrap();
        let (pusher, _remote) = pusher_with(Arc::clone(&store), config(), |req| match req.path.as_str() {
            "_revs_diff" => missing_everything(req),
            _ => created(json!([{"id": "a", "rev": "1-other", "error": "conflict", "status": 409}])),
        });
        pusher.core.state.lock().running = true;

        pusher.handle_inbox(vec![a]).await;

        assert!(pusher.last_error().unwrap().is_http_status(409));
        assert_eq!(pusher.pending_count(), 1);
        assert_eq!(pusher.last_sequence(), None);
    }

    #[tokio::test]
    async fn test_non_object_revs_diff_fails_batch() {
        let store = Arc::new(MemoryStore::new());
        let a = store.put("a", json!({}), None).unwrap();
        let (pusher, remote) = pusher_with(Arc::clone(&store), config(), |_| json_response(Value::Null));
        pusher.core.state.lock().running = true;

        pusher.handle_inbox(vec![a]).await;

        assert!(matches!(
            pusher.last_error().as_deref(),
            Some(ReplicationError::Upstream(_))
        ));
        assert_eq!(pusher.pending_count(), 1);
        assert_eq!(pusher.state.lock().failed.len(), 1);
        assert_eq!(pusher.last_sequence(), None);
        assert!(remote.paths().iter().all(|p| p != "_bulk_docs"));
    }

    #[tokio::test]
    async fn test_non_array_bulk_docs_fails_batch() {
        let store = Arc::new(MemoryStore::new());
        let a = store.put("a", json!({}), None).unwrap();
        let b = store.put("b", json!({}), None).unwrap();
        let (pusher, _remote) = pusher_with(Arc::clone(&store), config(), |req| match req.path.as_str() {
            "_revs_diff" => missing_everything(req),
            _ => created(json!({"ok": true})),
        });
        pusher.core.state.lock().running = true;

        pusher.handle_inbox(vec![a, b]).await;

        assert!(matches!(
            pusher.last_error().as_deref(),
            Some(ReplicationError::Upstream(_))
        ));
        assert_eq!(pusher.pending_count(), 2);
        assert_eq!(pusher.state.lock().failed.len(), 2);
        assert_eq!(pusher.last_sequence(), None);
    }

    #[tokio::test]
    async fn test_failed_item_sets_error_and_holds_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let a = store.put("a", json!({}), None).unwrap();
        let b = store.put("b", json!({}), None).unwrap();
        let (pusher, _remote) = pusher_with(Arc::clone(&store), config(), |req| match req.path.as_str() {
            "_revs_diff" => missing_everything(req),
            _ => created(json!([{"id": "a", "error": "unauthorized"}])),
        });
        pusher.core.state.lock().running = true;

        pusher.handle_inbox(vec![a, b]).await;

        assert_eq!(pusher.pending_count(), 1);
        assert!(pusher.last_error().unwrap().is_http_status(401));
        assert_eq!(pusher.last_sequence(), None);
        assert_eq!(pusher.state.lock().failed.len(), 1);
    }

    #[tokio::test]
    async fn test_multipart_falls_back_to_json_after_415() {
        let store = Arc::new(MemoryStore::new());
        let attachment = |text: &str| {
            json!({"_attachments": {"a.txt": {"content_type": "text/plain", "data": BASE64.encode(text)}}})
        };
        let first = store.put("first", attachment("one"), None).unwrap();
        let second = store.put("second", attachment("two"), None).unwrap();
        let (pusher, remote) = pusher_with(Arc::clone(&store), config(), |req| {
            if req.path == "_revs_diff" {
                missing_everything(req)
            } else if matches!(req.body, RequestBody::Bytes { .. }) {
                Err(ReplicationError::http(415, "unsupported media type"))
            } else {
                created(json!({"ok": true}))
            }
        });
        pusher.core.state.lock().running = true;

        pusher.handle_inbox(vec![first]).await;
        assert!(pusher.sends_json_only());
        pusher.handle_inbox(vec![second]).await;

        let puts: Vec<(String, bool)> = remote
            .requests
            .lock()
            .iter()
            .filter(|r| r.method == Method::PUT)
            .map(|r| (r.path.clone(), matches!(r.body, RequestBody::Bytes { .. })))
            .collect();
        assert_eq!(
            puts,
            vec![
                ("first?new_edits=false".to_string(), true),
                ("first?new_edits=false".to_string(), false),
            ]
        );
        // The second revision went through _bulk_docs with inline data.
        let requests = remote.requests.lock();
        let bulk = requests.iter().find(|r| r.path == "_bulk_docs").unwrap();
        let body = json_body(bulk).unwrap();
        assert_eq!(body["docs"][0]["_attachments"]["a.txt"]["data"], json!(BASE64.encode("two")));
        drop(requests);
        assert_eq!(pusher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_415_switches_rest_of_batch_to_json() {
        let store = Arc::new(MemoryStore::new());
        let attachment = |text: &str| {
            json!({"_attachments": {"a.txt": {"content_type": "text/plain", "data": BASE64.encode(text)}}})
        };
        let first = store.put("first", attachment("one"), None).unwrap();
        let second = store.put("second", attachment("two"), None).unwrap();
        let (pusher, remote) = pusher_with(Arc::clone(&store), config(), |req| {
            if req.path == "_revs_diff" {
                missing_everything(req)
            } else if matches!(req.body, RequestBody::Bytes { .. }) {
                Err(ReplicationError::http(415, "unsupported media type"))
            } else if req.path == "_bulk_docs" {
                created(json!([]))
            } else {
                created(json!({"ok": true}))
            }
        });
        pusher.core.state.lock().running = true;

        pusher.handle_inbox(vec![first, second]).await;

        let multipart: Vec<String> = remote
            .requests
            .lock()
            .iter()
            .filter(|r| matches!(r.body, RequestBody::Bytes { .. }))
            .map(|r| r.path.clone())
            .collect();
        assert_eq!(multipart, vec!["first?new_edits=false".to_string()]);
        let requests = remote.requests.lock();
        let bulk = requests.iter().find(|r| r.path == "_bulk_docs").unwrap();
        assert_eq!(json_body(bulk).unwrap()["docs"][0]["_id"], json!("second"));
        drop(requests);
        assert_eq!(pusher.pending_count(), 0);
        assert!(pusher.last_error().is_none());
    }

    #[test]
    fn test_multipart_body_marks_follows() {
        let mut revision = Revision::new("doc", "2-b", false);
        revision.properties = Some(
            json!({"_attachments": {
                "a.txt": {"content_type": "text/plain", "data": BASE64.encode("hi"), "revpos": 2},
                "old.txt": {"stub": true, "revpos": 1}
            }})
            .as_object()
            .cloned()
            .unwrap(),
        );

        let (content_type, body) = multipart_body(&revision).unwrap();
        let decoded = crate::multipart::decode_document(Some(&content_type), &body).unwrap();
        assert_eq!(decoded["_rev"], json!("2-b"));
        assert_eq!(decoded["_attachments"]["a.txt"]["length"], json!(2));
        assert_eq!(decoded["_attachments"]["a.txt"]["data"], json!(BASE64.encode("hi")));
        assert_eq!(decoded["_attachments"]["old.txt"]["stub"], json!(true));
    }

    #[tokio::test]
    async fn test_prepare_cuts_history_and_stubs_known_attachments() {
        let store = Arc::new(MemoryStore::new());
        let first = store
            .put("doc", json!({"_attachments": {"a.txt": {"data": BASE64.encode("x")}}}), None)
            .unwrap();
        let loaded = store.get_revision("doc", &first.rev_id).unwrap();
        let mut body = loaded.properties.clone().unwrap();
        body["_attachments"]["a.txt"]["revpos"] = json!(1);
        let second = store.put("doc", Value::Object(body), Some(&first.rev_id)).unwrap();
        let (pusher, _remote) = pusher_with(Arc::clone(&store), config(), |_| not_found());

        let prepared = pusher
            .prepare(second.clone(), &[first.rev_id.clone()])
            .await
            .unwrap()
            .unwrap();

        let props = prepared.properties.unwrap();
        assert_eq!(props["_revisions"]["start"], json!(2));
        assert_eq!(props["_revisions"]["ids"].as_array().unwrap().len(), 2);
        assert_eq!(props["_attachments"]["a.txt"]["stub"], json!(true));
        assert!(props["_attachments"]["a.txt"].get("data").is_none());
    }

    #[tokio::test]
    async fn test_transformer_can_skip_revisions() {
        let store = Arc::new(MemoryStore::new());
        let rev = store.put("secret", json!({}), None).unwrap();
        let (pusher, remote) = pusher_with(Arc::clone(&store), config(), missing_everything);
        let transformer: RevisionTransformer =
            Arc::new(|rev: Revision| (rev.doc_id != "secret").then_some(rev));
        pusher.set_revision_transformer(Some(transformer));
        pusher.core.state.lock().running = true;

        pusher.handle_inbox(vec![rev]).await;

        assert_eq!(pusher.pending_count(), 0);
        assert!(remote.paths().iter().all(|p| p != "_bulk_docs"));
    }

    #[tokio::test]
    async fn test_remove_pending_advances_over_lowest() {
        let store = Arc::new(MemoryStore::new());
        let (pusher, _remote) = pusher_with(store, config(), |_| not_found());
        let revs: Vec<Revision> = [3, 5, 9]
            .into_iter()
            .map(|seq| Revision::new("d", "1-a", false).with_sequence(seq))
            .collect();
        pusher.add_pending(&revs);

        pusher.remove_pending(5);
        assert_eq!(pusher.last_sequence(), None);
        pusher.remove_pending(3);
        assert_eq!(pusher.last_sequence().as_deref(), Some("8"));
        pusher.remove_pending(9);
        assert_eq!(pusher.last_sequence().as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn test_missing_filter_is_config_error() {
        let store = Arc::new(MemoryStore::new());
        let config = ReplicationConfig {
            filter: Some("app/nope".to_string()),
            ..config()
        };
        let (pusher, _remote) = pusher_with(store, config, |req| {
            if req.path.starts_with("_local/") && req.method == Method::GET {
                not_found()
            } else {
                json_response(json!({}))
            }
        });

        pusher.start().unwrap();
        tokio::time::timeout(Duration::from_secs(5), pusher.wait_until_stopped())
            .await
            .unwrap();

        assert!(matches!(
            pusher.last_error().as_deref(),
            Some(ReplicationError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_observer_skips_revisions_pulled_from_remote() {
        let store = Arc::new(MemoryStore::new());
        let (pusher, _remote) = pusher_with(Arc::clone(&store), config(), |_| not_found());
        pusher.start_observing();

        let pulled = Revision::new("from-remote", "1-r", false);
        store
            .force_insert(pulled, vec!["1-r".to_string()], Some("http://mock.local/db".to_string()))
            .await
            .unwrap();
        store.put("local", json!({}), None).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while pusher.changes_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pusher.changes_count(), 1);
        pusher.stop_observing();
    }
}

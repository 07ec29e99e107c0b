//! Remote `_changes` feed tracking.
//!
//! A [`ChangeTracker`] owns one polling task against the remote database's
//! change feed and hands every change to its [`ChangeTrackerClient`].
//!
//! # Feed Modes
//!
//! - [`FeedMode::OneShot`]: one `feed=normal` request, then the tracker stops.
//! - [`FeedMode::LongPoll`]: `feed=longpoll` requests back to back, each
//!   resuming from the last sequence seen.
//!
//! A streaming `feed=continuous` mode is not offered; continuous
//! replications long-poll.
//!
//! # Failure Handling
//!
//! ```text
//! poll ──ok──▶ deliver changes ──▶ backoff.reset() ──▶ (LongPoll) poll again
//!   │
//!   ├─ transient (5xx, I/O) ──▶ sleep backoff.next_delay() ──▶ poll again
//!   │
//!   └─ other error ──▶ record error ──▶ Stopped
//! ```
//!
//! [`ChangeTracker::stop`] is idempotent, aborts the in-flight request and
//! interrupts any backoff sleep. The client's
//! [`tracker_stopped`](ChangeTrackerClient::tracker_stopped) fires exactly
//! once, when the polling task exits.

use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::remote::{mask_credentials, RemoteClient, RemoteRequest};
use crate::resilience::{Backoff, RateLimitConfig, RateLimiter, RetryConfig};
use crate::revision::is_valid_document_id;
use crate::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// How the change feed is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    OneShot,
    LongPoll,
}

impl FeedMode {
    fn feed_param(self) -> &'static str {
        match self {
            FeedMode::OneShot => "normal",
            FeedMode::LongPoll => "longpoll",
        }
    }
}

/// Lifecycle of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Running,
    Stopped,
}

/// One entry of the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    /// Opaque remote sequence token.
    pub seq: String,
    pub doc_id: String,
    /// Leaf revision ids; several when the document is in conflict.
    pub revs: Vec<String>,
    pub deleted: bool,
}

impl ChangeEntry {
    /// Parse a change record. Returns `None` if `seq`, `id` or `changes` is missing.
    pub fn parse(value: &Value) -> Option<Self> {
        let seq = sequence_to_string(value.get("seq")?)?;
        let doc_id = value.get("id")?.as_str()?.to_string();
        let revs = value
            .get("changes")?
            .as_array()?
            .iter()
            .filter_map(|c| c.get("rev").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        let deleted = value.get("deleted").and_then(Value::as_bool).unwrap_or(false);
        Some(Self {
            seq,
            doc_id,
            revs,
            deleted,
        })
    }
}

/// Sequence tokens are kept as strings; numbers are rendered in decimal.
fn sequence_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// A decoded `_changes` response.
#[derive(Debug, Default)]
pub struct ChangesPage {
    pub changes: Vec<ChangeEntry>,
    /// Entries dropped as malformed, without revisions, or naming an invalid document id.
    pub rejected: Vec<Value>,
    pub last_seq: Option<String>,
}

/// Decode a `_changes` response body.
///
/// A body without a `results` array is an upstream error.
pub fn parse_changes_response(body: &[u8]) -> Result<ChangesPage> {
    let value: Value = serde_json::from_slice(body)?;
    let results = value
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| ReplicationError::Upstream("_changes response has no results array".into()))?;

    let mut page = ChangesPage {
        last_seq: value.get("last_seq").and_then(sequence_to_string),
        ..ChangesPage::default()
    };
    for item in results {
        match ChangeEntry::parse(item) {
            Some(change) if is_valid_document_id(&change.doc_id) && !change.revs.is_empty() => {
                page.changes.push(change)
            }
            _ => page.rejected.push(item.clone()),
        }
    }
    Ok(page)
}

/// Receiver of tracked changes.
pub trait ChangeTrackerClient: Send + Sync + 'static {
    /// Called once per change, in feed order. The tracker waits for the
    /// returned future, so a slow client throttles the feed.
    fn received_change(&self, change: ChangeEntry) -> BoxFuture<'_, ()>;

    /// Called once when the polling task exits, with the error that stopped it.
    fn tracker_stopped(&self, error: Option<Arc<ReplicationError>>);
}

/// Parameters of one tracker.
#[derive(Debug, Clone)]
pub struct ChangeTrackerOptions {
    pub mode: FeedMode,
    /// Resume after this remote sequence.
    pub since: Option<String>,
    /// Ask for every leaf revision (`style=all_docs`).
    pub include_conflicts: bool,
    pub filter: Option<String>,
    pub filter_params: HashMap<String, Value>,
    /// Restrict the feed to these ids via the `_doc_ids` filter.
    pub doc_ids: Vec<String>,
    pub heartbeat: Duration,
    /// Changes per long-poll response.
    pub limit: usize,
    pub backoff: RetryConfig,
    pub rate_limit: Option<RateLimitConfig>,
    /// POST the parameters as a JSON body instead of a query string.
    pub use_post: bool,
    /// Label for logs and metrics.
    pub session_id: String,
}

impl Default for ChangeTrackerOptions {
    fn default() -> Self {
        Self {
            mode: FeedMode::OneShot,
            since: None,
            include_conflicts: true,
            filter: None,
            filter_params: HashMap::new(),
            doc_ids: Vec::new(),
            heartbeat: Duration::from_secs(300),
            limit: 50,
            backoff: RetryConfig::change_feed(),
            rate_limit: None,
            use_post: false,
            session_id: String::new(),
        }
    }
}

struct TrackerInner {
    remote: Arc<dyn RemoteClient>,
    client: Arc<dyn ChangeTrackerClient>,
    options: ChangeTrackerOptions,
    since: Mutex<Option<String>>,
    error: Mutex<Option<Arc<ReplicationError>>>,
    state_tx: watch::Sender<TrackerState>,
    shutdown_tx: watch::Sender<bool>,
}

/// Polls the remote change feed on its own task.
pub struct ChangeTracker {
    inner: Arc<TrackerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeTracker {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        options: ChangeTrackerOptions,
        client: Arc<dyn ChangeTrackerClient>,
    ) -> Self {
        let (state_tx, _) = watch::channel(TrackerState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackerInner {
                remote,
                client,
                since: Mutex::new(options.since.clone()),
                options,
                error: Mutex::new(None),
                state_tx,
                shutdown_tx,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the polling task. Does nothing unless the tracker is idle.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if self.state() != TrackerState::Idle || handle.is_some() {
            return;
        }
        *self.inner.error.lock() = None;
        let _ = self.inner.state_tx.send_replace(TrackerState::Running);

        let inner = Arc::clone(&self.inner);
        let span = info_span!(
            "change_tracker",
            session_id = %inner.options.session_id,
            url = %mask_credentials(inner.remote.remote_url()),
            mode = ?inner.options.mode,
        );
        *handle = Some(tokio::spawn(run_tracker(inner).instrument(span)));
    }

    /// Stop polling. Safe to call repeatedly and from any task.
    pub fn stop(&self) {
        let was_stopping = self.inner.shutdown_tx.send_replace(true);
        if !was_stopping {
            debug!(session_id = %self.inner.options.session_id, "Change tracker asked to stop");
        }
        if self.handle.lock().is_none() {
            // Never started: nothing will report the transition.
            let _ = self.inner.state_tx.send_replace(TrackerState::Stopped);
        }
    }

    /// Wait for the polling task to exit.
    pub async fn wait_stopped(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == TrackerState::Stopped).await;
    }

    pub fn state(&self) -> TrackerState {
        *self.inner.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<TrackerState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state() == TrackerState::Running
    }

    /// Sequence of the last change delivered, or the starting sequence.
    pub fn last_sequence(&self) -> Option<String> {
        self.inner.since.lock().clone()
    }

    /// Error that stopped the tracker, if any.
    pub fn last_error(&self) -> Option<Arc<ReplicationError>> {
        self.inner.error.lock().clone()
    }

    pub fn mode(&self) -> FeedMode {
        self.inner.options.mode
    }

    /// The request the next poll will send.
    pub fn changes_request(&self) -> RemoteRequest {
        self.inner.changes_request()
    }
}

impl Drop for ChangeTracker {
    fn drop(&mut self) {
        let _ = self.inner.shutdown_tx.send_replace(true);
    }
}

impl TrackerInner {
    /// Effective filter name and parameters; `doc_ids` wins over a named filter.
    fn effective_filter(&self) -> (Option<String>, Vec<(String, Value)>) {
        let options = &self.options;
        if !options.doc_ids.is_empty() {
            return (
                Some("_doc_ids".to_string()),
                vec![("doc_ids".to_string(), json!(options.doc_ids))],
            );
        }
        let mut params: Vec<(String, Value)> = options
            .filter_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        (options.filter.clone(), params)
    }

    fn changes_request(&self) -> RemoteRequest {
        let options = &self.options;
        let since = self.since.lock().clone();
        let (filter, filter_params) = self.effective_filter();
        let heartbeat_ms = options.heartbeat.as_millis() as u64;
        let limit = (options.mode == FeedMode::LongPoll && options.limit > 0).then_some(options.limit);

        let request = if options.use_post {
            let mut body = Map::new();
            body.insert("feed".into(), json!(options.mode.feed_param()));
            body.insert("heartbeat".into(), json!(heartbeat_ms));
            if options.include_conflicts {
                body.insert("style".into(), json!("all_docs"));
            }
            if let Some(since) = since {
                // Servers may compare numerically, so send numeric tokens as numbers.
                let value = since.parse::<i64>().map(Value::from).unwrap_or(Value::String(since));
                body.insert("since".into(), value);
            }
            if let Some(limit) = limit {
                body.insert("limit".into(), json!(limit));
            }
            if let Some(filter) = filter {
                body.insert("filter".into(), json!(filter));
                for (key, value) in filter_params {
                    body.insert(key, value);
                }
            }
            RemoteRequest::post("_changes", Value::Object(body))
        } else {
            let mut path = format!("_changes?feed={}", options.mode.feed_param());
            if let Some(limit) = limit {
                path.push_str(&format!("&limit={limit}"));
            }
            path.push_str(&format!("&heartbeat={heartbeat_ms}"));
            if options.include_conflicts {
                path.push_str("&style=all_docs");
            }
            if let Some(since) = since {
                path.push_str(&format!("&since={}", urlencoding::encode(&since)));
            }
            if let Some(filter) = filter {
                path.push_str(&format!("&filter={}", urlencoding::encode(&filter)));
                for (key, value) in filter_params {
                    let value = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    path.push_str(&format!(
                        "&{}={}",
                        urlencoding::encode(&key),
                        urlencoding::encode(&value)
                    ));
                }
            }
            RemoteRequest::get(path)
        };

        match options.mode {
            // Heartbeats keep the connection alive, so allow a little over one interval.
            FeedMode::LongPoll => request.timeout(options.heartbeat + options.heartbeat / 10),
            FeedMode::OneShot => request,
        }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Deliver one page to the client. Returns false if shutdown interrupted it.
    async fn deliver(&self, page: ChangesPage, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let session_id = &self.options.session_id;
        for rejected in &page.rejected {
            let doc_id = rejected.get("id").and_then(Value::as_str).unwrap_or("");
            // Sync Gateway lists user documents in the feed; those are expected.
            if !doc_id.starts_with("_user/") {
                warn!(change = %rejected, "Dropping unusable change from _changes");
            }
            metrics::record_change_rejected(session_id);
        }
        metrics::record_changes_received(session_id, page.changes.len());

        for change in page.changes {
            let seq = change.seq.clone();
            trace!(seq = %seq, doc_id = %change.doc_id, "Received change");
            tokio::select! {
                biased;
                _ = shutdown_signal(shutdown_rx) => return false,
                result = self.client.received_change(change) => {
                    if let Err(e) = result {
                        warn!(seq = %seq, error = %e, "Change tracker client failed to accept change");
                    }
                }
            }
            *self.since.lock() = Some(seq);
        }
        if let Some(last_seq) = page.last_seq {
            *self.since.lock() = Some(last_seq);
        }
        true
    }
}

async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn run_tracker(inner: Arc<TrackerInner>) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let mut backoff = Backoff::new(inner.options.backoff.clone());
    let rate_limiter = inner.options.rate_limit.clone().map(RateLimiter::new);
    let session_id = inner.options.session_id.clone();

    info!(since = ?inner.since.lock().clone(), "Starting change tracker");

    loop {
        if inner.shutting_down() {
            break;
        }
        if let Some(limiter) = &rate_limiter {
            tokio::select! {
                _ = shutdown_signal(&mut shutdown_rx) => break,
                _ = limiter.acquire() => {}
            }
        }

        let request = inner.changes_request();
        debug!(request = %request.describe(), "Polling change feed");
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = shutdown_signal(&mut shutdown_rx) => break,
            result = inner.remote.send(request) => result,
        };
        let outcome = result.and_then(|response| parse_changes_response(&response.body));
        metrics::record_change_feed_poll(&session_id, outcome.is_ok(), started.elapsed());

        match outcome {
            Ok(page) => {
                backoff.reset();
                let count = page.changes.len();
                if !inner.deliver(page, &mut shutdown_rx).await {
                    break;
                }
                debug!(count, since = ?inner.since.lock().clone(), "Change feed response processed");
                if inner.options.mode == FeedMode::OneShot {
                    break;
                }
            }
            Err(e) if e.is_retryable() => {
                let delay = backoff.next_delay();
                warn!(
                    error = %e,
                    attempts = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Change feed request failed, backing off"
                );
                metrics::record_change_feed_backoff(&session_id, delay);
                if backoff.exhausted() {
                    *inner.error.lock() = Some(Arc::new(e));
                    break;
                }
                tokio::select! {
                    _ = shutdown_signal(&mut shutdown_rx) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Change feed failed, stopping tracker");
                *inner.error.lock() = Some(Arc::new(e));
                break;
            }
        }
    }

    let _ = inner.state_tx.send_replace(TrackerState::Stopped);
    info!("Change tracker stopped");
    let error = inner.error.lock().clone();
    inner.client.tracker_stopped(error);
}

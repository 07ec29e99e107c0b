//! Pull replication: remote to local.
//!
//! # Pipeline
//!
//! ```text
//! ChangeTracker ──▶ inbox ──▶ process_inbox ──┬─▶ bulk queue ──────▶ _bulk_get / _all_docs
//!                             (find missing,  ├─▶ individual queue ─▶ GET doc?rev=
//!                              pending seqs)  └─▶ deleted queue ────▶ GET doc?rev=
//!                                                        │
//!                                   downloads batcher ◀──┘
//!                                          │
//!                                   insert_downloads ──▶ force_insert, resolve seqs, checkpoint
//! ```
//!
//! Every revision accepted into the pipeline gets a pending sequence in a
//! [`SequenceMap`]; the checkpoint only advances over revisions that were
//! inserted (or rejected by validation).

use super::bulk_downloader::BulkDownloader;
use super::{Direction, Replication, ReplicationDriver};
use crate::auth::Authenticator;
use crate::batch::{BatchHandler, Batcher};
use crate::change_tracker::{
    ChangeEntry, ChangeTracker, ChangeTrackerClient, ChangeTrackerOptions, FeedMode,
};
use crate::config::ReplicationConfig;
use crate::error::{status, ReplicationError, Result};
use crate::metrics;
use crate::multipart::decode_document;
use crate::remote::{is_sync_gateway_at_least, HttpRemote, RemoteClient, RemoteRequest};
use crate::revision::{parse_revision_history, split_rev_id, Properties, Revision, RevisionList};
use crate::sequence_map::SequenceMap;
use crate::store::LocalStore;
use crate::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Sync Gateway versions from which `_bulk_get` is available.
const BULK_GET_MIN_VERSION: &str = "0.81";
/// Sync Gateway versions that accept `POST _changes`.
const POST_CHANGES_MIN_VERSION: &str = "0.93";

const MULTIPART_ACCEPT: &str = "multipart/related, application/json";

#[derive(Default)]
struct PullState {
    pending: SequenceMap,
    bulk_revs: VecDeque<Revision>,
    individual: VecDeque<Revision>,
    deleted: VecDeque<Revision>,
    /// Fetches in progress.
    connections: usize,
    /// Revisions that failed; requeued by `retry()`.
    failed: Vec<Revision>,
}

impl PullState {
    fn queued(&self) -> usize {
        self.bulk_revs.len() + self.individual.len() + self.deleted.len()
    }

    fn clear_queues(&mut self) {
        self.bulk_revs.clear();
        self.individual.clear();
        self.deleted.clear();
    }

    /// Put a revision back to be fetched on its own.
    fn requeue(&mut self, revision: Revision) {
        if revision.deleted {
            self.deleted.push_back(revision);
        } else {
            self.individual.push_back(revision);
        }
    }
}

enum Fetch {
    Bulk(Vec<Revision>),
    One(Revision),
}

struct TrackerSlot {
    tracker: ChangeTracker,
    adapter: Arc<TrackerAdapter>,
}

/// Forwards tracker callbacks to the puller until detached.
struct TrackerAdapter {
    puller: Weak<Puller>,
    /// Set once by whichever of `tracker_stopped` or a detach comes first.
    detached: AtomicBool,
}

impl ChangeTrackerClient for TrackerAdapter {
    fn received_change(&self, change: ChangeEntry) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.detached.load(Ordering::SeqCst) {
                return Ok(());
            }
            if let Some(puller) = self.puller.upgrade() {
                puller.received_change(change).await;
            }
            Ok(())
        })
    }

    fn tracker_stopped(&self, error: Option<Arc<ReplicationError>>) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(puller) = self.puller.upgrade() {
            puller.tracker_stopped(self, error);
        }
    }
}

struct DownloadHandler {
    puller: Weak<Puller>,
}

impl BatchHandler<Revision> for DownloadHandler {
    fn process(&self, batch: Vec<Revision>) -> BoxFuture<'_, ()> {
        let puller = self.puller.upgrade();
        Box::pin(async move {
            if let Some(puller) = puller {
                puller.insert_downloads(batch).await;
            }
            Ok(())
        })
    }
}

/// Pulls revisions from a remote database into the local store.
///
/// Derefs to [`Replication`] for `start`, `stop`, `subscribe` and the
/// other lifecycle calls.
pub struct Puller {
    core: Replication,
    state: Mutex<PullState>,
    downloads: Batcher<Revision>,
    tracker: Mutex<Option<TrackerSlot>>,
}

impl Deref for Puller {
    type Target = Replication;

    fn deref(&self) -> &Replication {
        &self.core
    }
}

impl Puller {
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
        let downloads_config = config.settings.downloads.batch_config();
        Ok(Arc::new_cyclic(|weak: &Weak<Puller>| {
            let driver: Weak<dyn ReplicationDriver> = weak.clone();
            Puller {
                core: Replication::new(Direction::Pull, store, remote, authenticator, config, driver),
                state: Mutex::new(PullState::default()),
                downloads: Batcher::new(
                    "downloads",
                    downloads_config,
                    Arc::new(DownloadHandler {
                        puller: weak.clone(),
                    }),
                ),
                tracker: Mutex::new(None),
            }
        }))
    }

    /// Puller talking HTTP to `config.remote_url`.
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

    /// Revisions accepted but not yet inserted or resolved.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.pending_count()
    }

    /// Revisions waiting for a fetch slot.
    pub fn queued_count(&self) -> usize {
        self.state.lock().queued()
    }

    fn bulk_get_supported(&self) -> bool {
        is_sync_gateway_at_least(self.core.server_type().as_deref(), BULK_GET_MIN_VERSION)
    }

    // =========================================================================
    // Change Tracking
    // =========================================================================

    fn start_change_tracker(self: &Arc<Self>) {
        self.detach_tracker();

        let config = self.core.config();
        let settings = &config.settings;
        let continuous = config.continuous;
        let options = ChangeTrackerOptions {
            mode: if continuous {
                FeedMode::LongPoll
            } else {
                FeedMode::OneShot
            },
            since: self.core.last_sequence(),
            include_conflicts: true,
            filter: config.filter.clone(),
            filter_params: config.filter_params.clone(),
            doc_ids: config.doc_ids.clone(),
            heartbeat: settings.change_feed.heartbeat(),
            limit: settings.change_feed.limit,
            backoff: settings.change_feed.backoff(),
            rate_limit: settings.change_feed.rate_limit_config(),
            use_post: is_sync_gateway_at_least(
                self.core.server_type().as_deref(),
                POST_CHANGES_MIN_VERSION,
            ),
            session_id: self.core.session_id(),
        };
        debug!(
            session_id = %options.session_id,
            since = ?options.since,
            mode = ?options.mode,
            "Starting change tracker"
        );

        let adapter = Arc::new(TrackerAdapter {
            puller: Arc::downgrade(self),
            detached: AtomicBool::new(false),
        });
        let client: Arc<dyn ChangeTrackerClient> = adapter.clone();
        let tracker = ChangeTracker::new(Arc::clone(self.core.remote()), options, client);

        // A one-shot feed counts as outstanding work until it ends.
        if !continuous {
            self.core.async_task_started();
        }
        let mut slot = self.tracker.lock();
        tracker.start();
        *slot = Some(TrackerSlot { tracker, adapter });
    }

    /// Stop the current tracker and ignore its remaining callbacks.
    fn detach_tracker(&self) {
        let Some(slot) = self.tracker.lock().take() else {
            return;
        };
        slot.tracker.stop();
        if !slot.adapter.detached.swap(true, Ordering::SeqCst) && !self.core.is_continuous() {
            self.core.async_task_finished(1);
        }
    }

    async fn received_change(&self, change: ChangeEntry) {
        let count = change.revs.len();
        for rev_id in change.revs {
            let mut revision = Revision::new(change.doc_id.clone(), rev_id, change.deleted);
            revision.remote_sequence_id = Some(change.seq.clone());
            self.core.add_to_inbox(revision);
        }
        self.core.add_changes_count(count);

        let settings = &self.core.config().settings.pull;
        while self.state.lock().queued() > settings.backpressure_threshold && self.core.is_online() {
            trace!(session_id = %self.core.session_id(), "Download queue full, pausing change feed");
            tokio::time::sleep(settings.backpressure_pause()).await;
        }
    }

    fn tracker_stopped(&self, adapter: &TrackerAdapter, error: Option<Arc<ReplicationError>>) {
        let finished = {
            let mut slot = self.tracker.lock();
            let current = slot
                .as_ref()
                .is_some_and(|s| std::ptr::eq(Arc::as_ptr(&s.adapter), adapter));
            if current {
                slot.take()
            } else {
                None
            }
        };
        drop(finished);

        info!(
            session_id = %self.core.session_id(),
            error = ?error.as_ref().map(|e| e.to_string()),
            "Change tracker stopped"
        );
        if let Some(error) = error {
            if !self.core.has_error() {
                self.core.set_error_arc(error);
            }
        }
        self.core.flush_inbox();

        if self.core.is_continuous() {
            self.core.maybe_schedule_retry();
        } else {
            self.core.async_task_finished(1);
        }
    }

    // =========================================================================
    // Inbox
    // =========================================================================

    async fn handle_inbox(self: Arc<Self>, inbox: RevisionList) {
        let Some(last_sequence) = inbox.last().and_then(|r| r.remote_sequence_id.clone()) else {
            return;
        };
        let total = inbox.len();

        let missing = match self.core.store().find_missing_revisions(inbox).await {
            Ok(missing) => missing,
            Err(e) => {
                warn!(session_id = %self.core.session_id(), error = %e, "Failed to look up local revisions");
                self.core.remove_changes_count(total);
                self.core.set_error(e);
                return;
            }
        };
        self.core.remove_changes_count(total - missing.len());

        if missing.is_empty() {
            debug!(session_id = %self.core.session_id(), seq = %last_sequence, "No new remote revisions to fetch");
            let checkpointed = {
                let mut state = self.state.lock();
                let sequence = state.pending.add_value(last_sequence);
                state.pending.remove_sequence(sequence);
                state.pending.checkpointed_value()
            };
            if let Some(value) = checkpointed {
                self.core.set_last_sequence(value);
            }
            return;
        }

        debug!(session_id = %self.core.session_id(), count = missing.len(), "Fetching remote revisions");
        let bulk_get = self.bulk_get_supported();
        {
            let mut state = self.state.lock();
            for mut revision in missing {
                let remote_sequence = revision.remote_sequence_id.clone().unwrap_or_default();
                revision.sequence = state.pending.add_value(remote_sequence) as i64;
                if bulk_get || (revision.generation == 1 && !revision.deleted) {
                    state.bulk_revs.push_back(revision);
                } else if revision.deleted {
                    state.deleted.push_back(revision);
                } else {
                    state.individual.push_back(revision);
                }
            }
            metrics::set_pending_downloads(&self.core.session_id(), state.queued());
        }
        self.pull_remote_revisions();
    }

    // =========================================================================
    // Fetching
    // =========================================================================

    /// Start fetches until the connection cap is reached.
    ///
    /// Bulk batches go first, then individual revisions, then deletions.
    /// A bulk queue of one is fetched individually.
    fn pull_remote_revisions(self: &Arc<Self>) {
        if !self.core.is_online() {
            return;
        }
        let settings = &self.core.config().settings.pull;
        let max_bulk = settings.max_revs_per_bulk.max(2);

        let mut work = Vec::new();
        {
            let mut state = self.state.lock();
            while state.connections < settings.max_connections {
                let fetch = match state.bulk_revs.len() {
                    0 => match state.individual.pop_front().or_else(|| state.deleted.pop_front()) {
                        Some(revision) => Fetch::One(revision),
                        None => break,
                    },
                    1 => {
                        if let Some(revision) = state.bulk_revs.pop_front() {
                            state.individual.push_back(revision);
                        }
                        continue;
                    }
                    queued => {
                        let take = queued.min(max_bulk);
                        Fetch::Bulk(state.bulk_revs.drain(..take).collect())
                    }
                };
                state.connections += 1;
                work.push(fetch);
            }
        }

        for fetch in work {
            self.core.async_task_started();
            let puller = Arc::clone(self);
            tokio::spawn(async move {
                match fetch {
                    Fetch::Bulk(revisions) => puller.fetch_bulk(revisions).await,
                    Fetch::One(revision) => puller.fetch_revision(revision).await,
                }
                puller.state.lock().connections -= 1;
                puller.pull_remote_revisions();
                puller.core.async_task_finished(1);
            });
        }
    }

    /// Current local revision ids of the document, for `atts_since`.
    async fn known_revisions(&self, revision: &Revision) -> Vec<String> {
        if revision.generation <= 1 {
            return Vec::new();
        }
        let max = self.core.config().settings.pull.max_atts_since;
        match self
            .core
            .store()
            .get_all_revisions_of_document_id(&revision.doc_id, true)
            .await
        {
            Ok(revisions) => revisions.into_iter().take(max).map(|r| r.rev_id).collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn fetch_revision(&self, revision: Revision) {
        let mut path = format!(
            "{}?rev={}&revs=true&attachments=true",
            urlencoding::encode(&revision.doc_id),
            urlencoding::encode(&revision.rev_id)
        );
        let known = self.known_revisions(&revision).await;
        if !known.is_empty() {
            let known = json!(known).to_string();
            path.push_str(&format!("&atts_since={}", urlencoding::encode(&known)));
        }
        trace!(doc_id = %revision.doc_id, rev_id = %revision.rev_id, "Fetching revision");

        let request = RemoteRequest::get(path).header("Accept", MULTIPART_ACCEPT);
        let result = async {
            let response = self.core.send_request(request).await?;
            decode_document(response.content_type.as_deref(), &response.body)
        }
        .await;
        match result {
            Ok(properties) => self.queue_download(revision, properties),
            Err(e) => self.fetch_failed(vec![revision], e),
        }
    }

    async fn fetch_bulk(self: &Arc<Self>, revisions: Vec<Revision>) {
        if self.bulk_get_supported() {
            self.fetch_bulk_get(revisions).await;
        } else {
            self.fetch_all_docs(revisions).await;
        }
    }

    async fn fetch_bulk_get(self: &Arc<Self>, mut revisions: Vec<Revision>) {
        let mut downloader = BulkDownloader::new();
        for revision in &revisions {
            let known = self.known_revisions(revision).await;
            downloader.add(revision, &known);
        }
        debug!(session_id = %self.core.session_id(), count = downloader.len(), "Bulk fetching revisions");

        let result = async {
            let response = self.core.send_request(downloader.request()).await?;
            downloader.parse_response(&response)
        }
        .await;
        let parsed = match result {
            Ok(parsed) => parsed,
            Err(e) => return self.fetch_failed(revisions, e),
        };
        metrics::record_bulk_fetch(
            &self.core.session_id(),
            "bulk_get",
            revisions.len(),
            parsed.documents.len(),
        );

        for document in parsed.documents {
            let (Some(doc_id), Some(rev_id)) = (
                document.get("_id").and_then(Value::as_str),
                document.get("_rev").and_then(Value::as_str),
            ) else {
                warn!("Bulk get returned a document without _id or _rev");
                continue;
            };
            match take_revision(&mut revisions, doc_id, rev_id) {
                Some(revision) => self.queue_download(revision, document),
                None => debug!(doc_id, rev_id, "Bulk get returned an unrequested revision"),
            }
        }
        for failure in parsed.failures {
            let taken = failure
                .rev_id
                .as_deref()
                .and_then(|rev_id| take_revision(&mut revisions, &failure.doc_id, rev_id));
            if let Some(revision) = taken {
                warn!(
                    doc_id = %failure.doc_id,
                    status = failure.status,
                    reason = %failure.reason,
                    "Bulk get failed for revision"
                );
                self.fetch_failed(vec![revision], ReplicationError::http(failure.status, failure.reason));
            }
        }
        self.fetch_individually(revisions);
    }

    /// Fallback for servers without `_bulk_get`: only generation-1
    /// revisions without attachments can be taken from `_all_docs`.
    async fn fetch_all_docs(self: &Arc<Self>, mut revisions: Vec<Revision>) {
        let keys: Vec<&str> = revisions.iter().map(|r| r.doc_id.as_str()).collect();
        let request = RemoteRequest::post("_all_docs?include_docs=true", json!({ "keys": keys }));
        debug!(session_id = %self.core.session_id(), count = revisions.len(), "Fetching revisions via _all_docs");

        let result = async { self.core.send_request(request).await?.json_value() }.await;
        let body = match result {
            Ok(body) => body,
            Err(e) => return self.fetch_failed(revisions, e),
        };

        let requested = revisions.len();
        let mut received = 0;
        let rows = body.get("rows").and_then(Value::as_array).cloned().unwrap_or_default();
        for row in rows {
            let Some(Value::Object(mut document)) = row.get("doc").cloned() else {
                continue;
            };
            if document.contains_key("_attachments") {
                continue;
            }
            let (Some(doc_id), Some(rev_id)) = (
                document.get("_id").and_then(Value::as_str).map(str::to_string),
                document.get("_rev").and_then(Value::as_str).map(str::to_string),
            ) else {
                continue;
            };
            let Some((1, suffix)) = split_rev_id(&rev_id) else {
                continue;
            };
            document.insert("_revisions".into(), json!({ "start": 1, "ids": [suffix] }));
            if let Some(revision) = take_revision(&mut revisions, &doc_id, &rev_id) {
                received += 1;
                self.queue_download(revision, document);
            }
        }
        metrics::record_bulk_fetch(&self.core.session_id(), "all_docs", requested, received);
        self.fetch_individually(revisions);
    }

    fn fetch_individually(self: &Arc<Self>, revisions: Vec<Revision>) {
        if revisions.is_empty() {
            return;
        }
        debug!(count = revisions.len(), "Deferring revisions to individual fetch");
        {
            let mut state = self.state.lock();
            for revision in revisions {
                state.requeue(revision);
            }
        }
        self.pull_remote_revisions();
    }

    fn queue_download(&self, mut revision: Revision, properties: Properties) {
        if let Some(deleted) = properties.get("_deleted").and_then(Value::as_bool) {
            revision.deleted = deleted;
        }
        revision.properties = Some(properties);
        self.core.async_task_started();
        self.downloads.queue(revision);
    }

    fn fetch_failed(&self, revisions: Vec<Revision>, error: ReplicationError) {
        if matches!(error, ReplicationError::Cancelled) {
            if self.core.is_stopping() {
                debug!(count = revisions.len(), "Dropping fetches cancelled by stop");
            } else {
                let mut state = self.state.lock();
                for revision in revisions {
                    state.requeue(revision);
                }
            }
            return;
        }

        let session_id = self.core.session_id();
        let count = revisions.len();
        for revision in &revisions {
            warn!(
                session_id = %session_id,
                doc_id = %revision.doc_id,
                rev_id = %revision.rev_id,
                error = %error,
                "Failed to fetch revision"
            );
            metrics::record_revision_failed(&session_id, "pull");
        }
        self.state.lock().failed.extend(revisions);
        self.core.set_error(error);
        self.core.add_completed_changes_count(count);
    }

    // =========================================================================
    // Inserting
    // =========================================================================

    async fn insert_downloads(&self, mut batch: Vec<Revision>) {
        let started = Instant::now();
        let count = batch.len();
        let session_id = self.core.session_id();
        let store = Arc::clone(self.core.store());
        let source = self.core.remote_url().to_string();
        info!(session_id = %session_id, count, "Inserting downloaded revisions");

        batch.sort_by_key(|r| r.sequence);
        let mut resolved = Vec::with_capacity(count);
        let mut failed = Vec::new();

        match store.begin_transaction().await {
            Ok(()) => {
                for revision in batch {
                    let sequence = revision.sequence as u64;
                    let mut history = revision
                        .properties
                        .as_ref()
                        .map(parse_revision_history)
                        .unwrap_or_default();
                    if history.is_empty() {
                        if revision.generation > 1 {
                            warn!(
                                doc_id = %revision.doc_id,
                                rev_id = %revision.rev_id,
                                "Missing revision history in response"
                            );
                            self.core.set_error(ReplicationError::Upstream(format!(
                                "no _revisions for {} {}",
                                revision.doc_id, revision.rev_id
                            )));
                            failed.push(revision);
                            continue;
                        }
                        history.push(revision.rev_id.clone());
                    }

                    trace!(doc_id = %revision.doc_id, rev_id = %revision.rev_id, "Inserting revision");
                    match store.force_insert(revision.clone(), history, Some(source.clone())).await {
                        Ok(()) => resolved.push(sequence),
                        Err(e) if e.status() == status::FORBIDDEN => {
                            info!(
                                doc_id = %revision.doc_id,
                                rev_id = %revision.rev_id,
                                "Remote revision failed validation"
                            );
                            metrics::record_revision_rejected(&session_id);
                            resolved.push(sequence);
                        }
                        Err(e) => {
                            warn!(
                                doc_id = %revision.doc_id,
                                rev_id = %revision.rev_id,
                                error = %e,
                                "Failed to insert revision"
                            );
                            self.core.set_error(e);
                            failed.push(revision);
                        }
                    }
                }
                let commit = failed.len() < count;
                if let Err(e) = store.end_transaction(commit).await {
                    warn!(session_id = %session_id, error = %e, "Failed to end insert transaction");
                }
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to begin insert transaction");
                self.core.set_error(e);
                failed.extend(batch);
            }
        }

        for _ in &failed {
            metrics::record_revision_failed(&session_id, "pull");
        }
        metrics::record_insert_batch(&session_id, resolved.len(), failed.len(), started.elapsed());
        metrics::record_revisions_pulled(&session_id, resolved.len());

        let checkpointed = {
            let mut state = self.state.lock();
            for sequence in resolved {
                state.pending.remove_sequence(sequence);
            }
            state.failed.extend(failed);
            metrics::set_pending_downloads(&session_id, state.queued());
            state.pending.checkpointed_value()
        };
        if let Some(value) = checkpointed {
            self.core.set_last_sequence(value);
        }
        self.core.add_completed_changes_count(count);
        self.core.async_task_finished(count);
    }
}

/// Remove and return the revision matching `(doc_id, rev_id)`.
fn take_revision(revisions: &mut Vec<Revision>, doc_id: &str, rev_id: &str) -> Option<Revision> {
    let index = revisions
        .iter()
        .position(|r| r.doc_id == doc_id && r.rev_id == rev_id)?;
    Some(revisions.remove(index))
}

impl ReplicationDriver for Puller {
    fn core(&self) -> &Replication {
        &self.core
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.pending = SequenceMap::new();
        state.clear_queues();
        state.failed.clear();
    }

    fn begin_replicating(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.start_change_tracker();
            self.pull_remote_revisions();
            Ok(())
        })
    }

    fn process_inbox(self: Arc<Self>, inbox: RevisionList) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.handle_inbox(inbox).await;
            Ok(())
        })
    }

    fn stopping(&self) {
        self.detach_tracker();
        {
            let mut state = self.state.lock();
            state.clear_queues();
            state.failed.clear();
        }
        // Already fetched revisions are still inserted.
        self.downloads.flush();
    }

    fn suspend(&self) {
        self.detach_tracker();
    }

    fn retry(self: Arc<Self>) {
        self.core.clear_error();
        let requeued = {
            let mut state = self.state.lock();
            let failed = std::mem::take(&mut state.failed);
            let count = failed.len();
            for revision in failed {
                state.requeue(revision);
            }
            count
        };
        info!(session_id = %self.core.session_id(), requeued, "Retrying pull");
        if self.tracker.lock().is_none() {
            self.start_change_tracker();
        }
        self.pull_remote_revisions();
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication lifecycle.
//!
//! [`Replication`] is the state shared by both directions:
//! - Session bootstrap (cookie login) and remote checkpoint fetch
//! - Debounced checkpoint saves to `_local/<checkpoint id>`
//! - Async-task accounting, which drives the `Idle`/`Active` status
//! - Retry scheduling for continuous replications that hit errors
//! - Online/offline transitions and request cancellation
//!
//! [`Puller`] and [`Pusher`] each own a `Replication` and supply the
//! direction-specific steps (`begin_replicating`, `process_inbox`)
//! through the crate-internal `ReplicationDriver` trait. Both deref to
//! `Replication`, so `puller.start()` and `pusher.subscribe()` work.
//!
//! # Lifecycle
//!
//! ```text
//! start() ─▶ check_session ─▶ fetch checkpoint ─▶ begin_replicating
//!                                                      │
//!             changes ─▶ inbox Batcher ─▶ process_inbox ─▶ transfer
//!                                                      │
//!             set_last_sequence ─▶ (debounce) ─▶ PUT _local/<id>
//!
//! stop() ─▶ clear inbox, cancel requests ─▶ tasks drain ─▶ final save ─▶ Stopped
//! ```
//!
//! A one-shot replication stops by itself once it has no outstanding
//! tasks and nothing queued. A continuous one idles instead, and if it
//! went idle with an error it retries after `settings.retry_delay`.

mod bulk_downloader;
mod checkpoint;
mod puller;
mod pusher;
mod session;
mod types;

pub use bulk_downloader::{BulkDownloader, BulkGetResponse, BulkGetFailure};
pub use checkpoint::checkpoint_id;
pub use puller::Puller;
pub use pusher::{Pusher, RevisionTransformer};
pub use types::{Direction, ReplicationProgress, ReplicationStatus};

use crate::auth::Authenticator;
use crate::batch::{BatchHandler, Batcher};
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::remote::{mask_credentials, RemoteClient, RemoteRequest, RemoteResponse};
use crate::resilience::WorkerPool;
use crate::revision::{Revision, RevisionList};
use crate::store::LocalStore;
use crate::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

static LAST_SESSION_ID: AtomicUsize = AtomicUsize::new(0);

/// `repl001`, `repl002`, ... unique within the process.
fn next_session_id() -> String {
    let id = LAST_SESSION_ID.fetch_add(1, Ordering::Relaxed) + 1;
    format!("repl{id:03}")
}

/// Direction-specific half of a replication.
///
/// Implemented by [`Puller`] and [`Pusher`]. The core holds a weak
/// reference and upgrades it to call back in or to spawn tasks.
pub(crate) trait ReplicationDriver: Send + Sync + 'static {
    fn core(&self) -> &Replication;

    /// Drop per-run state. Called by `start()` before the bootstrap.
    fn reset(&self) {}

    /// Start moving revisions. Called after the checkpoint fetch, and
    /// again after `go_online()`.
    fn begin_replicating(self: Arc<Self>) -> BoxFuture<'static, ()>;

    /// Handle one inbox batch.
    fn process_inbox(self: Arc<Self>, inbox: RevisionList) -> BoxFuture<'static, ()>;

    /// Called when the remote has no checkpoint document.
    fn maybe_create_remote_db(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Stop producing work. Called once by `stop()`.
    fn stopping(&self) {}

    /// Suspend change observation for `go_offline()`. Pending work is kept.
    fn suspend(&self) {}

    /// Try again after a continuous replication went idle with an error.
    fn retry(self: Arc<Self>);
}

/// Feeds inbox batches to the driver.
struct InboxHandler {
    driver: Weak<dyn ReplicationDriver>,
}

impl BatchHandler<Revision> for InboxHandler {
    fn process(&self, batch: Vec<Revision>) -> BoxFuture<'_, ()> {
        let driver = self.driver.upgrade();
        Box::pin(async move {
            match driver {
                Some(driver) => {
                    let count = batch.len();
                    debug!(session_id = %driver.core().session_id(), count, "Processing inbox");
                    driver.process_inbox(batch).await
                }
                None => Ok(()),
            }
        })
    }

    fn batch_completed(&self) {
        if let Some(driver) = self.driver.upgrade() {
            driver.core().update_active();
        }
    }
}

/// What to do after the replication went idle.
enum IdleAction {
    Stop,
    Retry,
}

struct CoreState {
    session_id: String,
    running: bool,
    /// `stop()` was called; the run ends once tasks drain.
    stopping: bool,
    /// Run ended; the final checkpoint save is still going.
    finalizing: bool,
    online: bool,
    active: bool,
    /// `begin_replicating` has run for this session.
    bootstrapped: bool,
    async_task_count: usize,
    changes_count: usize,
    completed_changes_count: usize,
    last_sequence: Option<String>,
    last_sequence_changed: bool,
    saving_checkpoint: bool,
    overdue_for_save: bool,
    /// Body of the remote checkpoint document, including its `_rev`.
    remote_checkpoint: Option<Map<String, Value>>,
    error: Option<Arc<ReplicationError>>,
    /// `Server` header of the last response.
    server_type: Option<String>,
    retry_timer: Option<JoinHandle<()>>,
}

impl CoreState {
    fn status(&self) -> ReplicationStatus {
        if self.finalizing {
            ReplicationStatus::Active
        } else if !self.running {
            ReplicationStatus::Stopped
        } else if !self.online {
            ReplicationStatus::Offline
        } else if self.active {
            ReplicationStatus::Active
        } else {
            ReplicationStatus::Idle
        }
    }

    fn progress(&self) -> ReplicationProgress {
        ReplicationProgress {
            status: self.status(),
            error: self.error.clone(),
            changes_count: self.changes_count,
            completed_changes_count: self.completed_changes_count,
            last_sequence: self.last_sequence.clone(),
        }
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }
}

/// State and protocol steps shared by pull and push replications.
pub struct Replication {
    config: ReplicationConfig,
    direction: Direction,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteClient>,
    authenticator: Option<Arc<dyn Authenticator>>,
    driver: Weak<dyn ReplicationDriver>,
    checkpoint_id: String,
    inbox: Batcher<Revision>,
    /// Bounds concurrent outbound requests.
    workers: WorkerPool,
    state: Mutex<CoreState>,
    progress_tx: watch::Sender<ReplicationProgress>,
    /// Bumped to cancel every in-flight request.
    cancel_tx: watch::Sender<u64>,
    save_idle: Notify,
}

impl Replication {
    /// Must be called inside a Tokio runtime (the inbox batcher spawns).
    pub(crate) fn new(
        direction: Direction,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        authenticator: Option<Arc<dyn Authenticator>>,
        config: ReplicationConfig,
        driver: Weak<dyn ReplicationDriver>,
    ) -> Self {
        let checkpoint_id = checkpoint_id(
            &store.private_uuid(),
            remote.remote_url(),
            direction.is_push(),
            config.continuous,
            config.filter.as_deref(),
            &config.filter_params,
            &config.doc_ids,
        );
        let inbox = Batcher::new(
            "inbox",
            config.settings.inbox.batch_config(),
            Arc::new(InboxHandler {
                driver: driver.clone(),
            }),
        );
        let (progress_tx, _) = watch::channel(ReplicationProgress::default());
        let (cancel_tx, _) = watch::channel(0u64);

        Self {
            workers: WorkerPool::new(config.settings.request.worker_pool_size),
            config,
            direction,
            store,
            remote,
            authenticator,
            driver,
            checkpoint_id,
            inbox,
            state: Mutex::new(CoreState {
                session_id: String::new(),
                running: false,
                stopping: false,
                finalizing: false,
                online: true,
                active: false,
                bootstrapped: false,
                async_task_count: 0,
                changes_count: 0,
                completed_changes_count: 0,
                last_sequence: None,
                last_sequence_changed: false,
                saving_checkpoint: false,
                overdue_for_save: false,
                remote_checkpoint: None,
                error: None,
                server_type: None,
                retry_timer: None,
            }),
            progress_tx,
            cancel_tx,
            save_idle: Notify::new(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_push(&self) -> bool {
        self.direction.is_push()
    }

    pub fn is_continuous(&self) -> bool {
        self.config.continuous
    }

    /// Session id of the current or last run, empty before the first start.
    pub fn session_id(&self) -> String {
        self.state.lock().session_id.clone()
    }

    /// Remote database URL without credentials.
    pub fn remote_url(&self) -> &str {
        self.remote.remote_url()
    }

    /// Id of the `_local` checkpoint document for this configuration.
    pub fn checkpoint_id(&self) -> &str {
        &self.checkpoint_id
    }

    pub fn status(&self) -> ReplicationStatus {
        self.state.lock().status()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn last_error(&self) -> Option<Arc<ReplicationError>> {
        self.state.lock().error.clone()
    }

    /// Last checkpointed sequence.
    pub fn last_sequence(&self) -> Option<String> {
        self.state.lock().last_sequence.clone()
    }

    pub fn changes_count(&self) -> usize {
        self.state.lock().changes_count
    }

    pub fn completed_changes_count(&self) -> usize {
        self.state.lock().completed_changes_count
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> ReplicationProgress {
        self.progress_tx.borrow().clone()
    }

    /// Listen for status, error and progress changes.
    pub fn subscribe(&self) -> watch::Receiver<ReplicationProgress> {
        self.progress_tx.subscribe()
    }

    /// Wait until the replication reports `Stopped`.
    ///
    /// Returns at once if it is not running.
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(ReplicationProgress::is_stopped).await;
    }

    pub(crate) fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub(crate) fn remote(&self) -> &Arc<dyn RemoteClient> {
        &self.remote
    }

    pub(crate) fn server_type(&self) -> Option<String> {
        self.state.lock().server_type.clone()
    }

    pub(crate) fn is_online(&self) -> bool {
        let state = self.state.lock();
        state.running && state.online && !state.stopping
    }

    pub(crate) fn is_stopping(&self) -> bool {
        let state = self.state.lock();
        state.stopping || !state.running
    }

    /// Revisions waiting in the inbox or being processed.
    pub(crate) fn inbox_count(&self) -> usize {
        self.inbox.count()
    }

    pub(crate) fn flush_inbox(&self) {
        self.inbox.flush();
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start replicating.
    ///
    /// Fails if the local store is closed or a run is still in progress.
    pub fn start(&self) -> Result<()> {
        if !self.store.is_open() {
            warn!(url = %mask_credentials(self.remote_url()), "Not starting replication: database is closed");
            return Err(ReplicationError::InvalidState {
                expected: "open database".to_string(),
                actual: "closed database".to_string(),
            });
        }
        let driver = self
            .driver
            .upgrade()
            .ok_or_else(|| ReplicationError::Internal("replication is being dropped".to_string()))?;

        let session_id = {
            let mut state = self.state.lock();
            if state.running || state.finalizing {
                return Err(ReplicationError::InvalidState {
                    expected: ReplicationStatus::Stopped.to_string(),
                    actual: state.status().to_string(),
                });
            }
            state.session_id = next_session_id();
            state.running = true;
            state.stopping = false;
            state.online = true;
            state.active = false;
            state.bootstrapped = false;
            state.error = None;
            state.last_sequence = None;
            state.last_sequence_changed = false;
            state.overdue_for_save = false;
            state.remote_checkpoint = None;
            state.server_type = None;
            state.changes_count = 0;
            state.completed_changes_count = 0;
            state.session_id.clone()
        };

        info!(
            session_id = %session_id,
            direction = %self.direction,
            url = %mask_credentials(self.remote_url()),
            continuous = self.config.continuous,
            checkpoint_id = %self.checkpoint_id,
            "Starting replication"
        );
        driver.reset();
        self.spawn_bootstrap(driver);
        Ok(())
    }

    /// Stop replicating.
    ///
    /// Queued changes are dropped and in-flight requests cancelled.
    /// `Stopped` is published once outstanding tasks have drained and
    /// the final checkpoint has been saved. Safe to call repeatedly.
    pub fn stop(&self) {
        let session_id = {
            let mut state = self.state.lock();
            if !state.running || state.stopping {
                return;
            }
            state.stopping = true;
            state.cancel_retry();
            state.session_id.clone()
        };
        info!(session_id = %session_id, direction = %self.direction, "Stopping replication");

        self.inbox.clear();
        if let Some(driver) = self.driver.upgrade() {
            driver.stopping();
        }
        self.cancel_requests();

        let idle = self.state.lock().async_task_count == 0 && self.inbox.count() == 0;
        if idle {
            self.stopped();
        }
    }

    /// Stop, wait for the run to end, and start again.
    pub async fn restart(&self) -> Result<()> {
        self.stop();
        self.wait_until_stopped().await;
        self.start()
    }

    /// Suspend remote traffic. Returns false if already offline or not running.
    pub fn go_offline(&self) -> bool {
        let session_id = {
            let mut state = self.state.lock();
            if !state.running || !state.online {
                return false;
            }
            state.online = false;
            state.cancel_retry();
            state.session_id.clone()
        };
        info!(session_id = %session_id, "Going offline");
        if let Some(driver) = self.driver.upgrade() {
            driver.suspend();
        }
        self.cancel_requests();
        self.publish();
        true
    }

    /// Resume after [`go_offline`](Self::go_offline): clears the error and
    /// re-runs the session and checkpoint bootstrap.
    pub fn go_online(&self) -> bool {
        let Some(driver) = self.driver.upgrade() else {
            return false;
        };
        let session_id = {
            let mut state = self.state.lock();
            if !state.running || state.online || state.stopping {
                return false;
            }
            state.online = true;
            state.error = None;
            state.session_id.clone()
        };
        info!(session_id = %session_id, "Going online");
        self.publish();
        self.spawn_bootstrap(driver);
        true
    }

    /// The local database is closing: save the checkpoint and stop.
    ///
    /// If a remote save is still in flight, the local checkpoint is
    /// written directly so the next run can resume.
    pub async fn database_closing(&self) {
        self.save_last_sequence().await;
        self.stop();

        let (saving, sequence) = {
            let state = self.state.lock();
            (state.saving_checkpoint, state.last_sequence.clone())
        };
        if let (true, Some(sequence)) = (saving, sequence) {
            if let Err(e) = self
                .store
                .set_last_sequence(&sequence, &self.checkpoint_id, self.is_push())
                .await
            {
                warn!(error = %e, "Failed to persist local checkpoint while closing");
            }
        }
    }

    fn spawn_bootstrap(&self, driver: Arc<dyn ReplicationDriver>) {
        self.async_task_started();
        let span = info_span!(
            "replication",
            session_id = %self.session_id(),
            direction = %self.direction,
        );
        tokio::spawn(
            async move {
                let core = driver.core();
                let result = async {
                    core.check_session().await?;
                    core.fetch_remote_checkpoint_doc(&driver).await
                }
                .await;
                if let Err(e) = result {
                    core.report_error(e);
                }
                core.async_task_finished(1);
            }
            .instrument(span),
        );
    }

    /// Run ended: publish `Stopped` after the final checkpoint save.
    fn stopped(&self) {
        let session_id = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.stopping = false;
            state.finalizing = true;
            state.active = false;
            state.changes_count = 0;
            state.completed_changes_count = 0;
            state.cancel_retry();
            state.session_id.clone()
        };
        info!(session_id = %session_id, direction = %self.direction, "Replication stopped");

        match self.driver.upgrade() {
            Some(driver) => {
                tokio::spawn(async move {
                    let core = driver.core();
                    core.wait_for_save_idle().await;
                    core.save_last_sequence().await;
                    core.state.lock().finalizing = false;
                    core.publish();
                });
            }
            None => {
                self.state.lock().finalizing = false;
                self.publish();
            }
        }
    }

    // =========================================================================
    // Activity Tracking
    // =========================================================================

    pub(crate) fn add_to_inbox(&self, revision: Revision) {
        self.inbox.queue(revision);
        self.update_active();
    }

    pub(crate) fn async_task_started(&self) {
        let (first, session_id, count) = {
            let mut state = self.state.lock();
            state.async_task_count += 1;
            (state.async_task_count == 1, state.session_id.clone(), state.async_task_count)
        };
        metrics::set_active_tasks(&session_id, count);
        if first {
            self.update_active();
        }
    }

    pub(crate) fn async_task_finished(&self, tasks: usize) {
        let (idle, session_id, count) = {
            let mut state = self.state.lock();
            if tasks > state.async_task_count {
                warn!(
                    session_id = %state.session_id,
                    tasks,
                    outstanding = state.async_task_count,
                    "More async tasks finished than started"
                );
            }
            state.async_task_count = state.async_task_count.saturating_sub(tasks);
            (state.async_task_count == 0, state.session_id.clone(), state.async_task_count)
        };
        metrics::set_active_tasks(&session_id, count);
        if idle {
            self.update_active();
        }
    }

    /// Recompute `Active`; on the transition to inactive, stop a one-shot
    /// replication or schedule a retry for a failed continuous one.
    pub(crate) fn update_active(&self) {
        let batched = self.inbox.count();
        let action = {
            let mut state = self.state.lock();
            let active = batched > 0 || state.async_task_count > 0;
            if state.active == active {
                return;
            }
            state.active = active;
            debug!(
                session_id = %state.session_id,
                active,
                tasks = state.async_task_count,
                batched,
                "Replication activity changed"
            );
            // A pending stop completes even while offline.
            if active || !state.running {
                None
            } else if state.stopping {
                Some(IdleAction::Stop)
            } else if !state.online {
                None
            } else if !self.config.continuous {
                Some(IdleAction::Stop)
            } else if state.error.is_some() {
                Some(IdleAction::Retry)
            } else {
                None
            }
        };
        self.publish();
        match action {
            Some(IdleAction::Stop) => self.stopped(),
            Some(IdleAction::Retry) => self.schedule_retry_if_ready(),
            None => {}
        }
    }

    pub(crate) fn add_changes_count(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.state.lock().changes_count += count;
        self.publish();
    }

    pub(crate) fn remove_changes_count(&self, count: usize) {
        if count == 0 {
            return;
        }
        {
            let mut state = self.state.lock();
            state.changes_count = state.changes_count.saturating_sub(count);
        }
        self.publish();
    }

    pub(crate) fn add_completed_changes_count(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.state.lock().completed_changes_count += count;
        self.publish();
    }

    fn publish(&self) {
        let state = self.state.lock();
        let progress = state.progress();
        metrics::set_replication_status(&state.session_id, progress.status.as_str());
        self.progress_tx.send_replace(progress);
    }

    // =========================================================================
    // Errors and Retry
    // =========================================================================

    pub(crate) fn set_error(&self, error: ReplicationError) {
        self.set_error_arc(Arc::new(error));
    }

    pub(crate) fn set_error_arc(&self, error: Arc<ReplicationError>) {
        let session_id = {
            let mut state = self.state.lock();
            state.error = Some(Arc::clone(&error));
            state.session_id.clone()
        };
        warn!(session_id = %session_id, error = %error, "Replication error");
        metrics::record_error(&session_id, error.kind());
        self.publish();
    }

    pub(crate) fn has_error(&self) -> bool {
        self.state.lock().error.is_some()
    }

    pub(crate) fn clear_error(&self) {
        self.state.lock().error = None;
        self.publish();
    }

    /// Record a failure unless it only reflects `stop`/`go_offline`.
    pub(crate) fn report_error(&self, error: ReplicationError) {
        if matches!(error, ReplicationError::Cancelled) {
            debug!(session_id = %self.session_id(), "Operation cancelled");
            return;
        }
        self.set_error(error);
    }

    /// Schedule a retry if a continuous replication sits idle with an error.
    pub(crate) fn maybe_schedule_retry(&self) {
        let ready = {
            let state = self.state.lock();
            self.config.continuous
                && state.running
                && !state.stopping
                && !state.active
                && state.error.is_some()
        };
        if ready {
            self.schedule_retry_if_ready();
        }
    }

    fn schedule_retry_if_ready(&self) {
        let Some(driver) = self.driver.upgrade() else {
            return;
        };
        let delay = self.config.settings.retry_delay();
        let mut state = self.state.lock();
        state.cancel_retry();
        info!(
            session_id = %state.session_id,
            delay_ms = delay.as_millis() as u64,
            "Replication idle with an error, scheduling retry"
        );
        // The timer does no awaiting after its sleep, so aborting it is always clean.
        state.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            driver.core().retry_if_ready(Arc::clone(&driver));
        }));
    }

    fn retry_if_ready(&self, driver: Arc<dyn ReplicationDriver>) {
        let (online, bootstrapped, session_id) = {
            let mut state = self.state.lock();
            // Called from the timer itself; forget it without aborting.
            state.retry_timer = None;
            if !state.running || state.stopping {
                return;
            }
            (state.online, state.bootstrapped, state.session_id.clone())
        };
        if !online {
            self.schedule_retry_if_ready();
            return;
        }
        info!(session_id = %session_id, "Retrying replication");
        if bootstrapped {
            driver.retry();
        } else {
            self.clear_error();
            self.spawn_bootstrap(driver);
        }
    }

    // =========================================================================
    // Remote Requests
    // =========================================================================

    /// Send a request on behalf of the replication.
    ///
    /// Refused with [`ReplicationError::Cancelled`] while stopping or
    /// offline. Transient failures are retried per `settings.request`.
    pub(crate) async fn send_request(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        if !self.is_online() {
            return Err(ReplicationError::Cancelled);
        }
        self.send_with_retry(request).await
    }

    /// Like [`send_request`](Self::send_request) but allowed after `stop()`,
    /// for the final checkpoint save.
    pub(crate) async fn send_checkpoint_request(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        self.send_with_retry(request).await
    }

    async fn send_with_retry(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        let mut cancel_rx = self.cancel_tx.subscribe();
        let generation = *cancel_rx.borrow_and_update();
        let operation = request_operation(&request);
        let retry = self.config.settings.request.retry_config();
        let mut attempt = 0usize;

        loop {
            let acquired = tokio::select! {
                biased;
                _ = cancelled(&mut cancel_rx, generation) => None,
                permit = self.workers.acquire() => Some(permit),
            };
            let permit = match acquired {
                None => {
                    metrics::record_request_cancelled(&operation);
                    return Err(ReplicationError::Cancelled);
                }
                Some(permit) => permit?,
            };

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancelled(&mut cancel_rx, generation) => {
                    metrics::record_request_cancelled(&operation);
                    return Err(ReplicationError::Cancelled);
                }
                result = self.remote.send(request.clone()) => result,
            };
            let status = match &result {
                Ok(response) => response.status,
                Err(e) => e.status(),
            };
            metrics::record_request(&operation, status, started.elapsed());

            match result {
                Ok(response) => {
                    if let Some(server) = &response.server {
                        self.state.lock().server_type = Some(server.clone());
                    }
                    return Ok(response);
                }
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    debug!(
                        operation = %operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying request"
                    );
                    metrics::record_request_retry(&operation);
                    drop(permit);
                    tokio::select! {
                        biased;
                        _ = cancelled(&mut cancel_rx, generation) => {
                            metrics::record_request_cancelled(&operation);
                            return Err(ReplicationError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn cancel_requests(&self) {
        self.cancel_tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

/// Resolves once the cancel generation moves past `generation`.
async fn cancelled(rx: &mut watch::Receiver<u64>, generation: u64) {
    let _ = rx.wait_for(|current| *current != generation).await;
}

/// Low-cardinality label for request metrics: `PUT _local`, `GET doc`.
fn request_operation(request: &RemoteRequest) -> String {
    let path = request.path.trim_start_matches('/');
    let first = path.split(['/', '?']).next().unwrap_or("");
    let target = if first.starts_with('_') { first } else { "doc" };
    format!("{} {}", request.method, target)
}

/// A running core with no driver attached, for exercising requests,
/// sessions and checkpoints in isolation.
#[cfg(test)]
pub(crate) fn detached_core(
    remote: Arc<dyn RemoteClient>,
    authenticator: Option<Arc<dyn Authenticator>>,
) -> Replication {
    let driver: Weak<dyn ReplicationDriver> = Weak::<Pusher>::new();
    let core = Replication::new(
        Direction::Push,
        Arc::new(crate::store::MemoryStore::new()),
        remote,
        authenticator,
        ReplicationConfig::for_testing("http://mock.local/db"),
        driver,
    );
    core.state.lock().running = true;
    core
}

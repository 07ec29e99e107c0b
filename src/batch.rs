//! Delayed batching of queued items.
//!
//! Items are queued from any task and handed to a single worker, which
//! delivers them to a [`BatchHandler`] in lists of at most `capacity`
//! items, after a quiescence delay or as soon as the inbox fills up.
//!
//! # Design
//!
//! ```text
//! queue() ──┐
//! queue() ──┼──▶ inbox (VecDeque) ──▶ worker task ──▶ handler.process(batch)
//! flush() ──┘        │                    ▲
//!                    └── deadline ────────┘  (delay | 0 when idle | 0 when full)
//! ```
//!
//! The worker processes one batch at a time, so the handler never sees
//! two batches concurrently and batches arrive in queue order.
//!
//! To keep latency low, an item queued after the batcher has been idle
//! for at least `delay` is scheduled immediately.

use crate::error::Result;
use crate::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for a batcher.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum items per delivered batch. A full inbox is processed at once.
    pub capacity: usize,
    /// Maximum time to collect items before processing them.
    pub delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            delay: Duration::from_millis(500),
        }
    }
}

impl BatchConfig {
    pub fn new(capacity: usize, delay: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            delay,
        }
    }

    /// Fast flush for testing.
    pub fn testing() -> Self {
        Self {
            capacity: 10,
            delay: Duration::from_millis(5),
        }
    }
}

/// Receiver of delivered batches.
pub trait BatchHandler<T>: Send + Sync + 'static {
    /// Process one batch. Errors are logged; the batcher keeps running.
    fn process(&self, batch: Vec<T>) -> BoxFuture<'_, ()>;

    /// Called after each batch, once it no longer counts as queued.
    fn batch_completed(&self) {}
}

struct BatchState<T> {
    inbox: VecDeque<T>,
    /// When the worker should next process. `None` means idle.
    deadline: Option<Instant>,
    last_processed: Option<Instant>,
    /// Items taken from the inbox whose batch is still being processed.
    in_flight: usize,
}

struct Shared<T> {
    state: Mutex<BatchState<T>>,
    wake: Notify,
    /// Serializes batch delivery between the worker and `flush_all`.
    process_lock: tokio::sync::Mutex<()>,
    handler: Arc<dyn BatchHandler<T>>,
    config: BatchConfig,
    name: &'static str,
}

/// Queues items and delivers them in batches.
///
/// The worker task stops when the batcher is dropped.
pub struct Batcher<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<T: Send + 'static> Batcher<T> {
    /// Create a batcher and spawn its worker. Must be called inside a Tokio runtime.
    pub fn new(name: &'static str, config: BatchConfig, handler: Arc<dyn BatchHandler<T>>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(BatchState {
                inbox: VecDeque::new(),
                deadline: None,
                last_processed: None,
                in_flight: 0,
            }),
            wake: Notify::new(),
            process_lock: tokio::sync::Mutex::new(()),
            handler,
            config,
            name,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_worker(Arc::clone(&shared), shutdown_rx));
        Self {
            shared,
            shutdown_tx,
        }
    }

    /// Add one item.
    pub fn queue(&self, item: T) {
        self.queue_many(std::iter::once(item));
    }

    /// Add several items, scheduling delivery.
    pub fn queue_many(&self, items: impl IntoIterator<Item = T>) {
        let mut state = self.shared.state.lock();
        let before = state.inbox.len();
        state.inbox.extend(items);
        if state.inbox.len() == before {
            return;
        }

        let now = Instant::now();
        let delay = if state.inbox.len() >= self.shared.config.capacity {
            Duration::ZERO
        } else {
            match state.last_processed {
                Some(last) if now.duration_since(last) < self.shared.config.delay => {
                    self.shared.config.delay
                }
                _ => Duration::ZERO,
            }
        };
        schedule(&mut state, now + delay);
        drop(state);
        self.shared.wake.notify_one();
    }

    /// Deliver queued items now, up to one batch at a time.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        if state.inbox.is_empty() {
            return;
        }
        schedule(&mut state, Instant::now());
        drop(state);
        self.shared.wake.notify_one();
    }

    /// Deliver every queued item and wait until the inbox is empty.
    ///
    /// Unlike regular delivery, each batch holds everything queued so far.
    pub async fn flush_all(&self) {
        loop {
            let _guard = self.shared.process_lock.lock().await;
            let batch: Vec<T> = {
                let mut state = self.shared.state.lock();
                state.deadline = None;
                if state.inbox.is_empty() {
                    return;
                }
                let batch: Vec<T> = state.inbox.drain(..).collect();
                state.in_flight += batch.len();
                batch
            };
            deliver(&self.shared, batch).await;
        }
    }

    /// Drop all queued items without processing them.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        let dropped = state.inbox.len();
        state.inbox.clear();
        state.deadline = None;
        if dropped > 0 {
            debug!(batcher = self.shared.name, dropped, "Cleared batcher inbox");
        }
    }

    /// Items queued or currently being processed.
    pub fn count(&self) -> usize {
        let state = self.shared.state.lock();
        state.inbox.len() + state.in_flight
    }

    /// Items waiting in the inbox.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().inbox.len()
    }
}

impl<T: Send + 'static> Drop for Batcher<T> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Move the deadline earlier, never later.
fn schedule<T>(state: &mut BatchState<T>, at: Instant) {
    match state.deadline {
        Some(current) if current <= at => {}
        _ => state.deadline = Some(at),
    }
}

async fn run_worker<T: Send + 'static>(shared: Arc<Shared<T>>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        let deadline = shared.state.lock().deadline;
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = shared.wake.notified() => {}
            _ = wait_until(deadline) => {
                process_now(&shared).await;
            }
        }
    }
    debug!(batcher = shared.name, "Batcher worker stopped");
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn process_now<T: Send + 'static>(shared: &Arc<Shared<T>>) {
    let _guard = shared.process_lock.lock().await;
    let batch: Vec<T> = {
        let mut state = shared.state.lock();
        state.deadline = None;
        if state.inbox.is_empty() {
            return;
        }
        let take = state.inbox.len().min(shared.config.capacity);
        let batch: Vec<T> = state.inbox.drain(..take).collect();
        if !state.inbox.is_empty() {
            // More left over, schedule them right away.
            state.deadline = Some(Instant::now());
        }
        state.in_flight += batch.len();
        batch
    };
    deliver(shared, batch).await;
}

async fn deliver<T: Send + 'static>(shared: &Arc<Shared<T>>, batch: Vec<T>) {
    let size = batch.len();
    debug!(batcher = shared.name, size, "Processing batch");
    let result: Result<()> = shared.handler.process(batch).await;
    if let Err(e) = result {
        warn!(batcher = shared.name, error = %e, "Batch processor failed");
    }
    {
        let mut state = shared.state.lock();
        state.in_flight -= size;
        state.last_processed = Some(Instant::now());
    }
    shared.handler.batch_completed();
}

//! Retry schedules, change feed backoff, poll limiting and the request
//! worker pool.
//!
//! - [`RetryConfig`]: delay schedule for retrying transient failures
//! - [`Backoff`]: consecutive-failure counter driving the change feed's sleeps
//! - [`RateLimiter`]: caps how often the change feed polls
//! - [`WorkerPool`]: bounds concurrent requests to the remote
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> couch_replicator::Result<()> {
//! use couch_replicator::resilience::{Backoff, RetryConfig, WorkerPool};
//!
//! let mut backoff = Backoff::new(RetryConfig::change_feed());
//! let delay = backoff.next_delay(); // 1s, then 2s, 4s ... capped at 5 minutes
//! backoff.reset();                  // after the next good poll
//!
//! let pool = WorkerPool::new(5);
//! let _slot = pool.acquire().await?;
//! // slot dropped = request finished
//! # let _ = delay;
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Governor};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Delay schedule for retrying a failed operation.
///
/// Attempt `n` (1-based) waits `initial_delay * backoff_factor^(n-1)`,
/// never more than `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts including the first. `usize::MAX` never gives up.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 1.0 gives a fixed delay.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::change_feed()
    }
}

impl RetryConfig {
    /// Change feed polling: retry forever, doubling up to 5 minutes.
    ///
    /// ```text
    /// Failure  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9        256s
    /// 10+      300s
    /// ```
    pub fn change_feed() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }

    /// Single remote requests: two retries, 10 seconds apart.
    pub fn request() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            backoff_factor: 1.0,
        }
    }

    /// Millisecond delays for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Delay before retry number `attempt` (1-based; 0 is treated as 1).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Counts consecutive failures and yields the delay before the next try.
///
/// Delays never shrink while failures continue, and drop back to the
/// initial delay after [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    failures: usize,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, failures: 0 }
    }

    /// Record a failure and return how long to sleep.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.config.delay_for_attempt(self.failures)
    }

    /// Record a success.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn attempts(&self) -> usize {
        self.failures
    }

    /// True once `max_attempts` failures have been recorded.
    pub fn exhausted(&self) -> bool {
        self.failures >= self.config.max_attempts
    }
}

// =============================================================================
// Poll Limiting
// =============================================================================

/// How often the change feed may poll.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained polls per second.
    pub polls_per_sec: u32,
    /// Polls allowed back to back before the rate applies.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            polls_per_sec: 10,
            burst: 20,
        }
    }
}

/// Token bucket over `governor`.
///
/// Keeps a feed that answers instantly (empty long polls from a
/// misbehaving proxy, say) from hammering the server.
pub struct RateLimiter {
    bucket: Governor<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let rate = NonZeroU32::new(config.polls_per_sec).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        Self {
            bucket: Governor::direct(Quota::per_second(rate).allow_burst(burst)),
        }
    }

    /// Wait for a poll slot. Cancel safe.
    pub async fn acquire(&self) {
        self.bucket.until_ready().await;
    }

    /// Take a poll slot if one is free right now.
    pub fn try_acquire(&self) -> bool {
        self.bucket.check().is_ok()
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Bounds how many requests one replication has in flight.
///
/// Callers past the limit wait for a slot; the slot frees when the
/// returned permit drops.
#[derive(Debug)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Pool of `size` workers (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ReplicationError::Internal("request worker pool closed".into()))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers not currently running a request.
    pub fn idle(&self) -> usize {
        self.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_feed_schedule_doubles_to_cap() {
        let config = RetryConfig::change_feed();
        let delays: Vec<u64> = (1..=10).map(|n| config.delay_for_attempt(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300]);
        assert_eq!(config.delay_for_attempt(usize::MAX), config.max_delay);
    }

    #[test]
    fn test_attempt_zero_uses_initial_delay() {
        let config = RetryConfig::testing();
        assert_eq!(config.delay_for_attempt(0), config.initial_delay);
        assert_eq!(config.delay_for_attempt(1), config.initial_delay);
    }

    #[test]
    fn test_request_schedule_is_fixed() {
        let config = RetryConfig::request();
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_exhausts_and_resets() {
        let mut backoff = Backoff::new(RetryConfig::testing());
        let first = backoff.next_delay();
        backoff.next_delay();
        assert!(!backoff.exhausted());
        assert!(backoff.next_delay() >= first);
        assert!(backoff.exhausted());

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), first);
    }

    #[test]
    fn test_rate_limiter_allows_burst_then_refuses() {
        let limiter = RateLimiter::new(RateLimitConfig {
            polls_per_sec: 1,
            burst: 3,
        });
        assert!((0..3).all(|_| limiter.try_acquire()));
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_rate_limiter_zero_config_still_polls() {
        let limiter = RateLimiter::new(RateLimitConfig {
            polls_per_sec: 0,
            burst: 0,
        });
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_worker_pool_queues_past_size() {
        let pool = Arc::new(WorkerPool::new(1));
        let held = pool.acquire().await.unwrap();
        assert_eq!(pool.idle(), 0);

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_worker_pool_has_at_least_one_worker() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}

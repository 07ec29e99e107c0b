//! Configuration for a replication.
//!
//! A [`ReplicationConfig`] describes one pull or push replication: the
//! remote database, whether it runs continuously, the optional filter,
//! and the tunables in [`ReplicationSettings`]. It can be built in code
//! or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use couch_replicator::config::ReplicationConfig;
//!
//! let config = ReplicationConfig {
//!     continuous: true,
//!     ..ReplicationConfig::new("http://sync.example.com:4984/db")
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── remote_url: String                 # Remote database URL
//! ├── continuous / create_target: bool
//! ├── filter / filter_params / doc_ids   # Feed filtering (part of the checkpoint id)
//! ├── request_headers: map               # Extra headers on every request
//! └── settings: ReplicationSettings
//!     ├── inbox: BatcherConfig           # Changes → process_inbox
//!     ├── downloads: BatcherConfig       # Pulled revisions → local insert
//!     ├── pull: PullConfig               # Connection cap, bulk sizes, backpressure
//!     ├── change_feed: ChangeFeedConfig  # _changes polling and backoff
//!     ├── checkpoint: CheckpointConfig   # Save debounce
//!     └── request: RequestConfig         # Retries, timeouts, worker pool
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! remote_url: "https://sync.example.com:4984/todos"
//! continuous: true
//! filter: "app/by_owner"
//! filter_params:
//!   owner: "alice"
//!
//! settings:
//!   change_feed:
//!     heartbeat: "5m"
//!     backoff_max: "2m"
//!   checkpoint:
//!     save_delay: "2s"
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use crate::batch::BatchConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: one replication
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything needed to run one pull or push replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Remote database URL, e.g. `http://host:4984/db`.
    /// May embed `user:password@` credentials for basic auth.
    pub remote_url: String,

    /// Keep running and idle instead of stopping once caught up.
    #[serde(default)]
    pub continuous: bool,

    /// Push only: create the remote database if it does not exist.
    #[serde(default)]
    pub create_target: bool,

    /// Name of the filter function.
    #[serde(default)]
    pub filter: Option<String>,

    /// Parameters passed to the filter function.
    #[serde(default)]
    pub filter_params: HashMap<String, Value>,

    /// Restrict replication to these document ids.
    #[serde(default)]
    pub doc_ids: Vec<String>,

    /// Extra headers sent with every request.
    #[serde(default)]
    pub request_headers: HashMap<String, String>,

    #[serde(default)]
    pub settings: ReplicationSettings,
}

impl ReplicationConfig {
    /// Config for `remote_url` with default settings.
    pub fn new(remote_url: impl Into<String>) -> Self {
        Self {
            remote_url: remote_url.into(),
            continuous: false,
            create_target: false,
            filter: None,
            filter_params: HashMap::new(),
            doc_ids: Vec::new(),
            request_headers: HashMap::new(),
            settings: ReplicationSettings::default(),
        }
    }

    /// Create a config with short delays for testing.
    pub fn for_testing(remote_url: impl Into<String>) -> Self {
        Self {
            settings: ReplicationSettings::for_testing(),
            ..Self::new(remote_url)
        }
    }

    /// Check the remote URL and settings.
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.remote_url)
            .map_err(|e| ReplicationError::Config(format!("invalid remote_url: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ReplicationError::Config(format!(
                "unsupported scheme '{}' in remote_url",
                url.scheme()
            )));
        }
        if self.settings.pull.max_connections == 0 {
            return Err(ReplicationError::Config("pull.max_connections must be > 0".into()));
        }
        if self.settings.inbox.capacity == 0 || self.settings.downloads.capacity == 0 {
            return Err(ReplicationError::Config("batcher capacity must be > 0".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunables for the replication pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default = "BatcherConfig::inbox")]
    pub inbox: BatcherConfig,
    #[serde(default = "BatcherConfig::downloads")]
    pub downloads: BatcherConfig,
    #[serde(default)]
    pub pull: PullConfig,
    #[serde(default)]
    pub change_feed: ChangeFeedConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub request: RequestConfig,

    /// How long a continuous replication waits before retrying after an error.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,
}

fn default_retry_delay() -> String {
    "60s".to_string()
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            inbox: BatcherConfig::inbox(),
            downloads: BatcherConfig::downloads(),
            pull: PullConfig::default(),
            change_feed: ChangeFeedConfig::default(),
            checkpoint: CheckpointConfig::default(),
            request: RequestConfig::default(),
            retry_delay: default_retry_delay(),
        }
    }
}

impl ReplicationSettings {
    /// Short delays everywhere so tests finish quickly.
    pub fn for_testing() -> Self {
        Self {
            inbox: BatcherConfig {
                capacity: 100,
                delay: "20ms".to_string(),
            },
            downloads: BatcherConfig {
                capacity: 200,
                delay: "20ms".to_string(),
            },
            pull: PullConfig {
                backpressure_pause: "10ms".to_string(),
                ..PullConfig::default()
            },
            change_feed: ChangeFeedConfig {
                backoff_initial: "10ms".to_string(),
                backoff_max: "100ms".to_string(),
                ..ChangeFeedConfig::default()
            },
            checkpoint: CheckpointConfig {
                save_delay: "50ms".to_string(),
            },
            request: RequestConfig {
                max_retries: 2,
                retry_delay: "10ms".to_string(),
                timeout: "5s".to_string(),
                worker_pool_size: 5,
            },
            retry_delay: "200ms".to_string(),
        }
    }

    pub fn retry_delay(&self) -> Duration {
        parse_duration(&self.retry_delay, Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BatcherConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Maximum items per batch.
    pub capacity: usize,
    /// Quiescence delay as a duration string (e.g. "500ms").
    pub delay: String,
}

impl BatcherConfig {
    /// Incoming changes: 100 items or 500ms.
    pub fn inbox() -> Self {
        Self {
            capacity: 100,
            delay: "500ms".to_string(),
        }
    }

    /// Downloaded revisions awaiting insert: 200 items or 1s.
    pub fn downloads() -> Self {
        Self {
            capacity: 200,
            delay: "1s".to_string(),
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig::new(self.capacity, parse_duration(&self.delay, Duration::from_millis(500)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PullConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Limits for fetching revisions from the remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    /// Maximum simultaneous revision downloads.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum revisions per `_bulk_get` request.
    #[serde(default = "default_max_bulk_revs")]
    pub max_revs_per_bulk: usize,

    /// Maximum known revision ids sent as `atts_since`.
    #[serde(default = "default_max_atts_since")]
    pub max_atts_since: usize,

    /// Pause change intake while more revisions than this await download.
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: usize,

    #[serde(default = "default_backpressure_pause")]
    pub backpressure_pause: String,
}

fn default_max_connections() -> usize {
    16
}

fn default_max_bulk_revs() -> usize {
    50
}

fn default_max_atts_since() -> usize {
    50
}

fn default_backpressure_threshold() -> usize {
    1000
}

fn default_backpressure_pause() -> String {
    "500ms".to_string()
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_revs_per_bulk: default_max_bulk_revs(),
            max_atts_since: default_max_atts_since(),
            backpressure_threshold: default_backpressure_threshold(),
            backpressure_pause: default_backpressure_pause(),
        }
    }
}

impl PullConfig {
    pub fn backpressure_pause(&self) -> Duration {
        parse_duration(&self.backpressure_pause, Duration::from_millis(500))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ChangeFeedConfig: _changes polling
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeFeedConfig {
    /// Server heartbeat interval requested for long-poll feeds.
    #[serde(default = "default_heartbeat")]
    pub heartbeat: String,

    /// Maximum changes per long-poll response.
    #[serde(default = "default_feed_limit")]
    pub limit: usize,

    #[serde(default = "default_backoff_initial")]
    pub backoff_initial: String,

    #[serde(default = "default_backoff_max")]
    pub backoff_max: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    // ─────────────────────────────────────────────────────────────────────────
    // Poll rate limiting
    // ─────────────────────────────────────────────────────────────────────────

    /// Limit how often the feed is polled.
    #[serde(default)]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_poll_rate")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_poll_burst")]
    pub rate_limit_burst: u32,
}

fn default_heartbeat() -> String {
    "300s".to_string()
}

fn default_feed_limit() -> usize {
    50
}

fn default_backoff_initial() -> String {
    "1s".to_string()
}

fn default_backoff_max() -> String {
    "5m".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_poll_rate() -> u32 {
    10
}

fn default_poll_burst() -> u32 {
    20
}

impl Default for ChangeFeedConfig {
    fn default() -> Self {
        Self {
            heartbeat: default_heartbeat(),
            limit: default_feed_limit(),
            backoff_initial: default_backoff_initial(),
            backoff_max: default_backoff_max(),
            backoff_factor: default_backoff_factor(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_poll_rate(),
            rate_limit_burst: default_poll_burst(),
        }
    }
}

impl ChangeFeedConfig {
    pub fn heartbeat(&self) -> Duration {
        parse_duration(&self.heartbeat, Duration::from_secs(300))
    }

    /// Backoff between failed polls. Retries never give up.
    pub fn backoff(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: usize::MAX,
            initial_delay: parse_duration(&self.backoff_initial, Duration::from_secs(1)),
            max_delay: parse_duration(&self.backoff_max, Duration::from_secs(300)),
            backoff_factor: self.backoff_factor.max(1.0),
        }
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_enabled.then(|| RateLimitConfig {
            polls_per_sec: self.rate_limit_per_sec,
            burst: self.rate_limit_burst,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Wait this long after the first unsaved change before saving.
    #[serde(default = "default_save_delay")]
    pub save_delay: String,
}

fn default_save_delay() -> String {
    "2s".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save_delay: default_save_delay(),
        }
    }
}

impl CheckpointConfig {
    pub fn save_delay(&self) -> Duration {
        parse_duration(&self.save_delay, Duration::from_secs(2))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RequestConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Outbound request behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Retries after a transient failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_request_retry_delay")]
    pub retry_delay: String,

    /// Timeout for one request, excluding the change feed.
    #[serde(default = "default_request_timeout")]
    pub timeout: String,

    /// Concurrent outbound requests.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

fn default_max_retries() -> usize {
    2
}

fn default_request_retry_delay() -> String {
    "10s".to_string()
}

fn default_request_timeout() -> String {
    "60s".to_string()
}

fn default_worker_pool_size() -> usize {
    5
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_request_retry_delay(),
            timeout: default_request_timeout(),
            worker_pool_size: default_worker_pool_size(),
        }
    }
}

impl RequestConfig {
    pub fn retry_config(&self) -> RetryConfig {
        let delay = parse_duration(&self.retry_delay, Duration::from_secs(10));
        RetryConfig {
            max_attempts: self.max_retries.saturating_add(1),
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
        }
    }

    pub fn timeout(&self) -> Duration {
        parse_duration(&self.timeout, Duration::from_secs(60))
    }
}

fn parse_duration(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

//! Replication state types.
//!
//! Defines the status a replication reports to its listeners.
//!
//! # State Transitions
//!
//! ```text
//!             start()
//! Stopped ─────────────→ Idle ←──────────────→ Active
//!    ↑                    │  (tasks or queued     │
//!    │                    │   revisions appear    │
//!    │                    │   / drain)            │
//!    │       go_offline() ↓                       │
//!    │                 Offline                    │
//!    │                    │ go_online()           │
//!    │                    └──────→ Idle           │
//!    │                                            │
//!    └──────── stop(), or one-shot work drained ──┘
//! ```
//!
//! # State Descriptions
//!
//! - **Stopped**: Not running. Initial state, and terminal state of a run.
//! - **Offline**: Running, but remote requests are suspended.
//! - **Idle**: Running with no outstanding work (continuous replications
//!   waiting for new changes).
//! - **Active**: Async tasks outstanding or revisions queued in the inbox.

use crate::error::ReplicationError;
use std::sync::Arc;

/// Status of a replication.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStatus {
    /// Not running.
    ///
    /// Call [`start()`](super::Replication::start) to begin.
    Stopped,

    /// Taken offline; pending work is kept until `go_online()`.
    Offline,

    /// Running with nothing to do.
    Idle,

    /// Transferring revisions.
    Active,
}

impl ReplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationStatus::Stopped => "Stopped",
            ReplicationStatus::Offline => "Offline",
            ReplicationStatus::Idle => "Idle",
            ReplicationStatus::Active => "Active",
        }
    }
}

impl std::fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way revisions flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Remote to local.
    Pull,
    /// Local to remote.
    Push,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        }
    }

    pub fn is_push(&self) -> bool {
        matches!(self, Direction::Push)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published to listeners on every change.
#[derive(Debug, Clone)]
pub struct ReplicationProgress {
    pub status: ReplicationStatus,
    /// Last error, cleared by a successful retry or `go_online()`.
    pub error: Option<Arc<ReplicationError>>,
    /// Revisions this run has found to transfer.
    pub changes_count: usize,
    /// Revisions this run has finished with, successfully or not.
    pub completed_changes_count: usize,
    /// Checkpointed remote (pull) or local (push) sequence.
    pub last_sequence: Option<String>,
}

impl Default for ReplicationProgress {
    fn default() -> Self {
        Self {
            status: ReplicationStatus::Stopped,
            error: None,
            changes_count: 0,
            completed_changes_count: 0,
            last_sequence: None,
        }
    }
}

impl ReplicationProgress {
    pub fn is_stopped(&self) -> bool {
        self.status == ReplicationStatus::Stopped
    }
}

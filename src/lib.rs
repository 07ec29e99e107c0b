//! # Couch Replicator
//!
//! Pull and push replication between a local document store and a
//! CouchDB-compatible HTTP database (CouchDB, Sync Gateway).
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              couch-replicator                             │
//! │                                                                           │
//! │  Puller                                                                   │
//! │  ┌───────────────┐   ┌───────┐   ┌──────────────────┐   ┌──────────────┐  │
//! │  │ ChangeTracker │──►│ inbox │──►│ bulk / single GET│──►│ force_insert │  │
//! │  │ (_changes)    │   │       │   │ (_bulk_get)      │   │ (LocalStore) │  │
//! │  └───────────────┘   └───────┘   └──────────────────┘   └──────────────┘  │
//! │                                                                           │
//! │  Pusher                                                                   │
//! │  ┌───────────────┐   ┌───────┐   ┌──────────────────┐   ┌──────────────┐  │
//! │  │ changes_since │──►│ inbox │──►│ _revs_diff       │──►│ _bulk_docs / │  │
//! │  │ + observer    │   │       │   │                  │   │ multipart PUT│  │
//! │  └───────────────┘   └───────┘   └──────────────────┘   └──────────────┘  │
//! │                                                                           │
//! │  Both: checkpoint in `_local/<id>` on the remote and in the local store   │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use couch_replicator::{MemoryStore, Puller, ReplicationConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> couch_replicator::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let config = ReplicationConfig::new("http://localhost:4984/db");
//!
//!     let puller = Puller::connect(store, config, None)?;
//!     puller.start()?;
//!     puller.wait_until_stopped().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod batch;
pub mod change_tracker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod multipart;
pub mod remote;
pub mod replication;
pub mod resilience;
pub mod revision;
pub mod sequence_map;
pub mod store;

/// Boxed future resolving to a crate [`Result`]. Used at the trait seams
/// (store, remote, batch handlers) so they stay object safe.
pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, Result<T>>;

// Re-exports for convenience
pub use auth::{Authenticator, BasicAuthenticator, SessionAuthenticator};
pub use config::{ReplicationConfig, ReplicationSettings};
pub use error::{ReplicationError, Result};
pub use remote::{HttpRemote, RemoteClient, RemoteRequest, RemoteResponse};
pub use replication::{
    checkpoint_id, Direction, Puller, Pusher, Replication, ReplicationProgress,
    ReplicationStatus, RevisionTransformer,
};
pub use revision::{Properties, Revision, RevisionList};
pub use store::{ChangesOptions, DatabaseChange, LocalStore, MemoryStore, ReplicationFilter};

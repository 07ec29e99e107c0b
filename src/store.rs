// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local document store integration.
//!
//! The replicator does not own a storage engine. It drives one through
//! [`LocalStore`]: asking which revisions are missing, force-inserting
//! pulled revisions with their history, enumerating local changes to push,
//! and persisting checkpoints.
//!
//! [`MemoryStore`] is a small in-process implementation with a flat
//! revision tree, used by tests and by embedders that only need to
//! mirror a remote database.
//!
//! # Example
//!
//! ```rust,no_run
//! use couch_replicator::store::{LocalStore, MemoryStore};
//! use serde_json::json;
//!
//! # async fn example() -> couch_replicator::Result<()> {
//! let store = MemoryStore::new();
//! let rev = store.put("doc1", json!({"title": "hello"}), None)?;
//! assert_eq!(rev.generation, 1);
//! let missing = store.find_missing_revisions(vec![rev]).await?;
//! assert!(missing.is_empty());
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result, StoreError};
use crate::revision::{parse_generation, Properties, Revision, RevisionList};
use crate::BoxFuture;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Push filter: decides whether a local revision is replicated.
pub type ReplicationFilter = Arc<dyn Fn(&Revision, &HashMap<String, Value>) -> bool + Send + Sync>;

/// Options for [`LocalStore::changes_since`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangesOptions {
    /// Report every current revision of conflicted documents, not just the winner.
    pub include_conflicts: bool,
    pub limit: Option<usize>,
}

/// A revision added to the local store.
#[derive(Debug, Clone)]
pub struct DatabaseChange {
    pub revision: Revision,
    /// Remote URL the revision was pulled from, `None` if authored locally.
    pub source: Option<String>,
}

/// What the replicator needs from the local store.
pub trait LocalStore: Send + Sync + 'static {
    /// False once the database has been closed.
    fn is_open(&self) -> bool;

    /// Stable private identity of this database, part of checkpoint ids.
    fn private_uuid(&self) -> String;

    /// Locally saved checkpoint for `checkpoint_id`, per direction.
    fn last_sequence_with_checkpoint_id(&self, checkpoint_id: &str, push: bool) -> BoxFuture<'_, Option<String>>;

    fn set_last_sequence(&self, sequence: &str, checkpoint_id: &str, push: bool) -> BoxFuture<'_, ()>;

    /// Return the subset of `revisions` not present locally, in order.
    fn find_missing_revisions(&self, revisions: RevisionList) -> BoxFuture<'_, RevisionList>;

    /// Insert a revision with its newest-first history, keeping the given rev id.
    fn force_insert(&self, revision: Revision, history: Vec<String>, source: Option<String>) -> BoxFuture<'_, ()>;

    fn begin_transaction(&self) -> BoxFuture<'_, ()>;

    fn end_transaction(&self, commit: bool) -> BoxFuture<'_, ()>;

    /// Current revisions changed after local sequence `since`, in sequence order.
    fn changes_since(&self, since: i64, options: ChangesOptions) -> BoxFuture<'_, RevisionList>;

    fn get_all_revisions_of_document_id(&self, doc_id: &str, only_current: bool) -> BoxFuture<'_, RevisionList>;

    /// Fill in the body of `revision`, attachments inlined as base64 `data`.
    fn load_revision_body(&self, revision: Revision) -> BoxFuture<'_, Revision>;

    /// Newest-first revision ids from `revision` back to the root.
    fn revision_history(&self, revision: &Revision) -> BoxFuture<'_, Vec<String>>;

    /// Stream of revisions added from now on.
    fn subscribe_changes(&self) -> broadcast::Receiver<DatabaseChange>;

    /// Look up a named push filter.
    fn replication_filter(&self, name: &str) -> Option<ReplicationFilter>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryStore
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct StoredRevision {
    revision: Revision,
    history: Vec<String>,
}

#[derive(Default)]
struct MemoryInner {
    docs: HashMap<String, HashMap<String, StoredRevision>>,
    last_sequence: i64,
}

impl MemoryInner {
    /// Revisions of `doc_id` that are not an ancestor of another revision.
    fn leaves(&self, doc_id: &str) -> Vec<&StoredRevision> {
        let Some(revs) = self.docs.get(doc_id) else {
            return Vec::new();
        };
        let ancestors: HashSet<&str> = revs
            .values()
            .flat_map(|r| r.history.iter().skip(1).map(String::as_str))
            .collect();
        let mut leaves: Vec<&StoredRevision> = revs
            .values()
            .filter(|r| !ancestors.contains(r.revision.rev_id.as_str()))
            .collect();
        // Winner first: live before deleted, then highest generation, then highest rev id.
        leaves.sort_by(|a, b| {
            a.revision
                .deleted
                .cmp(&b.revision.deleted)
                .then(b.revision.generation.cmp(&a.revision.generation))
                .then(b.revision.rev_id.cmp(&a.revision.rev_id))
        });
        leaves
    }

    fn insert(&mut self, mut revision: Revision, history: Vec<String>) -> Option<Revision> {
        let revs = self.docs.entry(revision.doc_id.clone()).or_default();
        if revs.contains_key(&revision.rev_id) {
            return None;
        }
        self.last_sequence += 1;
        revision.sequence = self.last_sequence;
        if let Some(props) = revision.properties.as_mut() {
            props.remove("_revisions");
        }
        revs.insert(
            revision.rev_id.clone(),
            StoredRevision {
                revision: revision.clone(),
                history,
            },
        );
        Some(revision)
    }
}

/// In-memory [`LocalStore`].
pub struct MemoryStore {
    uuid: String,
    inner: RwLock<MemoryInner>,
    checkpoints: DashMap<(String, bool), String>,
    filters: DashMap<String, ReplicationFilter>,
    changes_tx: broadcast::Sender<DatabaseChange>,
    open: AtomicBool,
    transactions: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("uuid", &self.uuid)
            .field("last_sequence", &self.last_sequence())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_uuid(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn with_uuid(uuid: impl Into<String>) -> Self {
        let (changes_tx, _) = broadcast::channel(1024);
        Self {
            uuid: uuid.into(),
            inner: RwLock::new(MemoryInner::default()),
            checkpoints: DashMap::new(),
            filters: DashMap::new(),
            changes_tx,
            open: AtomicBool::new(true),
            transactions: AtomicUsize::new(0),
        }
    }

    /// Create a local revision, as an application write would.
    ///
    /// `prev_rev` must be the current revision when updating an existing document.
    pub fn put(&self, doc_id: &str, body: Value, prev_rev: Option<&str>) -> Result<Revision> {
        let Value::Object(mut props) = body else {
            return Err(StoreError::new(400, "document body must be an object").into());
        };
        let mut inner = self.inner.write();
        let parent_history = match prev_rev {
            Some(prev) => inner
                .docs
                .get(doc_id)
                .and_then(|revs| revs.get(prev))
                .map(|stored| stored.history.clone())
                .ok_or_else(|| StoreError::new(409, format!("{doc_id} has no revision {prev}")))?,
            None => {
                if !inner.leaves(doc_id).is_empty() {
                    return Err(StoreError::new(409, format!("{doc_id} already exists")).into());
                }
                Vec::new()
            }
        };
        let generation = prev_rev.map(parse_generation).unwrap_or(0) + 1;
        let rev_id = format!("{generation}-{}", uuid::Uuid::new_v4().simple());
        let deleted = props.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
        props.insert("_id".into(), Value::String(doc_id.to_string()));
        props.insert("_rev".into(), Value::String(rev_id.clone()));

        let mut history = vec![rev_id.clone()];
        history.extend(parent_history);
        let mut revision = Revision::new(doc_id, rev_id, deleted);
        revision.properties = Some(props);
        let revision = inner
            .insert(revision, history)
            .ok_or_else(|| ReplicationError::Internal("generated a duplicate revision id".into()))?;
        drop(inner);

        let _ = self.changes_tx.send(DatabaseChange {
            revision: revision.clone(),
            source: None,
        });
        Ok(revision)
    }

    /// Register a push filter under `name`.
    pub fn define_filter(&self, name: impl Into<String>, filter: ReplicationFilter) {
        self.filters.insert(name.into(), filter);
    }

    /// Stored revision, with body.
    pub fn get_revision(&self, doc_id: &str, rev_id: &str) -> Option<Revision> {
        let inner = self.inner.read();
        Some(inner.docs.get(doc_id)?.get(rev_id)?.revision.clone())
    }

    /// Winning revision of a document.
    pub fn get_document(&self, doc_id: &str) -> Option<Revision> {
        let inner = self.inner.read();
        inner.leaves(doc_id).first().map(|s| s.revision.clone())
    }

    pub fn document_count(&self) -> usize {
        let inner = self.inner.read();
        inner.docs.keys().filter(|id| !inner.leaves(id).is_empty()).count()
    }

    pub fn last_sequence(&self) -> i64 {
        self.inner.read().last_sequence
    }

    /// Open transactions, for tests.
    pub fn open_transactions(&self) -> usize {
        self.transactions.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl LocalStore for MemoryStore {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn private_uuid(&self) -> String {
        self.uuid.clone()
    }

    fn last_sequence_with_checkpoint_id(&self, checkpoint_id: &str, push: bool) -> BoxFuture<'_, Option<String>> {
        let value = self
            .checkpoints
            .get(&(checkpoint_id.to_string(), push))
            .map(|v| v.value().clone());
        Box::pin(async move { Ok(value) })
    }

    fn set_last_sequence(&self, sequence: &str, checkpoint_id: &str, push: bool) -> BoxFuture<'_, ()> {
        self.checkpoints
            .insert((checkpoint_id.to_string(), push), sequence.to_string());
        Box::pin(async { Ok(()) })
    }

    fn find_missing_revisions(&self, revisions: RevisionList) -> BoxFuture<'_, RevisionList> {
        Box::pin(async move {
            let inner = self.inner.read();
            Ok(revisions
                .into_iter()
                .filter(|rev| {
                    !inner
                        .docs
                        .get(&rev.doc_id)
                        .is_some_and(|revs| revs.contains_key(&rev.rev_id))
                })
                .collect())
        })
    }

    fn force_insert(&self, revision: Revision, history: Vec<String>, source: Option<String>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(StoreError::new(503, "database is closed").into());
            }
            let mut history = history;
            if history.first() != Some(&revision.rev_id) {
                history.insert(0, revision.rev_id.clone());
            }
            let inserted = self.inner.write().insert(revision, history);
            match inserted {
                Some(revision) => {
                    debug!(doc_id = %revision.doc_id, rev_id = %revision.rev_id, seq = revision.sequence, "Inserted revision");
                    let _ = self.changes_tx.send(DatabaseChange { revision, source });
                }
                None => debug!("Revision already present, skipping insert"),
            }
            Ok(())
        })
    }

    fn begin_transaction(&self) -> BoxFuture<'_, ()> {
        self.transactions.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn end_transaction(&self, _commit: bool) -> BoxFuture<'_, ()> {
        let _ = self
            .transactions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        Box::pin(async { Ok(()) })
    }

    fn changes_since(&self, since: i64, options: ChangesOptions) -> BoxFuture<'_, RevisionList> {
        Box::pin(async move {
            let inner = self.inner.read();
            let mut changes: RevisionList = inner
                .docs
                .keys()
                .flat_map(|doc_id| {
                    let leaves = inner.leaves(doc_id);
                    let take = if options.include_conflicts { leaves.len() } else { 1 };
                    leaves
                        .into_iter()
                        .take(take)
                        .map(|s| s.revision.clone())
                        .collect::<Vec<_>>()
                })
                .filter(|rev| rev.sequence > since)
                .collect();
            changes.sort_by_key(|rev| rev.sequence);
            if let Some(limit) = options.limit {
                changes.truncate(limit);
            }
            Ok(changes)
        })
    }

    fn get_all_revisions_of_document_id(&self, doc_id: &str, only_current: bool) -> BoxFuture<'_, RevisionList> {
        let doc_id = doc_id.to_string();
        Box::pin(async move {
            let inner = self.inner.read();
            let revs = if only_current {
                inner.leaves(&doc_id).into_iter().map(|s| s.revision.clone()).collect()
            } else {
                inner
                    .docs
                    .get(&doc_id)
                    .map(|revs| revs.values().map(|s| s.revision.clone()).collect())
                    .unwrap_or_default()
            };
            Ok(revs)
        })
    }

    fn load_revision_body(&self, revision: Revision) -> BoxFuture<'_, Revision> {
        Box::pin(async move {
            let inner = self.inner.read();
            let stored = inner
                .docs
                .get(&revision.doc_id)
                .and_then(|revs| revs.get(&revision.rev_id))
                .ok_or_else(|| StoreError::not_found(format!("{} {}", revision.doc_id, revision.rev_id)))?;
            let mut loaded = revision;
            loaded.deleted = stored.revision.deleted;
            loaded.properties = Some(
                stored
                    .revision
                    .properties
                    .clone()
                    .unwrap_or_else(Properties::new),
            );
            Ok(loaded)
        })
    }

    fn revision_history(&self, revision: &Revision) -> BoxFuture<'_, Vec<String>> {
        let history = self
            .inner
            .read()
            .docs
            .get(&revision.doc_id)
            .and_then(|revs| revs.get(&revision.rev_id))
            .map(|s| s.history.clone())
            .unwrap_or_else(|| vec![revision.rev_id.clone()]);
        Box::pin(async move { Ok(history) })
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<DatabaseChange> {
        self.changes_tx.subscribe()
    }

    fn replication_filter(&self, name: &str) -> Option<ReplicationFilter> {
        self.filters.get(name).map(|f| Arc::clone(f.value()))
    }
}

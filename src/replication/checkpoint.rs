//! Checkpoints.
//!
//! A replication remembers how far it got as a `lastSequence` stored in
//! two places: a `_local/<checkpoint id>` document on the remote, and the
//! local store under the same id. A run resumes from that sequence only
//! when both agree.
//!
//! Saves are debounced by `settings.checkpoint.save_delay`. A save
//! requested while another is in flight is replayed once it finishes.
//! A 409 refreshes the remote document's `_rev` and saves again; a 404
//! drops the cached body and saves again.

use super::{Replication, ReplicationDriver};
use crate::error::{status, ReplicationError, Result};
use crate::metrics;
use crate::remote::RemoteRequest;
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Checkpoint document id for a replication configuration.
///
/// SHA-1 hex of the canonical JSON form of the local database uuid,
/// remote URL, direction, continuity, filter, filter parameters and
/// document ids. Parameter and id order do not matter.
pub fn checkpoint_id(
    local_uuid: &str,
    remote_url: &str,
    push: bool,
    continuous: bool,
    filter: Option<&str>,
    filter_params: &HashMap<String, Value>,
    doc_ids: &[String],
) -> String {
    let mut spec = Map::new();
    spec.insert("localUUID".into(), Value::String(local_uuid.to_string()));
    spec.insert("remoteURL".into(), Value::String(remote_url.to_string()));
    spec.insert("push".into(), Value::Bool(push));
    spec.insert("continuous".into(), Value::Bool(continuous));
    if let Some(filter) = filter {
        spec.insert("filter".into(), Value::String(filter.to_string()));
    }
    if !filter_params.is_empty() {
        let params: Map<String, Value> = filter_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        spec.insert("filterParams".into(), Value::Object(params));
    }
    if !doc_ids.is_empty() {
        let mut ids = doc_ids.to_vec();
        ids.sort();
        spec.insert(
            "docids".into(),
            Value::Array(ids.into_iter().map(Value::String).collect()),
        );
    }

    let canonical = canonicalize(Value::Object(spec)).to_string();
    hex::encode(Sha1::digest(canonical.as_bytes()))
}

/// Rebuild objects with sorted keys, so serialization is order-independent
/// even when `serde_json` preserves insertion order.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// `lastSequence` as a string; numeric sequences are accepted.
fn sequence_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Replication {
    fn checkpoint_path(&self) -> String {
        format!("_local/{}", self.checkpoint_id)
    }

    /// Read the remote checkpoint, decide where to resume, then hand over
    /// to the driver.
    pub(super) async fn fetch_remote_checkpoint_doc(
        &self,
        driver: &Arc<dyn ReplicationDriver>,
    ) -> Result<()> {
        self.state.lock().last_sequence_changed = false;
        let local = self
            .store
            .last_sequence_with_checkpoint_id(&self.checkpoint_id, self.is_push())
            .await?;

        let remote_doc = match self.send_request(RemoteRequest::get(self.checkpoint_path())).await {
            Ok(response) => match response.json_value()? {
                Value::Object(doc) => Some(doc),
                _ => None,
            },
            Err(e) if e.is_http_status(status::NOT_FOUND) => {
                debug!(checkpoint_id = %self.checkpoint_id, "No remote checkpoint");
                Arc::clone(driver).maybe_create_remote_db().await?;
                None
            }
            Err(e) => return Err(e),
        };

        let remote = remote_doc
            .as_ref()
            .and_then(|doc| doc.get("lastSequence"))
            .and_then(sequence_string);
        let resume = matches!((&remote, &local), (Some(r), Some(l)) if r == l);
        {
            let mut state = self.state.lock();
            state.remote_checkpoint = remote_doc;
            if resume && state.last_sequence.is_none() {
                state.last_sequence = local.clone();
            }
            state.bootstrapped = true;
        }

        if resume {
            info!(last_sequence = ?local, "Resuming from checkpoint");
        } else {
            info!(
                local = ?local,
                remote = ?remote,
                "Checkpoint mismatch, replicating from the start"
            );
        }
        self.publish();
        Arc::clone(driver).begin_replicating().await
    }

    /// Record a new checkpointed sequence and schedule a save.
    pub(crate) fn set_last_sequence(&self, sequence: String) {
        let schedule = {
            let mut state = self.state.lock();
            if state.last_sequence.as_deref() == Some(sequence.as_str()) {
                return;
            }
            debug!(session_id = %state.session_id, seq = %sequence, "Checkpoint advanced");
            state.last_sequence = Some(sequence);
            !std::mem::replace(&mut state.last_sequence_changed, true)
        };
        self.publish();
        if schedule {
            self.schedule_save();
        }
    }

    fn schedule_save(&self) {
        let Some(driver) = self.driver.upgrade() else {
            return;
        };
        let delay = self.config.settings.checkpoint.save_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            driver.core().save_last_sequence().await;
        });
    }

    /// Wait until no checkpoint save is in flight.
    pub(super) async fn wait_for_save_idle(&self) {
        loop {
            let notified = self.save_idle.notified();
            if !self.state.lock().saving_checkpoint {
                return;
            }
            notified.await;
        }
    }

    /// PUT the checkpoint if it changed since the last save.
    ///
    /// If a save is already running, marks it overdue and returns; the
    /// running save replays once it completes.
    pub(crate) async fn save_last_sequence(&self) {
        // One refresh per call; a remote that keeps conflicting waits for the next save.
        let mut refreshed_once = false;
        loop {
            let (body, sequence, session_id) = {
                let mut state = self.state.lock();
                if !state.last_sequence_changed {
                    return;
                }
                if state.saving_checkpoint {
                    state.overdue_for_save = true;
                    return;
                }
                let Some(sequence) = state.last_sequence.clone() else {
                    state.last_sequence_changed = false;
                    return;
                };
                state.last_sequence_changed = false;
                state.overdue_for_save = false;
                state.saving_checkpoint = true;
                let mut body = state.remote_checkpoint.clone().unwrap_or_default();
                body.insert("lastSequence".into(), Value::String(sequence.clone()));
                (body, sequence, state.session_id.clone())
            };

            debug!(session_id = %session_id, seq = %sequence, "Saving remote checkpoint");
            let result = self
                .send_checkpoint_request(RemoteRequest::put(
                    self.checkpoint_path(),
                    Value::Object(body.clone()),
                ))
                .await;
            metrics::record_checkpoint_save(&session_id, result.is_ok());

            let mut conflict = false;
            {
                let mut state = self.state.lock();
                state.saving_checkpoint = false;
                match &result {
                    Ok(response) => {
                        let mut body = body;
                        if let Some(rev) = response.json_value().ok().and_then(|v| v.get("rev").cloned()) {
                            body.insert("_rev".into(), rev);
                        }
                        state.remote_checkpoint = Some(body);
                    }
                    Err(e) if e.is_http_status(status::NOT_FOUND) => {
                        // Remote db or doc was reset: save again without the stale _rev.
                        state.last_sequence_changed = true;
                        if state.remote_checkpoint.take().is_some() {
                            state.overdue_for_save = true;
                        }
                    }
                    Err(e) if e.is_http_status(status::CONFLICT) && !refreshed_once => {
                        // Stay busy until the refresh lands so waiters see one save.
                        state.saving_checkpoint = true;
                        conflict = true;
                    }
                    Err(_) => state.last_sequence_changed = true,
                }
            }

            match &result {
                Ok(_) => {
                    if let Err(e) = self
                        .store
                        .set_last_sequence(&sequence, &self.checkpoint_id, self.is_push())
                        .await
                    {
                        warn!(session_id = %session_id, error = %e, "Failed to save local checkpoint");
                    }
                }
                Err(ReplicationError::Cancelled) => {
                    debug!(session_id = %session_id, "Checkpoint save cancelled");
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Unable to save remote checkpoint");
                }
            }

            let refreshed = conflict && {
                refreshed_once = true;
                metrics::record_checkpoint_conflict(&session_id);
                self.refresh_remote_checkpoint_doc().await
            };
            self.save_idle.notify_waiters();

            let again = refreshed || self.state.lock().overdue_for_save;
            if !again {
                return;
            }
        }
    }

    /// Re-read the remote checkpoint to learn its current `_rev`.
    ///
    /// Returns true if the save should be retried.
    async fn refresh_remote_checkpoint_doc(&self) -> bool {
        info!(checkpoint_id = %self.checkpoint_id, "Refreshing remote checkpoint to get its _rev");
        self.state.lock().saving_checkpoint = true;
        self.async_task_started();

        let result = self
            .send_checkpoint_request(RemoteRequest::get(self.checkpoint_path()))
            .await;
        let retry = {
            let mut state = self.state.lock();
            state.saving_checkpoint = false;
            match result {
                Ok(response) => {
                    state.remote_checkpoint = match response.json_value() {
                        Ok(Value::Object(doc)) => Some(doc),
                        _ => None,
                    };
                    state.last_sequence_changed = true;
                    true
                }
                Err(e) if e.is_http_status(status::NOT_FOUND) => {
                    state.remote_checkpoint = None;
                    state.last_sequence_changed = true;
                    true
                }
                Err(e) => {
                    warn!(error = %e, "Error refreshing remote checkpoint");
                    state.last_sequence_changed = true;
                    false
                }
            }
        };

        self.async_task_finished(1);
        retry
    }
}

//! Pending sequence tracking for the pull checkpoint.
//!
//! Every remote change accepted into the pull pipeline gets a local,
//! monotonically increasing "fake" sequence mapped to its remote sequence
//! token. Changes complete in any order; the checkpoint only moves past a
//! fake sequence once everything before it has been resolved.
//!
//! ```text
//! add("a") -> 1    add("b") -> 2    add("c") -> 3
//! remove(2)        checkpointed_value() == None   (1 still pending)
//! remove(1)        checkpointed_value() == "b"    (3 still pending)
//! remove(3)        checkpointed_value() == "c"
//! ```

use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Clone)]
pub struct SequenceMap {
    /// Fake sequences still in flight.
    pending: BTreeSet<u64>,
    /// Remote values, `values[i]` belongs to `first_value_sequence + i`.
    values: VecDeque<String>,
    first_value_sequence: u64,
    last_sequence: u64,
}

impl Default for SequenceMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceMap {
    pub fn new() -> Self {
        Self {
            pending: BTreeSet::new(),
            values: VecDeque::new(),
            first_value_sequence: 1,
            last_sequence: 0,
        }
    }

    /// Record a remote value as pending and return its fake sequence.
    pub fn add_value(&mut self, value: impl Into<String>) -> u64 {
        self.last_sequence += 1;
        self.pending.insert(self.last_sequence);
        self.values.push_back(value.into());
        self.last_sequence
    }

    /// Mark a fake sequence as resolved.
    pub fn remove_sequence(&mut self, sequence: u64) {
        self.pending.remove(&sequence);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of unresolved sequences.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Highest fake sequence with no unresolved predecessor.
    ///
    /// Values below it are no longer needed and are discarded.
    pub fn checkpointed_sequence(&mut self) -> u64 {
        let sequence = match self.pending.first() {
            Some(first) => first - 1,
            None => self.last_sequence,
        };
        if sequence > self.first_value_sequence {
            let discard = (sequence - self.first_value_sequence) as usize;
            self.values.drain(..discard.min(self.values.len()));
            self.first_value_sequence = sequence;
        }
        sequence
    }

    /// Remote value at the checkpointed sequence, `None` before anything resolved.
    pub fn checkpointed_value(&mut self) -> Option<String> {
        let sequence = self.checkpointed_sequence();
        if sequence < self.first_value_sequence {
            return None;
        }
        let index = (sequence - self.first_value_sequence) as usize;
        self.values.get(index).cloned()
    }
}

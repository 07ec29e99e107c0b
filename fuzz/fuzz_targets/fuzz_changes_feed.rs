//! Fuzz target for `_changes` response parsing.
//!
//! Tests that malformed feeds are rejected without panicking, and that
//! every accepted change names a document and at least one revision.

#![no_main]

use couch_replicator::change_tracker::parse_changes_response;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(page) = parse_changes_response(data) {
        for change in &page.changes {
            assert!(!change.doc_id.is_empty());
            assert!(!change.revs.is_empty());
        }
    }
});

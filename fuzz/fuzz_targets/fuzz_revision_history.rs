//! Fuzz target for revision history handling.
//!
//! Exercises `_revisions` parsing and the history dict builder used when
//! pushing, with arbitrary JSON and revision ids.

#![no_main]

use couch_replicator::revision::{
    make_revision_history_dict, parse_revision_history, split_rev_id, Properties,
};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: (&[u8], Vec<String>, Vec<String>)| {
    let (json, history, ancestors) = data;

    if let Ok(Value::Object(props)) = serde_json::from_slice::<Value>(json) {
        let props: Properties = props;
        let _ = parse_revision_history(&props);
    }

    for rev in &history {
        let _ = split_rev_id(rev);
    }

    // Never longer than the input history
    let dict = make_revision_history_dict(&history, &ancestors);
    let ids = dict.get("ids").and_then(Value::as_array).map_or(0, Vec::len);
    assert!(ids <= history.len());
});

//! Document revisions as they travel through the replicator.
//!
//! A [`Revision`] is one immutable version of a document, identified by
//! `(doc_id, rev_id)`. Only `sequence` is assigned locally after the
//! revision has been read off the wire.
//!
//! The helpers below deal with the CouchDB `_revisions` history format:
//!
//! ```text
//! "_revisions": { "start": 3, "ids": ["c", "b", "a"] }
//!     => ["3-c", "2-b", "1-a"]
//! ```

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Map, Value};

/// Document properties as a JSON object.
pub type Properties = Map<String, Value>;

/// Ordered list of revisions, in arrival order.
pub type RevisionList = Vec<Revision>;

#[derive(Debug, Clone)]
pub struct Revision {
    pub doc_id: String,
    pub rev_id: String,
    pub generation: u64,
    pub deleted: bool,
    /// Local sequence, or a synthetic pending sequence while pulling.
    pub sequence: i64,
    /// Opaque sequence token from the remote change feed.
    pub remote_sequence_id: Option<String>,
    pub properties: Option<Properties>,
}

impl Revision {
    pub fn new(doc_id: impl Into<String>, rev_id: impl Into<String>, deleted: bool) -> Self {
        let rev_id = rev_id.into();
        Self {
            doc_id: doc_id.into(),
            generation: parse_generation(&rev_id),
            rev_id,
            deleted,
            sequence: 0,
            remote_sequence_id: None,
            properties: None,
        }
    }

    /// Build a revision from a document body carrying `_id` and `_rev`.
    ///
    /// Returns `None` if either is missing.
    pub fn from_properties(properties: Properties) -> Option<Self> {
        let doc_id = properties.get("_id")?.as_str()?.to_string();
        let rev_id = properties.get("_rev")?.as_str()?.to_string();
        let deleted = properties
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut rev = Self::new(doc_id, rev_id, deleted);
        rev.properties = Some(properties);
        Some(rev)
    }

    pub fn with_sequence(mut self, sequence: i64) -> Self {
        self.sequence = sequence;
        self
    }

    /// True if both refer to the same `(doc_id, rev_id)`.
    pub fn same_revision(&self, other: &Revision) -> bool {
        self.doc_id == other.doc_id && self.rev_id == other.rev_id
    }

    /// The `_attachments` object, if the body has one.
    pub fn attachments(&self) -> Option<&Properties> {
        self.properties
            .as_ref()?
            .get("_attachments")
            .and_then(Value::as_object)
    }

    pub fn has_attachments(&self) -> bool {
        self.attachments().is_some_and(|a| !a.is_empty())
    }

    /// Body to upload. Always carries `_id`, `_rev` and `_deleted` if set.
    pub fn body(&self) -> Properties {
        let mut props = self.properties.clone().unwrap_or_default();
        props.insert("_id".into(), Value::String(self.doc_id.clone()));
        props.insert("_rev".into(), Value::String(self.rev_id.clone()));
        if self.deleted {
            props.insert("_deleted".into(), Value::Bool(true));
        }
        props
    }
}

/// Numeric prefix of a revision id, or 0 if it has none.
pub fn parse_generation(rev_id: &str) -> u64 {
    split_rev_id(rev_id).map(|(gen, _)| gen).unwrap_or(0)
}

/// Split `"3-abc"` into `(3, "abc")`.
pub fn split_rev_id(rev_id: &str) -> Option<(u64, &str)> {
    let (gen, suffix) = rev_id.split_once('-')?;
    let gen: u64 = gen.parse().ok()?;
    if gen == 0 || suffix.is_empty() {
        return None;
    }
    Some((gen, suffix))
}

/// Expand a body's `_revisions` into full revision ids, newest first.
///
/// Missing or empty `_revisions` yields an empty list.
pub fn parse_revision_history(properties: &Properties) -> Vec<String> {
    let Some(revisions) = properties.get("_revisions").and_then(Value::as_object) else {
        return Vec::new();
    };
    let Some(ids) = revisions.get("ids").and_then(Value::as_array) else {
        return Vec::new();
    };
    let Some(mut start) = revisions.get("start").and_then(Value::as_i64) else {
        return ids
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    };
    let mut history = Vec::with_capacity(ids.len());
    for id in ids.iter().filter_map(Value::as_str) {
        history.push(format!("{start}-{id}"));
        start -= 1;
    }
    history
}

/// Build a `_revisions` object from a newest-first history.
///
/// The history is cut at the first entry the remote already has. When
/// the generations descend by one the compact `{start, ids}` form is
/// used, otherwise `ids` holds the full revision ids.
pub fn make_revision_history_dict(history: &[String], ancestors: &[String]) -> Value {
    let cut = history
        .iter()
        .position(|rev| ancestors.contains(rev))
        .map(|i| i + 1)
        .unwrap_or(history.len());
    let history = &history[..cut];

    let mut start: Option<u64> = None;
    let mut last = 0u64;
    let mut suffixes = Vec::with_capacity(history.len());
    for rev in history {
        match split_rev_id(rev) {
            Some((gen, suffix)) if start.is_none() || gen + 1 == last => {
                start.get_or_insert(gen);
                last = gen;
                suffixes.push(suffix.to_string());
            }
            _ => {
                start = None;
                break;
            }
        }
    }

    match start {
        Some(start) => json!({ "start": start, "ids": suffixes }),
        None => json!({ "ids": history }),
    }
}

/// Generation of the newest history entry the remote already has, or 0.
pub fn find_common_ancestor(rev: &Revision, possible_ancestors: &[String]) -> u64 {
    if possible_ancestors.is_empty() {
        return 0;
    }
    let Some(props) = rev.properties.as_ref() else {
        return 0;
    };
    parse_revision_history(props)
        .iter()
        .find(|id| possible_ancestors.contains(id))
        .map(|id| parse_generation(id))
        .unwrap_or(0)
}

/// Replace attachments with `revpos < min_revpos` by stubs.
///
/// Returns the number of attachments stubbed.
pub fn stub_attachments_before_revpos(rev: &mut Revision, min_revpos: u64) -> usize {
    let Some(attachments) = rev
        .properties
        .as_mut()
        .and_then(|p| p.get_mut("_attachments"))
        .and_then(Value::as_object_mut)
    else {
        return 0;
    };
    let mut stubbed = 0;
    for meta in attachments.values_mut().filter_map(Value::as_object_mut) {
        let revpos = meta.get("revpos").and_then(Value::as_u64).unwrap_or(0);
        if revpos < min_revpos && revpos != 0 {
            meta.remove("data");
            meta.remove("follows");
            meta.insert("stub".into(), Value::Bool(true));
            stubbed += 1;
        }
    }
    stubbed
}

/// Fill in `revpos` on attachments that lack it.
pub fn set_missing_revpos(rev: &mut Revision) {
    let generation = rev.generation;
    if let Some(attachments) = rev
        .properties
        .as_mut()
        .and_then(|p| p.get_mut("_attachments"))
        .and_then(Value::as_object_mut)
    {
        for meta in attachments.values_mut().filter_map(Value::as_object_mut) {
            meta.entry("revpos").or_insert(json!(generation));
        }
    }
}

/// Decoded attachment body, if `data` holds valid base64.
pub fn attachment_data(meta: &Properties) -> Option<Vec<u8>> {
    let data = meta.get("data")?.as_str()?;
    BASE64.decode(data).ok()
}

/// Document ids must be non-empty; the only `_` prefix allowed is `_design/`.
pub fn is_valid_document_id(id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    !id.starts_with('_') || id.starts_with("_design/")
}

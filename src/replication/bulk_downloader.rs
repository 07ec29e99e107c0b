//! `_bulk_get` requests and responses.
//!
//! One `POST _bulk_get?revs=true&attachments=true` fetches many revisions,
//! each with its `_revisions` history and attachment bodies. Sync Gateway
//! answers with `multipart/mixed`, one part per revision, where a part is
//! either plain JSON or a nested `multipart/related` document. A JSON
//! answer in the `{"results": [...]}` shape is accepted as well.

use crate::error::{status, ReplicationError, Result};
use crate::multipart::decode_documents;
use crate::remote::{RemoteRequest, RemoteResponse};
use crate::revision::{Properties, Revision};
use serde_json::{json, Value};

const BULK_GET_PATH: &str = "_bulk_get?revs=true&attachments=true";

/// A revision the server could not return.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkGetFailure {
    pub doc_id: String,
    pub rev_id: Option<String>,
    pub status: u16,
    pub reason: String,
}

/// Decoded `_bulk_get` response.
#[derive(Debug, Default)]
pub struct BulkGetResponse {
    /// Document bodies with `_id`, `_rev` and `_revisions`; attachments inlined.
    pub documents: Vec<Properties>,
    pub failures: Vec<BulkGetFailure>,
}

/// Builds one `_bulk_get` request and decodes its answer.
#[derive(Debug, Default)]
pub struct BulkDownloader {
    docs: Vec<Value>,
}

impl BulkDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request `revision`. `atts_since` lists revisions already held
    /// locally, so the server can skip attachments they share.
    pub fn add(&mut self, revision: &Revision, atts_since: &[String]) {
        let mut doc = json!({ "id": revision.doc_id, "rev": revision.rev_id });
        if !atts_since.is_empty() {
            doc["atts_since"] = json!(atts_since);
        }
        self.docs.push(doc);
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn request(&self) -> RemoteRequest {
        RemoteRequest::post(BULK_GET_PATH, json!({ "docs": self.docs }))
            .header("Accept", "multipart/related, application/json")
    }

    /// Split a response into documents and per-revision failures.
    pub fn parse_response(&self, response: &RemoteResponse) -> Result<BulkGetResponse> {
        if response.is_multipart() {
            let content_type = response.content_type.as_deref().unwrap_or_default();
            let mut parsed = BulkGetResponse::default();
            for doc in decode_documents(content_type, &response.body)? {
                classify(doc, &mut parsed);
            }
            return Ok(parsed);
        }
        parse_json_results(&response.json_value()?)
    }
}

/// A part carrying `error` instead of `_rev` reports a failed revision.
fn classify(doc: Properties, parsed: &mut BulkGetResponse) {
    if doc.contains_key("_rev") || !doc.contains_key("error") {
        parsed.documents.push(doc);
        return;
    }
    parsed.failures.push(failure_from(&Value::Object(doc)));
}

fn failure_from(error: &Value) -> BulkGetFailure {
    let text = |key: &str| error.get(key).and_then(Value::as_str).map(str::to_string);
    let status = error
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .unwrap_or(status::BAD_GATEWAY);
    BulkGetFailure {
        doc_id: text("id").unwrap_or_default(),
        rev_id: text("rev"),
        status,
        reason: text("reason")
            .or_else(|| text("error"))
            .unwrap_or_else(|| "unknown error".to_string()),
    }
}

fn parse_json_results(value: &Value) -> Result<BulkGetResponse> {
    let results = value
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| ReplicationError::Upstream("_bulk_get response has no results".into()))?;

    let mut parsed = BulkGetResponse::default();
    for result in results {
        let doc_id = result.get("id").and_then(Value::as_str).unwrap_or_default();
        for entry in result.get("docs").and_then(Value::as_array).into_iter().flatten() {
            if let Some(doc) = entry.get("ok").and_then(Value::as_object) {
                parsed.documents.push(doc.clone());
            } else if let Some(error) = entry.get("error") {
                let mut failure = failure_from(error);
                if failure.doc_id.is_empty() {
                    failure.doc_id = doc_id.to_string();
                }
                parsed.failures.push(failure);
            }
        }
    }
    Ok(parsed)
}

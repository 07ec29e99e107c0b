//! `multipart/related` bodies.
//!
//! Revisions with attachments travel as a JSON part followed by one part
//! per attachment body. The JSON marks those attachments `"follows": true`.
//!
//! ```text
//! --boundary
//! Content-Type: application/json
//!
//! {"_id":"doc","_attachments":{"a.txt":{"follows":true,...}}}
//! --boundary
//! Content-Disposition: attachment; filename="a.txt"
//! Content-Type: text/plain
//!
//! <bytes>
//! --boundary--
//! ```
//!
//! `_bulk_get` responses nest this format: each outer part is either a
//! plain JSON document or a `multipart/related` document of its own.

use crate::error::{ReplicationError, Result};
use crate::revision::Properties;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use std::collections::HashMap;

const CRLF: &[u8] = b"\r\n";

/// Builds a `multipart/related` request body.
pub struct MultipartWriter {
    boundary: String,
    buffer: BytesMut,
    parts: usize,
}

impl Default for MultipartWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartWriter {
    pub fn new() -> Self {
        Self::with_boundary(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            buffer: BytesMut::new(),
            parts: 0,
        }
    }

    /// Value for the request's `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/related; boundary=\"{}\"", self.boundary)
    }

    pub fn add_json(&mut self, value: &Value) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.add_part(&[("Content-Type", "application/json")], &body);
        Ok(())
    }

    pub fn add_attachment(&mut self, name: &str, content_type: Option<&str>, data: &[u8]) {
        let disposition = format!("attachment; filename=\"{}\"", name.replace('"', "\\\""));
        let mut headers = vec![("Content-Disposition", disposition.as_str())];
        if let Some(ct) = content_type {
            headers.push(("Content-Type", ct));
        }
        self.add_part(&headers, data);
    }

    fn add_part(&mut self, headers: &[(&str, &str)], body: &[u8]) {
        self.buffer.put_slice(b"--");
        self.buffer.put_slice(self.boundary.as_bytes());
        self.buffer.put_slice(CRLF);
        for (name, value) in headers {
            self.buffer.put_slice(name.as_bytes());
            self.buffer.put_slice(b": ");
            self.buffer.put_slice(value.as_bytes());
            self.buffer.put_slice(CRLF);
        }
        self.buffer.put_slice(CRLF);
        self.buffer.put_slice(body);
        self.buffer.put_slice(CRLF);
        self.parts += 1;
    }

    pub fn part_count(&self) -> usize {
        self.parts
    }

    /// Close the body and return it.
    pub fn finish(mut self) -> Bytes {
        self.buffer.put_slice(b"--");
        self.buffer.put_slice(self.boundary.as_bytes());
        self.buffer.put_slice(b"--");
        self.buffer.put_slice(CRLF);
        self.buffer.freeze()
    }
}

/// One part of a multipart body. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct Part {
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl Part {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    /// `filename` from `Content-Disposition`.
    pub fn filename(&self) -> Option<String> {
        header_param(self.headers.get("content-disposition")?, "filename")
    }
}

/// `boundary` parameter of a multipart content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    if !content_type.trim_start().to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    header_param(content_type, "boundary")
}

fn header_param(header: &str, name: &str) -> Option<String> {
    header.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case(name) {
            return None;
        }
        Some(value.trim().trim_matches('"').to_string())
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Split a multipart body into parts.
pub fn parse_parts(body: &Bytes, boundary: &str) -> Result<Vec<Part>> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let malformed = |what: &str| ReplicationError::Upstream(format!("malformed multipart body: {what}"));

    let mut pos = find(body, delimiter, 0).ok_or_else(|| malformed("no opening boundary"))?;
    let mut parts = Vec::new();
    loop {
        pos += delimiter.len();
        if body[pos..].starts_with(b"--") {
            return Ok(parts);
        }
        // Skip transport padding and the line break after the boundary.
        let line_end = find(body, CRLF, pos).ok_or_else(|| malformed("unterminated boundary line"))?;
        let header_start = line_end + CRLF.len();

        let (headers, body_start) = if body[header_start..].starts_with(CRLF) {
            (HashMap::new(), header_start + CRLF.len())
        } else {
            let header_end =
                find(body, b"\r\n\r\n", header_start).ok_or_else(|| malformed("unterminated headers"))?;
            (parse_headers(&body[header_start..header_end]), header_end + 4)
        };

        let mut closing = Vec::with_capacity(delimiter.len() + 2);
        closing.extend_from_slice(CRLF);
        closing.extend_from_slice(delimiter);
        let body_end =
            find(body, &closing, body_start).ok_or_else(|| malformed("missing closing boundary"))?;

        parts.push(Part {
            headers,
            body: body.slice(body_start..body_end),
        });
        pos = body_end + CRLF.len();
    }
}

fn parse_headers(raw: &[u8]) -> HashMap<String, String> {
    String::from_utf8_lossy(raw)
        .split("\r\n")
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect()
}

/// Decode a document body from one response part.
///
/// A nested `multipart/related` part carries the JSON first, then the
/// attachment bodies, which are inlined as base64 `data`.
pub fn decode_document(content_type: Option<&str>, body: &Bytes) -> Result<Properties> {
    if let Some(boundary) = content_type.and_then(boundary_from_content_type) {
        return decode_related_document(body, &boundary);
    }
    let value: Value = serde_json::from_slice(body)?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ReplicationError::Upstream(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

fn decode_related_document(body: &Bytes, boundary: &str) -> Result<Properties> {
    let mut parts = parse_parts(body, boundary)?.into_iter();
    let first = parts
        .next()
        .ok_or_else(|| ReplicationError::Upstream("empty multipart document".into()))?;
    let mut doc = decode_document(first.content_type(), &first.body)?;

    let bodies: HashMap<String, Bytes> = parts
        .filter_map(|part| Some((part.filename()?, part.body)))
        .collect();
    if let Some(attachments) = doc.get_mut("_attachments").and_then(Value::as_object_mut) {
        for (name, meta) in attachments.iter_mut() {
            let Some(meta) = meta.as_object_mut() else { continue };
            if meta.remove("follows").is_none() {
                continue;
            }
            let data = bodies.get(name).ok_or_else(|| {
                ReplicationError::Upstream(format!("attachment {name} marked follows but missing"))
            })?;
            meta.insert("data".into(), Value::String(BASE64.encode(data)));
        }
    }
    Ok(doc)
}

/// Decode every document in a `_bulk_get` style response.
pub fn decode_documents(content_type: &str, body: &Bytes) -> Result<Vec<Properties>> {
    let boundary = boundary_from_content_type(content_type)
        .ok_or_else(|| ReplicationError::Upstream(format!("not multipart: {content_type}")))?;
    parse_parts(body, &boundary)?
        .iter()
        .map(|part| decode_document(part.content_type(), &part.body))
        .collect()
}

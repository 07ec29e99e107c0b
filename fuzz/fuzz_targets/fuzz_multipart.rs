//! Fuzz target for the multipart document decoder.
//!
//! Bodies come straight off the wire from `GET doc?attachments=true` and
//! `_bulk_get`, so decoding must never panic on arbitrary input.

#![no_main]

use bytes::Bytes;
use couch_replicator::multipart::{boundary_from_content_type, decode_document, decode_documents};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &[u8])| {
    let (content_type, body) = data;
    let body = Bytes::copy_from_slice(body);

    // Should never panic
    let _ = boundary_from_content_type(content_type);
    let _ = decode_document(Some(content_type), &body);
    let _ = decode_documents(content_type, &body);

    // Fixed boundary so the fuzzer can reach the part parser quickly
    let _ = decode_document(Some("multipart/related; boundary=x"), &body);
});

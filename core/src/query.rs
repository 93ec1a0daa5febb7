//! Query-string encoding for folded GET payloads.
//!
//! Nested objects use bracketed keys (`a[b]=1`), arrays use indices
//! (`a[0]=x`), and both keys and values are percent-encoded with the RFC 3986
//! unreserved set left intact. Null leaves encode as `key=`; empty arrays and
//! objects contribute nothing.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::payload::Payload;

const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn encode(s: &str) -> String {
    utf8_percent_encode(s, QUERY_COMPONENT).to_string()
}

/// Serialize a payload into a query string (without the leading `?`).
pub fn stringify_query(payload: &Payload) -> String {
    let mut pairs = Vec::new();
    match payload {
        Payload::Object(map) => {
            for (key, value) in map {
                push_pairs(key, value, &mut pairs);
            }
        }
        Payload::Array(items) => {
            for (index, value) in items.iter().enumerate() {
                push_pairs(&index.to_string(), value, &mut pairs);
            }
        }
        _ => {}
    }
    pairs.join("&")
}

fn push_pairs(prefix: &str, value: &Payload, pairs: &mut Vec<String>) {
    match value {
        Payload::Null => pairs.push(format!("{}=", encode(prefix))),
        Payload::Object(map) => {
            for (key, child) in map {
                push_pairs(&format!("{prefix}[{key}]"), child, pairs);
            }
        }
        Payload::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                push_pairs(&format!("{prefix}[{index}]"), child, pairs);
            }
        }
        scalar => pairs.push(format!(
            "{}={}",
            encode(prefix),
            encode(&scalar.scalar_string())
        )),
    }
}

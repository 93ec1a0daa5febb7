//! HTTP vocabulary shared by both dispatch backends.
//!
//! # Design
//! `HttpMethod` is the closed set of verbs a service descriptor may declare.
//! Header values arriving from a transport are treated as loosely-shaped data
//! (`serde_json::Value`) and funnelled through a single normalization routine,
//! so the envelope always exposes lower-cased keys and flat string values no
//! matter which backend produced them.

use std::collections::BTreeMap;
use std::fmt;

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized response headers: lower-cased keys, comma-joined values.
pub type Headers = BTreeMap<String, String>;

/// HTTP method a service is invoked with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Get,
    Delete,
    Head,
    Post,
    Put,
    Patch,
    Link,
    Unlink,
}

impl HttpMethod {
    /// Lower-case name, as used for method-named transport calls.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Delete => "delete",
            Self::Head => "head",
            Self::Post => "post",
            Self::Put => "put",
            Self::Patch => "patch",
            Self::Link => "link",
            Self::Unlink => "unlink",
        }
    }

    /// Methods whose wrapped-client call takes `(path, config)` with no body.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Get | Self::Delete | Self::Head)
    }

    pub fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Delete => reqwest::Method::DELETE,
            Self::Head => reqwest::Method::HEAD,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            // LINK/UNLINK are valid extension tokens, so this cannot fail.
            Self::Link => reqwest::Method::from_bytes(b"LINK").unwrap_or(reqwest::Method::POST),
            Self::Unlink => {
                reqwest::Method::from_bytes(b"UNLINK").unwrap_or(reqwest::Method::POST)
            }
        }
    }
}

impl fmt::Display for HttpMethod {
    /// Upper-case wire form (`GET`, `LINK`, ...).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        method.to_reqwest()
    }
}

/// Explicit response body decoding requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Blob,
    ArrayBuffer,
    Text,
}

/// Normalize an arbitrary header source.
///
/// Objects yield lower-cased keys; string values are kept, arrays of strings
/// are joined with `", "`, anything else is dropped. Non-object sources
/// return `None`; the envelope layer substitutes an empty map.
pub fn normalize_headers(source: &Value) -> Option<Headers> {
    let object = source.as_object()?;
    let mut headers = Headers::new();
    for (key, value) in object {
        match value {
            Value::String(s) => {
                headers.insert(key.to_lowercase(), s.clone());
            }
            Value::Array(items) => {
                let joined = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                headers.insert(key.to_lowercase(), joined);
            }
            _ => {}
        }
    }
    Some(headers)
}

/// Convert a transport header map into the loose header source shape.
///
/// Repeated headers become arrays so they are joined by [`normalize_headers`].
pub fn header_map_to_value(map: &HeaderMap) -> Value {
    let mut object = serde_json::Map::new();
    for name in map.keys() {
        let values: Vec<Value> = map
            .get_all(name)
            .iter()
            .map(|v| Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let entry = if values.len() == 1 {
            values.into_iter().next().unwrap_or(Value::Null)
        } else {
            Value::Array(values)
        };
        object.insert(name.as_str().to_string(), entry);
    }
    Value::Object(object)
}

/// Case-insensitive lookup in a caller-supplied header field map.
pub(crate) fn find_header<'a>(fields: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

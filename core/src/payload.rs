//! Request payloads.
//!
//! # Design
//! A payload is a JSON-shaped tree with one extra leaf kind: [`FilePart`].
//! Binary leaves are an explicit variant rather than something sniffed from
//! an object's shape, so the multipart encoder can tell them apart from
//! nested objects without guessing.

use bytes::Bytes;
use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Number, Value};

/// Keyed children of a [`Payload::Object`], in insertion order.
pub type PayloadMap = IndexMap<String, Payload>;

/// A binary leaf (file or blob) destined for a multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
    pub last_modified: Option<i64>,
}

impl FilePart {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: None,
            bytes: bytes.into(),
            last_modified: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_last_modified(mut self, millis: i64) -> Self {
        self.last_modified = Some(millis);
        self
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Request payload tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Payload>),
    Object(PayloadMap),
    File(FilePart),
}

impl Payload {
    /// An empty object, the default payload of every call.
    pub fn empty() -> Self {
        Self::Object(PayloadMap::new())
    }

    /// Start an object payload.
    pub fn object() -> Self {
        Self::empty()
    }

    /// Insert `value` under `key`, turning a non-object payload into an object.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Payload>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Payload>) {
        if !matches!(self, Self::Object(_)) {
            *self = Self::empty();
        }
        if let Self::Object(map) = self {
            map.insert(key.into(), value.into());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Payload> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether the payload has at least one own key.
    ///
    /// Objects count their keys, arrays their indices; scalars have none.
    pub fn has_keys(&self) -> bool {
        match self {
            Self::Object(map) => !map.is_empty(),
            Self::Array(items) => !items.is_empty(),
            _ => false,
        }
    }

    /// Plain string form of a scalar leaf.
    pub(crate) fn scalar_string(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => n.to_string(),
            Self::String(s) => s.clone(),
            Self::File(f) => f.name.clone(),
            Self::Array(_) | Self::Object(_) => self.to_json_string(),
        }
    }

    /// Serialize to JSON text. File leaves have no JSON form and encode as `{}`.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }

    /// Convert to a JSON value, losing file contents.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Recursively drop `Null` entries from objects. Arrays are kept as-is.
pub fn strip_nulls(payload: &Payload) -> Payload {
    match payload {
        Payload::Object(map) => Payload::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), strip_nulls(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => n.serialize(serializer),
            Self::String(s) => serializer.serialize_str(s),
            Self::Array(items) => items.serialize(serializer),
            Self::Object(map) => map.serialize(serializer),
            Self::File(_) => serializer.serialize_map(Some(0))?.end(),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<FilePart> for Payload {
    fn from(file: FilePart) -> Self {
        Self::File(file)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Payload {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<i32> for Payload {
    fn from(n: i32) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for Payload {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<f64> for Payload {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Self::Number).unwrap_or(Self::Null)
    }
}

impl<T: Into<Payload>> From<Vec<T>> for Payload {
    fn from(items: Vec<T>) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

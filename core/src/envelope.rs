//! The uniform response envelope.
//!
//! # Design
//! Every dispatch outcome becomes a `ResponseEnvelope`. `ok` is derived from
//! the status and never set independently: a 2xx envelope carries no problem
//! and no original error, and any other status always carries a problem.

use bytes::Bytes;
use serde_json::Value;

use crate::http::Headers;

/// Decoded response body.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResponseData {
    #[default]
    Null,
    Json(Value),
    Text(String),
    /// Binary body kept together with its content type.
    Blob { bytes: Bytes, content_type: String },
    /// Raw binary body.
    Bytes(Bytes),
}

impl ResponseData {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Blob { bytes, .. } | Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl From<Value> for ResponseData {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            other => Self::Json(other),
        }
    }
}

/// Outcome of a service call.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub ok: bool,
    pub status: u16,
    pub data: ResponseData,
    pub headers: Headers,
    pub problem: Option<String>,
    pub original_error: Option<String>,
    /// Milliseconds spent in the transport call, 0 if it never started.
    pub duration: f64,
}

pub(crate) fn is_success(status: u16) -> bool {
    (200..=299).contains(&status)
}

/// Round elapsed milliseconds to two decimals.
pub(crate) fn round_millis(elapsed: std::time::Duration) -> f64 {
    (elapsed.as_secs_f64() * 100_000.0).round() / 100.0
}

impl ResponseEnvelope {
    /// Envelope for a response the server actually produced.
    ///
    /// `problem` is only kept for non-2xx statuses; a missing one falls back
    /// to the canonical reason phrase.
    pub fn from_response(
        status: u16,
        data: ResponseData,
        headers: Option<Headers>,
        problem: Option<String>,
        duration: f64,
    ) -> Self {
        if is_success(status) {
            return Self {
                ok: true,
                status,
                data,
                headers: headers.unwrap_or_default(),
                problem: None,
                original_error: None,
                duration,
            };
        }
        let problem = problem
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| reason_phrase(status));
        Self {
            ok: false,
            status,
            data,
            headers: headers.unwrap_or_default(),
            original_error: Some(problem.clone()),
            problem: Some(problem),
            duration,
        }
    }

    /// Envelope for a failed call. `ok` is false regardless of `status`.
    pub fn failure(status: u16, problem: impl Into<String>, original_error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status,
            data: ResponseData::Null,
            headers: Headers::new(),
            problem: Some(problem.into()),
            original_error: Some(original_error.into()),
            duration: 0.0,
        }
    }

    pub fn with_data(mut self, data: ResponseData) -> Self {
        self.data = data;
        self
    }

    pub fn with_headers(mut self, headers: Option<Headers>) -> Self {
        self.headers = headers.unwrap_or_default();
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    /// Envelope returned when a service id is not registered.
    pub fn service_not_found(id: &str) -> Self {
        let message = format!("Service {id} in driver not found");
        Self::failure(500, message.clone(), message)
    }
}

fn reason_phrase(status: u16) -> String {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {status}"))
}

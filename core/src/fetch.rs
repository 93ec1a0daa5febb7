//! Raw-fetch backend: one plain HTTP exchange per call.
//!
//! # Design
//! A [`FetchTransport`] sends a request and hands back a [`FetchResponse`]
//! whose body has not been read yet, so the driver can stop the clock when
//! the status line arrives and decode the body afterwards.
//!
//! Body decoding follows a fixed precedence:
//!
//! 1. an explicit `ResponseType` wins (`blob`, `arraybuffer`, `text`);
//! 2. `image/*`, `application/pdf`, `application/octet-stream` give a blob;
//! 3. `text/*` (not JSON) gives text;
//! 4. otherwise the body is read as text: empty is malformed, JSON or an
//!    absent content type must parse as JSON, anything else stays text.
//!
//! Any failure while reading the body is reported as
//! "Failed to parse response".

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, CONTENT_TYPE};

use crate::compile::RequestBody;
use crate::envelope::ResponseData;
use crate::error::DriverError;
use crate::http::{HttpMethod, ResponseType};
use crate::options::AbortSignal;

/// Message for a body that could not be read or decoded at all.
pub const PARSE_FAILURE: &str = "Failed to parse response";

/// Init options for a fetch call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOptions {
    /// `None` means GET.
    pub method: Option<HttpMethod>,
    /// Request headers. `None` lets the transport pick, which is how a
    /// multipart body gets its boundary.
    pub headers: Option<BTreeMap<String, String>>,
    pub body: Option<RequestBody>,
    pub signal: Option<AbortSignal>,
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    pub fn method(&self) -> HttpMethod {
        self.method.unwrap_or(HttpMethod::Get)
    }
}

/// A response whose body is read on demand.
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    body: BoxFuture<'static, Result<Bytes, DriverError>>,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl FetchResponse {
    /// A response with an already buffered body.
    pub fn new(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self::deferred(status, headers, Box::pin(async move { Ok(body) }))
    }

    /// A response whose body is produced by `body` when first read.
    pub fn deferred(status: u16, headers: HeaderMap, body: BoxFuture<'static, Result<Bytes, DriverError>>) -> Self {
        let status_text = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or_default()
            .to_string();
        Self {
            status,
            status_text,
            headers,
            body,
        }
    }

    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = status_text.into();
        self
    }

    /// Lower-cased content type, empty when absent.
    pub fn content_type(&self) -> String {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default()
    }

    /// Split into head and unread body.
    pub fn into_parts(self) -> (u16, String, HeaderMap, BoxFuture<'static, Result<Bytes, DriverError>>) {
        (self.status, self.status_text, self.headers, self.body)
    }

    pub async fn bytes(self) -> Result<Bytes, DriverError> {
        self.body.await
    }
}

/// A transport for the raw-fetch backend.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    /// Send the request. Non-2xx statuses are not errors here.
    async fn fetch(&self, url: &str, options: FetchOptions) -> Result<FetchResponse, DriverError>;
}

fn is_blob_type(content_type: &str) -> bool {
    content_type.starts_with("image/")
        || content_type.starts_with("application/pdf")
        || content_type.starts_with("application/octet-stream")
}

/// Decode a read body according to the precedence in the module docs.
pub fn decode_body(
    body: Result<Bytes, DriverError>,
    content_type: &str,
    response_type: Option<ResponseType>,
) -> Result<ResponseData, DriverError> {
    let bytes = body.map_err(|_| DriverError::MalformedResponse(PARSE_FAILURE.to_string()))?;
    let text = |bytes: &Bytes| String::from_utf8_lossy(bytes).into_owned();

    match response_type {
        Some(ResponseType::Blob) => {
            return Ok(ResponseData::Blob {
                bytes,
                content_type: content_type.to_string(),
            })
        }
        Some(ResponseType::ArrayBuffer) => return Ok(ResponseData::Bytes(bytes)),
        Some(ResponseType::Text) => return Ok(ResponseData::Text(text(&bytes))),
        None => {}
    }

    if is_blob_type(content_type) {
        return Ok(ResponseData::Blob {
            bytes,
            content_type: content_type.to_string(),
        });
    }
    if content_type.starts_with("text/") && !content_type.contains("application/json") {
        return Ok(ResponseData::Text(text(&bytes)));
    }

    let body = text(&bytes);
    if body.is_empty() {
        return Err(DriverError::malformed());
    }
    if content_type.contains("application/json") || content_type.is_empty() {
        let value: serde_json::Value = serde_json::from_str(&body).map_err(|_| DriverError::malformed())?;
        return Ok(ResponseData::from(value));
    }
    Ok(ResponseData::Text(body))
}

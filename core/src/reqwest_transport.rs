//! Default transport backed by `reqwest`.
//!
//! One [`ReqwestTransport`] serves both backends. On the wrapped-client
//! path it behaves like a conventional HTTP client: bodies are encoded from
//! the payload, response bodies are decoded leniently, and non-2xx statuses
//! are reported as a [`TransportError`] carrying the response. On the
//! raw-fetch path it returns the response untouched with the body unread.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, instrument, Span};

use crate::compile::{compile_body, RequestBody, APPLICATION_JSON, MULTIPART_FORM_DATA};
use crate::envelope::{is_success, ResponseData};
use crate::error::{ConfigError, DriverError, TransportError};
use crate::fetch::{FetchOptions, FetchResponse, FetchTransport};
use crate::http::{find_header, header_map_to_value, HttpMethod, ResponseType};
use crate::wrapped::{RequestConfig, TransportReply, TransportResponse, WrappedTransport};

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, ConfigError> {
        reqwest::Client::builder()
            .build()
            .map(Self::with_client)
            .map_err(|e| ConfigError::Transport(e.to_string()))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn request_builder(
        &self,
        method: HttpMethod,
        url: &str,
        headers: Option<&BTreeMap<String, String>>,
        body: Option<RequestBody>,
        timeout: Option<std::time::Duration>,
    ) -> Result<reqwest::RequestBuilder, reqwest::Error> {
        let mut builder = self.client.request(method.to_reqwest(), url);
        let multipart = matches!(body, Some(RequestBody::Multipart(_)));
        for (name, value) in headers.into_iter().flatten() {
            // The multipart encoder writes its own boundary header.
            if multipart && name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match body {
            Some(RequestBody::Json(text)) => builder.body(text),
            Some(RequestBody::Multipart(form)) => builder.multipart(form.into_multipart()?),
            None => builder,
        };
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(builder)
    }
}

/// Headers for a wrapped-client request: a JSON content type is assumed for
/// bodies that do not declare one.
fn wrapped_headers(config: &RequestConfig) -> BTreeMap<String, String> {
    let mut headers = config.options.headers.clone();
    if config.data.is_some() && find_header(&headers, CONTENT_TYPE.as_str()).is_none() {
        headers.insert("Content-Type".to_string(), APPLICATION_JSON.to_string());
    }
    headers
}

/// Lenient decoding for the wrapped path: JSON when it parses, text
/// otherwise, nothing for an empty body.
fn decode_lenient(bytes: Bytes, content_type: &str, response_type: Option<ResponseType>) -> ResponseData {
    match response_type {
        Some(ResponseType::Blob) => ResponseData::Blob {
            bytes,
            content_type: content_type.to_string(),
        },
        Some(ResponseType::ArrayBuffer) => ResponseData::Bytes(bytes),
        Some(ResponseType::Text) => ResponseData::Text(String::from_utf8_lossy(&bytes).into_owned()),
        None if bytes.is_empty() => ResponseData::Null,
        None => match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(value) => ResponseData::from(value),
            Err(_) => ResponseData::Text(String::from_utf8_lossy(&bytes).into_owned()),
        },
    }
}

#[async_trait]
impl WrappedTransport for ReqwestTransport {
    #[instrument(
        name = "wrapped_request",
        skip(self, config),
        fields(
            http.method = %config.method,
            http.url = %config.url,
            http.status_code = tracing::field::Empty,
            otel.kind = "client",
        )
    )]
    async fn request(&self, config: RequestConfig) -> Result<TransportReply, DriverError> {
        let headers = wrapped_headers(&config);
        let content_type = find_header(&headers, CONTENT_TYPE.as_str()).map(str::to_ascii_lowercase);
        let body = config
            .data
            .as_ref()
            .map(|payload| compile_body(content_type.as_deref(), payload));
        if content_type.as_deref() == Some(MULTIPART_FORM_DATA) {
            debug!("sending multipart body");
        }

        let builder = self
            .request_builder(
                config.method,
                &config.url,
                Some(&headers),
                body,
                config.options.timeout_duration(),
            )
            .map_err(|e| TransportError::from(e).with_config(config.clone()))?;

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::from(e).with_config(config.clone()))?;

        let status = response.status();
        Span::current().record("http.status_code", status.as_u16());
        let headers = response.headers().clone();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::from(e).with_config(config.clone()))?;

        let transport_response = TransportResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: header_map_to_value(&headers),
            data: decode_lenient(bytes, &content_type, config.options.response_type),
        };

        if !is_success(status.as_u16()) {
            let code = if status.is_server_error() {
                "ERR_BAD_RESPONSE"
            } else {
                "ERR_BAD_REQUEST"
            };
            return Err(TransportError::new(format!(
                "Request failed with status code {}",
                status.as_u16()
            ))
            .with_code(code)
            .with_response(transport_response)
            .with_config(config)
            .into());
        }

        Ok(TransportReply::Response(transport_response))
    }
}

#[async_trait]
impl FetchTransport for ReqwestTransport {
    #[instrument(
        name = "fetch",
        skip(self, options),
        fields(
            http.method = %options.method(),
            http.url = %url,
            http.status_code = tracing::field::Empty,
            otel.kind = "client",
        )
    )]
    async fn fetch(&self, url: &str, options: FetchOptions) -> Result<FetchResponse, DriverError> {
        let method = options.method();
        let builder = self.request_builder(method, url, options.headers.as_ref(), options.body, options.timeout)?;
        let response = builder.send().await?;

        let status = response.status();
        Span::current().record("http.status_code", status.as_u16());
        let headers = response.headers().clone();
        let body = Box::pin(async move { response.bytes().await.map_err(DriverError::from) });
        Ok(FetchResponse::deferred(status.as_u16(), headers, body)
            .with_status_text(status.canonical_reason().unwrap_or_default()))
    }
}

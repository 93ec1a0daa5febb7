//! Query/body compilation.
//!
//! # Design
//! GET payloads are folded into the URL's query string and the payload is
//! emptied; every other method keeps its payload for the body. Body encoding
//! is chosen by declared content type: `multipart/form-data` flattens the
//! payload into a [`FormData`], anything else (JSON, unknown, absent) becomes
//! JSON text of the payload as given.

use crate::form::{to_form_data, FormData};
use crate::http::HttpMethod;
use crate::options::RequestOptions;
use crate::payload::Payload;
use crate::query::stringify_query;

pub const MULTIPART_FORM_DATA: &str = "multipart/form-data";
pub const APPLICATION_JSON: &str = "application/json";

/// A request ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRequest {
    pub url: String,
    pub method: HttpMethod,
    pub payload: Payload,
    pub options: RequestOptions,
}

/// Encoded request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Json(String),
    Multipart(FormData),
}

/// Append `query` to `url`, using `&` when the URL already has a query.
pub(crate) fn append_query(url: &str, query: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{query}")
}

/// Fold GET payloads into the query string.
pub fn compile_url(
    url: &str,
    method: HttpMethod,
    payload: Option<Payload>,
    options: Option<RequestOptions>,
) -> CompiledRequest {
    let payload = payload.unwrap_or_else(Payload::empty);
    let options = options.unwrap_or_default();

    if method == HttpMethod::Get && payload.has_keys() {
        return CompiledRequest {
            url: append_query(url, &stringify_query(&payload)),
            method,
            payload: Payload::empty(),
            options,
        };
    }

    CompiledRequest {
        url: url.to_string(),
        method,
        payload,
        options,
    }
}

/// Encode `payload` for the declared content type.
pub fn compile_body(content_type: Option<&str>, payload: &Payload) -> RequestBody {
    match content_type.map(str::to_ascii_lowercase).as_deref() {
        Some(MULTIPART_FORM_DATA) => RequestBody::Multipart(to_form_data(payload)),
        _ => RequestBody::Json(payload.to_json_string()),
    }
}

//! Deterministic fixture server for exercising the driver over real HTTP.
//!
//! Every route answers the same way on every call. Echo routes report what
//! they received so tests can assert on the encoded request.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Multipart, Path, Query, RawQuery},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::debug;

/// PNG signature, served by `/files/image`.
pub const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
pub const PDF_BODY: &[u8] = b"%PDF-1.4\n%mock\n";
pub const BINARY_BODY: &[u8] = &[0, 1, 2, 3, 255];

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub name: String,
}

/// What `/echo` saw.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Echo {
    pub method: String,
    pub content_type: Option<String>,
    pub query: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body, or the raw text when it is not JSON.
    pub body: Value,
}

/// One part as seen by `/echo/multipart`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EchoPart {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub size: usize,
    /// Text value for non-file parts.
    pub text: Option<String>,
}

#[derive(Deserialize)]
pub struct SlowParams {
    #[serde(default = "default_delay")]
    pub ms: u64,
}

fn default_delay() -> u64 {
    500
}

pub fn app() -> Router {
    Router::new()
        .route("/users/{id}", get(get_user))
        .route("/v1/users/{id}", get(get_user_v1))
        .route("/v2/users/{id}", get(get_user_v2))
        .route("/echo", any(echo))
        .route("/echo/multipart", post(echo_multipart))
        .route("/files/image", get(image))
        .route("/files/pdf", get(pdf))
        .route("/files/binary", get(binary))
        .route("/text", get(text))
        .route("/xml", get(xml))
        .route("/empty", get(empty))
        .route("/no-content", get(no_content))
        .route("/malformed", get(malformed))
        .route("/status/{code}", any(status))
        .route("/slow", get(slow))
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn get_user(Path(id): Path<String>) -> Json<User> {
    Json(User {
        name: format!("user-{id}"),
        id,
    })
}

async fn get_user_v1(Path(id): Path<String>) -> Json<Value> {
    Json(json!({"version": 1, "id": id}))
}

async fn get_user_v2(Path(id): Path<String>) -> Json<Value> {
    Json(json!({"version": 2, "id": id}))
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn echo(method: Method, headers: HeaderMap, RawQuery(query): RawQuery, body: Bytes) -> Json<Echo> {
    let body = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
    };
    let seen = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    Json(Echo {
        method: method.to_string(),
        content_type: header_string(&headers, header::CONTENT_TYPE),
        query,
        headers: seen,
        body,
    })
}

async fn echo_multipart(mut multipart: Multipart) -> Result<Json<Vec<EchoPart>>, (StatusCode, String)> {
    let mut parts = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        let text = match file_name {
            Some(_) => None,
            None => Some(String::from_utf8_lossy(&data).into_owned()),
        };
        parts.push(EchoPart {
            name,
            file_name,
            content_type,
            size: data.len(),
            text,
        });
    }
    debug!(parts = parts.len(), "multipart echoed");
    Ok(Json(parts))
}

async fn image() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "image/png")], PNG_MAGIC)
}

async fn pdf() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/pdf")], PDF_BODY)
}

async fn binary() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/octet-stream")], BINARY_BODY)
}

async fn text() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], "hello from mock")
}

async fn xml() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/xml")], "<ok/>")
}

async fn empty() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/json")], "")
}

async fn no_content() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn malformed() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/json")], "{\"unterminated\": ")
}

/// Answer with the requested status, a JSON error body and a repeated
/// `x-error-tag` header.
async fn status(Path(code): Path<u16>) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    headers.append("x-error-tag", HeaderValue::from_static("first"));
    headers.append("x-error-tag", HeaderValue::from_static("second"));
    let body = json!({"error": status.canonical_reason().unwrap_or("unknown"), "code": code});
    (status, headers, Json(body)).into_response()
}

async fn slow(Query(params): Query<SlowParams>) -> Json<Value> {
    tokio::time::sleep(Duration::from_millis(params.ms)).await;
    Json(json!({"slept": params.ms}))
}

//! Service registry and URL/param compilation.
//!
//! # Design
//! A `ServiceDescriptor` names one endpoint: a URL template with `{name}`
//! placeholders, a method, and optional version and preset options. The
//! registry is an ordered list; lookups return the first descriptor whose id
//! matches, so duplicate ids resolve to the earliest registration.
//!
//! Placeholders whose parameter is missing are replaced by the literal string
//! `undefined`. Callers that rely on that output keep working; nothing is
//! dropped or rejected.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::http::HttpMethod;
use crate::options::RequestOptions;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("placeholder pattern is valid"));

/// Substituted for placeholders that have no matching parameter.
pub const MISSING_PARAM: &str = "undefined";

/// API version declared by a service or used as the global default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiVersion {
    Number(i64),
    Text(String),
}

impl ApiVersion {
    /// Empty strings and zero count as "no version".
    pub fn is_set(&self) -> bool {
        match self {
            Self::Number(n) => *n != 0,
            Self::Text(s) => !s.is_empty(),
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ApiVersion {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for ApiVersion {
    fn from(n: i32) -> Self {
        Self::Number(n.into())
    }
}

impl From<&str> for ApiVersion {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for ApiVersion {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// One named endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: String,
    #[serde(rename = "url")]
    pub url_template: String,
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<ApiVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<RequestOptions>,
}

impl ServiceDescriptor {
    pub fn new(id: impl Into<String>, url_template: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            id: id.into(),
            url_template: url_template.into(),
            method,
            version: None,
            options: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<ApiVersion>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Reference to a service plus its path parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub id: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl ServiceRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

impl From<&str> for ServiceRef {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A declarative list of services, loadable from JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistry {
    pub services: Vec<ServiceDescriptor>,
}

impl ServiceRegistry {
    pub fn new(services: Vec<ServiceDescriptor>) -> Self {
        Self { services }
    }

    /// Parse `{"services": [...]}` JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::InvalidRegistry(e.to_string()))
    }

    pub fn find(&self, id: &str) -> Option<&ServiceDescriptor> {
        find_service(&self.services, id)
    }
}

/// A descriptor with its path parameters substituted.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledService {
    pub path: String,
    pub method: HttpMethod,
    pub version: Option<ApiVersion>,
    pub options: RequestOptions,
}

fn param_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `{name}` token (ASCII letters, digits, `_`) with the string form of `params[name]`.
pub fn replace_params_in_url(template: &str, params: &BTreeMap<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            params
                .get(&caps[1])
                .map(param_string)
                .unwrap_or_else(|| MISSING_PARAM.to_string())
        })
        .into_owned()
}

/// First descriptor whose id equals `id`.
pub fn find_service<'a>(services: &'a [ServiceDescriptor], id: &str) -> Option<&'a ServiceDescriptor> {
    services.iter().find(|s| s.id == id)
}

/// Look up `service` and resolve its relative path.
pub fn compile_service(service: &ServiceRef, services: &[ServiceDescriptor]) -> Option<CompiledService> {
    let descriptor = find_service(services, &service.id)?;
    Some(CompiledService {
        path: replace_params_in_url(&descriptor.url_template, &service.params),
        method: descriptor.method,
        version: descriptor.version.clone(),
        options: descriptor.options.clone().unwrap_or_default(),
    })
}

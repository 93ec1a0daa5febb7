//! API version injection into service URLs.
//!
//! Versioning is opt-in. With it disabled, or with no version resolvable for
//! a service, the final URL is `base/path`. Otherwise a `prefix + version`
//! token is placed according to [`VersionPosition`]. A service's own version
//! takes precedence over the configured default.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::ApiVersion;

/// Where the version token goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionPosition {
    /// `base/v1/path`
    #[default]
    AfterBase,
    /// `base/path/v1`
    BeforeEndpoint,
    /// `scheme://v1.host/path`
    Prefix,
    /// Caller-supplied template with `{baseURL}`, `{version}`, `{endpoint}`.
    Custom,
}

fn default_prefix() -> String {
    "v".to_string()
}

fn default_enabled() -> bool {
    true
}

/// Versioning configuration.
///
/// A declared configuration is enabled unless it says otherwise; the
/// programmatic [`Default`] is disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub position: VersionPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_version: Option<ApiVersion>,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            position: VersionPosition::default(),
            template: None,
            prefix: default_prefix(),
            default_version: None,
        }
    }
}

impl VersionConfig {
    /// An enabled configuration with default placement and prefix.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn position(mut self, position: VersionPosition) -> Self {
        self.position = position;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn default_version(mut self, version: impl Into<ApiVersion>) -> Self {
        self.default_version = Some(version.into());
        self
    }

    /// Fails when an enabled custom position has no template.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.position == VersionPosition::Custom && self.template.is_none() {
            return Err(ConfigError::MissingVersionTemplate);
        }
        Ok(())
    }

    /// Pick the service version, falling back to the default.
    pub fn effective_version<'a>(&'a self, service_version: Option<&'a ApiVersion>) -> Option<&'a ApiVersion> {
        service_version
            .filter(|v| v.is_set())
            .or(self.default_version.as_ref())
            .filter(|v| v.is_set())
    }
}

/// Combine base URL, relative path and version into the final URL.
pub fn build_url_with_version(
    base_url: &str,
    endpoint: &str,
    version: Option<&ApiVersion>,
    config: Option<&VersionConfig>,
) -> Result<String, ConfigError> {
    let config = match config {
        Some(config) if config.enabled => config,
        _ => return Ok(format!("{base_url}/{endpoint}")),
    };
    let version = match version.filter(|v| v.is_set()) {
        Some(version) => version,
        None => return Ok(format!("{base_url}/{endpoint}")),
    };

    let token = format!("{}{}", config.prefix, version);

    let url = match config.position {
        VersionPosition::AfterBase => format!("{base_url}/{token}/{endpoint}"),
        VersionPosition::BeforeEndpoint => format!("{base_url}/{endpoint}/{token}"),
        VersionPosition::Prefix => match base_url.split_once("://") {
            Some((scheme, rest)) => format!("{scheme}://{token}.{rest}/{endpoint}"),
            None => format!("{token}.{base_url}/{endpoint}"),
        },
        VersionPosition::Custom => {
            let template = config
                .template
                .as_deref()
                .ok_or(ConfigError::MissingVersionTemplate)?;
            // Each placeholder is substituted once, left to right.
            template
                .replacen("{baseURL}", base_url, 1)
                .replacen("{version}", &token, 1)
                .replacen("{endpoint}", endpoint, 1)
        }
    };
    Ok(url)
}

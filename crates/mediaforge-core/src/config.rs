//! Configuration for the MediaForge engine and CLI.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapter::AdapterRegistry;
use crate::error::{AdapterError, ConfigError, PolicyError};
use crate::policy::PolicyTable;
use crate::remote::RemoteAdapter;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "MEDIAFORGE_CONFIG";

/// Project-level config file, looked up in the working directory.
pub const PROJECT_CONFIG_FILE: &str = "mediaforge.toml";

/// MediaForge configuration — typically stored at `~/.mediaforge/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaforgeConfig {
    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Policy table replacing the built-in one (or MEDIAFORGE_POLICY_FILE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_file: Option<PathBuf>,

    /// Provider endpoints by provider id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, ProviderEndpoint>,
}

/// A provider reachable over HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    /// Endpoint URL invocations are posted to.
    pub url: String,

    /// Bearer token sent with each request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable holding the bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ProviderEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            api_key_env: None,
            timeout_secs: None,
        }
    }

    /// The inline key, else the one named by `api_key_env`.
    pub fn resolve_api_key(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| self.api_key_env.as_deref().and_then(env))
    }
}

/// Telemetry/observability configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether to export traces over OTLP.
    #[serde(default)]
    pub enabled: bool,

    /// OTLP exporter endpoint.
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,

    /// Log filter used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Rendering of log lines on stderr.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event, with the enclosing run and step spans.
    #[default]
    Json,
    /// Single-line human-readable output.
    Compact,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            log_filter: default_log_filter(),
            log_format: LogFormat::default(),
        }
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".into()
}

fn default_log_filter() -> String {
    "warn,mediaforge_core=info".into()
}

impl MediaforgeConfig {
    /// `~/.mediaforge/config.toml`, when a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(".mediaforge").join("config.toml"))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Load the effective configuration.
    ///
    /// An explicit path must exist. Otherwise MEDIAFORGE_CONFIG, then
    /// `./mediaforge.toml`, then the default path are tried, and a missing
    /// file yields the defaults. Environment overrides are applied last.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => {
                let project = PathBuf::from(PROJECT_CONFIG_FILE);
                let path = std::env::var_os(CONFIG_ENV)
                    .map(PathBuf::from)
                    .or_else(|| project.exists().then_some(project))
                    .or_else(Self::default_path);
                match path {
                    Some(path) if path.exists() => Self::load(&path)?,
                    _ => Self::default(),
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `MEDIAFORGE_*` overrides read through `env`.
    pub fn apply_overrides(
        &mut self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = env("MEDIAFORGE_TELEMETRY") {
            self.telemetry.enabled = parse_flag("MEDIAFORGE_TELEMETRY", &value)?;
        }
        if let Some(endpoint) = env("MEDIAFORGE_OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = endpoint;
        }
        if let Some(filter) = env("MEDIAFORGE_LOG") {
            self.telemetry.log_filter = filter;
        }
        if let Some(value) = env("MEDIAFORGE_LOG_FORMAT") {
            self.telemetry.log_format = match value.trim().to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "compact" => LogFormat::Compact,
                _ => {
                    return Err(ConfigError::InvalidOverride {
                        key: "MEDIAFORGE_LOG_FORMAT".into(),
                        value,
                    })
                }
            };
        }
        if let Some(path) = env("MEDIAFORGE_POLICY_FILE") {
            self.policy_file = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// The configured policy table, or the built-in one.
    pub fn policy_table(&self) -> Result<PolicyTable, PolicyError> {
        match self.policy_file {
            Some(ref path) => PolicyTable::load(path),
            None => Ok(PolicyTable::builtin()),
        }
    }

    /// A registry of [`RemoteAdapter`]s for every configured provider.
    pub fn adapter_registry(&self) -> Result<AdapterRegistry, AdapterError> {
        let mut registry = AdapterRegistry::new();
        for (id, endpoint) in &self.providers {
            let mut adapter = RemoteAdapter::new(id, &endpoint.url)?;
            if let Some(key) = endpoint.resolve_api_key(|name| std::env::var(name).ok()) {
                adapter = adapter.with_api_key(key);
            }
            if let Some(secs) = endpoint.timeout_secs {
                adapter = adapter.with_timeout(Duration::from_secs(secs))?;
            }
            registry.register(adapter);
        }
        Ok(registry)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidOverride {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

//! Model policy table — per-model capabilities checked by the validator.
//!
//! The table is data, not logic: a versioned TOML document embedded in the
//! crate (`policies/models.toml`) that deployments can replace with their
//! own file via [`crate::config::MediaforgeConfig::policy_file`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::recipe::Operation;

const BUILTIN_TABLE: &str = include_str!("../policies/models.toml");

/// The model capability table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTable {
    /// Table version, bumped on every change.
    pub version: String,

    /// Provider used when a fix inserts a background-removal step.
    #[serde(default = "default_background_removal_provider")]
    pub background_removal_provider: String,

    /// Capabilities by model (provider) id.
    #[serde(default)]
    pub models: BTreeMap<String, ModelPolicy>,
}

fn default_background_removal_provider() -> String {
    "rembg".into()
}

/// Capabilities of a single model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Maximum accepted width in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u64>,

    /// Maximum accepted height in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_height: Option<u64>,

    /// Whether a `lora` input is honoured.
    #[serde(default)]
    pub supports_lora: bool,

    /// Whether the model can emit an alpha channel.
    #[serde(default)]
    pub alpha_output: bool,

    /// Supported operations. Empty means unrestricted.
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl ModelPolicy {
    /// Whether the model supports `operation`.
    pub fn supports(&self, operation: &Operation) -> bool {
        self.operations.is_empty() || self.operations.contains(operation)
    }

    /// Maximum for a dimension input (`width` / `height`).
    pub fn max_dimension(&self, key: &str) -> Option<u64> {
        match key {
            "width" => self.max_width,
            "height" => self.max_height,
            _ => None,
        }
    }
}

impl PolicyTable {
    /// The table shipped with this crate.
    pub fn builtin() -> Self {
        Self::from_toml_str(BUILTIN_TABLE).expect("embedded policy table is valid TOML")
    }

    /// An empty table: no semantic checks apply.
    pub fn empty() -> Self {
        Self {
            version: "0".into(),
            background_removal_provider: default_background_removal_provider(),
            models: BTreeMap::new(),
        }
    }

    /// Parse a table from TOML.
    pub fn from_toml_str(raw: &str) -> Result<Self, PolicyError> {
        Ok(toml::from_str(raw)?)
    }

    /// Load a table from a TOML file.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Capabilities for a model, if it is listed.
    pub fn model(&self, id: &str) -> Option<&ModelPolicy> {
        self.models.get(id)
    }

    /// Add or replace a model entry.
    pub fn with_model(mut self, id: impl Into<String>, policy: ModelPolicy) -> Self {
        self.models.insert(id.into(), policy);
        self
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::builtin()
    }
}

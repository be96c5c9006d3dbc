//! Recipe — a declarative generation pipeline.
//!
//! A Recipe declares the inputs it expects, the steps that call out to
//! providers, and the named outputs read back once the steps have run.
//! Step inputs are plain JSON values; strings of the form `$input.<path>`,
//! `$step.<id>.<field>` and `$prev.<field>` are reference tokens resolved at
//! execution time (see [`crate::reference`]).
//!
//! ```text
//! inputs ──▶ step ──▶ step ──▶ outputs
//!               └───▶ step ──┘
//! ```

use std::collections::BTreeMap;

use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A recipe accepted for execution. Plans are structurally identical to
/// recipes; the name marks a document that passed validation or had its
/// fixes applied.
pub type Plan = Recipe;

/// A Recipe — inputs, provider steps and named outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    /// Unique identifier.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// What this recipe produces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Version of this recipe.
    #[serde(default = "default_version")]
    pub version: String,

    /// Inputs the caller supplies at execution time.
    #[serde(default)]
    pub inputs: Vec<InputSpec>,

    /// Steps, in declared order.
    pub steps: Vec<StepSpec>,

    /// Named outputs; each value is a reference token.
    pub outputs: BTreeMap<String, String>,

    /// Optional metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

fn default_version() -> String {
    "0.1.0".into()
}

impl Recipe {
    /// Create an empty recipe.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            version: default_version(),
            inputs: Vec::new(),
            steps: Vec::new(),
            outputs: BTreeMap::new(),
            metadata: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare an input.
    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.inputs.push(input);
        self
    }

    /// Append a step.
    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Declare a named output.
    pub fn with_output(mut self, name: impl Into<String>, token: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), token.into());
        self
    }

    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Position of a step in declared order.
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Look up a declared input by id.
    pub fn input(&self, id: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.id == id)
    }
}

/// A declared recipe input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InputSpec {
    /// Identifier used by `$input.<id>` tokens.
    pub id: String,

    /// Human-readable name.
    #[serde(default)]
    pub name: String,

    /// The kind of value expected.
    #[serde(rename = "type", default)]
    pub kind: InputKind,

    /// Whether the caller must supply this input.
    #[serde(default)]
    pub required: bool,

    /// Value used when the caller omits the input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl InputSpec {
    /// A required input.
    pub fn required(id: impl Into<String>, kind: InputKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            required: true,
            default: None,
            description: None,
        }
    }

    /// An optional input.
    pub fn optional(id: impl Into<String>, kind: InputKind) -> Self {
        Self {
            required: false,
            ..Self::required(id, kind)
        }
    }

    /// Set the default value.
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// The kind of a recipe input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    #[default]
    Text,
    Number,
    Boolean,
    Object,
    Image,
    Video,
    Audio,
    Mask,
    #[serde(other)]
    Other,
}

/// A step: one provider invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Step identifier (unique within the recipe, no dots).
    pub id: String,

    /// Human-readable name for this step.
    #[serde(default)]
    pub name: String,

    /// Provider id, looked up in the adapter registry.
    pub provider: String,

    /// Operation to invoke; `generate-image` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,

    /// Inputs passed to the adapter. String values may be reference tokens.
    pub inputs: BTreeMap<String, Value>,

    /// IDs of steps that must complete before this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Reuse the output of an identical earlier invocation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache: bool,
}

impl StepSpec {
    /// Create a step calling `provider`.
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            provider: provider.into(),
            operation: None,
            inputs: BTreeMap::new(),
            dependencies: Vec::new(),
            cache: false,
        }
    }

    /// Set a human-readable name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the operation.
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Add an input value or reference token.
    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    /// Set explicit dependencies.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Enable output caching for this step.
    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    /// The operation this step performs.
    pub fn effective_operation(&self) -> Operation {
        self.operation.clone().unwrap_or_default()
    }
}

/// Typed adapter operations.
///
/// Parsed leniently: `generate-image`, `generate_image` and `generateImage`
/// are the same operation. Unrecognised names become [`Operation::Custom`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    #[default]
    GenerateImage,
    EditImage,
    Upscale,
    RemoveBackground,
    Inpaint,
    GenerateVideo,
    Custom(String),
}

impl Operation {
    /// Canonical kebab-case name.
    pub fn as_str(&self) -> &str {
        match self {
            Operation::GenerateImage => "generate-image",
            Operation::EditImage => "edit-image",
            Operation::Upscale => "upscale",
            Operation::RemoveBackground => "remove-background",
            Operation::Inpaint => "inpaint",
            Operation::GenerateVideo => "generate-video",
            Operation::Custom(name) => name,
        }
    }
}

impl From<&str> for Operation {
    fn from(raw: &str) -> Self {
        let mut normalized = String::with_capacity(raw.len() + 4);
        for (i, c) in raw.trim().chars().enumerate() {
            if c.is_ascii_uppercase() {
                if i > 0 {
                    normalized.push('-');
                }
                normalized.push(c.to_ascii_lowercase());
            } else if c == '_' || c == ' ' {
                normalized.push('-');
            } else {
                normalized.push(c);
            }
        }
        match normalized.as_str() {
            "generate-image" | "generate" | "text-to-image" => Operation::GenerateImage,
            "edit-image" | "edit" | "image-to-image" => Operation::EditImage,
            "upscale" => Operation::Upscale,
            "remove-background" | "remove-bg" => Operation::RemoveBackground,
            "inpaint" => Operation::Inpaint,
            "generate-video" | "image-to-video" => Operation::GenerateVideo,
            _ => Operation::Custom(raw.trim().to_string()),
        }
    }
}

impl From<String> for Operation {
    fn from(raw: String) -> Self {
        Operation::from(raw.as_str())
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.as_str().to_string()
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JsonSchema for Operation {
    fn schema_name() -> String {
        "Operation".into()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        <String as JsonSchema>::json_schema(gen)
    }
}

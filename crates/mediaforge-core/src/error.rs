//! Error types for the MediaForge engine.

use thiserror::Error;

/// Errors raised while parsing or resolving a reference token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    /// The token starts like a reference but is not well-formed.
    #[error("invalid reference '{0}'")]
    Invalid(String),

    /// The referenced input (or a segment of its dotted path) is absent.
    #[error("input '{0}' not found")]
    MissingInput(String),

    /// The referenced step has not produced an output.
    #[error("step '{0}' has no output")]
    MissingStep(String),

    /// The referenced step produced an output without the requested field.
    #[error("field '{field}' not found on step '{step_id}'")]
    MissingField { step_id: String, field: String },

    /// `$prev` was used where no preceding step exists.
    #[error("'{0}' has no preceding step to read from")]
    NoPreviousStep(String),
}

/// Errors raised while building or walking the step graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Two steps share the same id.
    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    /// The dependency graph contains a cycle.
    #[error("circular dependency detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// Errors raised while applying fixes to a recipe.
#[derive(Debug, Error)]
pub enum FixError {
    /// The fix path does not point at an existing location.
    #[error("fix path '{0}' does not exist in the recipe")]
    PathNotFound(String),

    /// The fix path is not a valid JSON pointer.
    #[error("invalid fix path '{0}'")]
    InvalidPath(String),

    /// An `add` or `modify` fix carried no value.
    #[error("fix for '{0}' has no value")]
    MissingValue(String),

    /// The patched document no longer deserializes as a recipe.
    #[error("patched recipe is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by provider adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// No adapter is registered under this provider id.
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    /// The adapter does not implement the requested operation.
    #[error("provider '{provider}' does not support operation '{operation}'")]
    Unsupported { provider: String, operation: String },

    /// The provider reported a failure. The message is surfaced verbatim.
    #[error("{0}")]
    Provider(String),

    /// HTTP transport error.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote endpoint answered with a non-success status.
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The configured endpoint is not a valid URL.
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The provider answered with something that is not a JSON object.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

/// Errors raised while loading the model policy table.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse policy table: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },
}

/// Umbrella error for callers that mix engine concerns.
#[derive(Debug, Error)]
pub enum MediaforgeError {
    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Fix(#[from] FixError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// MediaForge result alias.
pub type MediaforgeResult<T> = Result<T, MediaforgeError>;

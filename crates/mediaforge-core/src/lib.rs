//! # mediaforge-core
//!
//! Recipe validation and pipeline execution engine for MediaForge.
//!
//! A recipe is a declarative graph of provider steps (generate, edit, upscale,
//! remove background, ...) wired together with reference tokens. This crate
//! provides the building blocks for:
//! - Validating recipes statically, with machine-applicable fixes
//! - Checking provider/model compatibility against a versioned policy table
//! - Executing plans wave by wave with caching and cancellation
//! - Observability via `tracing` and OpenTelemetry
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mediaforge_core::{
//!     AdapterRegistry, DryRunAdapter, Executor, InputKind, InputSpec, PolicyTable, Recipe,
//!     StepSpec, Validator,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(AdapterRegistry::new().with_adapter(DryRunAdapter::new("flux-pro")));
//!
//!     let recipe = Recipe::new("hero", "Hero image")
//!         .with_input(InputSpec::required("prompt", InputKind::Text))
//!         .with_step(StepSpec::new("gen", "flux-pro").with_input("prompt", "$input.prompt"))
//!         .with_output("image", "$step.gen.url");
//!
//!     let validator = Validator::new(registry.clone(), Arc::new(PolicyTable::builtin()));
//!     assert!(validator.validate(&recipe).valid);
//!
//!     let result = Executor::new(registry)
//!         .execute_plan(&recipe, serde_json::json!({"prompt": "sunset"}))
//!         .await;
//!     println!("{}", result.outputs["image"]);
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod executor;
pub mod fixes;
pub mod graph;
pub mod hashing;
pub mod policy;
pub mod recipe;
pub mod reference;
pub mod remote;
pub mod telemetry;
pub mod validator;

// Re-exports
pub use adapter::{Adapter, AdapterRegistry, AdapterResult, DryRunAdapter, ProviderCatalog};
pub use config::{LogFormat, MediaforgeConfig, ProviderEndpoint, TelemetryConfig};
pub use error::{
    AdapterError, ConfigError, FixError, GraphError, MediaforgeError, MediaforgeResult,
    PolicyError, ReferenceError,
};
pub use executor::{ExecutionContext, ExecutionResult, Executor, ProgressSnapshot, StepResult, StepStatus};
pub use fixes::apply_fixes;
pub use graph::StepGraph;
pub use policy::{ModelPolicy, PolicyTable};
pub use recipe::{InputKind, InputSpec, Operation, Plan, Recipe, StepSpec};
pub use reference::{Reference, ResolutionContext};
pub use remote::RemoteAdapter;
pub use validator::{Fix, FixAction, Issue, IssueCode, ValidationResult, Validator};

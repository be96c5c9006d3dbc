//! Adapters — the provider capability the engine calls into.
//!
//! An adapter wraps one provider (a model endpoint, a vendor SDK, a local
//! tool) behind typed operations. The executor only ever sees
//! [`Adapter::invoke`]; concrete adapters implement the operations they
//! support and inherit an `Unsupported` error for the rest.
//!
//! Adapters are looked up by provider id in an [`AdapterRegistry`] that is
//! handed to the validator and the executor explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::AdapterError;
use crate::hashing::fingerprint;
use crate::recipe::Operation;

/// Adapter result alias.
pub type AdapterResult<T> = Result<T, AdapterError>;

fn unsupported(provider: &str, operation: &str) -> AdapterError {
    AdapterError::Unsupported {
        provider: provider.to_string(),
        operation: operation.to_string(),
    }
}

/// A provider adapter.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Provider id this adapter serves (e.g., "flux-pro").
    fn id(&self) -> &str;

    /// Text- or image-conditioned image generation.
    async fn generate_image(&self, _inputs: Value) -> AdapterResult<Value> {
        Err(unsupported(self.id(), Operation::GenerateImage.as_str()))
    }

    /// Instruction-based image editing.
    async fn edit_image(&self, _inputs: Value) -> AdapterResult<Value> {
        Err(unsupported(self.id(), Operation::EditImage.as_str()))
    }

    /// Super-resolution upscaling.
    async fn upscale(&self, _inputs: Value) -> AdapterResult<Value> {
        Err(unsupported(self.id(), Operation::Upscale.as_str()))
    }

    /// Background removal (alpha matte).
    async fn remove_background(&self, _inputs: Value) -> AdapterResult<Value> {
        Err(unsupported(self.id(), Operation::RemoveBackground.as_str()))
    }

    /// Masked inpainting.
    async fn inpaint(&self, _inputs: Value) -> AdapterResult<Value> {
        Err(unsupported(self.id(), Operation::Inpaint.as_str()))
    }

    /// Video generation.
    async fn generate_video(&self, _inputs: Value) -> AdapterResult<Value> {
        Err(unsupported(self.id(), Operation::GenerateVideo.as_str()))
    }

    /// Provider-specific operation outside the typed set.
    async fn custom(&self, operation: &str, _inputs: Value) -> AdapterResult<Value> {
        Err(unsupported(self.id(), operation))
    }

    /// Dispatch an operation with already-resolved inputs.
    async fn invoke(&self, operation: &Operation, inputs: Value) -> AdapterResult<Value> {
        match operation {
            Operation::GenerateImage => self.generate_image(inputs).await,
            Operation::EditImage => self.edit_image(inputs).await,
            Operation::Upscale => self.upscale(inputs).await,
            Operation::RemoveBackground => self.remove_background(inputs).await,
            Operation::Inpaint => self.inpaint(inputs).await,
            Operation::GenerateVideo => self.generate_video(inputs).await,
            Operation::Custom(name) => self.custom(name, inputs).await,
        }
    }
}

/// Lookup-by-id capability the validator needs.
pub trait ProviderCatalog: Send + Sync {
    /// Whether a provider id is known.
    fn has_provider(&self, id: &str) -> bool;

    /// Every known provider id, sorted.
    fn provider_ids(&self) -> Vec<String>;
}

/// Registry mapping provider ids to adapters.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own id, replacing any previous one.
    pub fn register(&mut self, adapter: impl Adapter + 'static) {
        self.register_arc(Arc::new(adapter));
    }

    /// Register a shared adapter under its own id.
    pub fn register_arc(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    /// Builder-style [`AdapterRegistry::register`].
    pub fn with_adapter(mut self, adapter: impl Adapter + 'static) -> Self {
        self.register(adapter);
        self
    }

    /// Look up an adapter by provider id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(id).cloned()
    }

    /// Whether a provider id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.adapters.contains_key(id)
    }

    /// Registered provider ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}

impl ProviderCatalog for AdapterRegistry {
    fn has_provider(&self, id: &str) -> bool {
        self.contains(id)
    }

    fn provider_ids(&self) -> Vec<String> {
        self.ids()
    }
}

/// Stand-in adapter for rehearsing plans without calling any provider.
///
/// Answers every operation with a deterministic `dryrun://` URL derived from
/// the inputs, so downstream references resolve exactly as in a real run.
#[derive(Debug, Clone)]
pub struct DryRunAdapter {
    id: String,
}

impl DryRunAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Adapter for DryRunAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, operation: &Operation, inputs: Value) -> AdapterResult<Value> {
        let hash = fingerprint(&inputs);
        Ok(json!({
            "url": format!("dryrun://{}/{}/{}", self.id, operation, &hash[..12]),
            "metadata": {
                "provider": self.id,
                "operation": operation.as_str(),
                "dryRun": true,
                "inputs": inputs,
            }
        }))
    }
}

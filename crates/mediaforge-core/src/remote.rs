//! Remote adapter — providers reached through a JSON-over-HTTP endpoint.
//!
//! Each invocation is a single `POST` of `{"operation": ..., "inputs": ...}`
//! to the configured endpoint. The endpoint answers with the step output
//! object (typically `{"url": ..., "metadata": ...}`) or with a non-2xx status
//! or an `{"error": "..."}` body on failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::adapter::{Adapter, AdapterResult};
use crate::error::AdapterError;
use crate::recipe::Operation;

/// Adapter for a provider behind an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct RemoteAdapter {
    id: String,
    endpoint: Url,
    http: Client,
    api_key: Option<String>,
}

impl RemoteAdapter {
    /// Create an adapter for `id` posting to `endpoint`.
    pub fn new(id: impl Into<String>, endpoint: &str) -> Result<Self, AdapterError> {
        Ok(Self {
            id: id.into(),
            endpoint: Url::parse(endpoint)?,
            http: Client::new(),
            api_key: None,
        })
    }

    /// Send this key as a bearer token.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Apply a per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, AdapterError> {
        self.http = Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    /// The endpoint requests are posted to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Adapter for RemoteAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, operation: &Operation, inputs: Value) -> AdapterResult<Value> {
        debug!(provider = %self.id, operation = %operation, endpoint = %self.endpoint, "Invoking remote provider");

        let mut request = self.http.post(self.endpoint.clone()).json(&json!({
            "operation": operation.as_str(),
            "inputs": inputs,
        }));
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = resp.json().await?;
        if let Some(message) = body.get("error").and_then(Value::as_str) {
            return Err(AdapterError::Provider(message.to_string()));
        }
        if !body.is_object() {
            return Err(AdapterError::InvalidResponse(format!(
                "expected a JSON object, got {body}"
            )));
        }
        Ok(body)
    }
}

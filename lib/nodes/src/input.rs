//! Human-in-the-loop input collection.

use crate::required_str;
use async_trait::async_trait;
use serde_json::Value;
use trellis_engine::{
    InputKind, InputRequest, LoadError, Node, NodeContext, NodeError, NodeSeed, SharedState,
};

/// Requests input from a human and stores the answer in shared state.
///
/// Config: `prompt` (string, required); `options` (array) makes this a
/// select-style request; `kind` (string) overrides the input kind;
/// `key` (string) is the shared-state key for the answer, defaulting to the
/// node id; `request_id` (string) overrides the delivery key.
pub struct PromptNode {
    prompt: String,
    options: Option<Vec<Value>>,
    kind: Option<InputKind>,
    output_key: String,
    request_id: Option<String>,
}

impl PromptNode {
    /// Creates a text prompt storing its answer under `output_key`.
    #[must_use]
    pub fn new(prompt: impl Into<String>, output_key: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            options: None,
            kind: None,
            output_key: output_key.into(),
            request_id: None,
        }
    }

    /// Builds the node from document configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `prompt` is missing.
    pub fn from_seed(seed: &NodeSeed<'_>) -> Result<Self, LoadError> {
        let options = seed
            .config
            .get("options")
            .and_then(Value::as_array)
            .cloned();
        let kind = seed
            .config
            .get("kind")
            .and_then(Value::as_str)
            .map(|tag| InputKind::from(tag.to_string()));
        let output_key = seed
            .config
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or(seed.id)
            .to_string();
        let request_id = seed
            .config
            .get("request_id")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        Ok(Self {
            prompt: required_str(seed, "prompt")?,
            options,
            kind,
            output_key,
            request_id,
        })
    }

    fn request(&self) -> InputRequest {
        let mut request = match &self.options {
            Some(options) => InputRequest::select(&self.prompt, options.clone()),
            None => InputRequest::text(&self.prompt),
        };
        if let Some(kind) = &self.kind {
            request = request.with_kind(kind.clone());
        }
        if let Some(request_id) = &self.request_id {
            request = request.with_request_id(request_id);
        }
        request
    }
}

#[async_trait]
impl Node for PromptNode {
    async fn prepare(
        &self,
        _shared: &SharedState,
        ctx: &NodeContext,
    ) -> Result<Value, NodeError> {
        ctx.request_input(self.request()).await
    }

    async fn execute(&self, prepared: Value, _ctx: &NodeContext) -> Result<Value, NodeError> {
        Ok(prepared)
    }

    async fn cleanup(
        &self,
        shared: &SharedState,
        _prepared: Value,
        result: Value,
    ) -> Result<Value, NodeError> {
        shared.insert(self.output_key.clone(), result.clone());
        Ok(result)
    }
}

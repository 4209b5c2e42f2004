//! Nodes for observability and pacing.

use crate::required_str;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use trellis_engine::{LoadError, Node, NodeContext, NodeError, NodeSeed, SharedState};

/// Logs a message along with the current shared-state keys.
///
/// Config: `message` (string, required).
pub struct LogNode {
    message: String,
}

impl LogNode {
    /// Creates the node directly.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// Builds the node from document configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `message` is missing.
    pub fn from_seed(seed: &NodeSeed<'_>) -> Result<Self, LoadError> {
        Ok(Self { message: required_str(seed, "message")? })
    }
}

#[async_trait]
impl Node for LogNode {
    async fn prepare(
        &self,
        shared: &SharedState,
        _ctx: &NodeContext,
    ) -> Result<Value, NodeError> {
        let keys: Vec<String> = shared.to_map().keys().cloned().collect();
        Ok(Value::from(keys))
    }

    async fn execute(&self, prepared: Value, ctx: &NodeContext) -> Result<Value, NodeError> {
        tracing::info!(
            node_id = %ctx.node_id(),
            shared_keys = %prepared,
            "{}",
            self.message
        );
        Ok(Value::Null)
    }
}

/// Waits cooperatively before continuing.
///
/// Config: `millis` (integer, required).
pub struct DelayNode {
    delay: Duration,
}

impl DelayNode {
    /// Creates the node directly.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Builds the node from document configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `millis` is missing or not an integer.
    pub fn from_seed(seed: &NodeSeed<'_>) -> Result<Self, LoadError> {
        let millis = seed
            .config
            .get("millis")
            .and_then(Value::as_u64)
            .ok_or_else(|| LoadError::NodeConfig {
                node_id: seed.id.to_string(),
                message: "missing required integer 'millis'".to_string(),
            })?;
        Ok(Self { delay: Duration::from_millis(millis) })
    }
}

#[async_trait]
impl Node for DelayNode {
    async fn execute(&self, prepared: Value, _ctx: &NodeContext) -> Result<Value, NodeError> {
        tokio::time::sleep(self.delay).await;
        Ok(prepared)
    }
}

#[cfg(test)]
mod tests {
    use crate::register_builtins;
    use serde_json::json;
    use std::sync::Arc;
    use trellis_engine::{
        MemoryStorage, NodeRegistry, WorkflowDocument, WorkflowEngine, WorkflowStatus,
    };

    fn registry() -> Arc<NodeRegistry> {
        let mut registry = NodeRegistry::new();
        register_builtins(&mut registry);
        Arc::new(registry)
    }

    #[tokio::test]
    async fn log_then_delay_pipeline_completes() {
        let mut engine = WorkflowEngine::builder(registry())
            .workflow_id("flow_test")
            .document(
                WorkflowDocument::from_value(json!({
                    "nodes": [
                        {"id": "note", "class": "LogNode",
                         "config": {"message": "starting"}},
                        {"id": "pause", "class": "DelayNode",
                         "config": {"millis": 5}},
                    ],
                    "edges": [{"from": "note", "to": "pause", "condition": "True"}],
                    "start": "note",
                }))
                .unwrap(),
            )
            .storage(Arc::new(MemoryStorage::new()))
            .start()
            .await
            .unwrap();

        let summary = engine.run(None).await.unwrap();
        assert_eq!(summary.status, WorkflowStatus::Completed);
        assert_eq!(engine.journal_len(), 3);
    }

    #[tokio::test]
    async fn delay_requires_millis() {
        let result = WorkflowEngine::builder(registry())
            .workflow_id("flow_test")
            .document(
                WorkflowDocument::from_value(json!({
                    "nodes": [{"id": "pause", "class": "DelayNode"}],
                    "edges": [],
                    "start": "pause",
                }))
                .unwrap(),
            )
            .storage(Arc::new(MemoryStorage::new()))
            .start()
            .await;
        assert!(result.is_err());
    }
}

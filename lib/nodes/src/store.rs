//! Nodes that write into shared state.

use crate::required_str;
use async_trait::async_trait;
use serde_json::Value;
use trellis_engine::{LoadError, Node, NodeContext, NodeError, NodeSeed, SharedState};

/// Writes a fixed value into shared state.
///
/// Config: `key` (string, required), `value` (any, defaults to null).
pub struct SetValueNode {
    key: String,
    value: Value,
}

impl SetValueNode {
    /// Creates the node directly.
    #[must_use]
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self { key: key.into(), value }
    }

    /// Builds the node from document configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` is missing.
    pub fn from_seed(seed: &NodeSeed<'_>) -> Result<Self, LoadError> {
        Ok(Self {
            key: required_str(seed, "key")?,
            value: seed.config.get("value").cloned().unwrap_or(Value::Null),
        })
    }
}

#[async_trait]
impl Node for SetValueNode {
    async fn execute(&self, _prepared: Value, _ctx: &NodeContext) -> Result<Value, NodeError> {
        Ok(self.value.clone())
    }

    async fn cleanup(
        &self,
        shared: &SharedState,
        _prepared: Value,
        result: Value,
    ) -> Result<Value, NodeError> {
        shared.insert(self.key.clone(), result.clone());
        Ok(result)
    }
}

/// Appends a fixed value to an array in shared state, creating the array if
/// the key is absent.
///
/// Config: `key` (string, required), `value` (any, defaults to null).
pub struct AppendValueNode {
    key: String,
    value: Value,
}

impl AppendValueNode {
    /// Creates the node directly.
    #[must_use]
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self { key: key.into(), value }
    }

    /// Builds the node from document configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` is missing.
    pub fn from_seed(seed: &NodeSeed<'_>) -> Result<Self, LoadError> {
        Ok(Self {
            key: required_str(seed, "key")?,
            value: seed.config.get("value").cloned().unwrap_or(Value::Null),
        })
    }
}

#[async_trait]
impl Node for AppendValueNode {
    async fn execute(&self, _prepared: Value, _ctx: &NodeContext) -> Result<Value, NodeError> {
        Ok(self.value.clone())
    }

    async fn cleanup(
        &self,
        shared: &SharedState,
        _prepared: Value,
        result: Value,
    ) -> Result<Value, NodeError> {
        let key = self.key.clone();
        let appended = result.clone();
        shared.update(move |map| match map.get_mut(&key) {
            Some(Value::Array(items)) => {
                items.push(appended);
                Ok(())
            }
            Some(_) => Err(NodeError::failed(format!("shared['{key}'] is not an array"))),
            None => {
                map.insert(key, Value::Array(vec![appended]));
                Ok(())
            }
        })?;
        Ok(result)
    }
}

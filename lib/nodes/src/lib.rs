//! Ready-made nodes for the trellis workflow engine.
//!
//! Everything here is configured from the workflow document and registered
//! under its type name via [`register_builtins`]:
//!
//! | Class tag | Purpose |
//! |---|---|
//! | `SetValueNode` | write a fixed value into shared state |
//! | `AppendValueNode` | append a fixed value to a shared-state array |
//! | `LogNode` | log a message and the shared-state keys |
//! | `DelayNode` | cooperative delay |
//! | `PromptNode` | request human input and store the answer |

pub mod flow;
pub mod input;
pub mod store;

pub use flow::{DelayNode, LogNode};
pub use input::PromptNode;
pub use store::{AppendValueNode, SetValueNode};

use std::sync::Arc;
use trellis_engine::{Node, NodeRegistry, NodeSeed};

/// Registers every built-in node class under its type name.
pub fn register_builtins(registry: &mut NodeRegistry) {
    registry.register("SetValueNode", |seed: &NodeSeed<'_>| {
        SetValueNode::from_seed(seed).map(|node| Arc::new(node) as Arc<dyn Node>)
    });
    registry.register("AppendValueNode", |seed: &NodeSeed<'_>| {
        AppendValueNode::from_seed(seed).map(|node| Arc::new(node) as Arc<dyn Node>)
    });
    registry.register("LogNode", |seed: &NodeSeed<'_>| {
        LogNode::from_seed(seed).map(|node| Arc::new(node) as Arc<dyn Node>)
    });
    registry.register("DelayNode", |seed: &NodeSeed<'_>| {
        DelayNode::from_seed(seed).map(|node| Arc::new(node) as Arc<dyn Node>)
    });
    registry.register("PromptNode", |seed: &NodeSeed<'_>| {
        PromptNode::from_seed(seed).map(|node| Arc::new(node) as Arc<dyn Node>)
    });
}

pub(crate) fn required_str(
    seed: &NodeSeed<'_>,
    key: &str,
) -> Result<String, trellis_engine::LoadError> {
    seed.config
        .get(key)
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| trellis_engine::LoadError::NodeConfig {
            node_id: seed.id.to_string(),
            message: format!("missing required string '{key}'"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_register_under_type_names() {
        let mut registry = NodeRegistry::new();
        register_builtins(&mut registry);
        assert_eq!(
            registry.class_tags(),
            vec![
                "AppendValueNode".to_string(),
                "DelayNode".to_string(),
                "LogNode".to_string(),
                "PromptNode".to_string(),
                "SetValueNode".to_string(),
            ]
        );
    }
}

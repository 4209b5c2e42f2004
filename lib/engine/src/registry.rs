//! The host-populated node class registry.
//!
//! Workflow documents name node implementations by class tag; the host
//! registers a factory per tag at startup, and the loader resolves tags
//! through this registry. There is no automatic registration — explicit
//! registration avoids global initialization-order hazards.

use crate::error::LoadError;
use crate::node::Node;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What a factory gets to build a node instance: the document-supplied id
/// and per-instance configuration.
#[derive(Debug, Clone, Copy)]
pub struct NodeSeed<'a> {
    /// The node's id within the workflow.
    pub id: &'a str,
    /// The node's configuration from the document.
    pub config: &'a Map<String, Value>,
}

type NodeFactory = Box<dyn Fn(&NodeSeed<'_>) -> Result<Arc<dyn Node>, LoadError> + Send + Sync>;

/// Maps class tags to node factories.
#[derive(Default)]
pub struct NodeRegistry {
    factories: HashMap<String, NodeFactory>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under a class tag, replacing any previous one.
    pub fn register<F>(&mut self, class: impl Into<String>, factory: F)
    where
        F: Fn(&NodeSeed<'_>) -> Result<Arc<dyn Node>, LoadError> + Send + Sync + 'static,
    {
        self.factories.insert(class.into(), Box::new(factory));
    }

    /// Registers a configuration-free node type under a class tag.
    pub fn register_default<N>(&mut self, class: impl Into<String>)
    where
        N: Node + Default + 'static,
    {
        self.register(class, |_seed| Ok(Arc::new(N::default()) as Arc<dyn Node>));
    }

    /// Returns true if a factory is registered for `class`.
    #[must_use]
    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    /// All registered class tags, sorted.
    #[must_use]
    pub fn class_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.factories.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Builds a node instance for the given class tag.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::UnknownNodeClass`] (listing the available tags)
    /// if the tag is not registered, or the factory's own error if the
    /// configuration is rejected.
    pub fn build(
        &self,
        class: &str,
        seed: &NodeSeed<'_>,
    ) -> Result<Arc<dyn Node>, LoadError> {
        match self.factories.get(class) {
            Some(factory) => factory(seed),
            None => Err(LoadError::UnknownNodeClass {
                class: class.to_string(),
                available: self.class_tags(),
            }),
        }
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("classes", &self.class_tags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use crate::node::NodeContext;
    use async_trait::async_trait;

    #[derive(Default)]
    struct NoopNode;

    #[async_trait]
    impl Node for NoopNode {
        async fn execute(
            &self,
            prepared: Value,
            _ctx: &NodeContext,
        ) -> Result<Value, NodeError> {
            Ok(prepared)
        }
    }

    #[test]
    fn register_and_build() {
        let mut registry = NodeRegistry::new();
        registry.register_default::<NoopNode>("Noop");

        assert!(registry.contains("Noop"));
        let config = Map::new();
        let seed = NodeSeed { id: "n1", config: &config };
        assert!(registry.build("Noop", &seed).is_ok());
    }

    #[test]
    fn unknown_class_lists_available_tags() {
        let mut registry = NodeRegistry::new();
        registry.register_default::<NoopNode>("Noop");
        registry.register_default::<NoopNode>("Also");

        let config = Map::new();
        let seed = NodeSeed { id: "n1", config: &config };
        let err = registry.build("Mystery", &seed).unwrap_err();
        assert_eq!(
            err,
            LoadError::UnknownNodeClass {
                class: "Mystery".to_string(),
                available: vec!["Also".to_string(), "Noop".to_string()],
            }
        );
    }

    #[test]
    fn factory_sees_seed_config() {
        let mut registry = NodeRegistry::new();
        registry.register("Strict", |seed: &NodeSeed<'_>| {
            if seed.config.contains_key("required") {
                Ok(Arc::new(NoopNode) as Arc<dyn Node>)
            } else {
                Err(LoadError::NodeConfig {
                    node_id: seed.id.to_string(),
                    message: "missing 'required'".to_string(),
                })
            }
        });

        let empty = Map::new();
        let seed = NodeSeed { id: "s1", config: &empty };
        assert!(matches!(
            registry.build("Strict", &seed),
            Err(LoadError::NodeConfig { .. })
        ));

        let mut config = Map::new();
        config.insert("required".to_string(), Value::Bool(true));
        let seed = NodeSeed { id: "s1", config: &config };
        assert!(registry.build("Strict", &seed).is_ok());
    }
}

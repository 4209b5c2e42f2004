//! Workflow document parsing and graph instantiation.
//!
//! A document is a serializable record of nodes, edges, the start node id,
//! and the initial shared state:
//!
//! ```json
//! {
//!   "nodes": [{"id": "fetch", "class": "HttpNode", "config": {"url": "…"}}],
//!   "edges": [{"from": "fetch", "to": "route", "condition": "True"}],
//!   "start": "fetch",
//!   "initial_state": {"attempts": 0}
//! }
//! ```
//!
//! An omitted edge `condition` defaults to `"None"`, the default/fallback
//! edge. Edges are attached to their source nodes in document order, which
//! edge selection depends on.

use crate::edge::{GUARD_DEFAULT, Transition};
use crate::error::LoadError;
use crate::node::{Node, NodeSpec};
use crate::registry::{NodeRegistry, NodeSeed};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

fn default_condition() -> String {
    GUARD_DEFAULT.to_string()
}

/// A node entry in a workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDoc {
    /// Node id, unique within the document.
    pub id: String,
    /// Class tag resolved against the host's registry.
    pub class: String,
    /// Per-instance configuration.
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// An edge entry in a workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDoc {
    /// Source node id.
    pub from: String,
    /// Destination node id.
    pub to: String,
    /// Guard expression or sentinel; omitted means `"None"` (default edge).
    #[serde(default = "default_condition")]
    pub condition: String,
}

/// A complete workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    /// Nodes, in document order.
    pub nodes: Vec<NodeDoc>,
    /// Edges, in document order.
    #[serde(default)]
    pub edges: Vec<EdgeDoc>,
    /// The start node id.
    pub start: String,
    /// The initial shared-state map for new runs.
    #[serde(default)]
    pub initial_state: Map<String, Value>,
}

impl WorkflowDocument {
    /// Parses a document from JSON text.
    ///
    /// # Errors
    ///
    /// Returns a parse error if the text is not valid JSON or does not match
    /// the schema.
    pub fn from_json(text: &str) -> Result<Self, LoadError> {
        serde_json::from_str(text).map_err(|e| LoadError::Parse { message: e.to_string() })
    }

    /// Parses a document from an already-decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns a parse error if the value does not match the schema.
    pub fn from_value(value: Value) -> Result<Self, LoadError> {
        serde_json::from_value(value).map_err(|e| LoadError::Parse { message: e.to_string() })
    }
}

/// An instantiated node: its static spec plus the registry-built behavior.
pub struct LoadedNode {
    /// Identity, configuration, and outgoing transitions.
    pub spec: NodeSpec,
    /// The node implementation.
    pub behavior: Arc<dyn Node>,
}

/// An instantiated workflow graph, immutable after loading and shareable
/// across runs.
pub struct Workflow {
    nodes: HashMap<String, LoadedNode>,
    start: String,
    initial_state: Map<String, Value>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("start", &self.start)
            .field("initial_state", &self.initial_state)
            .finish_non_exhaustive()
    }
}

impl Workflow {
    /// Instantiates a document against a node registry.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty document, duplicate node ids, unknown
    /// class tags, edges naming undefined nodes, or a missing start node.
    pub fn from_document(
        document: &WorkflowDocument,
        registry: &NodeRegistry,
    ) -> Result<Self, LoadError> {
        if document.nodes.is_empty() {
            return Err(LoadError::EmptyWorkflow);
        }

        let mut nodes: HashMap<String, LoadedNode> = HashMap::new();
        for node_doc in &document.nodes {
            if nodes.contains_key(&node_doc.id) {
                return Err(LoadError::DuplicateNodeId { node_id: node_doc.id.clone() });
            }
            let seed = NodeSeed { id: &node_doc.id, config: &node_doc.config };
            let behavior = registry.build(&node_doc.class, &seed)?;
            let spec = NodeSpec {
                id: node_doc.id.clone(),
                class: node_doc.class.clone(),
                config: node_doc.config.clone(),
                transitions: Vec::new(),
            };
            nodes.insert(node_doc.id.clone(), LoadedNode { spec, behavior });
        }

        for edge in &document.edges {
            if !nodes.contains_key(&edge.to) {
                return Err(LoadError::UnknownEdgeEndpoint {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: edge.to.clone(),
                });
            }
            let source = nodes.get_mut(&edge.from).ok_or_else(|| {
                LoadError::UnknownEdgeEndpoint {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: edge.from.clone(),
                }
            })?;
            source.spec.add_transition(
                Transition::new(&edge.from, &edge.to).when(&edge.condition),
            );
        }

        if !nodes.contains_key(&document.start) {
            return Err(LoadError::MissingStartNode { start: document.start.clone() });
        }

        Ok(Self {
            nodes,
            start: document.start.clone(),
            initial_state: document.initial_state.clone(),
        })
    }

    /// The start node id.
    #[must_use]
    pub fn start(&self) -> &str {
        &self.start
    }

    /// The document's initial shared state.
    #[must_use]
    pub fn initial_state(&self) -> &Map<String, Value> {
        &self.initial_state
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&LoadedNode> {
        self.nodes.get(node_id)
    }

    /// Returns true if the graph defines `node_id`.
    #[must_use]
    pub fn contains_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All node ids, sorted.
    #[must_use]
    pub fn node_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use crate::node::NodeContext;
    use async_trait::async_trait;
    use serde_json::json;

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

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.register_default::<NoopNode>("Noop");
        registry
    }

    fn linear_doc() -> WorkflowDocument {
        WorkflowDocument::from_value(json!({
            "nodes": [
                {"id": "a", "class": "Noop"},
                {"id": "b", "class": "Noop", "config": {"level": 2}},
            ],
            "edges": [
                {"from": "a", "to": "b", "condition": "True"},
            ],
            "start": "a",
            "initial_state": {"count": 0},
        }))
        .unwrap()
    }

    #[test]
    fn document_parses_and_instantiates() {
        let workflow = Workflow::from_document(&linear_doc(), &registry()).unwrap();
        assert_eq!(workflow.start(), "a");
        assert_eq!(workflow.node_count(), 2);
        assert_eq!(workflow.initial_state().get("count"), Some(&json!(0)));

        let a = workflow.node("a").unwrap();
        assert_eq!(a.spec.class, "Noop");
        assert_eq!(a.spec.transitions.len(), 1);
        assert_eq!(a.spec.transitions[0].to, "b");
        assert_eq!(a.spec.transitions[0].condition, "True");

        let b = workflow.node("b").unwrap();
        assert_eq!(b.spec.config.get("level"), Some(&json!(2)));
        assert!(b.spec.transitions.is_empty());
    }

    #[test]
    fn omitted_condition_defaults_to_none_sentinel() {
        let document = WorkflowDocument::from_value(json!({
            "nodes": [{"id": "a", "class": "Noop"}, {"id": "b", "class": "Noop"}],
            "edges": [{"from": "a", "to": "b"}],
            "start": "a",
        }))
        .unwrap();
        assert_eq!(document.edges[0].condition, "None");
    }

    #[test]
    fn transitions_keep_document_order() {
        let document = WorkflowDocument::from_value(json!({
            "nodes": [
                {"id": "router", "class": "Noop"},
                {"id": "x", "class": "Noop"},
                {"id": "y", "class": "Noop"},
                {"id": "z", "class": "Noop"},
            ],
            "edges": [
                {"from": "router", "to": "x", "condition": "shared['v'] == 1"},
                {"from": "router", "to": "y", "condition": "shared['v'] == 2"},
                {"from": "router", "to": "z"},
            ],
            "start": "router",
        }))
        .unwrap();
        let workflow = Workflow::from_document(&document, &registry()).unwrap();
        let order: Vec<&str> = workflow.node("router").unwrap().spec.transitions
            .iter()
            .map(|t| t.to.as_str())
            .collect();
        assert_eq!(order, vec!["x", "y", "z"]);
    }

    #[test]
    fn empty_nodes_is_an_error() {
        let document = WorkflowDocument::from_value(json!({
            "nodes": [], "edges": [], "start": "a",
        }))
        .unwrap();
        assert_eq!(
            Workflow::from_document(&document, &registry()).unwrap_err(),
            LoadError::EmptyWorkflow
        );
    }

    #[test]
    fn duplicate_node_id_is_an_error() {
        let document = WorkflowDocument::from_value(json!({
            "nodes": [{"id": "a", "class": "Noop"}, {"id": "a", "class": "Noop"}],
            "edges": [],
            "start": "a",
        }))
        .unwrap();
        assert!(matches!(
            Workflow::from_document(&document, &registry()),
            Err(LoadError::DuplicateNodeId { .. })
        ));
    }

    #[test]
    fn unknown_class_is_an_error() {
        let document = WorkflowDocument::from_value(json!({
            "nodes": [{"id": "a", "class": "Mystery"}],
            "edges": [],
            "start": "a",
        }))
        .unwrap();
        let err = Workflow::from_document(&document, &registry()).unwrap_err();
        assert!(matches!(err, LoadError::UnknownNodeClass { .. }));
        assert!(err.to_string().contains("Noop"));
    }

    #[test]
    fn edge_to_undefined_node_is_an_error() {
        let document = WorkflowDocument::from_value(json!({
            "nodes": [{"id": "a", "class": "Noop"}],
            "edges": [{"from": "a", "to": "ghost"}],
            "start": "a",
        }))
        .unwrap();
        let err = Workflow::from_document(&document, &registry()).unwrap_err();
        assert!(matches!(err, LoadError::UnknownEdgeEndpoint { .. }));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn missing_start_is_an_error() {
        let document = WorkflowDocument::from_value(json!({
            "nodes": [{"id": "a", "class": "Noop"}],
            "edges": [],
            "start": "elsewhere",
        }))
        .unwrap();
        assert!(matches!(
            Workflow::from_document(&document, &registry()),
            Err(LoadError::MissingStartNode { .. })
        ));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            WorkflowDocument::from_json("{not json"),
            Err(LoadError::Parse { .. })
        ));
        assert!(matches!(
            WorkflowDocument::from_json(r#"{"nodes": []}"#),
            Err(LoadError::Parse { .. })
        ));
    }

    #[test]
    fn document_serde_roundtrip() {
        let document = linear_doc();
        let text = serde_json::to_string(&document).unwrap();
        let parsed = WorkflowDocument::from_json(&text).unwrap();
        assert_eq!(document, parsed);
    }

    #[test]
    fn self_loop_edges_are_allowed() {
        let document = WorkflowDocument::from_value(json!({
            "nodes": [{"id": "agent", "class": "Noop"}],
            "edges": [{"from": "agent", "to": "agent", "condition": "shared['more']"}],
            "start": "agent",
        }))
        .unwrap();
        let workflow = Workflow::from_document(&document, &registry()).unwrap();
        assert_eq!(workflow.node("agent").unwrap().spec.transitions[0].to, "agent");
    }
}

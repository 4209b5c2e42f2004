//! Error types for the workflow engine.
//!
//! Each layer surfaces its own error type:
//! - `LoadError`: parsing and instantiating workflow documents
//! - `ResumeError`: reattaching to a persisted run
//! - `StorageError`: persistence I/O (propagated, never retried)
//! - `NodeError`: failures raised by user node code
//! - `ConditionError`: guard-expression evaluation (logged, treated as false)
//! - `EngineError`: the engine-facing wrapper over all of the above

use std::fmt;

/// Errors from loading a workflow document into a node graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// No document, document path, or workflow id was supplied.
    MissingSource,
    /// An inline document was supplied without a workflow id to file it under.
    MissingWorkflowId,
    /// Failed to read the document file.
    Io { path: String, message: String },
    /// The document is not valid JSON or does not match the schema.
    Parse { message: String },
    /// The document defines no nodes.
    EmptyWorkflow,
    /// Two nodes share the same id.
    DuplicateNodeId { node_id: String },
    /// The class tag is not present in the registry.
    UnknownNodeClass { class: String, available: Vec<String> },
    /// An edge references a node id that is not defined in the document.
    UnknownEdgeEndpoint { from: String, to: String, missing: String },
    /// The start node id is not defined in the document.
    MissingStartNode { start: String },
    /// A node factory rejected its per-instance configuration.
    NodeConfig { node_id: String, message: String },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSource => {
                write!(f, "no workflow document, document path, or workflow id provided")
            }
            Self::MissingWorkflowId => {
                write!(f, "an inline workflow document requires an explicit workflow id")
            }
            Self::Io { path, message } => {
                write!(f, "failed to read workflow document {path}: {message}")
            }
            Self::Parse { message } => write!(f, "invalid workflow document: {message}"),
            Self::EmptyWorkflow => write!(f, "workflow document defines no nodes"),
            Self::DuplicateNodeId { node_id } => {
                write!(f, "duplicate node id '{node_id}' in workflow document")
            }
            Self::UnknownNodeClass { class, available } => {
                write!(
                    f,
                    "unknown node class '{class}'; available classes: {}",
                    available.join(", ")
                )
            }
            Self::UnknownEdgeEndpoint { from, to, missing } => {
                write!(f, "edge {from} -> {to} references undefined node '{missing}'")
            }
            Self::MissingStartNode { start } => {
                write!(f, "start node '{start}' is not defined in the workflow document")
            }
            Self::NodeConfig { node_id, message } => {
                write!(f, "invalid configuration for node '{node_id}': {message}")
            }
        }
    }
}

impl std::error::Error for LoadError {}

/// Errors from resuming or forking a persisted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeError {
    /// No persisted state exists for the run.
    RunNotFound { workflow_id: String, run_id: String },
    /// The requested step index is beyond the end of the journal.
    StepOutOfRange { requested: usize, available: usize },
    /// A node referenced by the snapshot is missing from the current graph.
    MissingNode { node_id: String },
    /// The persisted snapshot could not be decoded.
    CorruptSnapshot { message: String },
}

impl fmt::Display for ResumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotFound { workflow_id, run_id } => {
                write!(f, "no state found for workflow '{workflow_id}' run '{run_id}'")
            }
            Self::StepOutOfRange { requested, available } => {
                write!(f, "step {requested} not found; run has {available} steps")
            }
            Self::MissingNode { node_id } => {
                write!(f, "cannot resume: node '{node_id}' is missing from the current workflow")
            }
            Self::CorruptSnapshot { message } => {
                write!(f, "cannot decode persisted snapshot: {message}")
            }
        }
    }
}

impl std::error::Error for ResumeError {}

/// Errors from storage backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Filesystem I/O failed.
    Io { message: String },
    /// Serializing or deserializing the journal failed.
    Serialization { message: String },
    /// The database backend failed.
    Database { message: String },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { message } => write!(f, "storage I/O failed: {message}"),
            Self::Serialization { message } => {
                write!(f, "journal serialization failed: {message}")
            }
            Self::Database { message } => write!(f, "storage database failed: {message}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Errors raised from a node's lifecycle phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The node's own logic failed.
    Failed { message: String },
    /// A batch or parallel wrapper received a non-array prepared value.
    InvalidPrepared { message: String },
    /// `request_input` was called in a context that cannot suspend.
    InputUnavailable { request_id: String },
    /// Checkpointing at a suspension point failed.
    Checkpoint(StorageError),
    /// The engine went away while the node was awaiting input.
    InputChannelClosed { request_id: String },
}

impl NodeError {
    /// Creates a general node failure with the given message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed { message: message.into() }
    }

    /// Returns true if the retry policy applies to this error.
    ///
    /// Engine-originated conditions (checkpoint failure, a torn-down input
    /// channel) bypass both retry and fallback.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::InvalidPrepared { .. })
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { message } => write!(f, "node failed: {message}"),
            Self::InvalidPrepared { message } => write!(f, "invalid prepared value: {message}"),
            Self::InputUnavailable { request_id } => {
                write!(f, "input '{request_id}' requested outside an engine-driven step")
            }
            Self::Checkpoint(e) => write!(f, "checkpoint at suspension point failed: {e}"),
            Self::InputChannelClosed { request_id } => {
                write!(f, "input channel for '{request_id}' closed before delivery")
            }
        }
    }
}

impl std::error::Error for NodeError {}

impl From<String> for NodeError {
    fn from(message: String) -> Self {
        Self::Failed { message }
    }
}

impl From<&str> for NodeError {
    fn from(message: &str) -> Self {
        Self::Failed { message: message.to_string() }
    }
}

/// Errors from evaluating a guard expression.
///
/// These never propagate out of edge selection; the failing guard is logged
/// and treated as false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    /// The expression could not be parsed.
    Parse { message: String },
    /// The expression failed during evaluation.
    Eval { message: String },
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { message } => write!(f, "condition parse error: {message}"),
            Self::Eval { message } => write!(f, "condition evaluation error: {message}"),
        }
    }
}

impl std::error::Error for ConditionError {}

/// High-level engine errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Loading the workflow document failed.
    Load(LoadError),
    /// Resuming a persisted run failed.
    Resume(ResumeError),
    /// Persistence failed.
    Storage(StorageError),
    /// A node failed terminally; the run is marked failed.
    NodeFailure { node_id: String, source: NodeError },
    /// The scheduled next node is not present in the graph.
    NodeNotFound { node_id: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load(e) => write!(f, "workflow load failed: {e}"),
            Self::Resume(e) => write!(f, "resume failed: {e}"),
            Self::Storage(e) => write!(f, "storage failed: {e}"),
            Self::NodeFailure { node_id, source } => {
                write!(f, "node '{node_id}' failed: {source}")
            }
            Self::NodeNotFound { node_id } => {
                write!(f, "node '{node_id}' not found in workflow graph")
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<LoadError> for EngineError {
    fn from(e: LoadError) -> Self {
        Self::Load(e)
    }
}

impl From<ResumeError> for EngineError {
    fn from(e: ResumeError) -> Self {
        Self::Resume(e)
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_node_class_lists_available() {
        let err = LoadError::UnknownNodeClass {
            class: "Mystery".to_string(),
            available: vec!["LogNode".to_string(), "PromptNode".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("Mystery"));
        assert!(message.contains("LogNode, PromptNode"));
    }

    #[test]
    fn missing_node_names_the_node() {
        let err = ResumeError::MissingNode { node_id: "X".to_string() };
        assert!(err.to_string().contains("'X'"));
    }

    #[test]
    fn node_error_retryability() {
        assert!(NodeError::failed("boom").is_retryable());
        assert!(
            !NodeError::Checkpoint(StorageError::Io { message: "disk".to_string() })
                .is_retryable()
        );
        assert!(
            !NodeError::InputChannelClosed { request_id: "q".to_string() }.is_retryable()
        );
    }

    #[test]
    fn engine_error_wraps_layers() {
        let err = EngineError::from(StorageError::Database { message: "locked".to_string() });
        assert!(err.to_string().contains("locked"));

        let err = EngineError::NodeFailure {
            node_id: "worker".to_string(),
            source: NodeError::failed("timeout"),
        };
        assert!(err.to_string().contains("worker"));
        assert!(err.to_string().contains("timeout"));
    }
}

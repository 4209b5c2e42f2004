//! Durable, resumable, human-in-the-loop workflow engine.
//!
//! This crate interprets a directed graph of user-defined nodes connected by
//! guarded edges, advancing a run one node at a time and journaling every
//! step so a run can be stopped, inspected, resumed, or forked from any
//! historical point — in the same process or a fresh one. It provides:
//!
//! - **Node lifecycle**: a three-phase `prepare` / `execute` / `cleanup`
//!   protocol with retries, fallback, and batch/parallel variants
//! - **Input suspension**: a node may request external input mid-execution;
//!   the run checkpoints and parks until the input is delivered
//! - **Edge selection**: deterministic next-node choice over guarded
//!   transitions with a safe expression language
//! - **Step journal**: an append-only list of execution snapshots, the run's
//!   ground truth
//! - **Storage**: pluggable persistence (filesystem, SQLite, in-memory)
//!   keyed by `(workflow_id, run_id)`

pub mod condition;
pub mod edge;
pub mod engine;
pub mod error;
pub mod journal;
pub mod loader;
pub mod node;
pub mod registry;
pub mod runtime;
pub mod sqlite;
pub mod state;
pub mod storage;

pub use edge::Transition;
pub use engine::{EngineBuilder, ForkLineage, InputData, RunSummary, WorkflowEngine};
pub use error::{
    ConditionError, EngineError, LoadError, NodeError, ResumeError, StorageError,
};
pub use journal::{Checkpoint, StepJournal};
pub use loader::{EdgeDoc, LoadedNode, NodeDoc, Workflow, WorkflowDocument};
pub use node::{InputRequest, Node, NodeContext, NodeSpec, RetryPolicy};
pub use registry::{NodeRegistry, NodeSeed};
pub use runtime::{Batch, Parallel};
pub use sqlite::SqliteStorage;
pub use state::{
    AwaitingInput, ExecutionState, InputKind, NodeStatus, SharedState, WorkflowStatus,
};
pub use storage::{FileSystemStorage, MemoryStorage, StorageBackend, StoredRun};

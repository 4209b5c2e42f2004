//! Execution state for a workflow run.
//!
//! An `ExecutionState` is the complete picture of a run between steps: the
//! shared key/value map, where execution goes next, per-node statuses, any
//! outstanding input request, and free-form metadata. Every journal entry is
//! one serialized `ExecutionState`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Between steps, ready to execute the next node.
    Idle,
    /// A node is currently executing.
    Running,
    /// No next node and no pending input; the run is finished.
    Completed,
    /// A node failed terminally; the run is finished.
    Failed,
    /// A node requested external input and the run is suspended.
    WaitingForInput,
}

impl WorkflowStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The status of a single node within the current run.
///
/// A node without an entry has not run (or is mid-execution) in the current
/// step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// The node requested input and is suspended.
    WaitingForInput,
    /// The node's execute phase succeeded (possibly via fallback).
    Completed,
    /// The node failed terminally.
    Failed,
}

/// The kind of input a suspended node is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InputKind {
    /// Free-form text.
    Text,
    /// A choice from the accompanying option list.
    Select,
    /// A caller-defined kind tag.
    Custom(String),
}

impl Default for InputKind {
    fn default() -> Self {
        Self::Text
    }
}

impl From<String> for InputKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "text" => Self::Text,
            "select" => Self::Select,
            _ => Self::Custom(tag),
        }
    }
}

impl From<InputKind> for String {
    fn from(kind: InputKind) -> Self {
        match kind {
            InputKind::Text => "text".to_string(),
            InputKind::Select => "select".to_string(),
            InputKind::Custom(tag) => tag,
        }
    }
}

/// The outstanding input request of a suspended run.
///
/// Present exactly when the workflow status is `WaitingForInput`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwaitingInput {
    /// The node that requested input.
    pub node_id: String,
    /// The key under which the input must be delivered. Defaults to the node
    /// id; nodes may override it to disambiguate repeated requests.
    pub request_id: String,
    /// Prompt text to show whoever supplies the input.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Choices, for select-style requests.
    #[serde(default)]
    pub options: Option<Vec<Value>>,
    /// The kind of input requested.
    #[serde(default)]
    pub input_type: InputKind,
}

/// A snapshot of a workflow run between steps.
///
/// Invariant while the run is active: exactly one of `next_node_id` and
/// `awaiting_input` is set. Both absent means the run completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// The shared key/value map user nodes read and write.
    pub shared: Map<String, Value>,
    /// The node the next step will execute, if any.
    pub next_node_id: Option<String>,
    /// Overall run status.
    pub workflow_status: WorkflowStatus,
    /// Per-node statuses for the current run.
    #[serde(default)]
    pub node_statuses: HashMap<String, NodeStatus>,
    /// The outstanding input request, if suspended.
    #[serde(default)]
    pub awaiting_input: Option<AwaitingInput>,
    /// The node executed by the previous step, if any.
    #[serde(default)]
    pub previous_node_id: Option<String>,
    /// Free-form metadata: timestamps, step index, fork lineage.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Fields written by other readers/writers of the journal format; kept so
    /// they survive a round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExecutionState {
    /// Creates the initial snapshot of a new run, pointed at the start node.
    #[must_use]
    pub fn new_initial(shared: Map<String, Value>, start_node_id: impl Into<String>) -> Self {
        let mut metadata = Map::new();
        metadata.insert(
            "start_time".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        metadata.insert("step".to_string(), Value::from(0u64));
        Self {
            shared,
            next_node_id: Some(start_node_id.into()),
            workflow_status: WorkflowStatus::Idle,
            node_statuses: HashMap::new(),
            awaiting_input: None,
            previous_node_id: None,
            metadata,
            extra: Map::new(),
        }
    }

    /// Returns true if the run can still make progress.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.workflow_status != WorkflowStatus::Failed
            && (self.next_node_id.is_some() || self.awaiting_input.is_some())
    }

    /// Serializes this state into a journal snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the shared map holds values serde cannot encode.
    pub fn to_snapshot(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Decodes a journal snapshot back into an execution state.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot does not match the journal format.
    pub fn from_snapshot(snapshot: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(snapshot)
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A cheap-to-clone handle to the engine-owned execution state.
///
/// Node phases receive this handle to read and mutate the shared map; the
/// engine and runtime use it internally to update statuses. Locks are held
/// only for the duration of each call, never across awaits.
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<ExecutionState>>,
}

impl SharedState {
    pub(crate) fn new(state: ExecutionState) -> Self {
        Self { inner: Arc::new(Mutex::new(state)) }
    }

    /// Returns the value stored under `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        lock_unpoisoned(&self.inner).shared.get(key).cloned()
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        lock_unpoisoned(&self.inner).shared.insert(key.into(), value)
    }

    /// Removes `key`, returning its value.
    pub fn remove(&self, key: &str) -> Option<Value> {
        lock_unpoisoned(&self.inner).shared.remove(key)
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        lock_unpoisoned(&self.inner).shared.contains_key(key)
    }

    /// Returns a copy of the whole shared map.
    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        lock_unpoisoned(&self.inner).shared.clone()
    }

    /// Runs `f` against the shared map under the lock, for compound updates.
    pub fn update<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        f(&mut lock_unpoisoned(&self.inner).shared)
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ExecutionState) -> R) -> R {
        f(&mut lock_unpoisoned(&self.inner))
    }

    pub(crate) fn snapshot_state(&self) -> ExecutionState {
        lock_unpoisoned(&self.inner).clone()
    }
}

//! The step journal: the run's ground truth.
//!
//! Every successful step appends exactly one serialized
//! [`ExecutionState`](crate::state::ExecutionState) snapshot. Entry 0 is the
//! initial state; entry n (n > 0) is the state after step n. Snapshots are
//! deep copies — mutating the live state never aliases into the journal.

use crate::error::StorageError;
use crate::state::{ExecutionState, SharedState, lock_unpoisoned};
use crate::storage::StorageBackend;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// An append-only list of execution snapshots for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct StepJournal {
    workflow_id: String,
    run_id: String,
    steps: Vec<Value>,
}

impl StepJournal {
    /// Creates an empty journal for a run.
    #[must_use]
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self { workflow_id: workflow_id.into(), run_id: run_id.into(), steps: Vec::new() }
    }

    /// Creates a journal from previously persisted snapshots.
    #[must_use]
    pub fn seeded(
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        steps: Vec<Value>,
    ) -> Self {
        Self { workflow_id: workflow_id.into(), run_id: run_id.into(), steps }
    }

    /// The workflow this journal belongs to.
    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// The run this journal belongs to.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Number of snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the journal holds no snapshots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// All snapshots, oldest first.
    #[must_use]
    pub fn steps(&self) -> &[Value] {
        &self.steps
    }

    /// A deep copy of the snapshot at `index`, if present.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> Option<Value> {
        self.steps.get(index).cloned()
    }

    /// Appends a pre-serialized snapshot.
    pub fn append(&mut self, snapshot: Value) {
        self.steps.push(snapshot);
    }

    /// Annotates the state's metadata with the save time and this entry's
    /// step index, then appends a deep-copied snapshot of it.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be serialized — a shared-state
    /// value put there by user code that serde cannot encode.
    pub fn append_state(&mut self, state: &mut ExecutionState) -> Result<(), StorageError> {
        state.metadata.insert(
            "save_time".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        state
            .metadata
            .insert("step".to_string(), Value::from(self.steps.len() as u64));
        let snapshot = state
            .to_snapshot()
            .map_err(|e| StorageError::Serialization { message: e.to_string() })?;
        self.steps.push(snapshot);
        Ok(())
    }

    /// Drops all snapshots with an index greater than `index`.
    pub fn truncate_to(&mut self, index: usize) {
        self.steps.truncate(index.saturating_add(1));
    }
}

/// Couples the live execution state, the journal, and the storage backend
/// into the one save operation used at step boundaries and suspension
/// points: snapshot, append, persist the whole journal atomically.
#[derive(Clone)]
pub struct Checkpoint {
    state: SharedState,
    journal: Arc<Mutex<StepJournal>>,
    storage: Arc<dyn StorageBackend>,
}

impl Checkpoint {
    pub(crate) fn new(
        state: SharedState,
        journal: Arc<Mutex<StepJournal>>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self { state, journal, storage }
    }

    /// Appends the current execution state to the journal and persists the
    /// whole journal.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the storage write fails.
    pub async fn save(&self) -> Result<(), StorageError> {
        let (workflow_id, run_id, steps) = {
            let mut journal = lock_unpoisoned(&self.journal);
            self.state.with_state(|state| journal.append_state(state))?;
            (
                journal.workflow_id().to_string(),
                journal.run_id().to_string(),
                journal.steps().to_vec(),
            )
        };
        tracing::debug!(
            workflow_id = %workflow_id,
            run_id = %run_id,
            steps = steps.len(),
            "persisting journal"
        );
        self.storage.save_state(&workflow_id, &run_id, &steps).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkflowStatus;
    use crate::storage::MemoryStorage;
    use serde_json::{Map, json};

    fn initial_state() -> ExecutionState {
        ExecutionState::new_initial(Map::new(), "a")
    }

    #[test]
    fn append_state_annotates_metadata() {
        let mut journal = StepJournal::new("wf", "run");
        let mut state = initial_state();
        journal.append(state.to_snapshot().unwrap());

        state.previous_node_id = Some("a".to_string());
        journal.append_state(&mut state).unwrap();

        assert_eq!(journal.len(), 2);
        assert_eq!(state.metadata.get("step"), Some(&json!(1)));
        assert!(state.metadata.contains_key("save_time"));
        let stored = journal.snapshot(1).unwrap();
        assert_eq!(stored.get("previous_node_id"), Some(&json!("a")));
    }

    #[test]
    fn snapshots_are_deep_copies() {
        let mut journal = StepJournal::new("wf", "run");
        let mut state = initial_state();
        journal.append_state(&mut state).unwrap();

        // Mutating the live state does not touch the journal entry.
        state.shared.insert("later".to_string(), json!(true));
        let stored = journal.snapshot(0).unwrap();
        assert_eq!(stored.get("shared"), Some(&json!({})));
    }

    #[test]
    fn truncate_keeps_entries_up_to_index() {
        let mut journal = StepJournal::new("wf", "run");
        for i in 0..5 {
            journal.append(json!({ "step": i }));
        }
        journal.truncate_to(2);
        assert_eq!(journal.len(), 3);
        assert_eq!(journal.snapshot(2), Some(json!({"step": 2})));
        assert_eq!(journal.snapshot(3), None);
    }

    #[tokio::test]
    async fn checkpoint_appends_and_persists() {
        let storage = Arc::new(MemoryStorage::new());
        let state = SharedState::new(initial_state());
        let journal = Arc::new(Mutex::new(StepJournal::new("wf", "run")));
        let checkpoint = Checkpoint::new(state.clone(), journal.clone(), storage.clone());

        state.insert("x", json!(1));
        checkpoint.save().await.unwrap();
        state.insert("y", json!(2));
        checkpoint.save().await.unwrap();

        assert_eq!(lock_unpoisoned(&journal).len(), 2);
        let stored = storage.load_state("wf", "run").await.unwrap().unwrap();
        assert_eq!(stored.steps.len(), 2);
        assert_eq!(stored.steps[0].get("shared"), Some(&json!({"x": 1})));
        assert_eq!(stored.steps[1].get("shared"), Some(&json!({"x": 1, "y": 2})));
    }

    #[tokio::test]
    async fn checkpoint_snapshot_matches_live_status() {
        let storage = Arc::new(MemoryStorage::new());
        let state = SharedState::new(initial_state());
        let journal = Arc::new(Mutex::new(StepJournal::new("wf", "run")));
        let checkpoint = Checkpoint::new(state.clone(), journal, storage.clone());

        state.with_state(|s| s.workflow_status = WorkflowStatus::WaitingForInput);
        checkpoint.save().await.unwrap();

        let stored = storage.load_state("wf", "run").await.unwrap().unwrap();
        assert_eq!(
            stored.steps[0].get("workflow_status"),
            Some(&json!("WAITING_FOR_INPUT"))
        );
    }
}

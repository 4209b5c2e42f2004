//! The workflow engine: loads a graph, drives steps, coordinates suspension
//! and resumption, and owns the run's journal.
//!
//! Construction goes through [`EngineBuilder`]: `start` mints a new run,
//! `resume`/`resume_from` reattach to a persisted run (truncating newer
//! steps), and `fork`/`fork_from` branch a new run off a historical
//! snapshot.
//!
//! Within a run, execution is single-threaded and cooperative: one node's
//! phases run at a time, and a node that requests input parks until the
//! input is delivered via [`WorkflowEngine::step`] — in the same process
//! through a live one-shot channel, or in a fresh process by re-executing
//! the node from its start with the input pre-supplied.

use crate::edge;
use crate::error::{EngineError, LoadError, NodeError, ResumeError};
use crate::journal::{Checkpoint, StepJournal};
use crate::loader::{Workflow, WorkflowDocument};
use crate::node::{NodeContext, SuspensionHook};
use crate::registry::NodeRegistry;
use crate::runtime;
use crate::state::{
    AwaitingInput, ExecutionState, NodeStatus, SharedState, WorkflowStatus, lock_unpoisoned,
};
use crate::storage::{FileSystemStorage, StorageBackend};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Input delivered to a step: request id → value.
pub type InputData = Map<String, Value>;

/// The result of [`WorkflowEngine::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// The workflow status when the loop stopped.
    pub status: WorkflowStatus,
    /// True unless the run completed.
    pub is_active: bool,
    /// The outstanding input request, if the loop stopped on suspension.
    pub awaiting_input: Option<AwaitingInput>,
}

/// Where a forked run came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkLineage {
    /// The ancestor run id.
    pub run_id: String,
    /// The ancestor journal index the fork started from.
    pub step: usize,
}

fn new_run_id() -> String {
    format!(
        "{}_{}",
        chrono::Utc::now().format("%Y%m%d_%H%M%S"),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

fn fork_run_id() -> String {
    format!(
        "{}_fork_{}",
        chrono::Utc::now().format("%Y%m%d_%H%M%S"),
        &uuid::Uuid::new_v4().simple().to_string()[..6]
    )
}

fn path_stem(path: &std::path::Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Configures and constructs a [`WorkflowEngine`].
pub struct EngineBuilder {
    registry: Arc<NodeRegistry>,
    storage: Option<Arc<dyn StorageBackend>>,
    documents_root: PathBuf,
    document: Option<WorkflowDocument>,
    document_path: Option<PathBuf>,
    workflow_id: Option<String>,
    initial_state: Option<Map<String, Value>>,
}

impl EngineBuilder {
    /// Creates a builder over the host's node registry.
    #[must_use]
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry,
            storage: None,
            documents_root: PathBuf::from("."),
            document: None,
            document_path: None,
            workflow_id: None,
            initial_state: None,
        }
    }

    /// Sets the storage backend. Defaults to filesystem storage under
    /// `runs/`.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the directory against which bare workflow ids are resolved to
    /// `<workflow_id>.json`. Defaults to the current directory.
    #[must_use]
    pub fn documents_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.documents_root = root.into();
        self
    }

    /// Supplies the workflow document inline. Requires
    /// [`EngineBuilder::workflow_id`].
    #[must_use]
    pub fn document(mut self, document: WorkflowDocument) -> Self {
        self.document = Some(document);
        self
    }

    /// Reads the workflow document from a file; the workflow id defaults to
    /// the file stem.
    #[must_use]
    pub fn document_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.document_path = Some(path.into());
        self
    }

    /// Names the workflow explicitly.
    #[must_use]
    pub fn workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Seeds the shared state of a new run when the document does not supply
    /// an `initial_state`.
    #[must_use]
    pub fn initial_state(mut self, state: Map<String, Value>) -> Self {
        self.initial_state = Some(state);
        self
    }

    async fn load_workflow(&self) -> Result<(String, Workflow), EngineError> {
        if let Some(document) = &self.document {
            let workflow_id = self
                .workflow_id
                .clone()
                .ok_or(LoadError::MissingWorkflowId)?;
            let workflow = Workflow::from_document(document, &self.registry)?;
            return Ok((workflow_id, workflow));
        }

        let (path, workflow_id) = match (&self.document_path, &self.workflow_id) {
            (Some(path), workflow_id) => (
                path.clone(),
                workflow_id.clone().unwrap_or_else(|| path_stem(path)),
            ),
            (None, Some(workflow_id)) => (
                self.documents_root.join(format!("{workflow_id}.json")),
                workflow_id.clone(),
            ),
            (None, None) => return Err(LoadError::MissingSource.into()),
        };

        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            LoadError::Io { path: path.display().to_string(), message: e.to_string() }
        })?;
        let document = WorkflowDocument::from_json(&text)?;
        let workflow = Workflow::from_document(&document, &self.registry)?;
        Ok((workflow_id, workflow))
    }

    fn storage_backend(&self) -> Arc<dyn StorageBackend> {
        self.storage
            .clone()
            .unwrap_or_else(|| Arc::new(FileSystemStorage::new("runs")))
    }

    /// Starts a new run: mints a run id, seeds the journal with the initial
    /// snapshot, and persists it.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be loaded or the initial
    /// snapshot cannot be persisted.
    pub async fn start(self) -> Result<WorkflowEngine, EngineError> {
        let storage = self.storage_backend();
        let (workflow_id, workflow) = self.load_workflow().await?;

        let mut shared = workflow.initial_state().clone();
        if shared.is_empty()
            && let Some(initial) = self.initial_state
        {
            shared = initial;
        }

        let run_id = new_run_id();
        tracing::info!(workflow_id = %workflow_id, run_id = %run_id, "starting new run");

        let state = ExecutionState::new_initial(shared, workflow.start());
        let snapshot = state
            .to_snapshot()
            .map_err(|e| crate::error::StorageError::Serialization { message: e.to_string() })?;
        let mut journal = StepJournal::new(workflow_id.clone(), run_id.clone());
        journal.append(snapshot);
        storage
            .save_state(&workflow_id, &run_id, journal.steps())
            .await?;

        Ok(WorkflowEngine::assemble(
            workflow_id,
            run_id,
            workflow,
            storage,
            state,
            journal,
        ))
    }

    /// Resumes a run in place from its latest snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is unknown or references nodes missing
    /// from the current graph.
    pub async fn resume(self, run_id: impl Into<String>) -> Result<WorkflowEngine, EngineError> {
        self.reattach(run_id.into(), None, false).await
    }

    /// Resumes a run in place from the snapshot at `step`, discarding newer
    /// journal entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is unknown, `step` is out of range, or
    /// the snapshot references nodes missing from the current graph.
    pub async fn resume_from(
        self,
        run_id: impl Into<String>,
        step: usize,
    ) -> Result<WorkflowEngine, EngineError> {
        self.reattach(run_id.into(), Some(step), false).await
    }

    /// Forks a new run off the ancestor's latest snapshot. The ancestor's
    /// journal is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the ancestor run is unknown or its snapshot
    /// references nodes missing from the current graph.
    pub async fn fork(self, run_id: impl Into<String>) -> Result<WorkflowEngine, EngineError> {
        self.reattach(run_id.into(), None, true).await
    }

    /// Forks a new run off the ancestor's snapshot at `step`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ancestor run is unknown, `step` is out of
    /// range, or the snapshot references nodes missing from the current
    /// graph.
    pub async fn fork_from(
        self,
        run_id: impl Into<String>,
        step: usize,
    ) -> Result<WorkflowEngine, EngineError> {
        self.reattach(run_id.into(), Some(step), true).await
    }

    async fn reattach(
        self,
        source_run_id: String,
        resume_from: Option<usize>,
        fork: bool,
    ) -> Result<WorkflowEngine, EngineError> {
        let storage = self.storage_backend();
        let (workflow_id, workflow) = self.load_workflow().await?;

        let stored = storage
            .load_state(&workflow_id, &source_run_id)
            .await?
            .ok_or_else(|| ResumeError::RunNotFound {
                workflow_id: workflow_id.clone(),
                run_id: source_run_id.clone(),
            })?;
        if stored.steps.is_empty() {
            return Err(ResumeError::RunNotFound {
                workflow_id,
                run_id: source_run_id,
            }
            .into());
        }

        let index = resume_from.unwrap_or(stored.steps.len() - 1);
        let snapshot = stored.steps.get(index).cloned().ok_or(
            ResumeError::StepOutOfRange { requested: index, available: stored.steps.len() },
        )?;

        let mut state = ExecutionState::from_snapshot(snapshot)
            .map_err(|e| ResumeError::CorruptSnapshot { message: e.to_string() })?;
        validate_node_compatibility(&mut state, &workflow)?;

        let (run_id, journal) = if fork {
            let run_id = fork_run_id();
            state.metadata.insert(
                "forked_from".to_string(),
                serde_json::json!({ "run_id": source_run_id, "step": index }),
            );
            state.metadata.insert(
                "fork_time".to_string(),
                Value::String(chrono::Utc::now().to_rfc3339()),
            );
            state
                .metadata
                .insert("run_id".to_string(), Value::String(run_id.clone()));
            let snapshot = state.to_snapshot().map_err(|e| {
                crate::error::StorageError::Serialization { message: e.to_string() }
            })?;
            tracing::info!(
                workflow_id = %workflow_id,
                run_id = %run_id,
                forked_from = %source_run_id,
                step = index,
                "forking run"
            );
            (
                run_id.clone(),
                StepJournal::seeded(workflow_id.clone(), run_id, vec![snapshot]),
            )
        } else {
            tracing::info!(
                workflow_id = %workflow_id,
                run_id = %source_run_id,
                step = index,
                "resuming run"
            );
            (
                source_run_id.clone(),
                StepJournal::seeded(
                    workflow_id.clone(),
                    source_run_id,
                    stored.steps[..=index].to_vec(),
                ),
            )
        };

        storage
            .save_state(&workflow_id, &run_id, journal.steps())
            .await?;

        Ok(WorkflowEngine::assemble(
            workflow_id,
            run_id,
            workflow,
            storage,
            state,
            journal,
        ))
    }
}

/// Validates that every node the snapshot references exists in the current
/// graph, and recomputes `next_node_id` from the previous node's current
/// outgoing edges.
fn validate_node_compatibility(
    state: &mut ExecutionState,
    workflow: &Workflow,
) -> Result<(), ResumeError> {
    if let Some(awaiting) = &state.awaiting_input {
        if !workflow.contains_node(&awaiting.node_id) {
            return Err(ResumeError::MissingNode { node_id: awaiting.node_id.clone() });
        }
        return Ok(());
    }

    if let Some(previous) = &state.previous_node_id {
        if !workflow.contains_node(previous) {
            return Err(ResumeError::MissingNode { node_id: previous.clone() });
        }
    } else if let Some(next) = &state.next_node_id
        && !workflow.contains_node(next)
    {
        return Err(ResumeError::MissingNode { node_id: next.clone() });
    }

    if let Some(previous) = state.previous_node_id.clone()
        && let Some(node) = workflow.node(&previous)
    {
        // Outgoing edges may have changed since the snapshot was taken.
        state.next_node_id = edge::select_next(&node.spec.transitions, state);
    }

    Ok(())
}

struct PendingNode {
    node_id: String,
    handle: JoinHandle<Result<Value, NodeError>>,
    parked_rx: mpsc::UnboundedReceiver<()>,
}

/// A loaded workflow bound to one run.
pub struct WorkflowEngine {
    workflow_id: String,
    run_id: String,
    workflow: Workflow,
    storage: Arc<dyn StorageBackend>,
    state: SharedState,
    journal: Arc<Mutex<StepJournal>>,
    checkpoint: Checkpoint,
    input_futures: crate::node::InputFutures,
    pending: Option<PendingNode>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflow_id", &self.workflow_id)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// Starts configuring an engine over the host's node registry.
    #[must_use]
    pub fn builder(registry: Arc<NodeRegistry>) -> EngineBuilder {
        EngineBuilder::new(registry)
    }

    fn assemble(
        workflow_id: String,
        run_id: String,
        workflow: Workflow,
        storage: Arc<dyn StorageBackend>,
        state: ExecutionState,
        journal: StepJournal,
    ) -> Self {
        let state = SharedState::new(state);
        let journal = Arc::new(Mutex::new(journal));
        let checkpoint = Checkpoint::new(state.clone(), journal.clone(), storage.clone());
        Self {
            workflow_id,
            run_id,
            workflow,
            storage,
            state,
            journal,
            checkpoint,
            input_futures: Arc::new(Mutex::new(HashMap::new())),
            pending: None,
        }
    }

    /// Executes one step: delivers pending input, or runs the next node.
    ///
    /// Returns true while the run can still make progress (including while
    /// it is suspended waiting for input that `input_data` did not supply).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NodeFailure`] if the node fails terminally
    /// (the failing snapshot is persisted first), or a storage error if
    /// persistence fails.
    pub async fn step(&mut self, input_data: Option<InputData>) -> Result<bool, EngineError> {
        let (status, next, awaiting) = self.state.with_state(|s| {
            (s.workflow_status, s.next_node_id.clone(), s.awaiting_input.clone())
        });

        if status == WorkflowStatus::Failed || (next.is_none() && awaiting.is_none()) {
            return Ok(false);
        }

        if status == WorkflowStatus::WaitingForInput {
            let Some(awaiting) = awaiting else {
                return Ok(false);
            };
            let Some(value) = input_data
                .as_ref()
                .and_then(|data| data.get(&awaiting.request_id))
                .cloned()
            else {
                return Ok(true);
            };

            self.state.with_state(|s| {
                s.awaiting_input = None;
                if s.node_statuses.get(&awaiting.node_id)
                    == Some(&NodeStatus::WaitingForInput)
                {
                    s.node_statuses.remove(&awaiting.node_id);
                }
            });

            let sender =
                lock_unpoisoned(&self.input_futures).remove(&awaiting.request_id);
            if let Some(sender) = sender {
                self.state
                    .with_state(|s| s.workflow_status = WorkflowStatus::Running);
                if sender.send(value).is_ok() {
                    tracing::debug!(
                        node_id = %awaiting.node_id,
                        request_id = %awaiting.request_id,
                        "resuming suspended node in-process"
                    );
                    return self.await_pending().await;
                }
            }

            // No live future (cross-process resume, or the task is gone):
            // re-execute the node from its start with the input supplied.
            tracing::debug!(
                node_id = %awaiting.node_id,
                request_id = %awaiting.request_id,
                "no live input future; re-executing node"
            );
            self.state
                .with_state(|s| s.next_node_id = Some(awaiting.node_id.clone()));
        }

        self.state
            .with_state(|s| s.workflow_status = WorkflowStatus::Running);
        let Some(current) = self.state.with_state(|s| s.next_node_id.clone()) else {
            return Ok(false);
        };
        let node = self
            .workflow
            .node(&current)
            .ok_or_else(|| EngineError::NodeNotFound { node_id: current.clone() })?;

        if let Some(stale) = self.pending.take() {
            stale.handle.abort();
        }

        let (parked_tx, parked_rx) = mpsc::unbounded_channel();
        let hook = SuspensionHook {
            checkpoint: self.checkpoint.clone(),
            input_futures: self.input_futures.clone(),
            parked_tx,
        };
        let ctx = NodeContext::new(
            current.clone(),
            node.spec.config.clone(),
            input_data.unwrap_or_default(),
            self.state.clone(),
            Some(hook),
        );

        tracing::debug!(
            workflow_id = %self.workflow_id,
            run_id = %self.run_id,
            node_id = %current,
            "executing node"
        );
        let handle = tokio::spawn(runtime::run_node(
            current.clone(),
            node.behavior.clone(),
            ctx,
        ));
        self.pending = Some(PendingNode { node_id: current, handle, parked_rx });
        self.await_pending().await
    }

    /// Waits for the in-flight node to finish or suspend.
    async fn await_pending(&mut self) -> Result<bool, EngineError> {
        let Some(mut pending) = self.pending.take() else {
            return Ok(false);
        };

        tokio::select! {
            outcome = &mut pending.handle => {
                let node_id = pending.node_id;
                match outcome {
                    Ok(Ok(_output)) => self.finish_step(&node_id).await,
                    Ok(Err(error)) => self.fail_step(node_id, error).await,
                    Err(join_error) => {
                        self.fail_step(
                            node_id,
                            NodeError::failed(format!("node task aborted: {join_error}")),
                        )
                        .await
                    }
                }
            }
            Some(()) = pending.parked_rx.recv() => {
                self.pending = Some(pending);
                Ok(true)
            }
        }
    }

    /// Post-execution bookkeeping: edge selection, status transitions, and
    /// the step's journal append.
    async fn finish_step(&mut self, node_id: &str) -> Result<bool, EngineError> {
        let transitions = self
            .workflow
            .node(node_id)
            .map(|node| node.spec.transitions.clone())
            .unwrap_or_default();

        let status = self.state.with_state(|s| {
            s.previous_node_id = Some(node_id.to_string());
            s.next_node_id = edge::select_next(&transitions, s);
            s.workflow_status = WorkflowStatus::Idle;
            if s.next_node_id.is_none() && s.awaiting_input.is_none() {
                s.workflow_status = WorkflowStatus::Completed;
            }
            s.workflow_status
        });

        self.checkpoint.save().await?;
        Ok(status != WorkflowStatus::Completed)
    }

    async fn fail_step(
        &mut self,
        node_id: String,
        error: NodeError,
    ) -> Result<bool, EngineError> {
        tracing::error!(
            workflow_id = %self.workflow_id,
            run_id = %self.run_id,
            node_id = %node_id,
            error = %error,
            "node failed; marking run failed"
        );
        self.state
            .with_state(|s| s.workflow_status = WorkflowStatus::Failed);
        self.checkpoint.save().await?;
        Err(EngineError::NodeFailure { node_id, source: error })
    }

    /// Steps the run until it completes, fails, or suspends on input.
    ///
    /// If `input_data` is supplied while the run awaits input, it is
    /// delivered first.
    ///
    /// # Errors
    ///
    /// Propagates the first step error; see [`WorkflowEngine::step`].
    pub async fn run(
        &mut self,
        input_data: Option<InputData>,
    ) -> Result<RunSummary, EngineError> {
        if input_data.is_some() && self.awaiting_input().is_some() {
            self.step(input_data).await?;
            tokio::task::yield_now().await;
        }

        loop {
            let continuing = self.step(None).await?;
            if !continuing || self.awaiting_input().is_some() {
                break;
            }
        }

        let (status, awaiting_input) = self
            .state
            .with_state(|s| (s.workflow_status, s.awaiting_input.clone()));
        Ok(RunSummary {
            status,
            is_active: status != WorkflowStatus::Completed,
            awaiting_input,
        })
    }

    /// The workflow this run executes.
    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// This run's id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The current workflow status.
    #[must_use]
    pub fn status(&self) -> WorkflowStatus {
        self.state.with_state(|s| s.workflow_status)
    }

    /// A copy of the current execution state.
    #[must_use]
    pub fn execution_state(&self) -> ExecutionState {
        self.state.snapshot_state()
    }

    /// A handle to the shared state, for host-side inspection.
    #[must_use]
    pub fn shared_state(&self) -> SharedState {
        self.state.clone()
    }

    /// The outstanding input request, if the run is suspended.
    #[must_use]
    pub fn awaiting_input(&self) -> Option<AwaitingInput> {
        self.state.with_state(|s| s.awaiting_input.clone())
    }

    /// Number of snapshots in the journal.
    #[must_use]
    pub fn journal_len(&self) -> usize {
        lock_unpoisoned(&self.journal).len()
    }

    /// A deep copy of the journal snapshot at `index`, if present.
    #[must_use]
    pub fn step_snapshot(&self, index: usize) -> Option<Value> {
        lock_unpoisoned(&self.journal).snapshot(index)
    }

    /// All journal snapshots, oldest first.
    #[must_use]
    pub fn journal_steps(&self) -> Vec<Value> {
        lock_unpoisoned(&self.journal).steps().to_vec()
    }

    /// The fork lineage recorded in this run's metadata, if it was forked.
    #[must_use]
    pub fn lineage(&self) -> Option<ForkLineage> {
        self.state.with_state(|s| {
            let forked_from = s.metadata.get("forked_from")?;
            let run_id = forked_from.get("run_id")?.as_str()?.to_string();
            let step = usize::try_from(forked_from.get("step")?.as_u64()?).ok()?;
            Some(ForkLineage { run_id, step })
        })
    }

    /// The storage backend this run persists through.
    #[must_use]
    pub fn storage(&self) -> Arc<dyn StorageBackend> {
        self.storage.clone()
    }
}

impl Drop for WorkflowEngine {
    fn drop(&mut self) {
        if let Some(pending) = &self.pending {
            pending.handle.abort();
        }
    }
}

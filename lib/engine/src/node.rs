//! The node lifecycle contract.
//!
//! A node runs in three ordered phases:
//!
//! 1. `prepare(shared, ctx)` — gather data; may request external input
//! 2. `execute(prepared, ctx)` — the node's work; retried per the node's
//!    [`RetryPolicy`], with [`Node::exec_fallback`] as the last resort
//! 3. `cleanup(shared, prepared, result)` — write results into shared state;
//!    must not suspend
//!
//! Implementations take `&self` and are shared across steps and runs; any
//! retry bookkeeping lives in the runtime, not the node.

use crate::edge::Transition;
use crate::error::NodeError;
use crate::journal::Checkpoint;
use crate::state::{
    AwaitingInput, InputKind, NodeStatus, SharedState, WorkflowStatus, lock_unpoisoned,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// How many times `execute` is attempted, and the cooperative wait between
/// attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of `execute` attempts (at least 1).
    pub max_attempts: u32,
    /// Wait between attempts.
    pub wait: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the given number of attempts and no wait.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts: max_attempts.max(1), wait: Duration::ZERO }
    }

    /// Sets the wait between attempts.
    #[must_use]
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 1, wait: Duration::ZERO }
    }
}

/// The static description of a node in a loaded workflow: identity, class
/// tag, per-instance configuration, and outgoing transitions in document
/// order. Immutable after loading.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    /// Node id, unique within the workflow.
    pub id: String,
    /// Class tag resolved against the registry.
    pub class: String,
    /// Per-instance configuration.
    pub config: Map<String, Value>,
    /// Outgoing transitions, in document order.
    pub transitions: Vec<Transition>,
}

impl NodeSpec {
    /// Creates a spec with no configuration or transitions.
    #[must_use]
    pub fn new(id: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class: class.into(),
            config: Map::new(),
            transitions: Vec::new(),
        }
    }

    /// Appends an outgoing transition, preserving insertion order.
    pub fn add_transition(&mut self, transition: Transition) {
        self.transitions.push(transition);
    }
}

/// A request for external input, passed to
/// [`NodeContext::request_input`].
#[derive(Debug, Clone, Default)]
pub struct InputRequest {
    /// Prompt text shown to whoever supplies the input.
    pub prompt: Option<String>,
    /// Choices, for select-style requests.
    pub options: Option<Vec<Value>>,
    /// The kind of input requested.
    pub kind: InputKind,
    /// Overrides the delivery key; defaults to the node id.
    pub request_id: Option<String>,
}

impl InputRequest {
    /// A free-form text request.
    #[must_use]
    pub fn text(prompt: impl Into<String>) -> Self {
        Self { prompt: Some(prompt.into()), ..Self::default() }
    }

    /// A selection request over the given options.
    #[must_use]
    pub fn select(prompt: impl Into<String>, options: Vec<Value>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            options: Some(options),
            kind: InputKind::Select,
            request_id: None,
        }
    }

    /// Sets a caller-defined input kind.
    #[must_use]
    pub fn with_kind(mut self, kind: InputKind) -> Self {
        self.kind = kind;
        self
    }

    /// Overrides the request id used to deliver the input.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// One-shot input channels for suspended nodes, keyed by request id.
pub(crate) type InputFutures = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;

/// Engine wiring that lets a node suspend: checkpointing, the input-future
/// table, and the parked-task notification channel.
pub(crate) struct SuspensionHook {
    pub(crate) checkpoint: Checkpoint,
    pub(crate) input_futures: InputFutures,
    pub(crate) parked_tx: mpsc::UnboundedSender<()>,
}

/// Per-execution context handed to `prepare` and `execute`.
///
/// Carries the node's identity and configuration, any input already supplied
/// for this step, and the capability to request more.
pub struct NodeContext {
    node_id: String,
    config: Map<String, Value>,
    provided: Map<String, Value>,
    state: SharedState,
    hook: Option<SuspensionHook>,
}

impl NodeContext {
    pub(crate) fn new(
        node_id: String,
        config: Map<String, Value>,
        provided: Map<String, Value>,
        state: SharedState,
        hook: Option<SuspensionHook>,
    ) -> Self {
        Self { node_id, config, provided, state, hook }
    }

    /// The id of the executing node.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The node's per-instance configuration.
    #[must_use]
    pub fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    pub(crate) fn shared(&self) -> &SharedState {
        &self.state
    }

    /// Requests external input, suspending the run until it arrives.
    ///
    /// If the engine was stepped with input for this request id, the value is
    /// returned immediately. Otherwise the node's status becomes
    /// `waiting_for_input`, the run is checkpointed, and this call parks
    /// until the engine delivers the value — in this process via a live
    /// channel, or in a later process by re-executing the node with the
    /// input pre-supplied.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint fails or the engine goes away
    /// before delivering the input.
    pub async fn request_input(&self, request: InputRequest) -> Result<Value, NodeError> {
        let request_id = request.request_id.clone().unwrap_or_else(|| self.node_id.clone());

        if let Some(value) = self.provided.get(&request_id)
            && !value.is_null()
        {
            return Ok(value.clone());
        }

        self.state.with_state(|state| {
            state.node_statuses.insert(self.node_id.clone(), NodeStatus::WaitingForInput);
            state.awaiting_input = Some(AwaitingInput {
                node_id: self.node_id.clone(),
                request_id: request_id.clone(),
                prompt: request.prompt.clone(),
                options: request.options.clone(),
                input_type: request.kind.clone(),
            });
            state.workflow_status = WorkflowStatus::WaitingForInput;
        });

        let Some(hook) = &self.hook else {
            return Err(NodeError::InputUnavailable { request_id });
        };

        hook.checkpoint.save().await.map_err(NodeError::Checkpoint)?;

        let receiver = {
            let (tx, rx) = oneshot::channel();
            lock_unpoisoned(&hook.input_futures).insert(request_id.clone(), tx);
            rx
        };

        tracing::debug!(
            node_id = %self.node_id,
            request_id = %request_id,
            "node suspended awaiting input"
        );
        let _ = hook.parked_tx.send(());

        receiver
            .await
            .map_err(|_| NodeError::InputChannelClosed { request_id })
    }
}

/// A unit of work in a workflow graph.
///
/// Only `execute` is required; `prepare` defaults to producing null,
/// `cleanup` passes the execution result through, and `exec_fallback`
/// re-raises. Override [`Node::run_with_retries`] to change how the retry
/// policy is applied (see [`crate::runtime::Batch`] and
/// [`crate::runtime::Parallel`]).
#[async_trait]
pub trait Node: Send + Sync {
    /// Gathers data for `execute`. May call
    /// [`NodeContext::request_input`].
    async fn prepare(
        &self,
        _shared: &SharedState,
        _ctx: &NodeContext,
    ) -> Result<Value, NodeError> {
        Ok(Value::Null)
    }

    /// The node's work. Retried per [`Node::retry_policy`]; must not touch
    /// shared state.
    async fn execute(&self, prepared: Value, ctx: &NodeContext) -> Result<Value, NodeError>;

    /// Writes results into shared state and produces the node's final
    /// output. Must not suspend.
    async fn cleanup(
        &self,
        _shared: &SharedState,
        _prepared: Value,
        result: Value,
    ) -> Result<Value, NodeError> {
        Ok(result)
    }

    /// Called when the final `execute` attempt fails; its return value
    /// replaces the execution result. The default re-raises.
    async fn exec_fallback(&self, _prepared: Value, error: NodeError) -> Result<Value, NodeError> {
        Err(error)
    }

    /// The retry policy applied around `execute`.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Drives `execute` under the retry policy. The default runs a single
    /// retry loop over the whole prepared value; batch and parallel variants
    /// override this to fan out per item.
    async fn run_with_retries(
        &self,
        prepared: Value,
        ctx: &NodeContext,
    ) -> Result<Value, NodeError> {
        crate::runtime::execute_with_retry(self, prepared, ctx).await
    }
}

impl std::fmt::Debug for dyn Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Node")
    }
}

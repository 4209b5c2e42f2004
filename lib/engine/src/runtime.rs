//! Drives a node through its lifecycle phases.
//!
//! The retry boundary is `execute` alone: `prepare` and `cleanup` failures
//! propagate immediately. The node's entry in the state's status map becomes
//! `completed` once `execute` (or its fallback) succeeds, and `failed` if any
//! phase fails terminally.
//!
//! [`Batch`] and [`Parallel`] wrap another node to fan the retry policy out
//! over the items of the array its `prepare` returns, sequentially or
//! concurrently.

use crate::error::NodeError;
use crate::node::{Node, NodeContext};
use crate::state::NodeStatus;
use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;
use std::sync::Arc;

/// Runs one node to completion, suspension, or failure.
///
/// Returns the node's final output (the value returned by `cleanup`), which
/// the engine discards.
pub(crate) async fn run_node(
    node_id: String,
    behavior: Arc<dyn Node>,
    ctx: NodeContext,
) -> Result<Value, NodeError> {
    let shared = ctx.shared().clone();

    let prepared = match behavior.prepare(&shared, &ctx).await {
        Ok(prepared) => prepared,
        Err(error) => {
            shared.with_state(|s| s.node_statuses.insert(node_id.clone(), NodeStatus::Failed));
            return Err(error);
        }
    };

    let result = match behavior.run_with_retries(prepared.clone(), &ctx).await {
        Ok(result) => result,
        Err(error) => {
            shared.with_state(|s| s.node_statuses.insert(node_id.clone(), NodeStatus::Failed));
            return Err(error);
        }
    };

    shared.with_state(|s| s.node_statuses.insert(node_id.clone(), NodeStatus::Completed));

    match behavior.cleanup(&shared, prepared, result).await {
        Ok(output) => Ok(output),
        Err(error) => {
            shared.with_state(|s| s.node_statuses.insert(node_id, NodeStatus::Failed));
            Err(error)
        }
    }
}

/// Runs `execute` under the node's retry policy, falling back to
/// `exec_fallback` after the last attempt.
///
/// Engine-originated errors (checkpoint failure, a closed input channel) are
/// not retried and do not reach the fallback.
///
/// # Errors
///
/// Returns the fallback's error if it raises, or the terminal error for
/// non-retryable failures.
pub async fn execute_with_retry<N: Node + ?Sized>(
    node: &N,
    prepared: Value,
    ctx: &NodeContext,
) -> Result<Value, NodeError> {
    let policy = node.retry_policy();
    let mut attempt: u32 = 0;
    loop {
        match node.execute(prepared.clone(), ctx).await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_retryable() => return Err(error),
            Err(error) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return node.exec_fallback(prepared, error).await;
                }
                tracing::debug!(
                    node_id = %ctx.node_id(),
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %error,
                    "execute attempt failed; retrying"
                );
                if !policy.wait.is_zero() {
                    tokio::time::sleep(policy.wait).await;
                }
            }
        }
    }
}

fn prepared_items(prepared: Value) -> Result<Vec<Value>, NodeError> {
    match prepared {
        Value::Array(items) => Ok(items),
        other => Err(NodeError::InvalidPrepared {
            message: format!("expected an array of items, got {other}"),
        }),
    }
}

/// Applies the inner node's retry policy to each prepared item in turn,
/// aggregating the results in order.
pub struct Batch<N> {
    inner: N,
}

impl<N> Batch<N> {
    /// Wraps a node for per-item sequential execution.
    #[must_use]
    pub fn new(inner: N) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<N: Node> Node for Batch<N> {
    async fn prepare(&self, shared: &crate::state::SharedState, ctx: &NodeContext) -> Result<Value, NodeError> {
        self.inner.prepare(shared, ctx).await
    }

    async fn execute(&self, item: Value, ctx: &NodeContext) -> Result<Value, NodeError> {
        self.inner.execute(item, ctx).await
    }

    async fn cleanup(
        &self,
        shared: &crate::state::SharedState,
        prepared: Value,
        result: Value,
    ) -> Result<Value, NodeError> {
        self.inner.cleanup(shared, prepared, result).await
    }

    async fn exec_fallback(&self, prepared: Value, error: NodeError) -> Result<Value, NodeError> {
        self.inner.exec_fallback(prepared, error).await
    }

    fn retry_policy(&self) -> crate::node::RetryPolicy {
        self.inner.retry_policy()
    }

    async fn run_with_retries(
        &self,
        prepared: Value,
        ctx: &NodeContext,
    ) -> Result<Value, NodeError> {
        let items = prepared_items(prepared)?;
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            results.push(execute_with_retry(self, item, ctx).await?);
        }
        Ok(Value::Array(results))
    }
}

/// Like [`Batch`], but executes the prepared items concurrently. Results keep
/// item order regardless of completion order.
pub struct Parallel<N> {
    inner: N,
}

impl<N> Parallel<N> {
    /// Wraps a node for per-item concurrent execution.
    #[must_use]
    pub fn new(inner: N) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<N: Node> Node for Parallel<N> {
    async fn prepare(&self, shared: &crate::state::SharedState, ctx: &NodeContext) -> Result<Value, NodeError> {
        self.inner.prepare(shared, ctx).await
    }

    async fn execute(&self, item: Value, ctx: &NodeContext) -> Result<Value, NodeError> {
        self.inner.execute(item, ctx).await
    }

    async fn cleanup(
        &self,
        shared: &crate::state::SharedState,
        prepared: Value,
        result: Value,
    ) -> Result<Value, NodeError> {
        self.inner.cleanup(shared, prepared, result).await
    }

    async fn exec_fallback(&self, prepared: Value, error: NodeError) -> Result<Value, NodeError> {
        self.inner.exec_fallback(prepared, error).await
    }

    fn retry_policy(&self) -> crate::node::RetryPolicy {
        self.inner.retry_policy()
    }

    async fn run_with_retries(
        &self,
        prepared: Value,
        ctx: &NodeContext,
    ) -> Result<Value, NodeError> {
        let items = prepared_items(prepared)?;
        let results =
            try_join_all(items.into_iter().map(|item| execute_with_retry(self, item, ctx)))
                .await?;
        Ok(Value::Array(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::RetryPolicy;
    use crate::state::{ExecutionState, SharedState};
    use serde_json::{Map, json};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn test_ctx(node_id: &str) -> NodeContext {
        let state = SharedState::new(ExecutionState::new_initial(Map::new(), node_id));
        NodeContext::new(node_id.to_string(), Map::new(), Map::new(), state, None)
    }

    struct Doubler;

    #[async_trait]
    impl Node for Doubler {
        async fn prepare(
            &self,
            _shared: &SharedState,
            _ctx: &NodeContext,
        ) -> Result<Value, NodeError> {
            Ok(json!([1, 2, 3]))
        }

        async fn execute(&self, item: Value, _ctx: &NodeContext) -> Result<Value, NodeError> {
            let n = item.as_i64().ok_or_else(|| NodeError::failed("not a number"))?;
            Ok(json!(n * 2))
        }
    }

    struct FlakyNode {
        failures: AtomicU32,
        attempts: AtomicU32,
    }

    impl FlakyNode {
        fn failing_times(failures: u32) -> Self {
            Self { failures: AtomicU32::new(failures), attempts: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl Node for FlakyNode {
        async fn execute(&self, _prepared: Value, _ctx: &NodeContext) -> Result<Value, NodeError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(NodeError::failed("transient"));
            }
            Ok(json!("ok"))
        }

        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::new(3)
        }
    }

    struct AlwaysFails {
        with_fallback: bool,
    }

    #[async_trait]
    impl Node for AlwaysFails {
        async fn execute(&self, _prepared: Value, _ctx: &NodeContext) -> Result<Value, NodeError> {
            Err(NodeError::failed("permanent"))
        }

        async fn exec_fallback(
            &self,
            _prepared: Value,
            error: NodeError,
        ) -> Result<Value, NodeError> {
            if self.with_fallback { Ok(json!("fallback")) } else { Err(error) }
        }

        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::new(2)
        }
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let node = FlakyNode::failing_times(2);
        let ctx = test_ctx("flaky");
        let value = execute_with_retry(&node, Value::Null, &ctx).await.unwrap();
        assert_eq!(value, json!("ok"));
        assert_eq!(node.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fallback_replaces_result_after_exhausted_retries() {
        let node = AlwaysFails { with_fallback: true };
        let ctx = test_ctx("fails");
        let value = execute_with_retry(&node, Value::Null, &ctx).await.unwrap();
        assert_eq!(value, json!("fallback"));
    }

    #[tokio::test]
    async fn fallback_error_propagates() {
        let node = AlwaysFails { with_fallback: false };
        let ctx = test_ctx("fails");
        let result = execute_with_retry(&node, Value::Null, &ctx).await;
        assert!(matches!(result, Err(NodeError::Failed { .. })));
    }

    #[tokio::test]
    async fn non_retryable_errors_skip_fallback() {
        struct ChannelGone;

        #[async_trait]
        impl Node for ChannelGone {
            async fn execute(
                &self,
                _prepared: Value,
                _ctx: &NodeContext,
            ) -> Result<Value, NodeError> {
                Err(NodeError::InputChannelClosed { request_id: "q".to_string() })
            }

            async fn exec_fallback(
                &self,
                _prepared: Value,
                _error: NodeError,
            ) -> Result<Value, NodeError> {
                panic!("fallback must not run for engine-originated errors");
            }

            fn retry_policy(&self) -> RetryPolicy {
                RetryPolicy::new(5)
            }
        }

        let ctx = test_ctx("gone");
        let result = execute_with_retry(&ChannelGone, Value::Null, &ctx).await;
        assert!(matches!(result, Err(NodeError::InputChannelClosed { .. })));
    }

    #[tokio::test]
    async fn batch_processes_items_in_order() {
        let node = Batch::new(Doubler);
        let ctx = test_ctx("batch");
        let prepared = node.prepare(ctx.shared(), &ctx).await.unwrap();
        let result = node.run_with_retries(prepared, &ctx).await.unwrap();
        assert_eq!(result, json!([2, 4, 6]));
    }

    #[tokio::test]
    async fn batch_of_empty_array_yields_empty_array() {
        let node = Batch::new(Doubler);
        let ctx = test_ctx("batch");
        let result = node.run_with_retries(json!([]), &ctx).await.unwrap();
        assert_eq!(result, json!([]));
    }

    #[tokio::test]
    async fn batch_rejects_non_array_prepared() {
        let node = Batch::new(Doubler);
        let ctx = test_ctx("batch");
        let result = node.run_with_retries(json!(42), &ctx).await;
        assert!(matches!(result, Err(NodeError::InvalidPrepared { .. })));
    }

    #[tokio::test]
    async fn batch_retries_per_item() {
        struct PerItemFlaky {
            remaining: AtomicU32,
        }

        #[async_trait]
        impl Node for PerItemFlaky {
            async fn execute(
                &self,
                item: Value,
                _ctx: &NodeContext,
            ) -> Result<Value, NodeError> {
                if item == json!("retry") && self.remaining.load(Ordering::SeqCst) > 0 {
                    self.remaining.fetch_sub(1, Ordering::SeqCst);
                    return Err(NodeError::failed("transient"));
                }
                Ok(item)
            }

            fn retry_policy(&self) -> RetryPolicy {
                RetryPolicy::new(2)
            }
        }

        let node = Batch::new(PerItemFlaky { remaining: AtomicU32::new(1) });
        let ctx = test_ctx("batch");
        let result = node
            .run_with_retries(json!(["normal", "retry"]), &ctx)
            .await
            .unwrap();
        assert_eq!(result, json!(["normal", "retry"]));
    }

    #[tokio::test]
    async fn parallel_preserves_item_order() {
        struct Staggered;

        #[async_trait]
        impl Node for Staggered {
            async fn execute(
                &self,
                item: Value,
                _ctx: &NodeContext,
            ) -> Result<Value, NodeError> {
                let n = item.as_u64().ok_or_else(|| NodeError::failed("not a number"))?;
                // Later items finish first.
                tokio::time::sleep(Duration::from_millis(30 - n * 10)).await;
                Ok(json!(n * 10))
            }
        }

        let node = Parallel::new(Staggered);
        let ctx = test_ctx("parallel");
        let result = node.run_with_retries(json!([1, 2]), &ctx).await.unwrap();
        assert_eq!(result, json!([10, 20]));
    }

    #[tokio::test]
    async fn parallel_failure_propagates() {
        struct FailsOnTwo;

        #[async_trait]
        impl Node for FailsOnTwo {
            async fn execute(
                &self,
                item: Value,
                _ctx: &NodeContext,
            ) -> Result<Value, NodeError> {
                if item == json!(2) {
                    return Err(NodeError::failed("item 2 broke"));
                }
                Ok(item)
            }
        }

        let node = Parallel::new(FailsOnTwo);
        let ctx = test_ctx("parallel");
        let result = node.run_with_retries(json!([1, 2, 3]), &ctx).await;
        assert!(matches!(result, Err(NodeError::Failed { .. })));
    }

    #[tokio::test]
    async fn run_node_marks_completed_and_runs_cleanup() {
        struct Recorder;

        #[async_trait]
        impl Node for Recorder {
            async fn execute(
                &self,
                _prepared: Value,
                _ctx: &NodeContext,
            ) -> Result<Value, NodeError> {
                Ok(json!("made"))
            }

            async fn cleanup(
                &self,
                shared: &SharedState,
                _prepared: Value,
                result: Value,
            ) -> Result<Value, NodeError> {
                shared.insert("result", result.clone());
                Ok(result)
            }
        }

        let state = SharedState::new(ExecutionState::new_initial(Map::new(), "rec"));
        let ctx = NodeContext::new(
            "rec".to_string(),
            Map::new(),
            Map::new(),
            state.clone(),
            None,
        );
        let output = run_node("rec".to_string(), Arc::new(Recorder), ctx).await.unwrap();
        assert_eq!(output, json!("made"));
        assert_eq!(state.get("result"), Some(json!("made")));
        let snapshot = state.snapshot_state();
        assert_eq!(snapshot.node_statuses.get("rec"), Some(&NodeStatus::Completed));
    }

    #[tokio::test]
    async fn run_node_marks_failed_on_cleanup_error() {
        struct BadCleanup;

        #[async_trait]
        impl Node for BadCleanup {
            async fn execute(
                &self,
                _prepared: Value,
                _ctx: &NodeContext,
            ) -> Result<Value, NodeError> {
                Ok(Value::Null)
            }

            async fn cleanup(
                &self,
                _shared: &SharedState,
                _prepared: Value,
                _result: Value,
            ) -> Result<Value, NodeError> {
                Err(NodeError::failed("cleanup broke"))
            }
        }

        let state = SharedState::new(ExecutionState::new_initial(Map::new(), "bad"));
        let ctx = NodeContext::new(
            "bad".to_string(),
            Map::new(),
            Map::new(),
            state.clone(),
            None,
        );
        let result = run_node("bad".to_string(), Arc::new(BadCleanup), ctx).await;
        assert!(result.is_err());
        let snapshot = state.snapshot_state();
        assert_eq!(snapshot.node_statuses.get("bad"), Some(&NodeStatus::Failed));
    }

    #[tokio::test]
    async fn run_node_marks_failed_on_prepare_error() {
        struct BadPrepare;

        #[async_trait]
        impl Node for BadPrepare {
            async fn prepare(
                &self,
                _shared: &SharedState,
                _ctx: &NodeContext,
            ) -> Result<Value, NodeError> {
                Err(NodeError::failed("prepare broke"))
            }

            async fn execute(
                &self,
                _prepared: Value,
                _ctx: &NodeContext,
            ) -> Result<Value, NodeError> {
                panic!("execute must not run after a prepare failure");
            }
        }

        let state = SharedState::new(ExecutionState::new_initial(Map::new(), "bad"));
        let ctx = NodeContext::new(
            "bad".to_string(),
            Map::new(),
            Map::new(),
            state.clone(),
            None,
        );
        let result = run_node("bad".to_string(), Arc::new(BadPrepare), ctx).await;
        assert!(result.is_err());
        let snapshot = state.snapshot_state();
        assert_eq!(snapshot.node_statuses.get("bad"), Some(&NodeStatus::Failed));
    }
}

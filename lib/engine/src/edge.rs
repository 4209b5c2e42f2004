//! Transitions between nodes and next-node selection.
//!
//! A transition's guard is either a condition expression (see
//! [`crate::condition`]) or one of three literal sentinels:
//!
//! - `"True"` — an unconditional edge, taken ahead of any conditional sibling
//! - `"None"` — the default edge, taken when no conditional sibling matches
//! - `"False"` — a disabled edge, never taken
//!
//! Transition order is the document order, and it is semantically
//! significant: the first matching conditional guard wins.

use crate::condition;
use crate::state::ExecutionState;

/// The guard sentinel for an unconditional edge.
pub const GUARD_ALWAYS: &str = "True";
/// The guard sentinel for the default edge.
pub const GUARD_DEFAULT: &str = "None";
/// The guard sentinel for a disabled edge.
pub const GUARD_NEVER: &str = "False";

/// A directed, guarded edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// The source node id.
    pub from: String,
    /// The destination node id.
    pub to: String,
    /// The guard: a condition expression or one of the sentinels.
    pub condition: String,
}

impl Transition {
    /// Creates a default transition (`"None"` guard) between two nodes.
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: GUARD_DEFAULT.to_string(),
        }
    }

    /// Sets the guard to a condition expression (or sentinel).
    #[must_use]
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    /// Sets the guard to the unconditional sentinel.
    #[must_use]
    pub fn always(mut self) -> Self {
        self.condition = GUARD_ALWAYS.to_string();
        self
    }
}

/// Selects the destination of the first matching transition, if any.
///
/// Priority:
/// 1. the first `"True"` transition, regardless of shared state;
/// 2. in document order, the first conditional guard that evaluates true;
/// 3. the first `"None"` transition;
/// 4. otherwise none — `"False"` guards and failed evaluations never match.
#[must_use]
pub fn select_next(transitions: &[Transition], state: &ExecutionState) -> Option<String> {
    for transition in transitions {
        if transition.condition == GUARD_ALWAYS {
            return Some(transition.to.clone());
        }
    }

    let mut default_edge = None;
    for transition in transitions {
        match transition.condition.as_str() {
            GUARD_DEFAULT => {
                if default_edge.is_none() {
                    default_edge = Some(&transition.to);
                }
            }
            GUARD_NEVER | GUARD_ALWAYS => {}
            expression => match condition::evaluate(expression, &state.shared) {
                Ok(true) => return Some(transition.to.clone()),
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(
                        condition = expression,
                        from = %transition.from,
                        to = %transition.to,
                        error = %error,
                        "condition evaluation failed; treating as false"
                    );
                }
            },
        }
    }

    default_edge.cloned()
}

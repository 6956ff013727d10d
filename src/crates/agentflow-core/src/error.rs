//! Error types shared across the engine
//!
//! One `thiserror` enum covers the whole error taxonomy: transient and
//! rate-limit failures feed the retry pipeline, logic errors get one adaptive
//! retry, user rejections and fatal errors short-circuit, and the structural
//! errors (illegal transition, invalid topology, stale ordering) are never
//! retried.

use thiserror::Error;

use crate::lifecycle::RunStatus;

/// Errors that can occur anywhere in the workflow engine.
#[derive(Debug, Error)]
pub enum FlowError {
    /// I/O, network or timeout failure that may succeed on retry
    #[error("transient failure: {0}")]
    Transient(String),

    /// Provider rate limit; retried with backoff
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The agent produced output the engine could not use
    #[error("invalid agent output: {0}")]
    Logic(String),

    /// A human rejected an approval gate
    #[error("rejected by user: {0}")]
    UserRejected(String),

    /// Programmer error or invariant violation; never retried
    #[error("fatal: {0}")]
    Fatal(String),

    /// Run state machine rejected the requested transition
    #[error("illegal run state transition from {from} to {to}")]
    IllegalTransition { from: RunStatus, to: RunStatus },

    /// Adding the edge would make the run's graph cyclic
    #[error("edge {from_node} -> {target} would create a cycle")]
    InvalidTopology { from_node: String, target: String },

    /// The event store could not be reached; retryable
    #[error("event store unavailable: {0}")]
    StoreUnavailable(String),

    /// Caller supplied a stale execution order; non-retryable
    #[error("stale execution order for run {run_id}")]
    Conflict { run_id: String },

    /// A broadcast subscriber fell too far behind and was disconnected
    #[error("subscriber lagged and was disconnected")]
    SubscriberLagged,

    /// Lookup miss for a run, session, node or approval
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    pub fn transient(msg: impl Into<String>) -> Self {
        FlowError::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        FlowError::Fatal(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        FlowError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Short tag recorded on `error_occurred` events.
    pub fn kind_label(&self) -> &'static str {
        match self {
            FlowError::Transient(_) => "transient",
            FlowError::RateLimited(_) => "rate_limited",
            FlowError::Logic(_) => "logic",
            FlowError::UserRejected(_) => "user_rejected",
            FlowError::Fatal(_) => "fatal",
            FlowError::IllegalTransition { .. } => "illegal_transition",
            FlowError::InvalidTopology { .. } => "invalid_topology",
            FlowError::StoreUnavailable(_) => "store_unavailable",
            FlowError::Conflict { .. } => "conflict",
            FlowError::SubscriberLagged => "subscriber_lagged",
            FlowError::NotFound { .. } => "not_found",
            FlowError::Serialization(_) => "serialization",
        }
    }
}

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = FlowError::IllegalTransition {
            from: RunStatus::Completed,
            to: RunStatus::Executing,
        };
        assert!(err.to_string().contains("completed"));
        assert!(err.to_string().contains("executing"));

        let err = FlowError::InvalidTopology {
            from_node: "a".into(),
            target: "b".into(),
        };
        assert!(err.to_string().contains("a -> b"));
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(FlowError::transient("x").kind_label(), "transient");
        assert_eq!(
            FlowError::not_found("run", "r1").kind_label(),
            "not_found"
        );
        assert_eq!(FlowError::SubscriberLagged.kind_label(), "subscriber_lagged");
    }
}

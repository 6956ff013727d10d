//! Domain model for the agentflow workflow execution engine
//!
//! This crate holds the types shared by the store and the engine: the
//! execution event sum type, the in-memory DAG, the run lifecycle state
//! machine, retry policies with error classification, and the
//! session/run/branch records. It has no I/O; persistence lives in
//! `agentflow-store` and orchestration in `agentflow-engine`.

pub mod config;
pub mod dag;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod model;
pub mod retry;

pub use config::EngineConfig;
pub use dag::{DagEdge, DagNode, NodeStatus, NodeType, WorkflowDag};
pub use error::{FlowError, Result};
pub use event::{EventBody, EventFrame, EventSubtype, EventType, ExecutionEvent, FileArtifact};
pub use lifecycle::{check_transition, RunStatus};
pub use model::{BranchRecord, BranchStatus, RunMode, SessionRecord, TokenUsage, WorkflowRun};
pub use retry::{classify, ErrorClass, RetryPolicies, RetryPolicy};

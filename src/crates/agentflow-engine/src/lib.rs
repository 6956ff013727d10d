//! Workflow execution engine
//!
//! The orchestration layer of agentflow: a [`WorkflowEngine`] registry spawns
//! one [`RunSupervisor`] per live run; each supervisor seeds a DAG (directly
//! or through a planner agent), drives it with a cooperative scheduler over
//! bounded worker tasks, and funnels every interaction through the
//! [`CapturePipeline`] into the append-only store and the live
//! [`Broadcaster`].
//!
//! LLM providers and the sandboxed code executor are reached only through
//! the [`AgentBackend`] and [`CodeRunner`] traits; the engine owns no
//! provider code.

pub mod broadcast;
pub mod capture;
pub mod extract;
pub mod planner;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod supervisor;
pub mod testsupport;

pub use broadcast::{Broadcaster, Subscription};
pub use capture::CapturePipeline;
pub use registry::WorkflowEngine;
pub use session::{
    AgentBackend, AgentMessage, AgentPersona, AgentReply, CodeBlock, CodeOutcome, CodeRunner,
    HandoffRequest, StepResult, ToolInvocation,
};
pub use supervisor::RunSupervisor;

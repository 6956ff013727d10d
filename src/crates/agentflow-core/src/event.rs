//! Execution event model
//!
//! Every interaction in a run (agent calls, tool calls, code execution,
//! lifecycle changes, approvals, retries) is captured as an
//! [`ExecutionEvent`]. The event kind is a tagged sum type, [`EventBody`];
//! the transport-layer string tag is derived from the variant by a pure
//! function rather than carried around as a free-form string.
//!
//! Events are append-only: once persisted, no field is ever mutated. The
//! store assigns `execution_order`, a per-run total order; an event built in
//! memory carries order `0` until appended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dag::NodeStatus;
use crate::lifecycle::RunStatus;
use crate::model::RunMode;

/// Wire tags for every event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentCall,
    ToolCall,
    CodeExec,
    Handoff,
    FileGen,
    NodeStarted,
    NodeCompleted,
    WorkflowStarted,
    WorkflowStateChanged,
    CostUpdate,
    ApprovalRequested,
    ApprovalReceived,
    ErrorOccurred,
    Heartbeat,
    StepRetryStarted,
    StepRetryBackoff,
    StepRetrySucceeded,
    StepRetryExhausted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentCall => "agent_call",
            EventType::ToolCall => "tool_call",
            EventType::CodeExec => "code_exec",
            EventType::Handoff => "handoff",
            EventType::FileGen => "file_gen",
            EventType::NodeStarted => "node_started",
            EventType::NodeCompleted => "node_completed",
            EventType::WorkflowStarted => "workflow_started",
            EventType::WorkflowStateChanged => "workflow_state_changed",
            EventType::CostUpdate => "cost_update",
            EventType::ApprovalRequested => "approval_requested",
            EventType::ApprovalReceived => "approval_received",
            EventType::ErrorOccurred => "error_occurred",
            EventType::Heartbeat => "heartbeat",
            EventType::StepRetryStarted => "step_retry_started",
            EventType::StepRetryBackoff => "step_retry_backoff",
            EventType::StepRetrySucceeded => "step_retry_succeeded",
            EventType::StepRetryExhausted => "step_retry_exhausted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent_call" => Some(EventType::AgentCall),
            "tool_call" => Some(EventType::ToolCall),
            "code_exec" => Some(EventType::CodeExec),
            "handoff" => Some(EventType::Handoff),
            "file_gen" => Some(EventType::FileGen),
            "node_started" => Some(EventType::NodeStarted),
            "node_completed" => Some(EventType::NodeCompleted),
            "workflow_started" => Some(EventType::WorkflowStarted),
            "workflow_state_changed" => Some(EventType::WorkflowStateChanged),
            "cost_update" => Some(EventType::CostUpdate),
            "approval_requested" => Some(EventType::ApprovalRequested),
            "approval_received" => Some(EventType::ApprovalReceived),
            "error_occurred" => Some(EventType::ErrorOccurred),
            "heartbeat" => Some(EventType::Heartbeat),
            "step_retry_started" => Some(EventType::StepRetryStarted),
            "step_retry_backoff" => Some(EventType::StepRetryBackoff),
            "step_retry_succeeded" => Some(EventType::StepRetrySucceeded),
            "step_retry_exhausted" => Some(EventType::StepRetryExhausted),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase marker for call-shaped events (`agent_call`, `tool_call`,
/// `code_exec`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSubtype {
    Start,
    Complete,
    Execution,
    Message,
}

impl EventSubtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSubtype::Start => "start",
            EventSubtype::Complete => "complete",
            EventSubtype::Execution => "execution",
            EventSubtype::Message => "message",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(EventSubtype::Start),
            "complete" => Some(EventSubtype::Complete),
            "execution" => Some(EventSubtype::Execution),
            "message" => Some(EventSubtype::Message),
            _ => None,
        }
    }
}

/// A file produced during a run, recorded as a `file_gen` event payload.
///
/// Content is embedded only for textual files at most
/// `file_capture_max_bytes` in size, and only the first
/// `file_embed_max_bytes` of it; larger or binary files keep path, size and
/// type with no content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileArtifact {
    /// Path relative to the run's working directory when possible
    pub path: String,
    /// Inferred type, e.g. "text", "image", "data", "code"
    pub file_type: String,
    /// Size on disk in bytes (0 when the file could not be inspected)
    pub size_bytes: u64,
    /// Embedded prefix of the content for small textual files
    pub content: Option<String>,
    /// True when `content` is a prefix rather than the whole file
    pub truncated: bool,
}

/// Typed payload, one variant per event kind.
///
/// The wire tag is derived by [`EventBody::event_type`]; callers never
/// dispatch on strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventBody {
    AgentCall {
        agent: String,
        content: String,
    },
    ToolCall {
        tool: String,
        arguments: Value,
        output: Option<Value>,
    },
    CodeExec {
        code: String,
        stdout: String,
        stderr: String,
        exit_code: i32,
        imports: Vec<String>,
    },
    Handoff {
        from_agent: String,
        to_agent: String,
        reason: Option<String>,
    },
    FileGen(FileArtifact),
    NodeStarted {
        label: String,
        attempt: u32,
    },
    NodeCompleted {
        label: String,
        status: NodeStatus,
        error: Option<String>,
    },
    WorkflowStarted {
        task: String,
        mode: RunMode,
    },
    WorkflowStateChanged {
        from: RunStatus,
        to: RunStatus,
        reason: Option<String>,
    },
    CostUpdate {
        total_cost_usd: f64,
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    ApprovalRequested {
        approval_id: String,
        description: String,
        options: Vec<String>,
    },
    ApprovalReceived {
        approval_id: String,
        approved: bool,
        feedback: Option<String>,
    },
    ErrorOccurred {
        kind: String,
        message: String,
    },
    Heartbeat,
    StepRetryStarted {
        attempt: u32,
        max_attempts: u32,
        error: String,
        adaptive: bool,
    },
    StepRetryBackoff {
        attempt: u32,
        delay_ms: u64,
    },
    StepRetrySucceeded {
        attempt: u32,
    },
    StepRetryExhausted {
        attempt: u32,
        error: String,
    },
}

impl EventBody {
    /// Derive the transport tag from the variant.
    pub fn event_type(&self) -> EventType {
        match self {
            EventBody::AgentCall { .. } => EventType::AgentCall,
            EventBody::ToolCall { .. } => EventType::ToolCall,
            EventBody::CodeExec { .. } => EventType::CodeExec,
            EventBody::Handoff { .. } => EventType::Handoff,
            EventBody::FileGen(_) => EventType::FileGen,
            EventBody::NodeStarted { .. } => EventType::NodeStarted,
            EventBody::NodeCompleted { .. } => EventType::NodeCompleted,
            EventBody::WorkflowStarted { .. } => EventType::WorkflowStarted,
            EventBody::WorkflowStateChanged { .. } => EventType::WorkflowStateChanged,
            EventBody::CostUpdate { .. } => EventType::CostUpdate,
            EventBody::ApprovalRequested { .. } => EventType::ApprovalRequested,
            EventBody::ApprovalReceived { .. } => EventType::ApprovalReceived,
            EventBody::ErrorOccurred { .. } => EventType::ErrorOccurred,
            EventBody::Heartbeat => EventType::Heartbeat,
            EventBody::StepRetryStarted { .. } => EventType::StepRetryStarted,
            EventBody::StepRetryBackoff { .. } => EventType::StepRetryBackoff,
            EventBody::StepRetrySucceeded { .. } => EventType::StepRetrySucceeded,
            EventBody::StepRetryExhausted { .. } => EventType::StepRetryExhausted,
        }
    }
}

/// One captured interaction, the unit of the append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Unique event identifier
    pub id: String,
    /// Owning run
    pub run_id: String,
    /// Owning session
    pub session_id: String,
    /// Node this event belongs to; `None` for run-level events
    pub node_id: Option<String>,
    /// Per-run total order, assigned by the store on append (0 = unassigned)
    pub execution_order: i64,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Phase marker for call-shaped events
    pub subtype: Option<EventSubtype>,
    /// Event that was open when this one was captured
    pub parent_event_id: Option<String>,
    /// Persona that produced the event, when applicable
    pub agent_name: Option<String>,
    /// Wall time of the underlying action
    pub duration_ms: Option<i64>,
    /// Outcome marker ("ok", "error", ...) for call-shaped events
    pub status: Option<String>,
    /// Error text for failed actions
    pub error_message: Option<String>,
    /// Incremental cost attributed to this event
    pub cost_usd: Option<f64>,
    /// Typed payload
    pub body: EventBody,
}

impl ExecutionEvent {
    /// Create a new unordered event; the store assigns `execution_order`.
    pub fn new(
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        body: EventBody,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            session_id: session_id.into(),
            node_id: None,
            execution_order: 0,
            timestamp: Utc::now(),
            subtype: None,
            parent_event_id: None,
            agent_name: None,
            duration_ms: None,
            status: None,
            error_message: None,
            cost_usd: None,
            body,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_subtype(mut self, subtype: EventSubtype) -> Self {
        self.subtype = Some(subtype);
        self
    }

    pub fn with_parent(mut self, parent_event_id: impl Into<String>) -> Self {
        self.parent_event_id = Some(parent_event_id.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_name = Some(agent.into());
        self
    }

    pub fn with_duration_ms(mut self, ms: i64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    /// Wire tag of this event.
    pub fn event_type(&self) -> EventType {
        self.body.event_type()
    }
}

/// Frame shape delivered to broadcast subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub session_id: String,
    pub execution_order: i64,
    pub data: Value,
}

impl From<&ExecutionEvent> for EventFrame {
    fn from(event: &ExecutionEvent) -> Self {
        EventFrame {
            event_type: event.event_type().as_str().to_string(),
            timestamp: event.timestamp,
            run_id: event.run_id.clone(),
            session_id: event.session_id.clone(),
            execution_order: event.execution_order,
            data: serde_json::to_value(&event.body).unwrap_or(Value::Null),
        }
    }
}

//! Domain records: sessions, runs, branches, token usage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::lifecycle::RunStatus;

/// How a run interprets its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Single agent node executes the task directly
    OneShot,
    /// Planner seeds a DAG of agent/control/approval steps
    PlanningControl,
    /// Conversational session, one node per turn
    Chat,
    /// Divergent brainstorming variant of chat
    IdeaGeneration,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::OneShot => "one_shot",
            RunMode::PlanningControl => "planning_control",
            RunMode::Chat => "chat",
            RunMode::IdeaGeneration => "idea_generation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "one_shot" => Some(RunMode::OneShot),
            "planning_control" => Some(RunMode::PlanningControl),
            "chat" => Some(RunMode::Chat),
            "idea_generation" => Some(RunMode::IdeaGeneration),
            _ => None,
        }
    }
}

/// Token counts and cost accumulated by agent calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64, cost_usd: f64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            cost_usd,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cost_usd += other.cost_usd;
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.cost_usd == 0.0
    }
}

/// One end-to-end execution of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Opaque unique identifier, never reused
    pub id: String,
    pub session_id: String,
    pub task: String,
    pub mode: RunMode,
    /// Preferred persona for worker steps
    pub agent: Option<String>,
    /// Preferred model identifier
    pub model: Option<String>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_cost_usd: f64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Mode-specific configuration blob
    pub config: Value,
}

impl WorkflowRun {
    pub fn new(session_id: impl Into<String>, task: impl Into<String>, mode: RunMode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            task: task.into(),
            mode,
            agent: None,
            model: None,
            status: RunStatus::Draft,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_cost_usd: 0.0,
            prompt_tokens: 0,
            completion_tokens: 0,
            last_heartbeat_at: None,
            config: Value::Null,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// User-scoped namespace holding runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub run_count: i64,
    pub total_cost_usd: f64,
}

impl SessionRecord {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: now,
            last_active_at: now,
            run_count: 0,
            total_cost_usd: 0.0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Branch lifecycle marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Active,
    Archived,
}

impl BranchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchStatus::Active => "active",
            BranchStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(BranchStatus::Active),
            "archived" => Some(BranchStatus::Archived),
            _ => None,
        }
    }
}

/// A run forked from another run at a specific node.
///
/// The branch's own run carries the copied event prefix; the parent run is
/// never mutated by the fork.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRecord {
    pub id: String,
    /// The run this branch *is*
    pub run_id: String,
    /// The run it forked from
    pub parent_run_id: String,
    /// Parent branch, when forking a fork; `None` for first-level branches
    pub parent_branch_id: Option<String>,
    /// Node in the parent run the fork pivots on
    pub fork_node_id: String,
    pub hypothesis: Option<String>,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: BranchStatus,
}

impl BranchRecord {
    pub fn new(
        run_id: impl Into<String>,
        parent_run_id: impl Into<String>,
        fork_node_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            parent_run_id: parent_run_id.into(),
            parent_branch_id: None,
            fork_node_id: fork_node_id.into(),
            hypothesis: None,
            name: None,
            created_at: Utc::now(),
            status: BranchStatus::Active,
        }
    }

    pub fn with_hypothesis(mut self, hypothesis: impl Into<String>) -> Self {
        self.hypothesis = Some(hypothesis.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parent_branch(mut self, parent_branch_id: impl Into<String>) -> Self {
        self.parent_branch_id = Some(parent_branch_id.into());
        self
    }
}

//! Row types and conversions between SQLite rows and domain records
//!
//! Timestamps are stored as RFC 3339 TEXT, enums as their string tags, and
//! event payloads as opaque JSON decoded lazily on read.

use agentflow_core::{
    dag::{DagNode, NodeStatus, NodeType},
    error::{FlowError, Result},
    event::{EventBody, EventSubtype, ExecutionEvent},
    lifecycle::RunStatus,
    model::{BranchRecord, BranchStatus, RunMode, SessionRecord, WorkflowRun},
};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

pub(crate) fn corrupt(context: &str, detail: impl std::fmt::Display) -> FlowError {
    FlowError::fatal(format!("corrupt {context} row: {detail}"))
}

pub(crate) fn parse_ts(context: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(context, e))
}

pub(crate) fn parse_opt_ts(context: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(context, v)).transpose()
}

#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub last_active_at: String,
    pub run_count: i64,
    pub total_cost_usd: f64,
}

impl SessionRow {
    pub fn into_record(self) -> Result<SessionRecord> {
        Ok(SessionRecord {
            created_at: parse_ts("session", &self.created_at)?,
            last_active_at: parse_ts("session", &self.last_active_at)?,
            id: self.id,
            name: self.name,
            run_count: self.run_count,
            total_cost_usd: self.total_cost_usd,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RunRow {
    pub id: String,
    pub session_id: String,
    pub task: String,
    pub mode: String,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub status: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub total_cost_usd: f64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub last_heartbeat_at: Option<String>,
    pub config: String,
}

impl RunRow {
    pub fn into_run(self) -> Result<WorkflowRun> {
        Ok(WorkflowRun {
            mode: RunMode::parse(&self.mode)
                .ok_or_else(|| corrupt("run", format!("mode {}", self.mode)))?,
            status: RunStatus::parse(&self.status)
                .ok_or_else(|| corrupt("run", format!("status {}", self.status)))?,
            created_at: parse_ts("run", &self.created_at)?,
            started_at: parse_opt_ts("run", self.started_at.as_deref())?,
            completed_at: parse_opt_ts("run", self.completed_at.as_deref())?,
            last_heartbeat_at: parse_opt_ts("run", self.last_heartbeat_at.as_deref())?,
            config: serde_json::from_str(&self.config)?,
            id: self.id,
            session_id: self.session_id,
            task: self.task,
            agent: self.agent,
            model: self.model,
            total_cost_usd: self.total_cost_usd,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct NodeRow {
    pub node_id: String,
    pub run_id: String,
    pub label: String,
    pub node_type: String,
    pub status: String,
    pub agent: Option<String>,
    pub step_index: Option<i64>,
    pub goal: Option<String>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub attempt: i64,
    pub max_attempts: i64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub payload: String,
}

impl NodeRow {
    pub fn into_node(self) -> Result<DagNode> {
        Ok(DagNode {
            node_type: NodeType::parse(&self.node_type)
                .ok_or_else(|| corrupt("node", format!("type {}", self.node_type)))?,
            status: NodeStatus::parse(&self.status)
                .ok_or_else(|| corrupt("node", format!("status {}", self.status)))?,
            step_index: self.step_index.map(|i| i as u32),
            attempt: self.attempt as u32,
            max_attempts: self.max_attempts as u32,
            started_at: parse_opt_ts("node", self.started_at.as_deref())?,
            completed_at: parse_opt_ts("node", self.completed_at.as_deref())?,
            payload: serde_json::from_str(&self.payload)?,
            node_id: self.node_id,
            run_id: self.run_id,
            label: self.label,
            agent: self.agent,
            goal: self.goal,
            summary: self.summary,
            error: self.error,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct EdgeRow {
    pub source_node_id: String,
    pub target_node_id: String,
    pub run_id: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub id: String,
    pub run_id: String,
    pub session_id: String,
    pub node_id: Option<String>,
    pub execution_order: i64,
    pub timestamp: String,
    pub event_type: String,
    pub event_subtype: Option<String>,
    pub parent_event_id: Option<String>,
    pub agent_name: Option<String>,
    pub duration_ms: Option<i64>,
    pub status: Option<String>,
    pub error_message: Option<String>,
    pub cost_usd: Option<f64>,
    pub payload: String,
}

impl EventRow {
    pub fn into_event(self) -> Result<ExecutionEvent> {
        let body: EventBody = serde_json::from_str(&self.payload)?;
        // The denormalized tag column must agree with the payload variant.
        if body.event_type().as_str() != self.event_type {
            return Err(corrupt(
                "event",
                format!(
                    "tag {} does not match payload {}",
                    self.event_type,
                    body.event_type()
                ),
            ));
        }
        Ok(ExecutionEvent {
            timestamp: parse_ts("event", &self.timestamp)?,
            subtype: self
                .event_subtype
                .as_deref()
                .map(|s| {
                    EventSubtype::parse(s)
                        .ok_or_else(|| corrupt("event", format!("subtype {s}")))
                })
                .transpose()?,
            id: self.id,
            run_id: self.run_id,
            session_id: self.session_id,
            node_id: self.node_id,
            execution_order: self.execution_order,
            parent_event_id: self.parent_event_id,
            agent_name: self.agent_name,
            duration_ms: self.duration_ms,
            status: self.status,
            error_message: self.error_message,
            cost_usd: self.cost_usd,
            body,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BranchRow {
    pub id: String,
    pub run_id: String,
    pub parent_run_id: String,
    pub parent_branch_id: Option<String>,
    pub fork_node_id: String,
    pub hypothesis: Option<String>,
    pub name: Option<String>,
    pub created_at: String,
    pub status: String,
}

impl BranchRow {
    pub fn into_record(self) -> Result<BranchRecord> {
        Ok(BranchRecord {
            created_at: parse_ts("branch", &self.created_at)?,
            status: BranchStatus::parse(&self.status)
                .ok_or_else(|| corrupt("branch", format!("status {}", self.status)))?,
            id: self.id,
            run_id: self.run_id,
            parent_run_id: self.parent_run_id,
            parent_branch_id: self.parent_branch_id,
            fork_node_id: self.fork_node_id,
            hypothesis: self.hypothesis,
            name: self.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_row_rejects_mismatched_tag() {
        let row = EventRow {
            id: "e1".into(),
            run_id: "r1".into(),
            session_id: "s1".into(),
            node_id: None,
            execution_order: 1,
            timestamp: "2026-01-01T00:00:00Z".into(),
            event_type: "tool_call".into(),
            event_subtype: None,
            parent_event_id: None,
            agent_name: None,
            duration_ms: None,
            status: None,
            error_message: None,
            cost_usd: None,
            payload: r#"{"type":"heartbeat"}"#.into(),
        };
        assert!(row.into_event().is_err());
    }

    #[test]
    fn event_row_roundtrip() {
        let row = EventRow {
            id: "e1".into(),
            run_id: "r1".into(),
            session_id: "s1".into(),
            node_id: Some("n1".into()),
            execution_order: 3,
            timestamp: "2026-01-01T00:00:00Z".into(),
            event_type: "agent_call".into(),
            event_subtype: Some("complete".into()),
            parent_event_id: None,
            agent_name: Some("coder".into()),
            duration_ms: Some(40),
            status: Some("ok".into()),
            error_message: None,
            cost_usd: Some(0.01),
            payload: r#"{"type":"agent_call","data":{"agent":"coder","content":"done"}}"#.into(),
        };
        let event = row.into_event().unwrap();
        assert_eq!(event.execution_order, 3);
        assert_eq!(event.subtype, Some(EventSubtype::Complete));
        assert_eq!(event.event_type().as_str(), "agent_call");
    }

    #[test]
    fn bad_timestamp_is_corrupt() {
        assert!(parse_ts("test", "not-a-time").is_err());
        assert!(parse_opt_ts("test", None).unwrap().is_none());
    }
}

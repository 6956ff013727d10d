//! Display filter policy
//!
//! Call-shaped actions are captured as start/complete pairs so consumers can
//! build causal graphs, but user-facing views must not double-count them.
//! The policy lives here, in the store, and nowhere else: the default read
//! path hides the `agent_call` start subtype and the internal node lifecycle
//! events; callers that want the raw stream pass `include_internal`.

use agentflow_core::event::{EventSubtype, EventType, ExecutionEvent};

/// True for events hidden from the default (user display) view.
pub fn is_internal(event_type: EventType, subtype: Option<EventSubtype>) -> bool {
    match event_type {
        EventType::AgentCall => subtype == Some(EventSubtype::Start),
        EventType::NodeStarted | EventType::NodeCompleted => true,
        _ => false,
    }
}

/// Remove internal events. Idempotent: filtering a filtered stream is a
/// no-op.
pub fn apply_default_filter(events: Vec<ExecutionEvent>) -> Vec<ExecutionEvent> {
    events
        .into_iter()
        .filter(|event| !is_internal(event.event_type(), event.subtype))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::event::{EventBody, ExecutionEvent};

    fn event(body: EventBody, subtype: Option<EventSubtype>) -> ExecutionEvent {
        let mut event = ExecutionEvent::new("r1", "s1", body);
        event.subtype = subtype;
        event
    }

    fn sample_stream() -> Vec<ExecutionEvent> {
        vec![
            event(
                EventBody::WorkflowStarted {
                    task: "t".into(),
                    mode: agentflow_core::model::RunMode::OneShot,
                },
                None,
            ),
            event(
                EventBody::NodeStarted {
                    label: "step_1".into(),
                    attempt: 0,
                },
                None,
            ),
            event(
                EventBody::AgentCall {
                    agent: "coder".into(),
                    content: String::new(),
                },
                Some(EventSubtype::Start),
            ),
            event(
                EventBody::AgentCall {
                    agent: "coder".into(),
                    content: "done".into(),
                },
                Some(EventSubtype::Complete),
            ),
            event(
                EventBody::NodeCompleted {
                    label: "step_1".into(),
                    status: agentflow_core::dag::NodeStatus::Completed,
                    error: None,
                },
                None,
            ),
        ]
    }

    #[test]
    fn hides_exactly_starts_and_node_lifecycle() {
        let visible = apply_default_filter(sample_stream());
        let tags: Vec<&str> = visible.iter().map(|e| e.event_type().as_str()).collect();
        assert_eq!(tags, vec!["workflow_started", "agent_call"]);
        assert_eq!(visible[1].subtype, Some(EventSubtype::Complete));
    }

    #[test]
    fn filter_is_idempotent() {
        let once = apply_default_filter(sample_stream());
        let twice = apply_default_filter(once.clone());
        let ids_once: Vec<&str> = once.iter().map(|e| e.id.as_str()).collect();
        let ids_twice: Vec<&str> = twice.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids_once, ids_twice);
    }

    #[test]
    fn tool_and_code_events_stay_visible() {
        assert!(!is_internal(EventType::ToolCall, Some(EventSubtype::Start)));
        assert!(!is_internal(EventType::CodeExec, Some(EventSubtype::Execution)));
        assert!(!is_internal(EventType::FileGen, None));
        assert!(is_internal(EventType::NodeStarted, None));
    }
}

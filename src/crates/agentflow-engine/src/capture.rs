//! Capture pipeline
//!
//! Bridges in-process hooks (agent messages, tool calls, code execution,
//! handoffs, lifecycle changes) to durable events. Capture is synchronous
//! with respect to the emitting code path: the event is built, persisted and
//! broadcast before the hook returns, so causal parentage is always derived
//! from a consistent open-event stack.
//!
//! Side-effect order is persist first, broadcast second; a subscriber that
//! replays from the store can therefore never miss a broadcast event. A
//! publish failure after a successful persist is retried once and then
//! dropped (the event stays replayable via `since`).

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use agentflow_core::dag::{DagNode, NodeStatus};
use agentflow_core::error::{FlowError, Result};
use agentflow_core::event::{EventBody, EventSubtype, ExecutionEvent, FileArtifact};
use agentflow_core::lifecycle::RunStatus;
use agentflow_core::model::{RunMode, TokenUsage};
use agentflow_core::retry::RetryPolicy;
use agentflow_store::EventStore;

use crate::broadcast::Broadcaster;

/// Per-run capture pipeline. Cheap to clone; all clones share the open-event
/// stack so nesting works across the scheduler and its worker contexts.
#[derive(Clone)]
pub struct CapturePipeline {
    store: EventStore,
    broadcaster: Broadcaster,
    run_id: String,
    session_id: String,
    open_events: Arc<Mutex<Vec<String>>>,
    store_retry: RetryPolicy,
}

impl CapturePipeline {
    pub fn new(
        store: EventStore,
        broadcaster: Broadcaster,
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        store_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            broadcaster,
            run_id: run_id.into(),
            session_id: session_id.into(),
            open_events: Arc::new(Mutex::new(Vec::new())),
            store_retry,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// A pipeline sharing this one's store/broadcast handles but with its
    /// own open-event stack. Each worker context gets one so parent links
    /// never leak between nodes executing in parallel.
    pub fn scoped(&self) -> Self {
        Self {
            store: self.store.clone(),
            broadcaster: self.broadcaster.clone(),
            run_id: self.run_id.clone(),
            session_id: self.session_id.clone(),
            open_events: Arc::new(Mutex::new(Vec::new())),
            store_retry: self.store_retry.clone(),
        }
    }

    /// Start a new event envelope for this run.
    pub fn event(&self, body: EventBody) -> ExecutionEvent {
        ExecutionEvent::new(&self.run_id, &self.session_id, body)
    }

    /// Persist then broadcast one event, filling `parent_event_id` from the
    /// open-event stack when the caller did not set one.
    pub async fn record(&self, mut event: ExecutionEvent) -> Result<ExecutionEvent> {
        if event.parent_event_id.is_none() {
            event.parent_event_id = self.open_events.lock().last().cloned();
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.store.append_event(&mut event).await {
                Ok(_) => break,
                Err(FlowError::StoreUnavailable(reason))
                    if self.store_retry.should_retry(attempts) =>
                {
                    let delay = self.store_retry.backoff_delay(attempts);
                    warn!(
                        run_id = %self.run_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "store unavailable, retrying append"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        if self.broadcaster.publish(&event).is_err() && self.broadcaster.publish(&event).is_err()
        {
            warn!(
                run_id = %self.run_id,
                event_id = %event.id,
                "publish failed twice, event remains replayable from the store"
            );
        }
        Ok(event)
    }

    /// Mark an event as open: subsequent events nest under it.
    pub fn open(&self, event_id: &str) {
        self.open_events.lock().push(event_id.to_string());
    }

    /// Close an open event. Tolerates out-of-order closes.
    pub fn close(&self, event_id: &str) {
        let mut stack = self.open_events.lock();
        if let Some(position) = stack.iter().rposition(|id| id == event_id) {
            stack.remove(position);
        }
    }

    /// Broadcast-only notice that the run entered degraded mode because the
    /// store stayed unavailable past the retry budget. Never persisted.
    pub fn degraded_notice(&self, reason: &str) {
        let frame = agentflow_core::event::EventFrame {
            event_type: "degraded_mode".to_string(),
            timestamp: chrono::Utc::now(),
            run_id: self.run_id.clone(),
            session_id: self.session_id.clone(),
            execution_order: 0,
            data: serde_json::json!({ "reason": reason }),
        };
        self.broadcaster.publish_frame(&self.run_id, frame);
    }

    // ------------------------------------------------------------------
    // Run-level hooks
    // ------------------------------------------------------------------

    pub async fn workflow_started(&self, task: &str, mode: RunMode) -> Result<ExecutionEvent> {
        self.record(self.event(EventBody::WorkflowStarted {
            task: task.to_string(),
            mode,
        }))
        .await
    }

    pub async fn workflow_state_changed(
        &self,
        from: RunStatus,
        to: RunStatus,
        reason: Option<String>,
    ) -> Result<ExecutionEvent> {
        self.record(self.event(EventBody::WorkflowStateChanged { from, to, reason }))
            .await
    }

    pub async fn cost_update(&self, total: &TokenUsage) -> Result<ExecutionEvent> {
        self.record(self.event(EventBody::CostUpdate {
            total_cost_usd: total.cost_usd,
            prompt_tokens: total.prompt_tokens,
            completion_tokens: total.completion_tokens,
        }))
        .await
    }

    pub async fn error_occurred(
        &self,
        node_id: Option<&str>,
        error: &FlowError,
    ) -> Result<ExecutionEvent> {
        let mut event = self
            .event(EventBody::ErrorOccurred {
                kind: error.kind_label().to_string(),
                message: error.to_string(),
            })
            .with_status("error")
            .with_error(error.to_string());
        if let Some(node_id) = node_id {
            event = event.with_node(node_id);
        }
        self.record(event).await
    }

    // ------------------------------------------------------------------
    // Node lifecycle hooks
    // ------------------------------------------------------------------

    pub async fn node_started(&self, node: &DagNode) -> Result<ExecutionEvent> {
        self.record(
            self.event(EventBody::NodeStarted {
                label: node.label.clone(),
                attempt: node.attempt,
            })
            .with_node(&node.node_id),
        )
        .await
    }

    pub async fn node_completed(&self, node: &DagNode) -> Result<ExecutionEvent> {
        let mut event = self
            .event(EventBody::NodeCompleted {
                label: node.label.clone(),
                status: node.status,
                error: node.error.clone(),
            })
            .with_node(&node.node_id)
            .with_status(if node.status == NodeStatus::Completed {
                "ok"
            } else {
                "error"
            });
        if let Some(error) = &node.error {
            event = event.with_error(error.clone());
        }
        self.record(event).await
    }

    // ------------------------------------------------------------------
    // Agent session hooks, in call order
    // ------------------------------------------------------------------

    /// Record the opening half of an agent call and push it onto the open
    /// stack; nested tool/code/file events will point back at it.
    pub async fn agent_call_start(
        &self,
        node_id: &str,
        agent: &str,
        content: &str,
    ) -> Result<ExecutionEvent> {
        let event = self
            .record(
                self.event(EventBody::AgentCall {
                    agent: agent.to_string(),
                    content: content.to_string(),
                })
                .with_node(node_id)
                .with_agent(agent)
                .with_subtype(EventSubtype::Start),
            )
            .await?;
        self.open(&event.id);
        Ok(event)
    }

    /// Record the closing half of an agent call, popping it from the open
    /// stack first so the complete event nests under the same parent as its
    /// start.
    #[allow(clippy::too_many_arguments)]
    pub async fn agent_call_complete(
        &self,
        start_event_id: &str,
        node_id: &str,
        agent: &str,
        content: &str,
        usage: &TokenUsage,
        duration_ms: i64,
        error: Option<&str>,
    ) -> Result<ExecutionEvent> {
        self.close(start_event_id);
        let mut event = self
            .event(EventBody::AgentCall {
                agent: agent.to_string(),
                content: content.to_string(),
            })
            .with_node(node_id)
            .with_agent(agent)
            .with_subtype(EventSubtype::Complete)
            .with_duration_ms(duration_ms)
            .with_cost(usage.cost_usd)
            .with_status(if error.is_none() { "ok" } else { "error" });
        if let Some(error) = error {
            event = event.with_error(error);
        }
        self.record(event).await
    }

    pub async fn tool_call(
        &self,
        node_id: &str,
        agent: &str,
        tool: &str,
        arguments: serde_json::Value,
        output: Option<serde_json::Value>,
    ) -> Result<ExecutionEvent> {
        self.record(
            self.event(EventBody::ToolCall {
                tool: tool.to_string(),
                arguments,
                output,
            })
            .with_node(node_id)
            .with_agent(agent)
            .with_subtype(EventSubtype::Execution)
            .with_status("ok"),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn code_exec(
        &self,
        node_id: &str,
        agent: &str,
        code: &str,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
        imports: Vec<String>,
        duration_ms: i64,
    ) -> Result<ExecutionEvent> {
        self.record(
            self.event(EventBody::CodeExec {
                code: code.to_string(),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code,
                imports,
            })
            .with_node(node_id)
            .with_agent(agent)
            .with_subtype(EventSubtype::Execution)
            .with_duration_ms(duration_ms)
            .with_status(if exit_code == 0 { "ok" } else { "error" }),
        )
        .await
    }

    pub async fn handoff(
        &self,
        node_id: &str,
        from_agent: &str,
        to_agent: &str,
        reason: Option<String>,
    ) -> Result<ExecutionEvent> {
        self.record(
            self.event(EventBody::Handoff {
                from_agent: from_agent.to_string(),
                to_agent: to_agent.to_string(),
                reason,
            })
            .with_node(node_id)
            .with_agent(from_agent),
        )
        .await
    }

    /// Record a discovered artifact. When `triggering_event_id` is set (the
    /// code or tool event that produced the file) it becomes the parent.
    pub async fn file_gen(
        &self,
        node_id: &str,
        agent: &str,
        artifact: FileArtifact,
        triggering_event_id: Option<&str>,
    ) -> Result<ExecutionEvent> {
        let mut event = self
            .event(EventBody::FileGen(artifact))
            .with_node(node_id)
            .with_agent(agent);
        if let Some(parent) = triggering_event_id {
            event = event.with_parent(parent);
        }
        self.record(event).await
    }

    // ------------------------------------------------------------------
    // Approval hooks
    // ------------------------------------------------------------------

    pub async fn approval_requested(
        &self,
        node_id: &str,
        approval_id: &str,
        description: &str,
        options: Vec<String>,
    ) -> Result<ExecutionEvent> {
        self.record(
            self.event(EventBody::ApprovalRequested {
                approval_id: approval_id.to_string(),
                description: description.to_string(),
                options,
            })
            .with_node(node_id),
        )
        .await
    }

    pub async fn approval_received(
        &self,
        node_id: &str,
        approval_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Result<ExecutionEvent> {
        self.record(
            self.event(EventBody::ApprovalReceived {
                approval_id: approval_id.to_string(),
                approved,
                feedback,
            })
            .with_node(node_id),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Retry hooks
    // ------------------------------------------------------------------

    pub async fn step_retry_started(
        &self,
        node_id: &str,
        attempt: u32,
        max_attempts: u32,
        error: &str,
        adaptive: bool,
    ) -> Result<ExecutionEvent> {
        self.record(
            self.event(EventBody::StepRetryStarted {
                attempt,
                max_attempts,
                error: error.to_string(),
                adaptive,
            })
            .with_node(node_id),
        )
        .await
    }

    pub async fn step_retry_backoff(
        &self,
        node_id: &str,
        attempt: u32,
        delay_ms: u64,
    ) -> Result<ExecutionEvent> {
        self.record(
            self.event(EventBody::StepRetryBackoff { attempt, delay_ms })
                .with_node(node_id),
        )
        .await
    }

    pub async fn step_retry_succeeded(
        &self,
        node_id: &str,
        attempt: u32,
    ) -> Result<ExecutionEvent> {
        self.record(
            self.event(EventBody::StepRetrySucceeded { attempt })
                .with_node(node_id),
        )
        .await
    }

    pub async fn step_retry_exhausted(
        &self,
        node_id: &str,
        attempt: u32,
        error: &str,
    ) -> Result<ExecutionEvent> {
        self.record(
            self.event(EventBody::StepRetryExhausted {
                attempt,
                error: error.to_string(),
            })
            .with_node(node_id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::model::{SessionRecord, WorkflowRun};
    use agentflow_store::EventFilter;

    async fn pipeline() -> (CapturePipeline, EventStore, WorkflowRun) {
        let store = EventStore::in_memory().await.unwrap();
        let session = SessionRecord::new("capture");
        store.create_session(&session).await.unwrap();
        let run = WorkflowRun::new(&session.id, "t", RunMode::OneShot);
        store.create_run(&run).await.unwrap();
        let broadcaster = Broadcaster::new(store.clone(), 16);
        let capture = CapturePipeline::new(
            store.clone(),
            broadcaster,
            &run.id,
            &run.session_id,
            RetryPolicy::none(),
        );
        (capture, store, run)
    }

    #[tokio::test]
    async fn nested_events_point_at_the_open_call() {
        let (capture, store, run) = pipeline().await;

        let start = capture
            .agent_call_start("n1", "coder", "write a file")
            .await
            .unwrap();
        let code = capture
            .code_exec("n1", "coder", "print('x')", "x\n", "", 0, vec![], 5)
            .await
            .unwrap();
        capture
            .agent_call_complete(
                &start.id,
                "n1",
                "coder",
                "done",
                &TokenUsage::default(),
                10,
                None,
            )
            .await
            .unwrap();

        assert_eq!(code.parent_event_id.as_deref(), Some(start.id.as_str()));

        let events = store
            .events_for_run(&run.id, &EventFilter::raw())
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
        // The complete event does not nest under its own start.
        assert!(events[2].parent_event_id.is_none());
    }

    #[tokio::test]
    async fn file_gen_prefers_explicit_trigger_parent() {
        let (capture, _store, _run) = pipeline().await;

        let code = capture
            .code_exec("n1", "coder", "open('a.txt','w')", "", "", 0, vec![], 2)
            .await
            .unwrap();
        let artifact = FileArtifact {
            path: "a.txt".into(),
            file_type: "text".into(),
            size_bytes: 0,
            content: None,
            truncated: false,
        };
        let file_event = capture
            .file_gen("n1", "coder", artifact, Some(&code.id))
            .await
            .unwrap();
        assert_eq!(file_event.parent_event_id.as_deref(), Some(code.id.as_str()));
    }

    #[tokio::test]
    async fn close_tolerates_out_of_order() {
        let (capture, _store, _run) = pipeline().await;
        capture.open("a");
        capture.open("b");
        capture.close("a");
        capture.close("a");
        capture.close("b");

        // Stack is empty again: the next event has no parent.
        let event = capture
            .record(capture.event(EventBody::Heartbeat))
            .await
            .unwrap();
        assert!(event.parent_event_id.is_none());
    }

    #[tokio::test]
    async fn execution_order_is_contiguous_across_hooks() {
        let (capture, store, run) = pipeline().await;
        capture.workflow_started("t", RunMode::OneShot).await.unwrap();
        capture
            .workflow_state_changed(RunStatus::Draft, RunStatus::Planning, None)
            .await
            .unwrap();
        capture
            .cost_update(&TokenUsage::new(10, 5, 0.001))
            .await
            .unwrap();

        let events = store
            .events_for_run(&run.id, &EventFilter::raw())
            .await
            .unwrap();
        let orders: Vec<i64> = events.iter().map(|e| e.execution_order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }
}

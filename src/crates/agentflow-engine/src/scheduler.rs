//! DAG scheduler
//!
//! Cooperative, event-driven execution of one run's DAG. The loop computes
//! the ready set, dispatches up to `max_workers` nodes into worker tasks,
//! then waits on whichever comes first: a worker finishing, a retry timer
//! elapsing, a control command (pause/resume/cancel/approval), or the cancel
//! latch. Workers communicate over typed channels; there is no shared
//! mutable state between a worker and the loop, and only the scheduler
//! mutates node status.
//!
//! Pause is cooperative: in-flight work drains and is recorded, but nothing
//! new dispatches. Cancel is a one-way latch: workers are asked to stop,
//! outcomes arriving within the grace period are recorded, the rest of the
//! graph is skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agentflow_core::config::EngineConfig;
use agentflow_core::dag::{DagNode, NodeStatus, NodeType, WorkflowDag};
use agentflow_core::error::{FlowError, Result};
use agentflow_core::lifecycle::RunStatus;
use agentflow_core::model::{TokenUsage, WorkflowRun};
use agentflow_core::retry::{classify, ErrorClass};
use agentflow_store::EventStore;

use crate::capture::CapturePipeline;
use crate::extract::FileScanLimits;
use crate::planner::{materialize_plan, parse_plan, Plan};
use crate::session::{AgentBackend, AgentPersona, AgentSession, CodeRunner};

/// Commands a supervisor can send into the running loop.
#[derive(Debug)]
pub enum ControlCommand {
    Pause,
    Resume,
    Cancel,
    Approval {
        approval_id: String,
        approved: bool,
        feedback: Option<String>,
    },
}

/// Messages from worker tasks and timers back into the loop.
#[derive(Debug)]
enum WorkerEvent {
    Finished {
        node_id: String,
        result: Result<NodeSuccess>,
    },
    RetryDue {
        node_id: String,
    },
    ApprovalTimeout {
        approval_id: String,
    },
}

/// Successful node outcome reported by a worker.
#[derive(Debug)]
struct NodeSuccess {
    summary: String,
    usage: TokenUsage,
    plan: Option<Plan>,
}

/// How the run ends, before it is written back as a `RunStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Everything a scheduler and its workers need, shared behind one `Arc`.
pub(crate) struct SchedulerDeps {
    pub store: EventStore,
    pub capture: CapturePipeline,
    pub backend: Arc<dyn AgentBackend>,
    pub runner: Arc<dyn CodeRunner>,
    pub config: Arc<EngineConfig>,
    pub run: WorkflowRun,
    pub status_tx: watch::Sender<RunStatus>,
}

pub(crate) struct Scheduler {
    deps: Arc<SchedulerDeps>,
    dag: WorkflowDag,
    status: RunStatus,
    paused: bool,
    control_rx: mpsc::Receiver<ControlCommand>,
    worker_tx: mpsc::Sender<WorkerEvent>,
    worker_rx: mpsc::Receiver<WorkerEvent>,
    cancel: CancellationToken,
    worker_cancel: CancellationToken,
    in_flight: usize,
    pending_retries: usize,
    /// approval_id -> node_id for open gates
    approvals: HashMap<String, String>,
    total_usage: TokenUsage,
}

impl Scheduler {
    pub(crate) fn new(
        deps: Arc<SchedulerDeps>,
        dag: WorkflowDag,
        initial_status: RunStatus,
        control_rx: mpsc::Receiver<ControlCommand>,
        cancel: CancellationToken,
    ) -> Self {
        let (worker_tx, worker_rx) = mpsc::channel(64);
        let paused = initial_status == RunStatus::Paused;
        Self {
            worker_cancel: cancel.child_token(),
            deps,
            dag,
            status: initial_status,
            paused,
            control_rx,
            worker_tx,
            worker_rx,
            cancel,
            in_flight: 0,
            pending_retries: 0,
            approvals: HashMap::new(),
            total_usage: TokenUsage::default(),
        }
    }

    /// Drive the run to a terminal state and return it.
    pub(crate) async fn run(mut self) -> RunStatus {
        let outcome = loop {
            match self.drive().await {
                Ok(outcome) => break outcome,
                Err(FlowError::StoreUnavailable(reason)) => {
                    // The capture pipeline already burned its backoff budget.
                    // Hold the run in a local pause and tell observers; an
                    // explicit resume retries, cancel ends it.
                    warn!(
                        run_id = %self.deps.run.id,
                        %reason,
                        "store unavailable past backoff budget, pausing run"
                    );
                    self.deps.capture.degraded_notice(&reason);
                    self.paused = true;
                }
                Err(e) => {
                    warn!(run_id = %self.deps.run.id, error = %e, "scheduler aborting run");
                    let _ = self.deps.capture.error_occurred(None, &e).await;
                    break RunOutcome::Failed;
                }
            }
        };
        self.finalize(outcome).await
    }

    async fn drive(&mut self) -> Result<RunOutcome> {
        let mut control_closed = false;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            if !self.paused && self.status == RunStatus::Executing {
                self.dispatch_ready().await?;
            }
            if let Some(outcome) = self.resting_outcome() {
                return Ok(outcome);
            }

            // Resolve the wake reason first, then act on it, so handler code
            // never overlaps the borrows held by the other select arms.
            enum Wake {
                Control(Option<ControlCommand>),
                Worker(WorkerEvent),
                Cancelled,
            }
            let wake = tokio::select! {
                command = self.control_rx.recv(), if !control_closed => Wake::Control(command),
                Some(event) = self.worker_rx.recv() => Wake::Worker(event),
                _ = self.cancel.cancelled() => Wake::Cancelled,
            };
            match wake {
                Wake::Control(Some(command)) => {
                    if let Some(outcome) = self.handle_control(command).await? {
                        return Ok(outcome);
                    }
                }
                Wake::Control(None) => {
                    // Supervisor handle dropped; keep driving workers.
                    control_closed = true;
                }
                Wake::Worker(event) => {
                    if let Some(outcome) = self.handle_worker(event).await? {
                        return Ok(outcome);
                    }
                }
                Wake::Cancelled => return Ok(RunOutcome::Cancelled),
            }
        }
    }

    /// Terminal decision when nothing is in flight, pending or awaited.
    fn resting_outcome(&self) -> Option<RunOutcome> {
        if self.paused
            || self.in_flight > 0
            || self.pending_retries > 0
            || !self.approvals.is_empty()
        {
            return None;
        }
        if self.dag.all_terminal() {
            return Some(if self.dag.any_failed() {
                RunOutcome::Failed
            } else {
                RunOutcome::Completed
            });
        }
        // Pending nodes exist but none are ready: their predecessors failed.
        if self.status == RunStatus::Executing && self.dag.ready_set().is_empty() {
            return Some(RunOutcome::Failed);
        }
        None
    }

    /// Dispatch ready nodes until the pool is saturated or nothing changes.
    /// Structural nodes complete inline, which can ready their successors,
    /// so the ready set is recomputed until a fixpoint.
    async fn dispatch_ready(&mut self) -> Result<()> {
        loop {
            let mut progressed = false;
            for node_id in self.dag.ready_set() {
                if self.paused
                    || self.cancel.is_cancelled()
                    || self.status != RunStatus::Executing
                {
                    return Ok(());
                }
                let Some(node_type) = self.dag.node(&node_id).map(|n| n.node_type) else {
                    continue;
                };
                match node_type {
                    NodeType::Approval => {
                        self.open_approval_gate(&node_id).await?;
                        progressed = true;
                    }
                    NodeType::Parallel | NodeType::Terminator => {
                        self.start_node(&node_id).await?;
                        self.complete_node(&node_id, String::new(), None).await?;
                        progressed = true;
                    }
                    _ => {
                        if self.in_flight >= self.deps.config.max_workers {
                            continue;
                        }
                        self.start_node(&node_id).await?;
                        self.spawn_worker(&node_id)?;
                    }
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn spawn_worker(&mut self, node_id: &str) -> Result<()> {
        let node = self
            .dag
            .node(node_id)
            .cloned()
            .ok_or_else(|| FlowError::not_found("node", node_id))?;
        let deps = self.deps.clone();
        let tx = self.worker_tx.clone();
        let stop = self.worker_cancel.child_token();
        self.in_flight += 1;
        tokio::spawn(async move {
            let node_id = node.node_id.clone();
            let result = tokio::select! {
                result = execute_node(&deps, &node) => result,
                _ = stop.cancelled() => Err(FlowError::transient("worker cancelled")),
            };
            let _ = tx.send(WorkerEvent::Finished { node_id, result }).await;
        });
        Ok(())
    }

    async fn handle_control(&mut self, command: ControlCommand) -> Result<Option<RunOutcome>> {
        match command {
            ControlCommand::Pause => {
                if self.status == RunStatus::Executing {
                    self.set_state(RunStatus::Executing, RunStatus::Paused, None)
                        .await?;
                    self.paused = true;
                    info!(run_id = %self.deps.run.id, "run paused");
                } else {
                    warn!(run_id = %self.deps.run.id, status = %self.status, "pause ignored");
                }
                Ok(None)
            }
            ControlCommand::Resume => {
                if self.status == RunStatus::Paused {
                    self.set_state(RunStatus::Paused, RunStatus::Executing, None)
                        .await?;
                    self.paused = false;
                    info!(run_id = %self.deps.run.id, "run resumed");
                } else {
                    warn!(run_id = %self.deps.run.id, status = %self.status, "resume ignored");
                }
                Ok(None)
            }
            ControlCommand::Cancel => Ok(Some(RunOutcome::Cancelled)),
            ControlCommand::Approval {
                approval_id,
                approved,
                feedback,
            } => self.resolve_approval(&approval_id, approved, feedback).await,
        }
    }

    async fn handle_worker(&mut self, event: WorkerEvent) -> Result<Option<RunOutcome>> {
        match event {
            WorkerEvent::Finished { node_id, result } => {
                self.in_flight -= 1;
                match result {
                    Ok(success) => {
                        if let Some(plan) = success.plan {
                            self.expand_plan(&node_id, plan).await?;
                        }
                        self.complete_node(&node_id, success.summary, Some(&success.usage))
                            .await?;
                        Ok(None)
                    }
                    Err(error) if self.cancel.is_cancelled() => {
                        self.fail_node(&node_id, &error).await?;
                        Ok(None)
                    }
                    Err(error) => self.handle_node_failure(&node_id, error).await,
                }
            }
            WorkerEvent::RetryDue { node_id } => {
                self.pending_retries = self.pending_retries.saturating_sub(1);
                if self
                    .dag
                    .node(&node_id)
                    .map(|n| n.status == NodeStatus::Retrying)
                    .unwrap_or(false)
                {
                    self.dag.set_status(&node_id, NodeStatus::Pending)?;
                    self.persist_node(&node_id).await?;
                }
                Ok(None)
            }
            WorkerEvent::ApprovalTimeout { approval_id } => {
                if self.approvals.contains_key(&approval_id) {
                    warn!(run_id = %self.deps.run.id, %approval_id, "approval timed out");
                    return self
                        .resolve_approval(
                            &approval_id,
                            false,
                            Some("approval timed out".to_string()),
                        )
                        .await;
                }
                Ok(None)
            }
        }
    }

    async fn handle_node_failure(
        &mut self,
        node_id: &str,
        error: FlowError,
    ) -> Result<Option<RunOutcome>> {
        let (attempt, node_type, adaptive_used) = {
            let node = self
                .dag
                .node(node_id)
                .ok_or_else(|| FlowError::not_found("node", node_id))?;
            (
                node.attempt,
                node.node_type,
                node.payload
                    .get("adaptive_used")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false),
            )
        };
        let policy = self.deps.config.retries.for_node_type(node_type);
        let class = classify(&error);
        debug!(
            run_id = %self.deps.run.id,
            node_id,
            attempt,
            classification = ?class,
            error = %error,
            "node failed"
        );

        match class {
            ErrorClass::Transient | ErrorClass::RateLimited if policy.should_retry(attempt) => {
                self.schedule_retry(node_id, &error, false).await?;
                Ok(None)
            }
            ErrorClass::Logic if !adaptive_used => {
                {
                    let node = self
                        .dag
                        .node_mut(node_id)
                        .ok_or_else(|| FlowError::not_found("node", node_id))?;
                    if !node.payload.is_object() {
                        node.payload = serde_json::json!({});
                    }
                    node.payload["adaptive_used"] = serde_json::Value::Bool(true);
                    node.payload["adaptive_error"] =
                        serde_json::Value::String(error.to_string());
                }
                self.schedule_retry(node_id, &error, true).await?;
                Ok(None)
            }
            ErrorClass::Transient | ErrorClass::RateLimited | ErrorClass::Logic => {
                self.deps
                    .capture
                    .step_retry_exhausted(node_id, attempt, &error.to_string())
                    .await?;
                self.fail_node(node_id, &error).await?;
                Ok(Some(RunOutcome::Failed))
            }
            ErrorClass::Fatal => {
                if attempt > 1 {
                    // Attempt history exists; close it out for consumers.
                    self.deps
                        .capture
                        .step_retry_exhausted(node_id, attempt, &error.to_string())
                        .await
                        .ok();
                }
                self.fail_node(node_id, &error).await?;
                Ok(Some(RunOutcome::Failed))
            }
        }
    }

    async fn schedule_retry(
        &mut self,
        node_id: &str,
        error: &FlowError,
        adaptive: bool,
    ) -> Result<()> {
        let (attempt, max_attempts, node_type) = {
            let node = self
                .dag
                .node(node_id)
                .ok_or_else(|| FlowError::not_found("node", node_id))?;
            (node.attempt, node.max_attempts, node.node_type)
        };
        let policy = self.deps.config.retries.for_node_type(node_type);
        let delay = policy.backoff_delay(attempt);

        self.deps
            .capture
            .step_retry_started(node_id, attempt, max_attempts, &error.to_string(), adaptive)
            .await?;
        self.deps
            .capture
            .step_retry_backoff(node_id, attempt, delay.as_millis() as u64)
            .await?;

        self.dag.set_status(node_id, NodeStatus::Retrying)?;
        self.persist_node(node_id).await?;

        self.pending_retries += 1;
        let tx = self.worker_tx.clone();
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(WorkerEvent::RetryDue { node_id }).await;
        });
        Ok(())
    }

    async fn open_approval_gate(&mut self, node_id: &str) -> Result<()> {
        let approval_id = Uuid::new_v4().to_string();
        self.dag.set_status(node_id, NodeStatus::WaitingApproval)?;
        self.persist_node(node_id).await?;

        let description = self
            .dag
            .node(node_id)
            .and_then(|n| n.goal.clone())
            .unwrap_or_else(|| format!("approve step {node_id}"));
        self.deps
            .capture
            .approval_requested(
                node_id,
                &approval_id,
                &description,
                vec!["approve".to_string(), "reject".to_string()],
            )
            .await?;
        self.approvals
            .insert(approval_id.clone(), node_id.to_string());

        if self.status == RunStatus::Executing {
            self.set_state(RunStatus::Executing, RunStatus::WaitingApproval, None)
                .await?;
        }

        let tx = self.worker_tx.clone();
        let timeout = self.deps.config.approval_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(WorkerEvent::ApprovalTimeout { approval_id }).await;
        });
        Ok(())
    }

    async fn resolve_approval(
        &mut self,
        approval_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Result<Option<RunOutcome>> {
        let Some(node_id) = self.approvals.remove(approval_id) else {
            warn!(run_id = %self.deps.run.id, approval_id, "unknown or already resolved approval");
            return Ok(None);
        };
        self.deps
            .capture
            .approval_received(&node_id, approval_id, approved, feedback.clone())
            .await?;

        if self.approvals.is_empty() && self.status == RunStatus::WaitingApproval {
            self.set_state(RunStatus::WaitingApproval, RunStatus::Executing, None)
                .await?;
        }

        if approved {
            self.complete_node(&node_id, "approved".to_string(), None)
                .await?;
            Ok(None)
        } else {
            let error = FlowError::UserRejected(
                feedback.unwrap_or_else(|| "approval rejected".to_string()),
            );
            self.fail_node(&node_id, &error).await?;
            Ok(Some(RunOutcome::Failed))
        }
    }

    async fn expand_plan(&mut self, planning_node_id: &str, plan: Plan) -> Result<()> {
        let (nodes, edges) = materialize_plan(
            &self.deps.run.id,
            planning_node_id,
            &plan,
            self.deps.run.agent.as_deref(),
            &self.deps.config.retries,
        );
        info!(
            run_id = %self.deps.run.id,
            steps = nodes.len(),
            "expanding DAG from plan"
        );
        for node in nodes {
            self.deps.store.upsert_node(&node).await?;
            self.dag.add_node(node);
        }
        for edge in edges {
            self.dag.add_edge(&edge.source, &edge.target)?;
            self.deps
                .store
                .upsert_edge(&self.deps.run.id, &edge.source, &edge.target)
                .await?;
        }
        if let Some(node) = self.dag.node_mut(planning_node_id) {
            node.payload = serde_json::json!({ "plan": plan.to_value() });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Node bookkeeping
    // ------------------------------------------------------------------

    async fn start_node(&mut self, node_id: &str) -> Result<()> {
        {
            let node = self
                .dag
                .node_mut(node_id)
                .ok_or_else(|| FlowError::not_found("node", node_id))?;
            node.attempt += 1;
            node.error = None;
        }
        self.dag.set_status(node_id, NodeStatus::Running)?;
        self.persist_node(node_id).await?;
        let node = self.node_snapshot(node_id)?;
        self.deps.capture.node_started(&node).await?;
        Ok(())
    }

    async fn complete_node(
        &mut self,
        node_id: &str,
        summary: String,
        usage: Option<&TokenUsage>,
    ) -> Result<()> {
        let attempt = self.dag.node(node_id).map(|n| n.attempt).unwrap_or(0);
        if attempt > 1 {
            self.deps
                .capture
                .step_retry_succeeded(node_id, attempt)
                .await?;
        }
        if let Some(node) = self.dag.node_mut(node_id) {
            if !summary.is_empty() {
                node.summary = Some(summary);
            }
        }
        self.dag.set_status(node_id, NodeStatus::Completed)?;
        self.persist_node(node_id).await?;
        let node = self.node_snapshot(node_id)?;
        self.deps.capture.node_completed(&node).await?;

        if let Some(usage) = usage {
            self.add_usage(usage).await?;
        }
        Ok(())
    }

    async fn fail_node(&mut self, node_id: &str, error: &FlowError) -> Result<()> {
        if let Some(node) = self.dag.node_mut(node_id) {
            node.error = Some(error.to_string());
        }
        self.dag.set_status(node_id, NodeStatus::Failed)?;
        self.persist_node(node_id).await?;
        let node = self.node_snapshot(node_id)?;
        self.deps
            .capture
            .error_occurred(Some(node_id), error)
            .await?;
        self.deps.capture.node_completed(&node).await?;
        Ok(())
    }

    fn node_snapshot(&self, node_id: &str) -> Result<DagNode> {
        self.dag
            .node(node_id)
            .cloned()
            .ok_or_else(|| FlowError::not_found("node", node_id))
    }

    async fn persist_node(&self, node_id: &str) -> Result<()> {
        let node = self.node_snapshot(node_id)?;
        self.deps.store.upsert_node(&node).await
    }

    async fn add_usage(&mut self, usage: &TokenUsage) -> Result<()> {
        if usage.is_empty() {
            return Ok(());
        }
        self.total_usage.add(usage);
        self.deps
            .store
            .add_run_cost(&self.deps.run.id, usage)
            .await?;
        self.deps.capture.cost_update(&self.total_usage).await?;
        Ok(())
    }

    async fn set_state(
        &mut self,
        from: RunStatus,
        to: RunStatus,
        reason: Option<String>,
    ) -> Result<()> {
        self.deps
            .store
            .update_run_state(&self.deps.run.id, from, to)
            .await?;
        self.deps
            .capture
            .workflow_state_changed(from, to, reason)
            .await?;
        self.status = to;
        let _ = self.deps.status_tx.send(to);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Wind the run down: stop workers, record what arrives within the grace
    /// period, skip everything unreached, and write the terminal state.
    async fn finalize(mut self, outcome: RunOutcome) -> RunStatus {
        self.worker_cancel.cancel();
        self.deps.backend.abort().await;

        let deadline = Instant::now() + self.deps.config.cancel_grace;
        while self.in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(run_id = %self.deps.run.id, in_flight = self.in_flight,
                      "grace period elapsed with workers still in flight");
                break;
            }
            match tokio::time::timeout(remaining, self.worker_rx.recv()).await {
                Ok(Some(WorkerEvent::Finished { node_id, result })) => {
                    self.in_flight -= 1;
                    let recorded = match result {
                        Ok(success) => {
                            self.complete_node(&node_id, success.summary, Some(&success.usage))
                                .await
                        }
                        Err(error) => self.fail_node(&node_id, &error).await,
                    };
                    if let Err(e) = recorded {
                        warn!(run_id = %self.deps.run.id, %node_id, error = %e,
                              "failed to record outcome during wind-down");
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        // Everything unreached is skipped, never deleted.
        let leftovers: Vec<String> = self
            .dag
            .nodes()
            .filter(|node| !node.is_terminal())
            .map(|node| node.node_id.clone())
            .collect();
        for node_id in leftovers {
            if self.dag.set_status(&node_id, NodeStatus::Skipped).is_ok() {
                if let Err(e) = self.persist_node(&node_id).await {
                    warn!(run_id = %self.deps.run.id, %node_id, error = %e,
                          "failed to persist skipped node");
                }
            }
        }

        let to = match outcome {
            RunOutcome::Completed => RunStatus::Completed,
            RunOutcome::Failed => RunStatus::Failed,
            RunOutcome::Cancelled => RunStatus::Cancelled,
        };
        if let Err(e) = self.transition_to_terminal(to).await {
            warn!(run_id = %self.deps.run.id, error = %e, "failed to record terminal state");
        }
        info!(run_id = %self.deps.run.id, status = %to, "run finished");
        to
    }

    async fn transition_to_terminal(&mut self, to: RunStatus) -> Result<()> {
        let from = self.status;
        if from == to {
            return Ok(());
        }
        // Cancel has direct edges from paused and waiting_approval; completed
        // and failed must route through executing.
        if to == RunStatus::Cancelled
            && matches!(from, RunStatus::Paused | RunStatus::WaitingApproval)
        {
            return self.set_state(from, to, None).await;
        }
        if from != RunStatus::Executing {
            self.set_state(from, RunStatus::Executing, None).await?;
        }
        self.set_state(RunStatus::Executing, to, None).await
    }
}

/// System prompt for the planner persona. Prompt engineering proper lives
/// outside the engine; this is the minimal contract the parser relies on.
const PLANNER_PROMPT: &str = "You are a planning agent. Decompose the task into a short ordered \
list of steps and respond with JSON of the shape {\"steps\": [{\"title\": ..., \"goal\": ..., \
\"agent\": ..., \"depends_on\": [..], \"approval\": false}]}. Respond with JSON only.";

const WORKER_PROMPT: &str = "You are a capable worker agent. Complete the goal you are given, \
using code execution when it helps, and report the outcome concisely.";

/// Execute one node in a worker task. Reports the outcome; the scheduler
/// decides the node transition.
async fn execute_node(deps: &Arc<SchedulerDeps>, node: &DagNode) -> Result<NodeSuccess> {
    let config = &deps.config;
    let workdir = config.run_workdir(&deps.run.id);
    if let Err(e) = std::fs::create_dir_all(&workdir) {
        return Err(FlowError::transient(format!(
            "cannot create run workdir {}: {e}",
            workdir.display()
        )));
    }
    let limits = FileScanLimits {
        capture_max_bytes: config.file_capture_max_bytes,
        embed_max_bytes: config.file_embed_max_bytes,
    };

    match node.node_type {
        NodeType::Planning => {
            let mut persona = AgentPersona::new("planner", PLANNER_PROMPT);
            if let Some(model) = &deps.run.model {
                persona = persona.with_model(model.clone());
            }
            let mut session = AgentSession::start(
                persona,
                deps.backend.clone(),
                deps.runner.clone(),
                deps.capture.scoped(),
                &node.node_id,
                workdir,
                config.call_timeout,
                limits,
            );
            let mut input = format!("Task: {}", deps.run.task);
            if let Some(previous_error) =
                node.payload.get("adaptive_error").and_then(|v| v.as_str())
            {
                input = format!(
                    "{input}\n\nThe previous planning attempt failed with:\n{previous_error}\n\
                     Produce a corrected plan."
                );
            }
            let step = session.step(&input).await?;
            let plan = parse_plan(&step.content)?;
            Ok(NodeSuccess {
                summary: format!("planned {} steps", plan.steps.len()),
                usage: step.usage,
                plan: Some(plan),
            })
        }
        NodeType::Agent | NodeType::Control => {
            let name = node
                .agent
                .clone()
                .or_else(|| deps.run.agent.clone())
                .unwrap_or_else(|| "generalist".to_string());
            let mut persona = AgentPersona::new(&name, WORKER_PROMPT);
            if let Some(model) = &deps.run.model {
                persona = persona.with_model(model.clone());
            }
            let mut session = AgentSession::start(
                persona,
                deps.backend.clone(),
                deps.runner.clone(),
                deps.capture.scoped(),
                &node.node_id,
                workdir,
                config.call_timeout,
                limits,
            );
            let mut input = node
                .goal
                .clone()
                .unwrap_or_else(|| deps.run.task.clone());
            if let Some(previous_error) =
                node.payload.get("adaptive_error").and_then(|v| v.as_str())
            {
                input = format!(
                    "{input}\n\nThe previous attempt failed with:\n{previous_error}\n\
                     Correct the problem and try again."
                );
            }
            let step = session.step(&input).await?;
            Ok(NodeSuccess {
                summary: step.content,
                usage: step.usage,
                plan: None,
            })
        }
        // Structural nodes never reach a worker.
        NodeType::Approval | NodeType::Parallel | NodeType::Terminator => Ok(NodeSuccess {
            summary: String::new(),
            usage: TokenUsage::default(),
            plan: None,
        }),
    }
}

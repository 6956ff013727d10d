//! Session & run registry
//!
//! Process-wide mapping from run identifiers to live supervisors, plus the
//! transport-agnostic command surface. The registry guarantees at most one
//! live supervisor per run and rehydrates missing supervisors for
//! non-terminal runs on demand. It is constructed explicitly with its
//! collaborators and torn down explicitly; there are no singletons.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use agentflow_core::config::EngineConfig;
use agentflow_core::dag::{DagNode, NodeStatus, WorkflowDag};
use agentflow_core::error::{FlowError, Result};
use agentflow_core::event::{EventType, ExecutionEvent};
use agentflow_core::lifecycle::RunStatus;
use agentflow_core::model::{BranchRecord, RunMode, SessionRecord, WorkflowRun};
use agentflow_store::{EventFilter, EventStore, FileRecord, Page};

use crate::broadcast::{Broadcaster, Subscription};
use crate::capture::CapturePipeline;
use crate::session::{AgentBackend, CodeRunner};
use crate::supervisor::{EngineDeps, LaunchMode, RunSupervisor};

/// The engine facade: registry plus command surface.
pub struct WorkflowEngine {
    deps: EngineDeps,
    live: DashMap<String, Arc<RunSupervisor>>,
    /// Serializes supervisor creation per run id
    launch_locks: DashMap<String, Arc<Mutex<()>>>,
    heartbeat_task: tokio::task::JoinHandle<()>,
}

impl WorkflowEngine {
    pub fn new(
        store: EventStore,
        backend: Arc<dyn AgentBackend>,
        runner: Arc<dyn CodeRunner>,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(config);
        let broadcaster = Broadcaster::new(store.clone(), config.subscriber_queue_capacity);
        let heartbeat_task = broadcaster.spawn_heartbeat(config.broadcast_heartbeat_interval);
        Self {
            deps: EngineDeps {
                store,
                broadcaster,
                backend,
                runner,
                config,
            },
            live: DashMap::new(),
            launch_locks: DashMap::new(),
            heartbeat_task,
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.deps.store
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn create_session(&self, name: &str) -> Result<SessionRecord> {
        let session = SessionRecord::new(name);
        self.deps.store.create_session(&session).await?;
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionRecord> {
        self.deps.store.get_session(session_id).await
    }

    pub async fn list_sessions(&self, page: &Page) -> Result<Vec<SessionRecord>> {
        self.deps.store.list_sessions(page).await
    }

    /// Delete a session. Live supervisors for its runs are cancelled first;
    /// persisted runs cascade with the session row.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let doomed: Vec<Arc<RunSupervisor>> = self
            .live
            .iter()
            .filter(|entry| entry.value().session_id() == session_id)
            .map(|entry| entry.value().clone())
            .collect();
        for supervisor in doomed {
            let _ = supervisor.cancel().await;
            self.live.remove(supervisor.run_id());
        }
        self.deps.store.delete_session(session_id).await
    }

    // ------------------------------------------------------------------
    // Run lifecycle commands
    // ------------------------------------------------------------------

    /// Create and start a run. Returns its identifier.
    pub async fn start_run(
        &self,
        session_id: &str,
        task: &str,
        mode: RunMode,
        agent: Option<String>,
        model: Option<String>,
        run_config: Value,
    ) -> Result<String> {
        let mut run = WorkflowRun::new(session_id, task, mode).with_config(run_config);
        run.agent = agent;
        run.model = model;
        self.deps.store.create_run(&run).await?;

        let supervisor = RunSupervisor::launch(&self.deps, run.clone(), LaunchMode::Fresh).await?;
        self.live.insert(run.id.clone(), supervisor);
        info!(run_id = %run.id, session_id, mode = mode.as_str(), "run started");
        Ok(run.id)
    }

    /// Fetch the live supervisor for a run, rehydrating one from persisted
    /// state when the run is alive but unsupervised (process restart,
    /// registry eviction). At most one supervisor exists per run.
    async fn ensure_live(&self, run_id: &str) -> Result<Arc<RunSupervisor>> {
        if let Some(existing) = self.live.get(run_id) {
            if !existing.value().is_terminal() {
                return Ok(existing.value().clone());
            }
        }

        let lock = self
            .launch_locks
            .entry(run_id.to_string())
            .or_default()
            .value()
            .clone();
        let _guard = lock.lock().await;

        // Re-check under the lock; a racer may have launched already.
        if let Some(existing) = self.live.get(run_id) {
            if !existing.value().is_terminal() {
                return Ok(existing.value().clone());
            }
            self.live.remove(run_id);
        }

        let run = self.deps.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(FlowError::fatal(format!(
                "run {run_id} is {} and cannot be controlled",
                run.status
            )));
        }
        let supervisor = RunSupervisor::launch(&self.deps, run, LaunchMode::Rehydrate).await?;
        self.live.insert(run_id.to_string(), supervisor.clone());
        info!(run_id, "supervisor rehydrated");
        Ok(supervisor)
    }

    pub async fn pause_run(&self, run_id: &str) -> Result<()> {
        let run = self.deps.store.get_run(run_id).await?;
        if run.status != RunStatus::Executing {
            return Err(FlowError::IllegalTransition {
                from: run.status,
                to: RunStatus::Paused,
            });
        }
        self.ensure_live(run_id).await?.pause().await
    }

    pub async fn resume_run(&self, run_id: &str) -> Result<()> {
        let run = self.deps.store.get_run(run_id).await?;
        if run.status != RunStatus::Paused {
            return Err(FlowError::IllegalTransition {
                from: run.status,
                to: RunStatus::Executing,
            });
        }
        self.ensure_live(run_id).await?.resume().await
    }

    /// Cancel a run. Idempotent: cancelling a terminal run is a no-op.
    pub async fn cancel_run(&self, run_id: &str) -> Result<()> {
        let run = self.deps.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        self.ensure_live(run_id).await?.cancel().await
    }

    pub async fn respond_to_approval(
        &self,
        run_id: &str,
        approval_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Result<()> {
        self.ensure_live(run_id)
            .await?
            .respond_approval(approval_id, approved, feedback)
            .await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_run(&self, run_id: &str) -> Result<WorkflowRun> {
        self.deps.store.get_run(run_id).await
    }

    /// Block until the run reaches a terminal state, through the live
    /// supervisor when one exists, polling the store otherwise.
    pub async fn wait_terminal(
        &self,
        run_id: &str,
        timeout: std::time::Duration,
    ) -> Result<RunStatus> {
        if let Some(supervisor) = self.live.get(run_id).map(|entry| entry.value().clone()) {
            return supervisor.wait_terminal(timeout).await;
        }
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let status = self.deps.store.get_run(run_id).await?.status;
            if status.is_terminal() {
                return Ok(status);
            }
            if std::time::Instant::now() >= deadline {
                return Err(FlowError::transient("timed out waiting for terminal state"));
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }

    pub async fn list_runs(
        &self,
        session_id: &str,
        status: Option<RunStatus>,
        page: &Page,
    ) -> Result<Vec<WorkflowRun>> {
        self.deps.store.list_runs(session_id, status, page).await
    }

    /// Event history for a run. The default view applies the display filter;
    /// pass `include_internal` for the raw stream.
    pub async fn history(
        &self,
        run_id: &str,
        event_type: Option<EventType>,
        include_internal: bool,
    ) -> Result<Vec<ExecutionEvent>> {
        let mut filter = EventFilter {
            include_internal,
            ..Default::default()
        };
        filter.event_type = event_type;
        self.deps.store.events_for_run(run_id, &filter).await
    }

    pub async fn files(&self, run_id: &str) -> Result<Vec<FileRecord>> {
        self.deps.store.files_for_run(run_id).await
    }

    pub async fn branches_of(&self, run_id: &str) -> Result<Vec<BranchRecord>> {
        self.deps.store.branches_of(run_id).await
    }

    /// Subscribe to a run's live event stream, optionally replaying from the
    /// last observed execution order.
    pub async fn subscribe(&self, run_id: &str, since: Option<i64>) -> Result<Subscription> {
        // Validate the run exists so a typo does not subscribe to silence.
        self.deps.store.get_run(run_id).await?;
        self.deps.broadcaster.subscribe(run_id, since).await
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.deps
            .broadcaster
            .unsubscribe(&subscription.run_id, &subscription.id);
    }

    // ------------------------------------------------------------------
    // Play-from-node & branches
    // ------------------------------------------------------------------

    /// Nodes eligible as play-from-node pivots: completed or failed.
    pub async fn list_resumable_nodes(&self, run_id: &str) -> Result<Vec<DagNode>> {
        Ok(self
            .deps
            .store
            .nodes_for_run(run_id)
            .await?
            .into_iter()
            .filter(|node| {
                matches!(node.status, NodeStatus::Completed | NodeStatus::Failed)
            })
            .collect())
    }

    /// Fork a new run that reuses `run_id`'s history up to and including
    /// `node_id`, then executes everything downstream afresh. The original
    /// run is never mutated.
    pub async fn play_from_node(
        &self,
        run_id: &str,
        node_id: &str,
        create_branch: bool,
        hypothesis: Option<String>,
    ) -> Result<String> {
        let parent = self.deps.store.get_run(run_id).await?;
        let pivot = self.deps.store.get_node(run_id, node_id).await?;
        if !pivot.status.is_terminal() {
            return Err(FlowError::fatal(format!(
                "play-from-node pivot {node_id} is {}, not terminal or skipped",
                pivot.status
            )));
        }

        let mut fork = WorkflowRun::new(&parent.session_id, &parent.task, parent.mode)
            .with_config(parent.config.clone());
        fork.agent = parent.agent.clone();
        fork.model = parent.model.clone();
        self.deps.store.create_run(&fork).await?;

        // Clone the DAG; downstream of the pivot resets to pending.
        let nodes = self.deps.store.nodes_for_run(run_id).await?;
        let edges = self.deps.store.edges_for_run(run_id).await?;
        let parent_dag = WorkflowDag::from_parts(run_id, nodes.clone(), edges.clone())?;
        let downstream = parent_dag.downstream_of(node_id);

        for mut node in nodes {
            node.run_id = fork.id.clone();
            if downstream.contains(&node.node_id) {
                node.status = NodeStatus::Pending;
                node.attempt = 0;
                node.error = None;
                node.summary = None;
                node.started_at = None;
                node.completed_at = None;
                if let Some(payload) = node.payload.as_object_mut() {
                    payload.remove("adaptive_used");
                    payload.remove("adaptive_error");
                }
            }
            self.deps.store.upsert_node(&node).await?;
        }
        for edge in &edges {
            self.deps
                .store
                .upsert_edge(&fork.id, &edge.source, &edge.target)
                .await?;
        }

        // Copy the event prefix up to and including the pivot's last event,
        // remapping ids so parent links stay inside the fork.
        let events = self
            .deps
            .store
            .events_for_run(run_id, &EventFilter::raw())
            .await?;
        let cutoff = events
            .iter()
            .filter(|event| event.node_id.as_deref() == Some(node_id))
            .map(|event| event.execution_order)
            .max()
            .unwrap_or(0);

        let mut id_map = std::collections::HashMap::new();
        for event in events
            .into_iter()
            .filter(|event| event.execution_order <= cutoff)
        {
            let mut copy = event;
            let new_id = Uuid::new_v4().to_string();
            id_map.insert(copy.id.clone(), new_id.clone());
            copy.id = new_id;
            copy.run_id = fork.id.clone();
            copy.parent_event_id = copy
                .parent_event_id
                .take()
                .and_then(|parent| id_map.get(&parent).cloned());
            copy.execution_order = 0;
            self.deps.store.append_event(&mut copy).await?;
        }

        if create_branch {
            let parent_branch = self.deps.store.branch_for_run(run_id).await?;
            let mut branch = BranchRecord::new(&fork.id, run_id, node_id);
            if let Some(hypothesis) = hypothesis {
                branch = branch.with_hypothesis(hypothesis);
            }
            if let Some(parent_branch) = parent_branch {
                branch = branch.with_parent_branch(parent_branch.id);
            }
            self.deps.store.create_branch(&branch).await?;
        }

        let fork_run = self.deps.store.get_run(&fork.id).await?;
        let supervisor =
            RunSupervisor::launch(&self.deps, fork_run, LaunchMode::Rehydrate).await?;
        self.live.insert(fork.id.clone(), supervisor);
        info!(parent_run = run_id, fork_run = %fork.id, pivot = node_id, "play-from-node fork started");
        Ok(fork.id)
    }

    // ------------------------------------------------------------------
    // Watchdog & teardown
    // ------------------------------------------------------------------

    /// Mark runs whose heartbeat went silent as failed. Paused runs are
    /// exempt: pause is user intent and holds indefinitely. Returns the run
    /// ids that were failed.
    pub async fn watchdog_scan(&self) -> Result<Vec<String>> {
        let window = self.deps.config.heartbeat_interval
            * self.deps.config.missed_heartbeats_allowed.max(1);
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let stalled = self.deps.store.stalled_runs(cutoff).await?;
        let mut failed = Vec::new();
        for run in stalled {
            warn!(run_id = %run.id, status = %run.status, "watchdog: run stalled");
            if let Some((_, supervisor)) = self.live.remove(&run.id) {
                let _ = supervisor.cancel().await;
            }
            let capture = CapturePipeline::new(
                self.deps.store.clone(),
                self.deps.broadcaster.clone(),
                &run.id,
                &run.session_id,
                self.deps.config.store_retry.clone(),
            );
            let error = FlowError::transient("heartbeat lost, run declared stalled");
            let _ = capture.error_occurred(None, &error).await;

            let result = self.force_fail(&capture, &run).await;
            match result {
                Ok(()) => failed.push(run.id),
                Err(e) => warn!(run_id = %run.id, error = %e, "watchdog could not fail run"),
            }
        }
        Ok(failed)
    }

    /// Walk a stalled run to `failed` through legal transitions only.
    async fn force_fail(&self, capture: &CapturePipeline, run: &WorkflowRun) -> Result<()> {
        let mut from = run.status;
        if from == RunStatus::WaitingApproval {
            self.deps
                .store
                .update_run_state(&run.id, from, RunStatus::Executing)
                .await?;
            capture
                .workflow_state_changed(from, RunStatus::Executing, None)
                .await?;
            from = RunStatus::Executing;
        }
        self.deps
            .store
            .update_run_state(&run.id, from, RunStatus::Failed)
            .await?;
        capture
            .workflow_state_changed(from, RunStatus::Failed, Some("heartbeat lost".into()))
            .await?;
        Ok(())
    }

    /// Cancel everything live and stop background tasks.
    pub async fn shutdown(&self) {
        let supervisors: Vec<Arc<RunSupervisor>> = self
            .live
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for supervisor in supervisors {
            let _ = supervisor.cancel().await;
        }
        self.live.clear();
        self.heartbeat_task.abort();
        info!("engine shut down");
    }
}

impl Drop for WorkflowEngine {
    fn drop(&mut self) {
        self.heartbeat_task.abort();
    }
}

//! Run supervisor
//!
//! One supervisor per live run. It seeds or rehydrates the DAG, owns the
//! scheduler task and the heartbeat task, and exposes the control handles
//! (pause/resume/cancel/approval) the registry routes commands through.
//!
//! Supervisors receive their collaborators (store, broadcaster, backends,
//! config) by injection; nothing here reaches into process-wide state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentflow_core::config::EngineConfig;
use agentflow_core::dag::{DagNode, NodeStatus, NodeType, WorkflowDag};
use agentflow_core::error::{FlowError, Result};
use agentflow_core::lifecycle::RunStatus;
use agentflow_core::model::{RunMode, WorkflowRun};
use agentflow_store::EventStore;

use crate::broadcast::Broadcaster;
use crate::capture::CapturePipeline;
use crate::scheduler::{ControlCommand, Scheduler, SchedulerDeps};
use crate::session::{AgentBackend, CodeRunner};

/// Dependency bundle the registry hands to every supervisor.
#[derive(Clone)]
pub(crate) struct EngineDeps {
    pub store: EventStore,
    pub broadcaster: Broadcaster,
    pub backend: Arc<dyn AgentBackend>,
    pub runner: Arc<dyn CodeRunner>,
    pub config: Arc<EngineConfig>,
}

/// How a supervisor comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LaunchMode {
    /// Brand new run: emit `workflow_started`, seed the DAG per mode
    Fresh,
    /// Existing run (restart, registry rehydration, play-from-node fork):
    /// the DAG and event prefix are already persisted
    Rehydrate,
}

/// Live handle for one run.
pub struct RunSupervisor {
    run_id: String,
    session_id: String,
    control_tx: mpsc::Sender<ControlCommand>,
    cancel: CancellationToken,
    status_rx: watch::Receiver<RunStatus>,
}

impl RunSupervisor {
    pub(crate) async fn launch(
        deps: &EngineDeps,
        run: WorkflowRun,
        mode: LaunchMode,
    ) -> Result<Arc<RunSupervisor>> {
        if run.status.is_terminal() {
            return Err(FlowError::fatal(format!(
                "cannot supervise terminal run {}",
                run.id
            )));
        }
        let capture = CapturePipeline::new(
            deps.store.clone(),
            deps.broadcaster.clone(),
            &run.id,
            &run.session_id,
            deps.config.store_retry.clone(),
        );

        let (dag, initial_status) = match mode {
            LaunchMode::Fresh => {
                capture.workflow_started(&run.task, run.mode).await?;
                Self::step_state(deps, &capture, &run.id, RunStatus::Draft, RunStatus::Planning)
                    .await?;
                let dag = Self::seed_dag(deps, &run).await?;
                Self::step_state(
                    deps,
                    &capture,
                    &run.id,
                    RunStatus::Planning,
                    RunStatus::Executing,
                )
                .await?;
                (dag, RunStatus::Executing)
            }
            LaunchMode::Rehydrate => Self::rehydrate(deps, &capture, &run).await?,
        };

        let run = deps.store.get_run(&run.id).await?;
        let (control_tx, control_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(initial_status);
        let cancel = CancellationToken::new();

        let scheduler_deps = Arc::new(SchedulerDeps {
            store: deps.store.clone(),
            capture,
            backend: deps.backend.clone(),
            runner: deps.runner.clone(),
            config: deps.config.clone(),
            run: run.clone(),
            status_tx,
        });

        let supervisor = Arc::new(RunSupervisor {
            run_id: run.id.clone(),
            session_id: run.session_id.clone(),
            control_tx,
            cancel: cancel.clone(),
            status_rx: status_rx.clone(),
        });

        Self::spawn_heartbeat(deps, &run.id, status_rx.clone());

        let scheduler = Scheduler::new(scheduler_deps, dag, initial_status, control_rx, cancel);
        tokio::spawn(async move {
            scheduler.run().await;
        });
        info!(run_id = %run.id, mode = ?mode, "supervisor launched");
        Ok(supervisor)
    }

    /// Seed the initial DAG for a fresh run.
    async fn seed_dag(deps: &EngineDeps, run: &WorkflowRun) -> Result<WorkflowDag> {
        let mut dag = WorkflowDag::new(&run.id);
        let node = match run.mode {
            RunMode::PlanningControl => DagNode::new("plan", &run.id, "plan", NodeType::Planning)
                .with_goal(run.task.clone())
                .with_max_attempts(
                    deps.config
                        .retries
                        .for_node_type(NodeType::Planning)
                        .max_attempts,
                ),
            _ => {
                let mut node = DagNode::new("step_1", &run.id, "step_1", NodeType::Agent)
                    .with_step_index(1)
                    .with_goal(run.task.clone())
                    .with_max_attempts(
                        deps.config
                            .retries
                            .for_node_type(NodeType::Agent)
                            .max_attempts,
                    );
                node.agent = run.agent.clone();
                node
            }
        };
        deps.store.upsert_node(&node).await?;
        dag.add_node(node);
        Ok(dag)
    }

    /// Rebuild state for an existing run. In-flight nodes are demoted to
    /// pending (their events survive); a run found waiting on approvals goes
    /// back to executing so the gates re-open on dispatch.
    async fn rehydrate(
        deps: &EngineDeps,
        capture: &CapturePipeline,
        run: &WorkflowRun,
    ) -> Result<(WorkflowDag, RunStatus)> {
        let mut status = run.status;

        if status == RunStatus::Draft {
            Self::step_state(deps, capture, &run.id, RunStatus::Draft, RunStatus::Planning)
                .await?;
            status = RunStatus::Planning;
        }

        let mut dag = deps.store.load_dag(&run.id).await?;
        if dag.is_empty() {
            dag = Self::seed_dag(deps, run).await?;
        }

        let demote: Vec<String> = dag
            .nodes()
            .filter(|node| {
                matches!(
                    node.status,
                    NodeStatus::Running
                        | NodeStatus::Retrying
                        | NodeStatus::WaitingApproval
                        | NodeStatus::Paused
                )
            })
            .map(|node| node.node_id.clone())
            .collect();
        for node_id in &demote {
            dag.set_status(node_id, NodeStatus::Pending)?;
            if let Some(node) = dag.node(node_id) {
                deps.store.upsert_node(node).await?;
            }
        }
        if !demote.is_empty() {
            debug!(run_id = %run.id, count = demote.len(), "demoted in-flight nodes to pending");
        }

        match status {
            RunStatus::Planning => {
                Self::step_state(
                    deps,
                    capture,
                    &run.id,
                    RunStatus::Planning,
                    RunStatus::Executing,
                )
                .await?;
                Ok((dag, RunStatus::Executing))
            }
            RunStatus::WaitingApproval => {
                Self::step_state(
                    deps,
                    capture,
                    &run.id,
                    RunStatus::WaitingApproval,
                    RunStatus::Executing,
                )
                .await?;
                Ok((dag, RunStatus::Executing))
            }
            RunStatus::Executing => Ok((dag, RunStatus::Executing)),
            RunStatus::Paused => Ok((dag, RunStatus::Paused)),
            other => Err(FlowError::fatal(format!(
                "cannot rehydrate run {} in state {other}",
                run.id
            ))),
        }
    }

    async fn step_state(
        deps: &EngineDeps,
        capture: &CapturePipeline,
        run_id: &str,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<()> {
        deps.store.update_run_state(run_id, from, to).await?;
        capture.workflow_state_changed(from, to, None).await?;
        Ok(())
    }

    fn spawn_heartbeat(deps: &EngineDeps, run_id: &str, mut status_rx: watch::Receiver<RunStatus>) {
        let store = deps.store.clone();
        let run_id = run_id.to_string();
        let interval = deps.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let ticked = tokio::select! {
                    _ = ticker.tick() => true,
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        false
                    }
                };
                if status_rx.borrow().is_terminal() {
                    break;
                }
                if ticked {
                    if let Err(e) = store.touch_heartbeat(&run_id).await {
                        warn!(run_id = %run_id, error = %e, "heartbeat write failed");
                    }
                }
            }
        });
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Last status the scheduler reported.
    pub fn status(&self) -> RunStatus {
        *self.status_rx.borrow()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    async fn send(&self, command: ControlCommand) -> Result<()> {
        self.control_tx
            .send(command)
            .await
            .map_err(|_| FlowError::fatal("scheduler loop has exited"))
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(ControlCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(ControlCommand::Resume).await
    }

    /// Trigger the one-way cancel latch. Non-blocking for the requester;
    /// completion is observable through the terminal state transition.
    pub async fn cancel(&self) -> Result<()> {
        self.cancel.cancel();
        // The command only wakes the loop sooner; the latch alone suffices.
        let _ = self.send(ControlCommand::Cancel).await;
        Ok(())
    }

    pub async fn respond_approval(
        &self,
        approval_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Result<()> {
        self.send(ControlCommand::Approval {
            approval_id: approval_id.to_string(),
            approved,
            feedback,
        })
        .await
    }

    /// Wait until the run reaches a terminal state.
    pub async fn wait_terminal(&self, timeout: Duration) -> Result<RunStatus> {
        let mut status_rx = self.status_rx.clone();
        tokio::time::timeout(timeout, async move {
            loop {
                let current = *status_rx.borrow();
                if current.is_terminal() {
                    return current;
                }
                if status_rx.changed().await.is_err() {
                    return *status_rx.borrow();
                }
            }
        })
        .await
        .map_err(|_| FlowError::transient("timed out waiting for terminal state"))
    }
}

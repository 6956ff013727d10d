//! Event store facade
//!
//! The single process-wide mutable datum. Wraps the repositories with the
//! contract logic: execution-order assignment under a per-run append lock,
//! lifecycle-gated compare-and-set run transitions, cycle rejection for
//! persisted edges, and the default display filter.
//!
//! The append lock is per run, never global: concurrent runs do not contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use agentflow_core::dag::{edge_would_cycle, DagEdge, DagNode, WorkflowDag};
use agentflow_core::error::{FlowError, Result};
use agentflow_core::event::{EventBody, EventType, ExecutionEvent, FileArtifact};
use agentflow_core::lifecycle::{check_transition, RunStatus};
use agentflow_core::model::{BranchRecord, SessionRecord, TokenUsage, WorkflowRun};
use chrono::{DateTime, Utc};

use crate::connection::{DatabaseConnection, DatabasePool};
use crate::filter;
use crate::repositories::{
    BranchRepository, DagRepository, EventRepository, RunRepository, SessionRepository,
};

/// Map a database failure into the retryable store error.
fn store_err(e: sqlx::Error) -> FlowError {
    FlowError::StoreUnavailable(e.to_string())
}

/// Query options for event reads.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Restrict to one event type
    pub event_type: Option<EventType>,
    /// Return the raw stream including start subtypes and node lifecycle
    pub include_internal: bool,
    /// Only events with `execution_order` strictly greater than this
    pub since_order: Option<i64>,
}

impl EventFilter {
    pub fn raw() -> Self {
        Self {
            include_internal: true,
            ..Default::default()
        }
    }

    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn since(mut self, order: i64) -> Self {
        self.since_order = Some(order);
        self
    }
}

/// Offset pagination for listing queries.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// The file view projected from `file_gen` events.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub event_id: String,
    pub node_id: Option<String>,
    pub agent_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub artifact: FileArtifact,
}

/// Append-only, transactional persistence for sessions, runs, DAGs, events
/// and branches.
#[derive(Clone)]
pub struct EventStore {
    conn: DatabaseConnection,
    append_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl EventStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let conn = DatabaseConnection::connect(database_url)
            .await
            .map_err(store_err)?;
        Ok(Self {
            conn,
            append_locks: Arc::new(DashMap::new()),
        })
    }

    /// Fresh in-memory store, used by tests and ephemeral runs.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &DatabasePool {
        self.conn.pool()
    }

    pub async fn health_check(&self) -> Result<()> {
        self.conn.health_check().await.map_err(store_err)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Append an event, assigning the next `execution_order` for its run
    /// under the per-run lock. Returns the assigned order.
    ///
    /// An event arriving with a non-zero order that does not match the next
    /// slot is a stale caller and fails with `Conflict`.
    pub async fn append_event(&self, event: &mut ExecutionEvent) -> Result<i64> {
        let lock = self
            .append_locks
            .entry(event.run_id.clone())
            .or_default()
            .value()
            .clone();
        let _guard = lock.lock().await;

        let next = EventRepository::max_order(self.pool(), &event.run_id)
            .await
            .map_err(store_err)?
            + 1;
        if event.execution_order != 0 && event.execution_order != next {
            return Err(FlowError::Conflict {
                run_id: event.run_id.clone(),
            });
        }
        event.execution_order = next;

        let payload = serde_json::to_string(&event.body)?;
        EventRepository::insert(self.pool(), event, &payload)
            .await
            .map_err(store_err)?;
        debug!(
            run_id = %event.run_id,
            order = next,
            event_type = %event.event_type(),
            "event appended"
        );
        Ok(next)
    }

    pub async fn event_by_id(&self, id: &str) -> Result<ExecutionEvent> {
        EventRepository::by_id(self.pool(), id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| FlowError::not_found("event", id))?
            .into_event()
    }

    /// Events for a run in execution order. The default view hides the
    /// `agent_call` start subtype and node lifecycle events; pass
    /// `include_internal` on the filter for the raw stream.
    pub async fn events_for_run(
        &self,
        run_id: &str,
        options: &EventFilter,
    ) -> Result<Vec<ExecutionEvent>> {
        if run_id.is_empty() {
            return Err(FlowError::fatal("run queries require a run_id"));
        }
        let rows = EventRepository::for_run(
            self.pool(),
            run_id,
            options.event_type.map(|t| t.as_str()),
            options.since_order,
        )
        .await
        .map_err(store_err)?;
        let events = rows
            .into_iter()
            .map(|row| row.into_event())
            .collect::<Result<Vec<_>>>()?;
        Ok(if options.include_internal {
            events
        } else {
            filter::apply_default_filter(events)
        })
    }

    /// Events for one node. `node_id` is not globally unique, so the run
    /// scope is mandatory; an empty `run_id` is rejected.
    pub async fn events_for_node(
        &self,
        node_id: &str,
        run_id: &str,
        options: &EventFilter,
    ) -> Result<Vec<ExecutionEvent>> {
        if run_id.is_empty() {
            return Err(FlowError::fatal(
                "node-scoped event queries must be scoped by run_id",
            ));
        }
        let rows = EventRepository::for_node(
            self.pool(),
            node_id,
            run_id,
            options.event_type.map(|t| t.as_str()),
        )
        .await
        .map_err(store_err)?;
        let events = rows
            .into_iter()
            .map(|row| row.into_event())
            .collect::<Result<Vec<_>>>()?;
        Ok(if options.include_internal {
            events
        } else {
            filter::apply_default_filter(events)
        })
    }

    /// Project the `file_gen` events of a run into the file view.
    pub async fn files_for_run(&self, run_id: &str) -> Result<Vec<FileRecord>> {
        let events = self
            .events_for_run(
                run_id,
                &EventFilter::raw().with_event_type(EventType::FileGen),
            )
            .await?;
        Ok(events
            .into_iter()
            .filter_map(|event| match event.body {
                EventBody::FileGen(artifact) => Some(FileRecord {
                    event_id: event.id,
                    node_id: event.node_id,
                    agent_name: event.agent_name,
                    timestamp: event.timestamp,
                    artifact,
                }),
                _ => None,
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn create_session(&self, session: &SessionRecord) -> Result<()> {
        SessionRepository::insert(self.pool(), session)
            .await
            .map_err(store_err)
    }

    pub async fn get_session(&self, id: &str) -> Result<SessionRecord> {
        SessionRepository::by_id(self.pool(), id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| FlowError::not_found("session", id))?
            .into_record()
    }

    pub async fn list_sessions(&self, page: &Page) -> Result<Vec<SessionRecord>> {
        SessionRepository::list(self.pool(), page.limit, page.offset)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(|row| row.into_record())
            .collect()
    }

    /// Delete a session, cascading all owned runs and their data.
    pub async fn delete_session(&self, id: &str) -> Result<bool> {
        let deleted = SessionRepository::delete(self.pool(), id)
            .await
            .map_err(store_err)?;
        Ok(deleted > 0)
    }

    pub async fn touch_session(&self, id: &str, new_run: bool) -> Result<()> {
        SessionRepository::touch(self.pool(), id, new_run)
            .await
            .map_err(store_err)
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Persist a new run and count it against its session.
    pub async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        // Verify the parent session exists so ownership is explicit rather
        // than falling back to any shared default.
        self.get_session(&run.session_id).await?;
        RunRepository::insert(self.pool(), run)
            .await
            .map_err(store_err)?;
        self.touch_session(&run.session_id, true).await
    }

    pub async fn get_run(&self, id: &str) -> Result<WorkflowRun> {
        RunRepository::by_id(self.pool(), id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| FlowError::not_found("run", id))?
            .into_run()
    }

    pub async fn list_runs(
        &self,
        session_id: &str,
        status: Option<RunStatus>,
        page: &Page,
    ) -> Result<Vec<WorkflowRun>> {
        if session_id.is_empty() {
            return Err(FlowError::fatal("run listings require a session_id"));
        }
        RunRepository::list_for_session(self.pool(), session_id, status, page.limit, page.offset)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(|row| row.into_run())
            .collect()
    }

    /// Transition a run's lifecycle state. The legal-transition predicate is
    /// checked first; the database compare-and-set then rejects stale actors
    /// whose `from` no longer matches.
    pub async fn update_run_state(
        &self,
        run_id: &str,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<()> {
        check_transition(from, to)?;
        let updated = RunRepository::update_status_cas(self.pool(), run_id, from, to)
            .await
            .map_err(store_err)?;
        if updated == 0 {
            let actual = self.get_run(run_id).await?.status;
            return Err(FlowError::IllegalTransition { from: actual, to });
        }
        debug!(run_id = %run_id, from = %from, to = %to, "run state changed");
        Ok(())
    }

    pub async fn add_run_cost(&self, run_id: &str, usage: &TokenUsage) -> Result<()> {
        let run = self.get_run(run_id).await?;
        RunRepository::add_cost(self.pool(), run_id, usage)
            .await
            .map_err(store_err)?;
        SessionRepository::add_cost(self.pool(), &run.session_id, usage.cost_usd)
            .await
            .map_err(store_err)
    }

    pub async fn touch_heartbeat(&self, run_id: &str) -> Result<()> {
        RunRepository::touch_heartbeat(self.pool(), run_id)
            .await
            .map_err(store_err)
    }

    /// Non-terminal, non-paused runs whose heartbeat predates `cutoff`.
    pub async fn stalled_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkflowRun>> {
        RunRepository::stalled(self.pool(), cutoff)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(|row| row.into_run())
            .collect()
    }

    // ------------------------------------------------------------------
    // DAG
    // ------------------------------------------------------------------

    pub async fn upsert_node(&self, node: &DagNode) -> Result<()> {
        DagRepository::upsert_node(self.pool(), node)
            .await
            .map_err(store_err)
    }

    /// Idempotently persist an edge, rejecting one that would make the run's
    /// graph cyclic.
    pub async fn upsert_edge(&self, run_id: &str, source: &str, target: &str) -> Result<()> {
        let existing: Vec<(String, String)> =
            DagRepository::edges_for_run(self.pool(), run_id)
                .await
                .map_err(store_err)?
                .into_iter()
                .map(|row| (row.source_node_id, row.target_node_id))
                .collect();
        if existing
            .iter()
            .any(|(s, t)| s == source && t == target)
        {
            return Ok(());
        }
        if edge_would_cycle(&existing, source, target) {
            return Err(FlowError::InvalidTopology {
                from_node: source.to_string(),
                target: target.to_string(),
            });
        }
        DagRepository::upsert_edge(self.pool(), run_id, source, target)
            .await
            .map_err(store_err)
    }

    pub async fn get_node(&self, run_id: &str, node_id: &str) -> Result<DagNode> {
        DagRepository::node(self.pool(), run_id, node_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| FlowError::not_found("node", node_id))?
            .into_node()
    }

    pub async fn nodes_for_run(&self, run_id: &str) -> Result<Vec<DagNode>> {
        DagRepository::nodes_for_run(self.pool(), run_id)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(|row| row.into_node())
            .collect()
    }

    pub async fn edges_for_run(&self, run_id: &str) -> Result<Vec<DagEdge>> {
        Ok(DagRepository::edges_for_run(self.pool(), run_id)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(|row| DagEdge {
                source: row.source_node_id,
                target: row.target_node_id,
            })
            .collect())
    }

    /// Rehydrate the in-memory DAG for a run.
    pub async fn load_dag(&self, run_id: &str) -> Result<WorkflowDag> {
        let nodes = self.nodes_for_run(run_id).await?;
        let edges = self.edges_for_run(run_id).await?;
        WorkflowDag::from_parts(run_id, nodes, edges)
    }

    // ------------------------------------------------------------------
    // Branches
    // ------------------------------------------------------------------

    pub async fn create_branch(&self, branch: &BranchRecord) -> Result<()> {
        BranchRepository::insert(self.pool(), branch)
            .await
            .map_err(store_err)
    }

    pub async fn branch_for_run(&self, run_id: &str) -> Result<Option<BranchRecord>> {
        BranchRepository::for_run(self.pool(), run_id)
            .await
            .map_err(store_err)?
            .map(|row| row.into_record())
            .transpose()
    }

    pub async fn branches_of(&self, parent_run_id: &str) -> Result<Vec<BranchRecord>> {
        BranchRepository::children_of(self.pool(), parent_run_id)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(|row| row.into_record())
            .collect()
    }
}

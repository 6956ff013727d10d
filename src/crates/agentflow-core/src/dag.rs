//! In-memory DAG model
//!
//! Mirrors the persisted graph for one run: adjacency in both directions,
//! ready-set computation, topological layering and cycle detection on edge
//! insertion. Node identity is `(node_id, run_id)`; a `node_id` alone is
//! meaningless outside its run.
//!
//! Status is single-writer: only the scheduler mutates it, through
//! [`WorkflowDag::set_status`]. Nodes are never deleted, only marked skipped
//! or failed.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, Result};

/// Kind of work a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Invokes the planner and expands the DAG with the resulting steps
    Planning,
    /// LLM-backed coordination/synthesis step
    Control,
    /// Worker agent step
    Agent,
    /// Human approval gate
    Approval,
    /// Structural fan-out marker; completes immediately
    Parallel,
    /// Structural join/end marker; completes immediately
    Terminator,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Planning => "planning",
            NodeType::Control => "control",
            NodeType::Agent => "agent",
            NodeType::Approval => "approval",
            NodeType::Parallel => "parallel",
            NodeType::Terminator => "terminator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planning" => Some(NodeType::Planning),
            "control" => Some(NodeType::Control),
            "agent" => Some(NodeType::Agent),
            "approval" => Some(NodeType::Approval),
            "parallel" => Some(NodeType::Parallel),
            "terminator" => Some(NodeType::Terminator),
            _ => None,
        }
    }
}

/// Per-node execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    WaitingApproval,
    Retrying,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Paused => "paused",
            NodeStatus::WaitingApproval => "waiting_approval",
            NodeStatus::Retrying => "retrying",
            NodeStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NodeStatus::Pending),
            "running" => Some(NodeStatus::Running),
            "completed" => Some(NodeStatus::Completed),
            "failed" => Some(NodeStatus::Failed),
            "paused" => Some(NodeStatus::Paused),
            "waiting_approval" => Some(NodeStatus::WaitingApproval),
            "retrying" => Some(NodeStatus::Retrying),
            "skipped" => Some(NodeStatus::Skipped),
            _ => None,
        }
    }

    /// Terminal node states: {completed, failed, skipped}.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped
        )
    }

    /// A predecessor in one of these states unblocks its successors.
    pub fn unblocks_successors(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Skipped)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step in a run's DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagNode {
    pub node_id: String,
    pub run_id: String,
    /// Human-readable label, e.g. "step_2"
    pub label: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    /// Persona assigned to execute this node
    pub agent: Option<String>,
    /// Position in the plan, when the node came from a planner
    pub step_index: Option<u32>,
    /// What the step should accomplish
    pub goal: Option<String>,
    /// Result summary filled in on completion
    pub summary: Option<String>,
    pub error: Option<String>,
    /// Retry attempts consumed so far
    pub attempt: u32,
    pub max_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Structured extras, e.g. the generated plan for planning nodes
    pub payload: Value,
}

impl DagNode {
    pub fn new(
        node_id: impl Into<String>,
        run_id: impl Into<String>,
        label: impl Into<String>,
        node_type: NodeType,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            run_id: run_id.into(),
            label: label.into(),
            node_type,
            status: NodeStatus::Pending,
            agent: None,
            step_index: None,
            goal: None,
            summary: None,
            error: None,
            attempt: 0,
            max_attempts: 1,
            started_at: None,
            completed_at: None,
            payload: Value::Null,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn with_step_index(mut self, index: u32) -> Self {
        self.step_index = Some(index);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Directed run-scoped edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DagEdge {
    pub source: String,
    pub target: String,
}

/// The in-memory graph for one run.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    run_id: String,
    nodes: HashMap<String, DagNode>,
    adjacency: HashMap<String, Vec<String>>,
    reverse: HashMap<String, Vec<String>>,
}

impl WorkflowDag {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            nodes: HashMap::new(),
            adjacency: HashMap::new(),
            reverse: HashMap::new(),
        }
    }

    /// Rebuild a DAG from persisted rows, validating acyclicity.
    pub fn from_parts(
        run_id: impl Into<String>,
        nodes: Vec<DagNode>,
        edges: Vec<DagEdge>,
    ) -> Result<Self> {
        let mut dag = Self::new(run_id);
        for node in nodes {
            dag.add_node(node);
        }
        for edge in edges {
            dag.add_edge(&edge.source, &edge.target)?;
        }
        Ok(dag)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Insert or replace a node. Idempotent by node id.
    pub fn add_node(&mut self, node: DagNode) {
        let id = node.node_id.clone();
        self.adjacency.entry(id.clone()).or_default();
        self.reverse.entry(id.clone()).or_default();
        self.nodes.insert(id, node);
    }

    /// Add a directed edge, rejecting unknown endpoints and cycles.
    /// Re-adding an existing edge is a no-op.
    pub fn add_edge(&mut self, source: &str, target: &str) -> Result<()> {
        if !self.nodes.contains_key(source) {
            return Err(FlowError::not_found("node", source));
        }
        if !self.nodes.contains_key(target) {
            return Err(FlowError::not_found("node", target));
        }
        if self
            .adjacency
            .get(source)
            .map(|next| next.iter().any(|t| t == target))
            .unwrap_or(false)
        {
            return Ok(());
        }
        if source == target || self.reachable(target, source) {
            return Err(FlowError::InvalidTopology {
                from_node: source.to_string(),
                target: target.to_string(),
            });
        }
        self.adjacency
            .entry(source.to_string())
            .or_default()
            .push(target.to_string());
        self.reverse
            .entry(target.to_string())
            .or_default()
            .push(source.to_string());
        Ok(())
    }

    /// BFS reachability over forward edges.
    fn reachable(&self, from: &str, to: &str) -> bool {
        let mut queue = VecDeque::from([from]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if current == to {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(next) = self.adjacency.get(current) {
                queue.extend(next.iter().map(String::as_str));
            }
        }
        false
    }

    pub fn node(&self, node_id: &str) -> Option<&DagNode> {
        self.nodes.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut DagNode> {
        self.nodes.get_mut(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DagNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> Vec<DagEdge> {
        let mut edges: Vec<DagEdge> = self
            .adjacency
            .iter()
            .flat_map(|(source, targets)| {
                targets.iter().map(move |target| DagEdge {
                    source: source.clone(),
                    target: target.clone(),
                })
            })
            .collect();
        edges.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
        edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn successors(&self, node_id: &str) -> &[String] {
        self.adjacency.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, node_id: &str) -> &[String] {
        self.reverse.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Update a node's status, stamping start/completion times.
    pub fn set_status(&mut self, node_id: &str, status: NodeStatus) -> Result<()> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| FlowError::not_found("node", node_id))?;
        if node.status == status {
            return Ok(());
        }
        match status {
            NodeStatus::Running if node.started_at.is_none() => {
                node.started_at = Some(Utc::now());
            }
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped => {
                node.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        node.status = status;
        Ok(())
    }

    /// Nodes that can be dispatched now: pending, with every predecessor
    /// completed or skipped. Deterministic order (label, then id).
    pub fn ready_set(&self) -> Vec<String> {
        let mut ready: Vec<&DagNode> = self
            .nodes
            .values()
            .filter(|node| node.status == NodeStatus::Pending)
            .filter(|node| {
                self.predecessors(&node.node_id)
                    .iter()
                    .all(|pred| {
                        self.nodes
                            .get(pred)
                            .map(|p| p.status.unblocks_successors())
                            .unwrap_or(false)
                    })
            })
            .collect();
        ready.sort_by(|a, b| {
            (a.step_index, &a.label, &a.node_id).cmp(&(b.step_index, &b.label, &b.node_id))
        });
        ready.into_iter().map(|node| node.node_id.clone()).collect()
    }

    /// All nodes strictly downstream of `node_id`.
    pub fn downstream_of(&self, node_id: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let mut queue: VecDeque<&str> = self.successors(node_id).iter().map(String::as_str).collect();
        while let Some(current) = queue.pop_front() {
            if result.insert(current.to_string()) {
                queue.extend(self.successors(current).iter().map(String::as_str));
            }
        }
        result
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(DagNode::is_terminal)
    }

    pub fn any_failed(&self) -> bool {
        self.nodes
            .values()
            .any(|node| node.status == NodeStatus::Failed)
    }

    /// Topological layers via Kahn's algorithm. Nodes in the same layer have
    /// no dependency relationship and may execute in parallel.
    pub fn layers(&self) -> Vec<Vec<String>> {
        let mut indegree: HashMap<&str, usize> = self
            .nodes
            .keys()
            .map(|id| (id.as_str(), self.predecessors(id).len()))
            .collect();
        let mut current: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        current.sort_unstable();

        let mut layers = Vec::new();
        while !current.is_empty() {
            layers.push(current.iter().map(|id| id.to_string()).collect());
            let mut next = Vec::new();
            for id in current.drain(..) {
                for succ in self.successors(id) {
                    let d = indegree.entry(succ.as_str()).or_insert(0);
                    *d -= 1;
                    if *d == 0 {
                        next.push(succ.as_str());
                    }
                }
            }
            next.sort_unstable();
            current = next;
        }
        layers
    }
}

/// Cycle check over raw edge pairs, used by the store before accepting a
/// persisted edge. Returns true when adding `source -> target` would close a
/// cycle.
pub fn edge_would_cycle(edges: &[(String, String)], source: &str, target: &str) -> bool {
    if source == target {
        return true;
    }
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for (s, t) in edges {
        adjacency.entry(s.as_str()).or_default().push(t.as_str());
    }
    // Path target -> source means the new edge closes a loop.
    let mut queue = VecDeque::from([target]);
    let mut seen = HashSet::new();
    while let Some(current) = queue.pop_front() {
        if current == source {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(next) = adjacency.get(current) {
            queue.extend(next.iter().copied());
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dag_with_chain(ids: &[&str]) -> WorkflowDag {
        let mut dag = WorkflowDag::new("run-1");
        for id in ids {
            dag.add_node(DagNode::new(*id, "run-1", *id, NodeType::Agent));
        }
        for pair in ids.windows(2) {
            dag.add_edge(pair[0], pair[1]).unwrap();
        }
        dag
    }

    #[test]
    fn cycle_rejected_on_insert() {
        let mut dag = dag_with_chain(&["a", "b", "c"]);
        let err = dag.add_edge("c", "a").unwrap_err();
        assert!(matches!(err, FlowError::InvalidTopology { .. }));
        // Self loop
        assert!(dag.add_edge("b", "b").is_err());
        // Graph is unchanged
        assert_eq!(dag.edges().len(), 2);
    }

    #[test]
    fn duplicate_edge_is_noop() {
        let mut dag = dag_with_chain(&["a", "b"]);
        dag.add_edge("a", "b").unwrap();
        assert_eq!(dag.edges().len(), 1);
    }

    #[test]
    fn edge_to_unknown_node_rejected() {
        let mut dag = dag_with_chain(&["a"]);
        assert!(matches!(
            dag.add_edge("a", "ghost"),
            Err(FlowError::NotFound { .. })
        ));
    }

    #[test]
    fn ready_set_respects_dependencies() {
        let mut dag = dag_with_chain(&["a", "b", "c"]);
        assert_eq!(dag.ready_set(), vec!["a"]);

        dag.set_status("a", NodeStatus::Running).unwrap();
        assert!(dag.ready_set().is_empty());

        dag.set_status("a", NodeStatus::Completed).unwrap();
        assert_eq!(dag.ready_set(), vec!["b"]);
    }

    #[test]
    fn skipped_predecessor_unblocks() {
        let mut dag = dag_with_chain(&["a", "b"]);
        dag.set_status("a", NodeStatus::Skipped).unwrap();
        assert_eq!(dag.ready_set(), vec!["b"]);
    }

    #[test]
    fn failed_predecessor_blocks() {
        let mut dag = dag_with_chain(&["a", "b"]);
        dag.set_status("a", NodeStatus::Failed).unwrap();
        assert!(dag.ready_set().is_empty());
    }

    #[test]
    fn parallel_roots_are_both_ready() {
        let mut dag = WorkflowDag::new("run-1");
        for id in ["left", "right", "join"] {
            dag.add_node(DagNode::new(id, "run-1", id, NodeType::Agent));
        }
        dag.add_edge("left", "join").unwrap();
        dag.add_edge("right", "join").unwrap();

        assert_eq!(dag.ready_set(), vec!["left", "right"]);

        dag.set_status("left", NodeStatus::Completed).unwrap();
        assert_eq!(dag.ready_set(), vec!["right"]);

        dag.set_status("right", NodeStatus::Completed).unwrap();
        assert_eq!(dag.ready_set(), vec!["join"]);
    }

    #[test]
    fn layers_follow_topology() {
        let mut dag = WorkflowDag::new("run-1");
        for id in ["a", "b1", "b2", "c"] {
            dag.add_node(DagNode::new(id, "run-1", id, NodeType::Agent));
        }
        dag.add_edge("a", "b1").unwrap();
        dag.add_edge("a", "b2").unwrap();
        dag.add_edge("b1", "c").unwrap();
        dag.add_edge("b2", "c").unwrap();

        let layers = dag.layers();
        assert_eq!(layers, vec![
            vec!["a".to_string()],
            vec!["b1".to_string(), "b2".to_string()],
            vec!["c".to_string()],
        ]);
    }

    #[test]
    fn downstream_excludes_pivot() {
        let dag = dag_with_chain(&["a", "b", "c"]);
        let downstream = dag.downstream_of("a");
        assert!(downstream.contains("b"));
        assert!(downstream.contains("c"));
        assert!(!downstream.contains("a"));
        assert!(dag.downstream_of("c").is_empty());
    }

    #[test]
    fn status_stamps_timestamps() {
        let mut dag = dag_with_chain(&["a"]);
        dag.set_status("a", NodeStatus::Running).unwrap();
        assert!(dag.node("a").unwrap().started_at.is_some());
        assert!(dag.node("a").unwrap().completed_at.is_none());

        dag.set_status("a", NodeStatus::Completed).unwrap();
        assert!(dag.node("a").unwrap().completed_at.is_some());
    }

    #[test]
    fn from_parts_rejects_cyclic_rows() {
        let nodes = vec![
            DagNode::new("a", "run-1", "a", NodeType::Agent),
            DagNode::new("b", "run-1", "b", NodeType::Agent),
        ];
        let edges = vec![
            DagEdge { source: "a".into(), target: "b".into() },
            DagEdge { source: "b".into(), target: "a".into() },
        ];
        assert!(WorkflowDag::from_parts("run-1", nodes, edges).is_err());
    }

    #[test]
    fn edge_would_cycle_raw_pairs() {
        let edges = vec![
            ("a".to_string(), "b".to_string()),
            ("b".to_string(), "c".to_string()),
        ];
        assert!(edge_would_cycle(&edges, "c", "a"));
        assert!(edge_would_cycle(&edges, "a", "a"));
        assert!(!edge_would_cycle(&edges, "a", "c"));
        assert!(!edge_would_cycle(&edges, "c", "d"));
    }
}

//! Planner output bridging
//!
//! Planning-mode runs start with a planner agent whose reply must contain a
//! JSON plan: an ordered list of steps with optional dependencies, personas
//! and approval markers. This module parses that reply (tolerating a fenced
//! code block around the JSON) and materialises the steps into DAG nodes and
//! edges appended after the planning node.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use agentflow_core::dag::{DagEdge, DagNode, NodeType};
use agentflow_core::error::{FlowError, Result};
use agentflow_core::retry::RetryPolicies;

/// One planned step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub title: String,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    /// 1-based indices of steps this one depends on; empty means "the
    /// previous step" (sequential default)
    #[serde(default)]
    pub depends_on: Vec<usize>,
    /// True when a human must approve before this step runs
    #[serde(default)]
    pub approval: bool,
}

/// A parsed plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Pull the JSON document out of a model reply. Accepts a bare JSON object
/// or one wrapped in a fenced code block.
fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    // Fall back to the outermost braces.
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(open), Some(close)) if close > open => &trimmed[open..=close],
        _ => trimmed,
    }
}

/// Parse a planner reply into a [`Plan`]. Failures are logic errors: the
/// model produced something the engine cannot use.
pub fn parse_plan(raw: &str) -> Result<Plan> {
    let json = extract_json(raw);
    let plan: Plan = serde_json::from_str(json)
        .map_err(|e| FlowError::Logic(format!("planner output is not a valid plan: {e}")))?;
    if plan.steps.is_empty() {
        return Err(FlowError::Logic("planner produced an empty plan".into()));
    }
    for (index, step) in plan.steps.iter().enumerate() {
        for dep in &step.depends_on {
            if *dep == 0 || *dep > index {
                return Err(FlowError::Logic(format!(
                    "step {} depends on step {dep}, which is not an earlier step",
                    index + 1
                )));
            }
        }
    }
    Ok(plan)
}

/// Turn a plan into nodes and edges rooted at `planning_node_id`.
///
/// Steps with no explicit dependencies chain sequentially; the first step
/// (and any step whose dependencies are empty because it is first) hangs off
/// the planning node. Node ids are `step_<n>`, matching the 1-based plan
/// order.
pub fn materialize_plan(
    run_id: &str,
    planning_node_id: &str,
    plan: &Plan,
    default_agent: Option<&str>,
    retries: &RetryPolicies,
) -> (Vec<DagNode>, Vec<DagEdge>) {
    let mut nodes = Vec::with_capacity(plan.steps.len());
    let mut edges = Vec::new();

    for (index, step) in plan.steps.iter().enumerate() {
        let number = index + 1;
        let node_id = format!("step_{number}");
        let node_type = if step.approval {
            NodeType::Approval
        } else {
            NodeType::Agent
        };
        let mut node = DagNode::new(&node_id, run_id, &node_id, node_type)
            .with_step_index(number as u32)
            .with_goal(step.goal.clone().unwrap_or_else(|| step.title.clone()))
            .with_max_attempts(retries.for_node_type(node_type).max_attempts);
        node.summary = None;
        node.agent = step
            .agent
            .clone()
            .or_else(|| default_agent.map(str::to_string));
        node.payload = serde_json::json!({ "title": step.title });
        nodes.push(node);

        if step.depends_on.is_empty() {
            let source = if index == 0 {
                planning_node_id.to_string()
            } else {
                format!("step_{index}")
            };
            edges.push(DagEdge {
                source,
                target: node_id,
            });
        } else {
            for dep in &step.depends_on {
                edges.push(DagEdge {
                    source: format!("step_{dep}"),
                    target: node_id.clone(),
                });
            }
        }
    }

    (nodes, edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::retry::RetryPolicy;

    #[test]
    fn parses_bare_json() {
        let plan = parse_plan(r#"{"steps": [{"title": "research"}, {"title": "write"}]}"#)
            .unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].title, "research");
        assert!(!plan.steps[0].approval);
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "Here is the plan:\n```json\n{\"steps\": [{\"title\": \"a\"}]}\n```\nGood luck!";
        let plan = parse_plan(raw).unwrap();
        assert_eq!(plan.steps.len(), 1);
    }

    #[test]
    fn rejects_prose_and_empty_plans() {
        assert!(matches!(
            parse_plan("I could not come up with a plan."),
            Err(FlowError::Logic(_))
        ));
        assert!(matches!(
            parse_plan(r#"{"steps": []}"#),
            Err(FlowError::Logic(_))
        ));
    }

    #[test]
    fn rejects_forward_dependencies() {
        let raw = r#"{"steps": [{"title": "a", "depends_on": [2]}, {"title": "b"}]}"#;
        assert!(matches!(parse_plan(raw), Err(FlowError::Logic(_))));
    }

    #[test]
    fn sequential_chain_by_default() {
        let plan = parse_plan(
            r#"{"steps": [{"title": "a"}, {"title": "b"}, {"title": "c"}]}"#,
        )
        .unwrap();
        let retries = RetryPolicies::new(RetryPolicy::new(3));
        let (nodes, edges) = materialize_plan("run-1", "plan", &plan, Some("generalist"), &retries);

        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].node_id, "step_1");
        assert_eq!(nodes[0].agent.as_deref(), Some("generalist"));
        assert_eq!(nodes[0].max_attempts, 3);

        let pairs: Vec<(String, String)> = edges
            .into_iter()
            .map(|e| (e.source, e.target))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("plan".to_string(), "step_1".to_string()),
                ("step_1".to_string(), "step_2".to_string()),
                ("step_2".to_string(), "step_3".to_string()),
            ]
        );
    }

    #[test]
    fn explicit_dependencies_fan_out() {
        let plan = parse_plan(
            r#"{"steps": [
                {"title": "root"},
                {"title": "left", "depends_on": [1]},
                {"title": "right", "depends_on": [1]},
                {"title": "join", "depends_on": [2, 3]}
            ]}"#,
        )
        .unwrap();
        let retries = RetryPolicies::default();
        let (_, edges) = materialize_plan("run-1", "plan", &plan, None, &retries);

        let pairs: Vec<(String, String)> =
            edges.into_iter().map(|e| (e.source, e.target)).collect();
        assert!(pairs.contains(&("step_1".to_string(), "step_2".to_string())));
        assert!(pairs.contains(&("step_1".to_string(), "step_3".to_string())));
        assert!(pairs.contains(&("step_2".to_string(), "step_4".to_string())));
        assert!(pairs.contains(&("step_3".to_string(), "step_4".to_string())));
    }

    #[test]
    fn approval_steps_become_approval_nodes() {
        let plan = parse_plan(
            r#"{"steps": [{"title": "draft"}, {"title": "sign-off", "approval": true}]}"#,
        )
        .unwrap();
        let retries = RetryPolicies::new(RetryPolicy::new(3))
            .with_policy(NodeType::Approval, RetryPolicy::none());
        let (nodes, _) = materialize_plan("run-1", "plan", &plan, None, &retries);
        assert_eq!(nodes[1].node_type, NodeType::Approval);
        assert_eq!(nodes[1].max_attempts, 1);
    }
}

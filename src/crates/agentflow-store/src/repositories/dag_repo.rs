//! DAG repository
//!
//! Nodes and edges are idempotent upserts keyed on their composite run-scoped
//! identity. The cycle check for new edges happens in the facade, which can
//! see the whole persisted edge set.

use crate::connection::DatabasePool;
use crate::models::{EdgeRow, NodeRow};
use agentflow_core::dag::DagNode;

pub struct DagRepository;

impl DagRepository {
    pub async fn upsert_node(pool: &DatabasePool, node: &DagNode) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO dag_nodes (node_id, run_id, label, node_type, status, agent,
                                    step_index, goal, summary, error, attempt, max_attempts,
                                    started_at, completed_at, payload)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (node_id, run_id) DO UPDATE SET
                 label = excluded.label,
                 node_type = excluded.node_type,
                 status = excluded.status,
                 agent = excluded.agent,
                 step_index = excluded.step_index,
                 goal = excluded.goal,
                 summary = excluded.summary,
                 error = excluded.error,
                 attempt = excluded.attempt,
                 max_attempts = excluded.max_attempts,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at,
                 payload = excluded.payload",
        )
        .bind(&node.node_id)
        .bind(&node.run_id)
        .bind(&node.label)
        .bind(node.node_type.as_str())
        .bind(node.status.as_str())
        .bind(&node.agent)
        .bind(node.step_index.map(|i| i as i64))
        .bind(&node.goal)
        .bind(&node.summary)
        .bind(&node.error)
        .bind(node.attempt as i64)
        .bind(node.max_attempts as i64)
        .bind(node.started_at.map(|t| t.to_rfc3339()))
        .bind(node.completed_at.map(|t| t.to_rfc3339()))
        .bind(serde_json::to_string(&node.payload).unwrap_or_else(|_| "null".to_string()))
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_edge(
        pool: &DatabasePool,
        run_id: &str,
        source: &str,
        target: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO dag_edges (source_node_id, target_node_id, run_id)
             VALUES (?, ?, ?)
             ON CONFLICT (source_node_id, target_node_id, run_id) DO NOTHING",
        )
        .bind(source)
        .bind(target)
        .bind(run_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn node(
        pool: &DatabasePool,
        run_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeRow>, sqlx::Error> {
        sqlx::query_as::<_, NodeRow>(
            "SELECT * FROM dag_nodes WHERE node_id = ? AND run_id = ?",
        )
        .bind(node_id)
        .bind(run_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn nodes_for_run(
        pool: &DatabasePool,
        run_id: &str,
    ) -> Result<Vec<NodeRow>, sqlx::Error> {
        sqlx::query_as::<_, NodeRow>(
            "SELECT * FROM dag_nodes WHERE run_id = ? ORDER BY step_index, node_id",
        )
        .bind(run_id)
        .fetch_all(pool)
        .await
    }

    pub async fn edges_for_run(
        pool: &DatabasePool,
        run_id: &str,
    ) -> Result<Vec<EdgeRow>, sqlx::Error> {
        sqlx::query_as::<_, EdgeRow>(
            "SELECT * FROM dag_edges WHERE run_id = ?
             ORDER BY source_node_id, target_node_id",
        )
        .bind(run_id)
        .fetch_all(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DatabaseConnection;
    use crate::repositories::{RunRepository, SessionRepository};
    use agentflow_core::dag::{NodeStatus, NodeType};
    use agentflow_core::model::{RunMode, SessionRecord, WorkflowRun};

    async fn setup() -> (DatabaseConnection, String) {
        let conn = DatabaseConnection::connect("sqlite::memory:").await.unwrap();
        let session = SessionRecord::new("s");
        SessionRepository::insert(conn.pool(), &session).await.unwrap();
        let run = WorkflowRun::new(&session.id, "t", RunMode::PlanningControl);
        RunRepository::insert(conn.pool(), &run).await.unwrap();
        (conn, run.id)
    }

    #[tokio::test]
    async fn upsert_node_is_idempotent() {
        let (conn, run_id) = setup().await;
        let mut node = DagNode::new("n1", &run_id, "step_1", NodeType::Agent)
            .with_goal("write the report");
        DagRepository::upsert_node(conn.pool(), &node).await.unwrap();

        node.status = NodeStatus::Running;
        DagRepository::upsert_node(conn.pool(), &node).await.unwrap();

        let rows = DagRepository::nodes_for_run(conn.pool(), &run_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "running");
    }

    #[tokio::test]
    async fn same_node_id_in_two_runs() {
        let (conn, run_a) = setup().await;
        let session = SessionRecord::new("s2");
        SessionRepository::insert(conn.pool(), &session).await.unwrap();
        let run_b = WorkflowRun::new(&session.id, "t", RunMode::OneShot);
        RunRepository::insert(conn.pool(), &run_b).await.unwrap();

        for run_id in [&run_a, &run_b.id] {
            let node = DagNode::new("step_1", run_id, "step_1", NodeType::Agent);
            DagRepository::upsert_node(conn.pool(), &node).await.unwrap();
        }

        assert_eq!(
            DagRepository::nodes_for_run(conn.pool(), &run_a).await.unwrap().len(),
            1
        );
        assert_eq!(
            DagRepository::nodes_for_run(conn.pool(), &run_b.id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn edges_are_idempotent_and_run_scoped() {
        let (conn, run_id) = setup().await;
        for id in ["a", "b"] {
            let node = DagNode::new(id, &run_id, id, NodeType::Agent);
            DagRepository::upsert_node(conn.pool(), &node).await.unwrap();
        }

        DagRepository::upsert_edge(conn.pool(), &run_id, "a", "b").await.unwrap();
        DagRepository::upsert_edge(conn.pool(), &run_id, "a", "b").await.unwrap();

        let edges = DagRepository::edges_for_run(conn.pool(), &run_id).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].source_node_id, "a");
    }
}

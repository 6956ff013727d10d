//! Branch repository

use crate::connection::DatabasePool;
use crate::models::BranchRow;
use agentflow_core::model::BranchRecord;

pub struct BranchRepository;

impl BranchRepository {
    pub async fn insert(pool: &DatabasePool, branch: &BranchRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO branches (id, run_id, parent_run_id, parent_branch_id, fork_node_id,
                                   hypothesis, name, created_at, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&branch.id)
        .bind(&branch.run_id)
        .bind(&branch.parent_run_id)
        .bind(&branch.parent_branch_id)
        .bind(&branch.fork_node_id)
        .bind(&branch.hypothesis)
        .bind(&branch.name)
        .bind(branch.created_at.to_rfc3339())
        .bind(branch.status.as_str())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn by_id(pool: &DatabasePool, id: &str) -> Result<Option<BranchRow>, sqlx::Error> {
        sqlx::query_as::<_, BranchRow>("SELECT * FROM branches WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// The branch row describing `run_id` itself, if that run is a fork.
    pub async fn for_run(pool: &DatabasePool, run_id: &str) -> Result<Option<BranchRow>, sqlx::Error> {
        sqlx::query_as::<_, BranchRow>("SELECT * FROM branches WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(pool)
            .await
    }

    /// Branches forked off `parent_run_id`.
    pub async fn children_of(
        pool: &DatabasePool,
        parent_run_id: &str,
    ) -> Result<Vec<BranchRow>, sqlx::Error> {
        sqlx::query_as::<_, BranchRow>(
            "SELECT * FROM branches WHERE parent_run_id = ? ORDER BY created_at",
        )
        .bind(parent_run_id)
        .fetch_all(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DatabaseConnection;
    use crate::repositories::{RunRepository, SessionRepository};
    use agentflow_core::model::{RunMode, SessionRecord, WorkflowRun};

    #[tokio::test]
    async fn branch_roundtrip() {
        let conn = DatabaseConnection::connect("sqlite::memory:").await.unwrap();
        let session = SessionRecord::new("s");
        SessionRepository::insert(conn.pool(), &session).await.unwrap();
        let parent = WorkflowRun::new(&session.id, "t", RunMode::OneShot);
        let fork = WorkflowRun::new(&session.id, "t", RunMode::OneShot);
        RunRepository::insert(conn.pool(), &parent).await.unwrap();
        RunRepository::insert(conn.pool(), &fork).await.unwrap();

        let branch = BranchRecord::new(&fork.id, &parent.id, "step_1")
            .with_hypothesis("try twice");
        BranchRepository::insert(conn.pool(), &branch).await.unwrap();

        let children = BranchRepository::children_of(conn.pool(), &parent.id)
            .await
            .unwrap();
        assert_eq!(children.len(), 1);

        let record = BranchRepository::for_run(conn.pool(), &fork.id)
            .await
            .unwrap()
            .unwrap()
            .into_record()
            .unwrap();
        assert_eq!(record.hypothesis.as_deref(), Some("try twice"));
        assert_eq!(record.fork_node_id, "step_1");
    }
}

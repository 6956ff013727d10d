//! Run repository
//!
//! Status updates go through a compare-and-set keyed on the expected current
//! status, so two actors racing on the same transition cannot both win.

use chrono::{DateTime, Utc};

use crate::connection::DatabasePool;
use crate::models::RunRow;
use agentflow_core::lifecycle::RunStatus;
use agentflow_core::model::{TokenUsage, WorkflowRun};

pub struct RunRepository;

impl RunRepository {
    pub async fn insert(pool: &DatabasePool, run: &WorkflowRun) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO runs (id, session_id, task, mode, agent, model, status,
                               created_at, started_at, completed_at, total_cost_usd,
                               prompt_tokens, completion_tokens, last_heartbeat_at, config)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.session_id)
        .bind(&run.task)
        .bind(run.mode.as_str())
        .bind(&run.agent)
        .bind(&run.model)
        .bind(run.status.as_str())
        .bind(run.created_at.to_rfc3339())
        .bind(run.started_at.map(|t| t.to_rfc3339()))
        .bind(run.completed_at.map(|t| t.to_rfc3339()))
        .bind(run.total_cost_usd)
        .bind(run.prompt_tokens)
        .bind(run.completion_tokens)
        .bind(run.last_heartbeat_at.map(|t| t.to_rfc3339()))
        .bind(serde_json::to_string(&run.config).unwrap_or_else(|_| "null".to_string()))
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn by_id(pool: &DatabasePool, id: &str) -> Result<Option<RunRow>, sqlx::Error> {
        sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_for_session(
        pool: &DatabasePool,
        session_id: &str,
        status: Option<RunStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunRow>, sqlx::Error> {
        match status {
            Some(status) => {
                sqlx::query_as::<_, RunRow>(
                    "SELECT * FROM runs WHERE session_id = ? AND status = ?
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(session_id)
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await
            }
            None => {
                sqlx::query_as::<_, RunRow>(
                    "SELECT * FROM runs WHERE session_id = ?
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(session_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await
            }
        }
    }

    /// Compare-and-set the status, stamping `started_at` on first entry into
    /// execution and `completed_at` on terminal states. Returns the number of
    /// updated rows; 0 means the expected status was stale.
    pub async fn update_status_cas(
        pool: &DatabasePool,
        id: &str,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<u64, sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        let started: Option<&str> = (to == RunStatus::Executing).then_some(now.as_str());
        let completed: Option<&str> = to.is_terminal().then_some(now.as_str());

        let result = sqlx::query(
            "UPDATE runs SET status = ?,
                             started_at = COALESCE(started_at, ?),
                             completed_at = COALESCE(?, completed_at)
             WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(started)
        .bind(completed)
        .bind(id)
        .bind(from.as_str())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn add_cost(
        pool: &DatabasePool,
        id: &str,
        usage: &TokenUsage,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE runs SET total_cost_usd = total_cost_usd + ?,
                             prompt_tokens = prompt_tokens + ?,
                             completion_tokens = completion_tokens + ?
             WHERE id = ?",
        )
        .bind(usage.cost_usd)
        .bind(usage.prompt_tokens as i64)
        .bind(usage.completion_tokens as i64)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn touch_heartbeat(pool: &DatabasePool, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE runs SET last_heartbeat_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Non-terminal runs whose heartbeat predates `cutoff`. Paused runs are
    /// deliberately excluded: pause is user intent, not a stall.
    pub async fn stalled(
        pool: &DatabasePool,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<RunRow>, sqlx::Error> {
        sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs
             WHERE status IN ('planning', 'executing', 'waiting_approval')
               AND last_heartbeat_at IS NOT NULL
               AND last_heartbeat_at < ?",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DatabaseConnection;
    use crate::repositories::SessionRepository;
    use agentflow_core::model::{RunMode, SessionRecord};

    async fn setup() -> (DatabaseConnection, WorkflowRun) {
        let conn = DatabaseConnection::connect("sqlite::memory:").await.unwrap();
        let session = SessionRecord::new("s");
        SessionRepository::insert(conn.pool(), &session).await.unwrap();
        let run = WorkflowRun::new(&session.id, "do a thing", RunMode::OneShot);
        RunRepository::insert(conn.pool(), &run).await.unwrap();
        (conn, run)
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrip() {
        let (conn, run) = setup().await;
        let fetched = RunRepository::by_id(conn.pool(), &run.id)
            .await
            .unwrap()
            .unwrap()
            .into_run()
            .unwrap();
        assert_eq!(fetched.status, RunStatus::Draft);
        assert_eq!(fetched.mode, RunMode::OneShot);
        assert_eq!(fetched.task, "do a thing");
    }

    #[tokio::test]
    async fn cas_rejects_stale_expected_status() {
        let (conn, run) = setup().await;

        let updated = RunRepository::update_status_cas(
            conn.pool(),
            &run.id,
            RunStatus::Draft,
            RunStatus::Planning,
        )
        .await
        .unwrap();
        assert_eq!(updated, 1);

        // Second actor still thinks the run is draft.
        let updated = RunRepository::update_status_cas(
            conn.pool(),
            &run.id,
            RunStatus::Draft,
            RunStatus::Planning,
        )
        .await
        .unwrap();
        assert_eq!(updated, 0);
    }

    #[tokio::test]
    async fn terminal_transition_stamps_completed_at() {
        let (conn, run) = setup().await;
        for (from, to) in [
            (RunStatus::Draft, RunStatus::Planning),
            (RunStatus::Planning, RunStatus::Executing),
            (RunStatus::Executing, RunStatus::Completed),
        ] {
            RunRepository::update_status_cas(conn.pool(), &run.id, from, to)
                .await
                .unwrap();
        }

        let fetched = RunRepository::by_id(conn.pool(), &run.id)
            .await
            .unwrap()
            .unwrap()
            .into_run()
            .unwrap();
        assert!(fetched.started_at.is_some());
        assert!(fetched.completed_at.is_some());
        assert_eq!(fetched.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn cost_accumulates() {
        let (conn, run) = setup().await;
        RunRepository::add_cost(conn.pool(), &run.id, &TokenUsage::new(100, 50, 0.02))
            .await
            .unwrap();
        RunRepository::add_cost(conn.pool(), &run.id, &TokenUsage::new(10, 5, 0.01))
            .await
            .unwrap();

        let fetched = RunRepository::by_id(conn.pool(), &run.id)
            .await
            .unwrap()
            .unwrap()
            .into_run()
            .unwrap();
        assert_eq!(fetched.prompt_tokens, 110);
        assert!((fetched.total_cost_usd - 0.03).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stalled_ignores_paused_runs() {
        let (conn, run) = setup().await;
        RunRepository::update_status_cas(conn.pool(), &run.id, RunStatus::Draft, RunStatus::Planning)
            .await
            .unwrap();
        RunRepository::update_status_cas(
            conn.pool(),
            &run.id,
            RunStatus::Planning,
            RunStatus::Executing,
        )
        .await
        .unwrap();
        RunRepository::touch_heartbeat(conn.pool(), &run.id).await.unwrap();

        let future = Utc::now() + chrono::Duration::seconds(60);
        let stalled = RunRepository::stalled(conn.pool(), future).await.unwrap();
        assert_eq!(stalled.len(), 1);

        RunRepository::update_status_cas(
            conn.pool(),
            &run.id,
            RunStatus::Executing,
            RunStatus::Paused,
        )
        .await
        .unwrap();
        let stalled = RunRepository::stalled(conn.pool(), future).await.unwrap();
        assert!(stalled.is_empty());
    }
}

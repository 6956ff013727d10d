//! Session repository

use chrono::Utc;

use crate::connection::DatabasePool;
use crate::models::SessionRow;
use agentflow_core::model::SessionRecord;

pub struct SessionRepository;

impl SessionRepository {
    pub async fn insert(
        pool: &DatabasePool,
        session: &SessionRecord,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO sessions (id, name, created_at, last_active_at, run_count, total_cost_usd)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(session.created_at.to_rfc3339())
        .bind(session.last_active_at.to_rfc3339())
        .bind(session.run_count)
        .bind(session.total_cost_usd)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn by_id(
        pool: &DatabasePool,
        id: &str,
    ) -> Result<Option<SessionRow>, sqlx::Error> {
        sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list(
        pool: &DatabasePool,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SessionRow>, sqlx::Error> {
        sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions ORDER BY last_active_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// Delete a session; owned runs, nodes, edges, events and branches
    /// cascade. Returns the number of deleted sessions (0 or 1).
    pub async fn delete(pool: &DatabasePool, id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Bump `last_active_at`, optionally counting a newly started run.
    pub async fn touch(
        pool: &DatabasePool,
        id: &str,
        new_run: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE sessions SET last_active_at = ?, run_count = run_count + ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(if new_run { 1 } else { 0 })
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn add_cost(
        pool: &DatabasePool,
        id: &str,
        cost_usd: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE sessions SET total_cost_usd = total_cost_usd + ? WHERE id = ?")
            .bind(cost_usd)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

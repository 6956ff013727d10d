//! Event repository
//!
//! Rows are append-only; there is no UPDATE or DELETE here by design. The
//! facade serializes the payload and assigns `execution_order` under the
//! per-run lock before calling [`EventRepository::insert`].

use crate::connection::DatabasePool;
use crate::models::EventRow;
use agentflow_core::event::ExecutionEvent;

pub struct EventRepository;

impl EventRepository {
    pub async fn insert(
        pool: &DatabasePool,
        event: &ExecutionEvent,
        payload: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO execution_events (id, run_id, session_id, node_id, execution_order,
                                           timestamp, event_type, event_subtype, parent_event_id,
                                           agent_name, duration_ms, status, error_message,
                                           cost_usd, payload)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(&event.run_id)
        .bind(&event.session_id)
        .bind(&event.node_id)
        .bind(event.execution_order)
        .bind(event.timestamp.to_rfc3339())
        .bind(event.event_type().as_str())
        .bind(event.subtype.map(|s| s.as_str()))
        .bind(&event.parent_event_id)
        .bind(&event.agent_name)
        .bind(event.duration_ms)
        .bind(&event.status)
        .bind(&event.error_message)
        .bind(event.cost_usd)
        .bind(payload)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn max_order(pool: &DatabasePool, run_id: &str) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(execution_order), 0) FROM execution_events WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_one(pool)
        .await?;
        Ok(row.0)
    }

    pub async fn by_id(pool: &DatabasePool, id: &str) -> Result<Option<EventRow>, sqlx::Error> {
        sqlx::query_as::<_, EventRow>("SELECT * FROM execution_events WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn for_run(
        pool: &DatabasePool,
        run_id: &str,
        event_type: Option<&str>,
        since_order: Option<i64>,
    ) -> Result<Vec<EventRow>, sqlx::Error> {
        match (event_type, since_order) {
            (Some(event_type), Some(since)) => {
                sqlx::query_as::<_, EventRow>(
                    "SELECT * FROM execution_events
                     WHERE run_id = ? AND event_type = ? AND execution_order > ?
                     ORDER BY execution_order",
                )
                .bind(run_id)
                .bind(event_type)
                .bind(since)
                .fetch_all(pool)
                .await
            }
            (Some(event_type), None) => {
                sqlx::query_as::<_, EventRow>(
                    "SELECT * FROM execution_events
                     WHERE run_id = ? AND event_type = ?
                     ORDER BY execution_order",
                )
                .bind(run_id)
                .bind(event_type)
                .fetch_all(pool)
                .await
            }
            (None, Some(since)) => {
                sqlx::query_as::<_, EventRow>(
                    "SELECT * FROM execution_events
                     WHERE run_id = ? AND execution_order > ?
                     ORDER BY execution_order",
                )
                .bind(run_id)
                .bind(since)
                .fetch_all(pool)
                .await
            }
            (None, None) => {
                sqlx::query_as::<_, EventRow>(
                    "SELECT * FROM execution_events WHERE run_id = ?
                     ORDER BY execution_order",
                )
                .bind(run_id)
                .fetch_all(pool)
                .await
            }
        }
    }

    pub async fn for_node(
        pool: &DatabasePool,
        node_id: &str,
        run_id: &str,
        event_type: Option<&str>,
    ) -> Result<Vec<EventRow>, sqlx::Error> {
        match event_type {
            Some(event_type) => {
                sqlx::query_as::<_, EventRow>(
                    "SELECT * FROM execution_events
                     WHERE node_id = ? AND run_id = ? AND event_type = ?
                     ORDER BY execution_order",
                )
                .bind(node_id)
                .bind(run_id)
                .bind(event_type)
                .fetch_all(pool)
                .await
            }
            None => {
                sqlx::query_as::<_, EventRow>(
                    "SELECT * FROM execution_events
                     WHERE node_id = ? AND run_id = ?
                     ORDER BY execution_order",
                )
                .bind(node_id)
                .bind(run_id)
                .fetch_all(pool)
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DatabaseConnection;
    use crate::repositories::{RunRepository, SessionRepository};
    use agentflow_core::event::EventBody;
    use agentflow_core::model::{RunMode, SessionRecord, WorkflowRun};

    async fn setup() -> (DatabaseConnection, WorkflowRun) {
        let conn = DatabaseConnection::connect("sqlite::memory:").await.unwrap();
        let session = SessionRecord::new("s");
        SessionRepository::insert(conn.pool(), &session).await.unwrap();
        let run = WorkflowRun::new(&session.id, "t", RunMode::OneShot);
        RunRepository::insert(conn.pool(), &run).await.unwrap();
        (conn, run)
    }

    fn heartbeat(run: &WorkflowRun, order: i64) -> ExecutionEvent {
        let mut event = ExecutionEvent::new(&run.id, &run.session_id, EventBody::Heartbeat);
        event.execution_order = order;
        event
    }

    #[tokio::test]
    async fn insert_and_query_ordered() {
        let (conn, run) = setup().await;
        for order in 1..=3 {
            let event = heartbeat(&run, order);
            let payload = serde_json::to_string(&event.body).unwrap();
            EventRepository::insert(conn.pool(), &event, &payload).await.unwrap();
        }

        assert_eq!(EventRepository::max_order(conn.pool(), &run.id).await.unwrap(), 3);

        let rows = EventRepository::for_run(conn.pool(), &run.id, None, Some(1))
            .await
            .unwrap();
        let orders: Vec<i64> = rows.iter().map(|r| r.execution_order).collect();
        assert_eq!(orders, vec![2, 3]);
    }

    #[tokio::test]
    async fn duplicate_order_rejected_by_unique_index() {
        let (conn, run) = setup().await;
        let event = heartbeat(&run, 1);
        let payload = serde_json::to_string(&event.body).unwrap();
        EventRepository::insert(conn.pool(), &event, &payload).await.unwrap();

        let clash = heartbeat(&run, 1);
        let payload = serde_json::to_string(&clash.body).unwrap();
        assert!(EventRepository::insert(conn.pool(), &clash, &payload)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn max_order_defaults_to_zero() {
        let (conn, run) = setup().await;
        assert_eq!(EventRepository::max_order(conn.pool(), &run.id).await.unwrap(), 0);
    }
}

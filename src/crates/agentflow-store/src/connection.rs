//! Database connection management
//!
//! Wraps the SQLite pool with connect/migrate/health-check helpers. Foreign
//! keys are enabled on every connection so session deletion cascades.

use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

/// Type alias for the database connection pool.
pub type DatabasePool = SqlitePool;

/// Shared handle to the SQLite pool.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Arc<DatabasePool>,
}

impl DatabaseConnection {
    /// Connect to `database_url` (e.g. `sqlite:flow.db` or
    /// `sqlite::memory:`) and run pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::connect_with(database_url, 5).await
    }

    /// Connect with a custom pool size.
    ///
    /// In-memory databases are pinned to a single connection: every SQLite
    /// `:memory:` connection is a separate database, so a wider pool would
    /// scatter tables across connections.
    pub async fn connect_with(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            max_connections
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let conn = Self {
            pool: Arc::new(pool),
        };
        conn.run_migrations().await?;
        Ok(conn)
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(self.pool.as_ref())
            .await
            .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
    }

    /// Cheap liveness probe.
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").fetch_one(self.pool.as_ref()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_connect_and_migrate() {
        let conn = DatabaseConnection::connect("sqlite::memory:").await.unwrap();
        conn.health_check().await.unwrap();

        // Migrations created the event log table.
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM execution_events")
                .fetch_one(conn.pool())
                .await
                .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let conn = DatabaseConnection::connect("sqlite::memory:").await.unwrap();

        let result = sqlx::query(
            "INSERT INTO runs (id, session_id, task, mode, created_at)
             VALUES ('r1', 'missing-session', 't', 'one_shot', '2026-01-01T00:00:00Z')",
        )
        .execute(conn.pool())
        .await;

        assert!(result.is_err());
    }
}

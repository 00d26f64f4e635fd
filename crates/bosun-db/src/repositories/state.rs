//! PostgreSQL implementation of SchedulerStateStore.

use async_trait::async_trait;
use bosun_core::ports::SchedulerStateStore;
use bosun_core::{Error, Result};
use sqlx::{PgPool, Row};

/// PostgreSQL implementation of SchedulerStateStore.
pub struct PgSchedulerStateRepository {
    pool: PgPool,
}

impl PgSchedulerStateRepository {
    /// Create a new PgSchedulerStateRepository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchedulerStateStore for PgSchedulerStateRepository {
    async fn get_state(
        &self,
        scheduler: &str,
        kind: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query(
            "SELECT value FROM scheduler_state WHERE scheduler_name = $1 AND kind = $2 AND key = $3",
        )
        .bind(scheduler)
        .bind(kind)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.map(|r| r.get("value")))
    }

    async fn set_state(
        &self,
        scheduler: &str,
        kind: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO scheduler_state (scheduler_name, kind, key, value)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (scheduler_name, kind, key)
               DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()"#,
        )
        .bind(scheduler)
        .bind(kind)
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}

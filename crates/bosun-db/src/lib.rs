//! Store adapters for Bosun: an in-process store and PostgreSQL repositories.

pub mod memory;
pub mod repositories;

pub use memory::MemoryStore;
pub use repositories::*;

use bosun_core::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| bosun_core::Error::Database(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| bosun_core::Error::Database(e.to_string()))?;
        Ok(())
    }

    pub fn changes(&self) -> PgChangeRepository {
        PgChangeRepository::new(self.pool.clone())
    }

    pub fn build_requests(&self) -> PgBuildRequestRepository {
        PgBuildRequestRepository::new(self.pool.clone())
    }

    pub fn scheduler_state(&self) -> PgSchedulerStateRepository {
        PgSchedulerStateRepository::new(self.pool.clone())
    }
}

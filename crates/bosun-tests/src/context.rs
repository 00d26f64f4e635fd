//! Running masters and databases for tests.

use crate::containers::PostgresContainer;
use crate::fixtures::RecordingExecutor;
use bosun_db::{Database, MemoryStore};
use bosun_scheduler::{LocalEventBus, Master, MasterConfig, Stores};
use std::sync::Arc;

/// A master on the in-process store with a recording executor.
pub struct MasterHarness {
    pub master: Arc<Master>,
    pub executor: Arc<RecordingExecutor>,
    pub store: Arc<MemoryStore>,
}

impl MasterHarness {
    /// Start a master from a YAML configuration.
    pub async fn start(config_yaml: &str) -> anyhow::Result<Self> {
        crate::init_test_logging();

        let config = MasterConfig::from_yaml(config_yaml)?;
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(RecordingExecutor::new());
        let master = Master::start(
            &config,
            Stores::shared(store.clone()),
            Arc::new(LocalEventBus::new()),
            executor.clone(),
        )
        .await?;

        Ok(Self {
            master,
            executor,
            store,
        })
    }

    pub async fn stop(self) {
        self.master.shutdown().await;
    }
}

/// A migrated PostgreSQL database in a container.
///
/// Drop this to stop the container.
pub struct PgContext {
    pub postgres: PostgresContainer,
    pub db: Database,
}

impl PgContext {
    pub async fn start() -> anyhow::Result<Self> {
        crate::init_test_logging();

        let postgres = PostgresContainer::start().await?;
        let db = Database::connect(postgres.connection_string()).await?;
        db.migrate().await?;

        Ok(Self { postgres, db })
    }

    pub fn db_url(&self) -> &str {
        self.postgres.connection_string()
    }
}

//! PostgreSQL in a container for store integration tests.

use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

const DB_NAME: &str = "bosun";
const DB_USER: &str = "bosun";
const DB_PASSWORD: &str = "bosun";

/// A throwaway `bosun` database. The container stops when this is dropped.
pub struct PostgresContainer {
    _container: ContainerAsync<Postgres>,
    url: String,
}

impl PostgresContainer {
    pub async fn start() -> anyhow::Result<Self> {
        let container = Postgres::default()
            .with_db_name(DB_NAME)
            .with_user(DB_USER)
            .with_password(DB_PASSWORD)
            .with_tag("16-alpine")
            .start()
            .await?;

        let url = format!(
            "postgres://{DB_USER}:{DB_PASSWORD}@{}:{}/{DB_NAME}",
            container.get_host().await?,
            container.get_host_port_ipv4(5432).await?,
        );
        Ok(Self {
            _container: container,
            url,
        })
    }

    pub fn connection_string(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_postgres_container_starts() {
        let pg = PostgresContainer::start().await.unwrap();
        assert!(pg.connection_string().ends_with("/bosun"));
    }
}

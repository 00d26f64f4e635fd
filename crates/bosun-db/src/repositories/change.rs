//! PostgreSQL implementation of ChangeStore.

use async_trait::async_trait;
use bosun_core::change::{Change, NewChange};
use bosun_core::ports::ChangeStore;
use bosun_core::properties::Properties;
use bosun_core::{Error, Result};
use chrono::Utc;
use sqlx::{PgPool, Row};

const CHANGE_COLUMNS: &str = "number, who, files, comments, branch, revision, category, project, repository, codebase, when_at, properties";

/// PostgreSQL implementation of ChangeStore.
pub struct PgChangeRepository {
    pool: PgPool,
}

impl PgChangeRepository {
    /// Create a new PgChangeRepository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_change(r: &sqlx::postgres::PgRow) -> Result<Change> {
        let files: Vec<String> = serde_json::from_value(r.get("files"))?;
        let properties: Properties = serde_json::from_value(r.get("properties"))?;

        Ok(Change {
            number: r.get::<i64, _>("number") as u64,
            who: r.get("who"),
            files,
            comments: r.get("comments"),
            branch: r.get("branch"),
            revision: r.get("revision"),
            category: r.get("category"),
            project: r.get("project"),
            repository: r.get("repository"),
            codebase: r.get("codebase"),
            when: r.get("when_at"),
            properties,
        })
    }
}

#[async_trait]
impl ChangeStore for PgChangeRepository {
    async fn add_change(&self, change: NewChange) -> Result<Change> {
        let when = change.when.unwrap_or_else(Utc::now);
        let files = serde_json::to_value(&change.files)?;
        let properties = serde_json::to_value(&change.properties)?;

        let row = sqlx::query(&format!(
            r#"INSERT INTO changes (who, files, comments, branch, revision, category, project, repository, codebase, when_at, properties)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               RETURNING {CHANGE_COLUMNS}"#
        ))
        .bind(&change.who)
        .bind(&files)
        .bind(&change.comments)
        .bind(&change.branch)
        .bind(&change.revision)
        .bind(&change.category)
        .bind(&change.project)
        .bind(&change.repository)
        .bind(&change.codebase)
        .bind(when)
        .bind(&properties)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Self::row_to_change(&row)
    }

    async fn get_change(&self, number: u64) -> Result<Option<Change>> {
        let row = sqlx::query(&format!(
            "SELECT {CHANGE_COLUMNS} FROM changes WHERE number = $1"
        ))
        .bind(number as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::row_to_change(&r)?)),
            None => Ok(None),
        }
    }

    async fn get_changes(&self, numbers: &[u64]) -> Result<Vec<Change>> {
        let wanted: Vec<i64> = numbers.iter().map(|&n| n as i64).collect();
        let rows = sqlx::query(&format!(
            "SELECT {CHANGE_COLUMNS} FROM changes WHERE number = ANY($1)"
        ))
        .bind(&wanted)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let found = rows
            .iter()
            .map(Self::row_to_change)
            .collect::<Result<Vec<_>>>()?;

        numbers
            .iter()
            .map(|&n| {
                found
                    .iter()
                    .find(|c| c.number == n)
                    .cloned()
                    .ok_or(Error::ChangeNotFound(n))
            })
            .collect()
    }

    async fn last_change_number(&self) -> Result<Option<u64>> {
        let row = sqlx::query("SELECT MAX(number) AS last FROM changes")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.get::<Option<i64>, _>("last").map(|n| n as u64))
    }
}

//! PostgreSQL implementation of BuildRequestStore.
//!
//! Multi-request operations lock the affected rows with `FOR UPDATE` inside a
//! transaction, so concurrent masters serialize on the rows they touch.

use async_trait::async_trait;
use bosun_core::buildset::{
    BuildRequest, BuildRequestFilter, BuildSet, BuildSetCreated, BuildSetSubmission,
    CompletedBuildSet, Results,
};
use bosun_core::ids::*;
use bosun_core::ports::BuildRequestStore;
use bosun_core::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::BTreeSet;
use tracing::debug;
use uuid::Uuid;

const BUILDSET_COLUMNS: &str = "id, scheduler_name, sourcestamps, reason, properties, builder_names, external_idstring, parent_build_id, submitted_at, complete, complete_at, results";
const REQUEST_COLUMNS: &str = "id, buildset_id, builder_name, priority, submitted_at, claimed_at, claimed_by, complete, complete_at, results";

/// PostgreSQL implementation of BuildRequestStore.
pub struct PgBuildRequestRepository {
    pool: PgPool,
}

impl PgBuildRequestRepository {
    /// Create a new PgBuildRequestRepository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn str_to_results(s: Option<String>) -> Option<Results> {
        s.as_deref().and_then(Results::parse)
    }

    fn row_to_buildset(r: &sqlx::postgres::PgRow) -> Result<BuildSet> {
        Ok(BuildSet {
            id: BuildSetId::from_uuid(r.get::<Uuid, _>("id")),
            scheduler_name: r.get("scheduler_name"),
            sourcestamps: serde_json::from_value(r.get("sourcestamps"))?,
            reason: r.get("reason"),
            properties: serde_json::from_value(r.get("properties"))?,
            builder_names: serde_json::from_value(r.get("builder_names"))?,
            external_idstring: r.get("external_idstring"),
            parent_build_id: r
                .get::<Option<Uuid>, _>("parent_build_id")
                .map(BuildId::from_uuid),
            submitted_at: r.get("submitted_at"),
            complete: r.get("complete"),
            complete_at: r.get("complete_at"),
            results: Self::str_to_results(r.get("results")),
        })
    }

    fn row_to_request(r: &sqlx::postgres::PgRow) -> BuildRequest {
        BuildRequest {
            id: BuildRequestId::from_uuid(r.get::<Uuid, _>("id")),
            buildset_id: BuildSetId::from_uuid(r.get::<Uuid, _>("buildset_id")),
            builder_name: r.get("builder_name"),
            priority: r.get("priority"),
            submitted_at: r.get("submitted_at"),
            claimed_at: r.get("claimed_at"),
            claimed_by: r.get::<Option<Uuid>, _>("claimed_by").map(MasterId::from_uuid),
            complete: r.get("complete"),
            complete_at: r.get("complete_at"),
            results: Self::str_to_results(r.get("results")),
        }
    }

    fn unique_uuids(ids: &[BuildRequestId]) -> Vec<Uuid> {
        ids.iter()
            .map(|id| *id.as_uuid())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Lock the given requests, failing if any is unknown.
    async fn lock_requests(
        tx: &mut Transaction<'_, Postgres>,
        uuids: &[Uuid],
    ) -> Result<Vec<BuildRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM buildrequests WHERE id = ANY($1) ORDER BY id FOR UPDATE"
        ))
        .bind(uuids)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let requests: Vec<BuildRequest> = rows.iter().map(Self::row_to_request).collect();
        if let Some(missing) = uuids
            .iter()
            .find(|u| !requests.iter().any(|r| r.id.as_uuid() == *u))
        {
            return Err(Error::BuildRequestNotFound(
                BuildRequestId::from_uuid(*missing).to_string(),
            ));
        }
        Ok(requests)
    }

    async fn derive_completion(
        tx: &mut Transaction<'_, Postgres>,
        bsid: Uuid,
        complete_at: DateTime<Utc>,
    ) -> Result<Option<CompletedBuildSet>> {
        let row = sqlx::query("SELECT complete, scheduler_name FROM buildsets WHERE id = $1 FOR UPDATE")
            .bind(bsid)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        if row.get::<bool, _>("complete") {
            return Ok(None);
        }
        let scheduler_name: Option<String> = row.get("scheduler_name");

        let children = sqlx::query("SELECT complete, results FROM buildrequests WHERE buildset_id = $1")
            .bind(bsid)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        if children.iter().any(|c| !c.get::<bool, _>("complete")) {
            return Ok(None);
        }
        let results = Results::worst_of(
            children
                .iter()
                .filter_map(|c| Self::str_to_results(c.get("results"))),
        );

        sqlx::query("UPDATE buildsets SET complete = TRUE, complete_at = $2, results = $3 WHERE id = $1")
            .bind(bsid)
            .bind(complete_at)
            .bind(results.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Some(CompletedBuildSet {
            buildset_id: BuildSetId::from_uuid(bsid),
            scheduler_name,
            results,
            complete_at,
        }))
    }
}

#[async_trait]
impl BuildRequestStore for PgBuildRequestRepository {
    async fn add_buildset(
        &self,
        submission: &BuildSetSubmission,
        submitted_at: DateTime<Utc>,
    ) -> Result<BuildSetCreated> {
        if submission.builder_names.is_empty() {
            return Err(Error::InvalidInput("buildset has no builders".into()));
        }
        let buildset_id = BuildSetId::new();
        let sourcestamps = serde_json::to_value(&submission.sourcestamps)?;
        let properties = serde_json::to_value(&submission.properties)?;
        let builder_names = serde_json::to_value(&submission.builder_names)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO buildsets (id, scheduler_name, sourcestamps, reason, properties, builder_names, external_idstring, parent_build_id, submitted_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(buildset_id.as_uuid())
        .bind(&submission.scheduler_name)
        .bind(&sourcestamps)
        .bind(&submission.reason)
        .bind(&properties)
        .bind(&builder_names)
        .bind(&submission.external_idstring)
        .bind(submission.parent_build_id.map(|id| *id.as_uuid()))
        .bind(submitted_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let mut requests = Vec::with_capacity(submission.builder_names.len());
        for builder in &submission.builder_names {
            let id = BuildRequestId::new();
            sqlx::query(
                "INSERT INTO buildrequests (id, buildset_id, builder_name, priority, submitted_at) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(id.as_uuid())
            .bind(buildset_id.as_uuid())
            .bind(builder)
            .bind(submission.priority)
            .bind(submitted_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
            requests.push((builder.clone(), id));
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(BuildSetCreated {
            buildset_id,
            requests,
        })
    }

    async fn get_buildset(&self, id: BuildSetId) -> Result<Option<BuildSet>> {
        let row = sqlx::query(&format!("SELECT {BUILDSET_COLUMNS} FROM buildsets WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::row_to_buildset(&r)?)),
            None => Ok(None),
        }
    }

    async fn list_buildsets(&self, complete: Option<bool>) -> Result<Vec<BuildSet>> {
        let rows = sqlx::query(&format!(
            "SELECT {BUILDSET_COLUMNS} FROM buildsets WHERE ($1::BOOLEAN IS NULL OR complete = $1) ORDER BY submitted_at, seq"
        ))
        .bind(complete)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_buildset).collect()
    }

    async fn get_build_request(&self, id: BuildRequestId) -> Result<Option<BuildRequest>> {
        let row = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM buildrequests WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.as_ref().map(Self::row_to_request))
    }

    async fn list_build_requests(&self, filter: &BuildRequestFilter) -> Result<Vec<BuildRequest>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {REQUEST_COLUMNS} FROM buildrequests
               WHERE ($1::TEXT IS NULL OR builder_name = $1)
                 AND ($2::UUID IS NULL OR buildset_id = $2)
                 AND ($3::BOOLEAN IS NULL OR (claimed_by IS NOT NULL) = $3)
                 AND ($4::BOOLEAN IS NULL OR complete = $4)
                 AND ($5::UUID IS NULL OR claimed_by = $5)
               ORDER BY submitted_at, seq"#
        ))
        .bind(&filter.builder_name)
        .bind(filter.buildset_id.map(|id| *id.as_uuid()))
        .bind(filter.claimed)
        .bind(filter.complete)
        .bind(filter.claimed_by.map(|id| *id.as_uuid()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::row_to_request).collect())
    }

    async fn claim_build_requests(
        &self,
        ids: &[BuildRequestId],
        claimed_at: DateTime<Utc>,
        master: MasterId,
    ) -> Result<()> {
        let uuids = Self::unique_uuids(ids);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        for request in Self::lock_requests(&mut tx, &uuids).await? {
            if request.complete {
                return Err(Error::AlreadyComplete(request.id.to_string()));
            }
            if request.claimed_by.is_some_and(|owner| owner != master) {
                return Err(Error::AlreadyClaimed(request.id.to_string()));
            }
        }

        sqlx::query("UPDATE buildrequests SET claimed_by = $2, claimed_at = $3 WHERE id = ANY($1)")
            .bind(&uuids)
            .bind(master.as_uuid())
            .bind(claimed_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn reclaim_build_requests(
        &self,
        ids: &[BuildRequestId],
        master: MasterId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let uuids = Self::unique_uuids(ids);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        for request in Self::lock_requests(&mut tx, &uuids).await? {
            if !request.is_claimed_by(master) {
                return Err(Error::ClaimLost(request.id.to_string()));
            }
        }

        sqlx::query("UPDATE buildrequests SET claimed_at = $2 WHERE id = ANY($1)")
            .bind(&uuids)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn unclaim_build_requests(&self, ids: &[BuildRequestId], master: MasterId) -> Result<()> {
        let uuids = Self::unique_uuids(ids);
        sqlx::query(
            "UPDATE buildrequests SET claimed_by = NULL, claimed_at = NULL WHERE id = ANY($1) AND claimed_by = $2 AND complete = FALSE",
        )
        .bind(&uuids)
        .bind(master.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn complete_build_requests(
        &self,
        ids: &[BuildRequestId],
        results: Results,
        complete_at: DateTime<Utc>,
    ) -> Result<Vec<CompletedBuildSet>> {
        let uuids = Self::unique_uuids(ids);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut buildsets = BTreeSet::new();
        for request in Self::lock_requests(&mut tx, &uuids).await? {
            if request.complete {
                return Err(Error::AlreadyComplete(request.id.to_string()));
            }
            if request.claimed_by.is_none() {
                return Err(Error::NotClaimed(request.id.to_string()));
            }
            buildsets.insert(*request.buildset_id.as_uuid());
        }

        sqlx::query(
            "UPDATE buildrequests SET complete = TRUE, complete_at = $2, results = $3 WHERE id = ANY($1)",
        )
        .bind(&uuids)
        .bind(complete_at)
        .bind(results.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let mut completed = Vec::new();
        for bsid in buildsets {
            if let Some(done) = Self::derive_completion(&mut tx, bsid, complete_at).await? {
                completed.push(done);
            }
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(completed)
    }

    async fn unclaim_expired(&self, claimed_before: DateTime<Utc>) -> Result<Vec<BuildRequestId>> {
        let rows = sqlx::query(
            r#"UPDATE buildrequests SET claimed_by = NULL, claimed_at = NULL
               WHERE complete = FALSE AND claimed_at < $1
               RETURNING id"#,
        )
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let released: Vec<BuildRequestId> = rows
            .iter()
            .map(|r| BuildRequestId::from_uuid(r.get::<Uuid, _>("id")))
            .collect();
        if !released.is_empty() {
            debug!(count = released.len(), %claimed_before, "Released expired claims");
        }
        Ok(released)
    }
}

//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the core domain and external adapters.

use crate::build::{BuildAssignment, StartOutcome};
use crate::buildset::{
    BuildRequest, BuildRequestFilter, BuildSet, BuildSetCreated, BuildSetSubmission,
    CompletedBuildSet, Results,
};
use crate::change::{Change, NewChange};
use crate::events::Event;
use crate::ids::*;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `buildset.completed.*`, `request.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Store of numbered changes.
#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// Record a change, assigning the next change number.
    async fn add_change(&self, change: NewChange) -> Result<Change>;

    /// Get a change by number.
    async fn get_change(&self, number: u64) -> Result<Option<Change>>;

    /// Get changes in the given order. Fails if any number is unknown.
    async fn get_changes(&self, numbers: &[u64]) -> Result<Vec<Change>>;

    /// Highest change number assigned so far.
    async fn last_change_number(&self) -> Result<Option<u64>>;
}

/// Durable buildset/build request queue.
///
/// This is the only place mutual exclusion between coordinators is enforced.
/// Every multi-request operation is all-or-nothing.
#[async_trait]
pub trait BuildRequestStore: Send + Sync {
    /// Create a buildset and one request per builder name, atomically.
    async fn add_buildset(
        &self,
        submission: &BuildSetSubmission,
        submitted_at: DateTime<Utc>,
    ) -> Result<BuildSetCreated>;

    /// Get a buildset by ID.
    async fn get_buildset(&self, id: BuildSetId) -> Result<Option<BuildSet>>;

    /// List buildsets, optionally by completeness, oldest first.
    async fn list_buildsets(&self, complete: Option<bool>) -> Result<Vec<BuildSet>>;

    /// Get a build request by ID.
    async fn get_build_request(&self, id: BuildRequestId) -> Result<Option<BuildRequest>>;

    /// List build requests matching a filter, oldest first.
    async fn list_build_requests(&self, filter: &BuildRequestFilter) -> Result<Vec<BuildRequest>>;

    /// Claim requests for `master`. Fails without effect if any request is
    /// complete or held by another master. Requests already held by `master`
    /// have their claim time refreshed.
    async fn claim_build_requests(
        &self,
        ids: &[BuildRequestId],
        claimed_at: DateTime<Utc>,
        master: MasterId,
    ) -> Result<()>;

    /// Refresh claims this master still owns. Fails with `ClaimLost` if any
    /// request is no longer held by `master`.
    async fn reclaim_build_requests(
        &self,
        ids: &[BuildRequestId],
        master: MasterId,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Release requests held by `master` back to the pool. Requests held by
    /// another master or already complete are left alone.
    async fn unclaim_build_requests(&self, ids: &[BuildRequestId], master: MasterId) -> Result<()>;

    /// Mark claimed requests complete. Returns the buildsets that became
    /// complete as a result.
    async fn complete_build_requests(
        &self,
        ids: &[BuildRequestId],
        results: Results,
        complete_at: DateTime<Utc>,
    ) -> Result<Vec<CompletedBuildSet>>;

    /// Release every incomplete request claimed before `claimed_before`.
    async fn unclaim_expired(&self, claimed_before: DateTime<Utc>) -> Result<Vec<BuildRequestId>>;
}

/// Small persisted key-value state per scheduler.
#[async_trait]
pub trait SchedulerStateStore: Send + Sync {
    async fn get_state(
        &self,
        scheduler: &str,
        kind: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>>;

    async fn set_state(
        &self,
        scheduler: &str,
        kind: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()>;
}

/// The execution layer that actually runs builds on workers.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Ask a worker to start a build.
    async fn start_build(&self, assignment: &BuildAssignment) -> Result<StartOutcome>;

    /// Signal a running build to stop. Best effort.
    async fn cancel_build(&self, build_id: BuildId, reason: &str) -> Result<()>;
}

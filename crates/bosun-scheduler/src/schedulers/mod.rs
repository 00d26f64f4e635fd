//! The scheduler family.
//!
//! Each scheduler is a state machine driven by its actor (see
//! [`crate::supervisor`]): changes and bus events go in, timers fire at
//! [`Scheduler::next_wakeup`], and buildsets come out through the
//! [`Submitter`](crate::submit::Submitter). Every method that depends on time
//! takes `now` explicitly.

mod any_branch;
mod dependent;
pub mod jobfile;
mod nightly;
mod pending;
mod periodic;
mod single_branch;
mod triggerable;
mod try_sched;

pub use any_branch::AnyBranchScheduler;
pub use dependent::DependentScheduler;
pub use nightly::NightlyScheduler;
pub use pending::PendingChanges;
pub use periodic::PeriodicScheduler;
pub use single_branch::SingleBranchScheduler;
pub use triggerable::TriggerableScheduler;
pub use try_sched::{TryJobdirScheduler, TryUserpassScheduler};

use crate::submit::{Stores, Submitter};
use async_trait::async_trait;
use bosun_core::buildset::{BuildSetCreated, BuildSetSubmission};
use bosun_core::change::Change;
use bosun_core::events::Event;
use bosun_core::ids::BuildId;
use bosun_core::properties::Properties;
use bosun_core::sourcestamp::{Patch, SourceStamp};
use bosun_core::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Concrete scheduler variant. Schedulers are matched across
/// reconfigurations by `(name, kind)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    SingleBranch,
    AnyBranch,
    Nightly,
    Periodic,
    Dependent,
    Triggerable,
    TryJobdir,
    TryUserpass,
}

impl SchedulerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::SingleBranch => "single_branch",
            SchedulerKind::AnyBranch => "any_branch",
            SchedulerKind::Nightly => "nightly",
            SchedulerKind::Periodic => "periodic",
            SchedulerKind::Dependent => "dependent",
            SchedulerKind::Triggerable => "triggerable",
            SchedulerKind::TryJobdir => "try_jobdir",
            SchedulerKind::TryUserpass => "try_userpass",
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names and kinds of the currently active schedulers, shared read-only
/// with schedulers that look up peers by name.
#[derive(Clone, Default)]
pub struct SchedulerDirectory(Arc<RwLock<BTreeMap<String, SchedulerKind>>>);

impl SchedulerDirectory {
    pub fn contains(&self, name: &str) -> bool {
        self.0.read().contains_key(name)
    }

    pub fn kind_of(&self, name: &str) -> Option<SchedulerKind> {
        self.0.read().get(name).copied()
    }

    pub fn replace(&self, entries: BTreeMap<String, SchedulerKind>) {
        *self.0.write() = entries;
    }
}

/// What a scheduler may touch while handling input.
#[derive(Clone)]
pub struct SchedulerContext {
    pub stores: Stores,
    pub submitter: Submitter,
    pub directory: SchedulerDirectory,
}

/// Default source for a codebase when no change names it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodebaseConfig {
    pub repository: String,
    pub project: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
}

/// Settings common to every scheduler.
#[derive(Debug, Clone)]
pub struct BaseConfig {
    pub name: String,
    pub builder_names: Vec<String>,
    pub properties: Properties,
    /// Never empty; defaults to the single unnamed codebase.
    pub codebases: BTreeMap<String, CodebaseConfig>,
}

impl BaseConfig {
    pub fn new(name: impl Into<String>, builder_names: Vec<String>) -> Self {
        let mut codebases = BTreeMap::new();
        codebases.insert(String::new(), CodebaseConfig::default());
        Self {
            name: name.into(),
            builder_names,
            properties: Properties::new(),
            codebases,
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_codebases(mut self, codebases: BTreeMap<String, CodebaseConfig>) -> Self {
        if !codebases.is_empty() {
            self.codebases = codebases;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("scheduler name must not be empty".into()));
        }
        if self.builder_names.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "scheduler '{}' has no builders",
                self.name
            )));
        }
        Ok(())
    }

    /// Whether changes on `codebase` concern this scheduler.
    pub fn accepts_codebase(&self, change: &Change) -> bool {
        if self.codebases.contains_key(&change.codebase) {
            return true;
        }
        debug!(
            scheduler = %self.name,
            change = change.number,
            codebase = %change.codebase,
            "Ignoring change on unconfigured codebase"
        );
        false
    }

    fn default_stamp(&self, codebase: &str, config: &CodebaseConfig) -> SourceStamp {
        SourceStamp::new(codebase)
            .with_repository(config.repository.clone())
            .with_project(config.project.clone())
            .with_branch(config.branch.clone())
            .with_revision(config.revision.clone())
    }

    /// One stamp per configured codebase, built from that codebase's changes
    /// or from its defaults.
    pub fn stamps_from_changes(&self, changes: &[Change]) -> Result<Vec<SourceStamp>> {
        self.codebases
            .iter()
            .map(|(codebase, config)| {
                let mine: Vec<Change> = changes
                    .iter()
                    .filter(|c| &c.codebase == codebase)
                    .cloned()
                    .collect();
                if mine.is_empty() {
                    Ok(self.default_stamp(codebase, config))
                } else {
                    SourceStamp::from_changes(codebase.clone(), mine)
                }
            })
            .collect()
    }

    /// Complete caller-supplied stamps with codebase defaults. Stamps for
    /// unconfigured codebases are dropped.
    pub fn complete_stamps(&self, given: Vec<SourceStamp>) -> Vec<SourceStamp> {
        let mut by_codebase: BTreeMap<String, SourceStamp> = BTreeMap::new();
        for ss in given {
            if self.codebases.contains_key(&ss.codebase) {
                by_codebase.insert(ss.codebase.clone(), ss);
            } else {
                debug!(scheduler = %self.name, codebase = %ss.codebase, "Dropping stamp for unconfigured codebase");
            }
        }
        self.codebases
            .iter()
            .map(|(codebase, config)| {
                by_codebase
                    .remove(codebase)
                    .unwrap_or_else(|| self.default_stamp(codebase, config))
            })
            .collect()
    }

    /// A submission carrying this scheduler's identity and base properties.
    pub fn submission(
        &self,
        sourcestamps: Vec<SourceStamp>,
        reason: String,
        extra: Option<&Properties>,
    ) -> BuildSetSubmission {
        let mut properties = self.properties.clone();
        if let Some(extra) = extra {
            properties.update(extra);
        }
        properties.set("scheduler", self.name.clone(), "Scheduler");
        BuildSetSubmission::new(self.builder_names.clone(), sourcestamps)
            .with_scheduler(self.name.clone())
            .with_reason(reason)
            .with_properties(properties)
    }
}

/// A trigger request for a triggerable scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub sourcestamps: Vec<SourceStamp>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub parent_build_id: Option<BuildId>,
}

/// A manually submitted try job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TryJob {
    pub jobid: String,
    #[serde(default)]
    pub who: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub codebase: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub patch: Option<Patch>,
    /// Empty means every builder the scheduler allows.
    #[serde(default)]
    pub builder_names: Vec<String>,
    #[serde(default)]
    pub properties: Properties,
}

/// Credentials presented with an RPC try submission.
#[derive(Debug, Clone)]
pub struct TryCredentials {
    pub username: String,
    pub password: String,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    fn base(&self) -> &BaseConfig;

    fn kind(&self) -> SchedulerKind;

    fn name(&self) -> &str {
        &self.base().name
    }

    /// Names of schedulers this one reacts to.
    fn upstreams(&self) -> Vec<String> {
        Vec::new()
    }

    /// Called once before the first input, with transferred or persisted
    /// state (or `None` on first start).
    async fn activate(
        &mut self,
        ctx: &SchedulerContext,
        state: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Snapshot of the state to persist or transfer.
    fn export_state(&self) -> serde_json::Value;

    async fn on_change(
        &mut self,
        _ctx: &SchedulerContext,
        _change: &Change,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_event(
        &mut self,
        _ctx: &SchedulerContext,
        _event: &Event,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        Ok(())
    }

    /// When the scheduler next wants [`Scheduler::on_timer`], if ever.
    fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        None
    }

    async fn on_timer(&mut self, _ctx: &SchedulerContext, _now: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    async fn trigger(
        &mut self,
        _ctx: &SchedulerContext,
        _request: TriggerRequest,
    ) -> Result<BuildSetCreated> {
        Err(Error::NotTriggerable(self.name().to_string()))
    }

    async fn submit_try(
        &mut self,
        _ctx: &SchedulerContext,
        _job: TryJob,
        _credentials: Option<TryCredentials>,
    ) -> Result<BuildSetCreated> {
        Err(Error::InvalidInput(format!(
            "scheduler '{}' does not accept try jobs",
            self.name()
        )))
    }
}

/// Change numbers as persisted in scheduler state.
pub(crate) fn numbers(changes: &[Change]) -> Vec<u64> {
    changes.iter().map(|c| c.number).collect()
}

/// Merge important and unimportant changes back into arrival order.
pub(crate) fn in_arrival_order(important: Vec<Change>, unimportant: Vec<Change>) -> Vec<Change> {
    let mut seen = BTreeSet::new();
    let mut all: Vec<Change> = important
        .into_iter()
        .chain(unimportant)
        .filter(|c| seen.insert(c.number))
        .collect();
    all.sort_by_key(|c| c.number);
    all
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::bus::LocalEventBus;
    use bosun_core::buildset::{BuildRequest, BuildRequestFilter, BuildSet, CompletedBuildSet, Results};
    use bosun_core::change::NewChange;
    use bosun_core::ids::{BuildRequestId, BuildSetId, MasterId};
    use bosun_core::ports::{BuildRequestStore, ChangeStore};
    use bosun_db::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn check(failing: &AtomicBool, what: &str) -> Result<()> {
        if failing.load(Ordering::SeqCst) {
            return Err(Error::Database(format!("{what} unavailable")));
        }
        Ok(())
    }

    /// Change store whose lookups fail while `failing` is set.
    pub struct FailingChanges {
        pub inner: Arc<MemoryStore>,
        pub failing: AtomicBool,
    }

    #[async_trait]
    impl ChangeStore for FailingChanges {
        async fn add_change(&self, change: NewChange) -> Result<Change> {
            self.inner.add_change(change).await
        }

        async fn get_change(&self, number: u64) -> Result<Option<Change>> {
            check(&self.failing, "changes")?;
            self.inner.get_change(number).await
        }

        async fn get_changes(&self, numbers: &[u64]) -> Result<Vec<Change>> {
            check(&self.failing, "changes")?;
            self.inner.get_changes(numbers).await
        }

        async fn last_change_number(&self) -> Result<Option<u64>> {
            self.inner.last_change_number().await
        }
    }

    /// Request store whose buildset submissions fail while `failing` is set.
    pub struct FailingRequests {
        pub inner: Arc<MemoryStore>,
        pub failing: AtomicBool,
    }

    #[async_trait]
    impl BuildRequestStore for FailingRequests {
        async fn add_buildset(
            &self,
            submission: &BuildSetSubmission,
            submitted_at: DateTime<Utc>,
        ) -> Result<BuildSetCreated> {
            check(&self.failing, "buildsets")?;
            self.inner.add_buildset(submission, submitted_at).await
        }

        async fn get_buildset(&self, id: BuildSetId) -> Result<Option<BuildSet>> {
            self.inner.get_buildset(id).await
        }

        async fn list_buildsets(&self, complete: Option<bool>) -> Result<Vec<BuildSet>> {
            self.inner.list_buildsets(complete).await
        }

        async fn get_build_request(&self, id: BuildRequestId) -> Result<Option<BuildRequest>> {
            self.inner.get_build_request(id).await
        }

        async fn list_build_requests(&self, filter: &BuildRequestFilter) -> Result<Vec<BuildRequest>> {
            self.inner.list_build_requests(filter).await
        }

        async fn claim_build_requests(
            &self,
            ids: &[BuildRequestId],
            claimed_at: DateTime<Utc>,
            master: MasterId,
        ) -> Result<()> {
            self.inner.claim_build_requests(ids, claimed_at, master).await
        }

        async fn reclaim_build_requests(
            &self,
            ids: &[BuildRequestId],
            master: MasterId,
            now: DateTime<Utc>,
        ) -> Result<()> {
            self.inner.reclaim_build_requests(ids, master, now).await
        }

        async fn unclaim_build_requests(&self, ids: &[BuildRequestId], master: MasterId) -> Result<()> {
            self.inner.unclaim_build_requests(ids, master).await
        }

        async fn complete_build_requests(
            &self,
            ids: &[BuildRequestId],
            results: Results,
            complete_at: DateTime<Utc>,
        ) -> Result<Vec<CompletedBuildSet>> {
            self.inner.complete_build_requests(ids, results, complete_at).await
        }

        async fn unclaim_expired(&self, claimed_before: DateTime<Utc>) -> Result<Vec<BuildRequestId>> {
            self.inner.unclaim_expired(claimed_before).await
        }
    }

    pub struct Harness {
        pub store: Arc<MemoryStore>,
        pub changes: Arc<FailingChanges>,
        pub requests: Arc<FailingRequests>,
        pub ctx: SchedulerContext,
    }

    impl Harness {
        pub fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let changes = Arc::new(FailingChanges {
                inner: store.clone(),
                failing: AtomicBool::new(false),
            });
            let requests = Arc::new(FailingRequests {
                inner: store.clone(),
                failing: AtomicBool::new(false),
            });
            let stores = Stores {
                changes: changes.clone(),
                requests: requests.clone(),
                state: store.clone(),
            };
            let bus = Arc::new(LocalEventBus::new());
            let ctx = SchedulerContext {
                submitter: Submitter::new(stores.requests.clone(), bus),
                stores,
                directory: SchedulerDirectory::default(),
            };
            Self {
                store,
                changes,
                requests,
                ctx,
            }
        }

        pub fn fail_submissions(&self, failing: bool) {
            self.requests.failing.store(failing, Ordering::SeqCst);
        }

        pub fn fail_change_lookups(&self, failing: bool) {
            self.changes.failing.store(failing, Ordering::SeqCst);
        }

        pub async fn change(&self, change: NewChange) -> Change {
            self.store.add_change(change).await.unwrap()
        }

        pub async fn buildsets(&self) -> Vec<BuildSet> {
            self.store.list_buildsets(None).await.unwrap()
        }
    }
}

//! Pluggable coordinator strategies.
//!
//! Every strategy returns `anyhow::Result` so that user-supplied code can
//! fail; the coordinator contains those failures and falls back to a safe
//! answer (not mergeable, start nothing).

use super::{PendingRequest, WorkerSlot};
use bosun_core::sourcestamp::SourceStamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Decides whether two pending requests on a builder can share one build.
pub trait MergePolicy: Send + Sync {
    fn can_merge(
        &self,
        builder: &str,
        a: &PendingRequest,
        b: &PendingRequest,
    ) -> anyhow::Result<bool>;
}

/// Picks the next request to start from a builder's candidates.
pub trait NextBuildPolicy: Send + Sync {
    fn next_build(
        &self,
        builder: &str,
        candidates: &[PendingRequest],
    ) -> anyhow::Result<Option<usize>>;
}

/// Picks the worker to run a build from the free slots.
pub trait NextWorkerPolicy: Send + Sync {
    fn next_worker(&self, builder: &str, slots: &[WorkerSlot]) -> anyhow::Result<Option<usize>>;
}

/// What the prioritizer knows about a builder with runnable work.
#[derive(Debug, Clone, PartialEq)]
pub struct BuilderInfo {
    pub name: String,
    pub priority: i32,
    pub oldest_request: Option<DateTime<Utc>>,
}

/// Orders builders competing for free workers.
pub trait BuilderPrioritizer: Send + Sync {
    fn prioritize(&self, builders: &[BuilderInfo]) -> anyhow::Result<Vec<String>>;
}

impl<F> MergePolicy for F
where
    F: Fn(&str, &PendingRequest, &PendingRequest) -> anyhow::Result<bool> + Send + Sync,
{
    fn can_merge(&self, builder: &str, a: &PendingRequest, b: &PendingRequest) -> anyhow::Result<bool> {
        self(builder, a, b)
    }
}

impl<F> NextBuildPolicy for F
where
    F: Fn(&str, &[PendingRequest]) -> anyhow::Result<Option<usize>> + Send + Sync,
{
    fn next_build(&self, builder: &str, candidates: &[PendingRequest]) -> anyhow::Result<Option<usize>> {
        self(builder, candidates)
    }
}

impl<F> NextWorkerPolicy for F
where
    F: Fn(&str, &[WorkerSlot]) -> anyhow::Result<Option<usize>> + Send + Sync,
{
    fn next_worker(&self, builder: &str, slots: &[WorkerSlot]) -> anyhow::Result<Option<usize>> {
        self(builder, slots)
    }
}

impl<F> BuilderPrioritizer for F
where
    F: Fn(&[BuilderInfo]) -> anyhow::Result<Vec<String>> + Send + Sync,
{
    fn prioritize(&self, builders: &[BuilderInfo]) -> anyhow::Result<Vec<String>> {
        self(builders)
    }
}

// === Merge ===

/// Stamps are pairwise mergeable per codebase and properties are equal.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeBySourceStamps;

pub(crate) fn stamps_mergeable(a: &[SourceStamp], b: &[SourceStamp]) -> bool {
    a.len() == b.len()
        && a.iter().all(|sa| {
            b.iter()
                .find(|sb| sb.codebase == sa.codebase)
                .is_some_and(|sb| sa.can_be_merged_with(sb))
        })
}

impl MergePolicy for MergeBySourceStamps {
    fn can_merge(&self, _builder: &str, a: &PendingRequest, b: &PendingRequest) -> anyhow::Result<bool> {
        Ok(stamps_mergeable(&a.buildset.sourcestamps, &b.buildset.sourcestamps)
            && a.buildset.properties.same_values(&b.buildset.properties))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverMerge;

impl MergePolicy for NeverMerge {
    fn can_merge(&self, _: &str, _: &PendingRequest, _: &PendingRequest) -> anyhow::Result<bool> {
        Ok(false)
    }
}

// === Next build ===

/// Oldest submission first.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fifo;

impl NextBuildPolicy for Fifo {
    fn next_build(&self, _builder: &str, candidates: &[PendingRequest]) -> anyhow::Result<Option<usize>> {
        Ok(candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.request.submitted_at)
            .map(|(i, _)| i))
    }
}

/// Highest request priority first, then oldest.
#[derive(Debug, Clone, Copy, Default)]
pub struct HighestPriority;

impl NextBuildPolicy for HighestPriority {
    fn next_build(&self, _builder: &str, candidates: &[PendingRequest]) -> anyhow::Result<Option<usize>> {
        Ok(candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| (std::cmp::Reverse(c.request.priority), c.request.submitted_at))
            .map(|(i, _)| i))
    }
}

// === Next worker ===

#[derive(Debug, Clone, Copy, Default)]
pub struct FirstAvailable;

impl NextWorkerPolicy for FirstAvailable {
    fn next_worker(&self, _builder: &str, slots: &[WorkerSlot]) -> anyhow::Result<Option<usize>> {
        Ok(if slots.is_empty() { None } else { Some(0) })
    }
}

/// Fewest running builds, ties broken by position.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastLoaded;

impl NextWorkerPolicy for LeastLoaded {
    fn next_worker(&self, _builder: &str, slots: &[WorkerSlot]) -> anyhow::Result<Option<usize>> {
        Ok(slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.running)
            .map(|(i, _)| i))
    }
}

// === Builder prioritization ===

/// Builder with the oldest pending request first.
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestRequestFirst;

impl BuilderPrioritizer for OldestRequestFirst {
    fn prioritize(&self, builders: &[BuilderInfo]) -> anyhow::Result<Vec<String>> {
        Ok(by_oldest(builders))
    }
}

pub(crate) fn by_oldest(builders: &[BuilderInfo]) -> Vec<String> {
    let mut sorted: Vec<&BuilderInfo> = builders.iter().collect();
    // Builders without a timestamp go last.
    sorted.sort_by_key(|b| (b.oldest_request.is_none(), b.oldest_request));
    sorted.into_iter().map(|b| b.name.clone()).collect()
}

/// Highest configured builder priority first, then oldest request.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuilderPriorityFirst;

impl BuilderPrioritizer for BuilderPriorityFirst {
    fn prioritize(&self, builders: &[BuilderInfo]) -> anyhow::Result<Vec<String>> {
        let mut sorted: Vec<&BuilderInfo> = builders.iter().collect();
        sorted.sort_by_key(|b| {
            (
                std::cmp::Reverse(b.priority),
                b.oldest_request.is_none(),
                b.oldest_request,
            )
        });
        Ok(sorted.into_iter().map(|b| b.name.clone()).collect())
    }
}

// === Configuration ===

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRequestsSetting {
    #[default]
    Sourcestamps,
    Never,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextBuildSetting {
    #[default]
    Fifo,
    Priority,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextWorkerSetting {
    #[default]
    First,
    LeastLoaded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrioritizeBuildersSetting {
    #[default]
    OldestRequest,
    BuilderPriority,
}

/// The `coordinator:` section of the master configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySettings {
    pub merge_requests: MergeRequestsSetting,
    pub next_build: NextBuildSetting,
    pub next_worker: NextWorkerSetting,
    pub prioritize_builders: PrioritizeBuildersSetting,
}

/// The strategies a coordinator runs with.
#[derive(Clone)]
pub struct Policies {
    pub merge: Arc<dyn MergePolicy>,
    pub next_build: Arc<dyn NextBuildPolicy>,
    pub next_worker: Arc<dyn NextWorkerPolicy>,
    pub prioritizer: Arc<dyn BuilderPrioritizer>,
}

impl Default for Policies {
    fn default() -> Self {
        Self::from_settings(&PolicySettings::default())
    }
}

impl Policies {
    pub fn from_settings(settings: &PolicySettings) -> Self {
        Self {
            merge: match settings.merge_requests {
                MergeRequestsSetting::Sourcestamps => Arc::new(MergeBySourceStamps),
                MergeRequestsSetting::Never => Arc::new(NeverMerge),
            },
            next_build: match settings.next_build {
                NextBuildSetting::Fifo => Arc::new(Fifo),
                NextBuildSetting::Priority => Arc::new(HighestPriority),
            },
            next_worker: match settings.next_worker {
                NextWorkerSetting::First => Arc::new(FirstAvailable),
                NextWorkerSetting::LeastLoaded => Arc::new(LeastLoaded),
            },
            prioritizer: match settings.prioritize_builders {
                PrioritizeBuildersSetting::OldestRequest => Arc::new(OldestRequestFirst),
                PrioritizeBuildersSetting::BuilderPriority => Arc::new(BuilderPriorityFirst),
            },
        }
    }

    pub fn with_merge(mut self, merge: Arc<dyn MergePolicy>) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_next_build(mut self, next_build: Arc<dyn NextBuildPolicy>) -> Self {
        self.next_build = next_build;
        self
    }

    pub fn with_next_worker(mut self, next_worker: Arc<dyn NextWorkerPolicy>) -> Self {
        self.next_worker = next_worker;
        self
    }

    pub fn with_prioritizer(mut self, prioritizer: Arc<dyn BuilderPrioritizer>) -> Self {
        self.prioritizer = prioritizer;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_core::buildset::{BuildRequest, BuildSet};
    use bosun_core::ids::{BuildRequestId, BuildSetId};
    use bosun_core::properties::Properties;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn pending(secs: i64, priority: i32, stamp: SourceStamp, props: Properties) -> PendingRequest {
        let bsid = BuildSetId::new();
        PendingRequest {
            request: BuildRequest {
                id: BuildRequestId::new(),
                buildset_id: bsid,
                builder_name: "b1".into(),
                priority,
                submitted_at: t(secs),
                claimed_at: None,
                claimed_by: None,
                complete: false,
                complete_at: None,
                results: None,
            },
            buildset: Arc::new(BuildSet {
                id: bsid,
                scheduler_name: None,
                sourcestamps: vec![stamp],
                reason: "r".into(),
                properties: props,
                builder_names: vec!["b1".into()],
                external_idstring: None,
                parent_build_id: None,
                submitted_at: t(secs),
                complete: false,
                complete_at: None,
                results: None,
            }),
        }
    }

    fn main_stamp() -> SourceStamp {
        SourceStamp::new("").with_branch(Some("main".into()))
    }

    #[test]
    fn test_default_merge_requires_equal_properties() {
        let a = pending(0, 0, main_stamp(), Properties::new().with("x", 1, "a"));
        let b = pending(1, 0, main_stamp(), Properties::new().with("x", 1, "b"));
        let c = pending(2, 0, main_stamp(), Properties::new().with("x", 2, "c"));
        assert!(MergeBySourceStamps.can_merge("b1", &a, &b).unwrap());
        assert!(!MergeBySourceStamps.can_merge("b1", &a, &c).unwrap());
    }

    #[test]
    fn test_default_merge_rejects_other_branch() {
        let a = pending(0, 0, main_stamp(), Properties::new());
        let b = pending(1, 0, SourceStamp::new("").with_branch(Some("dev".into())), Properties::new());
        assert!(!MergeBySourceStamps.can_merge("b1", &a, &b).unwrap());
    }

    #[test]
    fn test_fifo_and_priority() {
        let candidates = vec![
            pending(5, 0, main_stamp(), Properties::new()),
            pending(1, 0, main_stamp(), Properties::new()),
            pending(9, 10, main_stamp(), Properties::new()),
        ];
        assert_eq!(Fifo.next_build("b1", &candidates).unwrap(), Some(1));
        assert_eq!(HighestPriority.next_build("b1", &candidates).unwrap(), Some(2));
        assert_eq!(Fifo.next_build("b1", &[]).unwrap(), None);
    }

    #[test]
    fn test_worker_policies() {
        let slots = vec![
            WorkerSlot { name: "w1".into(), running: 2, max_builds: 4 },
            WorkerSlot { name: "w2".into(), running: 0, max_builds: 1 },
        ];
        assert_eq!(FirstAvailable.next_worker("b1", &slots).unwrap(), Some(0));
        assert_eq!(LeastLoaded.next_worker("b1", &slots).unwrap(), Some(1));
        assert_eq!(FirstAvailable.next_worker("b1", &[]).unwrap(), None);
    }

    #[test]
    fn test_prioritizers() {
        let builders = vec![
            BuilderInfo { name: "young".into(), priority: 5, oldest_request: Some(t(10)) },
            BuilderInfo { name: "old".into(), priority: 0, oldest_request: Some(t(1)) },
        ];
        assert_eq!(OldestRequestFirst.prioritize(&builders).unwrap(), vec!["old", "young"]);
        assert_eq!(BuilderPriorityFirst.prioritize(&builders).unwrap(), vec!["young", "old"]);
    }

    #[test]
    fn test_settings_from_yaml() {
        let settings: PolicySettings =
            serde_yaml::from_str("next_build: priority\nnext_worker: least_loaded").unwrap();
        assert_eq!(settings.next_build, NextBuildSetting::Priority);
        assert_eq!(settings.merge_requests, MergeRequestsSetting::Sourcestamps);
        assert!(serde_yaml::from_str::<PolicySettings>("bogus: 1").is_err());
    }
}

//! Old-build canceller.
//!
//! Tracks pending requests and running builds whose source stamps match a
//! rule, and cancels them when a newer change arrives on the same branch.

use crate::filter::{SourceStampFilter, SourceStampFilterConfig};
use async_trait::async_trait;
use bosun_core::change::Change;
use bosun_core::events::Event;
use bosun_core::ids::{BuildId, BuildRequestId};
use bosun_core::sourcestamp::SourceStamp;
use bosun_core::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Whatever can stop pending requests and running builds.
#[async_trait]
pub trait WorkCanceller: Send + Sync {
    async fn cancel_request(&self, id: BuildRequestId, reason: &str) -> Result<()>;

    async fn cancel_build(&self, id: BuildId, reason: &str) -> Result<()>;
}

/// Maps a branch name to the key used to compare branches.
pub type BranchKeyFn = Arc<dyn Fn(Option<&str>) -> Option<String> + Send + Sync>;

/// Default branch key. Gerrit refs `refs/changes/NN/CHANGE/PATCHSET` lose
/// the patchset so new patchsets supersede old ones.
pub fn gerrit_branch_key(branch: Option<&str>) -> Option<String> {
    let branch = branch?;
    let parts: Vec<&str> = branch.split('/').collect();
    if parts.len() == 5 && parts[0] == "refs" && parts[1] == "changes" {
        return Some(parts[..4].join("/"));
    }
    Some(branch.to_string())
}

/// Compares branches by name as given.
pub fn exact_branch_key(branch: Option<&str>) -> Option<String> {
    branch.map(str::to_string)
}

/// Work for `builders` whose stamps pass `filter` is cancelled by a newer
/// change whose branch has the same key under `branch_key`.
#[derive(Clone)]
pub struct CancelRule {
    pub builders: BTreeSet<String>,
    pub filter: SourceStampFilter,
    pub branch_key: BranchKeyFn,
}

impl CancelRule {
    pub fn new(builders: &[&str], filter: SourceStampFilter) -> Self {
        Self {
            builders: builders.iter().map(|b| b.to_string()).collect(),
            filter,
            branch_key: Arc::new(gerrit_branch_key),
        }
    }

    pub fn with_branch_key(mut self, branch_key: BranchKeyFn) -> Self {
        self.branch_key = branch_key;
        self
    }
}

impl fmt::Debug for CancelRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelRule")
            .field("builders", &self.builders)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// Branch key extraction selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKeyKind {
    #[default]
    Gerrit,
    Exact,
}

impl BranchKeyKind {
    pub fn key_fn(self) -> BranchKeyFn {
        match self {
            BranchKeyKind::Gerrit => Arc::new(gerrit_branch_key),
            BranchKeyKind::Exact => Arc::new(exact_branch_key),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CancelRuleConfig {
    pub builders: Vec<String>,
    #[serde(default)]
    pub filter: SourceStampFilterConfig,
    #[serde(default)]
    pub branch_key: BranchKeyKind,
}

/// The `canceller:` section of the master configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CancellerConfig {
    pub rules: Vec<CancelRuleConfig>,
}

impl CancellerConfig {
    pub fn build(&self) -> Result<Vec<CancelRule>> {
        self.rules
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                if rule.builders.is_empty() {
                    return Err(Error::InvalidConfig(format!(
                        "canceller rule {i} names no builders"
                    )));
                }
                Ok(CancelRule {
                    builders: rule.builders.iter().cloned().collect(),
                    filter: rule.filter.build()?,
                    branch_key: rule.branch_key.key_fn(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackedWork {
    Request(BuildRequestId),
    Build(BuildId),
}

impl fmt::Display for TrackedWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackedWork::Request(id) => write!(f, "request {id}"),
            TrackedWork::Build(id) => write!(f, "build {id}"),
        }
    }
}

/// Identifies the line of development a stamp or change belongs to, as seen
/// by one rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Selector {
    rule: usize,
    project: String,
    codebase: String,
    repository: String,
    branch: Option<String>,
}

struct Entry {
    builder: String,
    stamps: Vec<SourceStamp>,
    selectors: Vec<Selector>,
    changes: BTreeSet<u64>,
}

#[derive(Default)]
struct State {
    rules: Vec<CancelRule>,
    tracked: HashMap<TrackedWork, Entry>,
    reconfiguring: bool,
    queued: Vec<Event>,
}

pub struct OldBuildCanceller {
    canceller: Arc<dyn WorkCanceller>,
    state: Mutex<State>,
}

/// Selectors of the stamps each rule for `builder` matches, keyed the way
/// that rule compares branches.
fn selectors_for(rules: &[CancelRule], builder: &str, stamps: &[SourceStamp]) -> Vec<Selector> {
    rules
        .iter()
        .enumerate()
        .filter(|(_, rule)| rule.builders.contains(builder))
        .flat_map(|(i, rule)| {
            stamps
                .iter()
                .filter(move |ss| rule.filter.matches(ss))
                .map(move |ss| Selector {
                    rule: i,
                    project: ss.project.clone(),
                    codebase: ss.codebase.clone(),
                    repository: ss.repository.clone(),
                    branch: (rule.branch_key)(ss.branch.as_deref()),
                })
        })
        .collect()
}

/// The change's selector under each rule.
fn change_selectors(rules: &[CancelRule], change: &Change) -> Vec<Selector> {
    rules
        .iter()
        .enumerate()
        .map(|(i, rule)| Selector {
            rule: i,
            project: change.project.clone(),
            codebase: change.codebase.clone(),
            repository: change.repository.clone(),
            branch: (rule.branch_key)(change.branch.as_deref()),
        })
        .collect()
}

impl OldBuildCanceller {
    pub fn new(canceller: Arc<dyn WorkCanceller>, rules: Vec<CancelRule>) -> Self {
        Self {
            canceller,
            state: Mutex::new(State {
                rules,
                ..Default::default()
            }),
        }
    }

    pub fn tracked(&self) -> Vec<TrackedWork> {
        self.state.lock().tracked.keys().copied().collect()
    }

    fn track(&self, state: &mut State, work: TrackedWork, builder: &str, stamps: &[SourceStamp]) {
        let selectors = selectors_for(&state.rules, builder, stamps);
        if selectors.is_empty() {
            return;
        }
        debug!(work = %work, builder = %builder, "Tracking for cancellation");
        state.tracked.insert(
            work,
            Entry {
                builder: builder.to_string(),
                stamps: stamps.to_vec(),
                selectors,
                changes: stamps.iter().flat_map(|ss| ss.change_numbers()).collect(),
            },
        );
    }

    fn apply(&self, state: &mut State, event: &Event) {
        match event {
            Event::BuildSetSubmitted(p) => {
                for (builder, id) in &p.requests {
                    self.track(state, TrackedWork::Request(*id), builder, &p.sourcestamps);
                }
            }
            Event::BuildRequestClaimed(p) => {
                state.tracked.remove(&TrackedWork::Request(p.request_id));
            }
            Event::BuildRequestCompleted(p) => {
                state.tracked.remove(&TrackedWork::Request(p.request_id));
            }
            Event::BuildStarted(p) => {
                self.track(state, TrackedWork::Build(p.build_id), &p.builder, &p.sourcestamps);
            }
            Event::BuildFinished(p) => {
                state.tracked.remove(&TrackedWork::Build(p.build_id));
            }
            _ => {}
        }
    }

    /// Feed a lifecycle event. New changes may cancel tracked work.
    pub async fn handle_event(&self, event: &Event) {
        if let Event::ChangeAdded(p) = event {
            self.on_change(&p.change).await;
            return;
        }
        let mut state = self.state.lock();
        if state.reconfiguring {
            state.queued.push(event.clone());
        } else {
            self.apply(&mut state, event);
        }
    }

    async fn on_change(&self, change: &Change) {
        let victims: Vec<(TrackedWork, String)> = {
            let mut state = self.state.lock();
            let keys = change_selectors(&state.rules, change);
            let hits: Vec<TrackedWork> = state
                .tracked
                .iter()
                .filter(|(_, e)| {
                    !e.changes.contains(&change.number)
                        && e.selectors.iter().any(|s| keys.contains(s))
                })
                .map(|(work, _)| *work)
                .collect();
            hits.into_iter()
                .filter_map(|work| state.tracked.remove(&work).map(|e| (work, e.builder)))
                .collect()
        };

        let reason = format!("superseded by change {}", change.number);
        for (work, builder) in victims {
            info!(work = %work, builder = %builder, change = change.number, "Cancelling obsolete work");
            let result = match work {
                TrackedWork::Request(id) => self.canceller.cancel_request(id, &reason).await,
                TrackedWork::Build(id) => self.canceller.cancel_build(id, &reason).await,
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_contention() || e.is_not_found() => {
                    debug!(work = %work, error = %e, "Work already gone");
                }
                Err(e) => warn!(work = %work, error = %e, "Failed to cancel obsolete work"),
            }
        }
    }

    /// Start a rule swap. Lifecycle events are held until
    /// [`finish_reconfig`](Self::finish_reconfig).
    pub fn begin_reconfig(&self) {
        self.state.lock().reconfiguring = true;
    }

    /// Install new rules, re-evaluate tracked work against them and replay
    /// the events held since [`begin_reconfig`](Self::begin_reconfig).
    pub fn finish_reconfig(&self, rules: Vec<CancelRule>) {
        let mut state = self.state.lock();
        let tracked = std::mem::take(&mut state.tracked);
        state.rules = rules;
        for (work, entry) in tracked {
            self.track(&mut state, work, &entry.builder, &entry.stamps);
        }
        let queued = std::mem::take(&mut state.queued);
        for event in &queued {
            self.apply(&mut state, event);
        }
        state.reconfiguring = false;
        info!(rules = state.rules.len(), tracked = state.tracked.len(), "Canceller reconfigured");
    }

    pub fn reconfigure(&self, rules: Vec<CancelRule>) {
        self.begin_reconfig();
        self.finish_reconfig(rules);
    }
}

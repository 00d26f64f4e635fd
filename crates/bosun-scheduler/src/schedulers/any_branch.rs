use super::pending::{PendingState, parse_state};
use super::{BaseConfig, PendingChanges, Scheduler, SchedulerContext, SchedulerKind};
use crate::filter::{AlwaysImportant, ChangeFilter, FileImportance, classify};
use async_trait::async_trait;
use bosun_core::Result;
use bosun_core::change::Change;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct BranchState {
    branch: Option<String>,
    #[serde(flatten)]
    pending: PendingState,
}

/// A debounced scheduler per branch, created the first time a branch is
/// seen. Each branch has its own timer.
pub struct AnyBranchScheduler {
    base: BaseConfig,
    filter: ChangeFilter,
    branches: Option<Vec<String>>,
    importance: Arc<dyn FileImportance>,
    tree_stable_timer: Option<Duration>,
    only_important: bool,
    pending: BTreeMap<Option<String>, PendingChanges>,
}

impl AnyBranchScheduler {
    pub fn new(base: BaseConfig, filter: ChangeFilter) -> Self {
        Self {
            base,
            filter,
            branches: None,
            importance: Arc::new(AlwaysImportant),
            tree_stable_timer: None,
            only_important: false,
            pending: BTreeMap::new(),
        }
    }

    /// Restrict to these branches. An empty list disables the scheduler.
    pub fn with_branches(mut self, branches: Vec<String>) -> Self {
        self.branches = Some(branches);
        self
    }

    pub fn with_tree_stable_timer(mut self, timer: Duration) -> Self {
        self.tree_stable_timer = Some(timer);
        self
    }

    pub fn with_importance(mut self, importance: Arc<dyn FileImportance>) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_only_important(mut self, only_important: bool) -> Self {
        self.only_important = only_important;
        self
    }

    pub fn pending_branches(&self) -> Vec<Option<String>> {
        self.pending.keys().cloned().collect()
    }

    fn branch_allowed(&self, branch: Option<&str>) -> bool {
        match &self.branches {
            None => true,
            Some(list) => branch.is_some_and(|b| list.iter().any(|allowed| allowed == b)),
        }
    }

    async fn fire(&mut self, ctx: &SchedulerContext, branch: &Option<String>) -> Result<()> {
        let Some(pending) = self.pending.get_mut(branch) else {
            return Ok(());
        };
        let reason = format!(
            "The AnyBranchScheduler scheduler named '{}' triggered this build",
            self.base.name
        );
        pending.fire(&self.base, ctx, reason).await?;
        self.pending.remove(branch);
        Ok(())
    }
}

#[async_trait]
impl Scheduler for AnyBranchScheduler {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::AnyBranch
    }

    async fn activate(
        &mut self,
        ctx: &SchedulerContext,
        state: Option<serde_json::Value>,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        if self.branches.as_ref().is_some_and(|b| b.is_empty()) {
            warn!(
                scheduler = %self.base.name,
                "Branch list is empty; this scheduler will never fire"
            );
        }
        let saved: Vec<BranchState> = parse_state(&self.base.name, state);
        self.pending.clear();
        for entry in saved {
            let pending =
                PendingChanges::restore(ctx.stores.changes.as_ref(), &self.base.name, entry.pending)
                    .await?;
            self.pending.insert(entry.branch, pending);
        }
        Ok(())
    }

    fn export_state(&self) -> serde_json::Value {
        let state: Vec<BranchState> = self
            .pending
            .iter()
            .map(|(branch, pending)| BranchState {
                branch: branch.clone(),
                pending: pending.to_state(),
            })
            .collect();
        serde_json::to_value(state).unwrap_or_default()
    }

    async fn on_change(
        &mut self,
        ctx: &SchedulerContext,
        change: &Change,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.base.accepts_codebase(change) {
            return Ok(());
        }
        if !self.filter.matches(change) || !self.branch_allowed(change.branch.as_deref()) {
            debug!(scheduler = %self.base.name, change = change.number, "Change does not match filter");
            return Ok(());
        }
        let important = classify(self.importance.as_ref(), &self.base.name, change);
        let branch = change.branch.clone();
        let fire_now = self.pending.entry(branch.clone()).or_default().record(
            change.clone(),
            important,
            self.tree_stable_timer,
            self.only_important,
        );
        if fire_now {
            self.fire(ctx, &branch).await?;
        }
        Ok(())
    }

    fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.pending.values().filter_map(|p| p.next_fire).min()
    }

    async fn on_timer(&mut self, ctx: &SchedulerContext, now: DateTime<Utc>) -> Result<()> {
        let due: Vec<Option<String>> = self
            .pending
            .iter()
            .filter(|(_, p)| p.is_due(now))
            .map(|(b, _)| b.clone())
            .collect();
        for branch in due {
            self.fire(ctx, &branch).await?;
        }
        Ok(())
    }
}

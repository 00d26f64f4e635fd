use super::pending::{PendingState, parse_state};
use super::{BaseConfig, PendingChanges, Scheduler, SchedulerContext, SchedulerKind};
use crate::filter::{AlwaysImportant, ChangeFilter, FileImportance, classify};
use async_trait::async_trait;
use bosun_core::Result;
use bosun_core::change::Change;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;

/// Fires one buildset once the tree has been quiet for `tree_stable_timer`
/// after the last important change. Without a timer, every important change
/// fires immediately.
pub struct SingleBranchScheduler {
    base: BaseConfig,
    filter: ChangeFilter,
    importance: Arc<dyn FileImportance>,
    tree_stable_timer: Option<Duration>,
    only_important: bool,
    pending: PendingChanges,
}

impl SingleBranchScheduler {
    pub fn new(base: BaseConfig, filter: ChangeFilter) -> Self {
        Self {
            base,
            filter,
            importance: Arc::new(AlwaysImportant),
            tree_stable_timer: None,
            only_important: false,
            pending: PendingChanges::default(),
        }
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

    pub fn pending(&self) -> &PendingChanges {
        &self.pending
    }

    async fn fire(&mut self, ctx: &SchedulerContext) -> Result<()> {
        let reason = format!(
            "The SingleBranchScheduler scheduler named '{}' triggered this build",
            self.base.name
        );
        self.pending.fire(&self.base, ctx, reason).await?;
        Ok(())
    }
}

#[async_trait]
impl Scheduler for SingleBranchScheduler {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::SingleBranch
    }

    async fn activate(
        &mut self,
        ctx: &SchedulerContext,
        state: Option<serde_json::Value>,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        let saved: PendingState = parse_state(&self.base.name, state);
        self.pending =
            PendingChanges::restore(ctx.stores.changes.as_ref(), &self.base.name, saved).await?;
        Ok(())
    }

    fn export_state(&self) -> serde_json::Value {
        serde_json::to_value(self.pending.to_state()).unwrap_or_default()
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
        if !self.filter.matches(change) {
            debug!(scheduler = %self.base.name, change = change.number, "Change does not match filter");
            return Ok(());
        }
        let important = classify(self.importance.as_ref(), &self.base.name, change);
        if self.pending.record(
            change.clone(),
            important,
            self.tree_stable_timer,
            self.only_important,
        ) {
            self.fire(ctx).await?;
        }
        Ok(())
    }

    fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.pending.next_fire
    }

    async fn on_timer(&mut self, ctx: &SchedulerContext, now: DateTime<Utc>) -> Result<()> {
        if self.pending.is_due(now) {
            self.fire(ctx).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ValueFilter;
    use crate::schedulers::testing::Harness;
    use bosun_core::change::NewChange;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn scheduler() -> SingleBranchScheduler {
        SingleBranchScheduler::new(
            BaseConfig::new("sb", vec!["b1".into()]),
            ChangeFilter::all().with_branch(ValueFilter::eq("main")),
        )
        .with_tree_stable_timer(Duration::seconds(5))
    }

    #[tokio::test]
    async fn test_fires_after_stable_timer() {
        let h = Harness::new();
        let mut s = scheduler();
        s.activate(&h.ctx, None, t(0)).await.unwrap();

        let c1 = h.change(NewChange::new("dev").with_branch("main").at(t(0))).await;
        s.on_change(&h.ctx, &c1, t(0)).await.unwrap();
        assert_eq!(s.next_wakeup(), Some(t(5)));

        s.on_timer(&h.ctx, t(4)).await.unwrap();
        assert!(h.buildsets().await.is_empty());

        s.on_timer(&h.ctx, t(5)).await.unwrap();
        let sets = h.buildsets().await;
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].builder_names, vec!["b1".to_string()]);
        assert_eq!(sets[0].sourcestamps[0].change_numbers(), vec![c1.number]);
        assert_eq!(sets[0].properties.get("scheduler"), Some(&serde_json::json!("sb")));
        assert!(s.next_wakeup().is_none());
    }

    #[tokio::test]
    async fn test_burst_produces_one_buildset() {
        let h = Harness::new();
        let mut s = scheduler();
        s.activate(&h.ctx, None, t(0)).await.unwrap();

        let mut numbers = Vec::new();
        for i in 0..4 {
            let c = h.change(NewChange::new("dev").with_branch("main").at(t(i))).await;
            numbers.push(c.number);
            s.on_change(&h.ctx, &c, t(i)).await.unwrap();
        }
        assert_eq!(s.next_wakeup(), Some(t(8)));
        s.on_timer(&h.ctx, t(8)).await.unwrap();

        let sets = h.buildsets().await;
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].sourcestamps[0].change_numbers(), numbers);
    }

    #[tokio::test]
    async fn test_non_matching_branch_is_ignored() {
        let h = Harness::new();
        let mut s = scheduler();
        s.activate(&h.ctx, None, t(0)).await.unwrap();

        let c = h.change(NewChange::new("dev").with_branch("dev").at(t(0))).await;
        s.on_change(&h.ctx, &c, t(0)).await.unwrap();
        assert!(s.next_wakeup().is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_codebase_is_ignored() {
        let h = Harness::new();
        let mut s = scheduler();
        s.activate(&h.ctx, None, t(0)).await.unwrap();

        let c = h
            .change(NewChange::new("dev").with_branch("main").with_codebase("other").at(t(0)))
            .await;
        s.on_change(&h.ctx, &c, t(0)).await.unwrap();
        assert!(s.pending().important.is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let h = Harness::new();
        let mut s = scheduler();
        s.activate(&h.ctx, None, t(0)).await.unwrap();
        let c = h.change(NewChange::new("dev").with_branch("main").at(t(0))).await;
        s.on_change(&h.ctx, &c, t(0)).await.unwrap();

        let state = s.export_state();
        let mut restarted = scheduler();
        restarted.activate(&h.ctx, Some(state), t(1)).await.unwrap();
        assert_eq!(restarted.next_wakeup(), Some(t(5)));
        restarted.on_timer(&h.ctx, t(5)).await.unwrap();
        assert_eq!(h.buildsets().await[0].sourcestamps[0].change_numbers(), vec![c.number]);
    }

    #[tokio::test]
    async fn test_immediate_mode() {
        let h = Harness::new();
        let mut s = SingleBranchScheduler::new(
            BaseConfig::new("now", vec!["b1".into()]),
            ChangeFilter::all(),
        );
        s.activate(&h.ctx, None, t(0)).await.unwrap();
        let c = h.change(NewChange::new("dev").at(t(0))).await;
        s.on_change(&h.ctx, &c, t(0)).await.unwrap();
        assert_eq!(h.buildsets().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_importance_treated_as_unimportant() {
        let h = Harness::new();
        let failing = |_: &Change| -> anyhow::Result<bool> { anyhow::bail!("boom") };
        let mut s = scheduler().with_importance(Arc::new(failing));
        s.activate(&h.ctx, None, t(0)).await.unwrap();
        let c = h.change(NewChange::new("dev").with_branch("main").at(t(0))).await;
        s.on_change(&h.ctx, &c, t(0)).await.unwrap();
        assert!(s.next_wakeup().is_none());
        assert_eq!(s.pending().unimportant.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_submit_keeps_pending_changes() {
        let h = Harness::new();
        let mut s = scheduler();
        s.activate(&h.ctx, None, t(0)).await.unwrap();
        let c = h.change(NewChange::new("dev").with_branch("main").at(t(0))).await;
        s.on_change(&h.ctx, &c, t(0)).await.unwrap();

        h.fail_submissions(true);
        assert!(s.on_timer(&h.ctx, t(5)).await.is_err());
        assert_eq!(s.export_state()["important"], serde_json::json!([c.number]));
        assert_eq!(s.next_wakeup(), Some(t(5)));

        h.fail_submissions(false);
        s.on_timer(&h.ctx, t(6)).await.unwrap();
        let sets = h.buildsets().await;
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].sourcestamps[0].change_numbers(), vec![c.number]);
        assert!(s.pending().important.is_empty());
    }
}

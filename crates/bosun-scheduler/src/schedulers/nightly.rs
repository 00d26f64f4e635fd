use super::pending::{PendingState, parse_state};
use super::{BaseConfig, PendingChanges, Scheduler, SchedulerContext, SchedulerKind};
use crate::cron::Recurrence;
use crate::filter::{AlwaysImportant, ChangeFilter, FileImportance, classify};
use async_trait::async_trait;
use bosun_core::Result;
use bosun_core::change::Change;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct NightlyState {
    pending: PendingState,
    last_fire: Option<DateTime<Utc>>,
}

/// Fires on a calendar recurrence, optionally only when an important change
/// arrived since the last fire.
pub struct NightlyScheduler {
    base: BaseConfig,
    recurrence: Recurrence,
    branch: Option<String>,
    filter: ChangeFilter,
    importance: Arc<dyn FileImportance>,
    only_if_changed: bool,
    pending: PendingChanges,
    next_fire: Option<DateTime<Utc>>,
    last_fire: Option<DateTime<Utc>>,
}

impl NightlyScheduler {
    pub fn new(base: BaseConfig, recurrence: Recurrence) -> Self {
        Self {
            base,
            recurrence,
            branch: None,
            filter: ChangeFilter::all(),
            importance: Arc::new(AlwaysImportant),
            only_if_changed: false,
            pending: PendingChanges::default(),
            next_fire: None,
            last_fire: None,
        }
    }

    /// Build this branch; with `only_if_changed`, only its changes count.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_filter(mut self, filter: ChangeFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_importance(mut self, importance: Arc<dyn FileImportance>) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_only_if_changed(mut self, only_if_changed: bool) -> Self {
        self.only_if_changed = only_if_changed;
        self
    }

    fn schedule_after(&mut self, now: DateTime<Utc>) {
        self.next_fire = self.recurrence.next_after(now);
        if self.next_fire.is_none() {
            warn!(scheduler = %self.base.name, "Recurrence never matches; scheduler will not fire");
        }
    }

    async fn fire(&mut self, ctx: &SchedulerContext, now: DateTime<Utc>) -> Result<()> {
        let reason = format!(
            "The Nightly scheduler named '{}' triggered this build",
            self.base.name
        );
        if self.only_if_changed {
            if !self.pending.has_important() {
                info!(scheduler = %self.base.name, "No important changes; skipping build");
                return Ok(());
            }
            self.pending.fire(&self.base, ctx, reason).await?;
        } else {
            let stamps = self
                .base
                .stamps_from_changes(&[])?
                .into_iter()
                .map(|ss| match &self.branch {
                    Some(branch) => ss.with_branch(Some(branch.clone())),
                    None => ss,
                })
                .collect();
            ctx.submitter
                .submit(self.base.submission(stamps, reason, None))
                .await?;
        }
        self.last_fire = Some(now);
        Ok(())
    }
}

#[async_trait]
impl Scheduler for NightlyScheduler {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Nightly
    }

    async fn activate(
        &mut self,
        ctx: &SchedulerContext,
        state: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let saved: NightlyState = parse_state(&self.base.name, state);
        self.pending =
            PendingChanges::restore(ctx.stores.changes.as_ref(), &self.base.name, saved.pending)
                .await?;
        self.pending.next_fire = None;
        self.last_fire = saved.last_fire;
        self.schedule_after(now);
        Ok(())
    }

    fn export_state(&self) -> serde_json::Value {
        serde_json::to_value(NightlyState {
            pending: self.pending.to_state(),
            last_fire: self.last_fire,
        })
        .unwrap_or_default()
    }

    async fn on_change(
        &mut self,
        _ctx: &SchedulerContext,
        change: &Change,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.only_if_changed || !self.base.accepts_codebase(change) {
            return Ok(());
        }
        let on_branch = self.branch.is_none() || change.branch == self.branch;
        if !on_branch || !self.filter.matches(change) {
            debug!(scheduler = %self.base.name, change = change.number, "Change does not match filter");
            return Ok(());
        }
        let important = classify(self.importance.as_ref(), &self.base.name, change);
        self.pending.record(change.clone(), important, None, false);
        Ok(())
    }

    fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.next_fire
    }

    async fn on_timer(&mut self, ctx: &SchedulerContext, now: DateTime<Utc>) -> Result<()> {
        let Some(due) = self.next_fire else {
            return Ok(());
        };
        if due > now {
            return Ok(());
        }
        self.schedule_after(now.max(due));
        self.fire(ctx, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::CronField;
    use crate::schedulers::testing::Harness;
    use bosun_core::change::NewChange;
    use chrono::TimeZone;

    fn at(d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, d, h, mi, 0).unwrap()
    }

    fn nightly() -> Recurrence {
        Recurrence {
            minute: CronField::One(0),
            hour: CronField::One(3),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fires_on_schedule_with_defaults() {
        let h = Harness::new();
        let mut s = NightlyScheduler::new(BaseConfig::new("n", vec!["b1".into()]), nightly())
            .with_branch("main");
        s.activate(&h.ctx, None, at(1, 12, 0)).await.unwrap();
        assert_eq!(s.next_wakeup(), Some(at(2, 3, 0)));

        s.on_timer(&h.ctx, at(2, 3, 0)).await.unwrap();
        let sets = h.buildsets().await;
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].sourcestamps[0].branch.as_deref(), Some("main"));
        assert_eq!(s.next_wakeup(), Some(at(3, 3, 0)));
    }

    #[tokio::test]
    async fn test_only_if_changed_skips_without_important_changes() {
        let h = Harness::new();
        let only_docs = |c: &Change| -> anyhow::Result<bool> {
            Ok(c.files.iter().any(|f| !f.starts_with("docs/")))
        };
        let mut s = NightlyScheduler::new(BaseConfig::new("n", vec!["b1".into()]), nightly())
            .with_only_if_changed(true)
            .with_importance(Arc::new(only_docs));
        s.activate(&h.ctx, None, at(1, 12, 0)).await.unwrap();

        let docs = h
            .change(NewChange::new("dev").with_files(&["docs/a.md"]).at(at(1, 13, 0)))
            .await;
        s.on_change(&h.ctx, &docs, at(1, 13, 0)).await.unwrap();
        s.on_timer(&h.ctx, at(2, 3, 0)).await.unwrap();
        assert!(h.buildsets().await.is_empty());

        let code = h
            .change(NewChange::new("dev").with_files(&["src/a.rs"]).at(at(2, 13, 0)))
            .await;
        s.on_change(&h.ctx, &code, at(2, 13, 0)).await.unwrap();
        s.on_timer(&h.ctx, at(3, 3, 0)).await.unwrap();
        let sets = h.buildsets().await;
        assert_eq!(sets.len(), 1);
        // The retained unimportant change rides along.
        assert_eq!(sets[0].sourcestamps[0].change_numbers(), vec![docs.number, code.number]);
    }

    #[tokio::test]
    async fn test_early_timer_does_nothing() {
        let h = Harness::new();
        let mut s = NightlyScheduler::new(BaseConfig::new("n", vec!["b1".into()]), nightly());
        s.activate(&h.ctx, None, at(1, 12, 0)).await.unwrap();
        s.on_timer(&h.ctx, at(2, 2, 59)).await.unwrap();
        assert!(h.buildsets().await.is_empty());
        assert_eq!(s.next_wakeup(), Some(at(2, 3, 0)));
    }

    #[tokio::test]
    async fn test_failed_submit_carries_changes_to_next_night() {
        let h = Harness::new();
        let mut s = NightlyScheduler::new(BaseConfig::new("n", vec!["b1".into()]), nightly())
            .with_only_if_changed(true);
        s.activate(&h.ctx, None, at(1, 12, 0)).await.unwrap();
        let c = h.change(NewChange::new("dev").at(at(1, 13, 0))).await;
        s.on_change(&h.ctx, &c, at(1, 13, 0)).await.unwrap();

        h.fail_submissions(true);
        assert!(s.on_timer(&h.ctx, at(2, 3, 0)).await.is_err());
        assert!(s.pending.has_important());

        h.fail_submissions(false);
        s.on_timer(&h.ctx, at(3, 3, 0)).await.unwrap();
        let sets = h.buildsets().await;
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].sourcestamps[0].change_numbers(), vec![c.number]);
    }
}

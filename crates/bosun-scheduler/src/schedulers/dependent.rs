use super::pending::parse_state;
use super::{BaseConfig, Scheduler, SchedulerContext, SchedulerKind};
use async_trait::async_trait;
use bosun_core::Result;
use bosun_core::events::Event;
use bosun_core::ids::BuildSetId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, error, info};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct DependentState {
    upstream_buildsets: BTreeSet<BuildSetId>,
}

/// Fires when a buildset submitted by the upstream scheduler completes
/// successfully, building the same source stamps.
///
/// The upstream is looked up by name in the scheduler directory, so a
/// reconfigured upstream is followed automatically. Upstream buildsets are
/// tracked by id, which keeps buildsets submitted by a replaced upstream
/// instance in view.
pub struct DependentScheduler {
    base: BaseConfig,
    upstream: String,
    upstream_buildsets: BTreeSet<BuildSetId>,
    reported_missing: bool,
}

impl DependentScheduler {
    pub fn new(base: BaseConfig, upstream: impl Into<String>) -> Self {
        Self {
            base,
            upstream: upstream.into(),
            upstream_buildsets: BTreeSet::new(),
            reported_missing: false,
        }
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn tracked_buildsets(&self) -> usize {
        self.upstream_buildsets.len()
    }

    /// Whether the upstream currently exists. Reports a missing upstream once.
    fn upstream_active(&mut self, ctx: &SchedulerContext) -> bool {
        if ctx.directory.contains(&self.upstream) {
            self.reported_missing = false;
            return true;
        }
        if !self.reported_missing {
            error!(
                scheduler = %self.base.name,
                upstream = %self.upstream,
                "Upstream scheduler not found; dependent scheduler is inert"
            );
            self.reported_missing = true;
        }
        false
    }

    async fn fire_for(&mut self, ctx: &SchedulerContext, bsid: BuildSetId) -> Result<()> {
        let Some(upstream) = ctx.stores.requests.get_buildset(bsid).await? else {
            debug!(scheduler = %self.base.name, bsid = %bsid, "Upstream buildset vanished");
            return Ok(());
        };
        info!(
            scheduler = %self.base.name,
            upstream = %self.upstream,
            bsid = %bsid,
            "Upstream buildset succeeded"
        );
        let submission = self
            .base
            .submission(upstream.sourcestamps, "downstream".into(), Some(&upstream.properties));
        ctx.submitter.submit(submission).await?;
        Ok(())
    }
}

#[async_trait]
impl Scheduler for DependentScheduler {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Dependent
    }

    fn upstreams(&self) -> Vec<String> {
        vec![self.upstream.clone()]
    }

    async fn activate(
        &mut self,
        ctx: &SchedulerContext,
        state: Option<serde_json::Value>,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        let saved: DependentState = parse_state(&self.base.name, state);
        self.upstream_buildsets = saved.upstream_buildsets;
        self.upstream_active(ctx);
        Ok(())
    }

    fn export_state(&self) -> serde_json::Value {
        serde_json::to_value(DependentState {
            upstream_buildsets: self.upstream_buildsets.clone(),
        })
        .unwrap_or_default()
    }

    async fn on_event(
        &mut self,
        ctx: &SchedulerContext,
        event: &Event,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        match event {
            Event::BuildSetSubmitted(p) if p.scheduler_name.as_deref() == Some(&self.upstream) => {
                if self.upstream_active(ctx) {
                    self.upstream_buildsets.insert(p.buildset_id);
                }
            }
            Event::BuildSetCompleted(p) if self.upstream_buildsets.contains(&p.buildset_id) => {
                self.upstream_buildsets.remove(&p.buildset_id);
                if !p.results.is_successful() {
                    debug!(
                        scheduler = %self.base.name,
                        bsid = %p.buildset_id,
                        results = %p.results,
                        "Upstream buildset did not succeed"
                    );
                    return Ok(());
                }
                if self.upstream_active(ctx) {
                    self.fire_for(ctx, p.buildset_id).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

use super::{BaseConfig, Scheduler, SchedulerContext, SchedulerKind, TriggerRequest};
use async_trait::async_trait;
use bosun_core::Result;
use bosun_core::buildset::BuildSetCreated;
use chrono::{DateTime, Utc};
use tracing::info;

/// Fires only when explicitly triggered. Waiting for the result is handled
/// by the caller through the event bus, so outstanding triggers are
/// unaffected by reconfiguration.
pub struct TriggerableScheduler {
    base: BaseConfig,
}

impl TriggerableScheduler {
    pub fn new(base: BaseConfig) -> Self {
        Self { base }
    }
}

#[async_trait]
impl Scheduler for TriggerableScheduler {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Triggerable
    }

    async fn activate(
        &mut self,
        _ctx: &SchedulerContext,
        _state: Option<serde_json::Value>,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        Ok(())
    }

    fn export_state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    async fn trigger(
        &mut self,
        ctx: &SchedulerContext,
        request: TriggerRequest,
    ) -> Result<BuildSetCreated> {
        let reason = request.reason.unwrap_or_else(|| {
            format!(
                "The Triggerable scheduler named '{}' triggered this build",
                self.base.name
            )
        });
        let stamps = self.base.complete_stamps(request.sourcestamps);
        let mut submission = self
            .base
            .submission(stamps, reason, Some(&request.properties));
        if let Some(parent) = request.parent_build_id {
            submission = submission.with_parent_build(parent);
        }
        let created = ctx.submitter.submit(submission).await?;
        info!(scheduler = %self.base.name, bsid = %created.buildset_id, "Triggered");
        Ok(created)
    }
}

use super::pending::parse_state;
use super::{BaseConfig, Scheduler, SchedulerContext, SchedulerKind};
use async_trait::async_trait;
use bosun_core::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct PeriodicState {
    last_fire: Option<DateTime<Utc>>,
}

/// Fires every `period`, measured from the last fire. Ignores changes.
pub struct PeriodicScheduler {
    base: BaseConfig,
    period: Duration,
    last_fire: Option<DateTime<Utc>>,
    next_fire: Option<DateTime<Utc>>,
}

impl PeriodicScheduler {
    pub fn new(base: BaseConfig, period: Duration) -> Result<Self> {
        if period <= Duration::zero() {
            return Err(Error::InvalidConfig(format!(
                "scheduler '{}' period must be positive",
                base.name
            )));
        }
        Ok(Self {
            base,
            period,
            last_fire: None,
            next_fire: None,
        })
    }
}

#[async_trait]
impl Scheduler for PeriodicScheduler {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Periodic
    }

    async fn activate(
        &mut self,
        _ctx: &SchedulerContext,
        state: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let saved: PeriodicState = parse_state(&self.base.name, state);
        self.last_fire = saved.last_fire;
        self.next_fire = Some(match self.last_fire {
            Some(last) => last + self.period,
            None => now,
        });
        Ok(())
    }

    fn export_state(&self) -> serde_json::Value {
        serde_json::to_value(PeriodicState {
            last_fire: self.last_fire,
        })
        .unwrap_or_default()
    }

    fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.next_fire
    }

    async fn on_timer(&mut self, ctx: &SchedulerContext, now: DateTime<Utc>) -> Result<()> {
        if self.next_fire.is_none_or(|t| t > now) {
            return Ok(());
        }
        self.last_fire = Some(now);
        self.next_fire = Some(now + self.period);
        let reason = format!(
            "The Periodic scheduler named '{}' triggered this build",
            self.base.name
        );
        let stamps = self.base.stamps_from_changes(&[])?;
        ctx.submitter
            .submit(self.base.submission(stamps, reason, None))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedulers::testing::Harness;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_fires_immediately_then_every_period() {
        let h = Harness::new();
        let mut s =
            PeriodicScheduler::new(BaseConfig::new("p", vec!["b1".into()]), Duration::seconds(60))
                .unwrap();
        s.activate(&h.ctx, None, t(0)).await.unwrap();
        assert_eq!(s.next_wakeup(), Some(t(0)));

        s.on_timer(&h.ctx, t(0)).await.unwrap();
        assert_eq!(s.next_wakeup(), Some(t(60)));
        s.on_timer(&h.ctx, t(30)).await.unwrap();
        s.on_timer(&h.ctx, t(60)).await.unwrap();
        assert_eq!(h.buildsets().await.len(), 2);
    }

    #[tokio::test]
    async fn test_resumes_from_last_fire() {
        let h = Harness::new();
        let base = BaseConfig::new("p", vec!["b1".into()]);
        let mut s = PeriodicScheduler::new(base.clone(), Duration::seconds(60)).unwrap();
        s.activate(&h.ctx, None, t(0)).await.unwrap();
        s.on_timer(&h.ctx, t(0)).await.unwrap();

        let mut restarted = PeriodicScheduler::new(base, Duration::seconds(60)).unwrap();
        restarted.activate(&h.ctx, Some(s.export_state()), t(20)).await.unwrap();
        assert_eq!(restarted.next_wakeup(), Some(t(60)));
    }

    #[test]
    fn test_rejects_non_positive_period() {
        let base = BaseConfig::new("p", vec!["b1".into()]);
        assert!(PeriodicScheduler::new(base, Duration::zero()).is_err());
    }
}

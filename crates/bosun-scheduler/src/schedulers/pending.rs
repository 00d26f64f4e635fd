use super::{SchedulerContext, BaseConfig, in_arrival_order, numbers};
use bosun_core::Result;
use bosun_core::buildset::BuildSetCreated;
use bosun_core::change::Change;
use bosun_core::ports::ChangeStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Changes accumulated by a debounced scheduler since it last fired.
#[derive(Debug, Clone, Default)]
pub struct PendingChanges {
    pub important: Vec<Change>,
    pub unimportant: Vec<Change>,
    pub next_fire: Option<DateTime<Utc>>,
}

/// Persisted form: change numbers only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingState {
    pub important: Vec<u64>,
    pub unimportant: Vec<u64>,
    pub next_fire: Option<DateTime<Utc>>,
}

impl PendingChanges {
    /// Record a change. Returns `true` when an immediate-mode scheduler
    /// (no stable timer) should fire now.
    pub fn record(
        &mut self,
        change: Change,
        important: bool,
        stable_timer: Option<Duration>,
        only_important: bool,
    ) -> bool {
        if !important {
            if !only_important {
                self.unimportant.push(change);
            }
            return false;
        }
        let candidate = change.when;
        self.important.push(change);
        match stable_timer {
            None => true,
            Some(timer) => {
                let at = candidate + timer;
                self.next_fire = Some(self.next_fire.map_or(at, |current| current.max(at)));
                false
            }
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire.is_some_and(|t| t <= now)
    }

    pub fn has_important(&self) -> bool {
        !self.important.is_empty()
    }

    /// Every pending change in arrival order.
    pub fn changes(&self) -> Vec<Change> {
        in_arrival_order(self.important.clone(), self.unimportant.clone())
    }

    pub fn clear(&mut self) {
        self.important.clear();
        self.unimportant.clear();
        self.next_fire = None;
    }

    /// Submit every pending change as one buildset. The pending set is only
    /// cleared once the buildset has been recorded, so a failed submission
    /// is retried on the next firing.
    pub async fn fire(
        &mut self,
        base: &BaseConfig,
        ctx: &SchedulerContext,
        reason: String,
    ) -> Result<BuildSetCreated> {
        let created = fire_changes(base, ctx, &self.changes(), reason).await?;
        self.clear();
        Ok(created)
    }

    pub fn to_state(&self) -> PendingState {
        PendingState {
            important: numbers(&self.important),
            unimportant: numbers(&self.unimportant),
            next_fire: self.next_fire,
        }
    }

    /// Rebuild from persisted numbers. Changes that no longer exist are
    /// dropped with a warning.
    pub async fn restore(
        changes: &dyn ChangeStore,
        scheduler: &str,
        state: PendingState,
    ) -> Result<Self> {
        Ok(Self {
            important: fetch(changes, scheduler, &state.important).await?,
            unimportant: fetch(changes, scheduler, &state.unimportant).await?,
            next_fire: state.next_fire,
        })
    }
}

async fn fetch(changes: &dyn ChangeStore, scheduler: &str, numbers: &[u64]) -> Result<Vec<Change>> {
    let mut out = Vec::with_capacity(numbers.len());
    for number in numbers {
        match changes.get_change(*number).await? {
            Some(change) => out.push(change),
            None => warn!(scheduler = %scheduler, change = number, "Dropping unknown change from saved state"),
        }
    }
    Ok(out)
}

/// Parse a persisted state value, falling back to the default on mismatch.
pub(crate) fn parse_state<T>(scheduler: &str, state: Option<serde_json::Value>) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match state {
        None | Some(serde_json::Value::Null) => T::default(),
        Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
            warn!(scheduler = %scheduler, error = %e, "Discarding unreadable scheduler state");
            T::default()
        }),
    }
}

/// Submit one buildset built from `changes`.
async fn fire_changes(
    base: &BaseConfig,
    ctx: &SchedulerContext,
    changes: &[Change],
    reason: String,
) -> Result<BuildSetCreated> {
    let stamps = base.stamps_from_changes(changes)?;
    ctx.submitter.submit(base.submission(stamps, reason, None)).await
}

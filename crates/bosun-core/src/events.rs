//! Lifecycle events published on the event bus.

use crate::buildset::Results;
use crate::change::Change;
use crate::ids::*;
use crate::properties::Properties;
use crate::sourcestamp::SourceStamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All events in the Bosun system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Changes
    ChangeAdded(ChangeAddedPayload),

    // Buildsets
    BuildSetSubmitted(BuildSetSubmittedPayload),
    BuildSetCompleted(BuildSetCompletedPayload),

    // Build requests
    BuildRequestClaimed(BuildRequestClaimedPayload),
    BuildRequestUnclaimed(BuildRequestUnclaimedPayload),
    BuildRequestCompleted(BuildRequestCompletedPayload),
    BuildRequestCancelled(BuildRequestCancelledPayload),

    // Builds
    BuildStarted(BuildStartedPayload),
    BuildFinished(BuildFinishedPayload),

    // Workers
    WorkerIdle(WorkerIdlePayload),
}

/// Make a name safe to use as a single subject token.
fn token(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' => '_',
            c => c,
        })
        .collect()
}

impl Event {
    /// Returns the bus subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::ChangeAdded(_) => "change.added".to_string(),
            Event::BuildSetSubmitted(p) => format!("buildset.submitted.{}", p.buildset_id),
            Event::BuildSetCompleted(p) => format!("buildset.completed.{}", p.buildset_id),
            Event::BuildRequestClaimed(p) => {
                format!("request.claimed.{}", token(&p.builder_name))
            }
            Event::BuildRequestUnclaimed(p) => {
                format!("request.unclaimed.{}", token(&p.builder_name))
            }
            Event::BuildRequestCompleted(p) => {
                format!("request.completed.{}", token(&p.builder_name))
            }
            Event::BuildRequestCancelled(p) => {
                format!("request.cancelled.{}", token(&p.builder_name))
            }
            Event::BuildStarted(p) => {
                format!("build.started.{}.{}", token(&p.builder), p.build_id)
            }
            Event::BuildFinished(p) => {
                format!("build.finished.{}.{}", token(&p.builder), p.build_id)
            }
            Event::WorkerIdle(p) => format!("worker.idle.{}", token(&p.worker)),
        }
    }
}

// === Change Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeAddedPayload {
    pub change: Change,
}

// === Buildset Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSetSubmittedPayload {
    pub buildset_id: BuildSetId,
    pub scheduler_name: Option<String>,
    pub builder_names: Vec<String>,
    pub requests: Vec<(String, BuildRequestId)>,
    pub sourcestamps: Vec<SourceStamp>,
    pub reason: String,
    pub properties: Properties,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSetCompletedPayload {
    pub buildset_id: BuildSetId,
    pub scheduler_name: Option<String>,
    pub results: Results,
    pub complete_at: DateTime<Utc>,
}

// === Build Request Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequestClaimedPayload {
    pub request_id: BuildRequestId,
    pub buildset_id: BuildSetId,
    pub builder_name: String,
    pub master_id: MasterId,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequestUnclaimedPayload {
    pub request_id: BuildRequestId,
    pub builder_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequestCompletedPayload {
    pub request_id: BuildRequestId,
    pub buildset_id: BuildSetId,
    pub builder_name: String,
    pub results: Results,
    pub complete_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequestCancelledPayload {
    pub request_id: BuildRequestId,
    pub builder_name: String,
    pub reason: String,
}

// === Build Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStartedPayload {
    pub build_id: BuildId,
    pub builder: String,
    pub worker: String,
    pub request_ids: Vec<BuildRequestId>,
    pub sourcestamps: Vec<SourceStamp>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildFinishedPayload {
    pub build_id: BuildId,
    pub builder: String,
    pub worker: String,
    pub request_ids: Vec<BuildRequestId>,
    pub results: Results,
    pub finished_at: DateTime<Utc>,
}

// === Worker Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIdlePayload {
    pub worker: String,
    pub builder: Option<String>,
}

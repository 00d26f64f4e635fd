//! Store handles and the single path every buildset submission takes.

use bosun_core::Result;
use bosun_core::buildset::{BuildSetCreated, BuildSetSubmission};
use bosun_core::events::{BuildSetSubmittedPayload, Event};
use bosun_core::ports::{BuildRequestStore, ChangeStore, EventBus, SchedulerStateStore};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info};

/// The stores a master runs against.
#[derive(Clone)]
pub struct Stores {
    pub changes: Arc<dyn ChangeStore>,
    pub requests: Arc<dyn BuildRequestStore>,
    pub state: Arc<dyn SchedulerStateStore>,
}

impl Stores {
    /// Use one backend for every store.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: ChangeStore + BuildRequestStore + SchedulerStateStore + 'static,
    {
        Self {
            changes: store.clone(),
            requests: store.clone(),
            state: store,
        }
    }
}

/// Records buildsets and announces them on the bus.
#[derive(Clone)]
pub struct Submitter {
    requests: Arc<dyn BuildRequestStore>,
    event_bus: Arc<dyn EventBus>,
}

impl Submitter {
    pub fn new(requests: Arc<dyn BuildRequestStore>, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            requests,
            event_bus,
        }
    }

    pub async fn submit(&self, submission: BuildSetSubmission) -> Result<BuildSetCreated> {
        let submitted_at = Utc::now();
        let created = self.requests.add_buildset(&submission, submitted_at).await?;

        info!(
            bsid = %created.buildset_id,
            scheduler = submission.scheduler_name.as_deref().unwrap_or("-"),
            builders = ?submission.builder_names,
            reason = %submission.reason,
            "Buildset submitted"
        );

        let event = Event::BuildSetSubmitted(BuildSetSubmittedPayload {
            buildset_id: created.buildset_id,
            scheduler_name: submission.scheduler_name,
            builder_names: submission.builder_names,
            requests: created.requests.clone(),
            sourcestamps: submission.sourcestamps,
            reason: submission.reason,
            properties: submission.properties,
            submitted_at,
        });
        // The buildset is durable at this point; a lost event only delays pickup.
        if let Err(e) = self.event_bus.publish(event).await {
            error!(bsid = %created.buildset_id, error = %e, "Failed to publish buildset submission");
        }

        Ok(created)
    }
}

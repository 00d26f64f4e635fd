//! The master: schedulers, coordinator and canceller wired to one store and
//! one event bus.

use crate::canceller::{CancelRule, OldBuildCanceller};
use crate::config::MasterConfig;
use crate::coordinator::{Coordinator, CoordinatorService, Policies, RunningBuild, WorkerPool};
use crate::debounce::LoopTrigger;
use crate::schedulers::{
    SchedulerContext, SchedulerDirectory, SchedulerKind, TriggerRequest, TryCredentials, TryJob,
};
use crate::submit::{Stores, Submitter};
use crate::supervisor::{ReconcilePlan, SchedulerSupervisor};
use bosun_core::buildset::{
    BuildRequest, BuildRequestFilter, BuildSet, BuildSetCreated, BuildSetSubmission, Results,
};
use bosun_core::change::{Change, NewChange};
use bosun_core::events::{ChangeAddedPayload, Event, WorkerIdlePayload};
use bosun_core::ids::{BuildId, BuildRequestId, BuildSetId, MasterId};
use bosun_core::ports::{BuildExecutor, EventBus, EventStream};
use bosun_core::{Error, Result};
use futures::StreamExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A triggered buildset and a future for its final result.
pub struct TriggerHandle {
    pub buildset_id: BuildSetId,
    pub requests: Vec<(String, BuildRequestId)>,
    result: BoxFuture<'static, Result<Results>>,
}

impl TriggerHandle {
    /// Wait for the buildset to complete.
    pub async fn wait(self) -> Result<Results> {
        self.result.await
    }
}

async fn wait_for_completion(mut events: EventStream, buildset_id: BuildSetId) -> Result<Results> {
    while let Some(event) = events.next().await {
        if let Event::BuildSetCompleted(p) = event? {
            if p.buildset_id == buildset_id {
                return Ok(p.results);
            }
        }
    }
    Err(Error::EventBus(format!(
        "event stream closed before buildset {buildset_id} completed"
    )))
}

pub struct Master {
    master_id: MasterId,
    stores: Stores,
    event_bus: Arc<dyn EventBus>,
    submitter: Submitter,
    supervisor: Arc<SchedulerSupervisor>,
    coordinator: Arc<Coordinator>,
    canceller: Arc<OldBuildCanceller>,
    canceller_rules: Mutex<Vec<CancelRule>>,
    service: tokio::sync::Mutex<Option<CoordinatorService>>,
    trigger: LoopTrigger,
    pump: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Master {
    /// Validate `config` and start every component.
    pub async fn start(
        config: &MasterConfig,
        stores: Stores,
        event_bus: Arc<dyn EventBus>,
        executor: Arc<dyn BuildExecutor>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let schedulers = config.build_schedulers()?;
        let rules = config.canceller_rules()?;

        let master_id = MasterId::new();
        let cancel = CancellationToken::new();
        let coordinator = Arc::new(Coordinator::new(
            master_id,
            stores.requests.clone(),
            executor,
            event_bus.clone(),
            WorkerPool::new(&config.workers, &config.builders),
            Policies::from_settings(&config.coordinator),
            config.coordinator_config(),
        ));
        let canceller = Arc::new(OldBuildCanceller::new(coordinator.clone(), rules.clone()));
        let submitter = Submitter::new(stores.requests.clone(), event_bus.clone());
        let supervisor = Arc::new(SchedulerSupervisor::new(
            SchedulerContext {
                stores: stores.clone(),
                submitter: submitter.clone(),
                directory: SchedulerDirectory::default(),
            },
            cancel.child_token(),
        ));

        // Subscribe before anything can publish.
        let events = event_bus.subscribe(">").await?;
        let service = coordinator.spawn(cancel.child_token());
        let trigger = service.handle();
        let pump = tokio::spawn(run_pump(
            events,
            supervisor.clone(),
            canceller.clone(),
            trigger.clone(),
            cancel.child_token(),
        ));

        supervisor.reconcile(schedulers).await?;
        // Pick up requests left over from a previous run.
        trigger.trigger();

        info!(master = %config.master.name, master_id = %master_id, "Master started");
        Ok(Arc::new(Self {
            master_id,
            stores,
            event_bus,
            submitter,
            supervisor,
            coordinator,
            canceller,
            canceller_rules: Mutex::new(rules),
            service: tokio::sync::Mutex::new(Some(service)),
            trigger,
            pump: tokio::sync::Mutex::new(Some(pump)),
            cancel,
        }))
    }

    pub fn master_id(&self) -> MasterId {
        self.master_id
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Replace the coordinator's strategies with programmatic ones.
    pub fn set_policies(&self, policies: Policies) {
        self.coordinator.set_policies(policies);
        self.trigger.trigger();
    }

    /// Record a change and hand it to every scheduler.
    pub async fn add_change(&self, change: NewChange) -> Result<Change> {
        let change = self.stores.changes.add_change(change).await?;
        debug!(change = change.number, branch = ?change.branch, "Change added");
        self.event_bus
            .publish(Event::ChangeAdded(ChangeAddedPayload {
                change: change.clone(),
            }))
            .await?;
        Ok(change)
    }

    pub async fn submit_buildset(&self, submission: BuildSetSubmission) -> Result<BuildSetCreated> {
        if submission.builder_names.is_empty() {
            return Err(Error::InvalidInput("buildset names no builders".into()));
        }
        if let Some(unknown) = submission
            .builder_names
            .iter()
            .find(|b| !self.coordinator.has_builder(b))
        {
            return Err(Error::InvalidInput(format!("unknown builder '{unknown}'")));
        }
        self.submitter.submit(submission).await
    }

    /// Fire a triggerable scheduler. The returned handle resolves when the
    /// buildset completes, even across reconfiguration.
    pub async fn trigger(&self, scheduler: &str, request: TriggerRequest) -> Result<TriggerHandle> {
        let events = self.event_bus.subscribe("buildset.completed.*").await?;
        let created = self.supervisor.trigger(scheduler, request).await?;
        let buildset_id = created.buildset_id;
        Ok(TriggerHandle {
            buildset_id,
            requests: created.requests,
            result: Box::pin(wait_for_completion(events, buildset_id)),
        })
    }

    pub async fn submit_try_job(
        &self,
        scheduler: &str,
        job: TryJob,
        credentials: Option<TryCredentials>,
    ) -> Result<BuildSetCreated> {
        self.supervisor.submit_try(scheduler, job, credentials).await
    }

    /// A worker connected or finished its work.
    pub async fn worker_became_idle(&self, builder: Option<&str>, worker: &str) -> Result<()> {
        if !self.coordinator.set_worker_online(worker, true) {
            return Err(Error::InvalidInput(format!("unknown worker '{worker}'")));
        }
        self.event_bus
            .publish(Event::WorkerIdle(WorkerIdlePayload {
                worker: worker.to_string(),
                builder: builder.map(str::to_string),
            }))
            .await
    }

    pub fn worker_disconnected(&self, worker: &str) -> Result<()> {
        if !self.coordinator.set_worker_online(worker, false) {
            return Err(Error::InvalidInput(format!("unknown worker '{worker}'")));
        }
        info!(worker = %worker, "Worker disconnected");
        Ok(())
    }

    pub async fn worker_rejected_build(&self, request_id: BuildRequestId) -> Result<()> {
        if !self.coordinator.worker_rejected_build(request_id).await? {
            return Err(Error::BuildRequestNotFound(request_id.to_string()));
        }
        self.trigger.trigger();
        Ok(())
    }

    pub async fn build_finished(&self, build_id: BuildId, results: Results) -> Result<()> {
        self.coordinator.build_finished(build_id, results).await
    }

    pub async fn cancel_build_request(&self, id: BuildRequestId, reason: &str) -> Result<()> {
        self.coordinator.cancel_build_request(id, reason).await
    }

    pub async fn cancel_build(&self, id: BuildId, reason: &str) -> Result<()> {
        self.coordinator.cancel_build(id, reason).await
    }

    /// Apply a new configuration. An invalid configuration changes nothing.
    pub async fn reconfigure(&self, config: &MasterConfig) -> Result<ReconcilePlan> {
        config.validate()?;
        let schedulers = config.build_schedulers()?;
        let rules = config.canceller_rules()?;

        self.canceller.begin_reconfig();
        let plan = match self.supervisor.reconcile(schedulers).await {
            Ok(plan) => plan,
            Err(e) => {
                let old = self.canceller_rules.lock().clone();
                self.canceller.finish_reconfig(old);
                return Err(e);
            }
        };
        self.coordinator.reconfigure(
            &config.workers,
            &config.builders,
            Policies::from_settings(&config.coordinator),
        );
        *self.canceller_rules.lock() = rules.clone();
        self.canceller.finish_reconfig(rules);
        self.trigger.trigger();
        info!(master_id = %self.master_id, "Master reconfigured");
        Ok(plan)
    }

    /// Stop every component. Scheduler state is persisted.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(service) = self.service.lock().await.take() {
            service.stop().await;
        }
        if let Some(pump) = self.pump.lock().await.take() {
            let _ = pump.await;
        }
        self.supervisor.shutdown().await;
        info!(master_id = %self.master_id, "Master stopped");
    }

    // === Projections ===

    pub async fn get_buildset(&self, id: BuildSetId) -> Result<BuildSet> {
        self.stores
            .requests
            .get_buildset(id)
            .await?
            .ok_or_else(|| Error::BuildSetNotFound(id.to_string()))
    }

    pub async fn list_buildsets(&self, complete: Option<bool>) -> Result<Vec<BuildSet>> {
        self.stores.requests.list_buildsets(complete).await
    }

    pub async fn get_build_request(&self, id: BuildRequestId) -> Result<BuildRequest> {
        self.stores
            .requests
            .get_build_request(id)
            .await?
            .ok_or_else(|| Error::BuildRequestNotFound(id.to_string()))
    }

    pub async fn list_build_requests(&self, filter: &BuildRequestFilter) -> Result<Vec<BuildRequest>> {
        self.stores.requests.list_build_requests(filter).await
    }

    pub fn running_builds(&self) -> Vec<RunningBuild> {
        self.coordinator.running_builds()
    }

    pub async fn schedulers(&self) -> Vec<(String, SchedulerKind)> {
        self.supervisor.schedulers().await
    }
}

/// Route bus events to the components that react to them.
async fn run_pump(
    mut events: EventStream,
    supervisor: Arc<SchedulerSupervisor>,
    canceller: Arc<OldBuildCanceller>,
    trigger: LoopTrigger,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            next = events.next() => match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!(error = %e, "Event stream error");
                    continue;
                }
                None => {
                    error!("Event stream closed; master no longer reacts to events");
                    break;
                }
            },
        };

        match &event {
            Event::ChangeAdded(p) => supervisor.dispatch_change(&p.change).await,
            Event::BuildSetSubmitted(_) => {
                supervisor.dispatch_event(&event).await;
                trigger.trigger();
            }
            Event::BuildSetCompleted(_) => supervisor.dispatch_event(&event).await,
            Event::BuildRequestUnclaimed(_) | Event::WorkerIdle(_) | Event::BuildFinished(_) => {
                trigger.trigger();
            }
            _ => {}
        }
        canceller.handle_event(&event).await;
    }
    debug!("Event pump stopped");
}

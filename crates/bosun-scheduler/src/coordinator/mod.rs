//! Request coordinator: matches unclaimed build requests to free workers.
//!
//! Each pass walks builders in prioritizer order and starts at most one
//! build before re-reading the queue, so every decision is made on a fresh
//! snapshot. Mutual exclusion with other masters comes only from the store's
//! conditional claim; no lock is held across an await.

pub mod policies;
pub mod workers;

pub use policies::{
    BuilderInfo, BuilderPrioritizer, MergePolicy, NextBuildPolicy, NextWorkerPolicy, Policies,
    PolicySettings,
};
pub use workers::{BuilderConfig, WorkerConfig, WorkerPool, WorkerSlot};

use crate::canceller::WorkCanceller;
use crate::debounce::{DebouncedAction, Debouncer, LoopTrigger};
use async_trait::async_trait;
use bosun_core::build::{BuildAssignment, StartOutcome};
use bosun_core::buildset::{BuildRequest, BuildRequestFilter, BuildSet, CompletedBuildSet, Results};
use bosun_core::events::*;
use bosun_core::ids::{BuildId, BuildRequestId, BuildSetId, MasterId};
use bosun_core::ports::{BuildExecutor, BuildRequestStore, EventBus};
use bosun_core::sourcestamp::SourceStamp;
use bosun_core::{Error, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Claim races tolerated in one pass before waiting for the next trigger.
const MAX_CONTENTION_RETRIES: usize = 16;

/// An unclaimed request together with its buildset.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request: BuildRequest,
    pub buildset: Arc<BuildSet>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Claims older than this are released by the expiry loop.
    pub claim_timeout: Duration,
    pub reclaim_interval: Duration,
    pub expiry_check_interval: Duration,
    /// Quiet period before a triggered pass runs.
    pub loop_delay: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            claim_timeout: Duration::from_secs(300),
            reclaim_interval: Duration::from_secs(60),
            expiry_check_interval: Duration::from_secs(30),
            loop_delay: Duration::ZERO,
        }
    }
}

/// A build this coordinator started and has not seen finish.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningBuild {
    pub build_id: BuildId,
    pub builder: String,
    pub worker: String,
    pub requests: Vec<(BuildRequestId, BuildSetId)>,
    pub sourcestamps: Vec<SourceStamp>,
    pub started_at: DateTime<Utc>,
}

impl RunningBuild {
    pub fn request_ids(&self) -> Vec<BuildRequestId> {
        self.requests.iter().map(|(id, _)| *id).collect()
    }

    fn has_request(&self, id: BuildRequestId) -> bool {
        self.requests.iter().any(|(r, _)| *r == id)
    }
}

enum Attempt {
    Started,
    /// Something changed; re-read the queue.
    Retry,
    /// Builder cannot start anything now.
    Idle,
}

struct State {
    pool: WorkerPool,
    policies: Policies,
    running: HashMap<BuildId, RunningBuild>,
    /// Cancellations for claimed requests that had no running build yet,
    /// with their reasons. Honoured when this master next claims or starts
    /// them.
    cancel_pending: HashMap<BuildRequestId, String>,
}

impl State {
    fn take_cancellations(&mut self, ids: &[BuildRequestId]) -> HashMap<BuildRequestId, String> {
        ids.iter()
            .filter_map(|id| self.cancel_pending.remove(id).map(|reason| (*id, reason)))
            .collect()
    }
}

fn contained<T>(policy: &str, builder: &str, result: anyhow::Result<T>, fallback: T) -> T {
    result.unwrap_or_else(|e| {
        warn!(policy, builder = %builder, error = %e, "Coordinator policy failed; using safe fallback");
        fallback
    })
}

/// Merge each primary stamp with the same codebase's stamps from the rest
/// of the group.
fn merged_stamps(builder: &str, group: &[PendingRequest]) -> Vec<SourceStamp> {
    let Some((primary, rest)) = group.split_first() else {
        return Vec::new();
    };
    primary
        .buildset
        .sourcestamps
        .iter()
        .map(|stamp| {
            let others: Vec<SourceStamp> = rest
                .iter()
                .flat_map(|p| p.buildset.sourcestamps.iter())
                .filter(|s| s.codebase == stamp.codebase)
                .cloned()
                .collect();
            stamp.merge_with(&others).unwrap_or_else(|e| {
                warn!(builder = %builder, error = %e, "Merged requests have incompatible stamps; using primary");
                stamp.clone()
            })
        })
        .collect()
}

pub struct Coordinator {
    master_id: MasterId,
    requests: Arc<dyn BuildRequestStore>,
    executor: Arc<dyn BuildExecutor>,
    event_bus: Arc<dyn EventBus>,
    config: CoordinatorConfig,
    state: Mutex<State>,
}

impl Coordinator {
    pub fn new(
        master_id: MasterId,
        requests: Arc<dyn BuildRequestStore>,
        executor: Arc<dyn BuildExecutor>,
        event_bus: Arc<dyn EventBus>,
        pool: WorkerPool,
        policies: Policies,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            master_id,
            requests,
            executor,
            event_bus,
            config,
            state: Mutex::new(State {
                pool,
                policies,
                running: HashMap::new(),
                cancel_pending: HashMap::new(),
            }),
        }
    }

    pub fn master_id(&self) -> MasterId {
        self.master_id
    }

    pub fn reconfigure(&self, workers: &[WorkerConfig], builders: &[BuilderConfig], policies: Policies) {
        let mut state = self.state.lock();
        state.pool.reconfigure(workers, builders);
        state.policies = policies;
    }

    pub fn set_policies(&self, policies: Policies) {
        self.state.lock().policies = policies;
    }

    pub fn has_builder(&self, builder: &str) -> bool {
        self.state.lock().pool.has_builder(builder)
    }

    /// Mark a worker connected or gone. Returns `false` for unknown workers.
    pub fn set_worker_online(&self, worker: &str, online: bool) -> bool {
        self.state.lock().pool.set_online(worker, online)
    }

    pub fn running_builds(&self) -> Vec<RunningBuild> {
        let mut builds: Vec<RunningBuild> = self.state.lock().running.values().cloned().collect();
        builds.sort_by_key(|b| b.started_at);
        builds
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.event_bus.publish(event).await {
            error!(error = %e, "Failed to publish coordinator event");
        }
    }

    /// One coordinator pass. Returns the number of builds started.
    pub async fn run_once(&self) -> Result<usize> {
        let mut excluded: HashSet<String> = HashSet::new();
        let mut started = 0;
        let mut retries = 0;

        loop {
            let candidates: Vec<String> = {
                let state = self.state.lock();
                state
                    .pool
                    .builder_names()
                    .into_iter()
                    .filter(|b| !state.pool.available_for(b, &excluded).is_empty())
                    .collect()
            };
            if candidates.is_empty() {
                break;
            }

            let mut runnable: BTreeMap<String, Vec<BuildRequest>> = BTreeMap::new();
            for builder in candidates {
                let pending = self
                    .requests
                    .list_build_requests(&BuildRequestFilter::unclaimed_for(builder.clone()))
                    .await?;
                if !pending.is_empty() {
                    runnable.insert(builder, pending);
                }
            }
            if runnable.is_empty() {
                break;
            }

            let mut progressed = false;
            for builder in self.prioritize(&runnable) {
                let Some(pending) = runnable.remove(&builder) else {
                    continue;
                };
                match self.try_start(&builder, pending, &mut excluded).await? {
                    Attempt::Started => {
                        started += 1;
                        progressed = true;
                        break;
                    }
                    Attempt::Retry => {
                        retries += 1;
                        progressed = true;
                        break;
                    }
                    Attempt::Idle => {}
                }
            }
            if !progressed || retries > MAX_CONTENTION_RETRIES {
                break;
            }
        }
        Ok(started)
    }

    fn prioritize(&self, runnable: &BTreeMap<String, Vec<BuildRequest>>) -> Vec<String> {
        let (prioritizer, infos) = {
            let state = self.state.lock();
            let infos: Vec<BuilderInfo> = runnable
                .iter()
                .map(|(name, requests)| BuilderInfo {
                    name: name.clone(),
                    priority: state.pool.builder_priority(name),
                    oldest_request: requests.iter().map(|r| r.submitted_at).min(),
                })
                .collect();
            (state.policies.prioritizer.clone(), infos)
        };
        match prioritizer.prioritize(&infos) {
            Ok(order) => order,
            Err(e) => {
                warn!(error = %e, "Builder prioritizer failed; using oldest request order");
                policies::by_oldest(&infos)
            }
        }
    }

    async fn load_pending(&self, requests: Vec<BuildRequest>) -> Result<Vec<PendingRequest>> {
        let mut buildsets: HashMap<BuildSetId, Arc<BuildSet>> = HashMap::new();
        let mut pending = Vec::with_capacity(requests.len());
        for request in requests {
            let buildset = match buildsets.get(&request.buildset_id) {
                Some(bs) => bs.clone(),
                None => match self.requests.get_buildset(request.buildset_id).await? {
                    Some(bs) => {
                        let bs = Arc::new(bs);
                        buildsets.insert(request.buildset_id, bs.clone());
                        bs
                    }
                    None => {
                        warn!(request_id = %request.id, bsid = %request.buildset_id, "Request has no buildset");
                        continue;
                    }
                },
            };
            pending.push(PendingRequest { request, buildset });
        }
        Ok(pending)
    }

    async fn try_start(
        &self,
        builder: &str,
        requests: Vec<BuildRequest>,
        excluded: &mut HashSet<String>,
    ) -> Result<Attempt> {
        let candidates = self.load_pending(requests).await?;
        let policies = self.state.lock().policies.clone();

        let chosen = contained(
            "next_build",
            builder,
            policies.next_build.next_build(builder, &candidates),
            None,
        );
        let Some(primary) = chosen.and_then(|i| candidates.get(i)).cloned() else {
            return Ok(Attempt::Idle);
        };
        let mut group = vec![primary.clone()];
        for other in &candidates {
            if other.request.id == primary.request.id {
                continue;
            }
            let merge = policies.merge.can_merge(builder, &primary, other);
            if contained("merge_requests", builder, merge, false) {
                group.push(other.clone());
            }
        }

        let slots = self.state.lock().pool.available_for(builder, excluded);
        let pick = contained(
            "next_worker",
            builder,
            policies.next_worker.next_worker(builder, &slots),
            None,
        );
        let Some(worker) = pick.and_then(|i| slots.get(i)).map(|s| s.name.clone()) else {
            return Ok(Attempt::Idle);
        };
        if !self.state.lock().pool.acquire(&worker) {
            return Ok(Attempt::Retry);
        }

        let ids: Vec<BuildRequestId> = group.iter().map(|p| p.request.id).collect();
        let claimed_at = Utc::now();
        if let Err(e) = self
            .requests
            .claim_build_requests(&ids, claimed_at, self.master_id)
            .await
        {
            self.state.lock().pool.release(&worker);
            if e.is_contention() {
                debug!(builder = %builder, error = %e, "Lost claim race; re-evaluating");
                return Ok(Attempt::Retry);
            }
            return Err(e);
        }
        info!(builder = %builder, worker = %worker, requests = ids.len(), "Claimed build requests");
        for p in &group {
            self.publish(Event::BuildRequestClaimed(BuildRequestClaimedPayload {
                request_id: p.request.id,
                buildset_id: p.request.buildset_id,
                builder_name: builder.to_string(),
                master_id: self.master_id,
                claimed_at,
            }))
            .await;
        }

        let cancelled = self.state.lock().take_cancellations(&ids);
        if !cancelled.is_empty() {
            let (dropped, kept): (Vec<PendingRequest>, Vec<PendingRequest>) = group
                .into_iter()
                .partition(|p| cancelled.contains_key(&p.request.id));
            group = kept;
            self.complete_cancelled(builder, &dropped).await?;
        }
        let ids: Vec<BuildRequestId> = group.iter().map(|p| p.request.id).collect();
        let Some(primary) = group.first().cloned() else {
            self.state.lock().pool.release(&worker);
            return Ok(Attempt::Retry);
        };

        let assignment = BuildAssignment {
            build_id: BuildId::new(),
            builder: builder.to_string(),
            worker: worker.clone(),
            request_ids: ids.clone(),
            sourcestamps: merged_stamps(builder, &group),
            properties: primary.buildset.properties.clone(),
            reason: group
                .iter()
                .map(|p| p.buildset.reason.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        };

        let rejection = match self.executor.start_build(&assignment).await {
            Ok(StartOutcome::Started) => None,
            Ok(StartOutcome::Rejected { reason }) => Some(reason),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = rejection {
            warn!(builder = %builder, worker = %worker, reason = %reason, "Worker rejected build; returning requests");
            self.state.lock().pool.release(&worker);
            excluded.insert(worker);
            self.return_requests(builder, &ids).await;
            return Ok(Attempt::Retry);
        }

        let started_at = Utc::now();
        let running = RunningBuild {
            build_id: assignment.build_id,
            builder: builder.to_string(),
            worker: worker.clone(),
            requests: group
                .iter()
                .map(|p| (p.request.id, p.request.buildset_id))
                .collect(),
            sourcestamps: assignment.sourcestamps.clone(),
            started_at,
        };
        let late = {
            let mut state = self.state.lock();
            state.running.insert(running.build_id, running);
            state.take_cancellations(&ids)
        };
        info!(build_id = %assignment.build_id, builder = %builder, worker = %worker, "Build started");
        self.publish(Event::BuildStarted(BuildStartedPayload {
            build_id: assignment.build_id,
            builder: builder.to_string(),
            worker,
            request_ids: ids,
            sourcestamps: assignment.sourcestamps,
            started_at,
        }))
        .await;
        if let Some(reason) = late.values().next() {
            info!(build_id = %assignment.build_id, "Build request cancelled while starting; signalling build");
            if let Err(e) = self.executor.cancel_build(assignment.build_id, reason).await {
                warn!(build_id = %assignment.build_id, error = %e, "Executor failed to cancel build");
            }
        }
        Ok(Attempt::Started)
    }

    /// Complete claimed requests whose cancellation arrived before they
    /// started.
    async fn complete_cancelled(&self, builder: &str, requests: &[PendingRequest]) -> Result<()> {
        let ids: Vec<BuildRequestId> = requests.iter().map(|p| p.request.id).collect();
        let pairs: Vec<(BuildRequestId, BuildSetId)> = requests
            .iter()
            .map(|p| (p.request.id, p.request.buildset_id))
            .collect();
        let now = Utc::now();
        let completed = self
            .requests
            .complete_build_requests(&ids, Results::Cancelled, now)
            .await?;
        info!(builder = %builder, requests = ids.len(), "Completed cancelled build requests without starting");
        self.announce_completion(builder, &pairs, Results::Cancelled, now, completed)
            .await;
        Ok(())
    }

    /// Release claims held by this master and announce them.
    async fn return_requests(&self, builder: &str, ids: &[BuildRequestId]) {
        if let Err(e) = self.requests.unclaim_build_requests(ids, self.master_id).await {
            error!(builder = %builder, error = %e, "Failed to unclaim build requests");
            return;
        }
        for id in ids {
            self.publish(Event::BuildRequestUnclaimed(BuildRequestUnclaimedPayload {
                request_id: *id,
                builder_name: builder.to_string(),
            }))
            .await;
        }
    }

    async fn announce_completion(
        &self,
        builder: &str,
        requests: &[(BuildRequestId, BuildSetId)],
        results: Results,
        complete_at: DateTime<Utc>,
        buildsets: Vec<CompletedBuildSet>,
    ) {
        for (request_id, buildset_id) in requests {
            self.publish(Event::BuildRequestCompleted(BuildRequestCompletedPayload {
                request_id: *request_id,
                buildset_id: *buildset_id,
                builder_name: builder.to_string(),
                results,
                complete_at,
            }))
            .await;
        }
        for bs in buildsets {
            info!(bsid = %bs.buildset_id, results = %bs.results, "Buildset complete");
            self.publish(Event::BuildSetCompleted(BuildSetCompletedPayload {
                buildset_id: bs.buildset_id,
                scheduler_name: bs.scheduler_name,
                results: bs.results,
                complete_at: bs.complete_at,
            }))
            .await;
        }
    }

    /// Record the end of a build: every merged request completes with
    /// `results`.
    pub async fn build_finished(&self, build_id: BuildId, results: Results) -> Result<()> {
        let build = {
            let mut state = self.state.lock();
            let build = state
                .running
                .remove(&build_id)
                .ok_or_else(|| Error::BuildNotFound(build_id.to_string()))?;
            state.pool.release(&build.worker);
            build
        };
        let ids = build.request_ids();
        let now = Utc::now();

        match self
            .requests
            .reclaim_build_requests(&ids, self.master_id, now)
            .await
        {
            Ok(()) => {
                let completed = self
                    .requests
                    .complete_build_requests(&ids, results, now)
                    .await?;
                info!(build_id = %build_id, builder = %build.builder, results = %results, "Build finished");
                self.announce_completion(&build.builder, &build.requests, results, now, completed)
                    .await;
            }
            Err(e) if e.is_contention() => {
                warn!(build_id = %build_id, error = %e, "Build finished after its claim was lost; results discarded");
            }
            Err(e) => return Err(e),
        }

        self.publish(Event::BuildFinished(BuildFinishedPayload {
            build_id,
            builder: build.builder,
            worker: build.worker,
            request_ids: ids,
            results,
            finished_at: now,
        }))
        .await;
        Ok(())
    }

    /// The execution layer gave up on a build before it ran. Its requests
    /// return to the pool. Returns `false` if no running build holds the
    /// request.
    pub async fn worker_rejected_build(&self, request_id: BuildRequestId) -> Result<bool> {
        let build = {
            let mut state = self.state.lock();
            let Some(build_id) = state
                .running
                .values()
                .find(|b| b.has_request(request_id))
                .map(|b| b.build_id)
            else {
                return Ok(false);
            };
            let build = state.running.remove(&build_id);
            if let Some(build) = &build {
                state.pool.release(&build.worker);
            }
            build
        };
        let Some(build) = build else {
            return Ok(false);
        };
        warn!(build_id = %build.build_id, worker = %build.worker, "Build rejected by worker");
        self.return_requests(&build.builder, &build.request_ids()).await;
        Ok(true)
    }

    /// Cancel a request. Unclaimed requests complete as cancelled right
    /// away; claimed ones are signalled to the executor when this master
    /// runs them.
    pub async fn cancel_build_request(&self, id: BuildRequestId, reason: &str) -> Result<()> {
        let request = self
            .requests
            .get_build_request(id)
            .await?
            .ok_or_else(|| Error::BuildRequestNotFound(id.to_string()))?;
        if request.complete {
            return Err(Error::AlreadyComplete(id.to_string()));
        }

        let cancelled = Event::BuildRequestCancelled(BuildRequestCancelledPayload {
            request_id: id,
            builder_name: request.builder_name.clone(),
            reason: reason.to_string(),
        });

        if request.claimed_by.is_none() {
            let now = Utc::now();
            match self.requests.claim_build_requests(&[id], now, self.master_id).await {
                Ok(()) => {
                    let completed = self
                        .requests
                        .complete_build_requests(&[id], Results::Cancelled, now)
                        .await?;
                    info!(request_id = %id, builder = %request.builder_name, reason = %reason, "Cancelled pending build request");
                    self.publish(cancelled).await;
                    self.announce_completion(
                        &request.builder_name,
                        &[(id, request.buildset_id)],
                        Results::Cancelled,
                        now,
                        completed,
                    )
                    .await;
                    return Ok(());
                }
                Err(e) if e.is_contention() => {
                    debug!(request_id = %id, "Request claimed while cancelling; signalling build");
                }
                Err(e) => return Err(e),
            }
        }

        let build_id = {
            let mut state = self.state.lock();
            let build_id = state
                .running
                .values()
                .find(|b| b.has_request(id))
                .map(|b| b.build_id);
            if build_id.is_none() {
                state.cancel_pending.insert(id, reason.to_string());
            }
            build_id
        };
        match build_id {
            Some(build_id) => {
                if let Err(e) = self.executor.cancel_build(build_id, reason).await {
                    warn!(build_id = %build_id, error = %e, "Executor failed to cancel build");
                }
            }
            None => debug!(request_id = %id, "Claimed request not running here; cancellation recorded"),
        }
        info!(request_id = %id, builder = %request.builder_name, reason = %reason, "Cancellation requested for claimed build request");
        self.publish(cancelled).await;
        Ok(())
    }

    pub async fn cancel_build(&self, build_id: BuildId, reason: &str) -> Result<()> {
        if !self.state.lock().running.contains_key(&build_id) {
            return Err(Error::BuildNotFound(build_id.to_string()));
        }
        info!(build_id = %build_id, reason = %reason, "Cancelling build");
        self.executor.cancel_build(build_id, reason).await
    }

    /// Refresh claims for every running build. Builds whose claim was lost
    /// are cancelled.
    pub async fn reclaim_running(&self) -> Result<()> {
        let builds: Vec<RunningBuild> = self.state.lock().running.values().cloned().collect();
        let now = Utc::now();
        for build in builds {
            match self
                .requests
                .reclaim_build_requests(&build.request_ids(), self.master_id, now)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_contention() => {
                    warn!(build_id = %build.build_id, builder = %build.builder, "Claim lost for running build; cancelling");
                    {
                        let mut state = self.state.lock();
                        if state.running.remove(&build.build_id).is_some() {
                            state.pool.release(&build.worker);
                        }
                    }
                    if let Err(e) = self.executor.cancel_build(build.build_id, "claim lost").await {
                        warn!(build_id = %build.build_id, error = %e, "Executor failed to cancel build");
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Release claims older than the claim timeout, from any master.
    pub async fn expire_claims(&self) -> Result<Vec<BuildRequestId>> {
        let timeout = chrono::Duration::from_std(self.config.claim_timeout)
            .map_err(|e| Error::InvalidConfig(format!("claim timeout: {e}")))?;
        let expired = self.requests.unclaim_expired(Utc::now() - timeout).await?;
        if expired.is_empty() {
            return Ok(expired);
        }
        info!(count = expired.len(), "Released expired claims");
        for id in &expired {
            if let Some(request) = self.requests.get_build_request(*id).await? {
                self.publish(Event::BuildRequestUnclaimed(BuildRequestUnclaimedPayload {
                    request_id: *id,
                    builder_name: request.builder_name,
                }))
                .await;
            }
        }
        Ok(expired)
    }

    /// Start the debounced pass loop and the reclaim and expiry loops.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> CoordinatorService {
        let action: DebouncedAction = {
            let coordinator = self.clone();
            Arc::new(move || {
                let coordinator = coordinator.clone();
                async move {
                    match coordinator.run_once().await {
                        Ok(0) => {}
                        Ok(started) => debug!(started, "Coordinator pass complete"),
                        Err(e) => error!(error = %e, "Coordinator pass failed"),
                    }
                }
                .boxed()
            })
        };
        let debouncer = Debouncer::spawn("coordinator", self.config.loop_delay, action);
        let trigger = debouncer.handle();

        let reclaim = tokio::spawn({
            let coordinator = self.clone();
            let cancel = cancel.clone();
            let trigger = trigger.clone();
            async move {
                let mut ticker = tokio::time::interval(coordinator.config.reclaim_interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = coordinator.reclaim_running().await {
                                error!(error = %e, "Reclaim failed");
                            }
                            // Also picks up work whose announcement was missed.
                            trigger.trigger();
                        }
                    }
                }
            }
        });

        let expiry = tokio::spawn({
            let coordinator = self.clone();
            let cancel = cancel.clone();
            let trigger = trigger.clone();
            async move {
                let mut ticker = tokio::time::interval(coordinator.config.expiry_check_interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => match coordinator.expire_claims().await {
                            Ok(expired) if !expired.is_empty() => trigger.trigger(),
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "Claim expiry failed"),
                        }
                    }
                }
            }
        });

        CoordinatorService {
            debouncer,
            trigger,
            cancel,
            tasks: vec![reclaim, expiry],
        }
    }
}

#[async_trait]
impl WorkCanceller for Coordinator {
    async fn cancel_request(&self, id: BuildRequestId, reason: &str) -> Result<()> {
        self.cancel_build_request(id, reason).await
    }

    async fn cancel_build(&self, id: BuildId, reason: &str) -> Result<()> {
        Coordinator::cancel_build(self, id, reason).await
    }
}

/// Background tasks of a running coordinator.
pub struct CoordinatorService {
    debouncer: Debouncer,
    trigger: LoopTrigger,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl CoordinatorService {
    /// Request a coordinator pass.
    pub fn trigger(&self) {
        self.trigger.trigger();
    }

    pub fn handle(&self) -> LoopTrigger {
        self.trigger.clone()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        self.debouncer.stop().await;
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalEventBus;
    use bosun_core::buildset::BuildSetSubmission;
    use bosun_core::properties::Properties;
    use bosun_db::MemoryStore;
    use futures::StreamExt;

    #[derive(Default)]
    struct FakeExecutor {
        started: parking_lot::Mutex<Vec<BuildAssignment>>,
        cancelled: parking_lot::Mutex<Vec<BuildId>>,
        reject_workers: parking_lot::Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl BuildExecutor for FakeExecutor {
        async fn start_build(&self, assignment: &BuildAssignment) -> Result<StartOutcome> {
            if self.reject_workers.lock().contains(&assignment.worker) {
                return Ok(StartOutcome::Rejected {
                    reason: "busy".into(),
                });
            }
            self.started.lock().push(assignment.clone());
            Ok(StartOutcome::Started)
        }

        async fn cancel_build(&self, build_id: BuildId, _reason: &str) -> Result<()> {
            self.cancelled.lock().push(build_id);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        executor: Arc<FakeExecutor>,
        bus: Arc<LocalEventBus>,
        coordinator: Coordinator,
    }

    fn fixture(workers: Vec<WorkerConfig>, builders: Vec<BuilderConfig>, policies: Policies) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(FakeExecutor::default());
        let bus = Arc::new(LocalEventBus::new());
        let coordinator = Coordinator::new(
            MasterId::new(),
            store.clone(),
            executor.clone(),
            bus.clone(),
            WorkerPool::new(&workers, &builders),
            policies,
            CoordinatorConfig::default(),
        );
        Fixture {
            store,
            executor,
            bus,
            coordinator,
        }
    }

    fn simple() -> Fixture {
        fixture(
            vec![WorkerConfig::new("w1").online()],
            vec![BuilderConfig::new("b1", &["w1"])],
            Policies::default(),
        )
    }

    fn main_stamp() -> SourceStamp {
        SourceStamp::new("").with_branch(Some("main".into()))
    }

    async fn submit(store: &MemoryStore, builder: &str, reason: &str) -> BuildRequestId {
        let submission = BuildSetSubmission::new(vec![builder.into()], vec![main_stamp()])
            .with_reason(reason);
        let created = store.add_buildset(&submission, Utc::now()).await.unwrap();
        created.requests[0].1
    }

    #[tokio::test]
    async fn test_identical_requests_are_merged() {
        let f = fixture(
            vec![WorkerConfig::new("w1")],
            vec![BuilderConfig::new("b1", &["w1"])],
            Policies::default(),
        );
        let r1 = submit(&f.store, "b1", "first").await;
        let r2 = submit(&f.store, "b1", "second").await;

        // No worker online yet.
        assert_eq!(f.coordinator.run_once().await.unwrap(), 0);

        f.coordinator.set_worker_online("w1", true);
        assert_eq!(f.coordinator.run_once().await.unwrap(), 1);
        let assignment = f.executor.started.lock()[0].clone();
        assert_eq!(assignment.request_ids, vec![r1, r2]);
        assert_eq!(assignment.reason, "first, second");

        f.coordinator
            .build_finished(assignment.build_id, Results::Success)
            .await
            .unwrap();
        for id in [r1, r2] {
            let request = f.store.get_build_request(id).await.unwrap().unwrap();
            assert!(request.complete);
            assert_eq!(request.results, Some(Results::Success));
        }
        assert_eq!(f.store.list_buildsets(Some(true)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_never_merge_runs_one_at_a_time() {
        let f = fixture(
            vec![WorkerConfig::new("w1").online()],
            vec![BuilderConfig::new("b1", &["w1"])],
            Policies::from_settings(&PolicySettings {
                merge_requests: policies::MergeRequestsSetting::Never,
                ..Default::default()
            }),
        );
        submit(&f.store, "b1", "a").await;
        submit(&f.store, "b1", "b").await;
        assert_eq!(f.coordinator.run_once().await.unwrap(), 1);
        assert_eq!(f.executor.started.lock()[0].request_ids.len(), 1);
        // The only slot is busy.
        assert_eq!(f.coordinator.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejected_build_tries_next_worker() {
        let f = fixture(
            vec![WorkerConfig::new("w1").online(), WorkerConfig::new("w2").online()],
            vec![BuilderConfig::new("b1", &["w1", "w2"])],
            Policies::default(),
        );
        f.executor.reject_workers.lock().insert("w1".into());
        let id = submit(&f.store, "b1", "r").await;

        assert_eq!(f.coordinator.run_once().await.unwrap(), 1);
        assert_eq!(f.executor.started.lock()[0].worker, "w2");
        let request = f.store.get_build_request(id).await.unwrap().unwrap();
        assert_eq!(request.claimed_by, Some(f.coordinator.master_id()));
    }

    #[tokio::test]
    async fn test_all_workers_reject_leaves_request_unclaimed() {
        let f = simple();
        f.executor.reject_workers.lock().insert("w1".into());
        let id = submit(&f.store, "b1", "r").await;
        assert_eq!(f.coordinator.run_once().await.unwrap(), 0);
        let request = f.store.get_build_request(id).await.unwrap().unwrap();
        assert!(request.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_request_claimed_elsewhere_is_skipped() {
        let f = simple();
        let id = submit(&f.store, "b1", "r").await;
        f.store
            .claim_build_requests(&[id], Utc::now(), MasterId::new())
            .await
            .unwrap();
        assert_eq!(f.coordinator.run_once().await.unwrap(), 0);
        assert!(f.executor.started.lock().is_empty());
    }

    #[tokio::test]
    async fn test_prioritizer_prefers_critical() {
        let prefer_critical = |builders: &[BuilderInfo]| -> anyhow::Result<Vec<String>> {
            let mut names: Vec<String> = builders.iter().map(|b| b.name.clone()).collect();
            names.sort_by_key(|n| n != "critical");
            Ok(names)
        };
        let f = fixture(
            vec![WorkerConfig::new("w1").online()],
            vec![
                BuilderConfig::new("critical", &["w1"]),
                BuilderConfig::new("normal", &["w1"]),
            ],
            Policies::default()
                .with_merge(Arc::new(policies::NeverMerge))
                .with_prioritizer(Arc::new(prefer_critical)),
        );
        submit(&f.store, "normal", "n").await;
        submit(&f.store, "critical", "c1").await;
        submit(&f.store, "critical", "c2").await;

        for expected in ["critical", "critical", "normal"] {
            assert_eq!(f.coordinator.run_once().await.unwrap(), 1);
            let last = f.executor.started.lock().last().cloned().unwrap();
            assert_eq!(last.builder, expected);
            f.coordinator
                .build_finished(last.build_id, Results::Success)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_failing_policy_starts_nothing() {
        let failing = |_: &str, _: &[PendingRequest]| -> anyhow::Result<Option<usize>> {
            anyhow::bail!("policy bug")
        };
        let f = fixture(
            vec![WorkerConfig::new("w1").online()],
            vec![BuilderConfig::new("b1", &["w1"])],
            Policies::default().with_next_build(Arc::new(failing)),
        );
        submit(&f.store, "b1", "r").await;
        assert_eq!(f.coordinator.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unclaimed_request() {
        let f = simple();
        let mut events = f.bus.subscribe("request.>").await.unwrap();
        let id = submit(&f.store, "b1", "r").await;

        f.coordinator.cancel_build_request(id, "superseded").await.unwrap();
        let request = f.store.get_build_request(id).await.unwrap().unwrap();
        assert_eq!(request.results, Some(Results::Cancelled));
        let buildsets = f.store.list_buildsets(Some(true)).await.unwrap();
        assert_eq!(buildsets[0].results, Some(Results::Cancelled));

        let first = events.next().await.unwrap().unwrap();
        assert!(matches!(first, Event::BuildRequestCancelled(_)));
        assert!(matches!(
            f.coordinator.cancel_build_request(id, "again").await,
            Err(Error::AlreadyComplete(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_request_signals_executor() {
        let f = simple();
        let id = submit(&f.store, "b1", "r").await;
        f.coordinator.run_once().await.unwrap();
        let build_id = f.executor.started.lock()[0].build_id;

        f.coordinator.cancel_build_request(id, "stop").await.unwrap();
        assert_eq!(*f.executor.cancelled.lock(), vec![build_id]);
    }

    #[tokio::test]
    async fn test_cancel_of_request_claimed_elsewhere_is_kept() {
        let f = simple();
        let id = submit(&f.store, "b1", "r").await;
        let long_ago = Utc::now() - chrono::Duration::hours(1);
        f.store
            .claim_build_requests(&[id], long_ago, MasterId::new())
            .await
            .unwrap();

        f.coordinator.cancel_build_request(id, "superseded").await.unwrap();
        let request = f.store.get_build_request(id).await.unwrap().unwrap();
        assert!(!request.complete);

        // The other master dies; its claim expires and this master picks
        // the request up.
        f.coordinator.expire_claims().await.unwrap();
        assert_eq!(f.coordinator.run_once().await.unwrap(), 0);
        assert!(f.executor.started.lock().is_empty());
        let request = f.store.get_build_request(id).await.unwrap().unwrap();
        assert!(request.complete);
        assert_eq!(request.results, Some(Results::Cancelled));
        let buildsets = f.store.list_buildsets(Some(true)).await.unwrap();
        assert_eq!(buildsets[0].results, Some(Results::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_request_leaves_merged_group() {
        let f = simple();
        let kept = submit(&f.store, "b1", "keep").await;
        let cancelled = submit(&f.store, "b1", "drop").await;
        f.store
            .claim_build_requests(&[cancelled], Utc::now() - chrono::Duration::hours(1), MasterId::new())
            .await
            .unwrap();
        f.coordinator.cancel_build_request(cancelled, "superseded").await.unwrap();
        f.coordinator.expire_claims().await.unwrap();

        assert_eq!(f.coordinator.run_once().await.unwrap(), 1);
        assert_eq!(f.executor.started.lock()[0].request_ids, vec![kept]);
        let dropped = f.store.get_build_request(cancelled).await.unwrap().unwrap();
        assert_eq!(dropped.results, Some(Results::Cancelled));
    }

    #[tokio::test]
    async fn test_worker_rejected_build_returns_requests() {
        let f = simple();
        let id = submit(&f.store, "b1", "r").await;
        f.coordinator.run_once().await.unwrap();

        assert!(f.coordinator.worker_rejected_build(id).await.unwrap());
        assert!(f.coordinator.running_builds().is_empty());
        let request = f.store.get_build_request(id).await.unwrap().unwrap();
        assert!(request.claimed_by.is_none());
        assert!(!f.coordinator.worker_rejected_build(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_lost_claim_cancels_running_build() {
        let f = simple();
        let id = submit(&f.store, "b1", "r").await;
        f.coordinator.run_once().await.unwrap();
        let build_id = f.executor.started.lock()[0].build_id;

        // Another master's expiry check released and re-claimed the request.
        f.store.unclaim_expired(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        f.store
            .claim_build_requests(&[id], Utc::now(), MasterId::new())
            .await
            .unwrap();

        f.coordinator.reclaim_running().await.unwrap();
        assert_eq!(*f.executor.cancelled.lock(), vec![build_id]);
        assert!(f.coordinator.running_builds().is_empty());
        assert!(matches!(
            f.coordinator.build_finished(build_id, Results::Success).await,
            Err(Error::BuildNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expire_claims_releases_stale_requests() {
        let f = fixture(
            vec![WorkerConfig::new("w1").online()],
            vec![BuilderConfig::new("b1", &["w1"])],
            Policies::default(),
        );
        let id = submit(&f.store, "b1", "r").await;
        let long_ago = Utc::now() - chrono::Duration::hours(1);
        f.store
            .claim_build_requests(&[id], long_ago, MasterId::new())
            .await
            .unwrap();

        assert_eq!(f.coordinator.expire_claims().await.unwrap(), vec![id]);
        assert_eq!(f.coordinator.run_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_properties_come_from_primary() {
        let f = simple();
        let submission = BuildSetSubmission::new(vec!["b1".into()], vec![main_stamp()])
            .with_properties(Properties::new().with("k", "v", "test"));
        f.store.add_buildset(&submission, Utc::now()).await.unwrap();
        f.coordinator.run_once().await.unwrap();
        let started = f.executor.started.lock()[0].clone();
        assert_eq!(started.properties.get("k"), Some(&serde_json::json!("v")));
    }
}

//! Scheduler lifecycle: one actor task per scheduler, and reconfiguration by
//! explicit reconciliation keyed on `(name, kind)`.

use crate::schedulers::{
    Scheduler, SchedulerContext, SchedulerKind, TriggerRequest, TryCredentials, TryJob,
};
use bosun_core::buildset::BuildSetCreated;
use bosun_core::change::Change;
use bosun_core::events::Event;
use bosun_core::{Error, Result};
use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INBOX_CAPACITY: usize = 1024;
const STATE_KEY: &str = "state";
const ACTIVATE_RETRY: Duration = Duration::from_secs(1);
const ACTIVATE_RETRY_MAX: Duration = Duration::from_secs(60);

/// The outcome of comparing the running schedulers with a new set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_start: Vec<String>,
    pub to_stop: Vec<String>,
    /// Same name and kind: restarted with the old instance's state.
    pub to_keep: Vec<String>,
}

/// Compare two scheduler sets. A name whose kind changed is stopped and
/// started fresh.
pub fn plan_reconcile(
    old: &[(String, SchedulerKind)],
    new: &[(String, SchedulerKind)],
) -> ReconcilePlan {
    let old: BTreeMap<&str, SchedulerKind> = old.iter().map(|(n, k)| (n.as_str(), *k)).collect();
    let new: BTreeMap<&str, SchedulerKind> = new.iter().map(|(n, k)| (n.as_str(), *k)).collect();
    let mut plan = ReconcilePlan::default();

    for (name, kind) in &old {
        match new.get(name) {
            Some(new_kind) if new_kind == kind => plan.to_keep.push(name.to_string()),
            _ => plan.to_stop.push(name.to_string()),
        }
    }
    for (name, kind) in &new {
        if old.get(name) != Some(kind) {
            plan.to_start.push(name.to_string());
        }
    }
    plan
}

/// Reject duplicate names, invalid base settings, and dependency cycles.
pub fn validate_schedulers(schedulers: &[Box<dyn Scheduler>]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for s in schedulers {
        s.base().validate()?;
        if !seen.insert(s.name()) {
            return Err(Error::DuplicateScheduler(s.name().to_string()));
        }
    }
    check_cycles(
        schedulers
            .iter()
            .map(|s| (s.name().to_string(), s.upstreams())),
    )
}

/// Fail if following upstream links ever returns to a scheduler.
pub fn check_cycles(links: impl IntoIterator<Item = (String, Vec<String>)>) -> Result<()> {
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
    let mut node = |graph: &mut DiGraph<String, ()>, name: &str| {
        *nodes
            .entry(name.to_string())
            .or_insert_with(|| graph.add_node(name.to_string()))
    };
    for (name, upstreams) in links {
        let to = node(&mut graph, &name);
        for upstream in upstreams {
            let from = node(&mut graph, &upstream);
            graph.add_edge(from, to, ());
        }
    }
    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| Error::DependencyCycle(graph[cycle.node_id()].clone()))
}

enum Command {
    Change(Change),
    Event(Event),
    Trigger {
        request: TriggerRequest,
        reply: oneshot::Sender<Result<BuildSetCreated>>,
    },
    Try {
        job: TryJob,
        credentials: Option<TryCredentials>,
        reply: oneshot::Sender<Result<BuildSetCreated>>,
    },
    /// Replies with the state to hand over, or `None` when the actor never
    /// activated and the next instance should load from the store.
    Stop {
        reply: oneshot::Sender<Option<serde_json::Value>>,
    },
}

struct SchedulerHandle {
    kind: SchedulerKind,
    inbox: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the actor and return its final state.
    async fn stop(self, name: &str) -> Option<serde_json::Value> {
        let (reply, rx) = oneshot::channel();
        let state = if self.inbox.send(Command::Stop { reply }).await.is_ok() {
            rx.await.ok().flatten()
        } else {
            None
        };
        if let Err(e) = self.task.await {
            error!(scheduler = %name, error = %e, "Scheduler task panicked");
        }
        state
    }
}

/// Runs scheduler actors and swaps them on reconfiguration.
pub struct SchedulerSupervisor {
    ctx: SchedulerContext,
    running: Mutex<BTreeMap<String, SchedulerHandle>>,
    cancel: CancellationToken,
}

impl SchedulerSupervisor {
    pub fn new(ctx: SchedulerContext, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            running: Mutex::new(BTreeMap::new()),
            cancel,
        }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    pub async fn schedulers(&self) -> Vec<(String, SchedulerKind)> {
        self.running
            .lock()
            .await
            .iter()
            .map(|(name, h)| (name.clone(), h.kind))
            .collect()
    }

    /// Replace the running schedulers with `schedulers`. Nothing is touched
    /// unless the whole set validates.
    pub async fn reconcile(&self, schedulers: Vec<Box<dyn Scheduler>>) -> Result<ReconcilePlan> {
        validate_schedulers(&schedulers)?;

        let mut running = self.running.lock().await;
        let old: Vec<(String, SchedulerKind)> =
            running.iter().map(|(n, h)| (n.clone(), h.kind)).collect();
        let new: Vec<(String, SchedulerKind)> = schedulers
            .iter()
            .map(|s| (s.name().to_string(), s.kind()))
            .collect();
        let plan = plan_reconcile(&old, &new);
        info!(
            start = ?plan.to_start,
            stop = ?plan.to_stop,
            keep = ?plan.to_keep,
            "Reconciling schedulers"
        );

        for name in &plan.to_stop {
            if let Some(handle) = running.remove(name) {
                handle.stop(name).await;
                info!(scheduler = %name, "Scheduler stopped");
            }
        }
        let mut transferred = HashMap::new();
        for name in &plan.to_keep {
            if let Some(handle) = running.remove(name) {
                if let Some(state) = handle.stop(name).await {
                    transferred.insert(name.clone(), state);
                }
            }
        }

        self.ctx.directory.replace(new.into_iter().collect());

        for scheduler in schedulers {
            let name = scheduler.name().to_string();
            let handle = self.spawn(scheduler, transferred.remove(&name));
            running.insert(name, handle);
        }
        Ok(plan)
    }

    /// Start an actor. Without handed-over state it loads its own.
    fn spawn(
        &self,
        scheduler: Box<dyn Scheduler>,
        handed_over: Option<serde_json::Value>,
    ) -> SchedulerHandle {
        let (inbox, rx) = mpsc::channel(INBOX_CAPACITY);
        let kind = scheduler.kind();
        let task = tokio::spawn(run_actor(
            scheduler,
            self.ctx.clone(),
            rx,
            handed_over,
            self.cancel.child_token(),
        ));
        SchedulerHandle { kind, inbox, task }
    }

    pub async fn dispatch_change(&self, change: &Change) {
        let running = self.running.lock().await;
        for (name, handle) in running.iter() {
            if handle.inbox.send(Command::Change(change.clone())).await.is_err() {
                warn!(scheduler = %name, "Scheduler inbox closed; change dropped");
            }
        }
    }

    pub async fn dispatch_event(&self, event: &Event) {
        let running = self.running.lock().await;
        for (name, handle) in running.iter() {
            if handle.inbox.send(Command::Event(event.clone())).await.is_err() {
                warn!(scheduler = %name, "Scheduler inbox closed; event dropped");
            }
        }
    }

    async fn request(
        &self,
        name: &str,
        command: impl FnOnce(oneshot::Sender<Result<BuildSetCreated>>) -> Command,
    ) -> Result<BuildSetCreated> {
        let (reply, rx) = oneshot::channel();
        {
            let running = self.running.lock().await;
            let handle = running
                .get(name)
                .ok_or_else(|| Error::SchedulerNotFound(name.to_string()))?;
            handle
                .inbox
                .send(command(reply))
                .await
                .map_err(|_| Error::SchedulerStopped(name.to_string()))?;
        }
        rx.await
            .map_err(|_| Error::SchedulerStopped(name.to_string()))?
    }

    pub async fn trigger(&self, name: &str, request: TriggerRequest) -> Result<BuildSetCreated> {
        self.request(name, |reply| Command::Trigger { request, reply })
            .await
    }

    pub async fn submit_try(
        &self,
        name: &str,
        job: TryJob,
        credentials: Option<TryCredentials>,
    ) -> Result<BuildSetCreated> {
        self.request(name, |reply| Command::Try {
            job,
            credentials,
            reply,
        })
        .await
    }

    /// Stop every scheduler, persisting final state.
    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        for (name, handle) in std::mem::take(&mut *running) {
            handle.stop(&name).await;
        }
        self.ctx.directory.replace(BTreeMap::new());
    }
}

async fn sleep_until(at: Option<DateTime<Utc>>) {
    match at {
        Some(at) => {
            let delay = (at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;
        }
        None => std::future::pending().await,
    }
}

async fn persist(ctx: &SchedulerContext, scheduler: &dyn Scheduler, saved: &mut serde_json::Value) {
    let state = scheduler.export_state();
    if state == *saved {
        return;
    }
    match ctx
        .stores
        .state
        .set_state(scheduler.name(), scheduler.kind().as_str(), STATE_KEY, state.clone())
        .await
    {
        Ok(()) => *saved = state,
        Err(e) => error!(scheduler = %scheduler.name(), error = %e, "Failed to persist scheduler state"),
    }
}

/// Load the saved state unless one was handed over, then activate.
/// Returns the state the scheduler was restored from.
async fn activate(
    scheduler: &mut dyn Scheduler,
    ctx: &SchedulerContext,
    handed_over: &Option<serde_json::Value>,
) -> Result<serde_json::Value> {
    let state = match handed_over {
        Some(state) => Some(state.clone()),
        None => {
            ctx.stores
                .state
                .get_state(scheduler.name(), scheduler.kind().as_str(), STATE_KEY)
                .await?
        }
    };
    scheduler.activate(ctx, state.clone(), Utc::now()).await?;
    Ok(state.unwrap_or_default())
}

async fn handle_command(
    scheduler: &mut dyn Scheduler,
    ctx: &SchedulerContext,
    command: Command,
) -> Result<()> {
    match command {
        Command::Change(change) => scheduler.on_change(ctx, &change, Utc::now()).await,
        Command::Event(event) => scheduler.on_event(ctx, &event, Utc::now()).await,
        Command::Trigger { request, reply } => {
            let _ = reply.send(scheduler.trigger(ctx, request).await);
            Ok(())
        }
        Command::Try {
            job,
            credentials,
            reply,
        } => {
            let _ = reply.send(scheduler.submit_try(ctx, job, credentials).await);
            Ok(())
        }
        Command::Stop { reply } => {
            let _ = reply.send(Some(scheduler.export_state()));
            Ok(())
        }
    }
}

/// Drive one scheduler. Until activation succeeds nothing is persisted and
/// inputs are queued, so a store outage cannot overwrite saved state.
async fn run_actor(
    mut scheduler: Box<dyn Scheduler>,
    ctx: SchedulerContext,
    mut inbox: mpsc::Receiver<Command>,
    handed_over: Option<serde_json::Value>,
    cancel: CancellationToken,
) {
    let name = scheduler.name().to_string();
    let mut saved = serde_json::Value::Null;
    let mut active = false;
    let mut retry = ACTIVATE_RETRY;
    let mut retry_at = tokio::time::Instant::now() + retry;
    let mut deferred: VecDeque<Command> = VecDeque::new();

    match activate(scheduler.as_mut(), &ctx, &handed_over).await {
        Ok(state) => {
            saved = state;
            active = true;
            persist(&ctx, scheduler.as_ref(), &mut saved).await;
            info!(scheduler = %name, kind = %scheduler.kind(), "Scheduler started");
        }
        Err(e) => error!(scheduler = %name, error = %e, "Scheduler failed to activate; retrying"),
    }

    loop {
        let wakeup = if active { scheduler.next_wakeup() } else { None };
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            command = inbox.recv() => match command {
                None => break,
                Some(Command::Stop { reply }) => {
                    let state = if active {
                        persist(&ctx, scheduler.as_ref(), &mut saved).await;
                        Some(scheduler.export_state())
                    } else {
                        handed_over.clone()
                    };
                    let _ = reply.send(state);
                    debug!(scheduler = %name, "Scheduler actor stopped");
                    return;
                }
                Some(command) if active => handle_command(scheduler.as_mut(), &ctx, command).await,
                Some(command) => {
                    deferred.push_back(command);
                    Ok(())
                }
            },
            _ = sleep_until(wakeup), if active => {
                let now = wakeup.map_or_else(Utc::now, |at| Utc::now().max(at));
                scheduler.on_timer(&ctx, now).await
            }
            _ = tokio::time::sleep_until(retry_at), if !active => {
                match activate(scheduler.as_mut(), &ctx, &handed_over).await {
                    Ok(state) => {
                        saved = state;
                        active = true;
                        info!(scheduler = %name, queued = deferred.len(), "Scheduler activated after retry");
                        while let Some(command) = deferred.pop_front() {
                            if let Err(e) = handle_command(scheduler.as_mut(), &ctx, command).await {
                                error!(scheduler = %name, error = %e, "Scheduler failed to handle input");
                            }
                        }
                        Ok(())
                    }
                    Err(e) => {
                        retry = (retry * 2).min(ACTIVATE_RETRY_MAX);
                        retry_at = tokio::time::Instant::now() + retry;
                        warn!(scheduler = %name, error = %e, retry_in = ?retry, "Scheduler activation failed");
                        Ok(())
                    }
                }
            }
        };
        if let Err(e) = result {
            error!(scheduler = %name, error = %e, "Scheduler failed to handle input");
        }
        if active {
            persist(&ctx, scheduler.as_ref(), &mut saved).await;
        }
    }
    if active {
        persist(&ctx, scheduler.as_ref(), &mut saved).await;
    }
    debug!(scheduler = %name, "Scheduler actor exited");
}

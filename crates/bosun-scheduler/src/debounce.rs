//! Coalescing trigger for an async action.
//!
//! Triggers that arrive while the action is pending or running collapse into
//! a single follow-up run. At most one run is ever in flight.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The action run by a [`Debouncer`].
pub type DebouncedAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Cloneable handle that requests a run of its [`Debouncer`].
#[derive(Clone)]
pub struct LoopTrigger(Arc<Notify>);

impl LoopTrigger {
    pub fn trigger(&self) {
        self.0.notify_one();
    }
}

pub struct Debouncer {
    notify: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Debouncer {
    /// Spawn the run loop. `wait` is the quiet period between the first
    /// trigger and the run; triggers during that period are absorbed.
    pub fn spawn(name: &str, wait: Duration, action: DebouncedAction) -> Self {
        let notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let name = name.to_string();

        let task = tokio::spawn({
            let notify = notify.clone();
            let cancel = cancel.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = notify.notified() => {}
                    }
                    if !wait.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                    debug!(loop_name = %name, "Running debounced action");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = action() => {}
                    }
                }
                debug!(loop_name = %name, "Debounced loop stopped");
            }
        });

        Self {
            notify,
            cancel,
            task,
        }
    }

    /// Request a run. Never blocks.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    pub fn handle(&self) -> LoopTrigger {
        LoopTrigger(self.notify.clone())
    }

    /// Stop the loop, abandoning any pending run, and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_action(count: Arc<AtomicUsize>, run_time: Duration) -> DebouncedAction {
        Arc::new(move || {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(run_time).await;
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::spawn(
            "test",
            Duration::from_millis(10),
            counting_action(count.clone(), Duration::ZERO),
        );

        for _ in 0..50 {
            debouncer.trigger();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        debouncer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_during_run_cause_one_follow_up() {
        let count = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::spawn(
            "test",
            Duration::ZERO,
            counting_action(count.clone(), Duration::from_millis(100)),
        );

        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let handle = debouncer.handle();
        for _ in 0..10 {
            handle.trigger();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        debouncer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::spawn(
            "test",
            Duration::from_secs(5),
            counting_action(count.clone(), Duration::ZERO),
        );

        debouncer.trigger();
        tokio::time::sleep(Duration::from_secs(1)).await;
        debouncer.stop().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

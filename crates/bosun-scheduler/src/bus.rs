//! In-process event bus with NATS-style subject matching.

use async_trait::async_trait;
use bosun_core::Result;
use bosun_core::events::Event;
use bosun_core::ports::{EventBus, EventStream};
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Match a subject against a pattern. `*` matches exactly one token and a
/// trailing `>` matches one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscriber {
    pattern: String,
    sender: mpsc::UnboundedSender<Event>,
}

/// Event bus with one unbounded queue per subscriber.
///
/// Subscribers only see events published after they subscribe. A slow
/// subscriber never loses events; its queue grows instead. Each subscriber
/// sees events in publish order.
#[derive(Default)]
pub struct LocalEventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.sender.is_closed());
        subscribers.len()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        let subject = event.subject();
        debug!(subject = %subject, "Publishing event");
        let mut subscribers = self.subscribers.lock();
        // Dropped streams are pruned here; no subscribers is not an error.
        subscribers.retain(|s| {
            !subject_matches(&s.pattern, &subject) || s.sender.send(event.clone()).is_ok()
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        debug!("Subscribing to pattern: {}", pattern);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber {
            pattern: pattern.to_string(),
            sender,
        });

        let events = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|event| (Ok(event), receiver))
        });
        Ok(Box::pin(events))
    }
}

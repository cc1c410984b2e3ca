use metrics::counter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::state::TunnelState;

/// Full picture of every known tunnel, delivered on each change.
pub type Snapshot = HashMap<String, TunnelState>;

/// Fans state snapshots out to subscribers over bounded channels. A
/// subscriber that stops draining loses its subscription rather than
/// blocking the producers or its peers.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    subscribers: Mutex<Vec<mpsc::Sender<Snapshot>>>,
    queue: usize,
}

pub struct Subscription {
    rx: mpsc::Receiver<Snapshot>,
}

impl Subscription {
    /// Next snapshot, or `None` once the subscription is closed (slow
    /// consumer or notifier shutdown).
    pub async fn recv(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Snapshot> {
        self.rx.try_recv().ok()
    }
}

impl Notifier {
    pub fn new(queue: usize) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                subscribers: Mutex::new(Vec::new()),
                // a zero bound would reject the subscribe-time snapshot
                queue: queue.max(1),
            }),
        }
    }

    /// Register a subscriber and seed it with the current snapshot.
    pub fn subscribe(&self, current: Snapshot) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.queue);
        let _ = tx.try_send(current);
        self.inner
            .subscribers
            .lock()
            .expect("notifier lock poisoned")
            .push(tx);
        Subscription { rx }
    }

    /// Enqueue a snapshot on every subscriber without blocking. Full
    /// queues drop their subscriber; the rest are unaffected.
    pub fn publish(&self, snapshot: Snapshot) {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .expect("notifier lock poisoned");
        subscribers.retain(|tx| match tx.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                counter!("tunnel_subscribers_dropped_total").increment(1);
                tracing::warn!("Dropping slow tunnel-state subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("notifier lock poisoned")
            .len()
    }
}

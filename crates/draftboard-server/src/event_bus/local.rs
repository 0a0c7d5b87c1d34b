use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use draftboard_protocol::Envelope;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};

/// Pending messages a subscriber may buffer before deliveries to it are dropped.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;

/// Envelopes are shared between subscribers, never copied or mutated.
pub type SharedEnvelope = Arc<Envelope>;

/// Process-unique subscription handle. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving side of a live subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<SharedEnvelope>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next envelope. `None` once the subscription was
    /// unsubscribed (or the bus shut down) and the buffer is drained.
    pub async fn recv(&mut self) -> Option<SharedEnvelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<SharedEnvelope, TryRecvError> {
        self.rx.try_recv()
    }
}

/// Outcome of one local publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    /// Subscribers whose buffer was full.
    pub dropped: usize,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<SubscriptionId, mpsc::Sender<SharedEnvelope>>,
    closed: bool,
}

struct Inner {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    default_capacity: usize,
    dropped_total: AtomicU64,
}

/// In-process fan-out of envelopes to bounded subscriber channels.
///
/// Publishing never waits on a subscriber: a full buffer drops that one
/// delivery and moves on.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<Inner>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Bus whose `subscribe` hands out channels of `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(Registry::default()),
                next_id: AtomicU64::new(1),
                default_capacity: capacity.max(1),
                dropped_total: AtomicU64::new(0),
            }),
        }
    }

    pub fn default_capacity(&self) -> usize {
        self.inner.default_capacity
    }

    /// Deliver an envelope to every registered subscriber.
    pub async fn publish(&self, envelope: SharedEnvelope) -> FanOut {
        // Snapshot under the read lock; never send while holding it.
        let targets: Vec<(SubscriptionId, mpsc::Sender<SharedEnvelope>)> = {
            let registry = self.inner.registry.read().await;
            registry
                .subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut outcome = FanOut::default();
        let mut stale = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(envelope.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    outcome.dropped += 1;
                    trace!(subscription = %id, kind = %envelope.kind(), "subscriber buffer full, dropping");
                }
                // Receiver dropped without unsubscribing, or unsubscribed
                // between snapshot and send.
                Err(TrySendError::Closed(_)) => stale.push(id),
            }
        }

        if !stale.is_empty() {
            let mut registry = self.inner.registry.write().await;
            for id in &stale {
                registry.subscribers.remove(id);
            }
            debug!(removed = stale.len(), "pruned subscribers whose receiver was dropped");
        }

        if outcome.dropped > 0 {
            self.inner
                .dropped_total
                .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        }

        outcome
    }

    /// Register a subscriber with the bus's default buffer size.
    pub async fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(self.inner.default_capacity)
            .await
    }

    /// Register a subscriber with an explicit buffer size (at least 1).
    pub async fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let mut registry = self.inner.registry.write().await;
        if registry.closed {
            warn!(subscription = %id, "subscribe after shutdown, returning closed subscription");
            // Dropping `tx` here closes the channel.
            return Subscription { id, rx };
        }
        registry.subscribers.insert(id, tx);
        debug!(subscription = %id, capacity, "subscriber registered");

        Subscription { id, rx }
    }

    /// Remove and close a subscription. Returns `false` when it was not
    /// registered (already removed, or never existed).
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.registry.write().await.subscribers.remove(&id);
        if removed.is_some() {
            debug!(subscription = %id, "subscriber removed");
        }
        removed.is_some()
    }

    /// Close every subscription; later subscribers get a closed channel.
    pub async fn shutdown(&self) {
        let mut registry = self.inner.registry.write().await;
        let count = registry.subscribers.len();
        registry.subscribers.clear();
        registry.closed = true;
        info!(closed_subscriptions = count, "local bus shut down");
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.registry.read().await.subscribers.len()
    }

    /// Deliveries dropped on full buffers since the bus was created.
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

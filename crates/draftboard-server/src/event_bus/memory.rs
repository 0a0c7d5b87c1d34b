//! In-process durable log.
//!
//! Behaves like a single-subject JetStream stream with durable pull
//! consumers: messages are kept serialized, each named consumer has an ack
//! floor, and a message is only passed over once its handler succeeded.
//! State lives as long as the broker, so it survives consumer restarts but
//! not process restarts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use draftboard_protocol::Envelope;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{error, info};

use super::broker::{dispatch, BrokerOptions, Disposition, DurableBroker, DurableSubscription, EventHandler};
use super::error::{EventBusError, Result};

struct StoredMessage {
    sequence: u64,
    appended_at: DateTime<Utc>,
    body: Arc<[u8]>,
}

#[derive(Default)]
struct ConsumerState {
    /// Next sequence to deliver; everything below is acknowledged.
    next: u64,
    /// Deliveries of `next` so far.
    deliveries: i64,
    active: bool,
}

struct Log {
    messages: VecDeque<StoredMessage>,
    last_sequence: u64,
    consumers: HashMap<String, ConsumerState>,
    closed: bool,
}

impl Log {
    fn first_sequence(&self) -> u64 {
        self.messages
            .front()
            .map(|m| m.sequence)
            .unwrap_or(self.last_sequence + 1)
    }

    fn apply_retention(&mut self, options: &BrokerOptions, now: DateTime<Utc>) {
        if let Some(max) = options.retention.max_messages() {
            while self.messages.len() > max {
                self.messages.pop_front();
            }
        }
        if let Some(max_age) = options.retention.max_age() {
            let expired = |m: &StoredMessage| {
                now.signed_duration_since(m.appended_at)
                    .to_std()
                    .is_ok_and(|age| age > max_age)
            };
            while self.messages.front().is_some_and(expired) {
                self.messages.pop_front();
            }
        }
    }

    /// Next message at or after the consumer's ack floor.
    fn next_for(&self, consumer: &str) -> Option<(u64, Arc<[u8]>)> {
        let next = self.consumers.get(consumer)?.next;
        self.messages
            .iter()
            .find(|m| m.sequence >= next)
            .map(|m| (m.sequence, m.body.clone()))
    }
}

struct Shared {
    log: Mutex<Log>,
    appended: watch::Sender<u64>,
    options: BrokerOptions,
}

impl Shared {
    fn log(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Marks a consumer name inactive when its loop ends or is aborted.
struct ActiveGuard {
    shared: Arc<Shared>,
    consumer: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Some(state) = self.shared.log().consumers.get_mut(&self.consumer) {
            state.active = false;
        }
    }
}

pub struct MemoryBroker {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl MemoryBroker {
    pub fn new(options: BrokerOptions) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                log: Mutex::new(Log {
                    messages: VecDeque::new(),
                    last_sequence: 0,
                    consumers: HashMap::new(),
                    closed: false,
                }),
                appended,
                options,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Append a raw body. Used to exercise undecodable messages.
    pub(crate) fn append_raw(&self, body: Vec<u8>) -> Result<u64> {
        let sequence = {
            let mut log = self.shared.log();
            if log.closed {
                return Err(EventBusError::Closed);
            }
            let now = Utc::now();
            log.last_sequence += 1;
            let sequence = log.last_sequence;
            log.messages.push_back(StoredMessage {
                sequence,
                appended_at: now,
                body: body.into(),
            });
            log.apply_retention(&self.shared.options, now);
            sequence
        };

        self.shared.appended.send_replace(sequence);
        Ok(sequence)
    }

    /// Messages currently retained.
    pub fn len(&self) -> usize {
        self.shared.log().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence the named consumer will receive next, if it exists.
    pub fn consumer_position(&self, consumer: &str) -> Option<u64> {
        self.shared.log().consumers.get(consumer).map(|s| s.next)
    }
}

async fn consume(shared: Arc<Shared>, guard: ActiveGuard, handler: Arc<dyn EventHandler>) {
    let consumer = guard.consumer.clone();
    let mut appended = shared.appended.subscribe();

    loop {
        let next = {
            let mut log = shared.log();
            log.apply_retention(&shared.options, Utc::now());
            let first = log.first_sequence();
            if let Some(state) = log.consumers.get_mut(&consumer) {
                // Retention removed messages this consumer never acknowledged.
                if state.next < first {
                    state.next = first;
                    state.deliveries = 0;
                }
            }
            log.next_for(&consumer)
        };

        let Some((sequence, body)) = next else {
            if appended.changed().await.is_err() {
                break;
            }
            continue;
        };

        let deliveries = {
            let mut log = shared.log();
            match log.consumers.get_mut(&consumer) {
                Some(state) => {
                    state.deliveries += 1;
                    state.deliveries
                }
                None => break,
            }
        };

        let disposition = dispatch(&consumer, &body, handler.as_ref()).await;
        let exhausted = shared.options.max_deliver > 0 && deliveries >= shared.options.max_deliver;

        if disposition == Disposition::Nak && !exhausted {
            tokio::time::sleep(shared.options.redelivery_delay).await;
            continue;
        }

        if disposition == Disposition::Nak {
            error!(consumer = %consumer, sequence, deliveries, "max deliveries reached, skipping message");
        }

        if let Some(state) = shared.log().consumers.get_mut(&consumer) {
            state.next = sequence + 1;
            state.deliveries = 0;
        }
    }

    drop(guard);
}

#[async_trait]
impl DurableBroker for MemoryBroker {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, envelope: &Envelope) -> Result<u64> {
        self.append_raw(envelope.to_bytes()?)
    }

    async fn subscribe_durable(
        &self,
        consumer: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<DurableSubscription> {
        {
            let mut log = self.shared.log();
            if log.closed {
                return Err(EventBusError::Closed);
            }
            let first = log.first_sequence();
            let state = log
                .consumers
                .entry(consumer.to_string())
                .or_insert_with(|| ConsumerState {
                    next: first,
                    ..Default::default()
                });
            if state.active {
                return Err(EventBusError::ConsumerActive(consumer.to_string()));
            }
            state.active = true;
        }

        let guard = ActiveGuard {
            shared: self.shared.clone(),
            consumer: consumer.to_string(),
        };
        let task = tokio::spawn(consume(self.shared.clone(), guard, handler));

        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.retain(|h| !h.is_finished());
            tasks.push(task.abort_handle());
        }

        info!(consumer = %consumer, "durable consumer started");
        Ok(DurableSubscription::new(consumer, task))
    }

    async fn close(&self) {
        self.shared.log().closed = true;
        let handles: Vec<AbortHandle> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in &handles {
            handle.abort();
        }
        info!(stopped_consumers = handles.len(), "memory broker closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use draftboard_protocol::EventKind;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use uuid::Uuid;

    use super::*;
    use crate::event_bus::broker::{handler_fn, RetentionPolicy};

    fn options() -> BrokerOptions {
        BrokerOptions {
            redelivery_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn chat(text: &str) -> Envelope {
        Envelope::new(EventKind::ChatMessage, json!(text))
    }

    /// Handler forwarding every envelope it sees, failing the first `failures` calls.
    fn recorder(failures: usize) -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(failures));
        let handler = handler_fn(move |envelope: Envelope| {
            let tx = tx.clone();
            let remaining = remaining.clone();
            async move {
                let _ = tx.send(envelope);
                let left = remaining.load(std::sync::atomic::Ordering::SeqCst);
                if left > 0 {
                    remaining.store(left - 1, std::sync::atomic::Ordering::SeqCst);
                    anyhow::bail!("simulated failure");
                }
                Ok(())
            }
        });
        (handler, rx)
    }

    async fn next_id(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Uuid {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("handler dropped")
            .id()
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Envelope>) {
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_sequences() {
        let broker = MemoryBroker::new(options());
        let first = broker.publish(&chat("a")).await.unwrap();
        let second = broker.publish(&chat("b")).await.unwrap();

        assert_eq!((first, second), (1, 2));
        assert_eq!(broker.len(), 2);
    }

    #[tokio::test]
    async fn test_delivers_history_in_order() {
        let broker = MemoryBroker::new(options());
        let sent: Vec<Envelope> = ["a", "b", "c"].iter().map(|t| chat(t)).collect();
        for envelope in &sent {
            broker.publish(envelope).await.unwrap();
        }

        let (handler, mut rx) = recorder(0);
        let _sub = broker.subscribe_durable("replica-1", handler).await.unwrap();

        for envelope in &sent {
            assert_eq!(next_id(&mut rx).await, envelope.id());
        }
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_failed_handler_gets_redelivery() {
        let broker = MemoryBroker::new(options());
        let envelope = chat("a");
        broker.publish(&envelope).await.unwrap();

        let (handler, mut rx) = recorder(2);
        let _sub = broker.subscribe_durable("replica-1", handler).await.unwrap();

        for _ in 0..3 {
            assert_eq!(next_id(&mut rx).await, envelope.id());
        }
        assert_quiet(&mut rx).await;
        assert_eq!(broker.consumer_position("replica-1"), Some(2));
    }

    #[tokio::test]
    async fn test_crash_before_ack_redelivers_to_restarted_consumer() {
        let broker = MemoryBroker::new(options());
        let envelope = chat("a");
        broker.publish(&envelope).await.unwrap();

        // Handler that receives the message and never returns.
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let crashing = handler_fn(move |envelope: Envelope| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(envelope);
                std::future::pending::<anyhow::Result<()>>().await
            }
        });
        let sub = broker.subscribe_durable("replica-1", crashing).await.unwrap();
        assert_eq!(next_id(&mut seen_rx).await, envelope.id());
        sub.stop().await;

        let (handler, mut rx) = recorder(0);
        let _sub = broker.subscribe_durable("replica-1", handler).await.unwrap();

        assert_eq!(next_id(&mut rx).await, envelope.id());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_panicking_handler_gets_redelivery() {
        let broker = MemoryBroker::new(options());
        let envelope = chat("a");
        broker.publish(&envelope).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handler = handler_fn(move |envelope: Envelope| {
            let tx = tx.clone();
            let calls = calls.clone();
            async move {
                let _ = tx.send(envelope.clone());
                if calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    panic!("handler bug");
                }
                Ok(())
            }
        });
        let sub = broker.subscribe_durable("replica-1", handler).await.unwrap();

        assert_eq!(next_id(&mut rx).await, envelope.id());
        assert_eq!(next_id(&mut rx).await, envelope.id());
        assert_quiet(&mut rx).await;
        assert!(!sub.is_finished());
        assert_eq!(broker.consumer_position("replica-1"), Some(2));
    }

    #[tokio::test]
    async fn test_resume_from_last_ack() {
        let broker = MemoryBroker::new(options());
        let first = chat("a");
        broker.publish(&first).await.unwrap();

        let (handler, mut rx) = recorder(0);
        let sub = broker.subscribe_durable("replica-1", handler).await.unwrap();
        assert_eq!(next_id(&mut rx).await, first.id());
        // Wait for the ack to land before stopping.
        timeout(Duration::from_secs(2), async {
            while broker.consumer_position("replica-1") != Some(2) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        sub.stop().await;

        let second = chat("b");
        broker.publish(&second).await.unwrap();

        let (handler, mut rx) = recorder(0);
        let _sub = broker.subscribe_durable("replica-1", handler).await.unwrap();
        assert_eq!(next_id(&mut rx).await, second.id());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_independent_consumers_each_get_full_copy() {
        let broker = MemoryBroker::new(options());
        let (handler_a, mut rx_a) = recorder(0);
        let (handler_b, mut rx_b) = recorder(0);
        let _a = broker.subscribe_durable("replica-a", handler_a).await.unwrap();

        let first = chat("a");
        broker.publish(&first).await.unwrap();
        assert_eq!(next_id(&mut rx_a).await, first.id());

        let _b = broker.subscribe_durable("replica-b", handler_b).await.unwrap();
        let second = chat("b");
        broker.publish(&second).await.unwrap();

        assert_eq!(next_id(&mut rx_a).await, second.id());
        assert_eq!(next_id(&mut rx_b).await, first.id());
        assert_eq!(next_id(&mut rx_b).await, second.id());
    }

    #[tokio::test]
    async fn test_same_name_rejected_while_active() {
        let broker = MemoryBroker::new(options());
        let (handler, _rx) = recorder(0);
        let (other, _other_rx) = recorder(0);
        let _sub = broker.subscribe_durable("replica-1", handler).await.unwrap();

        let result = broker.subscribe_durable("replica-1", other).await;
        assert!(matches!(result, Err(EventBusError::ConsumerActive(name)) if name == "replica-1"));
    }

    #[tokio::test]
    async fn test_dropping_handle_frees_the_name() {
        let broker = MemoryBroker::new(options());
        let (handler, _rx) = recorder(0);
        let sub = broker.subscribe_durable("replica-1", handler).await.unwrap();
        drop(sub);

        let resubscribed = timeout(Duration::from_secs(2), async {
            loop {
                let (handler, rx) = recorder(0);
                match broker.subscribe_durable("replica-1", handler).await {
                    Ok(sub) => return (sub, rx),
                    Err(EventBusError::ConsumerActive(_)) => tokio::time::sleep(Duration::from_millis(5)).await,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        })
        .await;
        let (_sub, mut rx) = resubscribed.unwrap();

        let envelope = chat("a");
        broker.publish(&envelope).await.unwrap();
        assert_eq!(next_id(&mut rx).await, envelope.id());
    }

    #[tokio::test]
    async fn test_undecodable_message_is_not_handled() {
        let broker = MemoryBroker::new(BrokerOptions {
            max_deliver: 3,
            ..options()
        });
        broker.append_raw(b"not an envelope".to_vec()).unwrap();
        let good = chat("ok");
        broker.publish(&good).await.unwrap();

        let (handler, mut rx) = recorder(0);
        let _sub = broker.subscribe_durable("replica-1", handler).await.unwrap();

        // The bad message is retried up to max_deliver, never reaching the handler.
        assert_eq!(next_id(&mut rx).await, good.id());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_unknown_kind_is_skipped() {
        let broker = MemoryBroker::new(options());
        broker
            .append_raw(
                br#"{"id":"6f1c2a3e-4b5d-4e6f-8a9b-0c1d2e3f4a5b","kind":"draft.paused","time":"2026-09-01T12:00:00Z"}"#
                    .to_vec(),
            )
            .unwrap();
        let good = chat("ok");
        broker.publish(&good).await.unwrap();

        let (handler, mut rx) = recorder(0);
        let _sub = broker.subscribe_durable("replica-1", handler).await.unwrap();

        assert_eq!(next_id(&mut rx).await, good.id());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_retention_max_messages() {
        let broker = MemoryBroker::new(BrokerOptions {
            retention: RetentionPolicy {
                max_age_secs: 0,
                max_messages: 2,
            },
            ..options()
        });
        let sent: Vec<Envelope> = ["a", "b", "c"].iter().map(|t| chat(t)).collect();
        for envelope in &sent {
            broker.publish(envelope).await.unwrap();
        }
        assert_eq!(broker.len(), 2);

        let (handler, mut rx) = recorder(0);
        let _sub = broker.subscribe_durable("late", handler).await.unwrap();
        assert_eq!(next_id(&mut rx).await, sent[1].id());
        assert_eq!(next_id(&mut rx).await, sent[2].id());
    }

    #[tokio::test]
    async fn test_retention_max_age() {
        let broker = MemoryBroker::new(BrokerOptions {
            retention: RetentionPolicy {
                max_age_secs: 1,
                max_messages: 0,
            },
            ..options()
        });
        broker.publish(&chat("old")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let fresh = chat("fresh");
        broker.publish(&fresh).await.unwrap();

        assert_eq!(broker.len(), 1);

        let (handler, mut rx) = recorder(0);
        let _sub = broker.subscribe_durable("late", handler).await.unwrap();
        assert_eq!(next_id(&mut rx).await, fresh.id());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_close_rejects_new_work() {
        let broker = MemoryBroker::new(options());
        let (handler, _rx) = recorder(0);
        let sub = broker.subscribe_durable("replica-1", handler).await.unwrap();

        broker.close().await;

        assert!(matches!(broker.publish(&chat("a")).await, Err(EventBusError::Closed)));
        let (handler, _rx) = recorder(0);
        assert!(matches!(
            broker.subscribe_durable("replica-2", handler).await,
            Err(EventBusError::Closed)
        ));
        timeout(Duration::from_secs(1), async {
            while !sub.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use draftboard_protocol::Envelope;

use super::broker::DurableBroker;
use super::error::{EventBusError, Result};
use super::local::SharedEnvelope;

pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Queue between `publish` and the durable broker.
///
/// Enqueueing never waits. A single writer appends in FIFO order, so the
/// stream sees envelopes in the order this process published them.
pub struct Outbox {
    tx: Mutex<Option<mpsc::Sender<SharedEnvelope>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    publish_timeout: Duration,
}

impl Outbox {
    pub fn spawn(broker: Arc<dyn DurableBroker>, capacity: usize, publish_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(write_loop(broker, rx, publish_timeout));

        Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            publish_timeout,
        }
    }

    /// Queue an envelope for the durable append. Returns `false` when it was
    /// not queued (queue full or outbox closed); the failure is logged here.
    pub async fn enqueue(&self, envelope: SharedEnvelope) -> bool {
        let tx = self.tx.lock().await.clone();
        let Some(tx) = tx else {
            warn!(id = %envelope.id(), kind = %envelope.kind(), "outbox closed, durable append skipped");
            return false;
        };

        match tx.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(envelope)) => {
                error!(id = %envelope.id(), kind = %envelope.kind(), "durable outbox full, append dropped");
                false
            }
            Err(TrySendError::Closed(envelope)) => {
                warn!(id = %envelope.id(), kind = %envelope.kind(), "outbox writer gone, durable append skipped");
                false
            }
        }
    }

    /// Stop accepting envelopes and let the writer finish what is queued.
    ///
    /// Waits at most one publish timeout per queued envelope, plus one.
    pub async fn close(&self) {
        let pending = {
            let mut tx = self.tx.lock().await;
            let pending = tx
                .as_ref()
                .map(|tx| tx.max_capacity() - tx.capacity())
                .unwrap_or(0);
            tx.take();
            pending
        };

        let Some(writer) = self.writer.lock().await.take() else {
            return;
        };

        let rounds = u32::try_from(pending).unwrap_or(u32::MAX).saturating_add(1);
        let budget = self.publish_timeout.saturating_mul(rounds);
        let abort = writer.abort_handle();
        match tokio::time::timeout(budget, writer).await {
            Ok(_) => info!(drained = pending, "durable outbox drained"),
            Err(_) => {
                abort.abort();
                warn!(pending, "durable outbox did not drain in time");
            }
        }
    }
}

async fn write_loop(
    broker: Arc<dyn DurableBroker>,
    mut rx: mpsc::Receiver<SharedEnvelope>,
    publish_timeout: Duration,
) {
    while let Some(envelope) = rx.recv().await {
        match append(broker.as_ref(), &envelope, publish_timeout).await {
            Ok(sequence) => {
                debug!(id = %envelope.id(), kind = %envelope.kind(), sequence, "durable append");
            }
            Err(e) => {
                error!(id = %envelope.id(), kind = %envelope.kind(), backend = broker.backend(), error = %e, "durable append failed");
            }
        }
    }
}

/// One append, bounded by `publish_timeout`.
async fn append(broker: &dyn DurableBroker, envelope: &Envelope, publish_timeout: Duration) -> Result<u64> {
    tokio::time::timeout(publish_timeout, broker.publish(envelope))
        .await
        .unwrap_or(Err(EventBusError::PublishTimeout(publish_timeout)))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use draftboard_protocol::EventKind;
    use serde_json::json;

    use super::*;
    use crate::event_bus::broker::{BrokerOptions, DurableSubscription, EventHandler};
    use crate::event_bus::memory::MemoryBroker;

    /// Broker whose appends never complete.
    struct HangingBroker {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl DurableBroker for HangingBroker {
        fn backend(&self) -> &'static str {
            "hanging"
        }

        async fn publish(&self, _envelope: &Envelope) -> Result<u64> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn subscribe_durable(
            &self,
            _consumer: &str,
            _handler: Arc<dyn EventHandler>,
        ) -> Result<DurableSubscription> {
            Err(EventBusError::DurableUnsupported)
        }

        async fn close(&self) {}
    }

    fn envelope(n: u64) -> SharedEnvelope {
        Arc::new(Envelope::new(EventKind::PointsUpdated, json!({ "n": n })))
    }

    #[tokio::test]
    async fn test_appends_in_enqueue_order() {
        let broker = Arc::new(MemoryBroker::new(BrokerOptions::default()));
        let outbox = Outbox::spawn(broker.clone(), 16, DEFAULT_PUBLISH_TIMEOUT);

        for n in 0..10 {
            assert!(outbox.enqueue(envelope(n)).await);
        }
        outbox.close().await;
        assert_eq!(broker.len(), 10);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = crate::event_bus::broker::handler_fn(move |envelope: Envelope| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(envelope.payload()["n"].as_u64());
                Ok(())
            }
        });
        let _sub = broker.subscribe_durable("check", handler).await.unwrap();

        for n in 0..10 {
            assert_eq!(rx.recv().await, Some(Some(n)));
        }
    }

    #[tokio::test]
    async fn test_enqueue_never_blocks_on_a_stuck_broker() {
        let broker = Arc::new(HangingBroker {
            attempts: AtomicUsize::new(0),
        });
        let outbox = Outbox::spawn(broker.clone(), 2, Duration::from_millis(20));

        let started = std::time::Instant::now();
        let accepted = {
            let mut accepted = 0;
            for n in 0..50 {
                if outbox.enqueue(envelope(n)).await {
                    accepted += 1;
                }
            }
            accepted
        };

        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(accepted < 50);
        outbox.close().await;
    }

    #[tokio::test]
    async fn test_timed_out_appends_are_skipped() {
        let broker = Arc::new(HangingBroker {
            attempts: AtomicUsize::new(0),
        });
        let outbox = Outbox::spawn(broker.clone(), 8, Duration::from_millis(10));

        outbox.enqueue(envelope(1)).await;
        outbox.enqueue(envelope(2)).await;

        // The first append times out and the writer moves on to the second.
        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.attempts.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        outbox.close().await;

        assert_eq!(broker.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_append_reports_timeout() {
        let broker = HangingBroker {
            attempts: AtomicUsize::new(0),
        };
        let timeout = Duration::from_millis(10);

        let result = append(&broker, &envelope(1), timeout).await;

        assert!(matches!(result, Err(EventBusError::PublishTimeout(t)) if t == timeout));
    }

    #[tokio::test]
    async fn test_close_with_huge_timeout_does_not_overflow() {
        let broker = Arc::new(HangingBroker {
            attempts: AtomicUsize::new(0),
        });
        let outbox = Outbox::spawn(broker.clone(), 8, Duration::MAX);
        for n in 0..4 {
            outbox.enqueue(envelope(n)).await;
        }

        // Writer is stuck on the first append; close must not panic computing its budget.
        let closed = tokio::time::timeout(Duration::from_millis(50), outbox.close()).await;
        assert!(closed.is_err());
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_refused() {
        let broker = Arc::new(MemoryBroker::new(BrokerOptions::default()));
        let outbox = Outbox::spawn(broker.clone(), 4, DEFAULT_PUBLISH_TIMEOUT);
        outbox.close().await;

        assert!(!outbox.enqueue(envelope(1)).await);
        assert!(broker.is_empty());
    }
}

//! Durable broker abstraction.
//!
//! A broker appends envelopes to a persistent, replayable stream and runs
//! named consumers that resume from their last acknowledged position.
//! Delivery is at-least-once: a message is acknowledged only after the
//! handler returned `Ok`, so handlers must be idempotent.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use draftboard_protocol::Envelope;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::{EventBusError, Result};
use super::jetstream::JetStreamBroker;
use super::memory::MemoryBroker;

/// Broker URL scheme selecting the in-process durable log.
pub const MEMORY_SCHEME: &str = "memory://";

// ============================================================================
// Handler
// ============================================================================

/// Processes envelopes delivered to a durable consumer.
///
/// Returning `Err` leaves the message unacknowledged and it is delivered
/// again.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for HandlerFn<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        (self.0)(envelope).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

// ============================================================================
// Options
// ============================================================================

/// How long the durable stream keeps messages. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub max_age_secs: u64,
    #[serde(default)]
    pub max_messages: i64,
}

impl RetentionPolicy {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_secs > 0).then(|| Duration::from_secs(self.max_age_secs))
    }

    pub fn max_messages(&self) -> Option<usize> {
        usize::try_from(self.max_messages).ok().filter(|n| *n > 0)
    }
}

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub stream: String,
    pub subject: String,
    pub retention: RetentionPolicy,
    /// How long the broker waits for an acknowledgement before redelivering.
    pub ack_wait: Duration,
    /// Delay requested when negatively acknowledging.
    pub redelivery_delay: Duration,
    /// Delivery attempts per message; `-1` is unlimited.
    pub max_deliver: i64,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            stream: "DRAFT_EVENTS".to_string(),
            subject: "draft.events".to_string(),
            retention: RetentionPolicy::unlimited(),
            ack_wait: Duration::from_secs(30),
            redelivery_delay: Duration::from_secs(1),
            max_deliver: -1,
        }
    }
}

// ============================================================================
// Broker trait
// ============================================================================

#[async_trait]
pub trait DurableBroker: Send + Sync {
    /// Backend name for logs.
    fn backend(&self) -> &'static str;

    /// Append an envelope; returns its position in the stream.
    async fn publish(&self, envelope: &Envelope) -> Result<u64>;

    /// Start a named, manually acknowledged consumer. Re-using a name resumes
    /// after the last acknowledged message.
    async fn subscribe_durable(
        &self,
        consumer: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<DurableSubscription>;

    /// Stop all consumers and release the connection. Unacknowledged
    /// messages stay pending for the next consumer with the same name.
    async fn close(&self);
}

/// Connect to the broker named by `url`.
///
/// `memory://` selects the in-process log; anything else is handed to NATS.
pub async fn connect(url: &str, options: BrokerOptions) -> Result<Arc<dyn DurableBroker>> {
    let url = url.trim();
    if url.is_empty() {
        return Err(EventBusError::InvalidBrokerUrl(url.to_string()));
    }

    if url.starts_with(MEMORY_SCHEME) {
        info!(stream = %options.stream, "using in-process durable log");
        return Ok(Arc::new(MemoryBroker::new(options)));
    }

    let broker = JetStreamBroker::connect(url, options).await?;
    Ok(Arc::new(broker))
}

// ============================================================================
// Durable subscription
// ============================================================================

/// Handle to a running durable consumer loop. Dropping the handle stops the
/// loop the same way [`DurableSubscription::stop`] does, without waiting.
#[derive(Debug)]
pub struct DurableSubscription {
    consumer: String,
    task: JoinHandle<()>,
}

impl DurableSubscription {
    pub(crate) fn new(consumer: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self {
            consumer: consumer.into(),
            task,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the consumer loop. A message being handled right now is left
    /// unacknowledged and will be redelivered.
    pub async fn stop(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        debug!(consumer = %self.consumer, "durable subscription stopped");
    }
}

impl Drop for DurableSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Shared delivery logic
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Ack,
    Nak,
}

/// Decode one message body and run the handler on it.
pub(crate) async fn dispatch(consumer: &str, body: &[u8], handler: &dyn EventHandler) -> Disposition {
    let envelope = match Envelope::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(consumer = %consumer, error = %e, "undecodable message, requesting redelivery");
            return Disposition::Nak;
        }
    };

    if !envelope.kind().is_known() {
        debug!(consumer = %consumer, id = %envelope.id(), "ignoring unknown event kind");
        return Disposition::Ack;
    }

    let id = envelope.id();
    let kind = envelope.kind();
    // A panicking handler must not take the consumer loop down with it.
    match AssertUnwindSafe(handler.handle(envelope)).catch_unwind().await {
        Ok(Ok(())) => Disposition::Ack,
        Ok(Err(e)) => {
            warn!(consumer = %consumer, id = %id, kind = %kind, error = %e, "handler failed, requesting redelivery");
            Disposition::Nak
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(consumer = %consumer, id = %id, kind = %kind, panic = %reason, "handler panicked, requesting redelivery");
            Disposition::Nak
        }
    }
}

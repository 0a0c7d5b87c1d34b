use std::sync::Arc;
use std::time::Duration;

use draftboard_protocol::Envelope;
use tokio::sync::Mutex;
use tracing::info;

use super::broker::{self, DurableBroker, DurableSubscription, EventHandler};
use super::error::{EventBusError, Result};
use super::local::{FanOut, LocalBus, Subscription, SubscriptionId};
use super::outbox::{Outbox, DEFAULT_OUTBOX_CAPACITY, DEFAULT_PUBLISH_TIMEOUT};
use crate::config::EventBusSettings;

enum Mode {
    LocalOnly,
    Durable {
        broker: Arc<dyn DurableBroker>,
        outbox: Outbox,
        /// Serializes fan-out and enqueue so concurrent publishers see the
        /// same order locally and on the stream.
        publish_order: Mutex<()>,
    },
}

/// Single publish/subscribe entry point.
///
/// Every publish fans out on the local bus. When built with a broker it is
/// also appended to the durable stream, after the local fan-out. The mode is
/// fixed at construction.
pub struct PubSub {
    local: LocalBus,
    mode: Mode,
    replica_id: String,
    durable_subscriptions: Mutex<Vec<DurableSubscription>>,
}

impl PubSub {
    pub fn local_only(local: LocalBus, replica_id: impl Into<String>) -> Self {
        Self {
            local,
            mode: Mode::LocalOnly,
            replica_id: replica_id.into(),
            durable_subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_broker(
        local: LocalBus,
        replica_id: impl Into<String>,
        broker: Arc<dyn DurableBroker>,
        outbox_capacity: usize,
        publish_timeout: Duration,
    ) -> Self {
        let outbox = Outbox::spawn(broker.clone(), outbox_capacity, publish_timeout);
        Self {
            local,
            mode: Mode::Durable {
                broker,
                outbox,
                publish_order: Mutex::new(()),
            },
            replica_id: replica_id.into(),
            durable_subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Build from configuration. Broker connection failures are returned so
    /// the caller can decide between local-only and refusing to start.
    pub async fn from_settings(settings: &EventBusSettings) -> Result<Self> {
        let local = LocalBus::with_capacity(settings.subscriber_capacity);
        let replica_id = settings.replica_id();

        let Some(url) = settings.broker_url.as_deref() else {
            info!(replica = %replica_id, "no broker configured, running local-only");
            return Ok(Self::local_only(local, replica_id));
        };

        let broker = broker::connect(url, settings.broker_options()).await?;
        info!(replica = %replica_id, backend = broker.backend(), "durable broker connected");

        Ok(Self::with_broker(
            local,
            replica_id,
            broker,
            settings.outbox_capacity,
            settings.publish_timeout(),
        ))
    }

    /// Local-only facade with default sizing.
    pub fn in_process() -> Self {
        Self::local_only(LocalBus::new(), uuid::Uuid::new_v4().to_string())
    }

    /// Durable facade with default sizing.
    pub fn in_process_with(broker: Arc<dyn DurableBroker>) -> Self {
        Self::with_broker(
            LocalBus::new(),
            uuid::Uuid::new_v4().to_string(),
            broker,
            DEFAULT_OUTBOX_CAPACITY,
            DEFAULT_PUBLISH_TIMEOUT,
        )
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn is_durable(&self) -> bool {
        matches!(self.mode, Mode::Durable { .. })
    }

    pub fn local(&self) -> &LocalBus {
        &self.local
    }

    /// Publish an envelope. Never fails: local drops are silent and durable
    /// append problems are logged.
    pub async fn publish(&self, envelope: Envelope) -> FanOut {
        let envelope = match envelope.origin() {
            Some(_) => envelope,
            None => envelope.with_origin(self.replica_id.as_str()),
        };
        let envelope = Arc::new(envelope);

        match &self.mode {
            Mode::LocalOnly => self.local.publish(envelope).await,
            Mode::Durable {
                outbox,
                publish_order,
                ..
            } => {
                let _order = publish_order.lock().await;
                let fan_out = self.local.publish(envelope.clone()).await;
                outbox.enqueue(envelope).await;
                fan_out
            }
        }
    }

    pub async fn subscribe(&self) -> Subscription {
        self.local.subscribe().await
    }

    pub async fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        self.local.subscribe_with_capacity(capacity).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.local.unsubscribe(id).await
    }

    /// Start a named durable consumer. Fails with `DurableUnsupported` in
    /// local-only mode.
    pub async fn subscribe_durable(
        &self,
        consumer: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<DurableSubscription> {
        match &self.mode {
            Mode::LocalOnly => Err(EventBusError::DurableUnsupported),
            Mode::Durable { broker, .. } => broker.subscribe_durable(consumer, handler).await,
        }
    }

    /// Start a durable consumer owned by the facade and stopped on shutdown.
    pub async fn attach_durable(&self, consumer: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        let subscription = self.subscribe_durable(consumer, handler).await?;
        self.durable_subscriptions.lock().await.push(subscription);
        Ok(())
    }

    /// Close local subscriptions, drain the outbox, stop durable consumers
    /// and release the broker.
    pub async fn shutdown(&self) {
        self.local.shutdown().await;

        let attached: Vec<DurableSubscription> = self.durable_subscriptions.lock().await.drain(..).collect();
        for subscription in attached {
            subscription.stop().await;
        }

        if let Mode::Durable { broker, outbox, .. } = &self.mode {
            outbox.close().await;
            broker.close().await;
        }

        info!(replica = %self.replica_id, "event bus shut down");
    }
}

use std::sync::{Arc, Mutex, RwLock};

use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, consumer::DeliverPolicy, stream, AckKind};
use async_nats::HeaderMap;
use async_trait::async_trait;
use draftboard_protocol::Envelope;
use futures_util::StreamExt;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::broker::{dispatch, BrokerOptions, Disposition, DurableBroker, DurableSubscription, EventHandler};
use super::error::{EventBusError, Result};

/// Header NATS uses to de-duplicate appends.
const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// NATS JetStream backed durable stream.
pub struct JetStreamBroker {
    /// `None` once closed; the connection ends when the last clone drops.
    connection: RwLock<Option<Connection>>,
    options: BrokerOptions,
    consumers: Mutex<Vec<AbortHandle>>,
}

#[derive(Clone)]
struct Connection {
    client: async_nats::Client,
    context: jetstream::Context,
}

impl JetStreamBroker {
    /// Connect and make sure the stream exists. An existing stream is reused
    /// as is; a missing one is created with the configured retention.
    pub async fn connect(url: &str, options: BrokerOptions) -> Result<Self> {
        info!(url = %url, stream = %options.stream, subject = %options.subject, "connecting to NATS JetStream");

        let client = async_nats::connect(url)
            .await
            .map_err(|e| EventBusError::BrokerConnect(e.to_string()))?;
        let context = jetstream::new(client.clone());

        let mut config = stream::Config {
            name: options.stream.clone(),
            subjects: vec![options.subject.clone()],
            storage: stream::StorageType::File,
            ..Default::default()
        };
        if let Some(max_age) = options.retention.max_age() {
            config.max_age = max_age;
        }
        if options.retention.max_messages > 0 {
            config.max_messages = options.retention.max_messages;
        }

        context
            .get_or_create_stream(config)
            .await
            .map_err(|e| EventBusError::StreamSetup(e.to_string()))?;

        info!(stream = %options.stream, "JetStream stream ready");

        Ok(Self {
            connection: RwLock::new(Some(Connection { client, context })),
            options,
            consumers: Mutex::new(Vec::new()),
        })
    }

    fn context(&self) -> Result<jetstream::Context> {
        self.connection
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| c.context.clone())
            .ok_or(EventBusError::Closed)
    }

    fn track(&self, handle: AbortHandle) {
        let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
        consumers.retain(|h| !h.is_finished());
        consumers.push(handle);
    }
}

#[async_trait]
impl DurableBroker for JetStreamBroker {
    fn backend(&self) -> &'static str {
        "jetstream"
    }

    async fn publish(&self, envelope: &Envelope) -> Result<u64> {
        let payload = envelope.to_bytes()?;

        let mut headers = HeaderMap::new();
        headers.insert(MSG_ID_HEADER, envelope.id().to_string().as_str());

        let ack = self
            .context()?
            .publish_with_headers(self.options.subject.clone(), headers, payload.into())
            .await
            .map_err(|e| EventBusError::Publish(e.to_string()))?
            .await
            .map_err(|e| EventBusError::Publish(e.to_string()))?;

        if ack.duplicate {
            debug!(id = %envelope.id(), sequence = ack.sequence, "broker reported duplicate append");
        }

        Ok(ack.sequence)
    }

    async fn subscribe_durable(
        &self,
        consumer: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<DurableSubscription> {
        let stream = self
            .context()?
            .get_stream(&self.options.stream)
            .await
            .map_err(|e| EventBusError::Consumer(e.to_string()))?;

        // One unacknowledged message at a time keeps delivery ordered and
        // applies backpressure to the handler.
        let durable = stream
            .get_or_create_consumer(
                consumer,
                pull::Config {
                    durable_name: Some(consumer.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy: DeliverPolicy::All,
                    ack_wait: self.options.ack_wait,
                    max_deliver: self.options.max_deliver,
                    max_ack_pending: 1,
                    filter_subject: self.options.subject.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EventBusError::Consumer(e.to_string()))?;

        let mut messages = durable
            .messages()
            .await
            .map_err(|e| EventBusError::Consumer(e.to_string()))?;

        let name = consumer.to_string();
        let redelivery_delay = self.options.redelivery_delay;

        let task = tokio::spawn(async move {
            info!(consumer = %name, "durable consumer started");

            while let Some(next) = messages.next().await {
                let message = match next {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(consumer = %name, error = %e, "failed to pull message");
                        continue;
                    }
                };

                let result = match dispatch(&name, &message.message.payload, handler.as_ref()).await {
                    Disposition::Ack => message.ack().await,
                    Disposition::Nak => message.ack_with(AckKind::Nak(Some(redelivery_delay))).await,
                };

                if let Err(e) = result {
                    // The broker redelivers after ack_wait.
                    error!(consumer = %name, error = %e, "failed to acknowledge message");
                }
            }

            warn!(consumer = %name, "durable consumer stream ended");
        });

        self.track(task.abort_handle());
        Ok(DurableSubscription::new(consumer, task))
    }

    async fn close(&self) {
        let handles: Vec<AbortHandle> = {
            let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
            consumers.drain(..).collect()
        };
        for handle in &handles {
            handle.abort();
        }

        let connection = self.connection.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(connection) = connection {
            if let Err(e) = connection.client.flush().await {
                warn!(error = %e, "failed to flush NATS connection on close");
            }
        }

        info!(stopped_consumers = handles.len(), "JetStream broker closed");
    }
}

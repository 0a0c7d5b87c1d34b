use std::sync::Arc;

use async_trait::async_trait;
use draftboard_protocol::Envelope;
use tracing::trace;

use super::broker::EventHandler;
use super::local::LocalBus;

/// Durable handler that replays envelopes published by other replicas onto
/// this replica's local bus.
///
/// Envelopes carrying this replica's own origin were already fanned out
/// locally at publish time and are skipped.
pub struct ReplicaBridge {
    replica_id: String,
    local: LocalBus,
}

impl ReplicaBridge {
    pub fn new(replica_id: impl Into<String>, local: LocalBus) -> Self {
        Self {
            replica_id: replica_id.into(),
            local,
        }
    }

    pub fn into_handler(self) -> Arc<dyn EventHandler> {
        Arc::new(self)
    }
}

#[async_trait]
impl EventHandler for ReplicaBridge {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        if envelope.origin() == Some(self.replica_id.as_str()) {
            trace!(id = %envelope.id(), "skipping own envelope");
            return Ok(());
        }

        let fan_out = self.local.publish(Arc::new(envelope)).await;
        trace!(delivered = fan_out.delivered, dropped = fan_out.dropped, "replica envelope bridged");
        Ok(())
    }
}

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use draftboard_protocol::{Envelope, EventKind};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::Bus;

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EmitEventRequest {
    /// Wire kind, e.g. "player.drafted"
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmitEventResponse {
    pub id: Uuid,
    /// Local subscribers that received the envelope
    pub delivered: usize,
    /// Local subscribers that missed it because their buffer was full
    pub dropped: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventBusStats {
    pub subscribers: usize,
    pub dropped_total: u64,
    pub durable: bool,
}

// ============================================================================
// HTTP Handlers
// ============================================================================

/// POST /api/events
/// Publish an event to local subscribers and, when configured, the durable stream
pub async fn emit_event(
    State(bus): State<Bus>,
    Json(req): Json<EmitEventRequest>,
) -> Result<(StatusCode, Json<EmitEventResponse>), ApiError> {
    let kind = EventKind::parse(&req.kind);
    if !kind.is_known() {
        return Err(ApiError::bad_request(format!("unknown event kind: {}", req.kind)));
    }

    let envelope = Envelope::new(kind, req.payload);
    let id = envelope.id();
    let fan_out = bus.publish(envelope).await;

    debug!(id = %id, kind = %kind, delivered = fan_out.delivered, dropped = fan_out.dropped, "event emitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(EmitEventResponse {
            id,
            delivered: fan_out.delivered,
            dropped: fan_out.dropped,
        }),
    ))
}

/// GET /api/events/stats
pub async fn event_stats(State(bus): State<Bus>) -> Json<EventBusStats> {
    Json(EventBusStats {
        subscribers: bus.local().subscriber_count().await,
        dropped_total: bus.local().dropped_total(),
        durable: bus.is_durable(),
    })
}

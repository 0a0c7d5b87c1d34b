//! WebSocket API for live event subscriptions
//!
//! Each connection holds one local bus subscription. Envelopes are pushed as
//! they are published; a client that cannot keep up misses events rather
//! than slowing the publisher.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use draftboard_protocol::{Envelope, EventKind};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::Bus;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket subscription parameters
#[derive(Debug, Deserialize)]
pub struct WsSubscribeParams {
    /// Event kinds to subscribe (comma-separated, supports wildcards)
    /// Examples: "player.drafted", "chat.*"
    pub kinds: Option<String>,
}

/// WebSocket message types
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsMessage<'a> {
    /// Event notification, the envelope's fields inline
    Event(&'a Envelope),

    /// Subscription acknowledged
    Subscribed { kinds: Option<Vec<String>> },

    /// Error message
    Error { message: String },

    /// Heartbeat ping
    Ping,
}

impl WsMessage<'_> {
    fn to_frame(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Message::Text(json)),
            Err(e) => {
                error!(error = %e, "failed to encode websocket message");
                None
            }
        }
    }
}

/// GET /ws/events
/// Subscribe to live events via WebSocket
///
/// Example:
/// ```text
/// ws://localhost:3000/ws/events?kinds=chat.*,player.drafted
/// ```
pub async fn events_websocket(
    ws: WebSocketUpgrade,
    State(bus): State<Bus>,
    Query(params): Query<WsSubscribeParams>,
) -> Response {
    info!(kinds = ?params.kinds, "websocket event stream connection established");

    ws.on_upgrade(move |socket| handle_event_socket(socket, bus, params))
}

async fn handle_event_socket(socket: WebSocket, bus: Bus, params: WsSubscribeParams) {
    let (mut tx, mut rx) = socket.split();

    let kinds_filter = parse_kinds(params.kinds.as_deref());
    let mut subscription = bus.subscribe().await;
    let subscription_id = subscription.id();

    let subscribed = WsMessage::Subscribed {
        kinds: kinds_filter.clone(),
    };
    if let Some(frame) = subscribed.to_frame() {
        if tx.send(frame).await.is_err() {
            bus.unsubscribe(subscription_id).await;
            return;
        }
    }

    // Reject unknown exact kinds up front so typos are visible to the client.
    if let Some(unknown) = kinds_filter
        .iter()
        .flatten()
        .find(|pattern| !pattern.ends_with('*') && !EventKind::parse(pattern).is_known())
    {
        let warning = WsMessage::Error {
            message: format!("unknown event kind in filter: {}", unknown),
        };
        if let Some(frame) = warning.to_frame() {
            let _ = tx.send(frame).await;
        }
    }

    debug!(subscription = %subscription_id, "starting live event stream");

    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );

    loop {
        tokio::select! {
            envelope = subscription.recv() => {
                let Some(envelope) = envelope else {
                    debug!(subscription = %subscription_id, "event bus closed the subscription");
                    let _ = tx.send(Message::Close(None)).await;
                    break;
                };

                if !should_send_event(envelope.kind(), &kinds_filter) {
                    continue;
                }

                if let Some(frame) = WsMessage::Event(&envelope).to_frame() {
                    if tx.send(frame).await.is_err() {
                        debug!("client disconnected, closing event stream");
                        break;
                    }
                }
            }

            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) => {
                        debug!("client sent close frame");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(message = %text, "ignoring text message from client");
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "websocket error");
                        break;
                    }
                    None => {
                        debug!("client disconnected");
                        break;
                    }
                    _ => {}
                }
            }

            _ = heartbeat.tick() => {
                if let Some(frame) = WsMessage::Ping.to_frame() {
                    if tx.send(frame).await.is_err() {
                        debug!("failed to send heartbeat, client disconnected");
                        break;
                    }
                }
            }
        }
    }

    bus.unsubscribe(subscription_id).await;
    info!(subscription = %subscription_id, "websocket event stream closed");
}

/// Split a comma-separated kinds parameter. Empty means no filter.
fn parse_kinds(kinds: Option<&str>) -> Option<Vec<String>> {
    let kinds: Vec<String> = kinds?
        .split(',')
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect();

    (!kinds.is_empty()).then_some(kinds)
}

/// Check if an event should be sent based on kind filters
fn should_send_event(kind: EventKind, kinds_filter: &Option<Vec<String>>) -> bool {
    if let Some(kinds) = kinds_filter {
        let kind = kind.as_str();
        kinds.iter().any(|pattern| {
            if pattern.ends_with('*') {
                let prefix = pattern.trim_end_matches('*');
                kind.starts_with(prefix)
            } else {
                kind == pattern
            }
        })
    } else {
        // No filter = send all events
        true
    }
}

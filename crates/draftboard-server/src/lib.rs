pub mod api;
pub mod config;
pub mod event_bus;

use std::ops::Deref;
use std::sync::Arc;

use axum::extract::FromRef;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use thiserror::Error;

use crate::api::{event_stream, events};
use crate::config::Settings;
use crate::event_bus::{EventBusError, PubSub};

// ============================================================================
// Event bus wrapper
// ============================================================================

/// Pub/sub facade wrapper for state extraction
#[derive(Clone)]
pub struct Bus(pub Arc<PubSub>);

impl Deref for Bus {
    type Target = PubSub;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum DraftboardError {
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DraftboardError>;

// ============================================================================
// Application state
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub bus: Bus,
    pub settings: Settings,
}

impl AppState {
    pub fn new(pubsub: Arc<PubSub>, settings: Settings) -> Self {
        Self {
            bus: Bus(pubsub),
            settings,
        }
    }
}

impl FromRef<AppState> for Bus {
    fn from_ref(state: &AppState) -> Self {
        state.bus.clone()
    }
}

impl FromRef<AppState> for Settings {
    fn from_ref(state: &AppState) -> Self {
        state.settings.clone()
    }
}

// ============================================================================
// Routes
// ============================================================================

async fn health_check() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/api", get(health_check))
        // Event routes
        .route("/api/events", post(events::emit_event))
        .route("/api/events/stats", get(events::event_stats))
        // Live event stream
        .route("/ws/events", get(event_stream::events_websocket))
        .with_state(state)
}

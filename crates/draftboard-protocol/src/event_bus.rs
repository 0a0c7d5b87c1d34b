//! Event envelope and event kind definitions.
//!
//! Kinds follow the format `<category>.<action>`. A consumer that reads a
//! kind it does not know decodes it as [`EventKind::Unknown`] instead of
//! failing, so older replicas keep running while newer ones add kinds.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Current envelope schema version.
pub const ENVELOPE_VERSION: u16 = 1;

// ============================================================================
// Event Kind
// ============================================================================

/// Closed set of draft events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    // Players
    #[serde(rename = "player.added")]
    PlayerAdded,
    #[serde(rename = "player.drafted")]
    PlayerDrafted,
    #[serde(rename = "points.updated")]
    PointsUpdated,

    // Chat
    #[serde(rename = "chat.message")]
    ChatMessage,
    #[serde(rename = "reaction.added")]
    ReactionAdded,

    // Teams
    #[serde(rename = "team.added")]
    TeamAdded,
    #[serde(rename = "team.reordered")]
    TeamReordered,
    #[serde(rename = "teams.reordered")]
    TeamsReordered,

    /// Any kind this build does not recognise.
    #[serde(rename = "unknown", other)]
    Unknown,
}

impl EventKind {
    /// Every kind a producer may publish.
    pub const ALL: [EventKind; 8] = [
        EventKind::PlayerAdded,
        EventKind::PlayerDrafted,
        EventKind::PointsUpdated,
        EventKind::ChatMessage,
        EventKind::ReactionAdded,
        EventKind::TeamAdded,
        EventKind::TeamReordered,
        EventKind::TeamsReordered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PlayerAdded => "player.added",
            EventKind::PlayerDrafted => "player.drafted",
            EventKind::PointsUpdated => "points.updated",
            EventKind::ChatMessage => "chat.message",
            EventKind::ReactionAdded => "reaction.added",
            EventKind::TeamAdded => "team.added",
            EventKind::TeamReordered => "team.reordered",
            EventKind::TeamsReordered => "teams.reordered",
            EventKind::Unknown => "unknown",
        }
    }

    /// Parse a wire name. Unrecognised names map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .unwrap_or(EventKind::Unknown)
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventKind::Unknown)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Envelope
// ============================================================================

fn default_version() -> u16 {
    ENVELOPE_VERSION
}

/// The unit of data carried through the event bus.
///
/// Fields are private: once an envelope has been handed to a publisher it
/// cannot be changed, only read. The payload is opaque to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: Uuid,
    #[serde(default = "default_version")]
    version: u16,
    kind: EventKind,
    #[serde(default)]
    payload: Value,
    time: DateTime<Utc>,
    /// Replica that published the envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<String>,
}

impl Envelope {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: ENVELOPE_VERSION,
            kind,
            payload,
            time: Utc::now(),
            origin: None,
        }
    }

    /// Build an envelope from any serializable payload.
    pub fn from_data<T: Serialize>(kind: EventKind, data: &T) -> serde_json::Result<Self> {
        Ok(Self::new(kind, serde_json::to_value(data)?))
    }

    /// Set the publishing replica.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.payload)
    }

    /// Encode for the durable stream.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a message body read from the durable stream.
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

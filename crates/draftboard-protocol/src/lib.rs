//! Shared protocol definitions for the draftboard event stream.
//!
//! Everything that crosses a process boundary lives here: the [`Envelope`]
//! published by mutation handlers and the closed [`EventKind`] set. The same
//! JSON encoding is used on the durable stream and on the browser WebSocket.

pub mod event_bus;

pub use event_bus::{Envelope, EventKind, ENVELOPE_VERSION};

pub mod error;
pub mod event_stream;
pub mod events;

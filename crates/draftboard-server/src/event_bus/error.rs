use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("broker connection error: {0}")]
    BrokerConnect(String),

    #[error("stream setup error: {0}")]
    StreamSetup(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("publish timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("consumer error: {0}")]
    Consumer(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid broker url: {0}")]
    InvalidBrokerUrl(String),

    #[error("durable subscriptions require a configured broker")]
    DurableUnsupported,

    #[error("durable consumer '{0}' is already active")]
    ConsumerActive(String),

    #[error("event bus is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, EventBusError>;

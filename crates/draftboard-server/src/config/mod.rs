use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::event_bus::local::DEFAULT_SUBSCRIBER_CAPACITY;
use crate::event_bus::outbox::DEFAULT_OUTBOX_CAPACITY;
use crate::event_bus::{BrokerOptions, RetentionPolicy};

/// Event distribution settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EventBusSettings {
    /// Durable broker URL. Absent runs local-only, `memory://` uses the
    /// in-process log.
    #[serde(default)]
    pub broker_url: Option<String>,
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    /// Per-subscriber buffer (default: 100)
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
    /// Pending durable appends before new ones are dropped (default: 1024)
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_ack_wait_ms")]
    pub ack_wait_ms: u64,
    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,
    /// Delivery attempts per message, -1 for unlimited
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i64,
    /// Refuse to start when the broker is unreachable
    #[serde(default)]
    pub require_broker: bool,
    /// Identifies this process in envelope origins (default: random uuid)
    #[serde(default)]
    pub replica_id: Option<String>,
    /// Durable consumer name for the replica bridge
    #[serde(default)]
    pub replica_consumer: Option<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
}

fn default_stream() -> String {
    "DRAFT_EVENTS".to_string()
}

fn default_subject() -> String {
    "draft.events".to_string()
}

fn default_subscriber_capacity() -> usize {
    DEFAULT_SUBSCRIBER_CAPACITY
}

fn default_outbox_capacity() -> usize {
    DEFAULT_OUTBOX_CAPACITY
}

fn default_publish_timeout_ms() -> u64 {
    2_000
}

fn default_ack_wait_ms() -> u64 {
    30_000
}

fn default_redelivery_delay_ms() -> u64 {
    1_000
}

fn default_max_deliver() -> i64 {
    -1
}

impl Default for EventBusSettings {
    fn default() -> Self {
        Self {
            broker_url: None,
            stream: default_stream(),
            subject: default_subject(),
            subscriber_capacity: default_subscriber_capacity(),
            outbox_capacity: default_outbox_capacity(),
            publish_timeout_ms: default_publish_timeout_ms(),
            ack_wait_ms: default_ack_wait_ms(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
            max_deliver: default_max_deliver(),
            require_broker: false,
            replica_id: None,
            replica_consumer: None,
            retention: RetentionPolicy::unlimited(),
        }
    }
}

impl EventBusSettings {
    /// Configured replica id, or a fresh random one.
    pub fn replica_id(&self) -> String {
        self.replica_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            stream: self.stream.clone(),
            subject: self.subject.clone(),
            retention: self.retention,
            ack_wait: Duration::from_millis(self.ack_wait_ms),
            redelivery_delay: Duration::from_millis(self.redelivery_delay_ms),
            max_deliver: self.max_deliver,
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Reject values that would make every durable append fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publish_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "event_bus.publish_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub event_bus: EventBusSettings,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            event_bus: EventBusSettings::default(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with defaults
            .add_source(File::with_name("config/default").required(false))
            // Add environment-specific file
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local configuration file (not tracked by git)
            .add_source(File::with_name("config/local").required(false))
            // e.g. DRAFTBOARD__EVENT_BUS__BROKER_URL
            .add_source(Environment::with_prefix("DRAFTBOARD").separator("__"))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.event_bus.validate()?;

        // Pin the replica id so every component sees the same one.
        if settings.event_bus.replica_id.is_none() {
            settings.event_bus.replica_id = Some(settings.event_bus.replica_id());
        }

        Ok(settings)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

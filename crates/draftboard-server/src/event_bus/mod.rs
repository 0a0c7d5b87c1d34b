// Event distribution.
//
// Every event is fanned out to in-process subscribers. When a broker is
// configured it is also appended to a durable stream that named consumers
// read with at-least-once delivery.

pub mod bridge;
pub mod broker;
pub mod error;
pub mod jetstream;
pub mod local;
pub mod memory;
pub mod outbox;
pub mod pubsub;

pub use bridge::ReplicaBridge;
pub use broker::{handler_fn, BrokerOptions, DurableBroker, DurableSubscription, EventHandler, RetentionPolicy};
pub use error::EventBusError;
pub use jetstream::JetStreamBroker;
pub use local::{FanOut, LocalBus, SharedEnvelope, Subscription, SubscriptionId};
pub use memory::MemoryBroker;
pub use pubsub::PubSub;

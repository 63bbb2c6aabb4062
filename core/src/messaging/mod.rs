//! Messaging layer: broker transports, publisher, and reply subscriber.
//!
//! This module provides the broker-facing half of the bridge:
//! - `Transport`: the pub/sub seam every broker adapter implements
//! - `MemoryBroker`: in-process topic broker with per-topic stats
//! - `Publisher` / `Subscriber`: one outbound and one inbound channel
//! - `KeyExtractor`: how a correlation key is read off an inbound message

pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod publisher;
pub mod subscriber;
pub mod transport;

// Re-export key types for ergonomic access
pub use memory::{MemoryBroker, TopicStats};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;
pub use publisher::Publisher;
pub use subscriber::{DispatchStats, ReplyHandler, Subscriber};
pub use transport::{BrokerMessage, KeyExtractor, MessageKey, TopicSuffix, Transport};

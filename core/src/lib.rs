// Market Bus Core Library
// Request/response correlation over a publish/subscribe broker

pub mod client;
pub mod config;
pub mod correlation;
pub mod envelope;
pub mod messaging;
pub mod readiness;
pub mod telemetry;

// Export core types
pub use client::{Reply, RequestClient, SendOptions};
pub use config::BridgeConfig;
pub use correlation::{CorrelationTable, Outcome, ReplyHandle};
pub use envelope::Envelope;
pub use messaging::{
    BrokerMessage, DispatchStats, KeyExtractor, MemoryBroker, MessageKey, Publisher,
    ReplyHandler, Subscriber, TopicSuffix, Transport,
};
pub use readiness::{Readiness, ReadinessState};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Broker connect error: {0}")]
    Connect(String),

    #[error("Publish failed for key {key}: {reason}")]
    Publish { key: String, reason: String },

    #[error("No reply for key {key} within {timeout_ms}ms")]
    Timeout { key: String, timeout_ms: u64 },

    #[error("Correlation key already in flight: {0}")]
    DuplicateKey(String),

    #[error("Correlation key {key:?} cannot be routed: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Invalid reply for key {key}: {reason}")]
    InvalidReply { key: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Client closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout { .. })
    }

    /// Whether resending the same command may succeed. Timeouts are included:
    /// the worker may or may not have executed the command, so the caller owns
    /// the decision.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::Timeout { .. } | BusError::Publish { .. })
    }
}

pub type Result<T> = std::result::Result<T, BusError>;

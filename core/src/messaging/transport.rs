use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{BusError, Result};

/// One message as seen by a broker transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    /// Transport-level key; carries the correlation key for commands and replies.
    pub key: Option<String>,
    pub value: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, key: Option<String>, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key,
            value,
        }
    }
}

/// Publish/subscribe seam implemented by every broker adapter.
///
/// Implementations must be safe to share between the publisher and the
/// subscriber, although the bridge normally gives each its own instance.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes the broker connection.
    async fn connect(&self) -> Result<()>;

    /// Publishes `message` to `message.topic`. Success means broker acceptance only.
    async fn publish(&self, message: BrokerMessage) -> Result<()>;

    /// Subscribes to `topic`; messages are delivered on the returned receiver.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BrokerMessage>>;

    /// Releases the connection. Further use is undefined.
    async fn close(&self) -> Result<()>;

    /// How inbound messages on this transport carry their correlation key.
    fn key_extractor(&self) -> Arc<dyn KeyExtractor> {
        Arc::new(MessageKey)
    }

    /// Rejects keys a reply could not be correlated on. Empty keys are never
    /// routable; transports that encode the key elsewhere add their own rules.
    fn validate_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(BusError::InvalidKey {
                key: key.to_string(),
                reason: "key is empty".into(),
            });
        }
        Ok(())
    }
}

/// Reads the correlation key off an inbound message without touching its body.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, message: &BrokerMessage) -> Option<String>;
}

/// Uses the transport-level message key.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageKey;

impl KeyExtractor for MessageKey {
    fn extract(&self, message: &BrokerMessage) -> Option<String> {
        message.key.clone().filter(|k| !k.is_empty())
    }
}

/// Uses the last `/`-separated topic segment, for transports with no key field.
///
/// ```
/// use market_bus_core::{BrokerMessage, KeyExtractor, TopicSuffix};
///
/// let msg = BrokerMessage::new("replies/market-rest/abc-123", None, vec![]);
/// assert_eq!(TopicSuffix.extract(&msg).as_deref(), Some("abc-123"));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicSuffix;

impl KeyExtractor for TopicSuffix {
    fn extract(&self, message: &BrokerMessage) -> Option<String> {
        message
            .topic
            .rsplit_once('/')
            .map(|(_, key)| key)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
    }
}

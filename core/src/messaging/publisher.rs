use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::transport::{BrokerMessage, Transport};
use crate::readiness::Readiness;
use crate::{BusError, Envelope, Result};

/// Owns the outbound channel to the broker.
///
/// The connection is opened lazily by the first `send` (or an explicit
/// `connect`) and reused afterwards. Concurrent first callers share a single
/// connection attempt.
pub struct Publisher {
    transport: Arc<dyn Transport>,
    readiness: Readiness,
}

impl Publisher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            readiness: Readiness::new("publisher"),
        }
    }

    /// Idempotent; every caller converges on the first attempt's result.
    pub async fn connect(&self) -> Result<()> {
        let transport = Arc::clone(&self.transport);
        self.readiness
            .ensure(|| async move {
                transport.connect().await?;
                info!(target: "publisher", "Publisher connected");
                Ok(())
            })
            .await
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Whether the outbound transport can carry `key`.
    pub fn validate_key(&self, key: &str) -> Result<()> {
        self.transport.validate_key(key)
    }

    /// Publishes `envelope` to `topic` under `key`, or under a generated key
    /// when none is given. Returns the key used.
    ///
    /// Success only means the broker accepted the message.
    pub async fn send<T: Serialize>(
        &self,
        envelope: &Envelope<T>,
        key: Option<&str>,
        topic: &str,
    ) -> Result<String> {
        let key = key
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        self.connect().await?;
        let value = envelope.to_bytes()?;

        debug!(target: "publisher", topic = %topic, key = %key, uri = %envelope.uri(), "Publishing command");
        self.transport
            .publish(BrokerMessage::new(topic, Some(key.clone()), value))
            .await
            .map_err(|e| {
                warn!(target: "publisher", topic = %topic, key = %key, error = %e, "Publish rejected");
                match e {
                    BusError::Publish { .. } => e,
                    other => BusError::Publish {
                        key: key.clone(),
                        reason: other.to_string(),
                    },
                }
            })?;
        Ok(key)
    }

    pub async fn close(&self) -> Result<()> {
        self.readiness.mark_closed();
        self.transport.close().await?;
        info!(target: "publisher", "Publisher closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MemoryBroker;
    use serde_json::json;

    #[tokio::test]
    async fn send_connects_lazily_and_keys_the_message() {
        let broker = MemoryBroker::new();
        let publisher = Publisher::new(Arc::new(broker.clone()));
        assert!(!broker.is_connected());

        // Subscribing needs a connected broker; connect a second handle first.
        broker.connect().await.unwrap();
        let mut rx = broker.subscribe("commands").await.unwrap();

        let env = Envelope::new("src", "/stock/create", json!({"stockId": "ACB"}));
        let key = publisher.send(&env, Some("key-1"), "commands").await.unwrap();
        assert_eq!(key, "key-1");
        assert!(publisher.readiness().is_ready());

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.key.as_deref(), Some("key-1"));
        let decoded: Envelope = Envelope::from_slice(&msg.value).unwrap();
        assert_eq!(decoded, env);
    }

    #[tokio::test]
    async fn send_generates_a_key_when_none_is_given() {
        let broker = MemoryBroker::new();
        let publisher = Publisher::new(Arc::new(broker));
        let env = Envelope::new("src", "/user/create", json!({}));
        let key = publisher.send(&env, None, "commands").await.unwrap();
        assert!(uuid::Uuid::parse_str(&key).is_ok());
    }
}

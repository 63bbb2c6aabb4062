use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::FixedOffset;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::correlation::{CorrelationTable, Outcome};
use crate::messaging::{DispatchStats, Publisher, ReplyHandler, Subscriber, Transport};
use crate::{BridgeConfig, BusError, Envelope, Result};

/// Per-call overrides for [`RequestClient::send_and_wait`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Overrides the configured default timeout.
    pub timeout: Option<Duration>,
    /// Correlation key to use instead of a generated one.
    pub key: Option<String>,
    /// `sourceId` of the outbound envelope; defaults to the client id.
    pub source_id: Option<String>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_ms(self, timeout_ms: u64) -> Self {
        self.timeout(Duration::from_millis(timeout_ms))
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }
}

/// A matched reply together with the key it was correlated on.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<R = Value> {
    pub key: String,
    pub envelope: Envelope<R>,
}

impl<R> Reply<R> {
    pub fn payload(&self) -> &R {
        self.envelope.payload()
    }

    pub fn into_payload(self) -> R {
        self.envelope.into_payload()
    }
}

/// Routes keyed replies from the dispatch loop into the correlation table.
struct ReplyRouter {
    table: CorrelationTable<Envelope<Value>>,
}

impl ReplyHandler for ReplyRouter {
    fn handle(&self, key: &str, value: &[u8]) -> Result<bool> {
        // Unmatched replies are dropped before paying for a parse.
        if !self.table.contains(key) {
            return Ok(false);
        }
        let envelope = Envelope::<Value>::from_slice(value)?;
        Ok(self.table.resolve(key, envelope))
    }
}

/// Synchronous call/response over the broker.
///
/// Owns one publisher, one reply subscriber and the correlation table they
/// share. Any number of `send_and_wait` calls may run concurrently; each one
/// suspends only on readiness, on its publish acknowledgment, and on its own
/// reply handle.
///
/// # Examples
///
/// ```no_run
/// use market_bus_core::{BridgeConfig, MemoryBroker, RequestClient, SendOptions};
/// use serde_json::{json, Value};
/// use std::sync::Arc;
///
/// # async fn example() -> market_bus_core::Result<()> {
/// let config = BridgeConfig::load()?;
/// let client = RequestClient::with_transport(config, Arc::new(MemoryBroker::new()))?;
/// client.start().await?;
///
/// let reply = client
///     .send_and_wait::<_, Value>(
///         "/stock/create",
///         json!({"stockId": "ACB"}),
///         SendOptions::new().timeout_ms(5_000),
///     )
///     .await?;
/// println!("{}", reply.payload());
/// # Ok(())
/// # }
/// ```
pub struct RequestClient {
    config: BridgeConfig,
    offset: FixedOffset,
    publisher: Publisher,
    subscriber: Subscriber,
    table: CorrelationTable<Envelope<Value>>,
    closed: AtomicBool,
}

impl RequestClient {
    /// Builds a client with separate outbound and inbound transports.
    pub fn new(
        config: BridgeConfig,
        outbound: Arc<dyn Transport>,
        inbound: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let offset = config.offset()?;
        let subscriber = Subscriber::new(inbound, config.reply_topic.clone());
        Ok(Self {
            offset,
            publisher: Publisher::new(outbound),
            subscriber,
            table: CorrelationTable::new(),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Builds a client whose publisher and subscriber share one transport.
    pub fn with_transport(config: BridgeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::new(config, Arc::clone(&transport), transport)
    }

    /// Replaces the subscriber, e.g. to install a different key extractor.
    pub fn with_subscriber(mut self, subscriber: Subscriber) -> Self {
        self.subscriber = subscriber;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Connects the subscriber, subscribes to the reply topic and launches the
    /// dispatch loop. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let router = Arc::new(ReplyRouter {
            table: self.table.clone(),
        });
        self.subscriber.run(router).await?;
        debug!(
            target: "request_client",
            command_topic = %self.config.command_topic,
            reply_topic = %self.config.reply_topic,
            "Request client ready"
        );
        Ok(())
    }

    /// Sends `payload` to `uri` and waits for the correlated reply.
    ///
    /// # Errors
    ///
    /// * [`BusError::Connect`] - the subscriber or publisher could not reach the broker
    /// * [`BusError::Publish`] - the broker rejected the command; nothing is left pending
    /// * [`BusError::Timeout`] - no reply arrived in time; resending is the caller's call
    /// * [`BusError::InvalidReply`] - the reply payload does not decode into `R`
    /// * [`BusError::DuplicateKey`] - the supplied key is already in flight
    /// * [`BusError::InvalidKey`] - the supplied key cannot be routed by the transports
    #[tracing::instrument(skip_all, fields(uri = %uri))]
    pub async fn send_and_wait<P, R>(
        &self,
        uri: &str,
        payload: P,
        options: SendOptions,
    ) -> Result<Reply<R>>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let key = options
            .key
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.publisher.validate_key(&key)?;
        self.subscriber.validate_key(&key)?;

        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.default_timeout());
        if timeout.is_zero() {
            return Err(BusError::Config("timeout must be greater than 0".into()));
        }
        self.start().await?;
        let timeout_ms = timeout.as_millis() as u64;

        let source_id = options
            .source_id
            .unwrap_or_else(|| self.config.client_id.clone());
        let envelope = Envelope::builder(source_id, uri, payload)
            .offset(self.offset)
            .build();

        // Registered before publishing so a fast reply always finds its entry.
        let handle = self.table.register(key.clone(), timeout)?;

        if let Err(e) = self
            .publisher
            .send(&envelope, Some(&key), &self.config.command_topic)
            .await
        {
            self.table.cancel(&key);
            drop(handle);
            warn!(target: "request_client", key = %key, error = %e, "Command not published");
            return Err(e);
        }
        debug!(target: "request_client", key = %key, timeout_ms, "Command published; awaiting reply");

        match handle.wait().await {
            Outcome::Matched(reply) => {
                let envelope = reply.decode_payload::<R>().map_err(|e| BusError::InvalidReply {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
                Ok(Reply { key, envelope })
            }
            Outcome::TimedOut => {
                warn!(target: "request_client", key = %key, timeout_ms, "Reply timed out");
                Err(BusError::Timeout { key, timeout_ms })
            }
            Outcome::Cancelled => Err(BusError::Closed),
        }
    }

    /// Calls currently waiting for a reply.
    pub fn pending(&self) -> usize {
        self.table.len()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.subscriber.stats()
    }

    /// Fails every pending call with [`BusError::Closed`] and releases both
    /// broker channels.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let cancelled = self.table.cancel_all();
        if cancelled > 0 {
            info!(target: "request_client", cancelled, "Cancelled pending calls on close");
        }
        self.subscriber.close().await?;
        self.publisher.close().await?;
        Ok(())
    }
}

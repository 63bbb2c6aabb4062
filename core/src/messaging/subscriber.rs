use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::transport::{BrokerMessage, KeyExtractor, Transport};
use crate::readiness::Readiness;
use crate::Result;

/// Receives every keyed reply drained by the dispatch loop.
pub trait ReplyHandler: Send + Sync {
    /// Returns `Ok(true)` when the reply completed a pending call and
    /// `Ok(false)` when nothing was waiting for `key`. An error marks the
    /// message as malformed; the loop logs it and moves on.
    fn handle(&self, key: &str, value: &[u8]) -> Result<bool>;
}

/// Snapshot of the dispatch loop's counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub malformed: u64,
    pub keyless: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    matched: AtomicU64,
    unmatched: AtomicU64,
    malformed: AtomicU64,
    keyless: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            received: self.received.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            keyless: self.keyless.load(Ordering::Relaxed),
        }
    }
}

/// Owns the inbound reply channel and the single dispatch loop.
pub struct Subscriber {
    transport: Arc<dyn Transport>,
    reply_topic: String,
    extractor: Arc<dyn KeyExtractor>,
    readiness: Readiness,
    inbound: Mutex<Option<mpsc::Receiver<BrokerMessage>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl Subscriber {
    /// Creates a subscriber for `reply_topic` using the transport's own key extractor.
    pub fn new(transport: Arc<dyn Transport>, reply_topic: impl Into<String>) -> Self {
        let extractor = transport.key_extractor();
        Self {
            transport,
            reply_topic: reply_topic.into(),
            extractor,
            readiness: Readiness::new("subscriber"),
            inbound: Mutex::new(None),
            dispatch: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_key_extractor(mut self, extractor: Arc<dyn KeyExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Whether a reply keyed `key` can reach this subscriber.
    pub fn validate_key(&self, key: &str) -> Result<()> {
        self.transport.validate_key(key)
    }

    /// Connects and subscribes to the reply topic, once. Later calls wait for
    /// and return the first attempt's result without subscribing again.
    pub async fn start(&self) -> Result<()> {
        self.readiness
            .ensure(move || async move {
                self.transport.connect().await?;
                let rx = self.transport.subscribe(&self.reply_topic).await?;
                *self.inbound.lock().await = Some(rx);
                info!(target: "subscriber", topic = %self.reply_topic, "Subscribed to reply topic");
                Ok(())
            })
            .await
    }

    /// Starts the subscriber if needed and spawns the dispatch loop. Calling
    /// it again while the loop is running is a no-op.
    pub async fn run(&self, handler: Arc<dyn ReplyHandler>) -> Result<()> {
        self.start().await?;

        let Some(rx) = self.inbound.lock().await.take() else {
            debug!(target: "subscriber", "Dispatch loop already running");
            return Ok(());
        };

        let handle = tokio::spawn(dispatch_loop(
            rx,
            Arc::clone(&self.extractor),
            handler,
            Arc::clone(&self.counters),
        ));
        *self.dispatch.lock().await = Some(handle);
        info!(target: "subscriber", topic = %self.reply_topic, "Dispatch loop started");
        Ok(())
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Stops the dispatch loop and releases the connection.
    pub async fn close(&self) -> Result<()> {
        self.readiness.mark_closed();
        if let Some(handle) = self.dispatch.lock().await.take() {
            handle.abort();
        }
        self.inbound.lock().await.take();
        self.transport.close().await?;
        info!(target: "subscriber", topic = %self.reply_topic, "Subscriber closed");
        Ok(())
    }
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<BrokerMessage>,
    extractor: Arc<dyn KeyExtractor>,
    handler: Arc<dyn ReplyHandler>,
    counters: Arc<Counters>,
) {
    while let Some(message) = rx.recv().await {
        counters.received.fetch_add(1, Ordering::Relaxed);

        let Some(key) = extractor.extract(&message) else {
            counters.keyless.fetch_add(1, Ordering::Relaxed);
            debug!(target: "subscriber", topic = %message.topic, "Dropping reply without a key");
            continue;
        };

        match handler.handle(&key, &message.value) {
            Ok(true) => {
                counters.matched.fetch_add(1, Ordering::Relaxed);
                debug!(target: "subscriber", key = %key, "Reply matched");
            }
            Ok(false) => {
                counters.unmatched.fetch_add(1, Ordering::Relaxed);
                debug!(target: "subscriber", key = %key, "Dropping unmatched reply");
            }
            Err(e) => {
                counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(target: "subscriber", key = %key, error = %e, "Dropping malformed reply");
            }
        }
    }
    info!(target: "subscriber", "Reply stream ended");
}

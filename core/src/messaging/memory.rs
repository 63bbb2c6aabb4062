// In-process broker implementation
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::transport::{BrokerMessage, Transport};
use crate::{BusError, Result};

const DEFAULT_CAPACITY: usize = 1024;

/// Subscription information
#[derive(Debug, Clone)]
struct Subscription {
    id: u64,
    sender: mpsc::Sender<BrokerMessage>,
}

/// Per-topic statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub active_subscriptions: usize,
    pub dropped_messages: u64,
}

#[derive(Debug, Default)]
struct Faults {
    connect: Option<String>,
    publish: Option<String>,
}

/// Topic broker living inside the process.
///
/// Every subscriber of a topic receives every message published to it, in
/// publish order. Cloning shares the same broker, so a publisher, a subscriber
/// and a test worker can all be wired to one instance.
///
/// Faults can be injected for connect and publish to exercise the bridge's
/// failure paths without a real broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    // Topic -> Subscriber list
    subscriptions: Arc<DashMap<String, Vec<Subscription>>>,

    // Statistics
    stats: Arc<DashMap<String, TopicStats>>,

    faults: Arc<RwLock<Faults>>,
    connected: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a broker whose subscription queues hold up to `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            stats: Arc::new(DashMap::new()),
            faults: Arc::new(RwLock::new(Faults::default())),
            connected: Arc::new(AtomicBool::new(false)),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity: capacity.max(1),
        }
    }

    /// Makes every later `connect` fail with `reason`.
    pub async fn fail_connect(&self, reason: impl Into<String>) {
        self.faults.write().await.connect = Some(reason.into());
    }

    /// Makes every later `publish` fail with `reason`.
    pub async fn fail_publish(&self, reason: impl Into<String>) {
        self.faults.write().await.publish = Some(reason.into());
    }

    pub async fn clear_faults(&self) {
        *self.faults.write().await = Faults::default();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Live subscriptions on `topic`.
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.subscriptions
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.sender.is_closed()).count())
            .unwrap_or(0)
    }

    /// Get stats
    pub fn get_stats(&self, topic: &str) -> Option<TopicStats> {
        self.stats.get(topic).map(|s| s.clone())
    }

    // Update stats helper function
    fn update_stats<F>(&self, topic: &str, f: F)
    where
        F: FnOnce(&mut TopicStats),
    {
        let mut entry = self
            .stats
            .entry(topic.to_string())
            .or_insert_with(TopicStats::default);
        f(entry.value_mut());
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        if let Some(reason) = self.faults.read().await.connect.clone() {
            warn!(target: "memory_broker", reason = %reason, "Injected connect failure");
            return Err(BusError::Connect(reason));
        }
        self.connected.store(true, Ordering::SeqCst);
        info!(target: "memory_broker", "Memory broker connected");
        Ok(())
    }

    async fn publish(&self, message: BrokerMessage) -> Result<()> {
        let key = message.key.clone().unwrap_or_default();
        if let Some(reason) = self.faults.read().await.publish.clone() {
            return Err(BusError::Publish { key, reason });
        }
        if !self.is_connected() {
            return Err(BusError::Publish {
                key,
                reason: "broker not connected".into(),
            });
        }

        let topic = message.topic.clone();
        debug!(target: "memory_broker", topic = %topic, key = %key, "Publishing message");

        // Senders are cloned out so no map guard is held across an await.
        let senders: Vec<(u64, mpsc::Sender<BrokerMessage>)> = self
            .subscriptions
            .get(&topic)
            .map(|subs| subs.iter().map(|s| (s.id, s.sender.clone())).collect())
            .unwrap_or_default();

        if senders.is_empty() {
            debug!(target: "memory_broker", topic = %topic, "No subscriptions for topic");
        }

        let mut delivered = 0;
        let mut dropped = 0;
        let mut closed = Vec::new();
        for (id, sender) in senders {
            match sender.send(message.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => {
                    dropped += 1;
                    closed.push(id);
                }
            }
        }

        if !closed.is_empty() {
            if let Some(mut subs) = self.subscriptions.get_mut(&topic) {
                subs.retain(|s| !closed.contains(&s.id));
            }
        }
        let remaining = self.subscription_count(&topic);
        self.update_stats(&topic, |stats| {
            stats.total_published += 1;
            stats.total_delivered += delivered;
            stats.dropped_messages += dropped;
            stats.active_subscriptions = remaining;
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BrokerMessage>> {
        if !self.is_connected() {
            return Err(BusError::Connect("broker not connected".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.capacity);

        self.subscriptions
            .entry(topic.to_string())
            .or_insert_with(Vec::new)
            .push(Subscription { id, sender: tx });

        self.update_stats(topic, |stats| {
            stats.active_subscriptions += 1;
        });

        info!(target: "memory_broker", topic = %topic, subscription = id, "Created subscription");
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.subscriptions.clear();
        info!(target: "memory_broker", "Memory broker closed");
        Ok(())
    }
}

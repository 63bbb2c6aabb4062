//! In-process pipeline: a [`MemoryBroker`] plus an echo worker standing in for
//! the market workers, so the gateway can be exercised without a broker.

use std::sync::Arc;

use market_bus_core::{BridgeConfig, BrokerMessage, Envelope, MemoryBroker, Transport};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::response::ResponseDto;

const WORKER_SOURCE_ID: &str = "market-worker-local";

/// Fills whatever the environment leaves empty with in-process defaults.
pub fn local_config(mut config: BridgeConfig) -> BridgeConfig {
    if config.brokers.is_empty() {
        config.brokers = vec!["memory:0".into()];
    }
    if config.group_id.is_empty() {
        config.group_id = "market-rest-local".into();
    }
    if config.command_topic.is_empty() {
        config.command_topic = "market.commands".into();
    }
    if config.reply_topic.is_empty() {
        config.reply_topic = format!("market.replies.{}", config.client_id);
    }
    config
}

pub struct LocalPipeline {
    broker: MemoryBroker,
    worker: JoinHandle<()>,
}

impl LocalPipeline {
    /// Subscribes the echo worker to the command topic. Every command is
    /// answered with `ResponseDto::ok(payload)` on the reply topic under the
    /// command's key.
    pub async fn start(config: &BridgeConfig) -> market_bus_core::Result<Self> {
        let broker = MemoryBroker::with_capacity(config.dispatch_capacity);
        broker.connect().await?;
        let mut commands = broker.subscribe(&config.command_topic).await?;

        let reply_topic = config.reply_topic.clone();
        let worker_broker = broker.clone();
        let worker = tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                if let Err(e) = echo(&worker_broker, &reply_topic, command).await {
                    warn!(target: "local_worker", error = %e, "Echo failed");
                }
            }
            debug!(target: "local_worker", "Command stream ended");
        });

        info!(target: "local_worker", topic = %config.command_topic, "Local pipeline started");
        Ok(Self { broker, worker })
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.broker.clone())
    }
}

impl Drop for LocalPipeline {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn echo(
    broker: &MemoryBroker,
    reply_topic: &str,
    command: BrokerMessage,
) -> market_bus_core::Result<()> {
    let Some(key) = command.key else {
        warn!(target: "local_worker", topic = %command.topic, "Skipping command without a key");
        return Ok(());
    };
    let envelope: Envelope<Value> = Envelope::from_slice(&command.value)?;
    let uri = envelope.uri().to_string();
    let reply = Envelope::new(WORKER_SOURCE_ID, uri, ResponseDto::ok(envelope.into_payload()));

    broker
        .publish(BrokerMessage::new(reply_topic, Some(key), reply.to_bytes()?))
        .await
}

//! MQTT transport built on `rumqttc`.
//!
//! MQTT has no message key, so the correlation key rides as the last topic
//! segment: a message keyed `k` on topic `t` is published to `t/k`, and a
//! subscription to `t` listens on `t/+`. Inbound messages are keyed through
//! [`TopicSuffix`]. Keys therefore must be a single, non-wildcard topic level.
//!
//! Sessions are clean, so the broker forgets subscriptions when the
//! connection drops; the event loop re-sends them on every reconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::transport::{BrokerMessage, KeyExtractor, TopicSuffix, Transport};
use crate::{BridgeConfig, BusError, Result};

pub struct MqttTransport {
    options: MqttOptions,
    capacity: usize,
    client: Mutex<Option<AsyncClient>>,
    // base topic -> subscriber queue
    routes: Arc<DashMap<String, mpsc::Sender<BrokerMessage>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// `broker` is `host:port`; `client_id` must be unique per connection.
    pub fn new(broker: &str, client_id: &str, capacity: usize) -> Result<Self> {
        let (host, port) = broker
            .rsplit_once(':')
            .ok_or_else(|| BusError::Config(format!("broker address needs a port: {broker}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| BusError::Config(format!("invalid broker port: {broker}")))?;

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));

        Ok(Self {
            options,
            capacity: capacity.max(1),
            client: Mutex::new(None),
            routes: Arc::new(DashMap::new()),
            event_task: Mutex::new(None),
        })
    }

    /// Uses the first configured broker. `role` is appended to the client id
    /// so the publisher and subscriber connections do not evict each other.
    ///
    /// MQTT has no consumer groups: `group_id` is not used by this transport.
    pub fn from_config(config: &BridgeConfig, role: &str) -> Result<Self> {
        let broker = config
            .brokers
            .first()
            .ok_or_else(|| BusError::Config("no broker configured".into()))?;
        if config.brokers.len() > 1 {
            warn!(
                target: "mqtt",
                using = %broker,
                ignored = config.brokers.len() - 1,
                "MQTT connects to a single broker; extra addresses are ignored"
            );
        }
        Self::new(
            broker,
            &format!("{}-{role}", config.client_id),
            config.dispatch_capacity,
        )
    }

    async fn client(&self) -> Result<AsyncClient> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| BusError::Connect("MQTT client not connected".into()))
    }
}

fn subscription_filter(topic: &str) -> String {
    format!("{topic}/+")
}

/// Re-sends every live subscription after the broker dropped the session.
/// Non-blocking: this runs on the event loop that drains the request queue.
fn resubscribe(client: &AsyncClient, routes: &DashMap<String, mpsc::Sender<BrokerMessage>>) -> usize {
    let topics: Vec<String> = routes.iter().map(|r| r.key().clone()).collect();
    let mut sent = 0;
    for topic in topics {
        match client.try_subscribe(subscription_filter(&topic), QoS::AtLeastOnce) {
            Ok(()) => sent += 1,
            Err(e) => warn!(target: "mqtt", topic = %topic, error = %e, "Resubscribe failed"),
        }
    }
    sent
}

async fn route(routes: &DashMap<String, mpsc::Sender<BrokerMessage>>, topic: String, value: Vec<u8>) {
    let Some((base, _key)) = topic.rsplit_once('/') else {
        debug!(target: "mqtt", topic = %topic, "Ignoring message outside keyed topics");
        return;
    };
    let Some(sender) = routes.get(base).map(|s| s.clone()) else {
        debug!(target: "mqtt", topic = %topic, "No subscription for topic");
        return;
    };
    if sender.send(BrokerMessage::new(topic, None, value)).await.is_err() {
        routes.remove(base);
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<()> {
        let (client, mut event_loop) = AsyncClient::new(self.options.clone(), self.capacity);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let routes = Arc::clone(&self.routes);
        let loop_client = client.clone();

        let task = tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => match ready_tx.take() {
                        Some(tx) => {
                            let _ = tx.send(Ok(()));
                        }
                        None => {
                            let sent = resubscribe(&loop_client, &routes);
                            info!(target: "mqtt", subscriptions = sent, "Reconnected; subscriptions restored");
                        }
                    },
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        route(&routes, p.topic.clone(), p.payload.to_vec()).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Err(BusError::Connect(e.to_string())));
                            return;
                        }
                        warn!(target: "mqtt", error = %e, "MQTT poll error");
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                *self.client.lock().await = Some(client);
                *self.event_task.lock().await = Some(task);
                info!(target: "mqtt", "MQTT transport connected");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BusError::Connect("MQTT event loop stopped".into())),
        }
    }

    /// Acceptance means the message was queued on the client's event loop.
    async fn publish(&self, message: BrokerMessage) -> Result<()> {
        let key = message.key.clone().unwrap_or_default();
        let client = self.client().await.map_err(|e| BusError::Publish {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        let topic = match &message.key {
            Some(k) => format!("{}/{k}", message.topic),
            None => message.topic.clone(),
        };
        client
            .publish(topic, QoS::AtLeastOnce, false, message.value)
            .await
            .map_err(|e| BusError::Publish {
                key,
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BrokerMessage>> {
        let client = self.client().await?;
        let (tx, rx) = mpsc::channel(self.capacity);
        self.routes.insert(topic.to_string(), tx);
        client
            .subscribe(subscription_filter(topic), QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        info!(target: "mqtt", topic = %topic, "Subscribed");
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        if let Some(client) = self.client.lock().await.take() {
            if let Err(e) = client.disconnect().await {
                warn!(target: "mqtt", error = %e, "MQTT disconnect failed");
            }
        }
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
        }
        self.routes.clear();
        Ok(())
    }

    fn key_extractor(&self) -> Arc<dyn KeyExtractor> {
        Arc::new(TopicSuffix)
    }

    fn validate_key(&self, key: &str) -> Result<()> {
        let reason = if key.is_empty() {
            "key is empty"
        } else if key.contains('/') {
            "key would span several topic levels"
        } else if key.contains(['+', '#']) {
            "key contains an MQTT wildcard"
        } else {
            return Ok(());
        };
        Err(BusError::InvalidKey {
            key: key.to_string(),
            reason: reason.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_address_needs_a_port() {
        assert!(matches!(
            MqttTransport::new("localhost", "c", 8),
            Err(BusError::Config(_))
        ));
        assert!(MqttTransport::new("localhost:1883", "c", 8).is_ok());
    }

    #[test]
    fn keys_must_be_a_single_topic_level() {
        let transport = MqttTransport::new("localhost:1883", "c", 8).unwrap();
        assert!(transport.validate_key("3f2a-uuid").is_ok());
        for bad in ["", "acb/2024", "a+b", "k#"] {
            assert!(
                matches!(transport.validate_key(bad), Err(BusError::InvalidKey { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn from_config_uses_the_first_broker() {
        let config = BridgeConfig {
            brokers: vec!["mqtt-1:1883".into(), "mqtt-2:1883".into()],
            client_id: "market-rest".into(),
            ..BridgeConfig::default()
        };
        let transport = MqttTransport::from_config(&config, "sub").unwrap();
        assert_eq!(transport.options.broker_address(), ("mqtt-1".to_string(), 1883));
        assert_eq!(transport.options.client_id(), "market-rest-sub");
    }

    #[tokio::test]
    async fn reconnect_resubscribes_every_route() {
        let options = MqttOptions::new("c", "localhost", 1883);
        let (client, _event_loop) = AsyncClient::new(options, 8);
        let routes = DashMap::new();
        let (tx, _rx) = mpsc::channel(1);
        routes.insert("replies.a".to_string(), tx.clone());
        routes.insert("replies.b".to_string(), tx);

        assert_eq!(resubscribe(&client, &routes), 2);
        assert_eq!(subscription_filter("replies.a"), "replies.a/+");
    }

    #[tokio::test]
    async fn inbound_messages_are_routed_by_base_topic() {
        let routes = DashMap::new();
        let (tx, mut rx) = mpsc::channel(4);
        routes.insert("replies".to_string(), tx);

        route(&routes, "replies/k1".into(), b"{}".to_vec()).await;
        route(&routes, "other/k2".into(), b"{}".to_vec()).await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(TopicSuffix.extract(&msg).as_deref(), Some("k1"));
        assert!(rx.try_recv().is_err());
    }
}

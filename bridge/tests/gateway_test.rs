use std::sync::Arc;
use std::time::Duration;

use market_bus_bridge::local::{local_config, LocalPipeline};
use market_bus_bridge::{CommandGateway, CommandRoute, GatewayError};
use market_bus_core::{
    BridgeConfig, BrokerMessage, BusError, Envelope, MemoryBroker, RequestClient, SendOptions,
    Transport,
};
use serde_json::json;

fn config() -> BridgeConfig {
    local_config(BridgeConfig::default())
}

#[tokio::test]
async fn gateway_unwraps_worker_response() {
    let config = config();
    let pipeline = LocalPipeline::start(&config).await.unwrap();
    let client = Arc::new(RequestClient::with_transport(config, pipeline.transport()).unwrap());
    let gateway = CommandGateway::new(Arc::clone(&client));

    let dto = gateway
        .execute(CommandRoute::StockUpdateMatchPrice, json!({"stockId": "FPT", "price": 97.5}))
        .await
        .unwrap();

    assert!(dto.success);
    assert_eq!(dto.error_code, 0);
    assert_eq!(dto.data.unwrap()["stockId"], "FPT");
    assert_eq!(client.pending(), 0);
}

#[tokio::test]
async fn every_route_reaches_the_worker_under_its_uri() {
    let config = config();
    let pipeline = LocalPipeline::start(&config).await.unwrap();
    let mut observed = pipeline.broker().subscribe(&config.command_topic).await.unwrap();
    let client = Arc::new(RequestClient::with_transport(config, pipeline.transport()).unwrap());
    let gateway = CommandGateway::new(client);

    for route in CommandRoute::ALL {
        gateway.execute(route, json!({})).await.unwrap();
        let cmd = observed.recv().await.unwrap();
        let env: Envelope = Envelope::from_slice(&cmd.value).unwrap();
        assert_eq!(env.uri(), route.uri());
        assert_eq!(env.source_id(), "market-rest");
    }
}

#[tokio::test]
async fn null_reply_payload_is_missing_payload() {
    let config = config();
    let broker = MemoryBroker::new();
    broker.connect().await.unwrap();
    let mut commands = broker.subscribe(&config.command_topic).await.unwrap();

    let reply_topic = config.reply_topic.clone();
    let worker = broker.clone();
    tokio::spawn(async move {
        let cmd = commands.recv().await.unwrap();
        let body = Envelope::new("market-worker", "/user/delete", serde_json::Value::Null)
            .to_bytes()
            .unwrap();
        worker
            .publish(BrokerMessage::new(reply_topic, cmd.key, body))
            .await
            .unwrap();
    });

    let client = Arc::new(RequestClient::with_transport(config, Arc::new(broker)).unwrap());
    let err = CommandGateway::new(client)
        .execute(CommandRoute::UserDelete, json!({"username": "an"}))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::MissingPayload { ref uri } if uri == "/user/delete"));
    assert_eq!(err.status_code(), 502);
}

#[tokio::test]
async fn silent_worker_maps_to_gateway_timeout() {
    let config = config();
    let broker = MemoryBroker::new();
    let client = Arc::new(RequestClient::with_transport(config, Arc::new(broker)).unwrap());
    let gateway = CommandGateway::new(client)
        .with_options(SendOptions::new().timeout(Duration::from_millis(150)));

    let err = gateway
        .execute(CommandRoute::AhpConfigUpdate, json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Bus(BusError::Timeout { .. })));
    assert_eq!(err.status_code(), 504);
}

#[tokio::test]
async fn worker_failure_is_returned_not_raised() {
    let config = config();
    let broker = MemoryBroker::new();
    broker.connect().await.unwrap();
    let mut commands = broker.subscribe(&config.command_topic).await.unwrap();

    let reply_topic = config.reply_topic.clone();
    let worker = broker.clone();
    tokio::spawn(async move {
        let cmd = commands.recv().await.unwrap();
        let body = Envelope::new(
            "market-worker",
            "/subscription/create",
            json!({"success": false, "errorCode": 409, "errorMessage": "exists", "data": null}),
        )
        .to_bytes()
        .unwrap();
        worker
            .publish(BrokerMessage::new(reply_topic, cmd.key, body))
            .await
            .unwrap();
    });

    let client = Arc::new(RequestClient::with_transport(config, Arc::new(broker)).unwrap());
    let dto = CommandGateway::new(client)
        .execute(CommandRoute::SubscriptionCreate, json!({}))
        .await
        .unwrap();

    assert!(!dto.success);
    assert_eq!(dto.error_code, 409);
    assert_eq!(dto.error_message.as_deref(), Some("exists"));
}

#[tokio::test]
async fn keyless_command_is_skipped_by_the_local_worker() {
    let config = config();
    let pipeline = LocalPipeline::start(&config).await.unwrap();
    let mut replies = pipeline.broker().subscribe(&config.reply_topic).await.unwrap();

    let stray = Envelope::new("market-rest", "/stock/create", json!({})).to_bytes().unwrap();
    pipeline
        .broker()
        .publish(BrokerMessage::new(config.command_topic.clone(), None, stray))
        .await
        .unwrap();

    let client = Arc::new(RequestClient::with_transport(config, pipeline.transport()).unwrap());
    let dto = CommandGateway::new(Arc::clone(&client))
        .execute_with(
            CommandRoute::StockCreate,
            json!({"stockId": "VNM"}),
            SendOptions::new().key("vnm-1"),
        )
        .await
        .unwrap();

    assert!(dto.success);
    let first = tokio::time::timeout(Duration::from_secs(1), replies.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.key.as_deref(), Some("vnm-1"));
}

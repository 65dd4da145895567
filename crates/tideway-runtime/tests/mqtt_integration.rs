//! MQTT integration tests.
//!
//! These tests require a running MQTT broker.
//! Run with: cargo test -p tideway-runtime --test mqtt_integration -- --ignored
//!
//! The broker address can be configured via MQTT_SERVER (default
//! tcp://127.0.0.1:1883).

#![cfg(feature = "mqtt")]

use std::sync::Arc;
use std::time::Duration;

use tideway_core::{Tuple, Value};
use tideway_runtime::connector::{ClientKind, ConnectorConfig, ConnectorFactory};
use tideway_runtime::pubsub::Payload;
use tideway_runtime::{ClientRegistry, RuntimeConfig, StreamContext, TopicBroker};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn mqtt_server() -> String {
    std::env::var("MQTT_SERVER").unwrap_or_else(|_| "tcp://127.0.0.1:1883".to_string())
}

async fn mqtt_is_available() -> bool {
    let addr = mqtt_server()
        .trim_start_matches("tcp://")
        .trim_start_matches("mqtt://")
        .to_string();
    matches!(
        timeout(Duration::from_secs(2), tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

fn runtime_config() -> RuntimeConfig {
    let yaml = format!(
        "connections:\n  mqtt.test:\n    server: \"{}\"\n    qos: 1\n",
        mqtt_server()
    );
    RuntimeConfig::from_yaml(&yaml).expect("valid config")
}

fn factory() -> ConnectorFactory {
    ConnectorFactory::new(
        Arc::new(TopicBroker::new()),
        Arc::new(ClientRegistry::new(&runtime_config())),
        64,
    )
}

#[tokio::test]
#[ignore]
async fn test_mqtt_round_trip_over_shared_connection() {
    if !mqtt_is_available().await {
        eprintln!("Skipping test: MQTT broker not available at {}", mqtt_server());
        return;
    }
    let factory = factory();
    let topic = format!("tideway/test/{}", run_suffix());
    let config = ConnectorConfig::new("mqtt", "")
        .with_topic(&topic)
        .with_property("connectionSelector", "mqtt.test");

    let ctx = StreamContext::new("rule1", "src", 0);
    let mut source = factory.source("src", &config).expect("source");
    let (tx, mut rx) = mpsc::channel(8);
    source.start(&ctx, tx).await.expect("subscribe");

    let mut sink = factory.sink("sink", &config).expect("sink");
    sink.connect(&ctx).await.expect("connect");
    assert_eq!(factory.registry().client_count(), 1);

    // give the SUBSCRIBE a moment to reach the broker
    tokio::time::sleep(Duration::from_millis(300)).await;
    sink.collect(&ctx, &Tuple::new("t").with_field("temp", 21))
        .await
        .expect("publish");

    let payload = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("closed");
    match payload {
        Payload::Tuple(t) => assert_eq!(t.get("temp"), Some(&Value::Int(21))),
        other => panic!("unexpected payload {:?}", other),
    }

    source.stop(&ctx).await.expect("stop");
    sink.close(&ctx).await.expect("close");
    assert_eq!(factory.registry().client_count(), 0);
}

#[tokio::test]
#[ignore]
async fn test_mqtt_private_connection_not_registered() {
    if !mqtt_is_available().await {
        eprintln!("Skipping test: MQTT broker not available at {}", mqtt_server());
        return;
    }
    let registry = ClientRegistry::new(&RuntimeConfig::default());
    let mut props = tideway_runtime::connector::Params::default();
    props.insert("server".to_string(), mqtt_server());
    let client = registry
        .get_client(ClientKind::Mqtt, &props)
        .await
        .expect("connect");
    assert_eq!(registry.client_count(), 0);
    assert!(registry.release_client(&StreamContext::background(), &client).await);
}

fn run_suffix() -> String {
    format!("{}", std::process::id())
}

//! Rule source/sink connectors and shared external connections.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────> MemorySource ──> rule
//! TopicBroker ─────────┤
//!                      └<────────────── MemorySink <──── rule
//!
//! MQTT / EdgeX / WebSocket ──> ClientWrapper ──> SharedSource ──> rule
//!       (one per selector)    (ClientRegistry) <── SharedSink <── rule
//! ```
//!
//! # Available Connectors
//!
//! | Type | Feature Flag | Description |
//! |------|--------------|-------------|
//! | `memory` | default | In-process topics on the [`TopicBroker`](crate::pubsub::TopicBroker) |
//! | `mqtt` | `mqtt` | Shared MQTT connection |
//! | `edgex` | `mqtt` | EdgeX message bus over MQTT |
//! | `websocket` | default | Shared WebSocket client connection |
//!
//! # Example: sharing a connection
//!
//! ```rust,ignore
//! use tideway_runtime::connector::{ConnectorConfig, ConnectorFactory, SourceConnector};
//! use tideway_runtime::StreamContext;
//!
//! let config = ConnectorConfig::new("mqtt", "tcp://localhost:1883")
//!     .with_topic("sensors/#")
//!     .with_property("connectionSelector", "mqtt.local");
//!
//! // Both sources run over one MQTT connection.
//! let mut a = factory.source("a", &config)?;
//! let mut b = factory.source("b", &config)?;
//! a.start(&StreamContext::new("rule1", "src", 0), tx1).await?;
//! b.start(&StreamContext::new("rule2", "src", 0), tx2).await?;
//! ```

// Sub-modules
mod client;
mod edgex;
mod memory;
mod mqtt;
mod registry;
mod shared;
mod types;
mod websocket;

// Core types and traits
pub use types::{
    ConnectorConfig, ConnectorError, Params, SinkConnector, SourceConnector, CONNECTION_SELECTOR,
};

// Shared connections
pub use client::{ClientWrapper, MessageEnvelope, TopicChannel};
pub use edgex::{EdgexClientWrapper, EdgexEnvelope};
pub use mqtt::{MqttClientWrapper, MqttConfig};
pub use registry::{ClientDialer, ClientKind, ClientRegistry, NetworkDialer, SharedClient};
pub use websocket::{WebSocketClientWrapper, WebSocketConfig};

// Rule operators
pub use memory::{MemorySink, MemorySource};
pub use shared::{decode_message, SharedSink, SharedSource};

use crate::pubsub::TopicBroker;
use std::sync::Arc;

/// Builds rule operators from their configuration.
#[derive(Debug, Clone)]
pub struct ConnectorFactory {
    broker: Arc<TopicBroker>,
    registry: Arc<ClientRegistry>,
    buffer: usize,
}

impl ConnectorFactory {
    pub fn new(broker: Arc<TopicBroker>, registry: Arc<ClientRegistry>, buffer: usize) -> Self {
        Self {
            broker,
            registry,
            buffer,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn source(
        &self,
        name: &str,
        config: &ConnectorConfig,
    ) -> Result<Box<dyn SourceConnector>, ConnectorError> {
        match config.connector_type.as_str() {
            "memory" => Ok(Box::new(MemorySource::new(
                name,
                self.broker.clone(),
                config,
                self.buffer,
            )?)),
            _ => Ok(Box::new(SharedSource::new(
                name,
                self.registry.clone(),
                config,
                self.buffer,
            )?)),
        }
    }

    pub fn sink(
        &self,
        name: &str,
        config: &ConnectorConfig,
    ) -> Result<Box<dyn SinkConnector>, ConnectorError> {
        match config.connector_type.as_str() {
            "memory" => Ok(Box::new(MemorySink::new(name, self.broker.clone(), config)?)),
            _ => Ok(Box::new(SharedSink::new(name, self.registry.clone(), config)?)),
        }
    }
}

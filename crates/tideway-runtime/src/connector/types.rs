//! Core connector types, traits, and error definitions

use crate::context::StreamContext;
use crate::pubsub::Payload;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tideway_core::Tuple;
use tokio::sync::mpsc;

/// Per-operator connector properties (`topic`, `qos`, `connectionSelector`, ...).
pub type Params = IndexMap<String, String>;

/// Property naming a shared connection.
pub const CONNECTION_SELECTOR: &str = "connectionSelector";

/// Generic connector configuration.
///
/// # Example
///
/// ```rust
/// use tideway_runtime::connector::ConnectorConfig;
///
/// let config = ConnectorConfig::new("mqtt", "tcp://localhost:1883")
///     .with_topic("sensors/#")
///     .with_property("qos", "1")
///     .with_property("connectionSelector", "mqtt.local");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Connector type identifier (`"memory"`, `"mqtt"`, `"edgex"`, `"websocket"`)
    pub connector_type: String,
    /// Connection URL or address (format depends on connector type)
    pub url: String,
    /// Topic or pattern (optional, depends on connector)
    pub topic: Option<String>,
    /// Additional connector-specific properties
    pub properties: Params,
}

impl ConnectorConfig {
    pub fn new(connector_type: &str, url: &str) -> Self {
        Self {
            connector_type: connector_type.to_string(),
            url: url.to_string(),
            topic: None,
            properties: IndexMap::new(),
        }
    }

    pub fn with_topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_string());
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    /// Properties with `server`/`topic` filled from `url`/`topic` when unset.
    pub fn to_params(&self) -> Params {
        let mut params = self.properties.clone();
        if !self.url.is_empty() && !params.contains_key("server") {
            params.insert("server".to_string(), self.url.clone());
        }
        if let Some(topic) = &self.topic {
            params
                .entry("topic".to_string())
                .or_insert_with(|| topic.clone());
        }
        params
    }

    pub fn require_topic(&self) -> Result<&str, ConnectorError> {
        self.topic
            .as_deref()
            .or_else(|| self.properties.get("topic").map(String::as_str))
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ConnectorError::ConfigError("missing property topic".to_string()))
    }
}

/// Rule source operator.
///
/// The lifecycle driver calls [`start`](Self::start) when the rule starts and
/// [`stop`](Self::stop) when it stops or restarts. Payloads are forwarded to
/// `tx` until the context is cancelled or the source is stopped.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn name(&self) -> &str;

    async fn start(
        &mut self,
        ctx: &StreamContext,
        tx: mpsc::Sender<Payload>,
    ) -> Result<(), ConnectorError>;

    /// Release everything `start` acquired. Safe to call more than once.
    async fn stop(&mut self, ctx: &StreamContext) -> Result<(), ConnectorError>;

    fn is_running(&self) -> bool;
}

/// Rule sink operator.
#[async_trait]
pub trait SinkConnector: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&mut self, ctx: &StreamContext) -> Result<(), ConnectorError>;

    async fn collect(&self, ctx: &StreamContext, tuple: &Tuple) -> Result<(), ConnectorError>;

    /// Release everything `connect` acquired. Safe to call more than once.
    async fn close(&mut self, ctx: &StreamContext) -> Result<(), ConnectorError>;
}

/// Errors that can occur during connector operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not connected")]
    NotConnected,

    /// May require enabling a feature flag (e.g. `mqtt`).
    #[error("Connector not available: {0}")]
    NotAvailable(String),

    #[error("{0} already subscribed on this connection")]
    AlreadySubscribed(String),
}

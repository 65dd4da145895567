//! EdgeX message bus connection.
//!
//! EdgeX services exchange JSON envelopes over an MQTT message bus. The
//! wrapper shares one MQTT session exactly like [`MqttClientWrapper`] and adds
//! the envelope: publishes are wrapped, received envelopes are unwrapped before
//! fan-out. An envelope that fails to decode is reported to the topic's
//! consumers once; the next good message logs the recovery.

use super::client::{ClientWrapper, MessageEnvelope, TopicChannel};
use super::mqtt::{open, MqttClientWrapper, MqttConfig, MqttHandler};
use super::types::{ConnectorError, Params};
use crate::config::MqttDefaults;
use crate::context::StreamContext;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

const API_VERSION: &str = "v3";

/// Wire format of an EdgeX message bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgexEnvelope {
    #[serde(default)]
    pub api_version: String,
    #[serde(rename = "correlationID", default)]
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub received_topic: String,
    #[serde(default)]
    pub error_code: u8,
    /// Base64 encoded body
    pub payload: String,
    #[serde(default)]
    pub content_type: String,
}

impl EdgexEnvelope {
    pub fn new(payload: &[u8], content_type: &str) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            received_topic: String::new(),
            error_code: 0,
            payload: STANDARD.encode(payload),
            content_type: content_type.to_string(),
        }
    }

    pub fn decode_payload(&self) -> Result<Bytes, ConnectorError> {
        STANDARD
            .decode(&self.payload)
            .map(Bytes::from)
            .map_err(|e| ConnectorError::ReceiveFailed(format!("invalid envelope payload: {}", e)))
    }
}

/// Map EdgeX message bus properties (`protocol`, `server`, `port`, `type`,
/// `optional.*`) onto an MQTT configuration.
fn mqtt_config(params: &Params, defaults: &MqttDefaults) -> Result<MqttConfig, ConnectorError> {
    let bus = params.get("type").map(String::as_str).unwrap_or("mqtt");
    if bus != "mqtt" {
        return Err(ConnectorError::NotAvailable(format!(
            "edgex message bus type {}, supported: mqtt",
            bus
        )));
    }
    let protocol = params.get("protocol").map(String::as_str).unwrap_or("tcp");
    let host = params.get("server").map(String::as_str).unwrap_or("localhost");
    let port = params.get("port").map(String::as_str).unwrap_or("1883");

    let mut mqtt = Params::new();
    mqtt.insert("server".to_string(), format!("{}://{}:{}", protocol, host, port));
    for (key, target) in [
        ("optional.ClientId", "clientid"),
        ("optional.Username", "username"),
        ("optional.Password", "password"),
        ("optional.Qos", "qos"),
    ] {
        if let Some(v) = params.get(key) {
            mqtt.insert(target.to_string(), v.clone());
        }
    }
    MqttConfig::from_params(&mqtt, defaults)
}

/// Shared EdgeX message bus connection wrapper.
pub struct EdgexClientWrapper {
    mqtt: MqttClientWrapper,
}

impl EdgexClientWrapper {
    pub async fn connect(params: &Params, defaults: &MqttDefaults) -> Result<Arc<Self>, ConnectorError> {
        let config = mqtt_config(params, defaults)?;
        let server = config.server();
        let qos = config.qos;
        open(&config, |transport, token| {
            Arc::new(Self {
                mqtt: MqttClientWrapper::new(server, transport, qos, token),
            })
        })
        .await
    }

    #[cfg(test)]
    pub(crate) fn from_mqtt(mqtt: MqttClientWrapper) -> Self {
        Self { mqtt }
    }

    pub fn server(&self) -> &str {
        self.mqtt.server()
    }

    pub fn is_closed(&self) -> bool {
        self.mqtt.is_closed()
    }
}

impl MqttHandler for EdgexClientWrapper {
    fn on_message(&self, topic: &str, payload: Bytes) {
        let decoded = serde_json::from_slice::<EdgexEnvelope>(&payload)
            .map_err(|e| ConnectorError::ReceiveFailed(format!("invalid edgex envelope: {}", e)))
            .and_then(|env| env.decode_payload());
        match decoded {
            Ok(body) => {
                self.mqtt.deliver(&MessageEnvelope::new(topic, body));
            }
            Err(e) => {
                debug!("Edgex message on {} rejected: {}", topic, e);
                self.mqtt.report_error(topic, &e);
            }
        }
    }

    fn on_connect(&self) {
        self.mqtt.on_connect();
    }

    fn on_connection_lost(&self, err: ConnectorError) {
        self.mqtt.on_connection_lost(err);
    }
}

#[async_trait]
impl ClientWrapper for EdgexClientWrapper {
    fn subscribe(
        &self,
        ctx: &StreamContext,
        topics: Vec<TopicChannel>,
        errors: mpsc::Sender<ConnectorError>,
        params: &Params,
    ) -> Result<(), ConnectorError> {
        self.mqtt.subscribe(ctx, topics, errors, params)
    }

    async fn publish(
        &self,
        ctx: &StreamContext,
        topic: &str,
        payload: Bytes,
        params: &Params,
    ) -> Result<(), ConnectorError> {
        let content_type = params
            .get("contentType")
            .map(String::as_str)
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        let envelope = EdgexEnvelope::new(&payload, content_type);
        let body = serde_json::to_vec(&envelope)
            .map_err(|e| ConnectorError::SendFailed(format!("encode envelope: {}", e)))?;
        self.mqtt.publish(ctx, topic, Bytes::from(body), params).await
    }

    fn unsubscribe(&self, ctx: &StreamContext) {
        self.mqtt.unsubscribe(ctx);
    }

    fn add_ref(&self) {
        self.mqtt.add_ref();
    }

    fn release_ref(&self) -> bool {
        self.mqtt.release_ref()
    }

    fn ref_count(&self) -> usize {
        self.mqtt.ref_count()
    }

    async fn disconnect(&self) {
        self.mqtt.disconnect().await;
    }

    fn set_connection_selector(&self, selector: &str) {
        self.mqtt.set_connection_selector(selector);
    }

    fn connection_selector(&self) -> String {
        self.mqtt.connection_selector()
    }
}

#[cfg(test)]
mod tests {
    use super::super::mqtt::mock::MockTransport;
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn wrapper(mock: &MockTransport) -> EdgexClientWrapper {
        EdgexClientWrapper::from_mqtt(MqttClientWrapper::new(
            "mock:1883".to_string(),
            Box::new(mock.clone()),
            0,
            CancellationToken::new(),
        ))
    }

    fn envelope(body: &[u8]) -> Bytes {
        Bytes::from(serde_json::to_vec(&EdgexEnvelope::new(body, DEFAULT_CONTENT_TYPE)).unwrap())
    }

    #[test]
    fn test_envelope_wire_names() {
        let env = EdgexEnvelope::new(b"{\"a\":1}", DEFAULT_CONTENT_TYPE);
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("correlationID").is_some());
        assert_eq!(json["contentType"], "application/json");
        assert_eq!(json["apiVersion"], "v3");
        assert_eq!(env.decode_payload().unwrap(), Bytes::from_static(b"{\"a\":1}"));
    }

    #[test]
    fn test_bus_config() {
        let mut params = Params::new();
        params.insert("server".into(), "edgex-mqtt".into());
        params.insert("port".into(), "1884".into());
        params.insert("optional.ClientId".into(), "rules".into());
        let config = mqtt_config(&params, &MqttDefaults::default()).unwrap();
        assert_eq!(config.server(), "edgex-mqtt:1884");
        assert_eq!(config.client_id.as_deref(), Some("rules"));

        params.insert("type".into(), "redis".into());
        assert!(matches!(
            mqtt_config(&params, &MqttDefaults::default()),
            Err(ConnectorError::NotAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_received_envelope_unwrapped() {
        let mock = MockTransport::default();
        let w = wrapper(&mock);
        let (etx, _erx) = mpsc::channel(4);
        let (tx, mut rx) = mpsc::channel(4);
        let ctx = StreamContext::new("r", "o", 0);
        w.subscribe(&ctx, vec![TopicChannel::new("edgex/events/#", tx)], etx, &Params::new())
            .unwrap();

        w.on_message("edgex/events/device/1", envelope(b"{\"t\":20}"));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "edgex/events/device/1");
        assert_eq!(msg.payload, Bytes::from_static(b"{\"t\":20}"));
    }

    #[tokio::test]
    async fn test_bad_envelopes_reported_once_until_recovered() {
        let mock = MockTransport::default();
        let w = wrapper(&mock);
        let (etx, mut erx) = mpsc::channel(4);
        let (tx, mut rx) = mpsc::channel(4);
        let ctx = StreamContext::new("r", "o", 0);
        w.subscribe(&ctx, vec![TopicChannel::new("t", tx)], etx, &Params::new())
            .unwrap();

        w.on_message("t", Bytes::from_static(b"garbage"));
        w.on_message("t", Bytes::from_static(b"garbage"));
        assert!(erx.try_recv().is_ok());
        assert!(erx.try_recv().is_err());

        w.on_message("t", envelope(b"ok"));
        assert!(rx.try_recv().is_ok());

        w.on_message("t", Bytes::from_static(b"garbage"));
        assert!(erx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_publish_wraps_envelope() {
        let mock = MockTransport::default();
        let w = wrapper(&mock);
        let mut params = Params::new();
        params.insert("contentType".into(), "application/cbor".into());
        w.publish(&StreamContext::background(), "out", Bytes::from_static(b"x"), &params)
            .await
            .unwrap();

        let call = mock.calls().pop().unwrap();
        let json = call.strip_prefix("pub out 0 false ").unwrap();
        let env: EdgexEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.content_type, "application/cbor");
        assert_eq!(env.decode_payload().unwrap(), Bytes::from_static(b"x"));
    }
}

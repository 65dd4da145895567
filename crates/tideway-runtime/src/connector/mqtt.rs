//! Shared MQTT connection.
//!
//! [`MqttClientWrapper`] owns one rumqttc client per broker connection and
//! multiplexes every rule operator subscribed through it. The event loop runs
//! on its own task; on each ConnAck the wrapper re-subscribes every topic it
//! still has consumers for, so consumers survive broker restarts.
//!
//! When the `mqtt` feature is disabled, connecting returns
//! `ConnectorError::NotAvailable`.

use super::client::{ClientWrapper, MessageEnvelope, RefCount, Subscriptions, TopicChannel};
use super::types::{ConnectorError, Params};
use crate::config::MqttDefaults;
use crate::context::StreamContext;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// =============================================================================
// MQTT Configuration (always available, not feature-gated)
// =============================================================================

/// MQTT connection configuration
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub tls: bool,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: u8,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub channel_capacity: usize,
}

impl MqttConfig {
    pub fn new(broker: &str) -> Self {
        let defaults = MqttDefaults::default();
        Self {
            broker: broker.to_string(),
            port: 1883,
            tls: false,
            client_id: None,
            username: None,
            password: None,
            qos: 0,
            keep_alive: defaults.keep_alive(),
            connect_timeout: defaults.connect_timeout(),
            channel_capacity: defaults.channel_capacity,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos.min(2);
        self
    }

    pub fn with_defaults(mut self, defaults: &MqttDefaults) -> Self {
        self.keep_alive = defaults.keep_alive();
        self.connect_timeout = defaults.connect_timeout();
        self.channel_capacity = defaults.channel_capacity;
        self
    }

    /// Build from connection properties: `server` (`tcp://host:port`,
    /// `ssl://host:port` or `host:port`), `clientid`, `username`, `password`,
    /// `qos`.
    pub fn from_params(params: &Params, defaults: &MqttDefaults) -> Result<Self, ConnectorError> {
        let server = params
            .get("server")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConnectorError::ConfigError("missing property server".to_string()))?;
        let (tls, rest) = match server.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => (false, rest),
            Some(("ssl" | "tls" | "mqtts", rest)) => (true, rest),
            Some((scheme, _)) => {
                return Err(ConnectorError::ConfigError(format!(
                    "unsupported mqtt scheme {}",
                    scheme
                )))
            }
            None => (false, server.as_str()),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    ConnectorError::ConfigError(format!("invalid port in {}: {}", server, e))
                })?;
                (host, port)
            }
            None => (rest, if tls { 8883 } else { 1883 }),
        };
        if host.is_empty() {
            return Err(ConnectorError::ConfigError(format!(
                "invalid server {}",
                server
            )));
        }

        let mut config = MqttConfig::new(host).with_port(port).with_defaults(defaults);
        config.tls = tls;
        if let Some(id) = params
            .get("clientid")
            .or_else(|| params.get("clientId"))
            .filter(|s| !s.is_empty())
        {
            config = config.with_client_id(id);
        }
        if let Some(user) = params.get("username") {
            let pass = params.get("password").map(String::as_str).unwrap_or("");
            config = config.with_credentials(user, pass);
        }
        if let Some(qos) = params.get("qos") {
            config = config.with_qos(parse_qos(qos)?);
        }
        Ok(config)
    }

    pub fn server(&self) -> String {
        format!("{}:{}", self.broker, self.port)
    }
}

pub(crate) fn parse_qos(value: &str) -> Result<u8, ConnectorError> {
    match value.trim().parse::<u8>() {
        Ok(q) if q <= 2 => Ok(q),
        _ => Err(ConnectorError::ConfigError(format!(
            "invalid qos {}, expected 0, 1 or 2",
            value
        ))),
    }
}

pub(crate) fn parse_bool(value: &str) -> Result<bool, ConnectorError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        other => Err(ConnectorError::ConfigError(format!(
            "invalid boolean {}",
            other
        ))),
    }
}

// =============================================================================
// Transport seam
// =============================================================================

/// Client side of an MQTT session.
#[async_trait]
pub(crate) trait MqttTransport: Send + Sync {
    fn subscribe(&self, topic: &str, qos: u8) -> Result<(), ConnectorError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), ConnectorError>;

    async fn publish(
        &self,
        topic: &str,
        qos: u8,
        retained: bool,
        payload: Bytes,
    ) -> Result<(), ConnectorError>;

    async fn disconnect(&self) -> Result<(), ConnectorError>;
}

/// Callbacks from the event loop.
pub(crate) trait MqttHandler: Send + Sync {
    fn on_message(&self, topic: &str, payload: Bytes);

    /// Called on every ConnAck after the initial one.
    fn on_connect(&self);

    /// Called once per run of consecutive poll errors.
    fn on_connection_lost(&self, err: ConnectorError);
}

#[cfg(feature = "mqtt")]
mod session {
    use super::*;
    use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
    use std::sync::Weak;

    fn qos_from_u8(qos: u8) -> QoS {
        match qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    #[async_trait]
    impl MqttTransport for AsyncClient {
        fn subscribe(&self, topic: &str, qos: u8) -> Result<(), ConnectorError> {
            self.try_subscribe(topic, qos_from_u8(qos))
                .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))
        }

        fn unsubscribe(&self, topic: &str) -> Result<(), ConnectorError> {
            self.try_unsubscribe(topic)
                .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))
        }

        async fn publish(
            &self,
            topic: &str,
            qos: u8,
            retained: bool,
            payload: Bytes,
        ) -> Result<(), ConnectorError> {
            AsyncClient::publish(self, topic, qos_from_u8(qos), retained, payload.to_vec())
                .await
                .map_err(|e| ConnectorError::SendFailed(e.to_string()))
        }

        async fn disconnect(&self) -> Result<(), ConnectorError> {
            AsyncClient::disconnect(self)
                .await
                .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))
        }
    }

    /// Connect, wait for the broker's ConnAck, then hand the event loop to a
    /// task delivering to the handler `build` returns.
    pub(crate) async fn open<H, F>(config: &MqttConfig, build: F) -> Result<Arc<H>, ConnectorError>
    where
        H: MqttHandler + 'static,
        F: FnOnce(Box<dyn MqttTransport>, CancellationToken) -> Arc<H>,
    {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("tideway-{}", uuid::Uuid::new_v4().simple()));

        let mut mqtt_opts = MqttOptions::new(&client_id, &config.broker, config.port);
        mqtt_opts.set_keep_alive(config.keep_alive);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqtt_opts.set_credentials(user, pass);
        }
        if config.tls {
            mqtt_opts.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, config.channel_capacity);

        let connack = tokio::time::timeout(config.connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(e),
                }
            }
        })
        .await;
        match connack {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(ConnectorError::ConnectionFailed(format!(
                    "{}: {}",
                    config.server(),
                    e
                )))
            }
            Err(_) => {
                return Err(ConnectorError::ConnectionFailed(format!(
                    "{}: connect timed out after {:?}",
                    config.server(),
                    config.connect_timeout
                )))
            }
        }
        info!(
            "The connection to mqtt broker {} client id {} established",
            config.server(),
            client_id
        );

        let token = CancellationToken::new();
        let handler = build(Box::new(client), token.clone());
        let weak: Weak<dyn MqttHandler> = Arc::downgrade(&handler) as Weak<dyn MqttHandler>;
        let name = config.server();

        tokio::spawn(async move {
            let mut consecutive_errors: u32 = 0;
            const MAX_BACKOFF_SECS: u64 = 30;

            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        consecutive_errors = 0;
                        let Some(handler) = weak.upgrade() else { break };
                        handler.on_message(&publish.topic, publish.payload);
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        consecutive_errors = 0;
                        info!("The connection to mqtt broker {} re-established", name);
                        let Some(handler) = weak.upgrade() else { break };
                        handler.on_connect();
                    }
                    Ok(_) => {
                        consecutive_errors = 0;
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        if consecutive_errors == 1 {
                            error!("Mqtt connection {} lost: {}", name, e);
                            let Some(handler) = weak.upgrade() else { break };
                            handler.on_connection_lost(ConnectorError::ReceiveFailed(
                                e.to_string(),
                            ));
                        }
                        let backoff_secs =
                            (1u64 << (consecutive_errors - 1).min(5)).min(MAX_BACKOFF_SECS);
                        warn!(
                            "Mqtt connection {} error ({}): {:?}, retrying in {}s",
                            name, consecutive_errors, e, backoff_secs
                        );
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                        }
                    }
                }
            }
            info!("Mqtt connection {} eventloop stopped", name);
        });

        Ok(handler)
    }
}

#[cfg(feature = "mqtt")]
pub(crate) use session::open;

#[cfg(not(feature = "mqtt"))]
pub(crate) async fn open<H, F>(_config: &MqttConfig, _build: F) -> Result<Arc<H>, ConnectorError>
where
    H: MqttHandler + 'static,
    F: FnOnce(Box<dyn MqttTransport>, CancellationToken) -> Arc<H>,
{
    Err(ConnectorError::NotAvailable(
        "MQTT requires 'mqtt' feature".to_string(),
    ))
}

// =============================================================================
// Wrapper
// =============================================================================

/// Shared MQTT connection wrapper.
pub struct MqttClientWrapper {
    server: String,
    transport: Box<dyn MqttTransport>,
    default_qos: u8,
    subs: Subscriptions,
    topic_qos: RwLock<FxHashMap<String, u8>>,
    refs: RefCount,
    selector: RwLock<String>,
    token: CancellationToken,
    closed: AtomicBool,
}

impl MqttClientWrapper {
    /// Connect to the broker named by `params`.
    pub async fn connect(params: &Params, defaults: &MqttDefaults) -> Result<Arc<Self>, ConnectorError> {
        let config = MqttConfig::from_params(params, defaults)?;
        let server = config.server();
        let qos = config.qos;
        open(&config, |transport, token| {
            Arc::new(Self::new(server, transport, qos, token))
        })
        .await
    }

    pub(crate) fn new(
        server: String,
        transport: Box<dyn MqttTransport>,
        default_qos: u8,
        token: CancellationToken,
    ) -> Self {
        Self {
            refs: RefCount::new(format!("mqtt {}", server)),
            server,
            transport,
            default_qos,
            subs: Subscriptions::default(),
            topic_qos: RwLock::new(FxHashMap::default()),
            selector: RwLock::new(String::new()),
            token,
            closed: AtomicBool::new(false),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subs.topics()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fan a decoded message out to its consumers.
    pub(crate) fn deliver(&self, msg: &MessageEnvelope) -> usize {
        self.subs.dispatch(msg)
    }

    /// Report a per-topic failure once per error episode.
    pub(crate) fn report_error(&self, topic: &str, err: &ConnectorError) -> usize {
        self.subs.broadcast_error(Some(topic), err)
    }

    /// Unsubscribe topics no consumer is left on.
    fn drop_topics<'a>(&self, topics: impl Iterator<Item = &'a String>) {
        let mut topic_qos = self.topic_qos.write().unwrap_or_else(|e| e.into_inner());
        for topic in topics {
            topic_qos.remove(topic);
            if let Err(e) = self.transport.unsubscribe(topic) {
                warn!("Unsubscribe {} on {} failed: {}", topic, self.server, e);
            }
        }
    }

    fn qos_param(&self, params: &Params) -> Result<u8, ConnectorError> {
        params
            .get("qos")
            .map(|q| parse_qos(q))
            .transpose()
            .map(|q| q.unwrap_or(self.default_qos))
    }
}

impl MqttHandler for MqttClientWrapper {
    fn on_message(&self, topic: &str, payload: Bytes) {
        self.deliver(&MessageEnvelope::new(topic, payload));
    }

    fn on_connect(&self) {
        let topic_qos = self.topic_qos.read().unwrap_or_else(|e| e.into_inner());
        for topic in self.subs.topics() {
            let qos = topic_qos.get(&topic).copied().unwrap_or(self.default_qos);
            if let Err(e) = self.transport.subscribe(&topic, qos) {
                error!("Resubscribe {} on {} failed: {}", topic, self.server, e);
                self.subs.broadcast_error(Some(&topic), &e);
            }
        }
        self.subs.clear_errors();
    }

    fn on_connection_lost(&self, err: ConnectorError) {
        self.subs.broadcast_error(None, &err);
    }
}

#[async_trait]
impl ClientWrapper for MqttClientWrapper {
    fn subscribe(
        &self,
        ctx: &StreamContext,
        topics: Vec<TopicChannel>,
        errors: mpsc::Sender<ConnectorError>,
        params: &Params,
    ) -> Result<(), ConnectorError> {
        if self.is_closed() {
            return Err(ConnectorError::NotConnected);
        }
        let qos = self.qos_param(params)?;
        let sub_id = ctx.subscription_id();
        let fresh = self.subs.add(&sub_id, topics, errors, true)?;

        for (i, topic) in fresh.iter().enumerate() {
            if let Err(e) = self.transport.subscribe(topic, qos) {
                let emptied = self.subs.remove(&sub_id);
                self.drop_topics(fresh[..i].iter().filter(|t| emptied.contains(t)));
                return Err(e);
            }
            self.topic_qos
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(topic.clone(), qos);
            info!("New subscription for topic {} on {}, reqId is {}", topic, self.server, sub_id);
        }
        Ok(())
    }

    async fn publish(
        &self,
        _ctx: &StreamContext,
        topic: &str,
        payload: Bytes,
        params: &Params,
    ) -> Result<(), ConnectorError> {
        if self.is_closed() {
            return Err(ConnectorError::NotConnected);
        }
        let qos = self.qos_param(params)?;
        let retained = params
            .get("retained")
            .map(|r| parse_bool(r))
            .transpose()?
            .unwrap_or(false);
        self.transport.publish(topic, qos, retained, payload).await
    }

    fn unsubscribe(&self, ctx: &StreamContext) {
        let sub_id = ctx.subscription_id();
        let emptied = self.subs.remove(&sub_id);
        self.drop_topics(emptied.iter());
        for topic in &emptied {
            info!("Unsubscribed topic {} on {} for reqId {}", topic, self.server, sub_id);
        }
    }

    fn add_ref(&self) {
        self.refs.add();
    }

    fn release_ref(&self) -> bool {
        self.refs.release()
    }

    fn ref_count(&self) -> usize {
        self.refs.get()
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        if let Err(e) = self.transport.disconnect().await {
            warn!("Mqtt disconnect from {} failed: {}", self.server, e);
        }
        info!("Mqtt client wrapper for {} disconnected", self.server);
    }

    fn set_connection_selector(&self, selector: &str) {
        *self.selector.write().unwrap_or_else(|e| e.into_inner()) = selector.to_string();
    }

    fn connection_selector(&self) -> String {
        self.selector.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Records every call as a string such as `sub a/b 1`.
    #[derive(Default, Clone)]
    pub(crate) struct MockTransport {
        pub calls: Arc<Mutex<Vec<String>>>,
        failing: Arc<Mutex<Vec<String>>>,
    }

    impl MockTransport {
        /// Make every later subscribe to `topic` fail.
        pub(crate) fn fail_subscribe(&self, topic: &str) {
            self.failing.lock().unwrap().push(topic.to_string());
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn count(&self, prefix: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl MqttTransport for MockTransport {
        fn subscribe(&self, topic: &str, qos: u8) -> Result<(), ConnectorError> {
            if self.failing.lock().unwrap().iter().any(|t| t == topic) {
                return Err(ConnectorError::ConnectionFailed(format!(
                    "subscribe {} refused",
                    topic
                )));
            }
            self.record(format!("sub {} {}", topic, qos));
            Ok(())
        }

        fn unsubscribe(&self, topic: &str) -> Result<(), ConnectorError> {
            self.record(format!("unsub {}", topic));
            Ok(())
        }

        async fn publish(
            &self,
            topic: &str,
            qos: u8,
            retained: bool,
            payload: Bytes,
        ) -> Result<(), ConnectorError> {
            self.record(format!(
                "pub {} {} {} {}",
                topic,
                qos,
                retained,
                String::from_utf8_lossy(&payload)
            ));
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ConnectorError> {
            self.record("disconnect".to_string());
            Ok(())
        }
    }

    pub(crate) fn wrapper(mock: &MockTransport) -> Arc<MqttClientWrapper> {
        Arc::new(MqttClientWrapper::new(
            "mock:1883".to_string(),
            Box::new(mock.clone()),
            0,
            CancellationToken::new(),
        ))
    }
}

//! Shared connection registry
//!
//! Operators that name a `connectionSelector` share one physical connection
//! per selector. [`ClientRegistry::get_client`] returns the stored wrapper with
//! an extra reference, or connects a new one and stores it;
//! [`ClientRegistry::release_client`] drops the caller's consumers and
//! reference and evicts the wrapper when it was the last one, so the next
//! `get_client` connects afresh. Without a selector every call gets a private
//! connection. New connections come from a [`ClientDialer`], the network one
//! unless the registry is built with [`ClientRegistry::with_dialer`].

use super::client::{ClientWrapper, TopicChannel};
use super::edgex::EdgexClientWrapper;
use super::mqtt::MqttClientWrapper;
use super::types::{ConnectorError, Params, CONNECTION_SELECTOR};
use super::websocket::WebSocketClientWrapper;
use crate::config::{MqttDefaults, RuntimeConfig, WebSocketDefaults};
use crate::context::StreamContext;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Protocol of a shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
    Mqtt,
    Edgex,
    WebSocket,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::Mqtt => "mqtt",
            ClientKind::Edgex => "edgex",
            ClientKind::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientKind {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mqtt" => Ok(ClientKind::Mqtt),
            "edgex" => Ok(ClientKind::Edgex),
            "websocket" | "ws" => Ok(ClientKind::WebSocket),
            other => Err(ConnectorError::NotAvailable(format!(
                "No shared connection for type '{}'. Supported: mqtt, edgex, websocket",
                other
            ))),
        }
    }
}

/// A connection wrapper of any supported protocol.
#[derive(Clone)]
pub enum SharedClient {
    Mqtt(Arc<MqttClientWrapper>),
    Edgex(Arc<EdgexClientWrapper>),
    WebSocket(Arc<WebSocketClientWrapper>),
}

impl SharedClient {
    pub fn kind(&self) -> ClientKind {
        match self {
            SharedClient::Mqtt(_) => ClientKind::Mqtt,
            SharedClient::Edgex(_) => ClientKind::Edgex,
            SharedClient::WebSocket(_) => ClientKind::WebSocket,
        }
    }

    /// True once the physical connection can no longer be used.
    pub fn is_closed(&self) -> bool {
        match self {
            SharedClient::Mqtt(c) => c.is_closed(),
            SharedClient::Edgex(c) => c.is_closed(),
            SharedClient::WebSocket(c) => c.is_finished(),
        }
    }

    pub fn ptr_eq(&self, other: &SharedClient) -> bool {
        match (self, other) {
            (SharedClient::Mqtt(a), SharedClient::Mqtt(b)) => Arc::ptr_eq(a, b),
            (SharedClient::Edgex(a), SharedClient::Edgex(b)) => Arc::ptr_eq(a, b),
            (SharedClient::WebSocket(a), SharedClient::WebSocket(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn inner(&self) -> &dyn ClientWrapper {
        match self {
            SharedClient::Mqtt(c) => c.as_ref(),
            SharedClient::Edgex(c) => c.as_ref(),
            SharedClient::WebSocket(c) => c.as_ref(),
        }
    }
}

impl fmt::Debug for SharedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedClient")
            .field("kind", &self.kind())
            .field("selector", &self.connection_selector())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

#[async_trait]
impl ClientWrapper for SharedClient {
    fn subscribe(
        &self,
        ctx: &StreamContext,
        topics: Vec<TopicChannel>,
        errors: mpsc::Sender<ConnectorError>,
        params: &Params,
    ) -> Result<(), ConnectorError> {
        self.inner().subscribe(ctx, topics, errors, params)
    }

    async fn publish(
        &self,
        ctx: &StreamContext,
        topic: &str,
        payload: Bytes,
        params: &Params,
    ) -> Result<(), ConnectorError> {
        self.inner().publish(ctx, topic, payload, params).await
    }

    fn unsubscribe(&self, ctx: &StreamContext) {
        self.inner().unsubscribe(ctx);
    }

    fn add_ref(&self) {
        self.inner().add_ref();
    }

    fn release_ref(&self) -> bool {
        self.inner().release_ref()
    }

    fn ref_count(&self) -> usize {
        self.inner().ref_count()
    }

    async fn disconnect(&self) {
        self.inner().disconnect().await;
    }

    fn set_connection_selector(&self, selector: &str) {
        self.inner().set_connection_selector(selector);
    }

    fn connection_selector(&self) -> String {
        self.inner().connection_selector()
    }

    async fn release(&self, ctx: &StreamContext) -> bool {
        self.inner().release(ctx).await
    }
}

/// Opens the physical connection behind a wrapper.
#[async_trait]
pub trait ClientDialer: Send + Sync {
    async fn dial(&self, kind: ClientKind, props: &Params) -> Result<SharedClient, ConnectorError>;
}

/// Dials real brokers and servers with the configured protocol defaults.
pub struct NetworkDialer {
    mqtt: MqttDefaults,
    websocket: WebSocketDefaults,
}

impl NetworkDialer {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            mqtt: config.mqtt.clone(),
            websocket: config.websocket.clone(),
        }
    }
}

#[async_trait]
impl ClientDialer for NetworkDialer {
    async fn dial(&self, kind: ClientKind, props: &Params) -> Result<SharedClient, ConnectorError> {
        Ok(match kind {
            ClientKind::Mqtt => SharedClient::Mqtt(MqttClientWrapper::connect(props, &self.mqtt).await?),
            ClientKind::Edgex => {
                SharedClient::Edgex(EdgexClientWrapper::connect(props, &self.mqtt).await?)
            }
            ClientKind::WebSocket => SharedClient::WebSocket(
                WebSocketClientWrapper::connect(props, &self.websocket).await?,
            ),
        })
    }
}

/// Store of shared connections keyed by connection selector.
pub struct ClientRegistry {
    connections: FxHashMap<String, Params>,
    dialer: Arc<dyn ClientDialer>,
    clients: Mutex<FxHashMap<String, SharedClient>>,
}

impl ClientRegistry {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self::with_dialer(config, Arc::new(NetworkDialer::new(config)))
    }

    /// Registry whose new connections come from `dialer`.
    pub fn with_dialer(config: &RuntimeConfig, dialer: Arc<dyn ClientDialer>) -> Self {
        let connections = config
            .connections
            .keys()
            .filter_map(|name| config.connection_props(name).map(|p| (name.clone(), p)))
            .collect();
        Self {
            connections,
            dialer,
            clients: Mutex::new(FxHashMap::default()),
        }
    }

    /// Shared wrapper for `props[connectionSelector]`, or a private one when
    /// no selector is given. Properties of the named connection in the
    /// configuration apply unless `props` overrides them.
    pub async fn get_client(
        &self,
        kind: ClientKind,
        props: &Params,
    ) -> Result<SharedClient, ConnectorError> {
        let selector = props
            .get(CONNECTION_SELECTOR)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let Some(selector) = selector else {
            return self.dialer.dial(kind, props).await;
        };

        if let Some(existing) = self.lookup(kind, &selector)? {
            return Ok(existing);
        }

        let mut merged = self.connections.get(&selector).cloned().unwrap_or_default();
        for (k, v) in props {
            if k != CONNECTION_SELECTOR {
                merged.insert(k.clone(), v.clone());
            }
        }
        let client = self.dialer.dial(kind, &merged).await?;
        client.set_connection_selector(&selector);

        // Another caller may have connected the same selector meanwhile.
        let raced = {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            match clients.get(&selector) {
                Some(existing) if !existing.is_closed() => {
                    if existing.kind() != kind {
                        Some(Err(kind_mismatch(&selector, existing.kind(), kind)))
                    } else {
                        existing.add_ref();
                        Some(Ok(existing.clone()))
                    }
                }
                _ => {
                    clients.insert(selector.clone(), client.clone());
                    None
                }
            }
        };
        match raced {
            Some(existing) => {
                client.disconnect().await;
                existing
            }
            None => {
                info!("Shared {} connection {} created", kind, selector);
                Ok(client)
            }
        }
    }

    fn lookup(&self, kind: ClientKind, selector: &str) -> Result<Option<SharedClient>, ConnectorError> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        match clients.get(selector) {
            Some(existing) if existing.is_closed() => {
                warn!("Shared connection {} is closed, reconnecting", selector);
                clients.remove(selector);
                Ok(None)
            }
            Some(existing) if existing.kind() != kind => Err(kind_mismatch(selector, existing.kind(), kind)),
            Some(existing) => {
                existing.add_ref();
                Ok(Some(existing.clone()))
            }
            None => Ok(None),
        }
    }

    /// Drop `ctx`'s consumers and one reference. On the last reference the
    /// wrapper leaves the store and its connection is closed. Returns true iff
    /// this call closed it.
    pub async fn release_client(&self, ctx: &StreamContext, client: &SharedClient) -> bool {
        client.unsubscribe(ctx);
        let selector = client.connection_selector();
        let last = {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            let last = client.release_ref();
            if last && clients.get(&selector).is_some_and(|c| c.ptr_eq(client)) {
                clients.remove(&selector);
                info!("Shared {} connection {} removed", client.kind(), selector);
            }
            last
        };
        if last {
            client.disconnect().await;
        }
        last
    }

    pub fn get(&self, selector: &str) -> Option<SharedClient> {
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.get(selector).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Store an already connected wrapper under `selector`.
    #[cfg(test)]
    pub(crate) fn adopt(&self, selector: &str, client: SharedClient) {
        client.set_connection_selector(selector);
        self.clients
            .lock()
            .unwrap()
            .insert(selector.to_string(), client);
    }
}

fn kind_mismatch(selector: &str, stored: ClientKind, requested: ClientKind) -> ConnectorError {
    ConnectorError::ConfigError(format!(
        "connection {} is a {} connection, not {}",
        selector, stored, requested
    ))
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.client_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::mqtt::mock::{wrapper, MockTransport};
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    /// Hands out mock-backed wrappers. MQTT dials can be held until released.
    #[derive(Default)]
    struct MockDialer {
        mqtt: MockTransport,
        edgex: MockTransport,
        dials: AtomicUsize,
        hold: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    #[async_trait]
    impl ClientDialer for MockDialer {
        async fn dial(&self, kind: ClientKind, _props: &Params) -> Result<SharedClient, ConnectorError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            match kind {
                ClientKind::Mqtt => {
                    if let Some((entered, release)) = &self.hold {
                        entered.notify_one();
                        release.notified().await;
                    }
                    Ok(SharedClient::Mqtt(wrapper(&self.mqtt)))
                }
                ClientKind::Edgex => Ok(SharedClient::Edgex(Arc::new(
                    EdgexClientWrapper::from_mqtt(MqttClientWrapper::new(
                        "mock:1883".to_string(),
                        Box::new(self.edgex.clone()),
                        0,
                        CancellationToken::new(),
                    )),
                ))),
                ClientKind::WebSocket => Err(ConnectorError::NotAvailable("websocket".into())),
            }
        }
    }

    fn selector(name: &str) -> Params {
        let mut p = Params::new();
        p.insert(CONNECTION_SELECTOR.into(), name.into());
        p
    }

    fn registry_with(name: &str, mock: &MockTransport) -> ClientRegistry {
        let registry = ClientRegistry::new(&RuntimeConfig::default());
        registry.adopt(name, SharedClient::Mqtt(wrapper(mock)));
        registry
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("MQTT".parse::<ClientKind>().unwrap(), ClientKind::Mqtt);
        assert_eq!("ws".parse::<ClientKind>().unwrap(), ClientKind::WebSocket);
        assert!(matches!(
            "kafka".parse::<ClientKind>(),
            Err(ConnectorError::NotAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_selector_shares_one_connection() {
        let mock = MockTransport::default();
        let registry = registry_with("mqtt.local", &mock);

        let a = registry.get_client(ClientKind::Mqtt, &selector("mqtt.local")).await.unwrap();
        let b = registry.get_client(ClientKind::Mqtt, &selector("mqtt.local")).await.unwrap();
        assert!(a.ptr_eq(&b));
        // adopted reference plus two sharers
        assert_eq!(a.ref_count(), 3);
        assert_eq!(a.connection_selector(), "mqtt.local");
    }

    #[tokio::test]
    async fn test_kind_mismatch_rejected() {
        let mock = MockTransport::default();
        let registry = registry_with("shared", &mock);
        let err = registry
            .get_client(ClientKind::WebSocket, &selector("shared"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::ConfigError(_)));
        assert_eq!(registry.get("shared").unwrap().ref_count(), 1);
    }

    #[tokio::test]
    async fn test_last_release_evicts_and_disconnects_once() {
        let mock = MockTransport::default();
        let registry = registry_with("c", &mock);
        let client = registry.get_client(ClientKind::Mqtt, &selector("c")).await.unwrap();

        let (etx, _erx) = mpsc::channel(4);
        let (tx, _rx) = mpsc::channel(4);
        let r1 = StreamContext::new("r1", "src", 0);
        client
            .subscribe(&r1, vec![TopicChannel::new("a/b", tx)], etx, &Params::new())
            .unwrap();

        assert!(!registry.release_client(&r1, &client).await);
        assert_eq!(mock.count("unsub a/b"), 1);
        assert_eq!(registry.client_count(), 1);

        let r2 = StreamContext::new("r2", "src", 0);
        assert!(registry.release_client(&r2, &client).await);
        assert_eq!(registry.client_count(), 0);
        assert_eq!(mock.count("disconnect"), 1);

        // over-release is clamped and never disconnects twice
        assert!(!registry.release_client(&r2, &client).await);
        assert_eq!(mock.count("disconnect"), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_not_shared() {
        let mock = MockTransport::default();
        let registry = registry_with("c", &mock);
        let stale = registry.get("c").unwrap();
        stale.disconnect().await;

        // nothing listens on port 1, so the reconnect attempt fails
        let mut props = selector("c");
        props.insert("server".into(), "tcp://127.0.0.1:1".into());
        assert!(registry.get_client(ClientKind::Mqtt, &props).await.is_err());
        assert_eq!(registry.client_count(), 0);
    }

    // ==========================================================================
    // Connection creation
    // ==========================================================================

    #[tokio::test]
    async fn test_two_gets_share_one_dial() {
        let dialer = Arc::new(MockDialer::default());
        let registry = ClientRegistry::with_dialer(&RuntimeConfig::default(), dialer.clone());

        let a = registry.get_client(ClientKind::Mqtt, &selector("m")).await.unwrap();
        let b = registry.get_client(ClientKind::Mqtt, &selector("m")).await.unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(a.ref_count(), 2);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);

        let r1 = StreamContext::new("r1", "src", 0);
        let r2 = StreamContext::new("r2", "src", 0);
        assert!(!registry.release_client(&r1, &a).await);
        assert!(registry.get("m").is_some());
        assert!(registry.release_client(&r2, &b).await);
        assert!(registry.get("m").is_none());
        assert_eq!(dialer.mqtt.count("disconnect"), 1);

        // the next get connects afresh
        let c = registry.get_client(ClientKind::Mqtt, &selector("m")).await.unwrap();
        assert!(!c.ptr_eq(&a));
        assert_eq!(c.ref_count(), 1);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_selector_is_private() {
        let dialer = Arc::new(MockDialer::default());
        let registry = ClientRegistry::with_dialer(&RuntimeConfig::default(), dialer.clone());
        let a = registry.get_client(ClientKind::Mqtt, &Params::new()).await.unwrap();
        let b = registry.get_client(ClientKind::Mqtt, &Params::new()).await.unwrap();
        assert!(!a.ptr_eq(&b));
        assert_eq!(registry.client_count(), 0);
    }

    #[tokio::test]
    async fn test_racing_dial_of_other_kind_rejected() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let dialer = Arc::new(MockDialer {
            hold: Some((entered.clone(), release.clone())),
            ..Default::default()
        });
        let registry = Arc::new(ClientRegistry::with_dialer(
            &RuntimeConfig::default(),
            dialer.clone(),
        ));

        let slow = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_client(ClientKind::Mqtt, &selector("s")).await })
        };
        entered.notified().await;

        let edgex = registry.get_client(ClientKind::Edgex, &selector("s")).await.unwrap();
        release.notify_one();

        let err = slow.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectorError::ConfigError(_)));
        // the losing connection is closed, the stored one is untouched
        assert_eq!(dialer.mqtt.count("disconnect"), 1);
        let stored = registry.get("s").unwrap();
        assert!(stored.ptr_eq(&edgex));
        assert_eq!(stored.kind(), ClientKind::Edgex);
        assert_eq!(stored.ref_count(), 1);
    }
}

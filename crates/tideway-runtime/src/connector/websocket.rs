//! Shared WebSocket client connection.
//!
//! One connection is dialled per wrapper. Every text frame received is
//! delivered to every subscribed consumer, whatever topic it subscribed
//! under. When the connection closes the reader retries `max_conn_retry`
//! times; after that the wrapper is finished, consumers receive the error and
//! publishes fail with `NotConnected`.

use super::client::{ClientWrapper, MessageEnvelope, RefCount, Subscriptions, TopicChannel};
use super::types::{ConnectorError, Params};
use crate::config::WebSocketDefaults;
use crate::context::StreamContext;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// WebSocket client connection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    pub url: String,
    pub path: String,
    pub max_conn_retry: u32,
}

impl WebSocketConfig {
    /// Build from connection properties: `addr` (`host:port` or a full
    /// `ws://`/`wss://` URL), `path` (default `/`) and `maxConnRetry`.
    pub fn from_params(params: &Params, defaults: &WebSocketDefaults) -> Result<Self, ConnectorError> {
        let addr = params
            .get("addr")
            .or_else(|| params.get("server"))
            .filter(|a| !a.is_empty())
            .ok_or_else(|| ConnectorError::ConfigError("missing property addr".to_string()))?;
        let mut path = params
            .get("path")
            .cloned()
            .unwrap_or_else(|| "/".to_string());
        if !path.starts_with('/') {
            path.insert(0, '/');
        }

        let url = if addr.starts_with("ws://") || addr.starts_with("wss://") {
            let base = addr.trim_end_matches('/');
            if path == "/" {
                base.to_string()
            } else {
                format!("{}{}", base, path)
            }
        } else if addr.contains("://") {
            return Err(ConnectorError::ConfigError(format!(
                "unsupported websocket address {}",
                addr
            )));
        } else {
            format!("ws://{}{}", addr, path)
        };

        let max_conn_retry = match params.get("maxConnRetry") {
            Some(v) => v.trim().parse::<u32>().map_err(|e| {
                ConnectorError::ConfigError(format!("invalid maxConnRetry {}: {}", v, e))
            })?,
            None => defaults.max_conn_retry,
        };

        Ok(Self {
            url,
            path,
            max_conn_retry,
        })
    }
}

async fn dial(url: &str) -> Result<(WsWriter, WsReader), ConnectorError> {
    let (stream, _response) = connect_async(url)
        .await
        .map_err(|e| ConnectorError::ConnectionFailed(format!("{}: {}", url, e)))?;
    Ok(stream.split())
}

/// Shared WebSocket client connection wrapper.
pub struct WebSocketClientWrapper {
    config: WebSocketConfig,
    writer: Mutex<Option<WsWriter>>,
    subs: Subscriptions,
    refs: RefCount,
    selector: RwLock<String>,
    /// Set once the connection is gone for good
    finished: AtomicBool,
    closed: AtomicBool,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl WebSocketClientWrapper {
    pub async fn connect(
        params: &Params,
        defaults: &WebSocketDefaults,
    ) -> Result<Arc<Self>, ConnectorError> {
        let config = WebSocketConfig::from_params(params, defaults)?;
        let (writer, reader) = dial(&config.url).await?;
        info!("Websocket client connected to {}", config.url);

        let wrapper = Arc::new(Self {
            refs: RefCount::new(format!("websocket {}", config.url)),
            config,
            writer: Mutex::new(Some(writer)),
            subs: Subscriptions::default(),
            selector: RwLock::new(String::new()),
            finished: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        wrapper.tracker.spawn(Self::process(
            Arc::downgrade(&wrapper),
            reader,
            wrapper.token.clone(),
        ));
        Ok(wrapper)
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    async fn process(weak: Weak<Self>, mut reader: WsReader, token: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = reader.next() => next,
            };
            let Some(this) = weak.upgrade() else { break };
            let cause = match next {
                Some(Ok(Message::Text(text))) => {
                    let msg = MessageEnvelope::new(this.config.path.clone(), Bytes::from(text));
                    this.subs.dispatch_all(&msg);
                    continue;
                }
                Some(Ok(Message::Close(frame))) => format!("closed by peer: {:?}", frame),
                Some(Ok(_)) => continue,
                Some(Err(e)) => e.to_string(),
                None => "connection closed".to_string(),
            };
            if token.is_cancelled() {
                break;
            }

            info!("Websocket client {} closed ({}), try to reconnect", this.config.url, cause);
            match this.reconnect(&token).await {
                Some(r) => reader = r,
                None => {
                    if token.is_cancelled() {
                        break;
                    }
                    this.finished.store(true, Ordering::SeqCst);
                    this.writer.lock().await.take();
                    warn!("Websocket client {} reconnect failed, giving up", this.config.url);
                    this.subs.broadcast_error(
                        None,
                        &ConnectorError::ConnectionFailed(format!(
                            "websocket {} {}",
                            this.config.url, cause
                        )),
                    );
                    break;
                }
            }
        }
        debug!("Websocket client reader stopped");
    }

    async fn reconnect(&self, token: &CancellationToken) -> Option<WsReader> {
        for attempt in 1..=self.config.max_conn_retry {
            let dialled = tokio::select! {
                _ = token.cancelled() => return None,
                dialled = dial(&self.config.url) => dialled,
            };
            match dialled {
                Ok((writer, reader)) => {
                    if let Some(mut old) = self.writer.lock().await.replace(writer) {
                        let _ = old.close().await;
                    }
                    info!("Websocket client {} reconnect success", self.config.url);
                    return Some(reader);
                }
                Err(e) => {
                    info!(
                        "Websocket client {} reconnect failed, retry: {}, err: {}",
                        self.config.url, attempt, e
                    );
                    if attempt < self.config.max_conn_retry {
                        tokio::time::sleep(RETRY_INTERVAL).await;
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl ClientWrapper for WebSocketClientWrapper {
    fn subscribe(
        &self,
        ctx: &StreamContext,
        topics: Vec<TopicChannel>,
        errors: mpsc::Sender<ConnectorError>,
        _params: &Params,
    ) -> Result<(), ConnectorError> {
        if self.is_finished() || self.closed.load(Ordering::SeqCst) {
            return Err(ConnectorError::NotConnected);
        }
        self.subs.add(&ctx.subscription_id(), topics, errors, false)?;
        Ok(())
    }

    async fn publish(
        &self,
        _ctx: &StreamContext,
        _topic: &str,
        payload: Bytes,
        _params: &Params,
    ) -> Result<(), ConnectorError> {
        if self.is_finished() {
            return Err(ConnectorError::NotConnected);
        }
        let frame = match String::from_utf8(payload.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(ConnectorError::NotConnected)?;
        sink.send(frame)
            .await
            .map_err(|e| ConnectorError::SendFailed(e.to_string()))
    }

    fn unsubscribe(&self, ctx: &StreamContext) {
        self.subs.remove(&ctx.subscription_id());
    }

    fn add_ref(&self) {
        self.refs.add();
    }

    /// A finished connection has nothing left to share, so any release
    /// closes it.
    fn release_ref(&self) -> bool {
        let last = self.refs.release();
        last || self.is_finished()
    }

    fn ref_count(&self) -> usize {
        self.refs.get()
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.finished.store(true, Ordering::SeqCst);
        self.token.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.close().await {
                debug!("Websocket client {} close: {}", self.config.url, e);
            }
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!("Websocket client {} disconnected", self.config.url);
    }

    fn set_connection_selector(&self, selector: &str) {
        *self.selector.write().unwrap_or_else(|e| e.into_inner()) = selector.to_string();
    }

    fn connection_selector(&self) -> String {
        self.selector.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

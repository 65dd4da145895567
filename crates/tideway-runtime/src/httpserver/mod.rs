//! Process-wide HTTP data server.
//!
//! [`GlobalServerManager`] owns one warp server shared by every rule that
//! exposes an endpoint:
//!
//! - push endpoints republish request bodies on `$$httppush/<path>$$<method>`
//! - WebSocket endpoints publish received frames on
//!   `$$websocket//server/recv/<path>` and write everything produced on
//!   `$$websocket//server/send/<path>` to each connection
//! - SSE endpoints stream everything produced on `$$sse/<path>`
//!
//! Routes live in a table consulted on every request, so endpoints come and go
//! without restarting the server. The listener is bound on the first
//! registration and shut down gracefully when the last endpoint is removed.
//! Unregistering a WebSocket or SSE endpoint cancels its connections and waits
//! for their tasks before returning.

mod sse;
mod websocket;

use crate::config::{HttpServerConfig, TlsConfig};
use crate::context::StreamContext;
use crate::pubsub::{BrokerError, TopicBroker};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tideway_core::Tuple;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use warp::filters::path::FullPath;
use warp::filters::BoxedFilter;
use warp::http::{Method, StatusCode};
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

pub const PUSH_TOPIC_PREFIX: &str = "$$httppush/";
pub const WEBSOCKET_TOPIC_PREFIX: &str = "$$websocket/";
pub const SSE_TOPIC_PREFIX: &str = "$$sse/";

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECTION_BUFFER: usize = 1024;
/// Largest request body a push endpoint accepts.
pub const PUSH_BODY_LIMIT: u64 = 1024 * 1024;

pub fn push_topic(path: &str, method: &Method) -> String {
    format!("{}{}$${}", PUSH_TOPIC_PREFIX, path, method)
}

pub fn websocket_recv_topic(path: &str) -> String {
    format!("{}/server/recv/{}", WEBSOCKET_TOPIC_PREFIX, path)
}

pub fn websocket_send_topic(path: &str) -> String {
    format!("{}/server/send/{}", WEBSOCKET_TOPIC_PREFIX, path)
}

pub fn sse_topic(path: &str) -> String {
    format!("{}{}", SSE_TOPIC_PREFIX, path)
}

/// HTTP server error types
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid endpoint: {0}")]
    Config(String),

    #[error("Failed to start http server on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

struct PushEndpoint {
    topic: String,
    count: usize,
}

/// WebSocket or SSE endpoint with its live connections.
struct StreamEndpoint {
    ctx: StreamContext,
    count: usize,
    conns: FxHashMap<u64, CancellationToken>,
    tracker: TaskTracker,
}

impl StreamEndpoint {
    fn new(ctx: &StreamContext) -> Self {
        Self {
            ctx: ctx.clone(),
            count: 1,
            conns: FxHashMap::default(),
            tracker: TaskTracker::new(),
        }
    }

    /// Cancel every connection and stop accepting new tasks.
    fn close(&mut self) -> TaskTracker {
        for (_, token) in self.conns.drain() {
            token.cancel();
        }
        self.tracker.close();
        self.tracker.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    WebSocket,
    Sse,
}

struct RunningServer {
    addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    push: FxHashMap<(String, Method), PushEndpoint>,
    websocket: FxHashMap<String, StreamEndpoint>,
    sse: FxHashMap<String, StreamEndpoint>,
    server: Option<RunningServer>,
    /// A stopped server is still releasing its listener.
    draining: bool,
    /// Endpoints registered while draining; bind once the drain finishes.
    restart: bool,
    next_conn: u64,
}

impl State {
    fn is_empty(&self) -> bool {
        self.push.is_empty() && self.websocket.is_empty() && self.sse.is_empty()
    }

    fn streams(&mut self, kind: StreamKind) -> &mut FxHashMap<String, StreamEndpoint> {
        match kind {
            StreamKind::WebSocket => &mut self.websocket,
            StreamKind::Sse => &mut self.sse,
        }
    }
}

/// A live WebSocket or SSE connection. Holding it keeps the endpoint's
/// unregistration waiting.
pub(crate) struct Connection {
    pub id: u64,
    pub ctx: StreamContext,
    _task: TaskTrackerToken,
}

pub(crate) struct Inner {
    broker: Arc<TopicBroker>,
    config: HttpServerConfig,
    ctx: StreamContext,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn broker(&self) -> &Arc<TopicBroker> {
        &self.broker
    }

    /// Track a new connection on `path`. `None` when the endpoint is gone.
    pub(crate) fn open_connection(&self, kind: StreamKind, path: &str) -> Option<Connection> {
        let mut state = self.lock();
        state.next_conn += 1;
        let id = state.next_conn;
        let endpoint = state.streams(kind).get_mut(path)?;
        let ctx = endpoint.ctx.with_cancel();
        endpoint.conns.insert(id, ctx.token().clone());
        info!("{:?} endpoint {} opened connection {}", kind, path, id);
        Some(Connection {
            id,
            ctx,
            _task: endpoint.tracker.token(),
        })
    }

    pub(crate) fn close_connection(&self, kind: StreamKind, path: &str, id: u64) {
        let mut state = self.lock();
        if let Some(token) = state
            .streams(kind)
            .get_mut(path)
            .and_then(|e| e.conns.remove(&id))
        {
            token.cancel();
            info!("{:?} endpoint {} removed connection {}", kind, path, id);
        }
    }

    fn push_topic_for(&self, path: &str, method: &Method) -> Option<String> {
        let state = self.lock();
        state
            .push
            .get(&(path.to_string(), method.clone()))
            .map(|e| e.topic.clone())
    }

    fn has_stream(&self, kind: StreamKind, path: &str) -> bool {
        self.lock().streams(kind).contains_key(path)
    }

    fn handle_push(&self, path: &str, method: &Method, body: Bytes) -> Response {
        let Some(topic) = self.push_topic_for(path, method) else {
            return warp::reply::with_status("not found", StatusCode::NOT_FOUND).into_response();
        };
        debug!("Receive http request {} {}", method, path);
        match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(serde_json::Value::Array(items)) if items.iter().all(|i| i.is_object()) => {
                let list = items
                    .iter()
                    .filter_map(|i| Tuple::from_json_object(topic.as_str(), i))
                    .collect();
                self.broker.produce_list(&self.ctx, &topic, list);
            }
            Ok(json) if json.is_object() => {
                if let Some(t) = Tuple::from_json_object(topic.as_str(), &json) {
                    self.broker.produce(&self.ctx, &topic, t);
                }
            }
            Ok(_) => {
                let message = "Fail to decode data: expected a JSON object or array of objects";
                self.broker.produce_error(&self.ctx, &topic, message);
                return warp::reply::with_status(message.to_string(), StatusCode::BAD_REQUEST)
                    .into_response();
            }
            Err(e) => {
                let message = format!("Fail to decode data: {}", e);
                self.broker.produce_error(&self.ctx, &topic, &message);
                return warp::reply::with_status(message, StatusCode::BAD_REQUEST).into_response();
            }
        }
        warp::reply::with_status("ok", StatusCode::OK).into_response()
    }
}

fn routes(inner: Arc<Inner>) -> BoxedFilter<(Response,)> {
    let with_inner = warp::any().map(move || inner.clone());

    let ws = warp::path::full()
        .and(warp::ws())
        .and(with_inner.clone())
        .and_then(|path: FullPath, ws: warp::ws::Ws, inner: Arc<Inner>| async move {
            let path = path.as_str().to_string();
            if !inner.has_stream(StreamKind::WebSocket, &path) {
                return Err(warp::reject::not_found());
            }
            Ok::<_, Rejection>(
                ws.on_upgrade(move |socket| websocket::serve(inner, path, socket))
                    .into_response(),
            )
        });

    let sse = warp::get()
        .and(warp::path::full())
        .and(with_inner.clone())
        .and_then(|path: FullPath, inner: Arc<Inner>| async move {
            sse::serve(inner, path.as_str())
        });

    let push = warp::method()
        .and(warp::path::full())
        .and(warp::body::content_length_limit(PUSH_BODY_LIMIT))
        .and(warp::body::bytes())
        .and(with_inner)
        .map(|method: Method, path: FullPath, body: Bytes, inner: Arc<Inner>| {
            inner.handle_push(path.as_str(), &method, body)
        });

    ws.or(sse).unify().or(push).unify().boxed()
}

fn with_cors(routes: BoxedFilter<(Response,)>) -> BoxedFilter<(Response,)> {
    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec![
            "Accept",
            "Accept-Language",
            "Content-Type",
            "Content-Language",
            "Origin",
            "Authorization",
        ])
        .allow_methods(vec!["POST", "GET", "PUT", "DELETE", "HEAD"]);
    routes.with(cors).map(|r| Reply::into_response(r)).boxed()
}

fn check_tls(tls: &TlsConfig) -> Result<(), ServerError> {
    for file in [&tls.certfile, &tls.keyfile] {
        std::fs::metadata(file).map_err(|e| {
            ServerError::Config(format!("tls file {}: {}", file.display(), e))
        })?;
    }
    Ok(())
}

/// Bind and spawn the server. Must be called inside the tokio runtime.
fn start(inner: &Arc<Inner>) -> Result<RunningServer, ServerError> {
    let config = &inner.config;
    let addr = config
        .socket_addr()
        .map_err(|e| ServerError::Config(e.to_string()))?;
    let mut filter = routes(inner.clone());
    if config.cors {
        filter = with_cors(filter);
    }
    let token = CancellationToken::new();
    let signal = {
        let token = token.clone();
        async move { token.cancelled().await }
    };

    let (bound, task) = match &config.tls {
        None => {
            let (bound, server) = warp::serve(filter)
                .try_bind_with_graceful_shutdown(addr, signal)
                .map_err(|e| ServerError::Bind {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })?;
            (bound, tokio::spawn(server))
        }
        Some(tls) => {
            check_tls(tls)?;
            // The TLS server cannot report a bind failure, probe the port first.
            std::net::TcpListener::bind(addr).map_err(|e| ServerError::Bind {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
            let (bound, server) = warp::serve(filter)
                .tls()
                .cert_path(&tls.certfile)
                .key_path(&tls.keyfile)
                .bind_with_graceful_shutdown(addr, signal);
            (bound, tokio::spawn(server))
        }
    };
    info!(
        "Serving http data server on {}://{}",
        if config.tls.is_some() { "https" } else { "http" },
        bound
    );
    Ok(RunningServer {
        addr: bound,
        token,
        task,
    })
}

async fn stop(server: RunningServer) {
    info!("Shutting down http data server on {}", server.addr);
    server.token.cancel();
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, server.task).await {
        Ok(Ok(())) => info!("Http data server exiting"),
        Ok(Err(e)) => error!("Http data server task failed: {}", e),
        Err(_) => warn!("Http data server did not stop within {:?}", SHUTDOWN_TIMEOUT),
    }
}

fn normalize(path: &str) -> Result<String, ServerError> {
    let path = path.trim();
    if path.is_empty() {
        return Err(ServerError::Config("endpoint path must not be empty".to_string()));
    }
    if path.contains(char::is_whitespace) {
        return Err(ServerError::Config(format!("endpoint path {} contains spaces", path)));
    }
    Ok(if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    })
}

fn parse_method(method: &str) -> Result<Method, ServerError> {
    let upper = method.trim().to_ascii_uppercase();
    match upper.as_str() {
        "GET" | "POST" | "PUT" | "DELETE" | "HEAD" | "PATCH" => Method::from_bytes(upper.as_bytes())
            .map_err(|e| ServerError::Config(format!("method {}: {}", method, e))),
        _ => Err(ServerError::Config(format!("unsupported method {}", method))),
    }
}

/// Owner of the shared HTTP data server and its endpoints.
#[derive(Clone)]
pub struct GlobalServerManager {
    inner: Arc<Inner>,
}

impl GlobalServerManager {
    pub fn new(broker: Arc<TopicBroker>, config: HttpServerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                config,
                ctx: StreamContext::new("$$httppush_connection", "$$httppush_connection", 0),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Address the server is bound to, when running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().server.as_ref().map(|s| s.addr)
    }

    fn ensure_started(&self, state: &mut State) -> Result<(), ServerError> {
        if state.server.is_some() {
            return Ok(());
        }
        if state.draining {
            debug!("Http data server still draining, restart deferred");
            state.restart = true;
            return Ok(());
        }
        state.server = Some(start(&self.inner)?);
        Ok(())
    }

    /// Stop a server taken out of the state, then bind again if endpoints
    /// were registered while it drained. The drain runs on its own task so a
    /// dropped caller cannot leave the manager draining forever.
    async fn shut_down(&self, server: RunningServer) {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            stop(server).await;
            let mut state = inner.lock();
            state.draining = false;
            if std::mem::take(&mut state.restart) && !state.is_empty() && state.server.is_none() {
                match start(&inner) {
                    Ok(server) => state.server = Some(server),
                    Err(e) => error!("Http data server restart failed: {}", e),
                }
            }
        });
        if let Err(e) = task.await {
            error!("Http data server shutdown task failed: {}", e);
        }
    }

    /// Register a push endpoint and return the topic its bodies go to.
    /// Registering the same path and method again shares the endpoint.
    pub fn register_endpoint(&self, path: &str, method: &str) -> Result<String, ServerError> {
        let path = normalize(path)?;
        let method = parse_method(method)?;
        let mut state = self.inner.lock();
        if let Some(endpoint) = state.push.get_mut(&(path.clone(), method.clone())) {
            endpoint.count += 1;
            return Ok(endpoint.topic.clone());
        }
        self.ensure_started(&mut state)?;
        let topic = push_topic(&path, &method);
        self.inner.broker.create_pub(&topic);
        state.push.insert(
            (path.clone(), method.clone()),
            PushEndpoint {
                topic: topic.clone(),
                count: 1,
            },
        );
        info!("Http push endpoint {} {} registered on {}", method, path, topic);
        Ok(topic)
    }

    pub async fn unregister_endpoint(&self, path: &str, method: &str) -> Result<(), ServerError> {
        let key = (normalize(path)?, parse_method(method)?);
        let server = {
            let mut state = self.inner.lock();
            let Some(endpoint) = state.push.get_mut(&key) else {
                debug!("Http push endpoint {} {} is not registered", key.1, key.0);
                return Ok(());
            };
            endpoint.count -= 1;
            if endpoint.count > 0 {
                return Ok(());
            }
            if let Some(endpoint) = state.push.remove(&key) {
                self.inner.broker.remove_pub(&endpoint.topic);
            }
            info!("Http push endpoint {} {} unregistered", key.1, key.0);
            Self::take_if_idle(&mut state)
        };
        if let Some(server) = server {
            self.shut_down(server).await;
        }
        Ok(())
    }

    /// Register a WebSocket endpoint. Returns the receive and send topics.
    pub fn register_websocket_endpoint(
        &self,
        ctx: &StreamContext,
        path: &str,
    ) -> Result<(String, String), ServerError> {
        let path = normalize(path)?;
        let recv = websocket_recv_topic(&path);
        let send = websocket_send_topic(&path);
        let mut state = self.inner.lock();
        if let Some(endpoint) = state.websocket.get_mut(&path) {
            endpoint.count += 1;
            info!("Websocket endpoint {} already registered", path);
            return Ok((recv, send));
        }
        self.ensure_started(&mut state)?;
        self.inner.broker.create_pub(&recv);
        state.websocket.insert(path.clone(), StreamEndpoint::new(ctx));
        info!("Websocket endpoint {} registered", path);
        Ok((recv, send))
    }

    /// Drop one registration. The last one closes every connection and
    /// returns once their tasks have exited.
    pub async fn unregister_websocket_endpoint(&self, path: &str) -> Result<(), ServerError> {
        let path = normalize(path)?;
        self.unregister_stream(StreamKind::WebSocket, &path, |broker| {
            broker.remove_pub(&websocket_recv_topic(&path))
        })
        .await;
        Ok(())
    }

    /// Register a server-sent events endpoint. Returns the topic streamed to
    /// its clients.
    pub fn register_sse_endpoint(&self, ctx: &StreamContext, path: &str) -> Result<String, ServerError> {
        let path = normalize(path)?;
        let topic = sse_topic(&path);
        let mut state = self.inner.lock();
        if let Some(endpoint) = state.sse.get_mut(&path) {
            endpoint.count += 1;
            return Ok(topic);
        }
        self.ensure_started(&mut state)?;
        state.sse.insert(path.clone(), StreamEndpoint::new(ctx));
        info!("Sse endpoint {} registered on {}", path, topic);
        Ok(topic)
    }

    pub async fn unregister_sse_endpoint(&self, path: &str) -> Result<(), ServerError> {
        let path = normalize(path)?;
        self.unregister_stream(StreamKind::Sse, &path, |_| {}).await;
        Ok(())
    }

    async fn unregister_stream(
        &self,
        kind: StreamKind,
        path: &str,
        release_topics: impl FnOnce(&TopicBroker),
    ) {
        let (tracker, server) = {
            let mut state = self.inner.lock();
            let Some(endpoint) = state.streams(kind).get_mut(path) else {
                debug!("{:?} endpoint {} is not registered", kind, path);
                return;
            };
            endpoint.count -= 1;
            if endpoint.count > 0 {
                return;
            }
            let tracker = state
                .streams(kind)
                .remove(path)
                .map(|mut endpoint| endpoint.close());
            release_topics(self.inner.broker.as_ref());
            (tracker, Self::take_if_idle(&mut state))
        };
        if let Some(tracker) = tracker {
            tracker.wait().await;
        }
        info!("{:?} endpoint {} unregistered", kind, path);
        if let Some(server) = server {
            self.shut_down(server).await;
        }
    }

    fn take_if_idle(state: &mut State) -> Option<RunningServer> {
        if !state.is_empty() {
            return None;
        }
        let server = state.server.take();
        if server.is_some() {
            state.draining = true;
        }
        server
    }

    /// Number of live connections on a WebSocket endpoint.
    pub fn websocket_connections(&self, path: &str) -> usize {
        let path = normalize(path).unwrap_or_default();
        self.inner
            .lock()
            .websocket
            .get(&path)
            .map_or(0, |e| e.conns.len())
    }

    pub fn sse_connections(&self, path: &str) -> usize {
        let path = normalize(path).unwrap_or_default();
        self.inner.lock().sse.get(&path).map_or(0, |e| e.conns.len())
    }
}

impl std::fmt::Debug for GlobalServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("GlobalServerManager")
            .field("addr", &state.server.as_ref().map(|s| s.addr))
            .field("push", &state.push.len())
            .field("websocket", &state.websocket.len())
            .field("sse", &state.sse.len())
            .finish()
    }
}

/// Text sent to WebSocket and SSE clients for a payload.
pub(crate) fn payload_text(payload: &crate::pubsub::Payload) -> Option<String> {
    use crate::pubsub::Payload;
    match payload {
        Payload::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        Payload::Tuple(t) => Some(t.to_json().to_string()),
        Payload::List(list) => Some(
            serde_json::Value::Array(list.iter().map(Tuple::to_json).collect()).to_string(),
        ),
        Payload::Error(e) => {
            debug!("Error payload not forwarded to clients: {}", e);
            None
        }
    }
}

pub(crate) fn connection_buffer() -> usize {
    CONNECTION_BUFFER
}

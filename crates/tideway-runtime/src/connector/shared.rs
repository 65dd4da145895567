//! Source and sink operators over registry-managed connections.
//!
//! Both obtain their wrapper from the [`ClientRegistry`] when the rule starts
//! and hand it back when it stops, so operators naming the same
//! `connectionSelector` share one physical connection.

use super::client::{ClientWrapper, MessageEnvelope, TopicChannel};
use super::registry::{ClientKind, ClientRegistry, SharedClient};
use super::types::{ConnectorConfig, ConnectorError, Params, SinkConnector, SourceConnector};
use crate::context::StreamContext;
use crate::pubsub::Payload;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tideway_core::Tuple;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Decode a received message: a JSON object becomes a tuple, an array of
/// objects a list, anything else is passed on as raw bytes.
pub fn decode_message(msg: &MessageEnvelope) -> Payload {
    let tuple = |json: &serde_json::Value| {
        Tuple::from_json_object(msg.topic.as_str(), json)
            .map(|t| t.with_timestamp(msg.received_at).with_meta("topic", msg.topic.as_str()))
    };
    match serde_json::from_slice::<serde_json::Value>(&msg.payload) {
        Ok(serde_json::Value::Array(items)) if items.iter().all(|i| i.is_object()) => {
            Payload::from(items.iter().filter_map(tuple).collect::<Vec<_>>())
        }
        Ok(json) => match tuple(&json) {
            Some(t) => Payload::from(t),
            None => Payload::Bytes(msg.payload.clone()),
        },
        Err(_) => Payload::Bytes(msg.payload.clone()),
    }
}

fn topic_of(kind: ClientKind, config: &ConnectorConfig) -> Result<String, ConnectorError> {
    match kind {
        // every frame of a websocket connection goes to every consumer
        ClientKind::WebSocket => Ok(config
            .require_topic()
            .map(str::to_string)
            .unwrap_or_else(|_| "/".to_string())),
        _ => config.require_topic().map(str::to_string),
    }
}

/// Source reading from a shared connection
pub struct SharedSource {
    name: String,
    registry: Arc<ClientRegistry>,
    kind: ClientKind,
    topic: String,
    params: Params,
    buffer: usize,
    running: Option<(SharedClient, CancellationToken)>,
}

impl SharedSource {
    pub fn new(
        name: &str,
        registry: Arc<ClientRegistry>,
        config: &ConnectorConfig,
        buffer: usize,
    ) -> Result<Self, ConnectorError> {
        let kind = config.connector_type.parse::<ClientKind>()?;
        Ok(Self {
            name: name.to_string(),
            registry,
            kind,
            topic: topic_of(kind, config)?,
            params: config.to_params(),
            buffer: buffer.max(1),
            running: None,
        })
    }
}

#[async_trait]
impl SourceConnector for SharedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        &mut self,
        ctx: &StreamContext,
        tx: mpsc::Sender<Payload>,
    ) -> Result<(), ConnectorError> {
        if self.running.is_some() {
            self.stop(ctx).await?;
        }
        let client = self.registry.get_client(self.kind, &self.params).await?;
        let (msg_tx, mut msg_rx) = mpsc::channel(self.buffer);
        let (err_tx, mut err_rx) = mpsc::channel(self.buffer);

        if let Err(e) = client.subscribe(
            ctx,
            vec![TopicChannel::new(self.topic.clone(), msg_tx)],
            err_tx,
            &self.params,
        ) {
            self.registry.release_client(ctx, &client).await;
            return Err(e);
        }

        let token = ctx.token().child_token();
        let task_token = token.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = task_token.cancelled() => break,
                    msg = msg_rx.recv() => match msg {
                        Some(msg) => decode_message(&msg),
                        None => break,
                    },
                    err = err_rx.recv() => match err {
                        Some(err) => {
                            warn!("Source {} connection error: {}", name, err);
                            Payload::Error(err.to_string().into())
                        }
                        None => break,
                    },
                };
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    sent = tx.send(payload) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Source {} stopped forwarding", name);
        });

        info!("Source {} subscribed to {} over {}", self.name, self.topic, self.kind);
        self.running = Some((client, token));
        Ok(())
    }

    async fn stop(&mut self, ctx: &StreamContext) -> Result<(), ConnectorError> {
        if let Some((client, token)) = self.running.take() {
            token.cancel();
            self.registry.release_client(ctx, &client).await;
            info!("Source {} released its {} connection", self.name, self.kind);
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

/// Sink publishing tuples as JSON on a shared connection
pub struct SharedSink {
    name: String,
    registry: Arc<ClientRegistry>,
    kind: ClientKind,
    topic: String,
    params: Params,
    client: Option<SharedClient>,
}

impl SharedSink {
    pub fn new(
        name: &str,
        registry: Arc<ClientRegistry>,
        config: &ConnectorConfig,
    ) -> Result<Self, ConnectorError> {
        let kind = config.connector_type.parse::<ClientKind>()?;
        Ok(Self {
            name: name.to_string(),
            registry,
            kind,
            topic: topic_of(kind, config)?,
            params: config.to_params(),
            client: None,
        })
    }
}

#[async_trait]
impl SinkConnector for SharedSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self, _ctx: &StreamContext) -> Result<(), ConnectorError> {
        if self.client.is_none() {
            self.client = Some(self.registry.get_client(self.kind, &self.params).await?);
            info!("Sink {} connected over {}", self.name, self.kind);
        }
        Ok(())
    }

    async fn collect(&self, ctx: &StreamContext, tuple: &Tuple) -> Result<(), ConnectorError> {
        let client = self.client.as_ref().ok_or(ConnectorError::NotConnected)?;
        let body = serde_json::to_vec(&tuple.to_json())
            .map_err(|e| ConnectorError::SendFailed(e.to_string()))?;
        client
            .publish(ctx, &self.topic, Bytes::from(body), &self.params)
            .await
    }

    async fn close(&mut self, ctx: &StreamContext) -> Result<(), ConnectorError> {
        if let Some(client) = self.client.take() {
            self.registry.release_client(ctx, &client).await;
        }
        Ok(())
    }
}

//! In-process source and sink over the topic broker.
//!
//! Rules chain through memory topics: a [`MemorySink`] publishes on a topic,
//! any number of [`MemorySource`]s subscribe to it or to a wildcard pattern
//! covering it. A sink configured with `rowkindField` and `keyField` emits
//! updatable tuples that a lookup table applies as inserts, updates or
//! deletes.

use super::types::{ConnectorConfig, ConnectorError, SinkConnector, SourceConnector};
use crate::context::StreamContext;
use crate::pubsub::{Payload, TopicBroker};
use async_trait::async_trait;
use std::sync::Arc;
use tideway_core::{RowKind, Tuple};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

fn is_wildcard(topic: &str) -> bool {
    topic.contains('+') || topic.contains('#')
}

/// Memory source - subscribes to a broker topic or pattern
pub struct MemorySource {
    name: String,
    broker: Arc<TopicBroker>,
    topic: String,
    buffer: usize,
    running: Option<(String, CancellationToken)>,
}

impl MemorySource {
    pub fn new(
        name: &str,
        broker: Arc<TopicBroker>,
        config: &ConnectorConfig,
        buffer: usize,
    ) -> Result<Self, ConnectorError> {
        Ok(Self {
            name: name.to_string(),
            broker,
            topic: config.require_topic()?.to_string(),
            buffer,
            running: None,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl SourceConnector for MemorySource {
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
        let consumer_id = ctx.subscription_id();
        let mut rx = self
            .broker
            .create_sub(&self.topic, is_wildcard(&self.topic), &consumer_id, self.buffer)
            .map_err(|e| ConnectorError::ConfigError(e.to_string()))?;

        let token = ctx.token().child_token();
        let task_token = token.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = task_token.cancelled() => break,
                    payload = rx.recv() => payload,
                };
                let Some(payload) = payload else { break };
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    sent = tx.send(payload) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Memory source {} stopped forwarding", name);
        });

        info!("Memory source {} subscribed to {} as {}", self.name, self.topic, consumer_id);
        self.running = Some((consumer_id, token));
        Ok(())
    }

    async fn stop(&mut self, _ctx: &StreamContext) -> Result<(), ConnectorError> {
        if let Some((consumer_id, token)) = self.running.take() {
            token.cancel();
            self.broker
                .close_source_consumer_channel(&self.topic, &consumer_id);
            info!("Memory source {} unsubscribed from {}", self.name, self.topic);
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

/// Memory sink - publishes tuples on a broker topic
pub struct MemorySink {
    name: String,
    broker: Arc<TopicBroker>,
    topic: String,
    rowkind_field: Option<String>,
    key_field: Option<String>,
    connected: bool,
}

impl MemorySink {
    pub fn new(
        name: &str,
        broker: Arc<TopicBroker>,
        config: &ConnectorConfig,
    ) -> Result<Self, ConnectorError> {
        let topic = config.require_topic()?;
        if is_wildcard(topic) {
            return Err(ConnectorError::ConfigError(format!(
                "memory sink topic {} must not contain wildcards",
                topic
            )));
        }
        let prop = |k: &str| {
            config
                .properties
                .get(k)
                .filter(|v| !v.is_empty())
                .cloned()
        };
        let rowkind_field = prop("rowkindField");
        let key_field = prop("keyField");
        if rowkind_field.is_some() && key_field.is_none() {
            return Err(ConnectorError::ConfigError(
                "keyField is required when rowkindField is set".to_string(),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            broker,
            topic: topic.to_string(),
            rowkind_field,
            key_field,
            connected: false,
        })
    }

    /// Attach the row change described by the configured fields.
    fn updatable(&self, tuple: &Tuple) -> Result<Tuple, ConnectorError> {
        let mut out = tuple.clone();
        let Some(key_field) = &self.key_field else {
            return Ok(out);
        };
        let kind = match &self.rowkind_field {
            Some(field) => match tuple.get(field).and_then(|v| v.as_str()) {
                Some(kind) => kind
                    .parse::<RowKind>()
                    .map_err(|e| ConnectorError::SendFailed(e.to_string()))?,
                None => RowKind::Insert,
            },
            None => RowKind::Upsert,
        };
        let key = tuple.get(key_field).cloned().ok_or_else(|| {
            ConnectorError::SendFailed(format!("key field {} not found in tuple", key_field))
        })?;
        out = out.with_change(kind, key);
        Ok(out)
    }
}

#[async_trait]
impl SinkConnector for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self, _ctx: &StreamContext) -> Result<(), ConnectorError> {
        if !self.connected {
            self.broker.create_pub(&self.topic);
            self.connected = true;
            info!("Memory sink {} publishing to {}", self.name, self.topic);
        }
        Ok(())
    }

    async fn collect(&self, ctx: &StreamContext, tuple: &Tuple) -> Result<(), ConnectorError> {
        if !self.connected {
            return Err(ConnectorError::NotConnected);
        }
        let tuple = self.updatable(tuple)?;
        self.broker.produce(ctx, &self.topic, tuple);
        Ok(())
    }

    async fn close(&mut self, _ctx: &StreamContext) -> Result<(), ConnectorError> {
        if self.connected {
            self.broker.remove_pub(&self.topic);
            self.connected = false;
        }
        Ok(())
    }
}

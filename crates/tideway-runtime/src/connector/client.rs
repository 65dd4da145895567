//! Shared connection wrapper contract.
//!
//! A wrapper owns one physical connection and multiplexes many rule operator
//! instances over it. Each instance subscribes under its subscription id
//! (`ruleId_opId_instanceId`); the wrapper makes one physical subscription per
//! topic and fans every message out to all consumers of that topic.
//!
//! Lifetime is an explicit reference count: [`ClientWrapper::add_ref`] for
//! each sharer, [`ClientWrapper::release`] from each sharer's stop path. The
//! physical connection is closed exactly once, on the 1 to 0 transition.

use super::types::{ConnectorError, Params};
use crate::context::StreamContext;
use crate::pubsub::TopicPattern;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Message received from a physical connection.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Topic a consumer wants plus the channel its messages go to.
#[derive(Debug, Clone)]
pub struct TopicChannel {
    pub topic: String,
    pub messages: mpsc::Sender<MessageEnvelope>,
}

impl TopicChannel {
    pub fn new(topic: impl Into<String>, messages: mpsc::Sender<MessageEnvelope>) -> Self {
        Self {
            topic: topic.into(),
            messages,
        }
    }
}

#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// Attach this instance's channels. A topic already subscribed on the
    /// connection only gains a consumer.
    fn subscribe(
        &self,
        ctx: &StreamContext,
        topics: Vec<TopicChannel>,
        errors: mpsc::Sender<ConnectorError>,
        params: &Params,
    ) -> Result<(), ConnectorError>;

    async fn publish(
        &self,
        ctx: &StreamContext,
        topic: &str,
        payload: Bytes,
        params: &Params,
    ) -> Result<(), ConnectorError>;

    /// Detach every consumer registered under `ctx`'s subscription id.
    fn unsubscribe(&self, ctx: &StreamContext);

    fn add_ref(&self);

    /// Drop one reference. Returns true on the 1 to 0 transition.
    fn release_ref(&self) -> bool;

    fn ref_count(&self) -> usize;

    /// Close the physical connection.
    async fn disconnect(&self);

    fn set_connection_selector(&self, selector: &str);

    fn connection_selector(&self) -> String;

    /// Unsubscribe, drop a reference and disconnect if it was the last one.
    /// Returns true iff this call closed the connection.
    async fn release(&self, ctx: &StreamContext) -> bool {
        self.unsubscribe(ctx);
        if self.release_ref() {
            self.disconnect().await;
            true
        } else {
            false
        }
    }
}

/// Reference count that never goes below zero.
#[derive(Debug)]
pub(crate) struct RefCount {
    name: String,
    count: Mutex<usize>,
}

impl RefCount {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: Mutex::new(1),
        }
    }

    pub(crate) fn add(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count += 1;
        debug!("Connection {} ref count {}", self.name, *count);
    }

    pub(crate) fn release(&self) -> bool {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        if *count == 0 {
            warn!(
                "Connection {} released more times than referenced, ignoring",
                self.name
            );
            return false;
        }
        *count -= 1;
        debug!("Connection {} ref count {}", self.name, *count);
        *count == 0
    }

    pub(crate) fn get(&self) -> usize {
        *self.count.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
struct ConsumerInfo {
    consumer_id: String,
    messages: mpsc::Sender<MessageEnvelope>,
    errors: mpsc::Sender<ConnectorError>,
}

#[derive(Debug)]
struct TopicSubscription {
    /// Set for filters containing `+` or `#`
    pattern: Option<TopicPattern>,
    consumers: Vec<ConsumerInfo>,
    has_error: bool,
}

impl TopicSubscription {
    fn accepts(&self, filter: &str, topic: &str) -> bool {
        filter == topic || self.pattern.as_ref().is_some_and(|p| p.matches(topic))
    }
}

/// Per-connection consumer bookkeeping shared by every wrapper.
#[derive(Debug, Default)]
pub(crate) struct Subscriptions {
    topics: RwLock<FxHashMap<String, TopicSubscription>>,
    subscribers: RwLock<FxHashMap<String, Vec<String>>>,
}

impl Subscriptions {
    /// Register `sub_id`'s channels. Returns the topics that had no consumer
    /// yet and need a physical subscription.
    pub(crate) fn add(
        &self,
        sub_id: &str,
        channels: Vec<TopicChannel>,
        errors: mpsc::Sender<ConnectorError>,
        wildcards: bool,
    ) -> Result<Vec<String>, ConnectorError> {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        if subscribers.contains_key(sub_id) {
            return Err(ConnectorError::AlreadySubscribed(sub_id.to_string()));
        }

        let mut parsed = Vec::with_capacity(channels.len());
        for ch in channels {
            let pattern = if wildcards && (ch.topic.contains('+') || ch.topic.contains('#')) {
                Some(
                    TopicPattern::parse(&ch.topic)
                        .map_err(|e| ConnectorError::ConfigError(e.to_string()))?,
                )
            } else {
                None
            };
            parsed.push((ch, pattern));
        }

        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        let mut fresh = Vec::new();
        let mut names = Vec::with_capacity(parsed.len());
        for (ch, pattern) in parsed {
            let entry = topics.entry(ch.topic.clone()).or_insert_with(|| {
                fresh.push(ch.topic.clone());
                TopicSubscription {
                    pattern,
                    consumers: Vec::new(),
                    has_error: false,
                }
            });
            entry.consumers.push(ConsumerInfo {
                consumer_id: sub_id.to_string(),
                messages: ch.messages,
                errors: errors.clone(),
            });
            names.push(ch.topic);
        }
        subscribers.insert(sub_id.to_string(), names);
        Ok(fresh)
    }

    /// Drop `sub_id`'s consumers. Returns the topics left without consumers.
    pub(crate) fn remove(&self, sub_id: &str) -> Vec<String> {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let Some(names) = subscribers.remove(sub_id) else {
            return Vec::new();
        };
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        let mut emptied = Vec::new();
        for name in names {
            if let Some(entry) = topics.get_mut(&name) {
                entry.consumers.retain(|c| c.consumer_id != sub_id);
                if entry.consumers.is_empty() {
                    topics.remove(&name);
                    emptied.push(name);
                }
            }
        }
        emptied
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        topics.keys().cloned().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.topics.read().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// Fan `msg` out to every consumer of a subscription accepting its topic.
    /// Clears the error flag of those subscriptions.
    pub(crate) fn dispatch(&self, msg: &MessageEnvelope) -> usize {
        let mut delivered = 0;
        let mut recovered = false;
        {
            let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
            for (filter, sub) in topics.iter() {
                if !sub.accepts(filter, &msg.topic) {
                    continue;
                }
                recovered |= sub.has_error;
                for consumer in &sub.consumers {
                    match consumer.messages.try_send(msg.clone()) {
                        Ok(()) => delivered += 1,
                        Err(mpsc::error::TrySendError::Full(_)) => warn!(
                            "Message on {} dropped for {}: buffer full",
                            msg.topic, consumer.consumer_id
                        ),
                        Err(mpsc::error::TrySendError::Closed(_)) => debug!(
                            "Message on {} dropped for {}: consumer closed",
                            msg.topic, consumer.consumer_id
                        ),
                    }
                }
            }
        }
        if recovered {
            let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
            for (filter, sub) in topics.iter_mut() {
                if sub.has_error && sub.accepts(filter, &msg.topic) {
                    sub.has_error = false;
                    info!("Subscription {} recovered", filter);
                }
            }
        }
        delivered
    }

    /// Send `msg` to every consumer regardless of topic.
    pub(crate) fn dispatch_all(&self, msg: &MessageEnvelope) -> usize {
        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        for sub in topics.values() {
            for consumer in &sub.consumers {
                match consumer.messages.try_send(msg.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => warn!("Message dropped for {}", consumer.consumer_id),
                }
            }
        }
        delivered
    }

    /// Broadcast `err` to the consumers of subscriptions accepting `topic`
    /// (every subscription when `None`), once per error episode.
    pub(crate) fn broadcast_error(&self, topic: Option<&str>, err: &ConnectorError) -> usize {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        let mut notified = 0;
        for (filter, sub) in topics.iter_mut() {
            if topic.is_some_and(|t| !sub.accepts(filter, t)) || sub.has_error {
                continue;
            }
            sub.has_error = true;
            for consumer in &sub.consumers {
                if consumer.errors.try_send(err.clone()).is_ok() {
                    notified += 1;
                } else {
                    warn!("Error on {} dropped for {}", filter, consumer.consumer_id);
                }
            }
        }
        notified
    }

    /// Reset the error flags so the next failure is reported again.
    pub(crate) fn clear_errors(&self) {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        for sub in topics.values_mut() {
            sub.has_error = false;
        }
    }
}

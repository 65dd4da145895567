//! In-process topic broker.
//!
//! Publishers (memory sinks, HTTP/WebSocket endpoints) register a topic with
//! [`TopicBroker::create_pub`] and push payloads with the `produce*` family.
//! Consumers (memory sources, lookup tables) obtain a bounded receiver from
//! [`TopicBroker::create_sub`], either for an exact topic or for an MQTT-style
//! wildcard pattern that attaches to every matching topic, present or future.
//!
//! Delivery never blocks the producer: a full or closed consumer channel drops
//! the message and logs it. Publishing to a topic nobody registered is a no-op.
//!
//! A consumer id registered twice (a restarting rule whose previous instance
//! has not torn down yet) replaces the earlier channel and bumps a replacement
//! counter. The next close for that id only decrements the counter, so a late
//! teardown never evicts the newer channel.

mod pattern;

pub use pattern::TopicPattern;

use crate::context::StreamContext;
use bytes::Bytes;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tideway_core::Tuple;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Message delivered to broker consumers.
#[derive(Debug, Clone)]
pub enum Payload {
    Tuple(Arc<Tuple>),
    List(Arc<[Tuple]>),
    /// Raw body, e.g. from an HTTP push endpoint
    Bytes(Bytes),
    Error(Arc<str>),
}

impl From<Tuple> for Payload {
    fn from(t: Tuple) -> Self {
        Payload::Tuple(Arc::new(t))
    }
}

impl From<Vec<Tuple>> for Payload {
    fn from(list: Vec<Tuple>) -> Self {
        Payload::List(list.into())
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Bytes(b)
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("topic must not be empty")]
    EmptyTopic,
}

/// Delivery counters.
#[derive(Debug, Default)]
pub struct BrokerStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrokerStatsSnapshot {
    pub delivered: u64,
    pub dropped: u64,
}

impl BrokerStats {
    pub fn snapshot(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct PubConsumers {
    /// Active publisher registrations
    count: usize,
    consumers: FxHashMap<String, mpsc::Sender<Payload>>,
    replaced: FxHashMap<String, usize>,
}

impl PubConsumers {
    fn is_unused(&self) -> bool {
        self.count == 0 && self.consumers.is_empty()
    }

    /// Attach a consumer. Exact subscriptions count a replacement here;
    /// wildcard subscriptions count theirs on the wildcard entry.
    fn attach(&mut self, topic: &str, consumer_id: &str, tx: mpsc::Sender<Payload>, count: bool) {
        if self.consumers.insert(consumer_id.to_string(), tx).is_some() && count {
            warn!(
                "Consumer {} on topic {} already exists, replacing it",
                consumer_id, topic
            );
            *self.replaced.entry(consumer_id.to_string()).or_insert(0) += 1;
        }
    }

    /// Detach a consumer unless a newer registration replaced it.
    fn detach(&mut self, topic: &str, consumer_id: &str) {
        if !self.consumers.contains_key(consumer_id) {
            return;
        }
        if let Some(n) = self.replaced.get_mut(consumer_id) {
            if *n > 0 {
                *n -= 1;
                if *n == 0 {
                    self.replaced.remove(consumer_id);
                }
                warn!(
                    "Close of consumer {} on topic {} arrived after its replacement, keeping the newer channel",
                    consumer_id, topic
                );
                return;
            }
        }
        self.consumers.remove(consumer_id);
    }
}

struct WildcardSub {
    pattern: TopicPattern,
    tx: mpsc::Sender<Payload>,
    replaced: usize,
}

#[derive(Default)]
struct BrokerState {
    topics: FxHashMap<String, PubConsumers>,
    wildcards: FxHashMap<String, WildcardSub>,
}

impl BrokerState {
    /// Topic entry, created on first use with every matching wildcard attached.
    fn topic_entry(&mut self, topic: &str) -> &mut PubConsumers {
        let BrokerState { topics, wildcards } = self;
        topics.entry(topic.to_string()).or_insert_with(|| {
            let mut entry = PubConsumers::default();
            for (id, sub) in wildcards.iter() {
                if sub.pattern.matches(topic) {
                    entry.attach(topic, id, sub.tx.clone(), false);
                }
            }
            entry
        })
    }

    fn drop_if_unused(&mut self, topic: &str) {
        if self.topics.get(topic).is_some_and(PubConsumers::is_unused) {
            self.topics.remove(topic);
            debug!("Topic {} removed", topic);
        }
    }
}

/// Process-local publish/subscribe registry.
#[derive(Default)]
pub struct TopicBroker {
    state: RwLock<BrokerState>,
    stats: BrokerStats,
}

impl std::fmt::Debug for TopicBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("TopicBroker")
            .field("topics", &state.topics.len())
            .field("wildcards", &state.wildcards.len())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

static GLOBAL: Lazy<Arc<TopicBroker>> = Lazy::new(|| Arc::new(TopicBroker::new()));

impl TopicBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide broker instance.
    pub fn global() -> Arc<TopicBroker> {
        GLOBAL.clone()
    }

    /// Register a publisher on `topic`.
    pub fn create_pub(&self, topic: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let entry = state.topic_entry(topic);
        entry.count += 1;
        debug!("Publisher registered on {} (count {})", topic, entry.count);
    }

    /// Subscribe `consumer_id` to an exact topic or, when `wildcard` is set,
    /// to every topic matching the pattern.
    pub fn create_sub(
        &self,
        topic: &str,
        wildcard: bool,
        consumer_id: &str,
        buffer: usize,
    ) -> Result<mpsc::Receiver<Payload>, BrokerError> {
        if topic.is_empty() {
            return Err(BrokerError::EmptyTopic);
        }
        let pattern = if wildcard {
            Some(TopicPattern::parse(topic)?)
        } else {
            None
        };
        let (tx, rx) = mpsc::channel(buffer.max(1));

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match pattern {
            Some(pattern) => {
                let replaced = match state.wildcards.get(consumer_id) {
                    Some(prev) => {
                        warn!(
                            "Wildcard consumer {} already exists, replacing it",
                            consumer_id
                        );
                        prev.replaced + 1
                    }
                    None => 0,
                };
                let BrokerState { topics, wildcards } = &mut *state;
                for (name, entry) in topics.iter_mut() {
                    if pattern.matches(name) {
                        entry.attach(name, consumer_id, tx.clone(), false);
                    }
                }
                info!("Wildcard consumer {} subscribed to {}", consumer_id, pattern);
                wildcards.insert(
                    consumer_id.to_string(),
                    WildcardSub {
                        pattern,
                        tx,
                        replaced,
                    },
                );
            }
            None => {
                state.topic_entry(topic).attach(topic, consumer_id, tx, true);
                info!("Consumer {} subscribed to {}", consumer_id, topic);
            }
        }
        Ok(rx)
    }

    /// Release one publisher registration on `topic`.
    pub fn remove_pub(&self, topic: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state.topics.get_mut(topic) {
            entry.count = entry.count.saturating_sub(1);
            state.drop_if_unused(topic);
        }
    }

    /// Close a consumer's channel. For wildcard consumers this detaches it from
    /// every matched topic; `topic` is then ignored.
    pub fn close_source_consumer_channel(&self, topic: &str, consumer_id: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        if let Some(sub) = state.wildcards.get_mut(consumer_id) {
            if sub.replaced > 0 {
                sub.replaced -= 1;
                warn!(
                    "Close of wildcard consumer {} arrived after its replacement, keeping the newer channel",
                    consumer_id
                );
                return;
            }
            state.wildcards.remove(consumer_id);
            let matched: Vec<String> = state
                .topics
                .iter()
                .filter(|(_, e)| e.consumers.contains_key(consumer_id))
                .map(|(name, _)| name.clone())
                .collect();
            for name in matched {
                if let Some(entry) = state.topics.get_mut(&name) {
                    entry.consumers.remove(consumer_id);
                }
                state.drop_if_unused(&name);
            }
            info!("Wildcard consumer {} closed", consumer_id);
            return;
        }

        if let Some(entry) = state.topics.get_mut(topic) {
            entry.detach(topic, consumer_id);
            state.drop_if_unused(topic);
            debug!("Consumer {} on {} closed", consumer_id, topic);
        }
    }

    pub fn produce(&self, ctx: &StreamContext, topic: &str, tuple: Tuple) {
        self.produce_any(ctx, topic, Payload::from(tuple));
    }

    pub fn produce_list(&self, ctx: &StreamContext, topic: &str, list: Vec<Tuple>) {
        self.produce_any(ctx, topic, Payload::from(list));
    }

    pub fn produce_error(&self, ctx: &StreamContext, topic: &str, err: impl std::fmt::Display) {
        self.produce_any(ctx, topic, Payload::Error(err.to_string().into()));
    }

    pub fn produce_bytes(&self, ctx: &StreamContext, topic: &str, body: Bytes) {
        self.produce_any(ctx, topic, Payload::Bytes(body));
    }

    /// Broadcast to every consumer of `topic` without blocking.
    pub fn produce_any(&self, ctx: &StreamContext, topic: &str, payload: Payload) {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = state.topics.get(topic) else {
            return;
        };
        for (consumer_id, tx) in &entry.consumers {
            match tx.try_send(payload.clone()) {
                Ok(()) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        rule = ctx.rule_id(),
                        "Broadcast from topic {} to {} done", topic, consumer_id
                    );
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        rule = ctx.rule_id(),
                        "Topic {} dropped message to {}: buffer full", topic, consumer_id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        rule = ctx.rule_id(),
                        "Topic {} dropped message to {}: consumer closed", topic, consumer_id
                    );
                }
            }
        }
    }

    pub fn stats(&self) -> BrokerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.topics.contains_key(topic)
    }

    /// Number of consumers attached to `topic`.
    pub fn consumer_count(&self, topic: &str) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.topics.get(topic).map_or(0, |e| e.consumers.len())
    }

    /// Drop all topics and subscriptions.
    pub fn reset(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = BrokerState::default();
        self.stats.delivered.store(0, Ordering::Relaxed);
        self.stats.dropped.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tideway_core::Value;

    fn ctx() -> StreamContext {
        StreamContext::new("test", "op", 0)
    }

    fn tuple(n: i64) -> Tuple {
        Tuple::new("t").with_field("n", n)
    }

    fn recv_n(rx: &mut mpsc::Receiver<Payload>) -> Option<i64> {
        match rx.try_recv().ok()? {
            Payload::Tuple(t) => t.get("n").and_then(Value::as_int),
            _ => None,
        }
    }

    // ==========================================================================
    // Exact topics
    // ==========================================================================

    #[test]
    fn test_produce_in_order() {
        let broker = TopicBroker::new();
        broker.create_pub("a");
        let mut rx = broker.create_sub("a", false, "c1", 10).unwrap();
        for n in 0..5 {
            broker.produce(&ctx(), "a", tuple(n));
        }
        for n in 0..5 {
            assert_eq!(recv_n(&mut rx), Some(n));
        }
        assert_eq!(broker.stats().delivered, 5);
    }

    #[test]
    fn test_produce_unknown_topic_is_noop() {
        let broker = TopicBroker::new();
        broker.produce(&ctx(), "nowhere", tuple(1));
        assert!(!broker.has_topic("nowhere"));
        assert_eq!(broker.stats(), BrokerStatsSnapshot::default());
    }

    #[test]
    fn test_full_buffer_drops() {
        let broker = TopicBroker::new();
        let mut rx = broker.create_sub("a", false, "c1", 1).unwrap();
        broker.produce(&ctx(), "a", tuple(1));
        broker.produce(&ctx(), "a", tuple(2));
        assert_eq!(recv_n(&mut rx), Some(1));
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.stats().dropped, 1);
    }

    #[test]
    fn test_topic_lifetime() {
        let broker = TopicBroker::new();
        broker.create_pub("a");
        broker.create_pub("a");
        let _rx = broker.create_sub("a", false, "c1", 1).unwrap();

        broker.remove_pub("a");
        broker.remove_pub("a");
        assert!(broker.has_topic("a"), "consumer still attached");

        broker.close_source_consumer_channel("a", "c1");
        assert!(!broker.has_topic("a"));
    }

    #[test]
    fn test_close_ends_receiver() {
        let broker = TopicBroker::new();
        let mut rx = broker.create_sub("a", false, "c1", 1).unwrap();
        broker.close_source_consumer_channel("a", "c1");
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let broker = TopicBroker::new();
        broker.create_pub("a");
        let _rx = broker.create_sub("a", false, "c1", 1).unwrap();
        broker.close_source_consumer_channel("a", "c1");
        broker.close_source_consumer_channel("a", "c1");
        broker.close_source_consumer_channel("missing", "c1");
        assert_eq!(broker.consumer_count("a"), 0);
        assert!(broker.has_topic("a"));
    }

    // ==========================================================================
    // Replacement
    // ==========================================================================

    #[test]
    fn test_late_close_keeps_replacement() {
        let broker = TopicBroker::new();
        broker.create_pub("a");
        let _old = broker.create_sub("a", false, "c1", 10).unwrap();
        let mut new = broker.create_sub("a", false, "c1", 10).unwrap();

        // teardown of the old instance arrives after the restart
        broker.close_source_consumer_channel("a", "c1");

        broker.produce(&ctx(), "a", tuple(7));
        assert_eq!(recv_n(&mut new), Some(7));

        broker.close_source_consumer_channel("a", "c1");
        assert_eq!(broker.consumer_count("a"), 0);
    }

    // ==========================================================================
    // Wildcards
    // ==========================================================================

    #[test]
    fn test_wildcard_attaches_retroactively() {
        let broker = TopicBroker::new();
        broker.create_pub("h/d1/c1/s1");
        broker.create_pub("h/d1/s1");
        let mut rx = broker.create_sub("h/+/+/s1", true, "w", 10).unwrap();

        broker.produce(&ctx(), "h/d1/c1/s1", tuple(1));
        broker.produce(&ctx(), "h/d1/s1", tuple(2));
        assert_eq!(recv_n(&mut rx), Some(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_wildcard_attaches_to_later_topics() {
        let broker = TopicBroker::new();
        let mut rx = broker.create_sub("h/d3/#", true, "w", 10).unwrap();
        broker.create_pub("h/d3/c3/s1");
        broker.produce(&ctx(), "h/d3/c3/s1", tuple(3));
        assert_eq!(recv_n(&mut rx), Some(3));
    }

    #[test]
    fn test_wildcard_attaches_to_subscriber_created_topic() {
        let broker = TopicBroker::new();
        let mut w = broker.create_sub("s/#", true, "w", 10).unwrap();
        let _exact = broker.create_sub("s/1", false, "e", 10).unwrap();
        broker.create_pub("s/1");
        broker.produce(&ctx(), "s/1", tuple(1));
        assert_eq!(recv_n(&mut w), Some(1));
    }

    #[test]
    fn test_invalid_wildcard_rejected() {
        let broker = TopicBroker::new();
        assert!(matches!(
            broker.create_sub("a/#/b", true, "w", 1),
            Err(BrokerError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_wildcard_close_detaches_everywhere() {
        let broker = TopicBroker::new();
        broker.create_pub("x/1");
        broker.create_pub("x/2");
        let mut rx = broker.create_sub("x/+", true, "w", 10).unwrap();
        assert_eq!(broker.consumer_count("x/1"), 1);

        broker.close_source_consumer_channel("", "w");
        assert_eq!(broker.consumer_count("x/1"), 0);
        assert_eq!(broker.consumer_count("x/2"), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_wildcard_late_close_keeps_replacement() {
        let broker = TopicBroker::new();
        broker.create_pub("x/1");
        let _old = broker.create_sub("x/+", true, "w", 10).unwrap();
        let mut new = broker.create_sub("x/+", true, "w", 10).unwrap();
        broker.close_source_consumer_channel("", "w");

        broker.produce(&ctx(), "x/1", tuple(5));
        assert_eq!(recv_n(&mut new), Some(5));
    }

    #[test]
    fn test_reset() {
        let broker = TopicBroker::new();
        broker.create_pub("a");
        let _rx = broker.create_sub("a/#", true, "w", 1).unwrap();
        broker.reset();
        assert!(!broker.has_topic("a"));
        broker.create_pub("a/b");
        assert_eq!(broker.consumer_count("a/b"), 0);
    }
}

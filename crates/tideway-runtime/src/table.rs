//! Lookup tables accumulated from broker topics.
//!
//! A lookup join reads the latest row per primary key from a [`Table`] that a
//! background task keeps up to date from a broker topic. Tables are shared:
//! every rule registering the same `(topic, key)` gets the same table, and the
//! accumulation task stops when the last registration is released.

use crate::pubsub::{Payload, TopicBroker};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, RwLock};
use tideway_core::{RowKind, Tuple, Value, ValueKey};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("table for topic {topic} and key {key} not found")]
    NotFound { topic: String, key: String },
}

/// Latest row per primary-key value.
#[derive(Debug)]
pub struct Table {
    topic: String,
    key: String,
    rows: RwLock<FxHashMap<ValueKey, Tuple>>,
}

impl Table {
    pub fn new(topic: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            rows: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Primary-key field name.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows whose fields equal every `keys[i] == values[i]` pair.
    ///
    /// When the primary key is among the filters the row is fetched directly
    /// and the other pairs are checked against it; otherwise every row is
    /// scanned.
    pub fn read(&self, keys: &[&str], values: &[Value]) -> Vec<Tuple> {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        let filters: Vec<(&str, &Value)> = keys.iter().copied().zip(values.iter()).collect();

        if let Some(pk) = filters
            .iter()
            .position(|(k, _)| *k == self.key)
            .and_then(|i| filters[i].1.to_key())
        {
            return rows
                .get(&pk)
                .filter(|row| Self::matches(row, &filters))
                .cloned()
                .into_iter()
                .collect();
        }

        rows.values()
            .filter(|row| Self::matches(row, &filters))
            .cloned()
            .collect()
    }

    fn matches(row: &Tuple, filters: &[(&str, &Value)]) -> bool {
        filters
            .iter()
            .all(|(k, v)| row.get(k).is_some_and(|field| field.loose_eq(v)))
    }

    /// Apply one tuple according to its row kind.
    pub fn apply(&self, tuple: Tuple) {
        let key_value = match &tuple.change {
            Some(change) => Some(change.key.clone()),
            None => tuple.get(&self.key).cloned(),
        };
        let Some(key_value) = key_value else {
            error!(
                "Table {} dropped row without primary key field {}",
                self.topic, self.key
            );
            return;
        };
        let Some(key) = key_value.to_key() else {
            error!(
                "Table {} dropped row with non-scalar primary key {}",
                self.topic, key_value
            );
            return;
        };

        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        match tuple.row_kind() {
            RowKind::Insert | RowKind::Update | RowKind::Upsert => {
                rows.insert(key, tuple);
            }
            RowKind::Delete => {
                rows.remove(&key);
            }
        }
    }

    fn apply_payload(&self, payload: Payload) {
        match payload {
            Payload::Tuple(t) => self.apply(Arc::unwrap_or_clone(t)),
            Payload::List(list) => {
                for t in list.iter() {
                    self.apply(t.clone());
                }
            }
            Payload::Bytes(body) => match serde_json::from_slice::<serde_json::Value>(&body) {
                Ok(serde_json::Value::Array(items)) => {
                    for item in &items {
                        match Tuple::from_json_object(&self.topic, item) {
                            Some(t) => self.apply(t),
                            None => warn!("Table {} ignored non-object array item", self.topic),
                        }
                    }
                }
                Ok(json) => match Tuple::from_json_object(&self.topic, &json) {
                    Some(t) => self.apply(t),
                    None => warn!("Table {} ignored non-object payload", self.topic),
                },
                Err(e) => warn!("Table {} failed to decode payload: {}", self.topic, e),
            },
            Payload::Error(e) => warn!("Table {} received error: {}", self.topic, e),
        }
    }
}

struct TableCount {
    count: usize,
    table: Arc<Table>,
    consumer_id: String,
    token: CancellationToken,
}

/// Registry of shared lookup tables.
pub struct TableStore {
    broker: Arc<TopicBroker>,
    buffer: usize,
    tables: Mutex<FxHashMap<(String, String), TableCount>>,
}

impl TableStore {
    pub fn new(broker: Arc<TopicBroker>, buffer: usize) -> Self {
        Self {
            broker,
            buffer,
            tables: Mutex::new(FxHashMap::default()),
        }
    }

    /// Register interest in the table for `(topic, key)`.
    ///
    /// The first registration subscribes to the broker and spawns the
    /// accumulation task on the current tokio runtime. Outside a runtime it
    /// fails with [`TableError::Config`] and subscribes nothing.
    pub fn reg(&self, topic: &str, wildcard: bool, key: &str) -> Result<Arc<Table>, TableError> {
        if topic.is_empty() {
            return Err(TableError::Config("topic must not be empty".to_string()));
        }
        if key.is_empty() {
            return Err(TableError::Config("key must not be empty".to_string()));
        }

        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let id = (topic.to_string(), key.to_string());
        if let Some(tc) = tables.get_mut(&id) {
            tc.count += 1;
            debug!("Table {}/{} shared (count {})", topic, key, tc.count);
            return Ok(tc.table.clone());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TableError::Config(format!("no tokio runtime: {}", e)))?;
        let consumer_id = format!("store_{}_{}", topic, key);
        let rx = self
            .broker
            .create_sub(topic, wildcard, &consumer_id, self.buffer)
            .map_err(|e| TableError::Config(e.to_string()))?;
        let table = Arc::new(Table::new(topic, key));
        let token = CancellationToken::new();
        runtime.spawn(accumulate(table.clone(), rx, token.clone()));

        info!("Table {}/{} created", topic, key);
        tables.insert(
            id,
            TableCount {
                count: 1,
                table: table.clone(),
                consumer_id,
                token,
            },
        );
        Ok(table)
    }

    /// Release one registration. The last one stops accumulation and drops
    /// the table.
    pub fn unreg(&self, topic: &str, key: &str) -> Result<(), TableError> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let id = (topic.to_string(), key.to_string());
        let Some(tc) = tables.get_mut(&id) else {
            return Err(TableError::NotFound {
                topic: topic.to_string(),
                key: key.to_string(),
            });
        };
        tc.count -= 1;
        if tc.count == 0 {
            if let Some(tc) = tables.remove(&id) {
                tc.token.cancel();
                self.broker
                    .close_source_consumer_channel(topic, &tc.consumer_id);
                info!("Table {}/{} dropped", topic, key);
            }
        }
        Ok(())
    }

    pub fn table_count(&self) -> usize {
        self.tables.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Ref count for `(topic, key)`, zero when absent.
    pub fn ref_count(&self, topic: &str, key: &str) -> usize {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables
            .get(&(topic.to_string(), key.to_string()))
            .map_or(0, |tc| tc.count)
    }
}

async fn accumulate(table: Arc<Table>, mut rx: mpsc::Receiver<Payload>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(payload) => table.apply_payload(payload),
                None => break,
            },
        }
    }
    debug!("Table {}/{} accumulation stopped", table.topic, table.key);
}

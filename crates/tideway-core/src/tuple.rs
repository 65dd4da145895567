//! Tuples flowing between rule operators

use crate::value::Value;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// IndexMap with FxBuildHasher for faster field access.
pub type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;

/// Kind of change an updatable tuple applies to a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Insert,
    Update,
    Upsert,
    Delete,
}

impl RowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowKind::Insert => "insert",
            RowKind::Update => "update",
            RowKind::Upsert => "upsert",
            RowKind::Delete => "delete",
        }
    }
}

impl fmt::Display for RowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRowKind(pub String);

impl fmt::Display for UnknownRowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid rowkind {}", self.0)
    }
}

impl std::error::Error for UnknownRowKind {}

impl FromStr for RowKind {
    type Err = UnknownRowKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(RowKind::Insert),
            "update" => Ok(RowKind::Update),
            "upsert" => Ok(RowKind::Upsert),
            "delete" => Ok(RowKind::Delete),
            _ => Err(UnknownRowKind(s.to_string())),
        }
    }
}

/// Row kind plus the key value the change applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub kind: RowKind,
    pub key: Value,
}

/// A message on the broker: named fields, metadata, timestamp and an
/// optional row change for updatable tuples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    /// Name of the emitter (topic, source or sink) that produced the tuple
    #[serde(default)]
    pub emitter: String,
    pub data: FxIndexMap<String, Value>,
    #[serde(default)]
    pub meta: FxIndexMap<String, Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<RowChange>,
}

impl Default for Tuple {
    fn default() -> Self {
        Self::new("")
    }
}

impl Tuple {
    pub fn new(emitter: impl Into<String>) -> Self {
        Self {
            emitter: emitter.into(),
            data: IndexMap::with_hasher(FxBuildHasher),
            meta: IndexMap::with_hasher(FxBuildHasher),
            timestamp: Utc::now(),
            change: None,
        }
    }

    pub fn from_fields(emitter: impl Into<String>, data: FxIndexMap<String, Value>) -> Self {
        Self {
            data,
            ..Self::new(emitter)
        }
    }

    /// Build a tuple from a decoded JSON object. Returns `None` for anything
    /// other than an object.
    pub fn from_json_object(emitter: impl Into<String>, json: &serde_json::Value) -> Option<Self> {
        let obj = json.as_object()?;
        let data = obj
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect();
        Some(Self::from_fields(emitter, data))
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = ts;
        self
    }

    pub fn with_change(mut self, kind: RowKind, key: impl Into<Value>) -> Self {
        self.change = Some(RowChange {
            kind,
            key: key.into(),
        });
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Row kind of an updatable tuple; plain tuples behave as upserts.
    pub fn row_kind(&self) -> RowKind {
        self.change.as_ref().map_or(RowKind::Upsert, |c| c.kind)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.data
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

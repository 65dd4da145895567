//! Tideway Runtime - in-process plumbing for edge stream rules
//!
//! - [`pubsub`]: the topic broker rules exchange tuples through, with MQTT
//!   style `+`/`#` wildcard subscriptions
//! - [`table`]: lookup tables kept up to date from a broker topic
//! - [`connector`]: memory, MQTT, EdgeX and WebSocket sources and sinks, with
//!   ref-counted connections shared by `connectionSelector`
//! - [`httpserver`]: the process-wide HTTP server for push, WebSocket and SSE
//!   endpoints

pub mod config;
pub mod connector;
pub mod context;
pub mod httpserver;
pub mod pubsub;
pub mod table;

pub use config::{ConfigError, HttpServerConfig, RuntimeConfig};
pub use connector::{ClientRegistry, ConnectorConfig, ConnectorError, ConnectorFactory};
pub use context::StreamContext;
pub use httpserver::{GlobalServerManager, ServerError};
pub use pubsub::{BrokerError, Payload, TopicBroker};
pub use table::{Table, TableError, TableStore};

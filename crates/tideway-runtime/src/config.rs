//! Runtime configuration
//!
//! Supports both YAML and TOML configuration files.
//!
//! # Example YAML configuration:
//! ```yaml
//! broker:
//!   buffer_length: 1024
//!
//! http_server:
//!   ip: "0.0.0.0"
//!   port: 10081
//!   cors: true
//!
//! connections:
//!   mqtt.local:
//!     server: "tcp://127.0.0.1:1883"
//!     qos: 1
//!
//! logging:
//!   level: info
//!   format: json
//! ```

use crate::connector::Params;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub broker: BrokerConfig,

    pub http_server: HttpServerConfig,

    /// Named shared connections, keyed by connection selector
    pub connections: IndexMap<String, IndexMap<String, serde_json::Value>>,

    pub mqtt: MqttDefaults,

    pub websocket: WebSocketDefaults,

    pub logging: LoggingConfig,

    /// Endpoints registered by `tideway serve`
    pub endpoints: EndpointsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Capacity of each consumer channel
    pub buffer_length: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            buffer_length: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpServerConfig {
    pub ip: String,

    /// Listening port, 0 picks a free one
    pub port: u16,

    pub tls: Option<TlsConfig>,

    pub cors: bool,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 10081,
            tls: None,
            cors: true,
        }
    }
}

impl HttpServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|e| ConfigError::ParseError(format!("http_server.ip {}: {}", self.ip, e)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttDefaults {
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    /// Capacity of the client request channel
    pub channel_capacity: usize,
}

impl Default for MqttDefaults {
    fn default() -> Self {
        Self {
            keep_alive_secs: 60,
            connect_timeout_secs: 5,
            channel_capacity: 10_000,
        }
    }
}

impl MqttDefaults {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketDefaults {
    /// Reconnect attempts after a client connection closes
    pub max_conn_retry: u32,
}

impl Default for WebSocketDefaults {
    fn default() -> Self {
        Self { max_conn_retry: 3 }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EndpointsConfig {
    pub push: Vec<PushEndpoint>,
    pub websocket: Vec<String>,
    pub sse: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEndpoint {
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
}

fn default_method() -> String {
    "POST".to_string()
}

impl RuntimeConfig {
    /// Load configuration from a file (YAML or TOML, auto-detected by extension)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => Self::from_yaml(&content).or_else(|_| Self::from_toml(&content)),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Properties of a named connection, stringified.
    pub fn connection_props(&self, selector: &str) -> Option<Params> {
        self.connections.get(selector).map(|props| {
            props
                .iter()
                .map(|(k, v)| {
                    let v = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect()
        })
    }

    pub fn example() -> Self {
        let mut mqtt_local = IndexMap::new();
        mqtt_local.insert(
            "server".to_string(),
            serde_json::Value::String("tcp://127.0.0.1:1883".to_string()),
        );
        mqtt_local.insert("qos".to_string(), serde_json::json!(1));
        let mut connections = IndexMap::new();
        connections.insert("mqtt.local".to_string(), mqtt_local);

        Self {
            broker: BrokerConfig::default(),
            http_server: HttpServerConfig::default(),
            connections,
            mqtt: MqttDefaults::default(),
            websocket: WebSocketDefaults::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "json".to_string(),
            },
            endpoints: EndpointsConfig {
                push: vec![PushEndpoint {
                    path: "/ingest".to_string(),
                    method: default_method(),
                }],
                websocket: vec!["/ws".to_string()],
                sse: vec!["/events".to_string()],
            },
        }
    }

    pub fn example_yaml() -> String {
        serde_yaml::to_string(&Self::example()).unwrap_or_default()
    }

    pub fn example_toml() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),
}

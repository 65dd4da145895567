//! Tideway CLI - runs the shared HTTP data server and broker for edge rules

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tideway_runtime::config::LoggingConfig;
use tideway_runtime::pubsub::Payload;
use tideway_runtime::{GlobalServerManager, RuntimeConfig, StreamContext, TableStore, TopicBroker};

#[derive(Parser)]
#[command(name = "tideway")]
#[command(author = "Tideway Contributors")]
#[command(version)]
#[command(about = "Tideway - edge stream runtime", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, global = true, env = "TIDEWAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the configured HTTP endpoints until interrupted
    Serve {
        /// Override http_server.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Keep a lookup table on a push endpoint, as PATH:KEY
        #[arg(long = "table", value_name = "PATH:KEY")]
        tables: Vec<String>,

        /// Write every frame received on a WebSocket endpoint back to its clients
        #[arg(long)]
        echo: bool,
    },

    /// Generate example configuration file
    ConfigGen {
        /// Output format (yaml, toml)
        #[arg(short, long, default_value = "yaml")]
        format: String,

        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a configuration file and print the effective settings
    Check,
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.format.eq_ignore_ascii_case("json") {
        builder.json().try_init().map_err(|e| anyhow::anyhow!(e))?;
    } else {
        builder.try_init().map_err(|e| anyhow::anyhow!(e))?;
    }
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig> {
    Ok(match path {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, tables, echo } => {
            let mut config = load_config(cli.config.as_ref())?;
            if let Some(port) = port {
                config.http_server.port = port;
            }
            init_logging(&config.logging)?;
            serve(config, &tables, echo).await?;
        }

        Commands::ConfigGen { format, output } => {
            let content = match format.to_lowercase().as_str() {
                "yaml" | "yml" => RuntimeConfig::example_yaml(),
                "toml" => RuntimeConfig::example_toml(),
                _ => anyhow::bail!("Unsupported format: {}. Use 'yaml' or 'toml'", format),
            };

            if let Some(path) = output {
                std::fs::write(&path, &content)?;
                println!("Configuration written to: {}", path.display());
            } else {
                println!("{}", content);
            }
        }

        Commands::Check => {
            let config = load_config(cli.config.as_ref())?;
            let addr = config.http_server.socket_addr()?;
            println!("Configuration OK");
            println!("  http server:  {}", addr);
            println!("  connections:  {}", config.connections.len());
            println!("  push:         {}", config.endpoints.push.len());
            println!("  websocket:    {}", config.endpoints.websocket.len());
            println!("  sse:          {}", config.endpoints.sse.len());
        }
    }

    Ok(())
}

fn parse_table(spec: &str) -> Result<(&str, &str)> {
    match spec.rsplit_once(':') {
        Some((path, key)) if !path.is_empty() && !key.is_empty() => Ok((path, key)),
        _ => anyhow::bail!("Invalid table {}: expected PATH:KEY", spec),
    }
}

/// Log everything arriving on `topic` until the channel closes.
fn monitor(broker: &TopicBroker, topic: &str, consumer_id: &str, buffer: usize) -> Result<()> {
    let mut rx = broker.create_sub(topic, false, consumer_id, buffer)?;
    let topic = topic.to_string();
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            match payload {
                Payload::Tuple(t) => info!(topic = %topic, "received {}", t.to_json()),
                Payload::List(list) => info!(topic = %topic, "received {} rows", list.len()),
                Payload::Bytes(b) => info!(topic = %topic, "received {} bytes", b.len()),
                Payload::Error(e) => warn!(topic = %topic, "received error: {}", e),
            }
        }
    });
    Ok(())
}

/// Copies every payload from a WebSocket endpoint's recv topic to its send
/// topic. Holds one consumer on `recv` and one publisher on `send`.
struct Echo {
    recv: String,
    send: String,
}

impl Echo {
    const CONSUMER_ID: &'static str = "cli_echo";

    fn start(
        broker: &Arc<TopicBroker>,
        ctx: &StreamContext,
        recv: &str,
        send: &str,
        buffer: usize,
    ) -> Result<Self> {
        let mut rx = broker.create_sub(recv, false, Self::CONSUMER_ID, buffer)?;
        broker.create_pub(send);
        let task_broker = broker.clone();
        let ctx = ctx.clone();
        let topic = send.to_string();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                task_broker.produce_any(&ctx, &topic, payload);
            }
        });
        Ok(Self {
            recv: recv.to_string(),
            send: send.to_string(),
        })
    }

    fn stop(self, broker: &TopicBroker) {
        broker.close_source_consumer_channel(&self.recv, Self::CONSUMER_ID);
        broker.remove_pub(&self.send);
    }
}

async fn serve(config: RuntimeConfig, tables: &[String], echo: bool) -> Result<()> {
    let broker = TopicBroker::global();
    let buffer = config.broker.buffer_length;
    let store = TableStore::new(broker.clone(), buffer);
    let manager = GlobalServerManager::new(broker.clone(), config.http_server.clone());
    let ctx = StreamContext::new("tideway", "serve", 0);

    let mut push = Vec::new();
    for endpoint in &config.endpoints.push {
        let topic = manager.register_endpoint(&endpoint.path, &endpoint.method)?;
        monitor(&broker, &topic, "cli_monitor", buffer)?;
        push.push((endpoint.clone(), topic));
    }

    let mut registered_tables = Vec::new();
    for spec in tables {
        let (path, key) = parse_table(spec)?;
        let Some((_, topic)) = push
            .iter()
            .find(|(e, _)| e.path.trim_start_matches('/') == path.trim_start_matches('/'))
        else {
            anyhow::bail!("Table {} does not name a configured push endpoint", spec);
        };
        store.reg(topic, false, key)?;
        registered_tables.push((topic.clone(), key.to_string()));
    }

    let mut echoes = Vec::new();
    for path in &config.endpoints.websocket {
        let (recv, send) = manager.register_websocket_endpoint(&ctx, path)?;
        if echo {
            echoes.push(Echo::start(&broker, &ctx, &recv, &send, buffer)?);
        } else {
            monitor(&broker, &recv, "cli_monitor", buffer)?;
        }
    }

    for path in &config.endpoints.sse {
        let topic = manager.register_sse_endpoint(&ctx, path)?;
        info!("Rules may publish on {} to stream to {}", topic, path);
    }

    match manager.local_addr() {
        Some(addr) => info!("Tideway serving on {}", addr),
        None => warn!("No endpoints configured, nothing to serve"),
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    for echo in echoes {
        echo.stop(&broker);
    }
    for (topic, key) in &registered_tables {
        store.unreg(topic, key)?;
    }
    for (endpoint, _) in &push {
        manager.unregister_endpoint(&endpoint.path, &endpoint.method).await?;
    }
    for path in &config.endpoints.websocket {
        manager.unregister_websocket_endpoint(path).await?;
    }
    for path in &config.endpoints.sse {
        manager.unregister_sse_endpoint(path).await?;
    }
    info!("Tideway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table() {
        assert_eq!(parse_table("/devices:id").unwrap(), ("/devices", "id"));
        assert!(parse_table("devices").is_err());
        assert!(parse_table(":id").is_err());
    }

    #[tokio::test]
    async fn test_echo_copies_and_releases_topics() {
        let broker = Arc::new(TopicBroker::new());
        let ctx = StreamContext::new("tideway", "serve", 0);
        broker.create_pub("in");
        let echo = Echo::start(&broker, &ctx, "in", "out", 4).unwrap();
        let mut out = broker.create_sub("out", false, "client", 4).unwrap();

        broker.produce_bytes(&ctx, "in", "hello".into());
        let payload = tokio::time::timeout(std::time::Duration::from_secs(5), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(payload, Payload::Bytes(b) if &b[..] == b"hello"));

        echo.stop(&broker);
        assert_eq!(broker.consumer_count("in"), 0);
        broker.close_source_consumer_channel("out", "client");
        assert!(!broker.has_topic("out"));
    }

    #[test]
    fn test_cli_parses_serve() {
        let cli = Cli::parse_from(["tideway", "serve", "--port", "9000", "--table", "/d:id"]);
        match cli.command {
            Commands::Serve { port, tables, echo } => {
                assert_eq!(port, Some(9000));
                assert_eq!(tables, vec!["/d:id".to_string()]);
                assert!(!echo);
            }
            _ => panic!("expected serve"),
        }
    }
}

//! # nodecast-broker
//!
//! Broker binary: loads configuration, registers the built-in node types,
//! and serves the channel protocol on a TCP and a WebSocket listener until
//! Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use nodecast_core::logging::{LogFormat, init_subscriber};
use nodecast_core::node_types::builtin_registry;
use nodecast_core::{EchoPolicy, NodeManager};
use nodecast_rpc::MethodRegistry;
use nodecast_server::{Disposer, ServerConfig};

/// Channel pub/sub broker.
#[derive(Parser, Debug)]
#[command(name = "nodecast-broker", about = "Channel pub/sub broker", version)]
struct Cli {
    /// JSON config file merged over the defaults.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Host for both listeners.
    #[arg(long)]
    host: Option<String>,

    /// Raw TCP listener port.
    #[arg(long)]
    socket_port: Option<u16>,

    /// WebSocket listener port.
    #[arg(long)]
    ws_port: Option<u16>,

    /// Name reported to clients by `serverConnect`.
    #[arg(long)]
    name: Option<String>,

    /// Whether senders receive their own channel updates.
    #[arg(long)]
    echo_policy: Option<EchoPolicy>,

    /// Log level (overridden by `RUST_LOG`).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format (`compact` or `json`).
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,
}

impl Cli {
    /// Flags win over file and environment.
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.socket.host.clone_from(host);
            config.websocket.host.clone_from(host);
        }
        if let Some(port) = self.socket_port {
            config.socket.port = port;
        }
        if let Some(port) = self.ws_port {
            config.websocket.port = port;
        }
        if let Some(name) = &self.name {
            config.process_name.clone_from(name);
        }
        if let Some(policy) = self.echo_policy {
            config.echo_policy = policy;
        }
    }
}

/// Wire the node manager, method table, and listeners together.
fn build_disposer(config: ServerConfig) -> Disposer {
    let nodes = Arc::new(NodeManager::new(builtin_registry()));
    let mut registry = MethodRegistry::new();
    nodecast_rpc::handlers::register_all(&mut registry);
    Disposer::new(config, nodes, registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_subscriber(&args.log_level, args.log_format);

    let mut config = ServerConfig::load(args.config.as_deref()).with_context(|| {
        match &args.config {
            Some(path) => format!("Failed to load config from {}", path.display()),
            None => "Failed to load config".to_owned(),
        }
    })?;
    args.apply(&mut config);

    let mut disposer = build_disposer(config);
    match nodecast_server::metrics::install_recorder() {
        Ok(handle) => disposer = disposer.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "metrics disabled"),
    }

    let addrs = disposer
        .listen()
        .await
        .context("Failed to bind listeners")?;
    tracing::info!(
        socket = %addrs.socket,
        websocket = %addrs.websocket,
        node_types = ?disposer.context().nodes.node_types(),
        "nodecast broker ready"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !disposer.stop().await {
        tracing::warn!("listeners did not stop in time");
    }
    let closed = disposer.disconnect_all().await;
    disposer.context().nodes.shutdown();

    tracing::info!(clients_closed = closed, "Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["nodecast-broker"]);
        assert!(cli.config.is_none());
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.log_format, LogFormat::Compact);

        let mut config = ServerConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.socket.port, 6900);
        assert_eq!(config.websocket.port, 6901);
    }

    #[test]
    fn cli_flags_override_config() {
        let cli = Cli::parse_from([
            "nodecast-broker",
            "--host",
            "0.0.0.0",
            "--socket-port",
            "7100",
            "--ws-port",
            "7101",
            "--name",
            "edge",
            "--echo-policy",
            "include_origin",
            "--log-format",
            "json",
        ]);
        let mut config = ServerConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.socket.addr(), "0.0.0.0:7100");
        assert_eq!(config.websocket.addr(), "0.0.0.0:7101");
        assert_eq!(config.process_name, "edge");
        assert_eq!(config.echo_policy, EchoPolicy::IncludeOrigin);
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn cli_rejects_bad_echo_policy() {
        assert!(Cli::try_parse_from(["nodecast-broker", "--echo-policy", "loud"]).is_err());
    }

    #[test]
    fn registers_every_method() {
        let mut registry = MethodRegistry::new();
        nodecast_rpc::handlers::register_all(&mut registry);
        assert_eq!(registry.methods().len(), nodecast_rpc::Method::ALL.len());
    }

    #[tokio::test]
    async fn broker_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodecast.json");
        std::fs::write(
            &path,
            r#"{"processName": "boot", "socket": {"port": 0}, "websocket": {"port": 0}}"#,
        )
        .unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        let disposer = build_disposer(config);
        let addrs = disposer.listen().await.unwrap();
        assert_ne!(addrs.socket, addrs.websocket);
        assert_eq!(disposer.context().server_name, "boot");

        tokio::time::timeout(std::time::Duration::from_secs(5), disposer.stop())
            .await
            .expect("shutdown timed out");
    }
}

//! # beacon-gateway
//!
//! Gateway server binary — wires the broker, auth gate, and gateway server
//! together and runs until interrupted.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use beacon_bridge::{Broker, MemoryBroker, RedisBroker};
use beacon_core::auth::{AllowAllAuthorizer, AuthGate, RoomAuthorizer, StaticTokenGate};
use beacon_server::config::GatewayConfig;
use beacon_server::metrics;
use beacon_server::server::GatewayServer;

/// Beacon gateway server.
#[derive(Parser, Debug)]
#[command(name = "beacon-gateway", about = "Real-time notification gateway")]
struct Cli {
    /// Host to bind (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides config; 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Redis URL for cross-process fan-out (overrides config). Without
    /// one, the in-memory broker serves this process only.
    #[arg(long)]
    redis_url: Option<String>,

    /// Path to the gateway config JSON.
    #[arg(long, default_value = "beacon.json")]
    config: PathBuf,

    /// Path to a JSON map of `token → userId` for the development auth
    /// gate. Production deployments inject the platform's real gate.
    #[arg(long)]
    auth_tokens: Option<PathBuf>,
}

/// Load the development token map.
fn load_token_map(path: &Path) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read token file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid token file {}", path.display()))
}

fn build_auth_gate(cli: &Cli) -> Result<Arc<dyn AuthGate>> {
    match cli.auth_tokens.as_ref() {
        Some(path) => {
            let tokens = load_token_map(path)?;
            info!(tokens = tokens.len(), path = %path.display(), "static token gate loaded");
            Ok(Arc::new(StaticTokenGate::new(tokens)))
        }
        None => {
            warn!("no --auth-tokens file; every handshake will be rejected");
            Ok(Arc::new(StaticTokenGate::default()))
        }
    }
}

fn build_broker(config: &GatewayConfig) -> Result<Arc<dyn Broker>> {
    match config.redis_url.as_deref() {
        Some(url) => {
            info!(url, "using redis broker");
            let broker = RedisBroker::new(url)
                .with_context(|| format!("invalid redis url {url}"))?;
            Ok(Arc::new(broker))
        }
        None => {
            info!("no redis url configured; using in-memory broker (single process)");
            Ok(Arc::new(MemoryBroker::default()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config =
        GatewayConfig::load_from_path(&args.config).context("failed to load gateway config")?;
    if let Some(host) = args.host.clone() {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(url) = args.redis_url.clone() {
        config.redis_url = Some(url);
    }

    let metrics_handle = metrics::install_recorder();
    let auth = build_auth_gate(&args)?;
    let authorizer: Arc<dyn RoomAuthorizer> = Arc::new(AllowAllAuthorizer);
    let broker = build_broker(&config)?;

    let server = GatewayServer::new(config, broker, auth, authorizer, Some(metrics_handle));
    let (addr, handle) = server.listen().await.context("failed to bind server")?;
    info!("beacon gateway listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down...");
    server.graceful_shutdown(None).await;
    let _ = handle.await;
    info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["beacon-gateway"]);
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
        assert!(cli.redis_url.is_none());
        assert_eq!(cli.config, PathBuf::from("beacon.json"));
    }

    #[test]
    fn cli_overrides() {
        let cli = Cli::parse_from([
            "beacon-gateway",
            "--host",
            "0.0.0.0",
            "--port",
            "9000",
            "--redis-url",
            "redis://localhost:6379",
        ]);
        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.redis_url.as_deref(), Some("redis://localhost:6379"));
    }

    #[test]
    fn token_map_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, r#"{"tok-a": "user_a", "tok-b": "user_b"}"#).unwrap();

        let tokens = load_token_map(&path).unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens["tok-a"], "user_a");
    }

    #[test]
    fn invalid_token_map_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_token_map(&path).is_err());
    }

    #[test]
    fn missing_token_map_is_error() {
        assert!(load_token_map(Path::new("/nonexistent/tokens.json")).is_err());
    }

    #[test]
    fn broker_selection_prefers_redis_url() {
        let config = GatewayConfig {
            redis_url: Some("redis://127.0.0.1:6379".into()),
            ..GatewayConfig::default()
        };
        assert!(build_broker(&config).is_ok());

        let config = GatewayConfig::default();
        assert!(build_broker(&config).is_ok());
    }

    #[test]
    fn bad_redis_url_is_error() {
        let config = GatewayConfig {
            redis_url: Some("definitely not a url".into()),
            ..GatewayConfig::default()
        };
        assert!(build_broker(&config).is_err());
    }
}

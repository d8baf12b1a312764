//! # Portico CLI Entry Point
//!
//! Main binary for the Portico gateway system. Starts either the gateway
//! itself or a demo backend node.
//!
//! ## Usage
//!
//! ```bash
//! # Start the gateway fronting the "fingerprints" service
//! portico gateway -b 0.0.0.0:8080 --service fingerprints \
//!   --store http://127.0.0.1:2379 \
//!   --route /lookup=lookup --route /report=report
//!
//! # Start a demo backend node for the same service
//! portico backend -b 0.0.0.0:0 --service fingerprints \
//!   --store http://127.0.0.1:2379
//! ```
//!
//! Store URLs must include the `http://` or `https://` prefix.

use anyhow::Result;
use argh::FromArgs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use portico_backend::{BackendConfig, BackendNode, EchoService};
use portico_gateway::{GatewayConfig, GatewayServer, PoolConfig, RoutingTable};
use portico_registry::HttpCoordinationStore;

fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Invalid {}: '{}' must start with http:// or https://",
            description,
            url
        ))
    }
}

/// Parses a `--route /path=method` mapping.
fn parse_route(mapping: &str) -> Result<(String, String)> {
    let (path, method) = mapping
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Invalid route '{}': expected /path=method", mapping))?;
    if !path.starts_with('/') {
        return Err(anyhow::anyhow!(
            "Invalid route '{}': path must start with '/'",
            mapping
        ));
    }
    if method.is_empty() {
        return Err(anyhow::anyhow!("Invalid route '{}': empty method", mapping));
    }
    Ok((path.to_string(), method.to_string()))
}

#[derive(FromArgs)]
/// Portico - API gateway for dynamically-registered RPC backends
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Gateway(GatewayArgs),
    Backend(BackendArgs),
}

/// Arguments for starting the gateway.
///
/// The gateway watches the coordination store for backends registered under
/// the service name, load-balances across them, and exposes one HTTP POST
/// route per `--route` mapping.
#[derive(FromArgs)]
#[argh(subcommand, name = "gateway")]
/// start the Portico gateway
struct GatewayArgs {
    /// address to bind the gateway's HTTP server to
    #[argh(option, short = 'b', default = "\"0.0.0.0:8080\".into()")]
    bind: String,

    /// service name whose backends the gateway fronts
    #[argh(option, long = "service")]
    service: String,

    /// coordination store URL; repeat for fallback stores
    ///
    /// Must include the http:// or https:// prefix.
    #[argh(option, long = "store")]
    stores: Vec<String>,

    /// route mapping as /path=method; repeat per route
    #[argh(option, long = "route")]
    routes: Vec<String>,

    /// header carrying the client idempotency key
    #[argh(option, long = "request-id-header", default = "\"x-request-id\".into()")]
    request_id_header: String,

    /// header overriding the client address in logs
    #[argh(option, long = "real-ip-header", default = "\"x-real-ip\".into()")]
    real_ip_header: String,

    /// seconds a completed request ID keeps rejecting duplicates
    #[argh(option, long = "retention-secs", default = "300")]
    retention_secs: u64,

    /// consecutive transport failures before a backend is unhealthy
    #[argh(option, long = "failure-threshold", default = "3")]
    failure_threshold: u32,

    /// seconds an unhealthy backend sits out before a half-open probe
    #[argh(option, long = "cooldown-secs", default = "30")]
    cooldown_secs: u64,

    /// per-call backend timeout in milliseconds
    #[argh(option, long = "request-timeout-ms", default = "30000")]
    request_timeout_ms: u64,

    /// path exempt from idempotency checking; repeatable
    #[argh(option, long = "no-dedup-path")]
    no_dedup_paths: Vec<String>,

    /// path exempt from request logging; repeatable
    #[argh(option, long = "no-log-path")]
    no_log_paths: Vec<String>,
}

/// Arguments for starting a demo backend node.
///
/// The node serves the built-in echo service over JSON-RPC, registers its
/// address into the coordination store on startup, re-registers on a
/// heartbeat, and deregisters on shutdown. Real deployments embed
/// `portico-backend` as a library and supply their own service trait
/// implementation.
#[derive(FromArgs)]
#[argh(subcommand, name = "backend")]
/// start a demo backend node
struct BackendArgs {
    /// address to bind the node's HTTP server to
    ///
    /// Defaults to "0.0.0.0:0" which assigns a random available port.
    #[argh(option, short = 'b', default = "\"0.0.0.0:0\".into()")]
    bind: String,

    /// service name to register under
    #[argh(option, long = "service")]
    service: String,

    /// coordination store URL; repeat for fallback stores
    ///
    /// Must include the http:// or https:// prefix.
    #[argh(option, long = "store")]
    stores: Vec<String>,

    /// address to advertise in the registration
    ///
    /// Defaults to the actual bound address, which works for port-0 binds
    /// on a reachable interface.
    #[argh(option, long = "advertise")]
    advertise: Option<String>,

    /// seconds between re-registration heartbeats
    #[argh(option, long = "heartbeat-secs", default = "10")]
    heartbeat_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();

    match cli.command {
        Commands::Gateway(args) => run_gateway(args).await,
        Commands::Backend(args) => run_backend(args).await,
    }
}

async fn run_gateway(args: GatewayArgs) -> Result<()> {
    if args.stores.is_empty() {
        return Err(anyhow::anyhow!("at least one --store URL is required"));
    }
    for url in &args.stores {
        validate_http_url(url, "store URL")?;
    }
    if args.routes.is_empty() {
        return Err(anyhow::anyhow!("at least one --route mapping is required"));
    }

    let mut table = RoutingTable::new();
    for mapping in &args.routes {
        let (path, method) = parse_route(mapping)?;
        table.insert(path, method);
    }

    let listen_addr: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", args.bind, e))?;

    let mut config = GatewayConfig::new(listen_addr, args.service);
    config.routes = table;
    config.request_id_header = args.request_id_header;
    config.real_ip_header = args.real_ip_header;
    config.retention = Duration::from_secs(args.retention_secs);
    config.pool = PoolConfig {
        failure_threshold: args.failure_threshold,
        cooldown: Duration::from_secs(args.cooldown_secs),
        request_timeout: Duration::from_millis(args.request_timeout_ms),
    };
    config.idempotency_excluded_paths = args.no_dedup_paths;
    config.observability_excluded_paths = args.no_log_paths;

    tracing::info!("Starting Portico gateway on {}", listen_addr);
    let store = Arc::new(HttpCoordinationStore::new(args.stores));
    let server = GatewayServer::new(config, store);
    server.serve().await?;
    Ok(())
}

async fn run_backend(args: BackendArgs) -> Result<()> {
    if args.stores.is_empty() {
        return Err(anyhow::anyhow!("at least one --store URL is required"));
    }
    for url in &args.stores {
        validate_http_url(url, "store URL")?;
    }

    let listen_addr: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", args.bind, e))?;

    let mut config = BackendConfig::new(listen_addr, args.service);
    config.advertise_addr = args.advertise;
    config.heartbeat = Duration::from_secs(args.heartbeat_secs);

    tracing::info!("Starting Portico backend on {}", listen_addr);
    let store = Arc::new(HttpCoordinationStore::new(args.stores));
    let node = BackendNode::new(config, store, Arc::new(EchoService));
    node.run(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_gateway() {
        let args: Cli = Cli::from_args(
            &["portico"],
            &[
                "gateway",
                "--service",
                "fingerprints",
                "--store",
                "http://127.0.0.1:2379",
                "--route",
                "/lookup=lookup",
                "--route",
                "/report=report",
            ],
        )
        .unwrap();
        match args.command {
            Commands::Gateway(GatewayArgs {
                bind,
                service,
                stores,
                routes,
                retention_secs,
                failure_threshold,
                ..
            }) => {
                assert_eq!(bind, "0.0.0.0:8080"); // default
                assert_eq!(service, "fingerprints");
                assert_eq!(stores, vec!["http://127.0.0.1:2379".to_string()]);
                assert_eq!(routes.len(), 2);
                assert_eq!(retention_secs, 300); // default
                assert_eq!(failure_threshold, 3); // default
            }
            _ => panic!("Expected Gateway command"),
        }
    }

    #[test]
    fn test_cli_parse_gateway_exclusions() {
        let args: Cli = Cli::from_args(
            &["portico"],
            &[
                "gateway",
                "--service",
                "svc",
                "--store",
                "http://127.0.0.1:2379",
                "--route",
                "/lookup=lookup",
                "--no-dedup-path",
                "/lookup",
                "--no-log-path",
                "/health",
            ],
        )
        .unwrap();
        match args.command {
            Commands::Gateway(GatewayArgs {
                no_dedup_paths,
                no_log_paths,
                ..
            }) => {
                assert_eq!(no_dedup_paths, vec!["/lookup".to_string()]);
                assert_eq!(no_log_paths, vec!["/health".to_string()]);
            }
            _ => panic!("Expected Gateway command"),
        }
    }

    #[test]
    fn test_cli_parse_backend() {
        let args: Cli = Cli::from_args(
            &["portico"],
            &[
                "backend",
                "-b",
                "0.0.0.0:9001",
                "--service",
                "fingerprints",
                "--store",
                "http://127.0.0.1:2379",
                "--advertise",
                "10.0.0.1:9001",
            ],
        )
        .unwrap();
        match args.command {
            Commands::Backend(BackendArgs {
                bind,
                service,
                stores,
                advertise,
                heartbeat_secs,
            }) => {
                assert_eq!(bind, "0.0.0.0:9001");
                assert_eq!(service, "fingerprints");
                assert_eq!(stores.len(), 1);
                assert_eq!(advertise, Some("10.0.0.1:9001".to_string()));
                assert_eq!(heartbeat_secs, 10); // default
            }
            _ => panic!("Expected Backend command"),
        }
    }

    #[test]
    fn test_parse_route() {
        assert_eq!(
            parse_route("/lookup=lookup").unwrap(),
            ("/lookup".to_string(), "lookup".to_string())
        );
        assert!(parse_route("lookup=lookup").is_err());
        assert!(parse_route("/lookup").is_err());
        assert!(parse_route("/lookup=").is_err());
    }

    #[test]
    fn test_validate_http_url() {
        assert!(validate_http_url("http://127.0.0.1:2379", "store URL").is_ok());
        assert!(validate_http_url("https://example.com", "store URL").is_ok());
        assert!(validate_http_url("127.0.0.1:2379", "store URL").is_err());
    }
}

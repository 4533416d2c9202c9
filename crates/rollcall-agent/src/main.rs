//! Rollcall Agent
//!
//! Announces a service to the registry until interrupted, or resolves one
//! and prints its nodes as JSON.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use rollcall_client::observability::{init_tracing, TracingConfig};
use rollcall_client::{default_plugins, Node, Registry, RegistryConfig, Service};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rollcall-agent")]
#[command(about = "Announce and resolve services through a rollcall registry")]
struct Cli {
    #[command(flatten)]
    registry: RegistryArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RegistryArgs {
    /// Backend plugin to use (etcd or memory)
    #[arg(long, env = "REGISTRY_BACKEND", default_value = "etcd", global = true)]
    backend: String,

    /// etcd endpoints (comma-separated)
    #[arg(long, env = "ETCD_ENDPOINTS", value_delimiter = ',', global = true)]
    endpoints: Vec<String>,

    /// Root path of the service keys
    #[arg(long, env = "REGISTRY_PATH", global = true)]
    register_path: Option<String>,

    /// Lease TTL in seconds
    #[arg(long, env = "REGISTRY_HEARTBEAT", global = true)]
    heartbeat: Option<i64>,

    /// Per-call backend timeout in milliseconds
    #[arg(long, env = "REGISTRY_TIMEOUT_MS", global = true)]
    timeout_ms: Option<u64>,

    /// Invalidate cached services when the backend reports changes
    #[arg(long, global = true)]
    watch: bool,

    /// Log output format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text", global = true)]
    log_format: String,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a service and keep it alive until Ctrl-C
    Announce {
        /// Service name
        #[arg(long)]
        name: String,

        /// Node as `[id@]address:port`; repeat for several nodes
        #[arg(long = "node", required = true)]
        nodes: Vec<String>,
    },
    /// Print the nodes of a service as JSON
    Resolve {
        /// Service name
        #[arg(long)]
        name: String,
    },
}

impl RegistryArgs {
    fn config(&self) -> RegistryConfig {
        let mut config = RegistryConfig::from_env();
        if !self.endpoints.is_empty() {
            config.options.addresses = self.endpoints.clone();
        }
        if let Some(path) = &self.register_path {
            config.options.register_path = path.clone();
        }
        if let Some(heartbeat) = self.heartbeat {
            config.options.heartbeat = heartbeat;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.options.timeout = Duration::from_millis(timeout_ms);
        }
        config.watch_invalidation = self.watch;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(TracingConfig::with_format(&cli.registry.log_format))
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to initialize tracing")?;

    if let Some(addr) = cli.registry.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .with_context(|| format!("Failed to start metrics exporter on {addr}"))?;
        info!(%addr, "Serving Prometheus metrics");
    }

    let config = cli.registry.config();
    let plugins = default_plugins(&config);
    info!(
        backend = %cli.registry.backend,
        endpoints = ?config.options.addresses,
        register_path = %config.options.register_path,
        "Connecting to registry"
    );
    let registry = Registry::connect(&plugins, &cli.registry.backend, config)
        .await
        .with_context(|| format!("Failed to connect to {} backend", cli.registry.backend))?;

    match cli.command {
        Commands::Announce { name, nodes } => announce(&registry, name, &nodes).await?,
        Commands::Resolve { name } => resolve(&registry, &name).await?,
    }

    registry.shutdown().await;
    Ok(())
}

async fn announce(registry: &Registry, name: String, nodes: &[String]) -> anyhow::Result<()> {
    let nodes = nodes
        .iter()
        .map(|spec| parse_node(spec))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let node_count = nodes.len();
    registry
        .register(Service::new(name.clone(), nodes))
        .with_context(|| format!("Failed to register {name}"))?;
    info!(service = %name, nodes = node_count, "Announcing, press Ctrl-C to stop");

    let mut status = registry.watch_registrations();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    warn!("Coordinator stopped unexpectedly");
                    break;
                }
                for entry in status.borrow_and_update().iter() {
                    if let Some(error) = &entry.last_error {
                        warn!(service = %entry.service, error = %error, "Registration not healthy");
                    }
                }
            }
        }
    }

    // Keys go away when `shutdown` revokes the lease.
    Ok(())
}

async fn resolve(registry: &Registry, name: &str) -> anyhow::Result<()> {
    let nodes = registry
        .get_service(name)
        .await
        .with_context(|| format!("Failed to resolve {name}"))?;
    println!("{}", serde_json::to_string_pretty(nodes.as_ref())?);
    Ok(())
}

/// Parse `[id@]address:port`; a missing id gets a random one.
fn parse_node(spec: &str) -> anyhow::Result<Node> {
    let (id, endpoint) = match spec.split_once('@') {
        Some((id, endpoint)) => (id.to_string(), endpoint),
        None => (format!("node-{}", uuid::Uuid::new_v4()), spec),
    };
    let Some((address, port)) = endpoint.rsplit_once(':') else {
        bail!("node {spec:?} is missing a port");
    };
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port in node {spec:?}"))?;
    Ok(Node::new(id, address, port))
}

//! CIRA broker server
//!
//! One binary runs one broker instance. The deployment mode picks which
//! listeners it starts: tunnel-terminating instances accept device CIRA
//! tunnels and answer forward requests from peers, routing-tier instances
//! resolve lookups against the shared directory, passive instances
//! terminate tunnels without serving lookups.

mod acceptor;
mod tls;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cira_broker::{Broker, DeploymentMode};
use cira_directory::{MemoryDirectory, OwnershipDirectory, RedisDirectory};
use cira_forward::{ForwardServer, TcpForwarder};

use crate::acceptor::TunnelAcceptor;

/// CIRA broker - terminates device tunnels and routes management traffic
#[derive(Parser, Debug)]
#[command(name = "cira-relay")]
#[command(about = "Run a CIRA broker instance", long_about = None)]
struct Args {
    /// Deployment mode (tunnel-terminating, routing-tier, passive)
    #[arg(long, default_value = "tunnel-terminating")]
    mode: String,

    /// Instance identifier published to the ownership directory
    /// Defaults to the machine hostname
    #[arg(long, env = "CIRA_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Device tunnel bind address
    #[arg(long, default_value = "0.0.0.0:4433")]
    tunnel_addr: String,

    /// Inter-instance forward bind address
    #[arg(long, default_value = "0.0.0.0:4434")]
    forward_addr: String,

    /// Forward address advertised to peer instances
    /// Defaults to the forward bind address; set this when peers reach
    /// this instance through a different address
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Redis URL for the shared ownership directory
    /// Without it the instance keeps an in-memory directory
    #[arg(long, env = "CIRA_REDIS_URL")]
    redis_url: Option<String>,

    /// Shared token devices must present in their hello
    #[arg(long, env = "CIRA_DEVICE_TOKEN")]
    device_token: Option<String>,

    /// TLS certificate file path (PEM format, for the device tunnel listener)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// TLS private key file path (PEM format, for the device tunnel listener)
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Keepalive interval for device tunnels in seconds (0 disables)
    #[arg(long, default_value = "30")]
    keepalive_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (required for TLS)
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .unwrap();

    let args = Args::parse();

    init_logging(&args.log_level)?;

    let mode: DeploymentMode = args.mode.parse()?;
    let instance_id = args
        .instance_id
        .clone()
        .unwrap_or_else(default_instance_id);

    info!("🚀 Starting CIRA broker '{}' in {} mode", instance_id, mode);

    let directory: Arc<dyn OwnershipDirectory> = match args.redis_url.as_deref() {
        Some(url) => {
            info!("Connecting to ownership directory: {}", url);
            Arc::new(RedisDirectory::connect(url).await?)
        }
        None => {
            warn!("⚠️  No --redis-url given, using in-memory directory (single instance only)");
            Arc::new(MemoryDirectory::new())
        }
    };

    let mut broker = match mode {
        DeploymentMode::TunnelTerminating => Broker::tunnel_terminating(instance_id, directory),
        DeploymentMode::RoutingTier => {
            Broker::routing_tier(instance_id, directory, Arc::new(TcpForwarder::new()))
        }
        DeploymentMode::Passive => Broker::passive(instance_id, directory),
    };

    if mode.terminates_tunnels() {
        let advertised = args
            .advertise_addr
            .clone()
            .unwrap_or_else(|| args.forward_addr.clone());
        broker = broker.with_forward_addr(advertised);
        if args.keepalive_secs > 0 {
            broker = broker.with_keepalive(Duration::from_secs(args.keepalive_secs));
        }
    }

    broker.start().await?;

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if mode.terminates_tunnels() {
        let forward_addr: SocketAddr = args.forward_addr.parse()?;
        let forward = ForwardServer::bind(forward_addr, broker.registry().clone()).await?;
        tasks.push(tokio::spawn(forward.serve()));

        let tunnel_addr: SocketAddr = args.tunnel_addr.parse()?;
        let mut acceptor = TunnelAcceptor::bind(tunnel_addr, broker.clone()).await?;
        if let Some(token) = args.device_token.clone() {
            acceptor = acceptor.with_token(token);
        }
        match (args.tls_cert.as_deref(), args.tls_key.as_deref()) {
            (Some(cert), Some(key)) => {
                acceptor = acceptor.with_tls(tls::load_tls_acceptor(cert, key)?);
                info!("🔐 TLS enabled for device tunnels");
            }
            (None, None) => {
                warn!("⚠️  No TLS certificate given, device tunnels are unencrypted");
            }
            _ => {
                anyhow::bail!("--tls-cert and --tls-key must be given together");
            }
        }
        tasks.push(tokio::spawn(acceptor.serve()));
    }

    info!("✅ CIRA broker is running");
    info!("Press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(err) => {
            error!("Error listening for shutdown signal: {}", err);
        }
    }

    for task in tasks {
        task.abort();
    }
    broker.shutdown().await;
    info!("✅ CIRA broker stopped");

    Ok(())
}

fn default_instance_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "cira-broker".to_string())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

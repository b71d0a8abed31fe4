//! tierfs master daemon.
//!
//! Keeps the list of storage groups and their members and answers
//! placement queries:
//! - Registration of storage nodes and peer lists per group
//! - Upload placement by free space across groups
//! - Download placement within a group
//!
//! Usage:
//!   masterd [OPTIONS]

mod handler;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tierfs_core::{Acceptor, ConnectionConfig};
use tierfs_proto::constants::MASTER_LISTEN_PORT;
use tierfs_proto::defaults::{DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_HEARTBEAT_TIMEOUT_SECS};
use tracing::{error, info};

/// tierfs master daemon
#[derive(Parser, Debug)]
#[command(name = "masterd", version, about = "tierfs master daemon")]
struct Args {
    /// Listen address
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind_addr: IpAddr,

    /// Listen port
    #[arg(short = 'p', long, default_value_t = MASTER_LISTEN_PORT)]
    port: u16,

    /// Heartbeat timeout in seconds
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_TIMEOUT_SECS)]
    heartbeat_timeout: u64,

    /// Heartbeat interval in seconds
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL_SECS)]
    heartbeat_interval: u64,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("masterd v{} starting", env!("CARGO_PKG_VERSION"));

    if args.heartbeat_timeout == 0 || args.heartbeat_interval == 0 {
        error!("heartbeat timeout and interval must be non-zero");
        std::process::exit(1);
    }

    let listen_addr = SocketAddr::new(args.bind_addr, args.port);
    let conn_cfg = ConnectionConfig {
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout),
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
        ..ConnectionConfig::default()
    };

    let acceptor = match Acceptor::bind(listen_addr, conn_cfg).await {
        Ok(a) => a,
        Err(e) => {
            error!("failed to listen on {}: {}", listen_addr, e);
            std::process::exit(1);
        }
    };
    info!("masterd listening on {}", acceptor.local_addr());

    let master = Arc::new(handler::MasterHandler::new());

    tokio::select! {
        _ = handler::accept_loop(master, &acceptor) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c");
        }
    }

    acceptor.shutdown();
    info!("masterd stopped");
}

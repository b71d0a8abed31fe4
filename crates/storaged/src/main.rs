//! tierfs storage daemon.
//!
//! Stores files in a hot and a cold tier, replicates new uploads to the
//! other members of its group and migrates files between tiers.
//!
//! Usage:
//!   storaged --hot <DIR>... [--cold <DIR>...] -g <GROUP> [OPTIONS]
//!
//! The daemon runs on a tokio runtime with:
//! 1. Accept loop (clients, group peers, master)
//! 2. Sync loop (push new files to peers)
//! 3. Migration loop (hot/cold tiering)
//! 4. Master link (registration, peer discovery)

mod config;
mod daemon;
mod master_link;
mod migrate;
mod ops;
mod request;
mod session;
mod store;
mod sync;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info};

use tierfs_proto::constants::STORAGE_LISTEN_PORT;
use tierfs_proto::defaults::*;

use crate::config::StorageConfig;
use crate::migrate::{ColdPolicy, HotPolicy, MigrationConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ColdPolicyArg {
    Disabled,
    Count,
}

/// tierfs storage daemon
#[derive(Parser, Debug)]
#[command(name = "storaged", version, about = "tierfs storage daemon")]
struct Args {
    /// Hot tier store root (repeatable)
    #[arg(long = "hot", value_name = "DIR", required = true)]
    hot_roots: Vec<PathBuf>,

    /// Cold tier store root (repeatable)
    #[arg(long = "cold", value_name = "DIR")]
    cold_roots: Vec<PathBuf>,

    /// Storage group this node belongs to
    #[arg(short = 'g', long)]
    group: u32,

    /// Listen address
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind_addr: IpAddr,

    /// Listen port
    #[arg(short = 'p', long, default_value_t = STORAGE_LISTEN_PORT)]
    port: u16,

    /// Address announced to the master and peers (default: listen address)
    #[arg(long, value_name = "HOST:PORT")]
    advertise: Option<SocketAddr>,

    /// Master address; without it the node runs standalone
    #[arg(short = 'm', long, value_name = "HOST:PORT")]
    master: Option<SocketAddr>,

    /// Heartbeat timeout in seconds
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_TIMEOUT_SECS)]
    heartbeat_timeout: u64,

    /// Heartbeat interval in seconds
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL_SECS)]
    heartbeat_interval: u64,

    /// Seconds between sync cycles
    #[arg(long, default_value_t = DEFAULT_SYNC_INTERVAL_SECS)]
    sync_interval: u64,

    /// Replication chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_SYNC_CHUNK_SIZE)]
    sync_chunk_size: usize,

    /// Download chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Seconds between migration cycles
    #[arg(long, default_value_t = DEFAULT_MIGRATE_INTERVAL_SECS)]
    migrate_interval: u64,

    /// Hot to cold policy: disabled, atime or ctime
    #[arg(long, default_value = "atime")]
    hot_policy: HotPolicy,

    /// Idle seconds before a hot file is demoted
    #[arg(long, default_value_t = DEFAULT_HOT_TIMEOUT_SECS)]
    hot_timeout: u64,

    /// Cold to hot policy
    #[arg(long, value_enum, default_value_t = ColdPolicyArg::Count)]
    cold_policy: ColdPolicyArg,

    /// Reads after which a cold file is promoted
    #[arg(long, default_value_t = DEFAULT_COLD_PROMOTE_COUNT)]
    cold_promote_count: u32,

    /// Percent of each disk kept free
    #[arg(long, default_value_t = DEFAULT_DISK_HEADROOM_PERCENT,
          value_parser = clap::value_parser!(u8).range(0..=100))]
    disk_headroom: u8,

    /// Files larger than this many bytes are downloaded with sendfile
    #[arg(long, default_value_t = DEFAULT_SENDFILE_THRESHOLD)]
    sendfile_threshold: u64,

    /// Connection attempts to the master before giving up
    #[arg(long, default_value_t = DEFAULT_MASTER_RETRY_BUDGET)]
    master_retry_budget: u32,

    /// Seconds between peer list refreshes
    #[arg(long, default_value_t = DEFAULT_PEER_REFRESH_INTERVAL_SECS)]
    peer_refresh_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> StorageConfig {
        let mut cfg = StorageConfig::new(self.group, self.hot_roots, self.cold_roots);
        cfg.listen_addr = SocketAddr::new(self.bind_addr, self.port);
        cfg.advertise_addr = self.advertise;
        cfg.master_addr = self.master;
        cfg.conn.heartbeat_timeout = Duration::from_secs(self.heartbeat_timeout);
        cfg.conn.heartbeat_interval = Duration::from_secs(self.heartbeat_interval);
        cfg.sync_interval = Duration::from_secs(self.sync_interval);
        cfg.sync_chunk_size = self.sync_chunk_size;
        cfg.chunk_size = self.chunk_size;
        cfg.migrate = MigrationConfig {
            hot_policy: self.hot_policy,
            hot_timeout: Duration::from_secs(self.hot_timeout),
            cold_policy: match self.cold_policy {
                ColdPolicyArg::Disabled => ColdPolicy::Disabled,
                ColdPolicyArg::Count => ColdPolicy::Count(self.cold_promote_count.max(1)),
            },
            interval: Duration::from_secs(self.migrate_interval),
        };
        cfg.disk_headroom_percent = self.disk_headroom;
        cfg.sendfile_threshold = self.sendfile_threshold;
        cfg.master_retry_budget = self.master_retry_budget;
        cfg.peer_refresh_interval = Duration::from_secs(self.peer_refresh_interval);
        cfg
    }
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

    info!("storaged v{} starting", env!("CARGO_PKG_VERSION"));

    if args.heartbeat_timeout == 0 || args.heartbeat_interval == 0 {
        error!("heartbeat timeout and interval must be non-zero");
        std::process::exit(1);
    }

    let config = args.into_config();
    let master = config.master_addr;

    let sys = match daemon::start(config).await {
        Ok(sys) => sys,
        Err(e) => {
            error!("failed to start: {}", e);
            std::process::exit(1);
        }
    };

    let link = async {
        match master {
            Some(addr) => master_link::run(sys.clone(), addr).await,
            None => {
                info!("no master configured, running standalone");
                std::future::pending().await
            }
        }
    };

    tokio::select! {
        res = link => {
            if let Err(e) = res {
                error!("master link failed: {}", e);
                sys.shutdown();
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c");
        }
    }

    sys.shutdown();
    info!("storaged stopped");
}

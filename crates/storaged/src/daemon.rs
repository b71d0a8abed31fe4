//! Storage node state and startup.
//!
//! Everything long-lived hangs off one [`SystemInfo`] shared by `Arc`. Each
//! part guards its own state, so the struct itself is immutable after
//! [`start`].

use std::net::SocketAddr;
use std::sync::Arc;

use tierfs_core::{Acceptor, ConnRegistry};
use tierfs_proto::msg::StorageMetrics;
use tierfs_proto::{FsError, FsResult, StorageNode};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{self, NodeIdentity, StorageConfig};
use crate::migrate::MigrationEngine;
use crate::request;
use crate::store::StoreGroup;
use crate::sync::SyncService;

pub type SharedSys = Arc<SystemInfo>;

pub struct SystemInfo {
    pub config: StorageConfig,
    /// This node as announced to the master and to peers.
    pub this_node: StorageNode,
    /// Address the acceptor actually bound.
    pub listen_addr: SocketAddr,
    pub hot: Arc<StoreGroup>,
    pub cold: Arc<StoreGroup>,
    pub sync: Arc<SyncService>,
    pub migrate: Arc<MigrationEngine>,
    /// Connections to the other members of the group.
    pub peers: Arc<ConnRegistry>,
    shutdown: watch::Sender<bool>,
}

impl SystemInfo {
    pub fn group_id(&self) -> u32 {
        self.this_node.group_id
    }

    pub fn storage_metrics(&self) -> StorageMetrics {
        StorageMetrics {
            node: self.this_node,
            hot: self.hot.stats(),
            cold: self.cold.stats(),
            hot_tracked: self.migrate.hot_tracked() as u64,
            cold_tracked: self.migrate.cold_tracked() as u64,
            sync_queue: self.sync.len() as u64,
            peers: self.peers.len() as u32,
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop the background loops and drop peer connections.
    pub fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("storaged: shutting down");
        self.peers.clear();
    }
}

/// Check the saved identity against `node` and record the current one.
async fn check_identity(cfg: &StorageConfig, node: &StorageNode) -> FsResult<()> {
    let dir = cfg.identity_dir()?;
    if let Some(saved) = config::load_identity(dir).await? {
        if saved.group_id != node.group_id {
            error!(
                "node belongs to group {}, refusing to start as group {}",
                saved.group_id, node.group_id
            );
            return Err(FsError::InvalidParms);
        }
        if saved.addr == node.addr {
            return Ok(());
        }
        info!("advertised address changed from {} to {}", saved.addr, node.addr);
    }
    config::save_identity(
        dir,
        &NodeIdentity {
            group_id: node.group_id,
            addr: node.addr,
        },
    )
    .await
}

/// Open the tiers, start listening and spawn the background loops.
///
/// The master link is not started here; see `master_link::run`.
pub async fn start(config: StorageConfig) -> FsResult<SharedSys> {
    if config.hot_roots.is_empty() {
        error!("at least one hot store root is required");
        return Err(FsError::InvalidParms);
    }

    let acceptor = Acceptor::bind(config.listen_addr, config.conn.clone()).await?;
    let listen_addr = acceptor.local_addr();
    let advertised = config.advertise_addr.unwrap_or(listen_addr);
    if advertised.ip().is_unspecified() {
        warn!(
            "advertising unspecified address {}, peers will not reach this node",
            advertised
        );
    }
    let this_node = StorageNode::new(config.group_id, advertised);

    let hot = Arc::new(
        StoreGroup::open("hot", &config.hot_roots, config.disk_headroom_percent).await?,
    );
    check_identity(&config, &this_node).await?;
    let cold = Arc::new(
        StoreGroup::open("cold", &config.cold_roots, config.disk_headroom_percent).await?,
    );
    if cold.is_empty() {
        warn!("no cold store roots, demotion is disabled");
    }

    let peers = Arc::new(ConnRegistry::new());
    let sync = Arc::new(SyncService::new(
        hot.clone(),
        peers.clone(),
        config.sync_chunk_size,
        config.sync_interval,
    ));
    let migrate = Arc::new(MigrationEngine::new(
        config.migrate.clone(),
        hot.clone(),
        cold.clone(),
    ));
    migrate.seed().await?;

    let (shutdown, _) = watch::channel(false);
    let sys = Arc::new(SystemInfo {
        config,
        this_node,
        listen_addr,
        hot,
        cold,
        sync,
        migrate,
        peers,
        shutdown,
    });

    tokio::spawn(request::accept_loop(sys.clone(), acceptor));
    tokio::spawn(sys.sync.clone().run(sys.shutdown_signal()));
    if !sys.cold.is_empty() {
        tokio::spawn(sys.migrate.clone().run(sys.shutdown_signal()));
    }

    info!("storaged: {} listening on {}", sys.this_node, listen_addr);
    Ok(sys)
}

/// Loopback config with one hot and one cold root under `base`.
#[cfg(test)]
pub(crate) fn test_config(base: &std::path::Path, group_id: u32) -> StorageConfig {
    let mut cfg = StorageConfig::new(group_id, vec![base.join("hot0")], vec![base.join("cold0")]);
    cfg.listen_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_and_metrics() {
        let base = std::env::temp_dir().join("tierfs_test_daemon_start");
        let _ = std::fs::remove_dir_all(&base);

        let sys = start(test_config(&base, 3)).await.unwrap();
        assert_eq!(sys.this_node.addr, sys.listen_addr);
        let m = sys.storage_metrics();
        assert_eq!(m.node.group_id, 3);
        assert_eq!(m.hot.stores, 1);
        assert_eq!(m.cold.stores, 1);
        assert_eq!(m.sync_queue, 0);
        sys.shutdown();
        assert!(sys.is_shutting_down());

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_group_change_is_refused() {
        let base = std::env::temp_dir().join("tierfs_test_daemon_group");
        let _ = std::fs::remove_dir_all(&base);

        let sys = start(test_config(&base, 1)).await.unwrap();
        sys.shutdown();
        drop(sys);

        assert!(matches!(
            start(test_config(&base, 2)).await,
            Err(FsError::InvalidParms)
        ));
        let _ = std::fs::remove_dir_all(&base);
    }
}

//! Storage daemon configuration and persisted node identity.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tierfs_core::ConnectionConfig;
use tierfs_proto::constants::{NODE_CONF_FILE, STORAGE_LISTEN_PORT};
use tierfs_proto::defaults::*;
use tierfs_proto::{FsError, FsResult};
use tokio::fs;
use tracing::{debug, error};

use crate::migrate::MigrationConfig;

/// Runtime configuration of one storage node.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub listen_addr: SocketAddr,
    /// Address announced to the master and peers; defaults to the bound
    /// listen address.
    pub advertise_addr: Option<SocketAddr>,
    pub group_id: u32,
    pub hot_roots: Vec<PathBuf>,
    pub cold_roots: Vec<PathBuf>,
    /// `None` runs the node without a master.
    pub master_addr: Option<SocketAddr>,
    pub conn: ConnectionConfig,
    pub sync_interval: Duration,
    pub sync_chunk_size: usize,
    pub chunk_size: usize,
    pub migrate: MigrationConfig,
    pub disk_headroom_percent: u8,
    pub sendfile_threshold: u64,
    pub master_retry_budget: u32,
    pub master_backoff_initial: Duration,
    pub master_backoff_max: Duration,
    pub peer_refresh_interval: Duration,
}

impl StorageConfig {
    pub fn new(group_id: u32, hot_roots: Vec<PathBuf>, cold_roots: Vec<PathBuf>) -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], STORAGE_LISTEN_PORT)),
            advertise_addr: None,
            group_id,
            hot_roots,
            cold_roots,
            master_addr: None,
            conn: ConnectionConfig::default(),
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            sync_chunk_size: DEFAULT_SYNC_CHUNK_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            migrate: MigrationConfig::default(),
            disk_headroom_percent: DEFAULT_DISK_HEADROOM_PERCENT,
            sendfile_threshold: DEFAULT_SENDFILE_THRESHOLD,
            master_retry_budget: DEFAULT_MASTER_RETRY_BUDGET,
            master_backoff_initial: Duration::from_millis(DEFAULT_MASTER_BACKOFF_INITIAL_MS),
            master_backoff_max: Duration::from_millis(DEFAULT_MASTER_BACKOFF_MAX_MS),
            peer_refresh_interval: Duration::from_secs(DEFAULT_PEER_REFRESH_INTERVAL_SECS),
        }
    }

    /// Where the node identity is kept.
    pub fn identity_dir(&self) -> FsResult<&Path> {
        self.hot_roots
            .first()
            .map(PathBuf::as_path)
            .ok_or(FsError::InvalidParms)
    }
}

/// Identity a node keeps across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub group_id: u32,
    pub addr: SocketAddr,
}

pub async fn save_identity(dir: &Path, ident: &NodeIdentity) -> FsResult<()> {
    let path = dir.join(NODE_CONF_FILE);
    let data = bincode::serialize(ident).map_err(|_| FsError::SystemError)?;
    fs::write(&path, &data).await.map_err(|e| {
        error!("failed to write node identity to {}: {}", path.display(), e);
        FsError::Io
    })?;
    debug!("saved node identity: group={}", ident.group_id);
    Ok(())
}

/// Load the saved identity, `None` on a first start.
pub async fn load_identity(dir: &Path) -> FsResult<Option<NodeIdentity>> {
    let path = dir.join(NODE_CONF_FILE);
    let data = match fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            error!("failed to read node identity from {}: {}", path.display(), e);
            return Err(FsError::Io);
        }
    };
    bincode::deserialize(&data).map(Some).map_err(|_| {
        error!("corrupt node identity file: {}", path.display());
        FsError::SystemError
    })
}

/// Payload bodies for the tierfs protocol.
///
/// Control payloads are serde structs serialized with bincode. Raw data
/// chunks (upload, sync, download) travel as opaque bytes and have no
/// type here.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{FsError, FsResult};
use crate::node::{Role, StorageNode};

/// Serialize a payload body.
pub fn encode<T: Serialize>(msg: &T) -> FsResult<Vec<u8>> {
    bincode::serialize(msg).map_err(|_| FsError::SystemError)
}

/// Deserialize a payload body received from a peer.
pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> FsResult<T> {
    bincode::deserialize(buf).map_err(|_| FsError::ProtocolViolation)
}

// ---- Handshake ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatParams {
    pub timeout_ms: u64,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub role: Role,
}

// ---- Membership ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRegister {
    pub node: StorageNode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerListRequest {
    pub group_id: u32,
    /// Member left out of the reply, normally the asking node itself
    pub exclude: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerList {
    pub peers: Vec<StorageNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageJoin {
    pub node: StorageNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpace {
    pub max_free: u64,
}

// ---- Replication ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOpen {
    pub size: u64,
    pub rel_path: String,
}

// ---- Client data path ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOpen {
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadClose {
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadDone {
    /// `"<group_id>/<rel_path>"`
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOpen {
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub size: u64,
}

// ---- Placement ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocateUpload {
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocateDownload {
    pub group_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub node: StorageNode,
}

// ---- Metrics ----

/// Capacity of one tier (a store group).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierMetrics {
    pub total: u64,
    pub free: u64,
    pub stores: u32,
}

/// Snapshot served by the `Metrics` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetrics {
    pub node: StorageNode,
    pub hot: TierMetrics,
    pub cold: TierMetrics,
    pub hot_tracked: u64,
    pub cold_tracked: u64,
    pub sync_queue: u64,
    pub peers: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_garbage_is_violation() {
        let r: FsResult<SyncOpen> = decode(&[0xff, 0xff, 0xff]);
        assert_eq!(r, Err(FsError::ProtocolViolation));
    }

    #[test]
    fn test_metrics_payload() {
        let m = StorageMetrics {
            node: StorageNode::new(2, "10.0.0.5:7800".parse().unwrap()),
            hot: TierMetrics {
                total: 1 << 40,
                free: 1 << 39,
                stores: 2,
            },
            cold: TierMetrics::default(),
            hot_tracked: 10,
            cold_tracked: 0,
            sync_queue: 1,
            peers: 2,
        };
        let buf = encode(&m).unwrap();
        assert_eq!(decode::<StorageMetrics>(&buf).unwrap(), m);
    }
}

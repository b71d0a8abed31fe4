//! Per-connection state, chosen once from the peer's role.

use tierfs_proto::StorageNode;

/// Which tier an open download reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Hot,
    Cold,
}

#[derive(Debug)]
pub struct Download {
    pub file_id: u64,
    pub tier: Tier,
    pub size: u64,
}

/// A client: at most one upload and one download in flight.
#[derive(Debug, Default)]
pub struct ClientSession {
    pub upload: Option<u64>,
    pub download: Option<Download>,
}

/// Another storage node of the group.
#[derive(Debug, Default)]
pub struct PeerSession {
    /// Node announced through `StorageJoin`.
    pub joined: Option<StorageNode>,
    /// Hot-tier write handle of the file being received.
    pub sync: Option<u64>,
}

#[derive(Debug)]
pub enum Session {
    Client(ClientSession),
    Storage(PeerSession),
    Master,
}

//! Command identifiers carried in the frame header.
//!
//! The numeric values are part of the wire protocol and must never be
//! reordered. Any value `>= Command::COUNT` is rejected by the decoder.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Command {
    /// Acceptor → connector: `{timeout, interval}`; answered with `Hello`.
    HeartbeatEstablish = 0,
    /// Zero-payload keepalive, never answered.
    HeartbeatPing = 1,
    /// Storage → master: announce this node, returns the group's peers.
    StorageRegister = 2,
    /// Storage → master: current peer list for a group.
    PeerList = 3,
    /// Storage → storage: register as a replication peer.
    StorageJoin = 4,
    /// Storage → storage: begin pushing one file (size + path).
    SyncOpen = 5,
    /// Storage → storage: one chunk; status 255 terminates.
    SyncAppend = 6,
    /// Master → storage: largest free space across the hot stores.
    MaxFreeSpace = 7,
    /// Client → storage: allocate a write handle of a declared size.
    UploadOpen = 8,
    /// Client → storage: one raw data chunk.
    UploadAppend = 9,
    /// Client → storage: finish the upload under a user file name.
    UploadClose = 10,
    /// Client → storage: open a stored path, returns its size.
    DownloadOpen = 11,
    /// Client → storage: next chunk; status 255 once exhausted.
    DownloadAppend = 12,
    /// Client → master: pick a storage node for a new file.
    LocateUpload = 13,
    /// Client → master: pick a storage node of a given group.
    LocateDownload = 14,
    /// Any → storage: storage metrics snapshot.
    Metrics = 15,
}

impl Command {
    /// Number of defined commands.
    pub const COUNT: u16 = 16;

    /// Decode a raw command id.
    pub fn from_u16(raw: u16) -> Option<Self> {
        let cmd = match raw {
            0 => Self::HeartbeatEstablish,
            1 => Self::HeartbeatPing,
            2 => Self::StorageRegister,
            3 => Self::PeerList,
            4 => Self::StorageJoin,
            5 => Self::SyncOpen,
            6 => Self::SyncAppend,
            7 => Self::MaxFreeSpace,
            8 => Self::UploadOpen,
            9 => Self::UploadAppend,
            10 => Self::UploadClose,
            11 => Self::DownloadOpen,
            12 => Self::DownloadAppend,
            13 => Self::LocateUpload,
            14 => Self::LocateDownload,
            15 => Self::Metrics,
            _ => return None,
        };
        Some(cmd)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Stable lowercase name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::HeartbeatEstablish => "heartbeat_establish",
            Self::HeartbeatPing => "heartbeat_ping",
            Self::StorageRegister => "storage_register",
            Self::PeerList => "peer_list",
            Self::StorageJoin => "storage_join",
            Self::SyncOpen => "sync_open",
            Self::SyncAppend => "sync_append",
            Self::MaxFreeSpace => "max_free_space",
            Self::UploadOpen => "upload_open",
            Self::UploadAppend => "upload_append",
            Self::UploadClose => "upload_close",
            Self::DownloadOpen => "download_open",
            Self::DownloadAppend => "download_append",
            Self::LocateUpload => "locate_upload",
            Self::LocateDownload => "locate_download",
            Self::Metrics => "metrics",
        }
    }
}

impl TryFrom<u16> for Command {
    type Error = FsError;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        Self::from_u16(raw).ok_or(FsError::ProtocolViolation)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

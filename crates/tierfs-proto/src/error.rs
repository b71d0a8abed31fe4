/// tierfs error types.
///
/// Every error maps to a stable, command-independent status code carried in
/// the frame header. Status `0` (ok) and `255` (stream finished) are never
/// errors.

use serde::{Deserialize, Serialize};

use crate::constants::{FRAME_STAT_FINISH, FRAME_STAT_OK};

/// Unified error type for all tierfs operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum FsError {
    #[error("protocol violation")]
    ProtocolViolation,
    #[error("not enough disk space")]
    OutOfSpace,
    #[error("no such file or handle")]
    NotFound,
    #[error("I/O error")]
    Io,
    #[error("peer unreachable")]
    PeerUnreachable,
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("invalid parameters")]
    InvalidParms,
    #[error("session already active")]
    Busy,
    #[error("operation not supported")]
    Unsupported,
    #[error("system error")]
    SystemError,
}

impl FsError {
    /// Convert from a frame status to an error.
    ///
    /// Returns `None` for the ok and finish statuses.
    pub fn from_status(status: u8) -> Option<Self> {
        match status {
            FRAME_STAT_OK | FRAME_STAT_FINISH => None,
            1 => Some(Self::ProtocolViolation),
            2 => Some(Self::OutOfSpace),
            3 => Some(Self::NotFound),
            4 => Some(Self::Io),
            5 => Some(Self::PeerUnreachable),
            6 => Some(Self::HeartbeatTimeout),
            7 => Some(Self::ConnectionClosed),
            8 => Some(Self::InvalidParms),
            9 => Some(Self::Busy),
            10 => Some(Self::Unsupported),
            _ => Some(Self::SystemError),
        }
    }

    /// Convert to a frame status.
    pub fn to_status(self) -> u8 {
        match self {
            Self::ProtocolViolation => 1,
            Self::OutOfSpace => 2,
            Self::NotFound => 3,
            Self::Io => 4,
            Self::PeerUnreachable => 5,
            Self::HeartbeatTimeout => 6,
            Self::ConnectionClosed => 7,
            Self::InvalidParms => 8,
            Self::Busy => 9,
            Self::Unsupported => 10,
            Self::SystemError => 11,
        }
    }

    /// Whether this error means the connection it happened on is unusable.
    pub fn is_fatal_to_connection(self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation | Self::HeartbeatTimeout | Self::ConnectionClosed
        )
    }
}

/// Result type alias for tierfs operations.
pub type FsResult<T> = Result<T, FsError>;

impl From<std::io::Error> for FsError {
    fn from(_: std::io::Error) -> Self {
        FsError::Io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        let all = [
            FsError::ProtocolViolation,
            FsError::OutOfSpace,
            FsError::NotFound,
            FsError::Io,
            FsError::PeerUnreachable,
            FsError::HeartbeatTimeout,
            FsError::ConnectionClosed,
            FsError::InvalidParms,
            FsError::Busy,
            FsError::Unsupported,
            FsError::SystemError,
        ];
        for err in all {
            let status = err.to_status();
            assert_ne!(status, FRAME_STAT_OK);
            assert_ne!(status, FRAME_STAT_FINISH);
            assert_eq!(FsError::from_status(status), Some(err));
        }
    }

    #[test]
    fn test_ok_and_finish_are_not_errors() {
        assert_eq!(FsError::from_status(FRAME_STAT_OK), None);
        assert_eq!(FsError::from_status(FRAME_STAT_FINISH), None);
        assert_eq!(FsError::from_status(200), Some(FsError::SystemError));
    }
}

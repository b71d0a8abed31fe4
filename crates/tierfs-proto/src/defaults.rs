//! Tunable operational defaults for tierfs.
//!
//! Protocol-level constants (wire format, magic numbers, layout) remain in
//! [`crate::constants`]. This module centralizes the configurable defaults
//! that can be overridden via CLI flags.

// ─── Heartbeat ──────────────────────────────────────────────────────────────

/// Silence on a connection longer than this closes it (seconds).
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 15;

/// Interval between heartbeat pings (seconds).
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Deadline for completing the heartbeat-establish handshake (milliseconds).
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5000;

// ─── Connection ─────────────────────────────────────────────────────────────

/// Channel buffer size for a connection's outbound frame queue.
pub const DEFAULT_CONN_WRITE_CHANNEL_SIZE: usize = 128;

/// Channel buffer size for handshaken connections waiting in an acceptor.
pub const DEFAULT_ACCEPT_CHANNEL_SIZE: usize = 256;

// ─── Storage Engine ─────────────────────────────────────────────────────────

/// Free space that must remain after admitting a new file, in percent of
/// the filesystem's total size.
pub const DEFAULT_DISK_HEADROOM_PERCENT: u8 = 5;

/// Chunk size used by clients for uploads and by storage for downloads.
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Files larger than this are served with `sendfile(2)` (bytes).
pub const DEFAULT_SENDFILE_THRESHOLD: u64 = 8 * 1024 * 1024;

// ─── Replication ────────────────────────────────────────────────────────────

/// Interval between sync cycles (seconds).
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 10;

/// Chunk size for pushing files to peers (bytes). 5 MB.
pub const DEFAULT_SYNC_CHUNK_SIZE: usize = 5 * 1024 * 1024;

// ─── Migration ──────────────────────────────────────────────────────────────

/// Interval between migration cycles (seconds).
pub const DEFAULT_MIGRATE_INTERVAL_SECS: u64 = 60;

/// Idle time after which a hot file becomes eligible for demotion (seconds).
pub const DEFAULT_HOT_TIMEOUT_SECS: u64 = 7 * 24 * 3600;

/// Access count at which a cold file is promoted back to hot.
pub const DEFAULT_COLD_PROMOTE_COUNT: u32 = 3;

// ─── Master Link ────────────────────────────────────────────────────────────

/// Number of connection attempts to the master before giving up.
pub const DEFAULT_MASTER_RETRY_BUDGET: u32 = 8;

/// First backoff delay between master connection attempts (milliseconds).
pub const DEFAULT_MASTER_BACKOFF_INITIAL_MS: u64 = 500;

/// Backoff ceiling between master connection attempts (milliseconds).
pub const DEFAULT_MASTER_BACKOFF_MAX_MS: u64 = 8000;

/// Interval between peer list refreshes from the master (seconds).
pub const DEFAULT_PEER_REFRESH_INTERVAL_SECS: u64 = 30;

/// tierfs protocol and layout constants.

/// Sentinel at the start of every frame header.
pub const FRAME_MAGIC: u16 = 0x7466;

/// Size of the fixed frame header on the wire.
pub const FRAME_HEADER_LEN: usize = 12;

/// Status: request succeeded.
pub const FRAME_STAT_OK: u8 = 0;
/// Status: last chunk of a chunked transfer.
pub const FRAME_STAT_FINISH: u8 = 255;

/// Upper bound on a single frame payload (64 MB).
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Default listen port for storage nodes
pub const STORAGE_LISTEN_PORT: u16 = 7800;
/// Default listen port for the master
pub const MASTER_LISTEN_PORT: u16 = 7700;

/// Number of two-level shard buckets per store (`00/00` .. `FF/FF`).
pub const SHARD_BUCKETS: u32 = 1 << 16;

/// Length of the random suffix appended to stored file names.
pub const NAME_SUFFIX_LEN: usize = 8;

/// Prefix and extension of in-progress write files.
pub const TMP_FILE_PREFIX: char = '.';
pub const TMP_FILE_EXT: &str = ".tmp";

/// File holding the persisted node identity inside the first hot root.
pub const NODE_CONF_FILE: &str = "node.conf";

//! Shared utilities for the tfs CLI tool.

use std::net::SocketAddr;

use tierfs_core::client::{MasterClient, StorageClient};
use tierfs_core::ConnectionConfig;

/// Connect to the master or exit.
pub async fn connect_master(addr: SocketAddr) -> MasterClient {
    match MasterClient::connect(addr, &ConnectionConfig::default()).await {
        Ok(c) => c,
        Err(e) => exit_error(&format!("cannot reach master {}: {}", addr, e)),
    }
}

/// Connect to a storage node or exit.
pub async fn connect_storage(addr: SocketAddr) -> StorageClient {
    match StorageClient::connect(addr, &ConnectionConfig::default()).await {
        Ok(c) => c,
        Err(e) => exit_error(&format!("cannot reach storage node {}: {}", addr, e)),
    }
}

/// Format a byte count as a human-readable size string.
///
/// Examples: "1.0 GB", "512.0 MB", "4.0 TB"
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    let (unit, name) = match bytes {
        b if b >= TB => (TB, "TB"),
        b if b >= GB => (GB, "GB"),
        b if b >= MB => (MB, "MB"),
        b if b >= KB => (KB, "KB"),
        _ => return format!("{} B", bytes),
    };
    format!("{:.1} {}", bytes as f64 / unit as f64, name)
}

/// Parse a size string with optional K/M/G suffix.
///
/// Examples: "5M" = 5 * 1024^2, "64K" = 64 * 1024
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let (num_str, multiplier) = match s.as_bytes().last() {
        Some(b'K' | b'k') => (&s[..s.len() - 1], 1024usize),
        Some(b'M' | b'm') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'G' | b'g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let num: usize = num_str
        .parse()
        .map_err(|e| format!("invalid size '{}': {}", s, e))?;
    match num.checked_mul(multiplier) {
        Some(0) => Err("size must be non-zero".to_string()),
        Some(n) => Ok(n),
        None => Err(format!("size '{}' overflows", s)),
    }
}

/// Print an error message and exit.
pub fn exit_error(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("5M").unwrap(), 5 * 1024 * 1024);
        assert_eq!(parse_size("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert!(parse_size("").is_err());
        assert!(parse_size("0").is_err());
        assert!(parse_size("abc").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size(1024 * 1024 * 1024), "1.0 GB");
    }
}

//! Shared helper functions for store operations.
//!
//! Provides utilities for:
//! - Mapping the shard cursor to `XX/XX` bucket directories
//! - Validating store-relative paths and user file names
//! - Naming hidden temporaries and randomly suffixed final files
//! - Scanning the bucket tree and checking available disk space

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tierfs_proto::constants::{NAME_SUFFIX_LEN, TMP_FILE_EXT, TMP_FILE_PREFIX};
use tierfs_proto::{FsError, FsResult};
use tracing::{debug, warn};

/// Bucket directory for a shard cursor value, e.g. `0x0aff` -> `0A/FF`.
pub fn shard_dir(cursor: u16) -> String {
    format!("{:02X}/{:02X}", cursor >> 8, cursor & 0xff)
}

fn is_bucket_name(name: &str) -> bool {
    name.len() == 2
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

/// Reject relative paths that could escape the store root.
pub fn validate_rel_path(rel: &str) -> FsResult<()> {
    if rel.is_empty() || rel.contains('\0') {
        return Err(FsError::InvalidParms);
    }
    let path = Path::new(rel);
    let mut parts = 0;
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                if part.to_string_lossy().starts_with(TMP_FILE_PREFIX) {
                    return Err(FsError::InvalidParms);
                }
                parts += 1;
            }
            _ => return Err(FsError::InvalidParms),
        }
    }
    if parts < 2 {
        return Err(FsError::InvalidParms);
    }
    Ok(())
}

/// Validate a user-supplied file name used as the stem of a stored name.
pub fn validate_file_name(name: &str) -> FsResult<()> {
    if name.is_empty()
        || name.starts_with(TMP_FILE_PREFIX)
        || name.contains('/')
        || name.contains('\0')
    {
        return Err(FsError::InvalidParms);
    }
    Ok(())
}

pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Final name of an uploaded file: `<name>_<random8>`.
pub fn suffixed_name(name: &str) -> String {
    format!("{}_{}", name, random_suffix(NAME_SUFFIX_LEN))
}

/// Path of a fresh hidden temporary in `dir`.
pub fn tmp_path(dir: &Path) -> PathBuf {
    dir.join(format!(
        "{}{}{}",
        TMP_FILE_PREFIX,
        random_suffix(16),
        TMP_FILE_EXT
    ))
}

fn is_tmp_name(name: &str) -> bool {
    name.starts_with(TMP_FILE_PREFIX) && name.ends_with(TMP_FILE_EXT)
}

/// A stored file found by [`scan_bucket_tree`].
#[derive(Debug, Clone)]
pub struct ScanEntry {
    /// Path relative to the store root, `XX/XX/<name>`.
    pub rel_path: String,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
}

/// Call `f` for every regular file in every `XX/XX` bucket under `root`.
fn walk_buckets<F>(root: &Path, mut f: F) -> FsResult<()>
where
    F: FnMut(&str, &str, fs::DirEntry),
{
    if !root.exists() {
        return Ok(());
    }

    let read = |dir: &Path| {
        fs::read_dir(dir).map_err(|e| {
            warn!("store: failed to read dir {}: {}", dir.display(), e);
            FsError::Io
        })
    };

    for l1 in read(root)? {
        let l1 = l1.map_err(|_| FsError::Io)?;
        let l1_name = l1.file_name().to_string_lossy().into_owned();
        if !is_bucket_name(&l1_name) || !l1.path().is_dir() {
            continue;
        }
        for l2 in read(&l1.path())? {
            let l2 = l2.map_err(|_| FsError::Io)?;
            let l2_name = l2.file_name().to_string_lossy().into_owned();
            if !is_bucket_name(&l2_name) || !l2.path().is_dir() {
                continue;
            }
            for entry in read(&l2.path())? {
                let entry = entry.map_err(|_| FsError::Io)?;
                let bucket = format!("{}/{}", l1_name, l2_name);
                let name = entry.file_name().to_string_lossy().into_owned();
                f(&bucket, &name, entry);
            }
        }
    }
    Ok(())
}

/// Scan the bucket tree for stored files. Hidden files are skipped.
pub fn scan_bucket_tree(root: &Path) -> FsResult<Vec<ScanEntry>> {
    let mut found = Vec::new();
    walk_buckets(root, |bucket, name, entry| {
        if name.starts_with(TMP_FILE_PREFIX) {
            return;
        }
        let meta = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            _ => return,
        };
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        found.push(ScanEntry {
            rel_path: format!("{}/{}", bucket, name),
            size: meta.len(),
            atime: meta.accessed().unwrap_or(mtime),
            mtime,
        });
    })?;
    Ok(found)
}

/// Remove temporaries left behind by writes that never finished.
pub fn purge_stale_tmp(root: &Path) -> FsResult<usize> {
    let mut purged = 0;
    walk_buckets(root, |_, name, entry| {
        if !is_tmp_name(name) {
            return;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => purged += 1,
            Err(e) => warn!("store: failed to purge {}: {}", entry.path().display(), e),
        }
    })?;
    if purged > 0 {
        debug!("store: purged {} stale temporaries in {}", purged, root.display());
    }
    Ok(purged)
}

/// Information about disk space usage.
#[derive(Debug, Clone)]
pub struct DiskSpace {
    /// Total disk space in bytes.
    pub total: u64,
    /// Free disk space in bytes.
    pub free: u64,
    /// Available disk space for non-root users in bytes.
    pub available: u64,
}

/// Get disk space information for the filesystem containing `path`.
pub fn get_disk_space(path: &Path) -> FsResult<DiskSpace> {
    use nix::sys::statvfs::statvfs;

    let stat = statvfs(path).map_err(|e| {
        warn!("statvfs failed for {}: {}", path.display(), e);
        FsError::Io
    })?;

    let block_size = stat.fragment_size() as u64;
    Ok(DiskSpace {
        total: stat.blocks() as u64 * block_size,
        free: stat.blocks_free() as u64 * block_size,
        available: stat.blocks_available() as u64 * block_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_dir() {
        assert_eq!(shard_dir(0), "00/00");
        assert_eq!(shard_dir(0x0aff), "0A/FF");
        assert_eq!(shard_dir(u16::MAX), "FF/FF");
    }

    #[test]
    fn test_validate_rel_path() {
        assert!(validate_rel_path("0A/FF/report.pdf_x81Kq0Zz").is_ok());
        for bad in ["", "/etc/passwd", "../x", "00/../../x", "00/00/.hidden", "file"] {
            assert_eq!(validate_rel_path(bad), Err(FsError::InvalidParms), "{}", bad);
        }
    }

    #[test]
    fn test_suffixed_name() {
        let name = suffixed_name("report.pdf");
        let (stem, suffix) = name.rsplit_once('_').unwrap();
        assert_eq!(stem, "report.pdf");
        assert_eq!(suffix.len(), NAME_SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_scan_skips_hidden_and_foreign() {
        let tmp = std::env::temp_dir().join("tierfs_test_common_scan");
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(tmp.join("0A/FF")).unwrap();
        std::fs::create_dir_all(tmp.join("lost+found")).unwrap();
        std::fs::write(tmp.join("0A/FF/a_12345678"), b"abc").unwrap();
        std::fs::write(tmp.join("0A/FF/.xyz.tmp"), b"partial").unwrap();
        std::fs::write(tmp.join("node.conf"), b"id").unwrap();

        let found = scan_bucket_tree(&tmp).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rel_path, "0A/FF/a_12345678");
        assert_eq!(found[0].size, 3);

        assert_eq!(purge_stale_tmp(&tmp).unwrap(), 1);
        assert!(!tmp.join("0A/FF/.xyz.tmp").exists());
        assert!(tmp.join("node.conf").exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }
}

//! A single physical store root.
//!
//! Files live in a two-level `XX/XX` bucket tree. New uploads go to the
//! bucket named by a wrapping 16-bit shard cursor; replication and
//! migration write to an exact caller-chosen relative path instead.
//!
//! Every write goes to a hidden `.<random>.tmp` file in the target bucket,
//! pre-extended to the declared size. Only `close_write` makes the bytes
//! visible under a readable name, so readers and scans never observe a
//! partially written file.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tierfs_proto::{FsError, FsResult};
use tracing::{debug, info, warn};

use super::common::{self, ScanEntry};

/// Where a new file will become visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Next shard bucket; the final name is chosen at close time.
    Bucket,
    /// Exact store-relative path.
    Exact(String),
}

struct WriteHandle {
    file: Arc<File>,
    tmp_path: PathBuf,
    /// Bucket directory, relative to the root.
    dir: String,
    /// Exact final path, for [`Target::Exact`].
    exact: Option<String>,
    size: u64,
    cursor: u64,
}

struct ReadHandle {
    file: Arc<File>,
    size: u64,
    cursor: u64,
}

enum Handle {
    Write(WriteHandle),
    Read(ReadHandle),
}

#[derive(Debug, Clone, Copy, Default)]
struct Space {
    total: u64,
    free: u64,
}

/// One store root with its open handles and cached disk space.
pub struct Store {
    root: PathBuf,
    headroom_percent: u8,
    shard_cursor: AtomicU16,
    handles: Mutex<HashMap<u64, Handle>>,
    space: Mutex<Space>,
}

impl Store {
    /// Open (creating if needed) the store at `root`.
    ///
    /// Temporaries left by an earlier run are purged.
    pub async fn open(root: PathBuf, headroom_percent: u8) -> FsResult<Self> {
        let dir = root.clone();
        let space = tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&dir).map_err(|e| {
                warn!("store: failed to create {}: {}", dir.display(), e);
                FsError::Io
            })?;
            common::purge_stale_tmp(&dir)?;
            common::get_disk_space(&dir)
        })
        .await
        .map_err(|_| FsError::SystemError)??;

        info!(
            "store: opened {} (total={}, free={})",
            root.display(),
            space.total,
            space.available
        );

        Ok(Self {
            root,
            headroom_percent: headroom_percent.min(100),
            shard_cursor: AtomicU16::new(rand::random()),
            handles: Mutex::new(HashMap::new()),
            space: Mutex::new(Space {
                total: space.total,
                free: space.available,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn free_space(&self) -> u64 {
        self.space.lock().free
    }

    pub fn total_space(&self) -> u64 {
        self.space.lock().total
    }

    #[cfg(test)]
    pub fn nr_handles(&self) -> usize {
        self.handles.lock().len()
    }

    /// Free bytes left once the headroom reserve is set aside.
    pub fn admissible_space(&self) -> u64 {
        let space = *self.space.lock();
        let reserve = space.total / 100 * self.headroom_percent as u64
            + space.total % 100 * self.headroom_percent as u64 / 100;
        space.free.saturating_sub(reserve)
    }

    /// Whether a file of `size` bytes fits without eating into the headroom.
    fn admits(&self, size: u64) -> bool {
        size <= self.admissible_space()
    }

    pub fn has_write_handle(&self, file_id: u64) -> bool {
        matches!(self.handles.lock().get(&file_id), Some(Handle::Write(_)))
    }

    /// Reconcile the cached free-space counter with the filesystem.
    pub async fn refresh_space(&self) -> FsResult<()> {
        let dir = self.root.clone();
        let space = tokio::task::spawn_blocking(move || common::get_disk_space(&dir))
            .await
            .map_err(|_| FsError::SystemError)??;
        *self.space.lock() = Space {
            total: space.total,
            free: space.available,
        };
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_space(&self, total: u64, free: u64) {
        *self.space.lock() = Space { total, free };
    }

    /// Allocate a write handle for a file of exactly `size` bytes.
    pub async fn create(&self, file_id: u64, size: u64, target: Target) -> FsResult<()> {
        if self.handles.lock().contains_key(&file_id) {
            return Err(FsError::InvalidParms);
        }
        if !self.admits(size) {
            debug!(
                "store: {} refuses {} bytes (free={})",
                self.root.display(),
                size,
                self.free_space()
            );
            return Err(FsError::OutOfSpace);
        }

        let (dir, exact) = match target {
            Target::Bucket => {
                let cursor = self.shard_cursor.fetch_add(1, Ordering::Relaxed);
                (common::shard_dir(cursor), None)
            }
            Target::Exact(rel) => {
                common::validate_rel_path(&rel)?;
                let dir = match rel.rsplit_once('/') {
                    Some((dir, _)) => dir.to_string(),
                    None => return Err(FsError::InvalidParms),
                };
                (dir, Some(rel))
            }
        };

        let abs_dir = self.root.join(&dir);
        let (file, tmp_path) = tokio::task::spawn_blocking(move || -> FsResult<_> {
            fs::create_dir_all(&abs_dir).map_err(|e| {
                warn!("store: failed to create {}: {}", abs_dir.display(), e);
                FsError::Io
            })?;
            let tmp_path = common::tmp_path(&abs_dir);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&tmp_path)
                .map_err(|e| {
                    warn!("store: failed to create {}: {}", tmp_path.display(), e);
                    FsError::Io
                })?;
            if let Err(e) = file.set_len(size) {
                warn!("store: failed to extend {}: {}", tmp_path.display(), e);
                let _ = fs::remove_file(&tmp_path);
                return Err(FsError::Io);
            }
            Ok((file, tmp_path))
        })
        .await
        .map_err(|_| FsError::SystemError)??;

        let handle = WriteHandle {
            file: Arc::new(file),
            tmp_path,
            dir,
            exact,
            size,
            cursor: 0,
        };
        let mut handles = self.handles.lock();
        if handles.contains_key(&file_id) {
            drop(handles);
            let _ = fs::remove_file(&handle.tmp_path);
            return Err(FsError::InvalidParms);
        }
        handles.insert(file_id, Handle::Write(handle));
        Ok(())
    }

    /// Remove the write handle for `file_id` and delete its temporary.
    fn teardown_write(&self, file_id: u64) -> Option<PathBuf> {
        let mut handles = self.handles.lock();
        match handles.get(&file_id) {
            Some(Handle::Write(_)) => match handles.remove(&file_id) {
                Some(Handle::Write(h)) => Some(h.tmp_path),
                _ => None,
            },
            _ => None,
        }
    }

    /// Append `data` at the handle's cursor.
    pub async fn write(&self, file_id: u64, data: Vec<u8>) -> FsResult<()> {
        let (file, offset) = {
            let mut handles = self.handles.lock();
            let h = match handles.get_mut(&file_id) {
                Some(Handle::Write(h)) => h,
                _ => return Err(FsError::NotFound),
            };
            let len = data.len() as u64;
            if h.cursor.checked_add(len).map_or(true, |end| end > h.size) {
                return Err(FsError::InvalidParms);
            }
            let offset = h.cursor;
            h.cursor += len;
            (h.file.clone(), offset)
        };

        let len = data.len() as u64;
        let res = tokio::task::spawn_blocking(move || file.write_all_at(&data, offset))
            .await
            .map_err(|_| FsError::SystemError)?;

        if let Err(e) = res {
            warn!("store: write to file {} failed: {}", file_id, e);
            if let Some(tmp) = self.teardown_write(file_id) {
                let _ = tokio::task::spawn_blocking(move || fs::remove_file(tmp)).await;
            }
            return Err(FsError::Io);
        }

        let mut space = self.space.lock();
        space.free = space.free.saturating_sub(len);
        Ok(())
    }

    /// Make a finished write visible.
    ///
    /// With `final_name` the file is hard-linked into its bucket as
    /// `<name>_<random8>`, drawing a new suffix until the name is free;
    /// otherwise it is renamed to its exact target path. Returns the store
    /// root and the final relative path.
    pub async fn close_write(
        &self,
        file_id: u64,
        final_name: Option<&str>,
    ) -> FsResult<(PathBuf, String)> {
        if let Some(name) = final_name {
            common::validate_file_name(name)?;
        }

        let handle = {
            let mut handles = self.handles.lock();
            match handles.get(&file_id) {
                Some(Handle::Write(_)) => match handles.remove(&file_id) {
                    Some(Handle::Write(h)) => h,
                    _ => return Err(FsError::NotFound),
                },
                _ => return Err(FsError::NotFound),
            }
        };

        if handle.cursor != handle.size {
            warn!(
                "store: file {} closed after {} of {} bytes",
                file_id, handle.cursor, handle.size
            );
            let tmp = handle.tmp_path;
            let _ = tokio::task::spawn_blocking(move || fs::remove_file(tmp)).await;
            return Err(FsError::InvalidParms);
        }

        let root = self.root.clone();
        let name = final_name.map(str::to_string);
        let rel = tokio::task::spawn_blocking(move || -> FsResult<String> {
            let WriteHandle {
                file,
                tmp_path,
                dir,
                exact,
                ..
            } = handle;
            let fail = |e: io::Error, what: &str| {
                warn!("store: {} {} failed: {}", what, tmp_path.display(), e);
                let _ = fs::remove_file(&tmp_path);
                FsError::Io
            };

            file.sync_data().map_err(|e| fail(e, "sync"))?;
            drop(file);

            match (name, exact) {
                (Some(name), _) => loop {
                    let rel = format!("{}/{}", dir, common::suffixed_name(&name));
                    match fs::hard_link(&tmp_path, root.join(&rel)) {
                        Ok(()) => {
                            let _ = fs::remove_file(&tmp_path);
                            break Ok(rel);
                        }
                        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                        Err(e) => break Err(fail(e, "link")),
                    }
                },
                (None, Some(rel)) => {
                    fs::rename(&tmp_path, root.join(&rel)).map_err(|e| fail(e, "rename"))?;
                    Ok(rel)
                }
                (None, None) => {
                    let _ = fs::remove_file(&tmp_path);
                    Err(FsError::InvalidParms)
                }
            }
        })
        .await
        .map_err(|_| FsError::SystemError)??;

        debug!("store: closed file {} as {}", file_id, rel);
        Ok((self.root.clone(), rel))
    }

    /// Drop an unfinished write and delete its temporary.
    pub async fn abort_write(&self, file_id: u64) -> FsResult<()> {
        let tmp = self.teardown_write(file_id).ok_or(FsError::NotFound)?;
        debug!("store: aborted file {}", file_id);
        tokio::task::spawn_blocking(move || fs::remove_file(tmp))
            .await
            .map_err(|_| FsError::SystemError)??;
        Ok(())
    }

    /// Open `rel_path` for reading. Returns its size.
    pub async fn open_read(&self, file_id: u64, rel_path: &str) -> FsResult<u64> {
        common::validate_rel_path(rel_path)?;
        if self.handles.lock().contains_key(&file_id) {
            return Err(FsError::InvalidParms);
        }

        let path = self.root.join(rel_path);
        let (file, size) = tokio::task::spawn_blocking(move || -> FsResult<_> {
            let file = File::open(&path).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => FsError::NotFound,
                _ => {
                    warn!("store: failed to open {}: {}", path.display(), e);
                    FsError::Io
                }
            })?;
            let meta = file.metadata()?;
            if !meta.is_file() {
                return Err(FsError::NotFound);
            }
            Ok((file, meta.len()))
        })
        .await
        .map_err(|_| FsError::SystemError)??;

        self.handles.lock().insert(
            file_id,
            Handle::Read(ReadHandle {
                file: Arc::new(file),
                size,
                cursor: 0,
            }),
        );
        Ok(size)
    }

    /// Reserve the next segment of at most `max_len` bytes.
    ///
    /// Returns the file, the segment offset and its length; a zero length
    /// means end of file.
    pub fn read_segment(&self, file_id: u64, max_len: u64) -> FsResult<(Arc<File>, u64, u64)> {
        let mut handles = self.handles.lock();
        let h = match handles.get_mut(&file_id) {
            Some(Handle::Read(h)) => h,
            _ => return Err(FsError::NotFound),
        };
        let len = max_len.min(h.size - h.cursor);
        let offset = h.cursor;
        h.cursor += len;
        Ok((h.file.clone(), offset, len))
    }

    /// Read the next chunk of at most `max_len` bytes; empty means EOF.
    pub async fn read(&self, file_id: u64, max_len: usize) -> FsResult<Vec<u8>> {
        let (file, offset, len) = self.read_segment(file_id, max_len as u64)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len as usize];
            file.read_exact_at(&mut buf, offset).map(|_| buf)
        })
        .await
        .map_err(|_| FsError::SystemError)?
        .map_err(|e| {
            warn!("store: read of file {} failed: {}", file_id, e);
            FsError::Io
        })
    }

    pub fn close_read(&self, file_id: u64) -> FsResult<()> {
        let mut handles = self.handles.lock();
        match handles.get(&file_id) {
            Some(Handle::Read(_)) => {
                handles.remove(&file_id);
                Ok(())
            }
            _ => Err(FsError::NotFound),
        }
    }

    /// Delete a stored file, crediting its size back to free space.
    pub async fn remove(&self, rel_path: &str) -> FsResult<()> {
        common::validate_rel_path(rel_path)?;
        let path = self.root.join(rel_path);
        let size = tokio::task::spawn_blocking(move || -> FsResult<u64> {
            let size = fs::metadata(&path)
                .map_err(|e| match e.kind() {
                    io::ErrorKind::NotFound => FsError::NotFound,
                    _ => FsError::Io,
                })?
                .len();
            fs::remove_file(&path).map_err(|e| {
                warn!("store: failed to remove {}: {}", path.display(), e);
                FsError::Io
            })?;
            Ok(size)
        })
        .await
        .map_err(|_| FsError::SystemError)??;

        let mut space = self.space.lock();
        space.free = space.free.saturating_add(size).min(space.total);
        Ok(())
    }

    pub async fn contains(&self, rel_path: &str) -> bool {
        if common::validate_rel_path(rel_path).is_err() {
            return false;
        }
        let path = self.root.join(rel_path);
        tokio::task::spawn_blocking(move || path.is_file())
            .await
            .unwrap_or(false)
    }

    /// All visible files in this store.
    pub async fn scan(&self) -> FsResult<Vec<ScanEntry>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || common::scan_bucket_tree(&root))
            .await
            .map_err(|_| FsError::SystemError)?
    }
}

//! A tier: an ordered set of stores behind one handle namespace.
//!
//! File ids are drawn from a single 64-bit counter per group and routed to
//! the store that owns them. New files are placed round-robin, skipping
//! stores that refuse the size for lack of space.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tierfs_proto::defaults::DEFAULT_CHUNK_SIZE;
use tierfs_proto::msg::TierMetrics;
use tierfs_proto::{FsError, FsResult};
use tracing::{debug, info, warn};

use super::common::ScanEntry;
use super::disk::{Store, Target};

pub struct StoreGroup {
    name: &'static str,
    stores: Vec<Store>,
    next_id: AtomicU64,
    routes: Mutex<HashMap<u64, usize>>,
    cursor: AtomicUsize,
}

impl StoreGroup {
    /// Open one store per root. `name` only labels logs.
    pub async fn open(
        name: &'static str,
        roots: &[PathBuf],
        headroom_percent: u8,
    ) -> FsResult<Self> {
        let mut stores = Vec::with_capacity(roots.len());
        for root in roots {
            stores.push(Store::open(root.clone(), headroom_percent).await?);
        }
        info!("{}: {} store(s) ready", name, stores.len());
        Ok(Self {
            name,
            stores,
            next_id: AtomicU64::new(1),
            routes: Mutex::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn store_of(&self, file_id: u64) -> FsResult<&Store> {
        let idx = *self.routes.lock().get(&file_id).ok_or(FsError::NotFound)?;
        Ok(&self.stores[idx])
    }

    fn unroute(&self, file_id: u64) {
        self.routes.lock().remove(&file_id);
    }

    /// Allocate a write handle on the next store with room for `size`.
    pub async fn create_file(&self, size: u64, target: Target) -> FsResult<u64> {
        let n = self.stores.len();
        if n == 0 {
            return Err(FsError::OutOfSpace);
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let file_id = self.alloc_id();

        for i in 0..n {
            let idx = (start + i) % n;
            match self.stores[idx].create(file_id, size, target.clone()).await {
                Ok(()) => {
                    self.routes.lock().insert(file_id, idx);
                    return Ok(file_id);
                }
                Err(FsError::OutOfSpace) => continue,
                Err(e) => return Err(e),
            }
        }
        debug!("{}: no store can hold {} bytes", self.name, size);
        Err(FsError::OutOfSpace)
    }

    pub async fn write(&self, file_id: u64, data: Vec<u8>) -> FsResult<()> {
        let res = self.store_of(file_id)?.write(file_id, data).await;
        if res == Err(FsError::Io) {
            // The store already tore the handle down.
            self.unroute(file_id);
        }
        res
    }

    /// Finish a write; see [`Store::close_write`].
    pub async fn close_write(
        &self,
        file_id: u64,
        final_name: Option<&str>,
    ) -> FsResult<(PathBuf, String)> {
        let store = self.store_of(file_id)?;
        let res = store.close_write(file_id, final_name).await;
        // A rejected name keeps the handle open for abort_write.
        if !store.has_write_handle(file_id) {
            self.unroute(file_id);
        }
        res
    }

    pub async fn abort_write(&self, file_id: u64) -> FsResult<()> {
        let store = self.store_of(file_id)?;
        let res = store.abort_write(file_id).await;
        self.unroute(file_id);
        res
    }

    /// Open `rel_path` on whichever store holds it. Returns `(id, size)`.
    pub async fn open_read(&self, rel_path: &str) -> FsResult<(u64, u64)> {
        for (idx, store) in self.stores.iter().enumerate() {
            if !store.contains(rel_path).await {
                continue;
            }
            let file_id = self.alloc_id();
            match store.open_read(file_id, rel_path).await {
                Ok(size) => {
                    self.routes.lock().insert(file_id, idx);
                    return Ok((file_id, size));
                }
                // Removed between the lookup and the open.
                Err(FsError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FsError::NotFound)
    }

    pub async fn read(&self, file_id: u64, max_len: usize) -> FsResult<Vec<u8>> {
        self.store_of(file_id)?.read(file_id, max_len).await
    }

    /// Reserve the next segment for a zero-copy send; see [`Store::read_segment`].
    pub fn read_segment(
        &self,
        file_id: u64,
        max_len: u64,
    ) -> FsResult<(std::sync::Arc<std::fs::File>, u64, u64)> {
        self.store_of(file_id)?.read_segment(file_id, max_len)
    }

    pub fn close_read(&self, file_id: u64) -> FsResult<()> {
        let res = self.store_of(file_id)?.close_read(file_id);
        self.unroute(file_id);
        res
    }

    /// Delete `rel_path` from the store that holds it.
    pub async fn remove(&self, rel_path: &str) -> FsResult<()> {
        for store in &self.stores {
            if store.contains(rel_path).await {
                return store.remove(rel_path).await;
            }
        }
        Err(FsError::NotFound)
    }

    pub async fn contains(&self, rel_path: &str) -> bool {
        for store in &self.stores {
            if store.contains(rel_path).await {
                return true;
            }
        }
        false
    }

    /// Every visible file across all stores.
    pub async fn scan(&self) -> FsResult<Vec<ScanEntry>> {
        let mut all = Vec::new();
        for store in &self.stores {
            all.extend(store.scan().await?);
        }
        Ok(all)
    }

    pub async fn refresh_space(&self) {
        for store in &self.stores {
            if let Err(e) = store.refresh_space().await {
                warn!(
                    "{}: failed to refresh space of {}: {}",
                    self.name,
                    store.root().display(),
                    e
                );
            }
        }
    }

    /// Largest free space of any single store.
    /// Largest file any single store would still admit.
    pub fn max_free_space(&self) -> u64 {
        self.stores
            .iter()
            .map(Store::admissible_space)
            .max()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> TierMetrics {
        TierMetrics {
            total: self.stores.iter().map(Store::total_space).sum(),
            free: self.stores.iter().map(Store::free_space).sum(),
            stores: self.stores.len() as u32,
        }
    }

    /// Copy `rel_path` from `src` into this group under the same path.
    pub async fn copy_from_another_store(&self, src: &StoreGroup, rel_path: &str) -> FsResult<()> {
        let (read_id, size) = src.open_read(rel_path).await?;
        let res = self.copy_body(src, read_id, size, rel_path).await;
        let _ = src.close_read(read_id);
        res
    }

    async fn copy_body(
        &self,
        src: &StoreGroup,
        read_id: u64,
        size: u64,
        rel_path: &str,
    ) -> FsResult<()> {
        let write_id = self
            .create_file(size, Target::Exact(rel_path.to_string()))
            .await?;
        loop {
            let chunk = match src.read(read_id, DEFAULT_CHUNK_SIZE).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = self.abort_write(write_id).await;
                    return Err(e);
                }
            };
            if chunk.is_empty() {
                break;
            }
            if let Err(e) = self.write(write_id, chunk).await {
                let _ = self.abort_write(write_id).await;
                return Err(e);
            }
        }
        self.close_write(write_id, None).await?;
        debug!("{}: copied {} from {}", self.name, rel_path, src.name);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn store(&self, idx: usize) -> &Store {
        &self.stores[idx]
    }
}

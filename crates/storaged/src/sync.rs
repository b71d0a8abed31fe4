//! Hot-tier replication to group peers.
//!
//! Paths of newly uploaded files are queued here. Each cycle drains the
//! queue and pushes every file, one at a time, to all registered peers:
//! `SyncOpen`, a run of `SyncAppend` chunks, then an empty `SyncAppend`
//! carrying the finish status. A peer that fails is dropped from the file's
//! fan-out; a file no peer accepted is queued again for the next cycle.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tierfs_core::{ConnRegistry, Connection};
use tierfs_proto::constants::{FRAME_STAT_FINISH, FRAME_STAT_OK};
use tierfs_proto::msg::{self, SyncOpen};
use tierfs_proto::{Command, FsError, FsResult};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::store::StoreGroup;

/// What happened to one queued path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Pushed to this many peers.
    Synced(usize),
    /// Nobody took it; back in the queue.
    Requeued,
    /// No longer in the hot tier.
    Dropped,
}

pub struct SyncService {
    queue: Mutex<VecDeque<String>>,
    signal: Notify,
    hot: Arc<StoreGroup>,
    peers: Arc<ConnRegistry>,
    chunk_size: usize,
    interval: Duration,
}

impl SyncService {
    pub fn new(
        hot: Arc<StoreGroup>,
        peers: Arc<ConnRegistry>,
        chunk_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            signal: Notify::new(),
            hot,
            peers,
            chunk_size: chunk_size.max(1),
            interval,
        }
    }

    /// Queue a hot-tier path and wake the sync loop.
    pub fn push(&self, rel_path: String) {
        self.queue.lock().push_back(rel_path);
        self.signal.notify_one();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cycle on every interval tick or push until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.signal.notified() => {}
                _ = shutdown.changed() => {
                    debug!("sync: stopped");
                    return;
                }
            }
            if !self.is_empty() {
                self.run_cycle().await;
            }
        }
    }

    /// Drain the queue once, syncing files strictly one after another.
    pub async fn run_cycle(&self) -> Vec<(String, SyncOutcome)> {
        let batch: Vec<String> = self.queue.lock().drain(..).collect();
        let mut outcomes = Vec::with_capacity(batch.len());
        for path in batch {
            let outcome = self.sync_file(&path).await;
            if outcome == SyncOutcome::Requeued {
                self.queue.lock().push_back(path.clone());
            }
            outcomes.push((path, outcome));
        }
        outcomes
    }

    async fn sync_file(&self, rel_path: &str) -> SyncOutcome {
        let peers = self.peers.snapshot();
        if peers.is_empty() {
            return SyncOutcome::Requeued;
        }

        let (file_id, size) = match self.hot.open_read(rel_path).await {
            Ok(v) => v,
            Err(FsError::NotFound) => {
                debug!("sync: {} is gone, dropping", rel_path);
                return SyncOutcome::Dropped;
            }
            Err(e) => {
                warn!("sync: failed to open {}: {}", rel_path, e);
                return SyncOutcome::Requeued;
            }
        };

        let outcome = self.push_file(file_id, size, rel_path, peers).await;
        let _ = self.hot.close_read(file_id);
        outcome
    }

    async fn push_file(
        &self,
        file_id: u64,
        size: u64,
        rel_path: &str,
        peers: Vec<(std::net::SocketAddr, Connection)>,
    ) -> SyncOutcome {
        let open = match msg::encode(&SyncOpen {
            size,
            rel_path: rel_path.to_string(),
        }) {
            Ok(p) => p,
            Err(_) => return SyncOutcome::Requeued,
        };

        let mut fanout = fan_out(peers, Command::SyncOpen, FRAME_STAT_OK, open).await;
        if fanout.is_empty() {
            debug!("sync: no peer accepted {}", rel_path);
            return SyncOutcome::Requeued;
        }

        loop {
            let chunk = match self.hot.read(file_id, self.chunk_size).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("sync: failed to read {}: {}", rel_path, e);
                    abort_streams(fanout, e).await;
                    return SyncOutcome::Requeued;
                }
            };
            if chunk.is_empty() {
                break;
            }
            fanout = fan_out(fanout, Command::SyncAppend, FRAME_STAT_OK, chunk).await;
            if fanout.is_empty() {
                return SyncOutcome::Requeued;
            }
        }

        fanout = fan_out(fanout, Command::SyncAppend, FRAME_STAT_FINISH, Vec::new()).await;
        if fanout.is_empty() {
            return SyncOutcome::Requeued;
        }
        info!(
            "sync: {} ({} bytes) synced to {} peer(s)",
            rel_path,
            size,
            fanout.len()
        );
        SyncOutcome::Synced(fanout.len())
    }
}

/// Send one request to every peer concurrently, keeping those that acked.
async fn fan_out(
    peers: Vec<(std::net::SocketAddr, Connection)>,
    cmd: Command,
    status: u8,
    payload: Vec<u8>,
) -> Vec<(std::net::SocketAddr, Connection)> {
    let payload = Arc::new(payload);
    let mut set = JoinSet::new();
    for (addr, conn) in peers {
        let payload = payload.clone();
        set.spawn(async move {
            let res = request_ok(&conn, cmd, status, payload.to_vec()).await;
            (addr, conn, res)
        });
    }

    let mut alive = Vec::new();
    while let Some(joined) = set.join_next().await {
        let Ok((addr, conn, res)) = joined else {
            continue;
        };
        match res {
            Ok(()) => alive.push((addr, conn)),
            Err(e) => warn!("sync: peer {} dropped on {}: {}", addr, cmd, e),
        }
    }
    alive
}

async fn request_ok(conn: &Connection, cmd: Command, status: u8, payload: Vec<u8>) -> FsResult<()> {
    conn.request(cmd, status, payload).await?.check_status()
}

/// Abandon an in-flight file on every peer still streaming it.
///
/// A `SyncAppend` with an error status makes the receiver discard the
/// partial file; its error reply is expected and ignored.
async fn abort_streams(peers: Vec<(std::net::SocketAddr, Connection)>, reason: FsError) {
    for (_, conn) in peers {
        let _ = conn
            .request(Command::SyncAppend, reason.to_status(), Vec::new())
            .await;
    }
}

//! Hot/cold tier migration.
//!
//! The engine tracks every hot file with a timestamp and every cold file
//! with an access count. Each cycle demotes hot files idle for longer than
//! the hot timeout and promotes cold files read at least N times. Files are
//! moved one at a time: copy into the other tier under the same relative
//! path, then remove from the source.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tierfs_proto::defaults::{
    DEFAULT_COLD_PROMOTE_COUNT, DEFAULT_HOT_TIMEOUT_SECS, DEFAULT_MIGRATE_INTERVAL_SECS,
};
use tierfs_proto::{FsError, FsResult};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::store::StoreGroup;

/// Which timestamp ages a hot file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotPolicy {
    Disabled,
    /// Last access; downloads refresh it.
    Atime,
    /// Arrival time; downloads do not refresh it.
    Ctime,
}

impl FromStr for HotPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "atime" => Ok(Self::Atime),
            "ctime" => Ok(Self::Ctime),
            _ => Err(format!("unknown hot policy '{}'", s)),
        }
    }
}

impl fmt::Display for HotPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Atime => "atime",
            Self::Ctime => "ctime",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdPolicy {
    Disabled,
    /// Promote once a cold file has been read this many times.
    Count(u32),
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub hot_policy: HotPolicy,
    pub hot_timeout: Duration,
    pub cold_policy: ColdPolicy,
    pub interval: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            hot_policy: HotPolicy::Atime,
            hot_timeout: Duration::from_secs(DEFAULT_HOT_TIMEOUT_SECS),
            cold_policy: ColdPolicy::Count(DEFAULT_COLD_PROMOTE_COUNT),
            interval: Duration::from_secs(DEFAULT_MIGRATE_INTERVAL_SECS),
        }
    }
}

/// Outcome of one migration cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationProgress {
    pub demoted: u64,
    pub promoted: u64,
    pub failed: u64,
}

impl MigrationProgress {
    pub fn is_idle(&self) -> bool {
        self.demoted == 0 && self.promoted == 0 && self.failed == 0
    }
}

pub struct MigrationEngine {
    cfg: MigrationConfig,
    hot: Arc<StoreGroup>,
    cold: Arc<StoreGroup>,
    hot_files: Mutex<HashMap<String, SystemTime>>,
    cold_files: Mutex<HashMap<String, u32>>,
}

impl MigrationEngine {
    pub fn new(cfg: MigrationConfig, hot: Arc<StoreGroup>, cold: Arc<StoreGroup>) -> Self {
        Self {
            cfg,
            hot,
            cold,
            hot_files: Mutex::new(HashMap::new()),
            cold_files: Mutex::new(HashMap::new()),
        }
    }

    /// Track a file that just arrived in the hot tier.
    pub fn new_hot_file(&self, rel_path: &str) {
        self.hot_files
            .lock()
            .insert(rel_path.to_string(), SystemTime::now());
    }

    /// A download was served from the hot tier.
    pub fn access_hot_file(&self, rel_path: &str) {
        if self.cfg.hot_policy != HotPolicy::Atime {
            return;
        }
        if let Some(ts) = self.hot_files.lock().get_mut(rel_path) {
            *ts = SystemTime::now();
        }
    }

    /// A download was served from the cold tier.
    pub fn access_cold_file(&self, rel_path: &str) {
        *self
            .cold_files
            .lock()
            .entry(rel_path.to_string())
            .or_insert(0) += 1;
    }

    pub fn hot_tracked(&self) -> usize {
        self.hot_files.lock().len()
    }

    pub fn cold_tracked(&self) -> usize {
        self.cold_files.lock().len()
    }

    pub fn hot_timestamp(&self, rel_path: &str) -> Option<SystemTime> {
        self.hot_files.lock().get(rel_path).copied()
    }

    pub fn cold_count(&self, rel_path: &str) -> Option<u32> {
        self.cold_files.lock().get(rel_path).copied()
    }

    /// Populate the trackers from what is already on disk.
    pub async fn seed(&self) -> FsResult<()> {
        let hot = self.hot.scan().await?;
        let cold = self.cold.scan().await?;
        let use_atime = self.cfg.hot_policy == HotPolicy::Atime;

        {
            let mut hot_files = self.hot_files.lock();
            for e in &hot {
                let ts = if use_atime { e.atime } else { e.mtime };
                hot_files.entry(e.rel_path.clone()).or_insert(ts);
            }
        }
        {
            let mut cold_files = self.cold_files.lock();
            for e in &cold {
                cold_files.entry(e.rel_path.clone()).or_insert(0);
            }
        }
        info!(
            "migrate: tracking {} hot and {} cold file(s)",
            hot.len(),
            cold.len()
        );
        Ok(())
    }

    fn demote_candidates(&self, now: SystemTime) -> Vec<String> {
        if self.cfg.hot_policy == HotPolicy::Disabled {
            return Vec::new();
        }
        self.hot_files
            .lock()
            .iter()
            .filter(|(_, ts)| {
                now.duration_since(**ts)
                    .map_or(false, |idle| idle >= self.cfg.hot_timeout)
            })
            .map(|(p, _)| p.clone())
            .collect()
    }

    fn promote_candidates(&self) -> Vec<String> {
        let ColdPolicy::Count(n) = self.cfg.cold_policy else {
            return Vec::new();
        };
        self.cold_files
            .lock()
            .iter()
            .filter(|(_, count)| **count >= n)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Copy `rel_path` from `src` to `dst`, then remove it from `src`.
    async fn move_file(src: &StoreGroup, dst: &StoreGroup, rel_path: &str) -> FsResult<()> {
        if !dst.contains(rel_path).await {
            dst.copy_from_another_store(src, rel_path).await?;
        }
        match src.remove(rel_path).await {
            Ok(()) | Err(FsError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Run one demote/promote pass.
    pub async fn run_cycle(&self) -> MigrationProgress {
        let mut progress = MigrationProgress::default();
        self.hot.refresh_space().await;
        self.cold.refresh_space().await;

        for path in self.demote_candidates(SystemTime::now()) {
            if !self.hot.contains(&path).await {
                debug!("migrate: {} left the hot tier", path);
                self.hot_files.lock().remove(&path);
                continue;
            }
            match Self::move_file(&self.hot, &self.cold, &path).await {
                Ok(()) => {
                    self.hot_files.lock().remove(&path);
                    self.cold_files.lock().insert(path.clone(), 0);
                    debug!("migrate: demoted {}", path);
                    progress.demoted += 1;
                }
                Err(e) => {
                    warn!("migrate: failed to demote {}: {}", path, e);
                    progress.failed += 1;
                }
            }
        }

        for path in self.promote_candidates() {
            if !self.cold.contains(&path).await {
                debug!("migrate: {} left the cold tier", path);
                self.cold_files.lock().remove(&path);
                continue;
            }
            match Self::move_file(&self.cold, &self.hot, &path).await {
                Ok(()) => {
                    self.cold_files.lock().remove(&path);
                    self.hot_files.lock().insert(path.clone(), SystemTime::now());
                    debug!("migrate: promoted {}", path);
                    progress.promoted += 1;
                }
                Err(e) => {
                    warn!("migrate: failed to promote {}: {}", path, e);
                    progress.failed += 1;
                }
            }
        }

        if !progress.is_idle() {
            info!(
                "migrate: cycle done (demoted={}, promoted={}, failed={})",
                progress.demoted, progress.promoted, progress.failed
            );
        }
        progress
    }

    /// Cycle every interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.cfg.hot_policy == HotPolicy::Disabled && self.cfg.cold_policy == ColdPolicy::Disabled
        {
            info!("migrate: both policies disabled");
            return;
        }
        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown.changed() => {
                    debug!("migrate: stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Target;
    use std::path::PathBuf;

    async fn tiers(name: &str) -> (PathBuf, Arc<StoreGroup>, Arc<StoreGroup>) {
        let base = std::env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&base);
        let hot = StoreGroup::open("hot", &[base.join("hot")], 0).await.unwrap();
        let cold = StoreGroup::open("cold", &[base.join("cold")], 0).await.unwrap();
        (base, Arc::new(hot), Arc::new(cold))
    }

    async fn put(group: &StoreGroup, name: &str, data: &[u8]) -> String {
        let id = group
            .create_file(data.len() as u64, Target::Bucket)
            .await
            .unwrap();
        group.write(id, data.to_vec()).await.unwrap();
        group.close_write(id, Some(name)).await.unwrap().1
    }

    #[test]
    fn test_hot_policy_parse() {
        assert_eq!("atime".parse::<HotPolicy>().unwrap(), HotPolicy::Atime);
        assert_eq!("ctime".parse::<HotPolicy>().unwrap(), HotPolicy::Ctime);
        assert_eq!("disabled".parse::<HotPolicy>().unwrap(), HotPolicy::Disabled);
        assert!("mtime".parse::<HotPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_demote_then_promote() {
        let (base, hot, cold) = tiers("tierfs_test_migrate_cycle").await;
        let cfg = MigrationConfig {
            hot_policy: HotPolicy::Atime,
            hot_timeout: Duration::ZERO,
            cold_policy: ColdPolicy::Count(2),
            interval: Duration::from_secs(3600),
        };
        let engine = MigrationEngine::new(cfg, hot.clone(), cold.clone());

        let rel = put(&hot, "doc.txt", b"some bytes").await;
        engine.new_hot_file(&rel);

        let p = engine.run_cycle().await;
        assert_eq!(p.demoted, 1);
        assert!(engine.hot_timestamp(&rel).is_none());
        assert_eq!(engine.cold_count(&rel), Some(0));
        assert!(!hot.contains(&rel).await);
        assert!(cold.contains(&rel).await);

        // One access is below the threshold.
        engine.access_cold_file(&rel);
        let p = engine.run_cycle().await;
        assert_eq!(p.promoted, 0);
        assert!(cold.contains(&rel).await);

        let before = SystemTime::now();
        engine.access_cold_file(&rel);
        let p = engine.run_cycle().await;
        assert_eq!(p.promoted, 1);
        assert!(engine.cold_count(&rel).is_none());
        assert!(engine.hot_timestamp(&rel).unwrap() >= before);
        assert!(hot.contains(&rel).await);
        assert!(!cold.contains(&rel).await);

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_fresh_hot_file_stays() {
        let (base, hot, cold) = tiers("tierfs_test_migrate_fresh").await;
        let cfg = MigrationConfig {
            hot_timeout: Duration::from_secs(3600),
            ..Default::default()
        };
        let engine = MigrationEngine::new(cfg, hot.clone(), cold);

        let rel = put(&hot, "new.bin", b"x").await;
        engine.new_hot_file(&rel);
        assert!(engine.run_cycle().await.is_idle());
        assert!(hot.contains(&rel).await);
        assert_eq!(engine.hot_tracked(), 1);

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_access_hooks_follow_policy() {
        let (base, hot, cold) = tiers("tierfs_test_migrate_hooks").await;
        let cfg = MigrationConfig {
            hot_policy: HotPolicy::Ctime,
            ..Default::default()
        };
        let engine = MigrationEngine::new(cfg, hot, cold);

        engine.new_hot_file("00/00/a_00000000");
        let ts = engine.hot_timestamp("00/00/a_00000000").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.access_hot_file("00/00/a_00000000");
        assert_eq!(engine.hot_timestamp("00/00/a_00000000"), Some(ts));

        // Untracked hot paths are not picked up by an access.
        engine.access_hot_file("00/00/b_00000000");
        assert_eq!(engine.hot_tracked(), 1);

        engine.access_cold_file("00/01/c_00000000");
        engine.access_cold_file("00/01/c_00000000");
        assert_eq!(engine.cold_count("00/01/c_00000000"), Some(2));

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_atime_access_refreshes_timestamp() {
        let (base, hot, cold) = tiers("tierfs_test_migrate_atime").await;
        let cfg = MigrationConfig {
            hot_policy: HotPolicy::Atime,
            hot_timeout: Duration::from_secs(3600),
            ..Default::default()
        };
        let engine = MigrationEngine::new(cfg, hot.clone(), cold);

        let rel = put(&hot, "read.me", b"payload").await;
        engine.new_hot_file(&rel);
        let created = engine.hot_timestamp(&rel).unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.access_hot_file(&rel);
        let accessed = engine.hot_timestamp(&rel).unwrap();
        assert!(accessed > created);

        // A refreshed file is still young enough to stay hot.
        assert!(engine.run_cycle().await.is_idle());
        assert!(hot.contains(&rel).await);

        engine.access_hot_file("00/00/gone_00000000");
        assert_eq!(engine.hot_tracked(), 1);

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_seed_and_vanished_file() {
        let (base, hot, cold) = tiers("tierfs_test_migrate_seed").await;
        let a = put(&hot, "a", b"1").await;
        let b = put(&cold, "b", b"2").await;

        let cfg = MigrationConfig {
            hot_timeout: Duration::ZERO,
            cold_policy: ColdPolicy::Disabled,
            ..Default::default()
        };
        let engine = MigrationEngine::new(cfg, hot.clone(), cold.clone());
        engine.seed().await.unwrap();
        assert!(engine.hot_timestamp(&a).is_some());
        assert_eq!(engine.cold_count(&b), Some(0));

        hot.remove(&a).await.unwrap();
        let p = engine.run_cycle().await;
        assert!(p.is_idle());
        assert_eq!(engine.hot_tracked(), 0);

        let _ = std::fs::remove_dir_all(&base);
    }
}

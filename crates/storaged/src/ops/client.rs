//! Client uploads and downloads.
//!
//! Uploads always land in the hot tier under a fresh shard bucket and are
//! queued for replication once closed. Downloads read from hot first, then
//! cold, feeding the migration trackers either way.

use tierfs_core::Connection;
use tierfs_proto::constants::{FRAME_STAT_FINISH, FRAME_STAT_OK};
use tierfs_proto::msg::{self, DownloadInfo, DownloadOpen, UploadClose, UploadDone, UploadOpen};
use tierfs_proto::node::{group_path, parse_group_path};
use tierfs_proto::{Command, Frame, FsError, FsResult, Role};
use tracing::{debug, info, warn};

use crate::daemon::SharedSys;
use crate::session::{ClientSession, Download, Tier};
use crate::store::{StoreGroup, Target};

pub async fn handle(
    sys: &SharedSys,
    conn: &Connection,
    s: &mut ClientSession,
    req: Frame,
) -> FsResult<()> {
    match req.cmd {
        Command::UploadOpen => upload_open(sys, conn, s, req).await,
        Command::UploadAppend => upload_append(sys, conn, s, req).await,
        Command::UploadClose => upload_close(sys, conn, s, req).await,
        Command::DownloadOpen => download_open(sys, conn, s, req).await,
        Command::DownloadAppend => download_append(sys, conn, s, req).await,
        cmd => Err(super::unsupported(Role::Client, cmd)),
    }
}

/// Release whatever the client left open.
pub async fn close(sys: &SharedSys, s: ClientSession) {
    if let Some(id) = s.upload {
        debug!("client left upload {} unfinished", id);
        let _ = sys.hot.abort_write(id).await;
    }
    if let Some(d) = s.download {
        let _ = tier(sys, d.tier).close_read(d.file_id);
    }
}

fn tier(sys: &SharedSys, tier: Tier) -> &StoreGroup {
    match tier {
        Tier::Hot => &sys.hot,
        Tier::Cold => &sys.cold,
    }
}

async fn upload_open(
    sys: &SharedSys,
    conn: &Connection,
    s: &mut ClientSession,
    req: Frame,
) -> FsResult<()> {
    if s.upload.is_some() {
        return Err(FsError::Busy);
    }
    let open: UploadOpen = req.decode()?;
    let id = sys.hot.create_file(open.size, Target::Bucket).await?;
    s.upload = Some(id);
    debug!("upload {} opened, {} bytes", id, open.size);
    conn.send_response(&req, FRAME_STAT_OK, Vec::new()).await
}

async fn upload_append(
    sys: &SharedSys,
    conn: &Connection,
    s: &mut ClientSession,
    mut req: Frame,
) -> FsResult<()> {
    let id = s.upload.ok_or(FsError::InvalidParms)?;
    let data = std::mem::take(&mut req.payload);
    if let Err(e) = sys.hot.write(id, data).await {
        if e == FsError::Io {
            s.upload = None;
        }
        return Err(e);
    }
    conn.send_response(&req, FRAME_STAT_OK, Vec::new()).await
}

async fn upload_close(
    sys: &SharedSys,
    conn: &Connection,
    s: &mut ClientSession,
    req: Frame,
) -> FsResult<()> {
    let id = s.upload.ok_or(FsError::InvalidParms)?;
    let close: UploadClose = req.decode()?;
    s.upload = None;

    let (root, rel) = match sys.hot.close_write(id, Some(&close.filename)).await {
        Ok(v) => v,
        Err(e) => {
            // A rejected name leaves the handle open.
            let _ = sys.hot.abort_write(id).await;
            return Err(e);
        }
    };
    info!("stored {} under {}", rel, root.display());

    sys.migrate.new_hot_file(&rel);
    sys.sync.push(rel.clone());

    let payload = msg::encode(&UploadDone {
        path: group_path(sys.group_id(), &rel),
    })?;
    conn.send_response(&req, FRAME_STAT_OK, payload).await
}

async fn download_open(
    sys: &SharedSys,
    conn: &Connection,
    s: &mut ClientSession,
    req: Frame,
) -> FsResult<()> {
    if s.download.is_some() {
        return Err(FsError::Busy);
    }
    let open: DownloadOpen = req.decode()?;
    let (group_id, rel) = parse_group_path(&open.path)?;
    if group_id != sys.group_id() {
        return Err(FsError::NotFound);
    }

    let download = match sys.hot.open_read(rel).await {
        Ok((file_id, size)) => {
            sys.migrate.access_hot_file(rel);
            Download {
                file_id,
                tier: Tier::Hot,
                size,
            }
        }
        Err(FsError::NotFound) => {
            let (file_id, size) = sys.cold.open_read(rel).await?;
            sys.migrate.access_cold_file(rel);
            Download {
                file_id,
                tier: Tier::Cold,
                size,
            }
        }
        Err(e) => return Err(e),
    };

    let payload = msg::encode(&DownloadInfo {
        size: download.size,
    })?;
    debug!("download of {} opened from {:?}", rel, download.tier);
    s.download = Some(download);
    conn.send_response(&req, FRAME_STAT_OK, payload).await
}

async fn download_append(
    sys: &SharedSys,
    conn: &Connection,
    s: &mut ClientSession,
    req: Frame,
) -> FsResult<()> {
    let d = s.download.as_ref().ok_or(FsError::InvalidParms)?;
    let group = tier(sys, d.tier);
    let chunk_size = sys.config.chunk_size.max(1);

    if d.size > sys.config.sendfile_threshold {
        let (file, offset, len) = group.read_segment(d.file_id, chunk_size as u64)?;
        if len > 0 {
            return conn
                .send_file_response(&req, FRAME_STAT_OK, file, offset, len)
                .await;
        }
    } else {
        let chunk = match group.read(d.file_id, chunk_size).await {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("download read failed: {}", e);
                let _ = group.close_read(d.file_id);
                s.download = None;
                return Err(e);
            }
        };
        if !chunk.is_empty() {
            return conn.send_response(&req, FRAME_STAT_OK, chunk).await;
        }
    }

    let _ = group.close_read(d.file_id);
    s.download = None;
    conn.send_response(&req, FRAME_STAT_FINISH, Vec::new()).await
}

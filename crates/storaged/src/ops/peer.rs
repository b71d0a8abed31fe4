//! Requests from other storage nodes of the group.
//!
//! A peer first announces itself with `StorageJoin`, after which this
//! node pushes its own replicas over the same connection. Incoming
//! replicas arrive as one `SyncOpen` followed by `SyncAppend` chunks; the
//! file only becomes visible once the finishing chunk is written.

use tierfs_core::Connection;
use tierfs_proto::constants::{FRAME_STAT_FINISH, FRAME_STAT_OK};
use tierfs_proto::msg::{StorageJoin, SyncOpen};
use tierfs_proto::{Command, Frame, FsError, FsResult, Role};
use tracing::{debug, info, warn};

use crate::daemon::SharedSys;
use crate::session::PeerSession;
use crate::store::Target;

pub async fn handle(
    sys: &SharedSys,
    conn: &Connection,
    s: &mut PeerSession,
    req: Frame,
) -> FsResult<()> {
    match req.cmd {
        Command::StorageJoin => storage_join(sys, conn, s, req).await,
        Command::SyncOpen => sync_open(sys, conn, s, req).await,
        Command::SyncAppend => sync_append(sys, conn, s, req).await,
        cmd => Err(super::unsupported(Role::Storage, cmd)),
    }
}

/// Drop a replica that never finished and forget the peer connection.
pub async fn close(sys: &SharedSys, conn: &Connection, s: PeerSession) {
    if let Some(id) = s.sync {
        warn!(
            "sync from {} cut off, discarding partial file",
            conn.peer_addr()
        );
        let _ = sys.hot.abort_write(id).await;
    }
    if let Some(node) = s.joined {
        sys.peers.remove_closed(&node.addr);
        debug!("peer {} left", node);
    }
}

async fn storage_join(
    sys: &SharedSys,
    conn: &Connection,
    s: &mut PeerSession,
    req: Frame,
) -> FsResult<()> {
    let join: StorageJoin = req.decode()?;
    if join.node.group_id != sys.group_id() {
        warn!("{} tried to join group {}", join.node, sys.group_id());
        return Err(FsError::InvalidParms);
    }
    if sys.peers.try_insert(join.node.addr, conn.clone()) {
        info!("peer {} joined", join.node);
    } else {
        debug!("peer {} already connected", join.node);
    }
    s.joined = Some(join.node);
    conn.send_response(&req, FRAME_STAT_OK, Vec::new()).await
}

async fn sync_open(
    sys: &SharedSys,
    conn: &Connection,
    s: &mut PeerSession,
    req: Frame,
) -> FsResult<()> {
    if s.sync.is_some() {
        return Err(FsError::Busy);
    }
    let open: SyncOpen = req.decode()?;
    let id = sys
        .hot
        .create_file(open.size, Target::Exact(open.rel_path.clone()))
        .await?;
    s.sync = Some(id);
    debug!("receiving {} ({} bytes) from {}", open.rel_path, open.size, conn.peer_addr());
    conn.send_response(&req, FRAME_STAT_OK, Vec::new()).await
}

async fn sync_append(
    sys: &SharedSys,
    conn: &Connection,
    s: &mut PeerSession,
    mut req: Frame,
) -> FsResult<()> {
    let id = s.sync.ok_or(FsError::InvalidParms)?;
    if req.status != FRAME_STAT_OK && req.status != FRAME_STAT_FINISH {
        s.sync = None;
        let _ = sys.hot.abort_write(id).await;
        return Err(FsError::InvalidParms);
    }

    let data = std::mem::take(&mut req.payload);
    if !data.is_empty() {
        if let Err(e) = sys.hot.write(id, data).await {
            s.sync = None;
            let _ = sys.hot.abort_write(id).await;
            return Err(e);
        }
    }

    if req.status == FRAME_STAT_FINISH {
        s.sync = None;
        let (_, rel) = sys.hot.close_write(id, None).await?;
        sys.migrate.new_hot_file(&rel);
        debug!("replica {} from {} complete", rel, conn.peer_addr());
    }
    conn.send_response(&req, FRAME_STAT_OK, Vec::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{start, test_config, SharedSys};
    use crate::master_link::join_peer;
    use crate::ops::StorageHandler;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tierfs_core::client::StorageClient;
    use tierfs_core::{serve, Acceptor, ConnectionConfig, ConnectionHandler};
    use tierfs_proto::msg;
    use tierfs_proto::node::parse_group_path;
    use tierfs_proto::StorageNode;

    /// Accepts a join and the first chunk of a replica, then hangs up.
    struct DyingPeer;

    #[async_trait]
    impl ConnectionHandler for DyingPeer {
        type Session = usize;

        async fn open_session(&self, _conn: &Connection) -> FsResult<usize> {
            Ok(0)
        }

        async fn handle(&self, conn: &Connection, appends: &mut usize, req: Frame) -> FsResult<()> {
            if req.cmd == Command::SyncAppend {
                *appends += 1;
                if *appends == 2 {
                    conn.close();
                    return Err(FsError::ConnectionClosed);
                }
            }
            conn.send_response(&req, FRAME_STAT_OK, Vec::new()).await
        }

        async fn close_session(&self, _conn: &Connection, _appends: usize) {}
    }

    async fn dying_peer() -> StorageNode {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), ConnectionConfig::default())
            .await
            .unwrap();
        let node = StorageNode::new(4, acceptor.local_addr());
        tokio::spawn(async move {
            while let Ok(conn) = acceptor.accept().await {
                tokio::spawn(serve(conn, Arc::new(DyingPeer)));
            }
        });
        node
    }

    async fn wait_for(sys: &SharedSys, rel: &str) -> bool {
        for _ in 0..200 {
            if sys.hot.contains(rel).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).map_or(true, |mut d| d.next().is_none())
    }

    #[tokio::test]
    async fn test_sync_survives_failing_peer() {
        let base = std::env::temp_dir().join("tierfs_test_peer_sync");
        let _ = std::fs::remove_dir_all(&base);

        let mut cfg = test_config(&base.join("src"), 4);
        cfg.sync_chunk_size = 1000;
        let src = start(cfg).await.unwrap();
        let p1 = start(test_config(&base.join("p1"), 4)).await.unwrap();
        let p3 = start(test_config(&base.join("p3"), 4)).await.unwrap();
        let p2 = dying_peer().await;

        let handler = Arc::new(StorageHandler::new(src.clone()));
        for peer in [p1.this_node, p2, p3.this_node] {
            join_peer(&src, &handler, peer).await.unwrap();
        }
        assert_eq!(src.peers.len(), 3);

        let data: Vec<u8> = (0..3500u32).map(|i| (i * 7 % 256) as u8).collect();
        let client = StorageClient::connect(src.listen_addr, &ConnectionConfig::default())
            .await
            .unwrap();
        let path = client
            .upload("replica.bin", data.len() as u64, &data[..], 1024)
            .await
            .unwrap();
        let (_, rel) = parse_group_path(&path).unwrap();

        assert!(wait_for(&p1, rel).await);
        assert!(wait_for(&p3, rel).await);
        let hot_root = |node: &str| base.join(node).join("hot0");
        assert_eq!(std::fs::read(hot_root("p1").join(rel)).unwrap(), data);
        assert_eq!(std::fs::read(hot_root("p3").join(rel)).unwrap(), data);
        assert!(p1.migrate.hot_timestamp(rel).is_some());

        // The dying peer is gone from the registry once its connection drops.
        assert!(!src.peers.contains(&p2.addr));

        client.close();
        for sys in [&src, &p1, &p3] {
            sys.shutdown();
        }
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_cut_stream_leaves_no_file() {
        let base = std::env::temp_dir().join("tierfs_test_peer_cut");
        let _ = std::fs::remove_dir_all(&base);
        let peer = start(test_config(&base, 6)).await.unwrap();

        let conn = Connection::connect(
            peer.listen_addr,
            Role::Storage,
            Role::Storage,
            &ConnectionConfig::default(),
        )
        .await
        .unwrap();
        let rel = "AB/CD/cut.bin_Zz9Yy8Xx";
        let open = msg::encode(&SyncOpen {
            size: 100,
            rel_path: rel.to_string(),
        })
        .unwrap();
        conn.request(Command::SyncOpen, FRAME_STAT_OK, open)
            .await
            .unwrap()
            .check_status()
            .unwrap();

        // Only one sync per connection.
        let again = msg::encode(&SyncOpen {
            size: 1,
            rel_path: "AB/CD/other_00000000".into(),
        })
        .unwrap();
        let busy = conn
            .request(Command::SyncOpen, FRAME_STAT_OK, again)
            .await
            .unwrap();
        assert_eq!(busy.check_status(), Err(FsError::Busy));

        conn.request(Command::SyncAppend, FRAME_STAT_OK, vec![1u8; 50])
            .await
            .unwrap()
            .check_status()
            .unwrap();
        conn.close();

        let bucket = base.join("hot0").join("AB/CD");
        let mut cleaned = false;
        for _ in 0..100 {
            if dir_is_empty(&bucket) {
                cleaned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(cleaned);
        assert!(!peer.hot.contains(rel).await);

        peer.shutdown();
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_join_from_other_group_is_refused() {
        let base = std::env::temp_dir().join("tierfs_test_peer_group");
        let _ = std::fs::remove_dir_all(&base);
        let peer = start(test_config(&base, 1)).await.unwrap();

        let conn = Connection::connect(
            peer.listen_addr,
            Role::Storage,
            Role::Storage,
            &ConnectionConfig::default(),
        )
        .await
        .unwrap();
        let join = msg::encode(&StorageJoin {
            node: StorageNode::new(2, "127.0.0.1:1".parse().unwrap()),
        })
        .unwrap();
        let resp = conn
            .request(Command::StorageJoin, FRAME_STAT_OK, join)
            .await
            .unwrap();
        assert_eq!(resp.check_status(), Err(FsError::InvalidParms));
        assert!(peer.peers.is_empty());

        conn.close();
        peer.shutdown();
        let _ = std::fs::remove_dir_all(&base);
    }
}

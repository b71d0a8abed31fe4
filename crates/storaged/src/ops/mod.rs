//! Command dispatch for the storage node.
//!
//! One [`StorageHandler`] serves every connection. The session it opens
//! depends on the peer's role, and each role has its own command table:
//! clients upload and download, storage peers join and push replicas, the
//! master asks for free space. `Metrics` is answered for every role.

pub mod client;
pub mod master;
pub mod peer;

use async_trait::async_trait;
use tierfs_core::{Connection, ConnectionHandler};
use tierfs_proto::constants::FRAME_STAT_OK;
use tierfs_proto::{msg, Command, Frame, FsError, FsResult, Role};
use tracing::debug;

use crate::daemon::SharedSys;
use crate::session::{ClientSession, PeerSession, Session};

pub struct StorageHandler {
    sys: SharedSys,
}

impl StorageHandler {
    pub fn new(sys: SharedSys) -> Self {
        Self { sys }
    }
}

async fn metrics(sys: &SharedSys, conn: &Connection, req: &Frame) -> FsResult<()> {
    let payload = msg::encode(&sys.storage_metrics())?;
    conn.send_response(req, FRAME_STAT_OK, payload).await
}

#[async_trait]
impl ConnectionHandler for StorageHandler {
    type Session = Session;

    async fn open_session(&self, conn: &Connection) -> FsResult<Session> {
        Ok(match conn.peer_role() {
            Role::Client => Session::Client(ClientSession::default()),
            Role::Storage => Session::Storage(PeerSession::default()),
            Role::Master => Session::Master,
        })
    }

    async fn handle(&self, conn: &Connection, session: &mut Session, req: Frame) -> FsResult<()> {
        if req.cmd == Command::Metrics {
            return metrics(&self.sys, conn, &req).await;
        }
        match session {
            Session::Client(s) => client::handle(&self.sys, conn, s, req).await,
            Session::Storage(s) => peer::handle(&self.sys, conn, s, req).await,
            Session::Master => master::handle(&self.sys, conn, req).await,
        }
    }

    async fn close_session(&self, conn: &Connection, session: Session) {
        debug!(
            "session with {} ({}) closed",
            conn.peer_addr(),
            conn.peer_role()
        );
        match session {
            Session::Client(s) => client::close(&self.sys, s).await,
            Session::Storage(s) => peer::close(&self.sys, conn, s).await,
            Session::Master => {}
        }
    }
}

/// Reply for a command the session's role may not send.
fn unsupported(role: Role, cmd: Command) -> FsError {
    debug!("{} sent {}, not valid for its role", role, cmd);
    FsError::Unsupported
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{start, test_config};
    use tierfs_core::client::StorageClient;
    use tierfs_core::ConnectionConfig;
    use tierfs_proto::msg::UploadOpen;
    use tierfs_proto::node::parse_group_path;

    const MIB: usize = 1024 * 1024;

    #[tokio::test]
    async fn test_upload_download_end_to_end() {
        let base = std::env::temp_dir().join("tierfs_test_ops_e2e");
        let _ = std::fs::remove_dir_all(&base);
        let sys = start(test_config(&base, 2)).await.unwrap();

        let data: Vec<u8> = (0..12 * MIB).map(|i| (i % 253) as u8).collect();
        let client = StorageClient::connect(sys.listen_addr, &ConnectionConfig::default())
            .await
            .unwrap();
        let path = client
            .upload("movie.mkv", data.len() as u64, &data[..], 5 * MIB)
            .await
            .unwrap();
        assert!(path.starts_with("2/"));
        let (_, rel) = parse_group_path(&path).unwrap();
        assert!(rel.contains("movie.mkv_"));
        assert!(sys.hot.contains(rel).await);
        assert!(sys.migrate.hot_timestamp(rel).is_some());

        // Larger than the sendfile threshold, so served zero-copy.
        assert!(data.len() as u64 > sys.config.sendfile_threshold);
        let mut out = Vec::new();
        let n = client.download(&path, &mut out).await.unwrap();
        assert_eq!(n, data.len() as u64);
        assert!(out == data);

        let m = client.metrics().await.unwrap();
        assert_eq!(m.node.group_id, 2);
        assert_eq!(m.hot_tracked, 1);

        client.close();
        sys.shutdown();
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_small_download_from_cold_tier() {
        let base = std::env::temp_dir().join("tierfs_test_ops_cold");
        let _ = std::fs::remove_dir_all(&base);
        let sys = start(test_config(&base, 7)).await.unwrap();

        let client = StorageClient::connect(sys.listen_addr, &ConnectionConfig::default())
            .await
            .unwrap();
        let data = b"cold bytes".to_vec();
        let path = client
            .upload("note.txt", data.len() as u64, &data[..], 4)
            .await
            .unwrap();
        let (_, rel) = parse_group_path(&path).unwrap();

        sys.cold.copy_from_another_store(&sys.hot, rel).await.unwrap();
        sys.hot.remove(rel).await.unwrap();

        let mut out = Vec::new();
        client.download(&path, &mut out).await.unwrap();
        assert_eq!(out, data);
        assert_eq!(sys.migrate.cold_count(rel), Some(1));

        client.close();
        sys.shutdown();
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_client_session_rules() {
        let base = std::env::temp_dir().join("tierfs_test_ops_rules");
        let _ = std::fs::remove_dir_all(&base);
        let sys = start(test_config(&base, 1)).await.unwrap();

        let client = StorageClient::connect(sys.listen_addr, &ConnectionConfig::default())
            .await
            .unwrap();
        let conn = client.connection();

        let open = msg::encode(&UploadOpen { size: 10 }).unwrap();
        conn.request(Command::UploadOpen, FRAME_STAT_OK, open.clone())
            .await
            .unwrap()
            .check_status()
            .unwrap();
        let second = conn
            .request(Command::UploadOpen, FRAME_STAT_OK, open)
            .await
            .unwrap();
        assert_eq!(second.check_status(), Err(FsError::Busy));

        let mut sink = Vec::new();
        assert_eq!(
            client.download("9/00/00/x_00000000", &mut sink).await,
            Err(FsError::NotFound)
        );
        assert_eq!(
            client.download("1/00/00/x_00000000", &mut sink).await,
            Err(FsError::NotFound)
        );

        // Clients may not drive replication.
        let resp = conn
            .request(Command::SyncAppend, FRAME_STAT_OK, Vec::new())
            .await
            .unwrap();
        assert_eq!(resp.check_status(), Err(FsError::Unsupported));
        assert!(!conn.is_closed());

        client.close();
        sys.shutdown();
        let _ = std::fs::remove_dir_all(&base);
    }
}

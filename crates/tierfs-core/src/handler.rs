//! Per-connection request dispatch.
//!
//! [`serve`] drives one connection: it opens a typed session through the
//! [`ConnectionHandler`], feeds it inbound requests in arrival order until
//! the connection closes, then hands the session back for cleanup.
//! Different connections are served by different tasks.

use std::sync::Arc;

use async_trait::async_trait;
use tierfs_proto::{Frame, FsError, FsResult};
use tracing::{debug, warn};

use crate::connection::Connection;

/// Dispatch logic for one role's connections.
///
/// On success `handle` must have answered the request itself (responses
/// vary: plain frames, file-backed frames, finish markers). On error the
/// serve loop answers with the error's status code.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Per-connection state, selected once from the peer's role.
    type Session: Send;

    async fn open_session(&self, conn: &Connection) -> FsResult<Self::Session>;

    async fn handle(
        &self,
        conn: &Connection,
        session: &mut Self::Session,
        req: Frame,
    ) -> FsResult<()>;

    /// Release whatever the session still holds. Called exactly once.
    async fn close_session(&self, conn: &Connection, session: Self::Session);
}

/// Serve `conn` until it closes.
pub async fn serve<H: ConnectionHandler>(conn: Connection, handler: Arc<H>) {
    let mut session = match handler.open_session(&conn).await {
        Ok(session) => session,
        Err(e) => {
            warn!(
                "conn: refusing {} ({}): {}",
                conn.peer_addr(),
                conn.peer_role(),
                e
            );
            conn.close();
            return;
        }
    };

    while let Ok(req) = conn.recv_request().await {
        let (id, cmd) = (req.id, req.cmd);
        let Err(e) = handler.handle(&conn, &mut session, req).await else {
            continue;
        };

        if e == FsError::ProtocolViolation {
            conn.close_with(e);
            break;
        }
        if e.is_fatal_to_connection() {
            break;
        }
        debug!("conn: {} from {} failed: {}", cmd, conn.peer_addr(), e);
        if conn.send_error(id, cmd, e).await.is_err() {
            break;
        }
    }

    handler.close_session(&conn, session).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::Acceptor;
    use crate::connection::ConnectionConfig;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tierfs_proto::constants::FRAME_STAT_OK;
    use tierfs_proto::{Command, Role};

    /// Appends every chunk to one buffer per connection.
    #[derive(Default)]
    struct Collect {
        closed: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl ConnectionHandler for Collect {
        type Session = Vec<u8>;

        async fn open_session(&self, conn: &Connection) -> FsResult<Vec<u8>> {
            match conn.peer_role() {
                Role::Client => Ok(Vec::new()),
                _ => Err(FsError::Unsupported),
            }
        }

        async fn handle(&self, conn: &Connection, buf: &mut Vec<u8>, req: Frame) -> FsResult<()> {
            match req.cmd {
                Command::UploadAppend => {
                    buf.extend_from_slice(&req.payload);
                    conn.send_response(&req, FRAME_STAT_OK, Vec::new()).await
                }
                Command::HeartbeatEstablish => Err(FsError::ProtocolViolation),
                _ => Err(FsError::Unsupported),
            }
        }

        async fn close_session(&self, _conn: &Connection, buf: Vec<u8>) {
            self.closed.lock().push(buf);
        }
    }

    #[tokio::test]
    async fn test_serve_orders_requests_and_reports_errors() {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), ConnectionConfig::default())
            .await
            .unwrap();
        let addr = acceptor.local_addr();
        let handler = Arc::new(Collect::default());

        let server = {
            let handler = handler.clone();
            tokio::spawn(async move {
                let conn = acceptor.accept().await.unwrap();
                serve(conn, handler).await;
            })
        };

        let conn = Connection::connect(addr, Role::Client, Role::Storage, &ConnectionConfig::default())
            .await
            .unwrap();
        let mut ids = Vec::new();
        for chunk in [b"ab".as_slice(), b"cd", b"ef"] {
            ids.push(
                conn.send_request(Command::UploadAppend, FRAME_STAT_OK, chunk.to_vec())
                    .await
                    .unwrap(),
            );
        }
        for id in ids {
            conn.recv_response(id).await.unwrap().check_status().unwrap();
        }

        let resp = conn
            .request(Command::Metrics, FRAME_STAT_OK, Vec::new())
            .await
            .unwrap();
        assert_eq!(resp.check_status(), Err(FsError::Unsupported));
        assert!(!conn.is_closed());

        // A violation reported by the handler drops the connection.
        let res = conn
            .request(Command::HeartbeatEstablish, FRAME_STAT_OK, Vec::new())
            .await;
        assert_eq!(res.unwrap_err(), FsError::ConnectionClosed);

        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*handler.closed.lock(), vec![b"abcdef".to_vec()]);
    }

    #[tokio::test]
    async fn test_serve_refuses_unexpected_role() {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), ConnectionConfig::default())
            .await
            .unwrap();
        let addr = acceptor.local_addr();
        let handler = Arc::new(Collect::default());

        let server = {
            let handler = handler.clone();
            tokio::spawn(async move {
                let conn = acceptor.accept().await.unwrap();
                serve(conn, handler).await;
            })
        };

        let conn = Connection::connect(addr, Role::Master, Role::Storage, &ConnectionConfig::default())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .unwrap();
        server.await.unwrap();
        assert!(handler.closed.lock().is_empty());
    }
}

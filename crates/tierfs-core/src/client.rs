//! Client-side helpers for talking to a master and to storage nodes.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use tierfs_proto::constants::{FRAME_STAT_FINISH, FRAME_STAT_OK};
use tierfs_proto::msg::{
    self, DownloadInfo, DownloadOpen, LocateDownload, LocateUpload, Location, PeerList,
    PeerListRequest, StorageMetrics, UploadClose, UploadDone, UploadOpen,
};
use tierfs_proto::{Command, FsError, FsResult, Role, StorageNode};

use crate::connection::{Connection, ConnectionConfig};

/// Connection to the master, used for placement lookups.
pub struct MasterClient {
    conn: Connection,
}

impl MasterClient {
    pub async fn connect(addr: SocketAddr, cfg: &ConnectionConfig) -> FsResult<Self> {
        let conn = Connection::connect(addr, Role::Client, Role::Master, cfg).await?;
        Ok(Self { conn })
    }

    /// Pick a storage node able to hold `size` bytes.
    pub async fn locate_upload(&self, size: u64) -> FsResult<StorageNode> {
        let payload = msg::encode(&LocateUpload { size })?;
        let resp = self
            .conn
            .request(Command::LocateUpload, FRAME_STAT_OK, payload)
            .await?;
        Ok(resp.decode_ok::<Location>()?.node)
    }

    /// Pick a storage node of `group_id` to read from.
    pub async fn locate_download(&self, group_id: u32) -> FsResult<StorageNode> {
        let payload = msg::encode(&LocateDownload { group_id })?;
        let resp = self
            .conn
            .request(Command::LocateDownload, FRAME_STAT_OK, payload)
            .await?;
        Ok(resp.decode_ok::<Location>()?.node)
    }

    /// Members of `group_id` known to the master.
    pub async fn peer_list(&self, group_id: u32) -> FsResult<Vec<StorageNode>> {
        let payload = msg::encode(&PeerListRequest {
            group_id,
            exclude: None,
        })?;
        let resp = self
            .conn
            .request(Command::PeerList, FRAME_STAT_OK, payload)
            .await?;
        Ok(resp.decode_ok::<PeerList>()?.peers)
    }

    pub fn close(&self) {
        self.conn.close();
    }
}

/// Connection to one storage node.
pub struct StorageClient {
    conn: Connection,
}

impl StorageClient {
    pub async fn connect(addr: SocketAddr, cfg: &ConnectionConfig) -> FsResult<Self> {
        let conn = Connection::connect(addr, Role::Client, Role::Storage, cfg).await?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Upload `size` bytes read from `src` in `chunk_size` pieces.
    ///
    /// Returns the stored path, `"<group_id>/<rel_path>"`.
    pub async fn upload<R: AsyncRead + Unpin>(
        &self,
        filename: &str,
        size: u64,
        mut src: R,
        chunk_size: usize,
    ) -> FsResult<String> {
        let payload = msg::encode(&UploadOpen { size })?;
        self.conn
            .request(Command::UploadOpen, FRAME_STAT_OK, payload)
            .await?
            .check_status()?;

        let mut sent = 0u64;
        while sent < size {
            let want = (size - sent).min(chunk_size.max(1) as u64) as usize;
            let mut chunk = vec![0u8; want];
            src.read_exact(&mut chunk).await?;
            self.conn
                .request(Command::UploadAppend, FRAME_STAT_OK, chunk)
                .await?
                .check_status()?;
            sent += want as u64;
        }

        let payload = msg::encode(&UploadClose {
            filename: filename.to_string(),
        })?;
        let resp = self
            .conn
            .request(Command::UploadClose, FRAME_STAT_OK, payload)
            .await?;
        let done: UploadDone = resp.decode_ok()?;
        debug!("uploaded {} bytes as {}", size, done.path);
        Ok(done.path)
    }

    /// Download `path` into `dst`. Returns the number of bytes written.
    pub async fn download<W: AsyncWrite + Unpin>(&self, path: &str, mut dst: W) -> FsResult<u64> {
        let payload = msg::encode(&DownloadOpen {
            path: path.to_string(),
        })?;
        let resp = self
            .conn
            .request(Command::DownloadOpen, FRAME_STAT_OK, payload)
            .await?;
        let info: DownloadInfo = resp.decode_ok()?;

        let mut received = 0u64;
        loop {
            let chunk = self
                .conn
                .request(Command::DownloadAppend, FRAME_STAT_OK, Vec::new())
                .await?;
            chunk.check_status()?;
            if !chunk.payload.is_empty() {
                dst.write_all(&chunk.payload).await?;
                received += chunk.payload.len() as u64;
            }
            if chunk.status == FRAME_STAT_FINISH {
                break;
            }
            if received > info.size {
                return Err(FsError::ProtocolViolation);
            }
        }
        dst.flush().await?;

        if received != info.size {
            return Err(FsError::Io);
        }
        Ok(received)
    }

    pub async fn metrics(&self) -> FsResult<StorageMetrics> {
        let resp = self
            .conn
            .request(Command::Metrics, FRAME_STAT_OK, Vec::new())
            .await?;
        resp.decode_ok()
    }

    pub fn close(&self) {
        self.conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tierfs_proto::constants::FRAME_HEADER_LEN;
    use tierfs_proto::msg::{HeartbeatParams, Hello};
    use tierfs_proto::{Frame, FrameHeader, FrameKind};
    use tokio::net::{TcpListener, TcpStream};

    async fn read_raw(stream: &mut TcpStream) -> Frame {
        let mut hdr = [0u8; FRAME_HEADER_LEN];
        stream.read_exact(&mut hdr).await.unwrap();
        let header = FrameHeader::decode(&hdr).unwrap();
        let mut payload = vec![0u8; header.payload_len as usize];
        stream.read_exact(&mut payload).await.unwrap();
        Frame::from_parts(header, payload)
    }

    async fn write_raw(stream: &mut TcpStream, frame: &Frame) {
        stream.write_all(&frame.header().unwrap().encode()).await.unwrap();
        stream.write_all(&frame.payload).await.unwrap();
    }

    /// Next non-ping request from the client.
    async fn next_request(stream: &mut TcpStream) -> Frame {
        loop {
            let frame = read_raw(stream).await;
            if frame.cmd != Command::HeartbeatPing {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_mid_download() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // A storage node that answers DownloadOpen and then falls silent.
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let params = msg::encode(&HeartbeatParams {
                timeout_ms: 300,
                interval_ms: 100,
            })
            .unwrap();
            write_raw(
                &mut stream,
                &Frame::request(Command::HeartbeatEstablish, FRAME_STAT_OK, params),
            )
            .await;
            let hello = read_raw(&mut stream).await;
            assert_eq!(hello.kind, FrameKind::Response);
            let hello: Hello = hello.decode_ok().unwrap();
            assert_eq!(hello.role, Role::Client);

            let open = next_request(&mut stream).await;
            assert_eq!(open.cmd, Command::DownloadOpen);
            let info = msg::encode(&DownloadInfo { size: 100 }).unwrap();
            write_raw(&mut stream, &Frame::response_to(&open, FRAME_STAT_OK, info)).await;

            // Keep the socket open but never answer again.
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let client = StorageClient::connect(addr, &ConnectionConfig::default())
            .await
            .unwrap();
        let started = Instant::now();
        let mut sink = Vec::new();
        let err = client.download("1/00/00/f_00000000", &mut sink).await.unwrap_err();
        assert!(matches!(
            err,
            FsError::ConnectionClosed | FsError::HeartbeatTimeout
        ));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(client.connection().close_reason(), Some(FsError::HeartbeatTimeout));

        server.abort();
    }
}

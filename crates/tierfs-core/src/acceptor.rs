//! Listening side of the connection handshake.
//!
//! The accept loop runs in its own task and spawns one handshake task per
//! socket; finished connections are handed to [`Acceptor::accept`] callers
//! through a channel, so a slow or silent peer never stalls the listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

use tierfs_proto::defaults::DEFAULT_ACCEPT_CHANNEL_SIZE;
use tierfs_proto::{FsError, FsResult};

use crate::connection::{handshake_accepted, Connection, ConnectionConfig};
use crate::net;

/// Produces ready, handshaken [`Connection`]s.
pub struct Acceptor {
    local_addr: SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    shutdown: Arc<Notify>,
}

impl Acceptor {
    /// Bind `addr` and start accepting. Port 0 picks an ephemeral port;
    /// see [`local_addr`](Acceptor::local_addr).
    pub async fn bind(addr: SocketAddr, cfg: ConnectionConfig) -> FsResult<Self> {
        let listener = net::create_listen_socket(addr).await?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = mpsc::channel(DEFAULT_ACCEPT_CHANNEL_SIZE);
        let shutdown = Arc::new(Notify::new());
        tokio::spawn(accept_loop(listener, tx, Arc::new(cfg), shutdown.clone()));

        Ok(Self {
            local_addr,
            incoming: tokio::sync::Mutex::new(rx),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next connection that completed its handshake.
    pub async fn accept(&self) -> FsResult<Connection> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(FsError::ConnectionClosed)
    }

    /// Stop listening. Connections already handed out are unaffected.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<Connection>,
    cfg: Arc<ConnectionConfig>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let tx = tx.clone();
                        let cfg = cfg.clone();
                        tokio::spawn(async move {
                            match handshake_accepted(stream, &cfg).await {
                                Ok(conn) => {
                                    debug!("conn: {} joined as {}", peer_addr, conn.peer_role());
                                    if tx.send(conn).await.is_err() {
                                        debug!("conn: acceptor gone, dropping {}", peer_addr);
                                    }
                                }
                                Err(e) => warn!("conn: handshake with {} failed: {}", peer_addr, e),
                            }
                        });
                    }
                    Err(e) => {
                        error!("conn: accept error: {}", e);
                        // Typically fd exhaustion; back off instead of spinning.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = shutdown.notified() => {
                debug!("conn: listener shutting down");
                break;
            }
        }
    }
}

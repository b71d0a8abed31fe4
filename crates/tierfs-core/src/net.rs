//! Async TCP helpers for tierfs.

use std::net::SocketAddr;
use tierfs_proto::{FsError, FsResult};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

/// Connect to a socket address.
pub async fn connect_to_addr(addr: SocketAddr) -> FsResult<TcpStream> {
    debug!("connecting to {}", addr);
    let stream = TcpStream::connect(addr).await.map_err(|e| {
        debug!("connect to {} failed: {}", addr, e);
        FsError::PeerUnreachable
    })?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Create a TCP listener on the given address.
pub async fn create_listen_socket(addr: SocketAddr) -> FsResult<TcpListener> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("failed to bind to {}: {}", addr, e);
        FsError::SystemError
    })?;

    debug!("listening on {}", addr);
    Ok(listener)
}

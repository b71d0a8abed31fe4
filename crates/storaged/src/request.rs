//! Accept loop: every handshaken connection gets its own serve task.

use std::sync::Arc;

use tierfs_core::{serve, Acceptor};
use tracing::{debug, info};

use crate::daemon::SharedSys;
use crate::ops::StorageHandler;

pub async fn accept_loop(sys: SharedSys, acceptor: Acceptor) {
    let handler = Arc::new(StorageHandler::new(sys.clone()));
    let mut shutdown = sys.shutdown_signal();

    loop {
        tokio::select! {
            res = acceptor.accept() => {
                let Ok(conn) = res else {
                    break;
                };
                debug!(
                    "accepted {} connection from {}",
                    conn.peer_role(),
                    conn.peer_addr()
                );
                tokio::spawn(serve(conn, handler.clone()));
            }
            _ = shutdown.changed() => break,
        }
    }
    acceptor.shutdown();
    info!("accept loop stopped");
}

//! Link to the master: registration, peer discovery and reconnects.

use std::net::SocketAddr;
use std::sync::Arc;

use tierfs_core::{serve, Connection};
use tierfs_proto::constants::FRAME_STAT_OK;
use tierfs_proto::msg::{self, PeerList, PeerListRequest, StorageJoin, StorageRegister};
use tierfs_proto::{Command, FsError, FsResult, Role, StorageNode};
use tracing::{debug, error, info, warn};

use crate::daemon::SharedSys;
use crate::ops::StorageHandler;

/// Connect and register, returning the group's other members.
async fn establish(sys: &SharedSys, master: SocketAddr) -> FsResult<(Connection, Vec<StorageNode>)> {
    let conn = Connection::connect(master, Role::Storage, Role::Master, &sys.config.conn).await?;
    let payload = msg::encode(&StorageRegister {
        node: sys.this_node,
    })?;
    let list: PeerList = conn
        .request(Command::StorageRegister, FRAME_STAT_OK, payload)
        .await?
        .decode_ok()?;
    Ok((conn, list.peers))
}

/// [`establish`] with exponential backoff, giving up after the retry budget.
async fn establish_with_backoff(
    sys: &SharedSys,
    master: SocketAddr,
) -> FsResult<(Connection, Vec<StorageNode>)> {
    let budget = sys.config.master_retry_budget.max(1);
    let mut delay = sys.config.master_backoff_initial;

    for attempt in 1..=budget {
        match establish(sys, master).await {
            Ok(v) => {
                info!("registered with master {} as {}", master, sys.this_node);
                return Ok(v);
            }
            Err(e) => warn!(
                "master {} unreachable (attempt {}/{}): {}",
                master, attempt, budget, e
            ),
        }
        if attempt < budget {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(sys.config.master_backoff_max);
        }
    }
    error!("giving up on master {} after {} attempts", master, budget);
    Err(FsError::PeerUnreachable)
}

async fn fetch_peers(sys: &SharedSys, conn: &Connection) -> FsResult<Vec<StorageNode>> {
    let payload = msg::encode(&PeerListRequest {
        group_id: sys.group_id(),
        exclude: Some(sys.this_node.addr),
    })?;
    let list: PeerList = conn
        .request(Command::PeerList, FRAME_STAT_OK, payload)
        .await?
        .decode_ok()?;
    Ok(list.peers)
}

/// Open a replication connection to `peer` and register it.
pub async fn join_peer(
    sys: &SharedSys,
    handler: &Arc<StorageHandler>,
    peer: StorageNode,
) -> FsResult<()> {
    let conn = Connection::connect(peer.addr, Role::Storage, Role::Storage, &sys.config.conn).await?;
    let payload = msg::encode(&StorageJoin {
        node: sys.this_node,
    })?;
    conn.request(Command::StorageJoin, FRAME_STAT_OK, payload)
        .await?
        .check_status()?;

    if !sys.peers.try_insert(peer.addr, conn.clone()) {
        debug!("already connected to peer {}", peer);
        conn.close();
        return Ok(());
    }
    info!("joined peer {}", peer);
    tokio::spawn(serve(conn, handler.clone()));
    Ok(())
}

/// Connect to every listed peer this node is not yet connected to.
fn join_peers(sys: &SharedSys, handler: &Arc<StorageHandler>, peers: Vec<StorageNode>) {
    for peer in peers {
        if peer.addr == sys.this_node.addr
            || peer.group_id != sys.group_id()
            || sys.peers.contains(&peer.addr)
        {
            continue;
        }
        let sys = sys.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = join_peer(&sys, &handler, peer).await {
                warn!("failed to join peer {}: {}", peer, e);
            }
        });
    }
}

/// Keep the node registered with `master` until shutdown.
///
/// Returns `PeerUnreachable` once a (re)connect exhausts its retry budget.
pub async fn run(sys: SharedSys, master: SocketAddr) -> FsResult<()> {
    let handler = Arc::new(StorageHandler::new(sys.clone()));
    let mut shutdown = sys.shutdown_signal();

    loop {
        let (conn, peers) = establish_with_backoff(&sys, master).await?;
        tokio::spawn(serve(conn.clone(), handler.clone()));
        join_peers(&sys, &handler, peers);

        let mut ticker = tokio::time::interval(sys.config.peer_refresh_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = conn.closed() => {
                    if sys.is_shutting_down() {
                        return Ok(());
                    }
                    warn!("lost connection to master {}", master);
                    break;
                }
                _ = shutdown.changed() => {
                    conn.close();
                    return Ok(());
                }
                _ = ticker.tick() => match fetch_peers(&sys, &conn).await {
                    Ok(peers) => join_peers(&sys, &handler, peers),
                    Err(e) => debug!("peer list refresh failed: {}", e),
                },
            }
        }
    }
}

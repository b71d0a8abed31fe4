//! Group registry and placement.
//!
//! Storage nodes register over a long-lived connection and stay members of
//! their group until that connection closes. The same connection is used to
//! ask members for their free space when placing an upload.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tierfs_core::{serve, Acceptor, Connection, ConnectionHandler};
use tierfs_proto::constants::FRAME_STAT_OK;
use tierfs_proto::msg::{
    self, FreeSpace, LocateDownload, LocateUpload, Location, PeerList, PeerListRequest,
    StorageRegister,
};
use tierfs_proto::{Command, Frame, FsError, FsResult, Role, StorageNode};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// A registered storage node and the connection it registered on.
struct Member {
    node: StorageNode,
    conn: Connection,
}

#[derive(Default)]
struct Groups {
    members: BTreeMap<u32, Vec<Member>>,
    /// Position in the group order where the next upload search starts.
    upload_cursor: usize,
    download_cursor: HashMap<u32, usize>,
}

impl Groups {
    fn live(&self, group_id: u32) -> Vec<(StorageNode, Connection)> {
        self.members
            .get(&group_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| !m.conn.is_closed())
                    .map(|m| (m.node, m.conn.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Per-connection state: the node this connection registered, if any.
#[derive(Default)]
pub struct MasterSession {
    registered: Option<StorageNode>,
}

pub struct MasterHandler {
    groups: Mutex<Groups>,
}

impl Default for MasterHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterHandler {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(Groups::default()),
        }
    }

    /// Add `node` to its group, replacing an older entry for the same
    /// address, and return the other members.
    pub fn register(&self, node: StorageNode, conn: Connection) -> Vec<StorageNode> {
        let mut groups = self.groups.lock();
        let members = groups.members.entry(node.group_id).or_default();
        members.retain(|m| m.node.addr != node.addr);
        members.push(Member { node, conn });
        drop(groups);
        self.peers(node.group_id, Some(node.addr))
    }

    /// Forget `node` if the connection it registered on is gone.
    pub fn unregister(&self, node: &StorageNode) {
        let mut groups = self.groups.lock();
        let Some(members) = groups.members.get_mut(&node.group_id) else {
            return;
        };
        members.retain(|m| !(m.node.addr == node.addr && m.conn.is_closed()));
        if members.is_empty() {
            groups.members.remove(&node.group_id);
            groups.download_cursor.remove(&node.group_id);
        }
    }

    /// Live members of `group_id`, minus `exclude`.
    pub fn peers(&self, group_id: u32, exclude: Option<SocketAddr>) -> Vec<StorageNode> {
        self.groups
            .lock()
            .live(group_id)
            .into_iter()
            .map(|(node, _)| node)
            .filter(|node| Some(node.addr) != exclude)
            .collect()
    }

    /// Pick the node with the most free space in the first group, in
    /// round-robin order, that can hold `size` bytes.
    pub async fn locate_upload(&self, size: u64) -> FsResult<StorageNode> {
        let (start, order) = {
            let groups = self.groups.lock();
            let ids: Vec<u32> = groups.members.keys().copied().collect();
            if ids.is_empty() {
                return Err(FsError::NotFound);
            }
            let start = groups.upload_cursor % ids.len();
            let order: Vec<Vec<(StorageNode, Connection)>> = ids[start..]
                .iter()
                .chain(&ids[..start])
                .map(|id| groups.live(*id))
                .collect();
            (start, order)
        };

        for (i, members) in order.into_iter().enumerate() {
            match max_free_member(members).await {
                Some((node, free)) if free >= size => {
                    self.groups.lock().upload_cursor = start + i + 1;
                    debug!("upload of {} bytes placed on {} ({} free)", size, node, free);
                    return Ok(node);
                }
                Some((node, free)) => {
                    debug!("group {} too full for {} bytes ({} free)", node.group_id, size, free)
                }
                None => {}
            }
        }
        warn!("no group can hold {} bytes", size);
        Err(FsError::OutOfSpace)
    }

    /// Next member of `group_id` in round-robin order.
    pub fn locate_download(&self, group_id: u32) -> FsResult<StorageNode> {
        let mut groups = self.groups.lock();
        let live = groups.live(group_id);
        if live.is_empty() {
            return Err(FsError::NotFound);
        }
        let cursor = groups.download_cursor.entry(group_id).or_insert(0);
        let node = live[*cursor % live.len()].0;
        *cursor = cursor.wrapping_add(1);
        Ok(node)
    }
}

/// Ask every member for its largest free store and return the best one.
async fn max_free_member(members: Vec<(StorageNode, Connection)>) -> Option<(StorageNode, u64)> {
    let mut set = JoinSet::new();
    for (node, conn) in members {
        set.spawn(async move {
            let res = conn
                .request(Command::MaxFreeSpace, FRAME_STAT_OK, Vec::new())
                .await
                .and_then(|resp| resp.decode_ok::<FreeSpace>());
            (node, res)
        });
    }

    let mut best: Option<(StorageNode, u64)> = None;
    while let Some(joined) = set.join_next().await {
        let Ok((node, res)) = joined else {
            continue;
        };
        match res {
            Ok(fs) if best.map_or(true, |(_, free)| fs.max_free > free) => {
                best = Some((node, fs.max_free));
            }
            Ok(_) => {}
            Err(e) => debug!("free space query to {} failed: {}", node, e),
        }
    }
    best
}

#[async_trait]
impl ConnectionHandler for MasterHandler {
    type Session = MasterSession;

    async fn open_session(&self, _conn: &Connection) -> FsResult<MasterSession> {
        Ok(MasterSession::default())
    }

    async fn handle(&self, conn: &Connection, s: &mut MasterSession, req: Frame) -> FsResult<()> {
        let payload = match req.cmd {
            Command::StorageRegister => {
                if conn.peer_role() != Role::Storage {
                    return Err(FsError::Unsupported);
                }
                let reg: StorageRegister = req.decode()?;
                if s.registered.is_some_and(|old| old != reg.node) {
                    return Err(FsError::InvalidParms);
                }
                let peers = self.register(reg.node, conn.clone());
                if s.registered.replace(reg.node).is_none() {
                    info!("{} registered, {} peer(s)", reg.node, peers.len());
                }
                msg::encode(&PeerList { peers })?
            }
            Command::PeerList => {
                let q: PeerListRequest = req.decode()?;
                msg::encode(&PeerList {
                    peers: self.peers(q.group_id, q.exclude),
                })?
            }
            Command::LocateUpload => {
                let q: LocateUpload = req.decode()?;
                let node = self.locate_upload(q.size).await?;
                msg::encode(&Location { node })?
            }
            Command::LocateDownload => {
                let q: LocateDownload = req.decode()?;
                let node = self.locate_download(q.group_id)?;
                msg::encode(&Location { node })?
            }
            cmd => {
                debug!("{} sent {}, not handled by the master", conn.peer_role(), cmd);
                return Err(FsError::Unsupported);
            }
        };
        conn.send_response(&req, FRAME_STAT_OK, payload).await
    }

    async fn close_session(&self, _conn: &Connection, s: MasterSession) {
        if let Some(node) = s.registered {
            self.unregister(&node);
            info!("{} left", node);
        }
    }
}

pub async fn accept_loop(master: Arc<MasterHandler>, acceptor: &Acceptor) {
    while let Ok(conn) = acceptor.accept().await {
        debug!(
            "accepted {} connection from {}",
            conn.peer_role(),
            conn.peer_addr()
        );
        tokio::spawn(serve(conn, master.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tierfs_core::client::MasterClient;
    use tierfs_core::ConnectionConfig;

    /// Storage stand-in that only reports a fixed free space.
    struct FakeStorage {
        free: u64,
    }

    #[async_trait]
    impl ConnectionHandler for FakeStorage {
        type Session = ();

        async fn open_session(&self, _conn: &Connection) -> FsResult<()> {
            Ok(())
        }

        async fn handle(&self, conn: &Connection, _s: &mut (), req: Frame) -> FsResult<()> {
            let payload = msg::encode(&FreeSpace {
                max_free: self.free,
            })?;
            conn.send_response(&req, FRAME_STAT_OK, payload).await
        }

        async fn close_session(&self, _conn: &Connection, _s: ()) {}
    }

    async fn start_master() -> SocketAddr {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), ConnectionConfig::default())
            .await
            .unwrap();
        let addr = acceptor.local_addr();
        tokio::spawn(async move {
            accept_loop(Arc::new(MasterHandler::new()), &acceptor).await;
        });
        addr
    }

    async fn register(
        master: SocketAddr,
        group_id: u32,
        port: u16,
        free: u64,
    ) -> (StorageNode, Connection, Vec<StorageNode>) {
        let node = StorageNode::new(group_id, SocketAddr::from(([10, 0, 0, 1], port)));
        let conn = Connection::connect(master, Role::Storage, Role::Master, &ConnectionConfig::default())
            .await
            .unwrap();
        tokio::spawn(serve(conn.clone(), Arc::new(FakeStorage { free })));
        let list: PeerList = conn
            .request(
                Command::StorageRegister,
                FRAME_STAT_OK,
                msg::encode(&StorageRegister { node }).unwrap(),
            )
            .await
            .unwrap()
            .decode_ok()
            .unwrap();
        (node, conn, list.peers)
    }

    async fn client(master: SocketAddr) -> MasterClient {
        MasterClient::connect(master, &ConnectionConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_returns_group_peers() {
        let master = start_master().await;
        let (a1, _c1, peers) = register(master, 1, 7801, 0).await;
        assert!(peers.is_empty());
        let (a2, _c2, peers) = register(master, 1, 7802, 0).await;
        assert_eq!(peers, vec![a1]);
        let (_b1, _c3, peers) = register(master, 2, 7803, 0).await;
        assert!(peers.is_empty());

        let mut listed = client(master).await.peer_list(1).await.unwrap();
        listed.sort();
        assert_eq!(listed, vec![a1, a2]);
    }

    #[tokio::test]
    async fn test_clients_cannot_register() {
        let master = start_master().await;
        let conn = Connection::connect(master, Role::Client, Role::Master, &ConnectionConfig::default())
            .await
            .unwrap();
        let node = StorageNode::new(1, SocketAddr::from(([10, 0, 0, 9], 1)));
        let resp = conn
            .request(
                Command::StorageRegister,
                FRAME_STAT_OK,
                msg::encode(&StorageRegister { node }).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.check_status(), Err(FsError::Unsupported));
    }

    #[tokio::test]
    async fn test_locate_upload_by_free_space() {
        let master = start_master().await;
        let (_small, _c1, _) = register(master, 1, 7811, 100).await;
        let (big, _c2, _) = register(master, 1, 7812, 500).await;
        let (tiny, _c3, _) = register(master, 2, 7813, 50).await;
        let c = client(master).await;

        // Group 2 cannot hold it, so group 1's roomiest member wins.
        for _ in 0..3 {
            assert_eq!(c.locate_upload(200).await.unwrap(), big);
        }

        // Small files rotate across groups.
        let first = c.locate_upload(10).await.unwrap();
        let second = c.locate_upload(10).await.unwrap();
        let mut picked = vec![first, second];
        picked.sort();
        assert_eq!(picked, vec![big, tiny]);

        assert_eq!(c.locate_upload(1000).await, Err(FsError::OutOfSpace));
    }

    #[tokio::test]
    async fn test_locate_with_no_storage() {
        let master = start_master().await;
        let c = client(master).await;
        assert_eq!(c.locate_upload(1).await, Err(FsError::NotFound));
        assert_eq!(c.locate_download(3).await, Err(FsError::NotFound));
    }

    #[tokio::test]
    async fn test_locate_download_round_robin() {
        let master = start_master().await;
        let (a1, _c1, _) = register(master, 4, 7821, 0).await;
        let (a2, _c2, _) = register(master, 4, 7822, 0).await;
        let c = client(master).await;

        let mut seen = vec![
            c.locate_download(4).await.unwrap(),
            c.locate_download(4).await.unwrap(),
        ];
        seen.sort();
        assert_eq!(seen, vec![a1, a2]);
        assert_eq!(c.locate_download(5).await, Err(FsError::NotFound));
    }

    #[tokio::test]
    async fn test_member_leaves_on_disconnect() {
        let master = start_master().await;
        let (a1, _c1, _) = register(master, 6, 7831, 0).await;
        let (_a2, c2, _) = register(master, 6, 7832, 0).await;
        let c = client(master).await;
        assert_eq!(c.peer_list(6).await.unwrap().len(), 2);

        c2.close();
        let mut left = false;
        for _ in 0..100 {
            if c.peer_list(6).await.unwrap() == vec![a1] {
                left = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(left);
    }
}

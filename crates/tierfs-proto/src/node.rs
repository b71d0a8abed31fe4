/// Node roles and storage identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::error::{FsError, FsResult};

/// Role a peer announces in its handshake acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Client,
    Storage,
    Master,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Client => "client",
            Role::Storage => "storage",
            Role::Master => "master",
        };
        f.write_str(s)
    }
}

/// A storage node as known to the master and to its group peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageNode {
    pub group_id: u32,
    /// Advertised listen address
    pub addr: SocketAddr,
}

impl StorageNode {
    pub fn new(group_id: u32, addr: SocketAddr) -> Self {
        Self { group_id, addr }
    }
}

impl PartialOrd for StorageNode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StorageNode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.group_id
            .cmp(&other.group_id)
            .then(self.addr.cmp(&other.addr))
    }
}

impl fmt::Display for StorageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (group {})", self.addr, self.group_id)
    }
}

/// Client-visible path of a stored file: `"<group_id>/<rel_path>"`.
pub fn group_path(group_id: u32, rel_path: &str) -> String {
    format!("{}/{}", group_id, rel_path)
}

/// Split a client-visible path into its group id and store-relative path.
pub fn parse_group_path(path: &str) -> FsResult<(u32, &str)> {
    let (group, rel) = path.split_once('/').ok_or(FsError::InvalidParms)?;
    let group_id = group.parse::<u32>().map_err(|_| FsError::InvalidParms)?;
    if rel.is_empty() {
        return Err(FsError::InvalidParms);
    }
    Ok((group_id, rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_path() {
        let path = group_path(3, "0A/FF/report.pdf_x81Kq0Zz");
        assert_eq!(path, "3/0A/FF/report.pdf_x81Kq0Zz");
        assert_eq!(
            parse_group_path(&path).unwrap(),
            (3, "0A/FF/report.pdf_x81Kq0Zz")
        );
    }

    #[test]
    fn test_parse_group_path_rejects_garbage() {
        assert_eq!(parse_group_path("noslash"), Err(FsError::InvalidParms));
        assert_eq!(parse_group_path("abc/00/00/f"), Err(FsError::InvalidParms));
        assert_eq!(parse_group_path("7/"), Err(FsError::InvalidParms));
    }

    #[test]
    fn test_storage_node_order() {
        let a = StorageNode::new(1, "127.0.0.1:9000".parse().unwrap());
        let b = StorageNode::new(1, "127.0.0.1:9001".parse().unwrap());
        let c = StorageNode::new(0, "127.0.0.1:9999".parse().unwrap());
        let mut nodes = vec![a, b, c];
        nodes.sort();
        assert_eq!(nodes, vec![c, a, b]);
    }
}

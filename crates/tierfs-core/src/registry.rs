//! Role-scoped sets of live connections.

use dashmap::DashMap;
use std::net::SocketAddr;

use crate::connection::Connection;

/// Live connections keyed by the remote node's advertised address.
///
/// Closed connections are pruned lazily on lookup and snapshot.
#[derive(Default)]
pub struct ConnRegistry {
    conns: DashMap<SocketAddr, Connection>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` under `addr`, closing any connection it replaces.
    pub fn insert(&self, addr: SocketAddr, conn: Connection) {
        if let Some(old) = self.conns.insert(addr, conn) {
            old.close();
        }
    }

    /// Register `conn` unless a live connection to `addr` already exists.
    ///
    /// Returns false (and leaves `conn` untouched) when one does.
    pub fn try_insert(&self, addr: SocketAddr, conn: Connection) -> bool {
        match self.conns.entry(addr) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if !e.get().is_closed() {
                    return false;
                }
                e.insert(conn);
                true
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(conn);
                true
            }
        }
    }

    /// Get the live connection for `addr`.
    pub fn get(&self, addr: &SocketAddr) -> Option<Connection> {
        let conn = self.conns.get(addr)?.clone();
        if conn.is_closed() {
            self.conns.remove_if(addr, |_, c| c.is_closed());
            return None;
        }
        Some(conn)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.get(addr).is_some()
    }

    /// Drop `addr` only if it still maps to a closed connection.
    pub fn remove_closed(&self, addr: &SocketAddr) {
        self.conns.remove_if(addr, |_, c| c.is_closed());
    }

    pub fn remove(&self, addr: &SocketAddr) -> Option<Connection> {
        self.conns.remove(addr).map(|(_, conn)| conn)
    }

    /// Prune closed entries and return the live ones.
    pub fn snapshot(&self) -> Vec<(SocketAddr, Connection)> {
        self.conns.retain(|_, c| !c.is_closed());
        self.conns
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget every connection.
    pub fn clear(&self) {
        for (_, conn) in self.snapshot() {
            conn.close();
        }
        self.conns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::Acceptor;
    use crate::connection::ConnectionConfig;
    use tierfs_proto::Role;

    #[tokio::test]
    async fn test_registry_prunes_closed() {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), ConnectionConfig::default())
            .await
            .unwrap();
        let addr = acceptor.local_addr();
        let cfg = ConnectionConfig::default();

        let a = Connection::connect(addr, Role::Storage, Role::Storage, &cfg)
            .await
            .unwrap();
        let b = Connection::connect(addr, Role::Storage, Role::Storage, &cfg)
            .await
            .unwrap();

        let reg = ConnRegistry::new();
        let key_a: SocketAddr = "10.0.0.1:7800".parse().unwrap();
        let key_b: SocketAddr = "10.0.0.2:7800".parse().unwrap();
        reg.insert(key_a, a.clone());
        reg.insert(key_b, b.clone());
        assert_eq!(reg.len(), 2);

        a.close();
        assert!(!reg.contains(&key_a));
        let live = reg.snapshot();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, key_b);

        // Replacing an entry closes the previous connection.
        let c = Connection::connect(addr, Role::Storage, Role::Storage, &cfg)
            .await
            .unwrap();
        reg.insert(key_b, c.clone());
        assert!(b.is_closed());

        // A live entry is kept; a closed one is replaced.
        let d = Connection::connect(addr, Role::Storage, Role::Storage, &cfg)
            .await
            .unwrap();
        assert!(!reg.try_insert(key_b, d.clone()));
        assert!(!d.is_closed());
        assert!(reg.try_insert(key_a, d));
        assert_eq!(reg.len(), 2);

        reg.clear();
        assert!(reg.is_empty());
    }
}

//! Stat subcommand: metrics of storage nodes.

use std::net::SocketAddr;

use clap::Args;
use tabled::{Table, Tabled};

use tierfs_proto::msg::StorageMetrics;

use crate::common::{connect_master, connect_storage, exit_error, format_size};

#[derive(Args)]
pub struct StatArgs {
    /// Show every member of this group, as known to the master
    #[arg(short = 'g', long, conflicts_with = "node")]
    group: Option<u32>,

    /// Show a single storage node
    #[arg(short = 'n', long)]
    node: Option<SocketAddr>,
}

#[derive(Tabled)]
struct StatRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Group")]
    group: u32,
    #[tabled(rename = "Hot Free")]
    hot_free: String,
    #[tabled(rename = "Hot Total")]
    hot_total: String,
    #[tabled(rename = "Cold Free")]
    cold_free: String,
    #[tabled(rename = "Cold Total")]
    cold_total: String,
    #[tabled(rename = "Hot Files")]
    hot_tracked: u64,
    #[tabled(rename = "Cold Files")]
    cold_tracked: u64,
    #[tabled(rename = "Sync Queue")]
    sync_queue: u64,
    #[tabled(rename = "Peers")]
    peers: u32,
}

impl From<&StorageMetrics> for StatRow {
    fn from(m: &StorageMetrics) -> Self {
        Self {
            node: m.node.addr.to_string(),
            group: m.node.group_id,
            hot_free: format_size(m.hot.free),
            hot_total: format_size(m.hot.total),
            cold_free: format_size(m.cold.free),
            cold_total: format_size(m.cold.total),
            hot_tracked: m.hot_tracked,
            cold_tracked: m.cold_tracked,
            sync_queue: m.sync_queue,
            peers: m.peers,
        }
    }
}

pub async fn stat(master: SocketAddr, args: StatArgs) {
    let nodes: Vec<SocketAddr> = match (args.node, args.group) {
        (Some(addr), _) => vec![addr],
        (None, Some(group)) => {
            let master = connect_master(master).await;
            let peers = match master.peer_list(group).await {
                Ok(p) => p,
                Err(e) => exit_error(&format!("failed to list group {}: {}", group, e)),
            };
            master.close();
            peers.into_iter().map(|n| n.addr).collect()
        }
        (None, None) => exit_error("either --group or --node is required"),
    };

    if nodes.is_empty() {
        println!("No storage nodes.");
        return;
    }

    let mut rows = Vec::with_capacity(nodes.len());
    for addr in nodes {
        let storage = connect_storage(addr).await;
        match storage.metrics().await {
            Ok(m) => rows.push(StatRow::from(&m)),
            Err(e) => eprintln!("{}: {}", addr, e),
        }
        storage.close();
    }

    println!("{}", Table::new(&rows));
    println!();
    println!("Total {} node(s)", rows.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierfs_proto::msg::TierMetrics;
    use tierfs_proto::StorageNode;

    #[test]
    fn test_stat_row() {
        let m = StorageMetrics {
            node: StorageNode::new(3, "10.0.0.7:7800".parse().unwrap()),
            hot: TierMetrics {
                total: 4 << 30,
                free: 1 << 30,
                stores: 2,
            },
            cold: TierMetrics::default(),
            hot_tracked: 12,
            cold_tracked: 0,
            sync_queue: 1,
            peers: 2,
        };
        let row = StatRow::from(&m);
        assert_eq!(row.hot_free, "1.0 GB");
        assert_eq!(row.hot_total, "4.0 GB");
        assert_eq!(row.cold_total, "0 B");

        let table = Table::new(vec![row]).to_string();
        assert!(table.contains("10.0.0.7:7800"));
        assert!(table.contains("Sync Queue"));
    }
}

//! Shared helpers for the crate's unit tests.

use crate::data::DataPlane;
use crate::node::{LinkState, Node, NodeFlags};
use crate::{Cluster, ClusterConfig, NodeId};

/// A config with a short node timeout so timing tests stay fast, and no
/// fsync since tests never persist to a shared disk.
pub(crate) fn test_config() -> ClusterConfig {
    ClusterConfig {
        node_timeout_ms: 1000,
        fsync: false,
        ..ClusterConfig::default()
    }
}

pub(crate) fn test_config_port(port: u16) -> ClusterConfig {
    ClusterConfig {
        announce_port: port,
        ..test_config()
    }
}

/// Inserts a reachable master peer at `10.0.0.<idx>:6379` with an
/// established link, returning its id.
pub(crate) fn add_connected_master<D: DataPlane>(
    cluster: &mut Cluster<D>,
    idx: u8,
    now: u64,
) -> NodeId {
    let id = NodeId::random();
    let mut node = Node::new(id, NodeFlags::new(NodeFlags::MASTER), now);
    node.host = format!("10.0.0.{idx}");
    node.port = 6379;
    node.link = LinkState::Connected { since: now };
    node.pong_received = now;
    cluster.nodes.insert(node);
    id
}

/// Inserts a reachable replica of `master` with an established link.
pub(crate) fn add_connected_replica<D: DataPlane>(
    cluster: &mut Cluster<D>,
    master: NodeId,
    idx: u8,
    now: u64,
) -> NodeId {
    let id = NodeId::random();
    let mut node = Node::new(id, NodeFlags::new(NodeFlags::REPLICA), now);
    node.host = format!("10.0.1.{idx}");
    node.port = 6379;
    node.link = LinkState::Connected { since: now };
    node.pong_received = now;
    node.replicates = Some(master);
    cluster.nodes.insert(node);
    if let Some(m) = cluster.nodes.get_mut(&master) {
        m.replicas.push(id);
    }
    id
}

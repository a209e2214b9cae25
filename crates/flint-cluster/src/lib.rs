//! flint-cluster: peer-to-peer membership, hash-slot routing and failover
//! for a sharded in-memory key-value store.
//!
//! Every node runs one [`Cluster`] engine, participating in a fully
//! connected mesh over a dedicated TCP bus (client port + 10000). The
//! engine tracks peers in a node table, exchanges PING/PONG gossip, owns a
//! 16384-slot assignment map, detects failed masters by weak quorum,
//! elects replacement replicas with an epoch-ordered vote, and routes
//! client traffic (MOVED/ASK/TRYAGAIN/CLUSTERDOWN) according to the
//! current slot map.
//!
//! # Architecture
//!
//! The engine is deterministic and I/O-free: the host feeds it packets,
//! link events, operator commands and a 10 Hz tick — always with an
//! explicit millisecond timestamp — and drains queued [`Outbound`] actions
//! afterward. The attached key-value engine sits behind the [`DataPlane`]
//! trait. This keeps whole clusters testable inside one process with a
//! scripted clock; `flint-server` adds the real TCP bus on top.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use flint_cluster::{Cluster, ClusterConfig, MemoryDataPlane};
//!
//! let mut node = Cluster::open(
//!     ClusterConfig::default(),
//!     MemoryDataPlane::new(),
//!     "nodes.conf",
//!     now_ms(),
//! )?;
//! node.cluster_meet("10.0.0.2", 6379, now_ms())?;
//! loop {
//!     node.tick(now_ms());
//!     for action in node.take_outbox() { /* dial / send / close */ }
//!     node.before_sleep(now_ms())?;
//! }
//! ```

mod admin;
mod config;
mod data;
mod election;
mod engine;
mod epoch;
mod error;
mod failure;
mod gossip;
mod ids;
mod message;
mod migration;
mod node;
mod persist;
mod router;
mod slots;
mod state;
#[cfg(test)]
mod test_util;

pub use admin::{check_slot_arg, SlotsEntry};
pub use config::{ClusterConfig, DEFAULT_BUS_PORT_OFFSET};
pub use data::{DataPlane, MemoryDataPlane};
pub use engine::{
    Cluster, ClusterHealth, Event, LinkId, Outbound, PacketOutcome,
};
pub use error::ClusterError;
pub use ids::{NodeId, NODE_ID_LEN};
pub use message::{
    frame_length, GossipEntry, Message, MessageBody, MessageHeader, MessageType, HEADER_LEN,
    MAX_FRAME_LEN, PROTOCOL_VERSION,
};
pub use node::{Blacklist, FailureReport, LinkState, Node, NodeFlags, NodeTable};
pub use persist::NodesConfig;
pub use router::{command_spec, extract_keys, ClientState, CommandSpec, RouteDecision};
pub use slots::{key_slot, SlotBitmap, SlotMap, SlotRange, SLOT_BITMAP_LEN, SLOT_COUNT};

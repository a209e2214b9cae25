//! The node table: everything this instance believes about its peers.
//!
//! Each peer is a [`Node`] record keyed by its 40-hex identity. Records are
//! created by operator MEET commands, by gossip about unknown identities, and
//! by the persisted snapshot at startup; they are removed by operator FORGET
//! (which also blacklists the identity for a minute) or when a handshake
//! times out.

use std::collections::HashMap;

use rand::seq::IteratorRandom;

use crate::config::{BLACKLIST_TTL_MS, FAIL_REPORT_VALIDITY_MULT};
use crate::slots::SlotBitmap;
use crate::NodeId;

/// Role and liveness flags for a node, stored as wire-compatible bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags(u16);

impl NodeFlags {
    /// This record describes the local node.
    pub const MYSELF: u16 = 1 << 0;
    /// The node owns slots and accepts writes.
    pub const MASTER: u16 = 1 << 1;
    /// The node mirrors a master.
    pub const REPLICA: u16 = 1 << 2;
    /// Locally suspected failure (ping timed out).
    pub const PFAIL: u16 = 1 << 3;
    /// Failure confirmed by a quorum of masters.
    pub const FAIL: u16 = 1 << 4;
    /// Provisional entry awaiting the first PONG.
    pub const HANDSHAKE: u16 = 1 << 5;
    /// No known address for this node.
    pub const NOADDR: u16 = 1 << 6;
    /// Send MEET instead of PING on the next connect.
    pub const MEET: u16 = 1 << 7;

    const ALL: u16 = 0xff;

    pub fn new(bits: u16) -> Self {
        Self(bits & Self::ALL)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, bits: u16) -> bool {
        self.0 & bits != 0
    }

    pub fn insert(&mut self, bits: u16) {
        self.0 |= bits & Self::ALL;
    }

    pub fn remove(&mut self, bits: u16) {
        self.0 &= !bits;
    }

    pub fn is_master(self) -> bool {
        self.contains(Self::MASTER)
    }

    pub fn is_replica(self) -> bool {
        self.contains(Self::REPLICA)
    }

    /// PFAIL or FAIL.
    pub fn is_failing(self) -> bool {
        self.contains(Self::PFAIL | Self::FAIL)
    }
}

impl std::fmt::Display for NodeFlags {
    /// Comma-separated list as used by NODES output and the snapshot file.
    /// PFAIL renders as `fail?` per the wire convention.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        static NAMES: [(u16, &str); 8] = [
            (NodeFlags::MYSELF, "myself"),
            (NodeFlags::MASTER, "master"),
            (NodeFlags::REPLICA, "slave"),
            (NodeFlags::PFAIL, "fail?"),
            (NodeFlags::FAIL, "fail"),
            (NodeFlags::HANDSHAKE, "handshake"),
            (NodeFlags::NOADDR, "noaddr"),
            (NodeFlags::MEET, "meet"),
        ];
        if self.0 == 0 {
            return f.write_str("noflags");
        }
        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(bit) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for NodeFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeFlags({self})")
    }
}

impl NodeFlags {
    /// Parses the comma-separated form back from a snapshot line.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut flags = Self::default();
        for part in s.split(',') {
            match part {
                "myself" => flags.insert(Self::MYSELF),
                "master" => flags.insert(Self::MASTER),
                "slave" => flags.insert(Self::REPLICA),
                "fail?" => flags.insert(Self::PFAIL),
                "fail" => flags.insert(Self::FAIL),
                "handshake" => flags.insert(Self::HANDSHAKE),
                "noaddr" => flags.insert(Self::NOADDR),
                "meet" => flags.insert(Self::MEET),
                "noflags" => {}
                other => return Err(format!("unknown node flag '{other}'")),
            }
        }
        Ok(flags)
    }
}

/// A failure report: `from` told us (via gossip) that the node looked
/// PFAIL/FAIL at `time`.
#[derive(Debug, Clone, Copy)]
pub struct FailureReport {
    pub from: NodeId,
    pub time: u64,
}

/// Connection state of the single bus link this node keeps to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No link; the tick will ask the host to dial.
    #[default]
    Disconnected,
    /// Dial in flight since the given time.
    Connecting { since: u64 },
    /// Link established at the given time.
    Connected { since: u64 },
}

impl LinkState {
    pub fn is_connected(self) -> bool {
        matches!(self, LinkState::Connected { .. })
    }
}

/// Everything this instance knows about one peer (or about itself).
pub struct Node {
    pub id: NodeId,
    /// Client-facing host; empty string when NOADDR.
    pub host: String,
    /// Client port. The bus port is this plus the configured offset.
    pub port: u16,
    pub flags: NodeFlags,
    /// Version tag of this node's slot claims.
    pub config_epoch: u64,
    /// Slots this node serves (masters only).
    pub slots: SlotBitmap,
    /// Master this node mirrors, when it is a replica.
    pub replicates: Option<NodeId>,
    /// Back-references: replicas mirroring this node.
    pub replicas: Vec<NodeId>,
    /// When the record was created; bounds the handshake lifetime.
    pub ctime: u64,
    /// When the outstanding ping was sent; zero when a pong has answered it.
    pub ping_sent: u64,
    pub pong_received: u64,
    /// When the FAIL flag was set.
    pub fail_time: u64,
    /// Last time we granted a failover vote to a replica of this master.
    pub voted_time: u64,
    /// Replication offset the node last announced, and when.
    pub repl_offset: u64,
    pub repl_offset_time: u64,
    pub fail_reports: Vec<FailureReport>,
    pub link: LinkState,
}

impl Node {
    pub fn new(id: NodeId, flags: NodeFlags, now: u64) -> Self {
        Self {
            id,
            host: String::new(),
            port: 0,
            flags,
            config_epoch: 0,
            slots: SlotBitmap::new(),
            replicates: None,
            replicas: Vec::new(),
            ctime: now,
            ping_sent: 0,
            pong_received: 0,
            fail_time: 0,
            voted_time: 0,
            repl_offset: 0,
            repl_offset_time: 0,
            fail_reports: Vec::new(),
            link: LinkState::Disconnected,
        }
    }

    pub fn is_master(&self) -> bool {
        self.flags.is_master()
    }

    pub fn is_replica(&self) -> bool {
        self.flags.is_replica()
    }

    pub fn failed(&self) -> bool {
        self.flags.contains(NodeFlags::FAIL)
    }

    /// Locally suspected (PFAIL).
    pub fn timed_out(&self) -> bool {
        self.flags.contains(NodeFlags::PFAIL)
    }

    pub fn in_handshake(&self) -> bool {
        self.flags.contains(NodeFlags::HANDSHAKE)
    }

    pub fn has_addr(&self) -> bool {
        !self.flags.contains(NodeFlags::NOADDR) && !self.host.is_empty()
    }

    /// The bus port peers dial to reach this node.
    pub fn bus_port(&self, offset: u16) -> u16 {
        self.port.saturating_add(offset)
    }

    /// Records (or refreshes) a failure report from `from`.
    /// Returns false if the report was already present.
    pub fn add_failure_report(&mut self, from: NodeId, now: u64) -> bool {
        if let Some(report) = self.fail_reports.iter_mut().find(|r| r.from == from) {
            report.time = now;
            return false;
        }
        self.fail_reports.push(FailureReport { from, time: now });
        true
    }

    /// Removes the failure report from `from`, if present.
    pub fn del_failure_report(&mut self, from: NodeId) -> bool {
        let before = self.fail_reports.len();
        self.fail_reports.retain(|r| r.from != from);
        before != self.fail_reports.len()
    }

    /// Counts reports that are still fresh, dropping stale ones.
    /// A report goes stale after `node_timeout * 2`.
    pub fn fresh_failure_reports(&mut self, now: u64, node_timeout_ms: u64) -> usize {
        let validity = node_timeout_ms * FAIL_REPORT_VALIDITY_MULT;
        self.fail_reports
            .retain(|r| now.saturating_sub(r.time) <= validity);
        self.fail_reports.len()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("addr", &format_args!("{}:{}", self.host, self.port))
            .field("flags", &self.flags)
            .field("config_epoch", &self.config_epoch)
            .field("slots", &self.slots.count())
            .finish_non_exhaustive()
    }
}

/// The set of known nodes, keyed by identity.
#[derive(Default)]
pub struct NodeTable {
    nodes: HashMap<NodeId, Node>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn insert(&mut self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
        self.nodes.remove(id)
    }

    /// Replaces a handshake entry's provisional identity with the real one
    /// learned from the peer's first PONG. The record is updated in place.
    pub fn rename(&mut self, old: &NodeId, new: NodeId) -> bool {
        match self.nodes.remove(old) {
            Some(mut node) => {
                node.id = new;
                self.nodes.insert(new, node);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    /// Snapshot of the current identities, for iterations that mutate or
    /// delete entries while walking.
    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// A uniformly random node, if any.
    pub fn random_id(&self, rng: &mut impl rand::Rng) -> Option<NodeId> {
        self.nodes.keys().choose(rng).copied()
    }

    /// True when a handshake to this host:port is already in flight.
    pub fn handshake_in_progress(&self, host: &str, port: u16) -> bool {
        self.nodes
            .values()
            .any(|n| n.in_handshake() && n.host == host && n.port == port)
    }
}

/// Recently forgotten identities, kept out of the table for 60 seconds so
/// gossip from peers that have not yet processed the FORGET cannot re-add
/// them. Swept on every add/contains call.
#[derive(Default)]
pub struct Blacklist {
    entries: HashMap<NodeId, u64>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    fn sweep(&mut self, now: u64) {
        self.entries.retain(|_, expire| *expire > now);
    }

    pub fn add(&mut self, id: NodeId, now: u64) {
        self.sweep(now);
        self.entries.insert(id, now + BLACKLIST_TTL_MS);
    }

    pub fn contains(&mut self, id: &NodeId, now: u64) -> bool {
        self.sweep(now);
        self.entries.contains_key(id)
    }
}

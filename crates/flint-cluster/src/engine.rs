//! The cluster engine: one instance per process, holding the node table,
//! slot map and epoch state, and driving every protocol decision.
//!
//! The engine performs no I/O and never reads the clock. Inbound packets,
//! link lifecycle changes and the periodic tick are fed in by the host with
//! an explicit `now` timestamp; outbound traffic and connection requests
//! accumulate on an outbox the host drains after every call. This keeps the
//! protocol fully deterministic and lets tests run whole clusters in-process
//! with a scripted clock.
//!
//! Concurrency model: strictly single-threaded. The host serializes packet
//! handlers, tick and operator commands, and runs [`Cluster::before_sleep`]
//! between event batches to flush deferred work (election progress, state
//! re-evaluation, config persistence).

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, MF_TIMEOUT_MS};
use crate::data::DataPlane;
use crate::message::{
    Message, MessageBody, MessageHeader, MessageType, MFLAG_PAUSED,
};
use crate::node::{LinkState, Node, NodeFlags, NodeTable, Blacklist};
use crate::persist::NodesConfig;
use crate::slots::{SlotBitmap, SlotMap, SLOT_COUNT};
use crate::{ClusterError, NodeId};

/// Aggregate cluster state as seen by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterHealth {
    Ok,
    Fail,
}

impl std::fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterHealth::Ok => f.write_str("ok"),
            ClusterHealth::Fail => f.write_str("fail"),
        }
    }
}

/// Outbound actions queued by the engine for the host to execute.
#[derive(Debug)]
pub enum Outbound {
    /// Dial the peer's bus port; report back with `link_established` or
    /// `connect_failed`.
    Connect {
        node: NodeId,
        host: String,
        bus_port: u16,
    },
    /// Write an encoded message to the peer's link.
    Send { node: NodeId, bytes: Bytes },
    /// Tear the peer's link down (it will be re-dialed on a later tick).
    Disconnect { node: NodeId },
}

/// Where an inbound packet arrived from.
#[derive(Debug, Clone)]
pub enum LinkId {
    /// The outbound link we keep to this known peer.
    Peer(NodeId),
    /// An accepted inbound connection; `peer_host` is the remote address.
    Accepted { peer_host: String },
}

/// Result of processing one inbound packet.
#[derive(Debug, Default)]
pub struct PacketOutcome {
    /// Replies to write back on the same link the packet arrived on.
    pub replies: Vec<Bytes>,
    /// The packet invalidated its link (e.g. sender identity mismatch);
    /// the host must close it and stop reading.
    pub close_link: bool,
}

/// Notifications surfaced to the host.
#[derive(Debug)]
pub enum Event {
    /// A PUBLISH message arrived over the bus.
    PublishReceived { channel: Bytes, message: Bytes },
}

/// Deferred-work bits drained by the before-sleep hook.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Todo(u8);

impl Todo {
    pub(crate) const HANDLE_FAILOVER: u8 = 1 << 0;
    pub(crate) const UPDATE_STATE: u8 = 1 << 1;
    pub(crate) const SAVE_CONFIG: u8 = 1 << 2;
    pub(crate) const FSYNC_CONFIG: u8 = 1 << 3;

    pub(crate) fn insert(&mut self, bits: u8) {
        self.0 |= bits;
    }

    pub(crate) fn remove(&mut self, bits: u8) {
        self.0 &= !bits;
    }

    pub(crate) fn contains(&self, bits: u8) -> bool {
        self.0 & bits != 0
    }
}

/// Progress of this replica's current election attempt.
#[derive(Debug, Default)]
pub(crate) struct FailoverAuth {
    /// Earliest time the vote request may be broadcast; zero when no
    /// attempt is scheduled.
    pub(crate) time: u64,
    /// Votes collected in the current attempt.
    pub(crate) count: usize,
    /// Whether the request was already broadcast for this attempt.
    pub(crate) sent: bool,
    /// Replicas of the same master with a better offset, at schedule time.
    pub(crate) rank: usize,
    /// currentEpoch the attempt was started with.
    pub(crate) epoch: u64,
    /// Last reason we declined to proceed, for rate-limited logging.
    pub(crate) cant_reason: CantFailover,
    pub(crate) last_log: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CantFailover {
    #[default]
    None,
    DataAge,
    WaitingDelay,
    Expired,
    WaitingVotes,
}

/// Manual failover progress, on both the master and the replica side.
#[derive(Debug, Default)]
pub(crate) struct ManualFailover {
    /// Deadline; zero when no manual failover is in progress.
    pub(crate) end: u64,
    /// Replica side: offset reached, election may start immediately.
    pub(crate) can_start: bool,
    /// Replica side: master offset observed in a PAUSED header.
    pub(crate) master_offset: u64,
    /// Master side: the replica that requested the failover.
    pub(crate) replica: Option<NodeId>,
}

/// The cluster coordination engine.
pub struct Cluster<D: DataPlane> {
    pub(crate) config: ClusterConfig,
    pub(crate) myself: NodeId,
    pub(crate) nodes: NodeTable,
    pub(crate) blacklist: Blacklist,
    pub(crate) slot_map: SlotMap,
    pub(crate) current_epoch: u64,
    pub(crate) last_vote_epoch: u64,
    pub(crate) state: ClusterHealth,
    /// Number of masters serving at least one slot (the voter base).
    pub(crate) size: usize,
    pub(crate) failover: FailoverAuth,
    pub(crate) manual: ManualFailover,
    pub(crate) todo: Todo,
    pub(crate) outbox: Vec<Outbound>,
    pub(crate) events: Vec<Event>,
    pub(crate) data: D,
    pub(crate) persist: Option<NodesConfig>,
    pub(crate) stats_messages_sent: u64,
    pub(crate) stats_messages_received: u64,
    /// When this node last found itself in a minority partition.
    pub(crate) among_minority_time: u64,
    /// First state evaluation, for the post-boot writable delay.
    pub(crate) first_eval_time: u64,
    pub(crate) iteration: u64,
}

impl<D: DataPlane> Cluster<D> {
    /// Creates a fresh engine with a random identity and no persistence.
    pub fn new(config: ClusterConfig, data: D) -> Self {
        let id = NodeId::random();
        let mut cluster = Self::empty(id, config, data);
        let mut node = Node::new(
            id,
            NodeFlags::new(NodeFlags::MYSELF | NodeFlags::MASTER),
            0,
        );
        node.host = cluster.config.announce_host.clone();
        node.port = cluster.config.announce_port;
        cluster.nodes.insert(node);
        info!(id = %id.short(), "no cluster configuration found, starting fresh");
        cluster
    }

    /// Opens (and exclusively locks) the node-view file at `path`, restoring
    /// the persisted configuration or generating a first-run identity when
    /// the file is empty.
    pub fn open(
        config: ClusterConfig,
        data: D,
        path: impl Into<std::path::PathBuf>,
        now: u64,
    ) -> Result<Self, ClusterError> {
        let (persist, content) = NodesConfig::open(path.into())?;
        let mut cluster = match content {
            Some(text) => {
                let mut cluster = Self::empty(NodeId::random(), config, data);
                crate::persist::load_into(&mut cluster, &text, now)?;
                info!(id = %cluster.myself.short(), "node configuration loaded");
                cluster
            }
            None => Self::new(config, data),
        };
        cluster.persist = Some(persist);
        cluster.save_config(true)?;
        Ok(cluster)
    }

    pub(crate) fn empty(id: NodeId, config: ClusterConfig, data: D) -> Self {
        Self {
            config,
            myself: id,
            nodes: NodeTable::new(),
            blacklist: Blacklist::new(),
            slot_map: SlotMap::new(),
            current_epoch: 0,
            last_vote_epoch: 0,
            state: ClusterHealth::Fail,
            size: 1,
            failover: FailoverAuth::default(),
            manual: ManualFailover::default(),
            todo: Todo::default(),
            outbox: Vec::new(),
            events: Vec::new(),
            data,
            persist: None,
            stats_messages_sent: 0,
            stats_messages_received: 0,
            among_minority_time: 0,
            first_eval_time: 0,
            iteration: 0,
        }
    }

    // -- accessors --

    pub fn myself_id(&self) -> NodeId {
        self.myself
    }

    pub fn state(&self) -> ClusterHealth {
        self.state
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ClusterConfig {
        &mut self.config
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes_iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn known_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn slot_owner(&self, slot: u16) -> Option<NodeId> {
        self.slot_map.owner(slot)
    }

    pub fn migrating_to(&self, slot: u16) -> Option<NodeId> {
        self.slot_map.migrating_to(slot)
    }

    pub fn importing_from(&self, slot: u16) -> Option<NodeId> {
        self.slot_map.importing_from(slot)
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    pub(crate) fn myself_node(&self) -> &Node {
        self.nodes.get(&self.myself).expect("myself is always in the table")
    }

    pub(crate) fn myself_node_mut(&mut self) -> &mut Node {
        let id = self.myself;
        self.nodes.get_mut(&id).expect("myself is always in the table")
    }

    pub fn myself_is_master(&self) -> bool {
        self.myself_node().is_master()
    }

    /// This node's master, when it is a replica.
    pub fn myself_master(&self) -> Option<NodeId> {
        self.myself_node().replicates
    }

    /// Drains the queued outbound actions.
    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Drains the queued host notifications.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    // -- node lifecycle --

    /// Starts a handshake with `host:port` unless one is already in flight.
    /// The entry gets a random identity that the first PONG replaces.
    pub(crate) fn start_handshake(&mut self, host: &str, port: u16, now: u64) -> bool {
        if port == 0 || port > u16::MAX - self.config.bus_port_offset {
            return false;
        }
        if self.nodes.handshake_in_progress(host, port) {
            return false;
        }
        let mut node = Node::new(
            NodeId::random(),
            NodeFlags::new(NodeFlags::HANDSHAKE | NodeFlags::MEET),
            now,
        );
        node.host = host.to_string();
        node.port = port;
        debug!(host, port, "starting handshake");
        self.nodes.insert(node);
        true
    }

    /// Removes a node: unbinds its slots, forgets the failure reports it
    /// authored, detaches it from its master and drops the record.
    pub(crate) fn del_node(&mut self, id: NodeId) {
        if id == self.myself {
            return;
        }
        for slot in 0..SLOT_COUNT {
            if self.slot_map.migrating_to(slot) == Some(id) {
                self.slot_map.set_migrating_to(slot, None);
            }
            if self.slot_map.importing_from(slot) == Some(id) {
                self.slot_map.set_importing_from(slot, None);
            }
            if self.slot_map.owner(slot) == Some(id) {
                self.del_slot(slot);
            }
        }
        for node in self.nodes.iter_mut() {
            node.del_failure_report(id);
        }
        if let Some(master) = self.nodes.get(&id).and_then(|n| n.replicates) {
            self.remove_replica(master, id);
        }
        if self.nodes.remove(&id).is_some() {
            self.outbox.push(Outbound::Disconnect { node: id });
        }
    }

    pub(crate) fn remove_replica(&mut self, master: NodeId, replica: NodeId) {
        if let Some(m) = self.nodes.get_mut(&master) {
            m.replicas.retain(|r| *r != replica);
        }
    }

    /// Reconfigures `id` as a master after it was believed to be a replica.
    pub(crate) fn set_node_as_master(&mut self, id: NodeId, _now: u64) {
        let Some(node) = self.nodes.get(&id) else { return };
        if node.is_master() {
            return;
        }
        if let Some(master) = node.replicates {
            self.remove_replica(master, id);
        }
        let node = self.nodes.get_mut(&id).expect("checked above");
        node.flags.remove(NodeFlags::REPLICA);
        node.flags.insert(NodeFlags::MASTER);
        node.replicates = None;
        self.todo.insert(Todo::SAVE_CONFIG | Todo::UPDATE_STATE);
    }

    /// Turns this node into a replica of `target` and points replication at
    /// it. The caller guarantees we serve no slots.
    pub(crate) fn set_master(&mut self, target: NodeId, now: u64) {
        debug_assert!(target != self.myself);
        debug_assert_eq!(self.myself_node().slots.count(), 0);

        if self.myself_is_master() {
            let me = self.myself_node_mut();
            me.flags.remove(NodeFlags::MASTER);
            me.flags.insert(NodeFlags::REPLICA);
            self.slot_map.close_all();
        } else if let Some(old) = self.myself_master() {
            self.remove_replica(old, self.myself);
        }
        self.myself_node_mut().replicates = Some(target);
        let myself = self.myself;
        let (host, port) = {
            let t = self.nodes.get_mut(&target).expect("replication target is known");
            if !t.replicas.contains(&myself) {
                t.replicas.push(myself);
            }
            (t.host.clone(), t.port)
        };
        self.data.set_replication_master(&host, port);
        self.reset_manual_failover(now);
    }

    /// Non-failing replicas of `master`.
    pub(crate) fn count_ok_replicas(&self, master: &Node) -> usize {
        master
            .replicas
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| !n.failed())
            .count()
    }

    // -- slot assignment --

    /// Binds `slot` to `node`. Fails if the slot already has an owner.
    pub(crate) fn add_slot(&mut self, node: NodeId, slot: u16) -> Result<(), ClusterError> {
        if self.slot_map.owner(slot).is_some() {
            return Err(ClusterError::SlotBusy(slot));
        }
        if let Some(n) = self.nodes.get_mut(&node) {
            n.slots.set(slot);
            self.slot_map.set_owner(slot, Some(node));
            Ok(())
        } else {
            Err(ClusterError::UnknownNode(node))
        }
    }

    /// Unbinds `slot`. Returns false if it had no owner.
    pub(crate) fn del_slot(&mut self, slot: u16) -> bool {
        let Some(owner) = self.slot_map.owner(slot) else {
            return false;
        };
        if let Some(n) = self.nodes.get_mut(&owner) {
            n.slots.clear(slot);
        }
        self.slot_map.set_owner(slot, None);
        true
    }

    /// Unbinds every slot served by `node`, returning how many slots were
    /// actually cleared.
    pub(crate) fn del_node_slots(&mut self, node: NodeId) -> usize {
        let mut deleted = 0;
        for slot in 0..SLOT_COUNT {
            if self.nodes.get(&node).is_some_and(|n| n.slots.get(slot)) {
                self.del_slot(slot);
                deleted += 1;
            }
        }
        deleted
    }

    // -- slot reconciliation --

    /// Applies a master's claimed slot bitmap, tagged with its configEpoch.
    ///
    /// This is the only routine that moves slot ownership between peers
    /// based on received configuration. Slots we are importing are left
    /// alone (an operator-driven reshard owns them). A claim wins a slot
    /// when the slot is unowned or its current owner has a lower
    /// configEpoch. If the claims strip the last slot from our master (or
    /// from us), we follow the sender as its replica; otherwise keys left
    /// in lost slots are dropped to restore the key/slot invariant.
    pub(crate) fn update_slots_config_with(
        &mut self,
        sender: NodeId,
        sender_config_epoch: u64,
        claimed: &SlotBitmap,
        now: u64,
    ) {
        if sender == self.myself {
            warn!("discarding UPDATE about myself");
            return;
        }
        let cur_master = if self.myself_is_master() {
            self.myself
        } else {
            match self.myself_master() {
                Some(m) => m,
                None => self.myself,
            }
        };

        let mut dirty_slots: Vec<u16> = Vec::new();
        let mut new_master = None;

        for slot in 0..SLOT_COUNT {
            if !claimed.get(slot) {
                continue;
            }
            if self.slot_map.owner(slot) == Some(sender) {
                continue;
            }
            if self.slot_map.importing_from(slot).is_some() {
                continue;
            }
            let owner = self.slot_map.owner(slot);
            let owner_epoch = owner
                .and_then(|id| self.nodes.get(&id))
                .map(|n| n.config_epoch);
            let rebind = match owner_epoch {
                None => true,
                Some(epoch) => epoch < sender_config_epoch,
            };
            if !rebind {
                continue;
            }
            if owner == Some(self.myself) && self.data.count_keys_in_slot(slot) > 0 {
                dirty_slots.push(slot);
            }
            if owner == Some(cur_master) {
                new_master = Some(sender);
            }
            self.del_slot(slot);
            let _ = self.add_slot(sender, slot);
            self.todo
                .insert(Todo::SAVE_CONFIG | Todo::UPDATE_STATE | Todo::FSYNC_CONFIG);
        }

        let master_left_empty = self
            .nodes
            .get(&cur_master)
            .map(|n| n.slots.is_empty())
            .unwrap_or(true);

        if let Some(target) = new_master {
            if master_left_empty {
                info!(
                    master = %target.short(),
                    "configuration change detected, reconfiguring myself as a replica"
                );
                self.set_master(target, now);
                self.todo
                    .insert(Todo::SAVE_CONFIG | Todo::UPDATE_STATE | Todo::FSYNC_CONFIG);
                return;
            }
        }
        for slot in dirty_slots {
            let removed = self.data.del_keys_in_slot(slot);
            debug!(slot, removed, "dropped keys from lost slot");
        }
    }

    // -- message construction --

    pub(crate) fn build_header(&self) -> MessageHeader {
        let me = self.myself_node();
        // a replica advertises its master's claims, flagged as second-hand
        let master_view = me
            .replicates
            .and_then(|m| self.nodes.get(&m))
            .unwrap_or(me);
        let mut mflags = 0u8;
        if me.is_master() && self.manual.end != 0 {
            mflags |= MFLAG_PAUSED;
        }
        MessageHeader {
            sender: self.myself,
            slots: master_view.slots.clone(),
            replicates: me.replicates,
            port: me.port,
            flags: me.flags,
            state_fail: self.state == ClusterHealth::Fail,
            mflags,
            current_epoch: self.current_epoch,
            config_epoch: master_view.config_epoch,
            repl_offset: self.data.replication_offset(),
        }
    }

    pub(crate) fn send_message(&mut self, to: NodeId, msg: &Message) {
        let connected = self
            .nodes
            .get(&to)
            .map(|n| n.link.is_connected())
            .unwrap_or(false);
        if !connected {
            return;
        }
        self.stats_messages_sent += 1;
        self.outbox.push(Outbound::Send {
            node: to,
            bytes: msg.encode(),
        });
    }

    /// Sends to every connected peer outside handshake.
    pub(crate) fn broadcast_message(&mut self, msg: &Message) {
        let bytes = msg.encode();
        for id in self.nodes.ids() {
            let node = self.nodes.get(&id).expect("id snapshot");
            if node.flags.contains(NodeFlags::MYSELF | NodeFlags::HANDSHAKE) {
                continue;
            }
            if !node.link.is_connected() {
                continue;
            }
            self.stats_messages_sent += 1;
            self.outbox.push(Outbound::Send {
                node: id,
                bytes: bytes.clone(),
            });
        }
    }

    /// Broadcasts a PONG so peers refresh their view of us immediately
    /// (used after promotions and role flips). When `replicas_only` is set
    /// only our master's replica ring is notified.
    pub(crate) fn broadcast_pong(&mut self, replicas_only: bool, now: u64) {
        let my_master = self.myself_master();
        let msg = self.build_gossip_message(MessageType::Pong, now);
        let bytes = msg.encode();
        for id in self.nodes.ids() {
            let node = self.nodes.get(&id).expect("id snapshot");
            if node.flags.contains(NodeFlags::MYSELF | NodeFlags::HANDSHAKE) {
                continue;
            }
            if !node.link.is_connected() {
                continue;
            }
            if replicas_only {
                let same_ring = node.is_replica()
                    && node.replicates.is_some()
                    && node.replicates == my_master;
                if !same_ring {
                    continue;
                }
            }
            self.stats_messages_sent += 1;
            self.outbox.push(Outbound::Send {
                node: id,
                bytes: bytes.clone(),
            });
        }
    }

    /// Broadcasts a FAIL notification about `about`.
    pub(crate) fn send_fail(&mut self, about: NodeId) {
        let msg = Message {
            header: self.build_header(),
            body: MessageBody::Fail { node: about },
        };
        self.broadcast_message(&msg);
    }

    /// Sends an UPDATE about `about`'s slot configuration to `to`.
    pub(crate) fn send_update(&mut self, to: NodeId, about: NodeId) {
        let Some(node) = self.nodes.get(&about) else { return };
        let msg = Message {
            header: self.build_header(),
            body: MessageBody::Update {
                node: about,
                config_epoch: node.config_epoch,
                slots: node.slots.clone(),
            },
        };
        self.send_message(to, &msg);
    }

    /// Relays a pub/sub payload to every reachable peer.
    pub fn publish(&mut self, channel: Bytes, message: Bytes) {
        let msg = Message {
            header: self.build_header(),
            body: MessageBody::Publish { channel, message },
        };
        self.broadcast_message(&msg);
    }

    // -- link lifecycle (called by the host) --

    /// The dial for `node` succeeded. Queues the first PING (or MEET when
    /// the node was added by an operator MEET).
    pub fn link_established(&mut self, node: NodeId, now: u64) {
        let Some(n) = self.nodes.get_mut(&node) else { return };
        n.link = LinkState::Connected { since: now };
        let meet = n.flags.contains(NodeFlags::MEET);
        let old_ping_sent = n.ping_sent;
        let kind = if meet { MessageType::Meet } else { MessageType::Ping };
        self.send_ping(node, kind, now);
        if old_ping_sent != 0 {
            // keep the pre-reconnect ping time so failure detection
            // stays armed across link churn
            if let Some(n) = self.nodes.get_mut(&node) {
                n.ping_sent = old_ping_sent;
            }
        }
        // one MEET is enough; after the PONG we talk with normal PINGs
        if let Some(n) = self.nodes.get_mut(&node) {
            n.flags.remove(NodeFlags::MEET);
        }
    }

    /// The dial for `node` failed before anything was sent.
    pub fn connect_failed(&mut self, node: NodeId, now: u64) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.link = LinkState::Disconnected;
            // claim a ping was in flight so failure detection can work
            // even while the peer refuses connections
            if n.ping_sent == 0 {
                n.ping_sent = now;
            }
        }
    }

    /// The link to `node` dropped (I/O error or remote close). A dial
    /// already in flight is left alone; its own callback settles it.
    pub fn link_closed(&mut self, node: NodeId) {
        if let Some(n) = self.nodes.get_mut(&node) {
            if n.link.is_connected() {
                n.link = LinkState::Disconnected;
            }
        }
    }

    // -- inbound packets --

    /// Processes one complete frame received on `link`.
    pub fn handle_packet(&mut self, link: LinkId, data: &[u8], now: u64) -> PacketOutcome {
        let mut outcome = PacketOutcome::default();
        let msg = match Message::decode(data) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%err, "dropping malformed bus packet");
                return outcome;
            }
        };
        self.stats_messages_received += 1;
        let kind = msg.kind();
        let hdr = &msg.header;
        let sender_id = hdr.sender;

        let sender_in_table = self.nodes.contains(&sender_id);
        let sender_known = self
            .nodes
            .get(&sender_id)
            .is_some_and(|n| !n.in_handshake());

        if sender_known {
            // observing a higher epoch anywhere raises ours
            if hdr.current_epoch > self.current_epoch {
                self.current_epoch = hdr.current_epoch;
            }
            let my_master = self.myself_master();
            let node = self.nodes.get_mut(&sender_id).expect("sender known");
            if hdr.config_epoch > node.config_epoch {
                node.config_epoch = hdr.config_epoch;
                self.todo.insert(Todo::SAVE_CONFIG | Todo::FSYNC_CONFIG);
            }
            let node = self.nodes.get_mut(&sender_id).expect("sender known");
            node.repl_offset = hdr.repl_offset;
            node.repl_offset_time = now;
            // replica waiting on a paused master's offset for manual failover
            if self.manual.end != 0
                && !self.myself_is_master()
                && my_master == Some(sender_id)
                && hdr.mflags & MFLAG_PAUSED != 0
                && self.manual.master_offset == 0
            {
                self.manual.master_offset = hdr.repl_offset;
                info!(
                    offset = self.manual.master_offset,
                    "received replication offset for paused master manual failover"
                );
            }
        }

        match kind {
            MessageType::Ping | MessageType::Meet => {
                // a MEET from a stranger introduces it to our table
                if !sender_in_table && kind == MessageType::Meet {
                    if let LinkId::Accepted { peer_host } = &link {
                        let mut node =
                            Node::new(NodeId::random(), NodeFlags::new(NodeFlags::HANDSHAKE), now);
                        node.host = peer_host.clone();
                        node.port = hdr.port;
                        self.nodes.insert(node);
                        self.todo.insert(Todo::SAVE_CONFIG);
                    }
                    // gossip from a MEET is trusted by message type
                    self.process_gossip_section(&msg, now);
                }
                // always answer with a PONG on the same link
                let pong = self.build_gossip_message(MessageType::Pong, now);
                outcome.replies.push(pong.encode());
                self.stats_messages_sent += 1;
            }
            _ => {}
        }

        if matches!(
            kind,
            MessageType::Ping | MessageType::Pong | MessageType::Meet
        ) {
            if let LinkId::Peer(link_node) = &link {
                let link_node = *link_node;
                let in_handshake = self
                    .nodes
                    .get(&link_node)
                    .is_some_and(|n| n.in_handshake());
                if in_handshake {
                    if sender_known {
                        // the handshake reached a node we already know under
                        // its real identity; keep that record, drop this one
                        self.update_node_address(sender_id, None, hdr.port, now);
                        self.del_node(link_node);
                        outcome.close_link = true;
                        return outcome;
                    }
                    // first contact: adopt the real identity in place
                    debug!(id = %sender_id.short(), "handshake completed");
                    self.nodes.rename(&link_node, sender_id);
                    let node = self.nodes.get_mut(&sender_id).expect("just renamed");
                    node.flags.remove(NodeFlags::HANDSHAKE);
                    let role = hdr.flags.bits() & (NodeFlags::MASTER | NodeFlags::REPLICA);
                    node.flags.insert(role);
                    self.todo.insert(Todo::SAVE_CONFIG);
                } else if link_node != sender_id {
                    // the peer at this address is not who we thought
                    debug!(
                        expected = %link_node.short(),
                        got = %sender_id.short(),
                        "reply carries mismatching sender id"
                    );
                    if let Some(node) = self.nodes.get_mut(&link_node) {
                        node.flags.insert(NodeFlags::NOADDR);
                        node.host.clear();
                        node.port = 0;
                        node.link = LinkState::Disconnected;
                    }
                    self.todo.insert(Todo::SAVE_CONFIG);
                    outcome.close_link = true;
                    return outcome;
                }
            }

            // a PING arriving on an inbound link may reveal a changed address
            if sender_known && kind == MessageType::Ping {
                if let LinkId::Accepted { peer_host } = &link {
                    self.update_node_address(sender_id, Some(peer_host.clone()), hdr.port, now);
                }
            }

            if let LinkId::Peer(link_node) = &link {
                let link_node = *link_node;
                if kind == MessageType::Pong {
                    let mut still_failed = false;
                    if let Some(node) = self.nodes.get_mut(&link_node) {
                        node.pong_received = now;
                        node.ping_sent = 0;
                        if node.timed_out() {
                            // momentary suspicion reversed by direct contact
                            node.flags.remove(NodeFlags::PFAIL);
                            self.todo.insert(Todo::SAVE_CONFIG | Todo::UPDATE_STATE);
                        } else if node.failed() {
                            still_failed = true;
                        }
                    }
                    if still_failed {
                        self.clear_failure_if_needed(link_node, now);
                    }
                }
            }

            if sender_known {
                self.apply_sender_role(&msg, now);
                self.apply_sender_slots(&msg, now);
                // same configEpoch on two masters: resolve deterministically
                if self.myself_is_master()
                    && self.nodes.get(&sender_id).is_some_and(|n| n.is_master())
                    && hdr.config_epoch == self.myself_node().config_epoch
                {
                    self.handle_config_epoch_collision(sender_id, now);
                }
                self.process_gossip_section(&msg, now);
            }
        } else {
            match (kind, &msg.body) {
                (MessageType::Fail, MessageBody::Fail { node }) => {
                    if sender_known {
                        self.apply_fail_message(*node, sender_id, now);
                    } else {
                        debug!(
                            about = %node.short(),
                            "ignoring FAIL message from unknown node"
                        );
                    }
                }
                (MessageType::Publish, MessageBody::Publish { channel, message }) => {
                    self.events.push(Event::PublishReceived {
                        channel: channel.clone(),
                        message: message.clone(),
                    });
                }
                (MessageType::FailoverAuthRequest, _) => {
                    if sender_known {
                        self.maybe_grant_failover_auth(sender_id, &msg, now);
                    }
                }
                (MessageType::FailoverAuthAck, _) => {
                    if sender_known {
                        self.record_failover_vote(sender_id, hdr.current_epoch);
                    }
                }
                (MessageType::MfStart, _) => {
                    if sender_known {
                        self.handle_mfstart(sender_id, now);
                    }
                }
                (MessageType::Update, MessageBody::Update { node, config_epoch, slots }) => {
                    if sender_known {
                        self.apply_update_message(*node, *config_epoch, slots.clone(), now);
                    }
                }
                _ => {}
            }
        }

        outcome
    }

    /// Records a quorum-confirmed failure learned via a FAIL broadcast.
    fn apply_fail_message(&mut self, about: NodeId, from: NodeId, now: u64) {
        let Some(node) = self.nodes.get_mut(&about) else { return };
        if node.flags.contains(NodeFlags::FAIL | NodeFlags::MYSELF) {
            return;
        }
        info!(from = %from.short(), about = %about.short(), "FAIL message received");
        node.flags.insert(NodeFlags::FAIL);
        node.flags.remove(NodeFlags::PFAIL);
        node.fail_time = now;
        self.todo.insert(Todo::SAVE_CONFIG | Todo::UPDATE_STATE);
    }

    /// Applies an UPDATE payload: a newer config for `about`.
    fn apply_update_message(
        &mut self,
        about: NodeId,
        config_epoch: u64,
        slots: SlotBitmap,
        now: u64,
    ) {
        let Some(node) = self.nodes.get(&about) else { return };
        if node.config_epoch >= config_epoch {
            return;
        }
        if node.is_replica() {
            self.set_node_as_master(about, now);
        }
        if let Some(node) = self.nodes.get_mut(&about) {
            node.config_epoch = config_epoch;
        }
        self.todo.insert(Todo::SAVE_CONFIG | Todo::FSYNC_CONFIG);
        self.update_slots_config_with(about, config_epoch, &slots, now);
    }

    /// Master side of MFSTART: pause writes and start flagging our pings.
    fn handle_mfstart(&mut self, sender: NodeId, now: u64) {
        let from_own_replica = self
            .nodes
            .get(&sender)
            .is_some_and(|n| n.replicates == Some(self.myself));
        if !from_own_replica {
            return;
        }
        self.reset_manual_failover(now);
        self.manual.end = now + MF_TIMEOUT_MS;
        self.manual.replica = Some(sender);
        self.data.pause_clients(now + MF_TIMEOUT_MS * 2);
        info!(replica = %sender.short(), "manual failover requested by replica");
    }

    /// Role bookkeeping from a PING/PONG/MEET header: master/replica flips
    /// and master reassignments.
    fn apply_sender_role(&mut self, msg: &Message, now: u64) {
        let sender_id = msg.header.sender;
        match msg.header.replicates {
            None => self.set_node_as_master(sender_id, now),
            Some(master_id) => {
                let was_master = self
                    .nodes
                    .get(&sender_id)
                    .is_some_and(|n| n.is_master());
                if was_master {
                    // master turned replica: its slots are up for grabs
                    self.del_node_slots(sender_id);
                    let node = self.nodes.get_mut(&sender_id).expect("sender known");
                    node.flags.remove(NodeFlags::MASTER);
                    node.flags.insert(NodeFlags::REPLICA);
                    node.replicas.clear();
                    self.todo.insert(Todo::SAVE_CONFIG | Todo::UPDATE_STATE);
                }
                let master_known = self.nodes.contains(&master_id);
                let current = self.nodes.get(&sender_id).and_then(|n| n.replicates);
                if master_known && current != Some(master_id) {
                    if let Some(old) = current {
                        self.remove_replica(old, sender_id);
                    }
                    if let Some(m) = self.nodes.get_mut(&master_id) {
                        if !m.replicas.contains(&sender_id) {
                            m.replicas.push(sender_id);
                        }
                    }
                    if let Some(n) = self.nodes.get_mut(&sender_id) {
                        n.replicates = Some(master_id);
                    }
                    self.todo.insert(Todo::SAVE_CONFIG);
                }
            }
        }
    }

    /// Slot bookkeeping from a PING/PONG/MEET header: reconcile claims and
    /// push back at stale senders.
    fn apply_sender_slots(&mut self, msg: &Message, now: u64) {
        let hdr = &msg.header;
        let sender_id = hdr.sender;
        let sender_master = match self.nodes.get(&sender_id) {
            Some(n) if n.is_master() => Some(sender_id),
            Some(n) => n.replicates,
            None => None,
        };
        let dirty = sender_master
            .and_then(|m| self.nodes.get(&m))
            .map(|m| m.slots.as_raw() != hdr.slots.as_raw())
            .unwrap_or(false);
        if !dirty {
            return;
        }

        if self.nodes.get(&sender_id).is_some_and(|n| n.is_master()) {
            self.update_slots_config_with(sender_id, hdr.config_epoch, &hdr.slots, now);
        }

        // the sender may be the stale one: claims covered by a higher
        // configEpoch owner earn it an UPDATE with the winning config
        for slot in 0..SLOT_COUNT {
            if !hdr.slots.get(slot) {
                continue;
            }
            let Some(owner) = self.slot_map.owner(slot) else { continue };
            if owner == sender_id {
                continue;
            }
            let owner_epoch = self.nodes.get(&owner).map(|n| n.config_epoch).unwrap_or(0);
            if owner_epoch > hdr.config_epoch {
                debug!(
                    sender = %sender_id.short(),
                    owner = %owner.short(),
                    slot,
                    "sender has stale slot configuration, sending UPDATE"
                );
                self.send_update(sender_id, owner);
                break;
            }
        }
    }

    /// Updates a node's address when a packet proves it moved, dropping the
    /// stale link so the next tick reconnects. `host` of `None` keeps the
    /// recorded host (used when only the port is in question).
    fn update_node_address(
        &mut self,
        id: NodeId,
        host: Option<String>,
        port: u16,
        _now: u64,
    ) {
        let Some(node) = self.nodes.get_mut(&id) else { return };
        let new_host = host.unwrap_or_else(|| node.host.clone());
        if node.port == port && node.host == new_host {
            return;
        }
        node.host = new_host.clone();
        node.port = port;
        node.flags.remove(NodeFlags::NOADDR);
        if node.link.is_connected() {
            node.link = LinkState::Disconnected;
            self.outbox.push(Outbound::Disconnect { node: id });
        }
        warn!(id = %id.short(), host = %new_host, port, "address updated for node");
        if !self.myself_is_master() && self.myself_master() == Some(id) {
            self.data.set_replication_master(&new_host, port);
        }
        self.todo.insert(Todo::SAVE_CONFIG | Todo::UPDATE_STATE);
    }

    // -- tick --

    /// One cron iteration; the host calls this ten times per second.
    pub fn tick(&mut self, now: u64) {
        self.iteration += 1;
        let handshake_timeout = self.config.handshake_timeout_ms();
        let node_timeout = self.config.node_timeout_ms;

        // reconnect pass, and handshake reaping
        for id in self.nodes.ids() {
            let Some(node) = self.nodes.get(&id) else { continue };
            if node.flags.contains(NodeFlags::MYSELF | NodeFlags::NOADDR) {
                continue;
            }
            if node.in_handshake() && now.saturating_sub(node.ctime) > handshake_timeout {
                debug!(id = %id.short(), "handshake timed out, dropping node");
                self.del_node(id);
                continue;
            }
            if node.link == LinkState::Disconnected {
                let host = node.host.clone();
                let bus_port = node.bus_port(self.config.bus_port_offset);
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.link = LinkState::Connecting { since: now };
                }
                self.outbox.push(Outbound::Connect {
                    node: id,
                    host,
                    bus_port,
                });
            }
        }

        // sample a few peers and ping the one silent the longest
        self.ping_oldest_of_random_sample(now);

        let mut orphaned_masters = 0usize;
        let mut max_replicas = 0usize;
        let mut my_ring_replicas = 0usize;
        let mut update_state = false;
        let i_am_replica = !self.myself_is_master();
        let my_master = self.myself_master();

        for id in self.nodes.ids() {
            let Some(node) = self.nodes.get(&id) else { continue };
            if node
                .flags
                .contains(NodeFlags::MYSELF | NodeFlags::NOADDR | NodeFlags::HANDSHAKE)
            {
                continue;
            }

            if i_am_replica && node.is_master() && !node.failed() {
                let ok_replicas = self.count_ok_replicas(node);
                // orphaned: serving slots, no live replicas, had replicas once
                if ok_replicas == 0 && node.slots.count() > 0 && !node.replicas.is_empty() {
                    orphaned_masters += 1;
                }
                max_replicas = max_replicas.max(ok_replicas);
                if my_master == Some(id) {
                    my_ring_replicas = ok_replicas;
                }
            }

            let node = self.nodes.get(&id).expect("id snapshot");
            // a silent link older than the timeout gets recycled early
            if let LinkState::Connected { since } = node.link {
                if now.saturating_sub(since) > node_timeout
                    && node.ping_sent != 0
                    && node.pong_received < node.ping_sent
                    && now.saturating_sub(node.ping_sent) > node_timeout / 2
                {
                    if let Some(node) = self.nodes.get_mut(&id) {
                        node.link = LinkState::Disconnected;
                    }
                    self.outbox.push(Outbound::Disconnect { node: id });
                }
            }

            let node = self.nodes.get(&id).expect("id snapshot");
            if node.link.is_connected()
                && node.ping_sent == 0
                && now.saturating_sub(node.pong_received) > node_timeout / 2
            {
                self.send_ping(id, MessageType::Ping, now);
                continue;
            }

            // a master mid manual-failover pings the requesting replica
            // continuously so it sees the PAUSED offset quickly
            if self.manual.end != 0
                && !i_am_replica
                && self.manual.replica == Some(id)
                && self.nodes.get(&id).is_some_and(|n| n.link.is_connected())
            {
                self.send_ping(id, MessageType::Ping, now);
                continue;
            }

            let node = self.nodes.get(&id).expect("id snapshot");
            if node.ping_sent == 0 {
                continue;
            }
            if now.saturating_sub(node.ping_sent) > node_timeout && !node.flags.is_failing() {
                debug!(id = %id.short(), "node is possibly failing");
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.flags.insert(NodeFlags::PFAIL);
                }
                update_state = true;
            }
        }

        // a replica whose replication target was never wired up (e.g. the
        // master address only just became known) fixes that here
        if i_am_replica {
            if let Some(master_id) = my_master {
                let master_ready = self
                    .nodes
                    .get(&master_id)
                    .is_some_and(|m| m.has_addr());
                if master_ready && !self.data.replication_master_set() {
                    let (host, port) = {
                        let m = self.nodes.get(&master_id).expect("checked above");
                        (m.host.clone(), m.port)
                    };
                    self.data.set_replication_master(&host, port);
                }
            }
        }

        self.manual_failover_check_timeout(now);

        if i_am_replica {
            self.handle_manual_failover(now);
            self.handle_replica_failover(now);
            // migrating to an orphaned master only makes sense when some
            // ring still has at least two working replicas
            if orphaned_masters > 0 && max_replicas >= 2 && my_ring_replicas == max_replicas {
                self.handle_replica_migration(max_replicas, now);
            }
        }

        if update_state || self.state == ClusterHealth::Fail {
            self.update_state(now);
        }
    }

    fn ping_oldest_of_random_sample(&mut self, now: u64) {
        let mut rng = rand::rng();
        let mut best: Option<(NodeId, u64)> = None;
        for _ in 0..5 {
            let Some(id) = self.nodes.random_id(&mut rng) else { break };
            let Some(node) = self.nodes.get(&id) else { continue };
            if !node.link.is_connected() || node.ping_sent != 0 {
                continue;
            }
            if node
                .flags
                .contains(NodeFlags::MYSELF | NodeFlags::HANDSHAKE)
            {
                continue;
            }
            if best.is_none_or(|(_, pong)| node.pong_received < pong) {
                best = Some((id, node.pong_received));
            }
        }
        if let Some((id, _)) = best {
            self.send_ping(id, MessageType::Ping, now);
        }
    }

    // -- before-sleep hook --

    /// Runs the deferred work accumulated by packet handlers and the tick:
    /// election progress, state re-evaluation, and configuration
    /// persistence. The host calls this between event-loop batches; a
    /// persistence failure is fatal for the node and is returned to the
    /// host to abort on.
    pub fn before_sleep(&mut self, now: u64) -> Result<(), ClusterError> {
        if self.todo.contains(Todo::HANDLE_FAILOVER) {
            self.todo.remove(Todo::HANDLE_FAILOVER);
            self.handle_replica_failover(now);
        }
        if self.todo.contains(Todo::UPDATE_STATE) {
            self.update_state(now);
        }
        if self.todo.contains(Todo::SAVE_CONFIG) {
            let fsync = self.todo.contains(Todo::FSYNC_CONFIG);
            self.save_config(fsync)?;
        }
        self.todo = Todo::default();
        Ok(())
    }

    /// Serializes the node view to the locked config file, if one is open.
    pub fn save_config(&mut self, fsync: bool) -> Result<(), ClusterError> {
        self.todo.remove(Todo::SAVE_CONFIG | Todo::FSYNC_CONFIG);
        let payload = crate::persist::format_nodes(self);
        if let Some(persist) = self.persist.as_mut() {
            persist.save(&payload, fsync && self.config.fsync)?;
        }
        Ok(())
    }

    pub(crate) fn reset_manual_failover(&mut self, _now: u64) {
        self.manual = ManualFailover::default();
    }

    pub(crate) fn manual_failover_check_timeout(&mut self, now: u64) {
        if self.manual.end != 0 && self.manual.end < now {
            warn!("manual failover timed out");
            self.reset_manual_failover(now);
        }
    }

    /// Replica side of the manual failover state machine: once our offset
    /// catches up with the paused master's, the election may start.
    pub(crate) fn handle_manual_failover(&mut self, _now: u64) {
        if self.manual.end == 0 || self.manual.can_start {
            return;
        }
        if self.manual.master_offset == 0 {
            return;
        }
        if self.manual.master_offset == self.data.replication_offset() {
            self.manual.can_start = true;
            info!("all master replication stream processed, manual failover can start");
        }
    }
}

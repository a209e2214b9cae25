//! Gossip: the random peer digest carried by every PING/PONG/MEET, and the
//! ingest path that turns received digests into failure reports and
//! handshakes with newly discovered nodes.

use tracing::debug;

use crate::data::DataPlane;
use crate::engine::Cluster;
use crate::message::{GossipEntry, Message, MessageBody, MessageType};
use crate::node::NodeFlags;

impl<D: DataPlane> Cluster<D> {
    /// Builds a PING/PONG/MEET carrying a random sample of known peers.
    ///
    /// The sample holds between 3 and a tenth of the table, never more than
    /// `N - 2` (the header already describes us, and the receiver knows
    /// itself). Sampling is randomized with a deliberate bias: the first
    /// third of the draw attempts only accepts PFAIL/FAIL peers, so failure
    /// evidence travels faster than routine liveness.
    pub(crate) fn build_gossip_message(&self, kind: MessageType, _now: u64) -> Message {
        let n = self.nodes.len();
        let freshnodes = n.saturating_sub(2);
        let wanted = (n / 10).max(3).min(freshnodes.max(0));

        let mut entries: Vec<GossipEntry> = Vec::with_capacity(wanted);
        let mut rng = rand::rng();
        let mut remaining = freshnodes;
        let mut iterations = wanted * 3;

        while remaining > 0 && entries.len() < wanted && iterations > 0 {
            iterations -= 1;
            let Some(id) = self.nodes.random_id(&mut rng) else { break };
            let node = self.nodes.get(&id).expect("sampled id");

            if id == self.myself {
                continue;
            }
            // bias window: early draws only keep failing nodes
            if iterations > wanted * 2 && !node.flags.is_failing() {
                continue;
            }
            if node.flags.contains(NodeFlags::HANDSHAKE | NodeFlags::NOADDR)
                || (!node.link.is_connected() && node.slots.is_empty())
            {
                remaining -= 1;
                continue;
            }
            if entries.iter().any(|e| e.node == id) {
                continue;
            }
            remaining -= 1;
            entries.push(GossipEntry {
                node: id,
                ping_sent: node.ping_sent,
                pong_received: node.pong_received,
                host: node.host.clone(),
                port: node.port,
                flags: node.flags,
            });
        }

        let body = match kind {
            MessageType::Ping => MessageBody::Ping(entries),
            MessageType::Pong => MessageBody::Pong(entries),
            MessageType::Meet => MessageBody::Meet(entries),
            other => unreachable!("{other:?} carries no gossip"),
        };
        Message {
            header: self.build_header(),
            body,
        }
    }

    /// Sends a PING (or MEET) to `to`, arming the ping timestamp used by
    /// failure detection.
    pub(crate) fn send_ping(&mut self, to: crate::NodeId, kind: MessageType, now: u64) {
        if kind == MessageType::Ping {
            if let Some(node) = self.nodes.get_mut(&to) {
                node.ping_sent = now;
            }
        }
        let msg = self.build_gossip_message(kind, now);
        self.send_message(to, &msg);
    }

    /// Ingests the gossip section of a PING/PONG/MEET.
    ///
    /// For peers we know: failure evidence from master senders becomes a
    /// failure report (or retracts one), and an address mismatch on an
    /// unreachable peer starts a handshake with the advertised address. For
    /// peers we don't know: a handshake, provided the sender itself is
    /// known and the identity is not blacklisted.
    pub(crate) fn process_gossip_section(&mut self, msg: &Message, now: u64) {
        let Some(entries) = msg.gossip() else { return };
        let sender_id = msg.header.sender;
        let sender_is_known_master = self
            .nodes
            .get(&sender_id)
            .is_some_and(|n| !n.in_handshake() && n.is_master());
        let sender_known = self
            .nodes
            .get(&sender_id)
            .is_some_and(|n| !n.in_handshake());

        for entry in entries.to_vec() {
            debug!(
                node = %entry.node.short(),
                host = %entry.host,
                port = entry.port,
                flags = %entry.flags,
                "gossip"
            );
            if self.nodes.contains(&entry.node) {
                if sender_is_known_master && entry.node != self.myself {
                    if entry.flags.is_failing() {
                        if let Some(node) = self.nodes.get_mut(&entry.node) {
                            if node.add_failure_report(sender_id, now) {
                                debug!(
                                    reporter = %sender_id.short(),
                                    about = %entry.node.short(),
                                    "node reported as not reachable"
                                );
                            }
                        }
                        self.mark_failing_if_needed(entry.node, now);
                    } else if let Some(node) = self.nodes.get_mut(&entry.node) {
                        if node.del_failure_report(sender_id) {
                            debug!(
                                reporter = %sender_id.short(),
                                about = %entry.node.short(),
                                "node reported as reachable again"
                            );
                        }
                    }
                }

                // an unreachable peer gossiped at a new address is worth a
                // handshake; success will rebind the address
                let moved = self.nodes.get(&entry.node).is_some_and(|n| {
                    n.flags.is_failing() && (n.host != entry.host || n.port != entry.port)
                });
                if moved {
                    self.start_handshake(&entry.host, entry.port, now);
                }
            } else if sender_known
                && !entry.flags.contains(NodeFlags::NOADDR)
                && !self.blacklist.contains(&entry.node, now)
            {
                self.start_handshake(&entry.host, entry.port, now);
            }
        }
    }
}

//! Failover elections.
//!
//! When a replica sees its master FAIL (or a manual failover is armed), it
//! schedules an epoch-ordered vote: wait a rank-proportional delay, bump
//! `currentEpoch`, broadcast FAILOVER_AUTH_REQUEST, and collect ACKs from
//! masters. A majority of slot-serving masters promotes the replica, which
//! claims its master's slots and announces the new configuration with a
//! broadcast PONG.

use rand::Rng;
use tracing::{debug, info, warn};

use crate::data::DataPlane;
use crate::engine::{CantFailover, Cluster, Todo};
use crate::message::{Message, MessageBody, MFLAG_FORCEACK};
use crate::NodeId;

/// Repeat-suppression window for "can't failover" log lines.
const CANT_FAILOVER_RELOG_MS: u64 = 5 * 60 * 1000;

impl<D: DataPlane> Cluster<D> {
    /// This replica's election rank: the number of co-replicas of the same
    /// master claiming a greater replication offset. Rank 0 is the most
    /// up-to-date replica; each rank adds a second of election delay so
    /// fresher replicas usually win.
    pub(crate) fn replica_rank(&self) -> usize {
        let Some(master_id) = self.myself_master() else {
            return 0;
        };
        let Some(master) = self.nodes.get(&master_id) else {
            return 0;
        };
        let my_offset = self.data.replication_offset();
        master
            .replicas
            .iter()
            .filter(|id| **id != self.myself)
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| n.repl_offset > my_offset)
            .count()
    }

    fn log_cant_failover(&mut self, reason: CantFailover, now: u64) {
        if reason == self.failover.cant_reason
            && now.saturating_sub(self.failover.last_log) < CANT_FAILOVER_RELOG_MS
        {
            return;
        }
        self.failover.cant_reason = reason;
        // stay quiet while the failure is recent; this log exists to flag
        // replicas stalled for a long time
        let nolog_window = self.config.node_timeout_ms + 5000;
        let master_recently_failed = self
            .myself_master()
            .and_then(|m| self.nodes.get(&m))
            .is_some_and(|m| m.failed() && now.saturating_sub(m.fail_time) < nolog_window);
        if master_recently_failed {
            return;
        }
        self.failover.last_log = now;
        let msg = match reason {
            CantFailover::None => return,
            CantFailover::DataAge => "Disconnected from master for longer than allowed.",
            CantFailover::WaitingDelay => "Waiting the delay before I can start a new failover.",
            CantFailover::Expired => "Failover attempt expired.",
            CantFailover::WaitingVotes => "Waiting for votes, but majority still not reached.",
        };
        warn!("currently unable to failover: {msg}");
    }

    /// Broadcasts our vote request for the current attempt, flagged with
    /// FORCEACK when this is a manual failover.
    fn request_failover_auth(&mut self) {
        let mut header = self.build_header();
        if self.manual.end != 0 {
            header.mflags |= MFLAG_FORCEACK;
        }
        let msg = Message {
            header,
            body: MessageBody::FailoverAuthRequest,
        };
        self.broadcast_message(&msg);
    }

    /// Counts an AUTH_ACK toward the running election: only votes from
    /// slot-serving masters cast at (or after) our election epoch count.
    pub(crate) fn record_failover_vote(&mut self, from: NodeId, sender_current_epoch: u64) {
        let valid = self
            .nodes
            .get(&from)
            .is_some_and(|n| n.is_master() && !n.slots.is_empty());
        if valid && sender_current_epoch >= self.failover.epoch {
            self.failover.count += 1;
            // quorum may be in: re-check before the next sleep
            self.todo.insert(Todo::HANDLE_FAILOVER);
        }
    }

    /// Voter side: grants one vote per `currentEpoch`, only to a replica of
    /// a failed master (unless FORCEACK), rate-limited per master ring, and
    /// only when none of the claimed slots is served by a configuration
    /// newer than the request's.
    pub(crate) fn maybe_grant_failover_auth(&mut self, candidate: NodeId, msg: &Message, now: u64) {
        let req_epoch = msg.header.current_epoch;
        let req_config_epoch = msg.header.config_epoch;
        let force_ack = msg.header.mflags & MFLAG_FORCEACK != 0;

        // only masters serving slots are part of the voter base
        if !self.myself_is_master() || self.myself_node().slots.is_empty() {
            return;
        }

        if req_epoch < self.current_epoch {
            warn!(
                candidate = %candidate.short(),
                req_epoch,
                current_epoch = self.current_epoch,
                "failover auth denied: request epoch is stale"
            );
            return;
        }
        if self.last_vote_epoch == self.current_epoch {
            warn!(
                candidate = %candidate.short(),
                epoch = self.current_epoch,
                "failover auth denied: already voted for this epoch"
            );
            return;
        }

        let master_id = self.nodes.get(&candidate).and_then(|n| n.replicates);
        let candidate_is_master = self.nodes.get(&candidate).is_some_and(|n| n.is_master());
        let master_failed = master_id
            .and_then(|m| self.nodes.get(&m))
            .is_some_and(|m| m.failed());
        if candidate_is_master || master_id.is_none() || (!master_failed && !force_ack) {
            warn!(
                candidate = %candidate.short(),
                "failover auth denied: candidate is not a replica of a failed master"
            );
            return;
        }
        let master_id = master_id.expect("checked above");

        // one vote per master ring per two node timeouts
        let voted_recently = self
            .nodes
            .get(&master_id)
            .is_some_and(|m| now.saturating_sub(m.voted_time) < self.config.node_timeout_ms * 2);
        if voted_recently {
            warn!(
                candidate = %candidate.short(),
                "failover auth denied: voted for this master's ring too recently"
            );
            return;
        }

        // every claimed slot must be unowned, owned by the candidate's
        // master, or covered by a configEpoch no newer than the request's
        for slot in msg.header.slots.iter() {
            let Some(owner) = self.slot_map.owner(slot) else {
                continue;
            };
            if owner == master_id {
                continue;
            }
            let owner_epoch = self.nodes.get(&owner).map(|n| n.config_epoch).unwrap_or(0);
            if owner_epoch <= req_config_epoch {
                continue;
            }
            warn!(
                candidate = %candidate.short(),
                slot,
                owner_epoch,
                req_config_epoch,
                "failover auth denied: claimed slot served by a newer configuration"
            );
            return;
        }

        // grant
        let ack = Message {
            header: self.build_header(),
            body: MessageBody::FailoverAuthAck,
        };
        self.send_message(candidate, &ack);
        self.last_vote_epoch = self.current_epoch;
        if let Some(m) = self.nodes.get_mut(&master_id) {
            m.voted_time = now;
        }
        warn!(
            candidate = %candidate.short(),
            epoch = self.current_epoch,
            "failover auth granted"
        );
    }

    /// Replica side of the election state machine, run from the tick and
    /// re-run before sleep whenever a vote arrives.
    pub(crate) fn handle_replica_failover(&mut self, now: u64) {
        self.todo.remove(Todo::HANDLE_FAILOVER);

        let auth_age = now.saturating_sub(self.failover.time);
        let needed_quorum = self.size / 2 + 1;
        let manual_failover = self.manual.end != 0 && self.manual.can_start;
        let auth_timeout = self.config.auth_timeout_ms();
        let auth_retry = self.config.auth_retry_ms();
        let node_timeout = self.config.node_timeout_ms;

        // preconditions: replica of a slot-serving master that is FAIL
        // (or a manual failover is armed)
        let master_id = self.myself_master();
        let master = master_id.and_then(|m| self.nodes.get(&m));
        let eligible = !self.myself_is_master()
            && master.is_some_and(|m| {
                (m.failed() || manual_failover) && !m.slots.is_empty()
            });
        if !eligible {
            self.failover.cant_reason = CantFailover::None;
            return;
        }

        // data freshness: bounded staleness unless manual
        let mut data_age = self.data.master_link_age_ms(now);
        if data_age > node_timeout {
            data_age -= node_timeout;
        }
        if self.config.replica_validity_factor != 0
            && data_age
                > self.config.repl_ping_replica_period_ms
                    + node_timeout * self.config.replica_validity_factor
            && !manual_failover
        {
            self.log_cant_failover(CantFailover::DataAge, now);
            return;
        }

        // schedule a (re)attempt once the previous window has fully expired
        if self.failover.time == 0 || auth_age > auth_retry {
            let jitter: u64 = rand::rng().random_range(0..500);
            self.failover.count = 0;
            self.failover.sent = false;
            self.failover.rank = self.replica_rank();
            // fixed 500ms lets FAIL propagate; rank penalizes stale replicas
            self.failover.time = now + 500 + jitter + self.failover.rank as u64 * 1000;
            if self.manual.end != 0 {
                self.failover.time = now;
                self.failover.rank = 0;
            }
            info!(
                delay_ms = self.failover.time.saturating_sub(now),
                rank = self.failover.rank,
                offset = self.data.replication_offset(),
                "start of election delayed"
            );
            // co-replicas learn our offset and may re-rank themselves
            self.broadcast_pong(true, now);
            return;
        }

        // offsets moved since scheduling: accept a worse rank and its delay
        if !self.failover.sent && self.manual.end == 0 {
            let newrank = self.replica_rank();
            if newrank > self.failover.rank {
                let added = (newrank - self.failover.rank) as u64 * 1000;
                self.failover.time += added;
                self.failover.rank = newrank;
                info!(rank = newrank, added_ms = added, "replica rank updated");
            }
        }

        if now < self.failover.time {
            self.log_cant_failover(CantFailover::WaitingDelay, now);
            return;
        }
        if auth_age > auth_timeout {
            self.log_cant_failover(CantFailover::Expired, now);
            return;
        }

        if !self.failover.sent {
            self.current_epoch += 1;
            self.failover.epoch = self.current_epoch;
            warn!(epoch = self.failover.epoch, "starting a failover election");
            self.request_failover_auth();
            self.failover.sent = true;
            self.todo
                .insert(Todo::SAVE_CONFIG | Todo::UPDATE_STATE | Todo::FSYNC_CONFIG);
            return;
        }

        if self.failover.count >= needed_quorum {
            warn!("failover election won, I'm the new master");
            if self.myself_node().config_epoch < self.failover.epoch {
                let epoch = self.failover.epoch;
                self.myself_node_mut().config_epoch = epoch;
                warn!(config_epoch = epoch, "configEpoch set after successful failover");
            }
            self.failover_replace_your_master(now);
        } else {
            self.log_cant_failover(CantFailover::WaitingVotes, now);
        }
    }

    /// Final step of automatic, forced and takeover failovers: become a
    /// master, claim every slot of the old master, announce, persist.
    /// The caller has already assigned the new configEpoch.
    pub(crate) fn failover_replace_your_master(&mut self, now: u64) {
        let Some(old_master) = self.myself_master() else {
            return;
        };
        if self.myself_is_master() {
            return;
        }

        let myself = self.myself;
        self.set_node_as_master(myself, now);
        self.data.unset_replication_master();

        let slots: Vec<u16> = self
            .nodes
            .get(&old_master)
            .map(|m| m.slots.iter().collect())
            .unwrap_or_default();
        for slot in slots {
            self.del_slot(slot);
            let _ = self.add_slot(myself, slot);
        }

        self.update_state(now);
        if let Err(err) = self.save_config(true) {
            warn!(%err, "failed to persist config after failover");
        }
        self.broadcast_pong(false, now);
        self.reset_manual_failover(now);
        debug!(old_master = %old_master.short(), "took over master's slots");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryDataPlane;
    use crate::engine::Outbound;
    use crate::message::MessageType;
    use crate::node::NodeFlags;
    use crate::test_util::*;

    /// A cluster where we are a replica of a failed slot-serving master,
    /// with two more slot-serving masters as the voter base.
    fn failover_fixture() -> (Cluster<MemoryDataPlane>, NodeId, NodeId, NodeId) {
        let mut cluster = Cluster::new(test_config(), MemoryDataPlane::new());
        let m1 = add_connected_master(&mut cluster, 1, 0);
        let m2 = add_connected_master(&mut cluster, 2, 0);
        let m3 = add_connected_master(&mut cluster, 3, 0);
        cluster.add_slot(m1, 100).unwrap();
        cluster.add_slot(m2, 200).unwrap();
        cluster.add_slot(m3, 300).unwrap();

        // become a replica of m1
        let me = cluster.myself_id();
        {
            let node = cluster.myself_node_mut();
            node.flags.remove(NodeFlags::MASTER);
            node.flags.insert(NodeFlags::REPLICA);
            node.replicates = Some(m1);
        }
        cluster.nodes.get_mut(&m1).unwrap().replicas.push(me);
        cluster.data_mut().set_master_contact(0);
        cluster.update_state(0);
        assert_eq!(cluster.size, 3);

        // m1 is FAIL
        let n = cluster.nodes.get_mut(&m1).unwrap();
        n.flags.insert(NodeFlags::FAIL);
        n.fail_time = 0;
        (cluster, m1, m2, m3)
    }

    fn find_sent(outbox: &[Outbound], kind: MessageType) -> Vec<Message> {
        outbox
            .iter()
            .filter_map(|o| match o {
                Outbound::Send { bytes, .. } => Message::decode(bytes).ok(),
                _ => None,
            })
            .filter(|m| m.kind() == kind)
            .collect()
    }

    #[test]
    fn rank_counts_better_offsets() {
        let (mut cluster, m1, _, _) = failover_fixture();
        cluster.data_mut().set_offset(100);
        let r1 = add_connected_replica(&mut cluster, m1, 1, 0);
        let r2 = add_connected_replica(&mut cluster, m1, 2, 0);
        cluster.nodes.get_mut(&r1).unwrap().repl_offset = 200;
        cluster.nodes.get_mut(&r2).unwrap().repl_offset = 50;
        assert_eq!(cluster.replica_rank(), 1);
    }

    #[test]
    fn election_schedules_then_requests_votes() {
        let (mut cluster, _, _, _) = failover_fixture();
        let now = 100_000;
        cluster.data_mut().set_master_contact(now - 500);

        // first pass only schedules the attempt
        cluster.handle_replica_failover(now);
        assert!(cluster.failover.time >= now + 500);
        assert!(!cluster.failover.sent);
        cluster.take_outbox();

        // once the delay passed, the request goes out with a bumped epoch
        let at = cluster.failover.time + 1;
        cluster.handle_replica_failover(at);
        assert!(cluster.failover.sent);
        assert_eq!(cluster.failover.epoch, cluster.current_epoch());
        assert_eq!(cluster.current_epoch(), 1);
        let requests = find_sent(
            &cluster.take_outbox(),
            MessageType::FailoverAuthRequest,
        );
        assert_eq!(requests.len(), 3, "request broadcast to the three masters");
    }

    #[test]
    fn stale_data_aborts_election() {
        let (mut cluster, _, _, _) = failover_fixture();
        let now = 10_000_000;
        // last master contact far beyond the validity bound
        cluster.data_mut().set_master_contact(0);
        cluster.handle_replica_failover(now);
        assert_eq!(cluster.failover.time, 0, "no attempt scheduled");
        assert_eq!(cluster.failover.cant_reason, CantFailover::DataAge);
    }

    #[test]
    fn quorum_win_promotes_and_claims_slots() {
        let (mut cluster, m1, m2, m3) = failover_fixture();
        let now = 100_000;
        cluster.data_mut().set_master_contact(now - 500);
        cluster.handle_replica_failover(now);
        let at = cluster.failover.time + 1;
        cluster.handle_replica_failover(at);
        cluster.take_outbox();

        // two votes: quorum of 3 masters
        cluster.record_failover_vote(m2, cluster.failover.epoch);
        cluster.record_failover_vote(m3, cluster.failover.epoch);
        cluster.handle_replica_failover(at + 10);

        assert!(cluster.myself_is_master());
        assert_eq!(cluster.slot_owner(100), Some(cluster.myself_id()));
        assert!(cluster.node(&m1).unwrap().slots.is_empty());
        assert_eq!(cluster.myself_node().config_epoch, cluster.failover.epoch);
        assert!(!cluster.data().replication_master_set());

        // the win is announced with a PONG broadcast
        let pongs = find_sent(&cluster.take_outbox(), MessageType::Pong);
        assert!(!pongs.is_empty());
    }

    #[test]
    fn votes_from_slotless_or_stale_senders_do_not_count() {
        let (mut cluster, _, m2, _) = failover_fixture();
        let now = 100_000;
        cluster.data_mut().set_master_contact(now - 500);
        cluster.handle_replica_failover(now);
        cluster.handle_replica_failover(cluster.failover.time + 1);

        let slotless = add_connected_master(&mut cluster, 9, 0);
        cluster.record_failover_vote(slotless, cluster.failover.epoch);
        assert_eq!(cluster.failover.count, 0);

        // stale epoch
        cluster.record_failover_vote(m2, cluster.failover.epoch - 1);
        assert_eq!(cluster.failover.count, 0);

        cluster.record_failover_vote(m2, cluster.failover.epoch);
        assert_eq!(cluster.failover.count, 1);
    }

    // -- voter side --

    /// Voter fixture: we are a slot-serving master; `candidate` is a
    /// replica of `failed_master`, also slot-serving and FAIL.
    fn voter_fixture() -> (Cluster<MemoryDataPlane>, NodeId, NodeId) {
        let mut cluster = Cluster::new(test_config(), MemoryDataPlane::new());
        let me = cluster.myself_id();
        cluster.add_slot(me, 0).unwrap();
        let failed_master = add_connected_master(&mut cluster, 1, 0);
        cluster.add_slot(failed_master, 100).unwrap();
        let n = cluster.nodes.get_mut(&failed_master).unwrap();
        n.flags.insert(NodeFlags::FAIL);
        let candidate = add_connected_replica(&mut cluster, failed_master, 1, 0);
        cluster.update_state(0);
        (cluster, candidate, failed_master)
    }

    /// The vote request `candidate` would broadcast at epoch `epoch`.
    fn auth_request(
        cluster: &Cluster<MemoryDataPlane>,
        candidate: NodeId,
        master: NodeId,
        epoch: u64,
    ) -> Message {
        let mut header = cluster.build_header();
        header.sender = candidate;
        header.replicates = Some(master);
        header.flags = NodeFlags::new(NodeFlags::REPLICA);
        header.current_epoch = epoch;
        header.config_epoch = 0;
        header.slots = cluster.nodes.get(&master).unwrap().slots.clone();
        Message {
            header,
            body: MessageBody::FailoverAuthRequest,
        }
    }

    #[test]
    fn vote_granted_once_per_epoch() {
        let (mut cluster, candidate, master) = voter_fixture();
        cluster.current_epoch = 5;
        let req = auth_request(&cluster, candidate, master, 5);

        cluster.maybe_grant_failover_auth(candidate, &req, 1000);
        assert_eq!(cluster.last_vote_epoch, 5);
        let acks = find_sent(&cluster.take_outbox(), MessageType::FailoverAuthAck);
        assert_eq!(acks.len(), 1);

        // a second request in the same epoch is denied
        cluster.maybe_grant_failover_auth(candidate, &req, 1001);
        let acks = find_sent(&cluster.take_outbox(), MessageType::FailoverAuthAck);
        assert!(acks.is_empty());
    }

    #[test]
    fn vote_denied_when_master_alive_without_forceack() {
        let (mut cluster, candidate, master) = voter_fixture();
        cluster
            .nodes
            .get_mut(&master)
            .unwrap()
            .flags
            .remove(NodeFlags::FAIL);
        cluster.current_epoch = 5;
        let req = auth_request(&cluster, candidate, master, 5);
        cluster.maybe_grant_failover_auth(candidate, &req, 1000);
        assert_eq!(cluster.last_vote_epoch, 0);

        // FORCEACK (manual failover) overrides the liveness requirement
        let mut forced = auth_request(&cluster, candidate, master, 5);
        forced.header.mflags |= MFLAG_FORCEACK;
        cluster.maybe_grant_failover_auth(candidate, &forced, 1000);
        assert_eq!(cluster.last_vote_epoch, 5);
    }

    #[test]
    fn vote_denied_for_stale_request_epoch() {
        let (mut cluster, candidate, master) = voter_fixture();
        cluster.current_epoch = 5;
        let req = auth_request(&cluster, candidate, master, 4);
        cluster.maybe_grant_failover_auth(candidate, &req, 1000);
        assert_eq!(cluster.last_vote_epoch, 0);
    }

    #[test]
    fn vote_denied_within_ring_cooldown() {
        let (mut cluster, candidate, master) = voter_fixture();
        cluster.current_epoch = 5;
        cluster.nodes.get_mut(&master).unwrap().voted_time = 1000;
        let req = auth_request(&cluster, candidate, master, 5);
        // node_timeout * 2 = 2000ms cooldown per master ring
        cluster.maybe_grant_failover_auth(candidate, &req, 2500);
        assert_eq!(cluster.last_vote_epoch, 0);

        cluster.maybe_grant_failover_auth(candidate, &req, 3001);
        assert_eq!(cluster.last_vote_epoch, 5);
    }

    #[test]
    fn vote_denied_when_claimed_slot_has_newer_owner() {
        let (mut cluster, candidate, master) = voter_fixture();
        cluster.current_epoch = 5;
        // slot 100 now owned by a third master with a high configEpoch
        let third = add_connected_master(&mut cluster, 3, 0);
        cluster.del_slot(100);
        cluster.add_slot(third, 100).unwrap();
        cluster.nodes.get_mut(&third).unwrap().config_epoch = 9;
        // the candidate still claims its dead master's old slots
        let mut req = auth_request(&cluster, candidate, master, 5);
        let mut claimed = crate::slots::SlotBitmap::new();
        claimed.set(100);
        req.header.slots = claimed;
        req.header.config_epoch = 8;

        cluster.maybe_grant_failover_auth(candidate, &req, 1000);
        assert_eq!(cluster.last_vote_epoch, 0);
    }

    #[test]
    fn slotless_voter_abstains() {
        let (mut cluster, candidate, master) = voter_fixture();
        let me = cluster.myself_id();
        cluster.del_node_slots(me);
        cluster.current_epoch = 5;
        let req = auth_request(&cluster, candidate, master, 5);
        cluster.maybe_grant_failover_auth(candidate, &req, 1000);
        assert_eq!(cluster.last_vote_epoch, 0);
    }
}

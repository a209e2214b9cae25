//! Operator command surface.
//!
//! These are the engine halves of the CLUSTER subcommands: validation and
//! state changes live here, while the host's command layer handles parsing
//! and reply encoding. Failed validations return [`ClusterError`] carrying
//! the exact message for the client and leave state untouched.

use tracing::{info, warn};

use crate::config::MF_TIMEOUT_MS;
use crate::data::DataPlane;
use crate::engine::{Cluster, Todo};
use crate::message::{Message, MessageBody};
use crate::slots::SLOT_COUNT;
use crate::{ClusterError, NodeId};

/// Validates a numeric slot argument from an operator command.
pub fn check_slot_arg(slot: u64) -> Result<u16, ClusterError> {
    if slot >= SLOT_COUNT as u64 {
        return Err(ClusterError::InvalidSlot);
    }
    Ok(slot as u16)
}

/// One CLUSTER SLOTS entry: a slot range with its master and replicas,
/// each as `(host, port, id)`.
#[derive(Debug, Clone)]
pub struct SlotsEntry {
    pub start: u16,
    pub end: u16,
    pub master: (String, u16, NodeId),
    pub replicas: Vec<(String, u16, NodeId)>,
}

impl<D: DataPlane> Cluster<D> {
    fn keyspace_empty(&self) -> bool {
        (0..SLOT_COUNT).all(|slot| self.data().count_keys_in_slot(slot) == 0)
    }

    fn known_node(&self, id: NodeId) -> Result<(), ClusterError> {
        if self.nodes.contains(&id) {
            Ok(())
        } else {
            Err(ClusterError::UnknownNode(id))
        }
    }

    /// MEET: start a handshake with a new peer address.
    pub fn cluster_meet(&mut self, host: &str, port: u16, now: u64) -> Result<(), ClusterError> {
        if host.is_empty() || port == 0 || port > u16::MAX - self.config.bus_port_offset {
            return Err(ClusterError::InvalidAddress(format!("{host}:{port}")));
        }
        // an already-running handshake for this address is success
        self.start_handshake(host, port, now);
        Ok(())
    }

    /// FORGET: drop a node and blacklist its identity for a minute.
    pub fn cluster_forget(&mut self, id: NodeId, now: u64) -> Result<(), ClusterError> {
        self.known_node(id)?;
        if id == self.myself {
            return Err(ClusterError::ForgetMyself);
        }
        if !self.myself_is_master() && self.myself_master() == Some(id) {
            return Err(ClusterError::ForgetMaster);
        }
        self.blacklist.add(id, now);
        self.del_node(id);
        self.todo.insert(Todo::UPDATE_STATE | Todo::SAVE_CONFIG);
        Ok(())
    }

    /// ADDSLOTS: claim unowned slots for this node.
    pub fn cluster_addslots(&mut self, slots: &[u16]) -> Result<(), ClusterError> {
        self.assign_slots(slots, false)
    }

    /// DELSLOTS: unbind owned slots.
    pub fn cluster_delslots(&mut self, slots: &[u16]) -> Result<(), ClusterError> {
        self.assign_slots(slots, true)
    }

    fn assign_slots(&mut self, slots: &[u16], del: bool) -> Result<(), ClusterError> {
        // validate everything before touching anything
        let mut seen = vec![false; SLOT_COUNT as usize];
        for &slot in slots {
            if slot >= SLOT_COUNT {
                return Err(ClusterError::InvalidSlot);
            }
            if del && self.slot_map.owner(slot).is_none() {
                return Err(ClusterError::SlotUnassigned(slot));
            }
            if !del && self.slot_map.owner(slot).is_some() {
                return Err(ClusterError::SlotBusy(slot));
            }
            if seen[slot as usize] {
                return Err(ClusterError::SlotRepeated(slot));
            }
            seen[slot as usize] = true;
        }
        let myself = self.myself;
        for &slot in slots {
            // claiming a slot we were importing settles the import
            if self.slot_map.importing_from(slot).is_some() {
                self.slot_map.set_importing_from(slot, None);
            }
            if del {
                self.del_slot(slot);
            } else {
                self.add_slot(myself, slot)?;
            }
        }
        self.todo.insert(Todo::UPDATE_STATE | Todo::SAVE_CONFIG);
        Ok(())
    }

    /// FLUSHSLOTS: unbind every local slot; only legal on an empty node.
    pub fn cluster_flushslots(&mut self) -> Result<usize, ClusterError> {
        if !self.keyspace_empty() {
            return Err(ClusterError::NotEmpty(
                "DB must be empty to perform CLUSTER FLUSHSLOTS.",
            ));
        }
        let myself = self.myself;
        let deleted = self.del_node_slots(myself);
        self.todo.insert(Todo::UPDATE_STATE | Todo::SAVE_CONFIG);
        Ok(deleted)
    }

    /// SETSLOT <slot> MIGRATING <target>
    pub fn cluster_setslot_migrating(
        &mut self,
        slot: u16,
        target: NodeId,
    ) -> Result<(), ClusterError> {
        if slot >= SLOT_COUNT {
            return Err(ClusterError::InvalidSlot);
        }
        if self.slot_map.owner(slot) != Some(self.myself) {
            return Err(ClusterError::NotSlotOwner(slot));
        }
        self.known_node(target)?;
        self.slot_map.set_migrating_to(slot, Some(target));
        self.todo.insert(Todo::SAVE_CONFIG | Todo::UPDATE_STATE);
        Ok(())
    }

    /// SETSLOT <slot> IMPORTING <source>
    pub fn cluster_setslot_importing(
        &mut self,
        slot: u16,
        source: NodeId,
    ) -> Result<(), ClusterError> {
        if slot >= SLOT_COUNT {
            return Err(ClusterError::InvalidSlot);
        }
        if self.slot_map.owner(slot) == Some(self.myself) {
            return Err(ClusterError::AlreadySlotOwner(slot));
        }
        self.known_node(source)?;
        self.slot_map.set_importing_from(slot, Some(source));
        self.todo.insert(Todo::SAVE_CONFIG | Todo::UPDATE_STATE);
        Ok(())
    }

    /// SETSLOT <slot> STABLE
    pub fn cluster_setslot_stable(&mut self, slot: u16) -> Result<(), ClusterError> {
        if slot >= SLOT_COUNT {
            return Err(ClusterError::InvalidSlot);
        }
        self.slot_map.set_migrating_to(slot, None);
        self.slot_map.set_importing_from(slot, None);
        self.todo.insert(Todo::SAVE_CONFIG | Todo::UPDATE_STATE);
        Ok(())
    }

    /// SETSLOT <slot> NODE <owner>: finishes (or forces) a reshard step.
    pub fn cluster_setslot_node(
        &mut self,
        slot: u16,
        node: NodeId,
        now: u64,
    ) -> Result<(), ClusterError> {
        if slot >= SLOT_COUNT {
            return Err(ClusterError::InvalidSlot);
        }
        self.known_node(node)?;

        let keys_left = self.data().count_keys_in_slot(slot);
        // never hand a slot away while its keys still live here
        if self.slot_map.owner(slot) == Some(self.myself) && node != self.myself && keys_left != 0
        {
            return Err(ClusterError::SlotNotEmpty(slot));
        }
        if keys_left == 0 && self.slot_map.migrating_to(slot).is_some() {
            self.slot_map.set_migrating_to(slot, None);
        }
        // closing an import makes the new ownership ours to advertise:
        // take a fresh configEpoch so the change propagates
        if node == self.myself && self.slot_map.importing_from(slot).is_some() {
            if self.bump_config_epoch_without_consensus(now) {
                warn!(slot, "configEpoch updated after importing slot");
            }
            self.slot_map.set_importing_from(slot, None);
        }
        self.del_slot(slot);
        self.add_slot(node, slot)?;
        self.todo.insert(Todo::SAVE_CONFIG | Todo::UPDATE_STATE);
        Ok(())
    }

    /// REPLICATE: become a replica of `target`.
    pub fn cluster_replicate(&mut self, target: NodeId, now: u64) -> Result<(), ClusterError> {
        self.known_node(target)?;
        if target == self.myself {
            return Err(ClusterError::ReplicateMyself);
        }
        if self.nodes.get(&target).is_some_and(|n| n.is_replica()) {
            return Err(ClusterError::ReplicateReplica);
        }
        // a master may only demote itself when it is empty
        if self.myself_is_master()
            && (self.myself_node().slots.count() != 0 || !self.keyspace_empty())
        {
            return Err(ClusterError::ReplicateNotEmpty);
        }
        self.set_master(target, now);
        self.todo.insert(Todo::UPDATE_STATE | Todo::SAVE_CONFIG);
        Ok(())
    }

    /// FAILOVER [FORCE|TAKEOVER]: manual failover of this replica.
    pub fn cluster_failover(
        &mut self,
        force: bool,
        takeover: bool,
        now: u64,
    ) -> Result<(), ClusterError> {
        let force = force || takeover;
        if self.myself_is_master() {
            return Err(ClusterError::FailoverNotReplica);
        }
        let Some(master_id) = self.myself_master() else {
            return Err(ClusterError::FailoverNoMaster);
        };
        let master_down = self
            .nodes
            .get(&master_id)
            .is_some_and(|m| m.failed() || !m.link.is_connected());
        if !force && master_down {
            return Err(ClusterError::FailoverMasterDown);
        }

        self.reset_manual_failover(now);
        self.manual.end = now + MF_TIMEOUT_MS;

        if takeover {
            // no vote, no offset sync: bump an epoch and take the slots
            warn!("taking over the master (user request)");
            self.bump_config_epoch_without_consensus(now);
            self.failover_replace_your_master(now);
        } else if force {
            // skip the offset handshake, go straight to the election
            warn!("forced failover user request accepted");
            self.manual.can_start = true;
        } else {
            info!("manual failover user request accepted");
            let msg = Message {
                header: self.build_header(),
                body: MessageBody::MfStart,
            };
            self.send_message(master_id, &msg);
        }
        Ok(())
    }

    /// SET-CONFIG-EPOCH: bootstrap-only direct epoch assignment.
    pub fn cluster_set_config_epoch(&mut self, epoch: u64, _now: u64) -> Result<(), ClusterError> {
        if self.nodes.len() > 1 {
            return Err(ClusterError::EpochNotAlone);
        }
        if self.myself_node().config_epoch != 0 {
            return Err(ClusterError::EpochAlreadySet);
        }
        self.myself_node_mut().config_epoch = epoch;
        warn!(config_epoch = epoch, "configEpoch set via SET-CONFIG-EPOCH");
        if self.current_epoch < epoch {
            self.current_epoch = epoch;
        }
        self.todo.insert(Todo::UPDATE_STATE | Todo::SAVE_CONFIG);
        Ok(())
    }

    /// RESET [SOFT|HARD]: forget the whole cluster view.
    pub fn cluster_reset(&mut self, hard: bool, now: u64) -> Result<(), ClusterError> {
        if self.myself_is_master() && !self.keyspace_empty() {
            return Err(ClusterError::NotEmpty(
                "CLUSTER RESET can't be called with master nodes containing keys",
            ));
        }
        // a replica resets into an empty master
        if !self.myself_is_master() {
            let myself = self.myself;
            self.set_node_as_master(myself, now);
            self.data.unset_replication_master();
            self.data.flush_all();
        }
        self.slot_map.close_all();
        self.reset_manual_failover(now);
        for slot in 0..SLOT_COUNT {
            self.del_slot(slot);
        }
        for id in self.nodes.ids() {
            if id != self.myself {
                self.del_node(id);
            }
        }
        if hard {
            self.current_epoch = 0;
            self.last_vote_epoch = 0;
            self.myself_node_mut().config_epoch = 0;
            let old = self.myself;
            let fresh = NodeId::random();
            self.nodes.rename(&old, fresh);
            self.myself = fresh;
            warn!(id = %fresh.short(), "hard reset: new node identity generated");
        }
        self.todo
            .insert(Todo::SAVE_CONFIG | Todo::UPDATE_STATE | Todo::FSYNC_CONFIG);
        Ok(())
    }

    /// SAVECONFIG: force a synchronous snapshot write.
    pub fn cluster_saveconfig(&mut self) -> Result<(), ClusterError> {
        self.save_config(true)
    }

    /// NODES: the node-view rendering, shared with the snapshot format.
    pub fn cluster_nodes(&self) -> String {
        crate::persist::format_nodes(self)
    }

    /// SLAVES <master>: the replicas of a master, one line each.
    pub fn cluster_slaves(&self, master: NodeId) -> Result<Vec<String>, ClusterError> {
        let node = self
            .nodes
            .get(&master)
            .ok_or(ClusterError::UnknownNode(master))?;
        if node.is_replica() {
            return Err(ClusterError::ReplicateReplica);
        }
        Ok(node
            .replicas
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(|n| crate::persist::format_node_line(self, n))
            .collect())
    }

    /// COUNT-FAILURE-REPORTS <node>.
    pub fn count_failure_reports_of(&mut self, id: NodeId, now: u64) -> Result<usize, ClusterError> {
        let node_timeout = self.config.node_timeout_ms;
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or(ClusterError::UnknownNode(id))?;
        Ok(node.fresh_failure_reports(now, node_timeout))
    }

    /// INFO: the cluster_* stat block.
    pub fn cluster_info(&self) -> String {
        let mut assigned = 0usize;
        let mut ok = 0usize;
        let mut pfail = 0usize;
        let mut fail = 0usize;
        for slot in 0..SLOT_COUNT {
            let Some(owner) = self.slot_map.owner(slot) else { continue };
            assigned += 1;
            match self.nodes.get(&owner) {
                Some(n) if n.failed() => fail += 1,
                Some(n) if n.timed_out() => pfail += 1,
                _ => ok += 1,
            }
        }
        let my_epoch = {
            let me = self.myself_node();
            me.replicates
                .and_then(|m| self.nodes.get(&m))
                .map(|m| m.config_epoch)
                .unwrap_or(me.config_epoch)
        };
        format!(
            "cluster_state:{}\r\n\
             cluster_slots_assigned:{}\r\n\
             cluster_slots_ok:{}\r\n\
             cluster_slots_pfail:{}\r\n\
             cluster_slots_fail:{}\r\n\
             cluster_known_nodes:{}\r\n\
             cluster_size:{}\r\n\
             cluster_current_epoch:{}\r\n\
             cluster_my_epoch:{}\r\n\
             cluster_stats_messages_sent:{}\r\n\
             cluster_stats_messages_received:{}\r\n",
            self.state,
            assigned,
            ok,
            pfail,
            fail,
            self.nodes.len(),
            self.size,
            self.current_epoch,
            my_epoch,
            self.stats_messages_sent,
            self.stats_messages_received,
        )
    }

    /// SLOTS: slot ranges with their serving nodes.
    pub fn cluster_slots_entries(&self) -> Vec<SlotsEntry> {
        let mut entries = Vec::new();
        for node in self.nodes.iter() {
            if !node.is_master() || node.slots.is_empty() {
                continue;
            }
            let replicas: Vec<(String, u16, NodeId)> = node
                .replicas
                .iter()
                .filter_map(|id| self.nodes.get(id))
                .filter(|n| !n.failed())
                .map(|n| (n.host.clone(), n.port, n.id))
                .collect();
            for range in node.slots.ranges() {
                entries.push(SlotsEntry {
                    start: range.start,
                    end: range.end,
                    master: (node.host.clone(), node.port, node.id),
                    replicas: replicas.clone(),
                });
            }
        }
        entries.sort_by_key(|e| e.start);
        entries
    }
}

//! The cluster state evaluator: derives the aggregate OK/FAIL state from
//! slot coverage and master reachability, with delays that keep a rebooted
//! or reunited master from serving writes before the cluster can
//! reconfigure it.

use tracing::warn;

use crate::data::DataPlane;
use crate::engine::{Cluster, ClusterHealth, Todo};
use crate::slots::SLOT_COUNT;

/// A master rejoining from a minority partition must hold off this long
/// before reporting OK again.
const MAX_REJOIN_DELAY_MS: u64 = 5000;
const MIN_REJOIN_DELAY_MS: u64 = 500;

/// After boot, a master stays FAIL at least this long so it cannot accept
/// writes before hearing from the rest of the cluster.
const WRITABLE_DELAY_MS: u64 = 2000;

impl<D: DataPlane> Cluster<D> {
    /// Recomputes the aggregate cluster state and the cluster size (the
    /// number of masters serving at least one slot).
    ///
    /// The state is FAIL when full coverage is required but violated, or
    /// when the reachable slot-serving masters fall below the majority of
    /// the cluster size.
    pub(crate) fn update_state(&mut self, now: u64) {
        self.todo.remove(Todo::UPDATE_STATE);

        if self.first_eval_time == 0 {
            // zero is the "never evaluated" sentinel, keep it distinct
            self.first_eval_time = now.max(1);
        }
        // post-boot writable delay for masters
        if self.myself_is_master()
            && self.state == ClusterHealth::Fail
            && now.saturating_sub(self.first_eval_time) < WRITABLE_DELAY_MS
        {
            return;
        }

        let mut new_state = ClusterHealth::Ok;

        if self.config.require_full_coverage {
            for slot in 0..SLOT_COUNT {
                match self.slot_map.owner(slot) {
                    None => {
                        new_state = ClusterHealth::Fail;
                        break;
                    }
                    Some(owner) => {
                        if self.nodes.get(&owner).is_none_or(|n| n.failed()) {
                            new_state = ClusterHealth::Fail;
                            break;
                        }
                    }
                }
            }
        }

        let mut size = 0usize;
        let mut reachable_masters = 0usize;
        for node in self.nodes.iter() {
            if node.is_master() && !node.slots.is_empty() {
                size += 1;
                if !node.flags.is_failing() {
                    reachable_masters += 1;
                }
            }
        }
        self.size = size;

        let needed_quorum = size / 2 + 1;
        if reachable_masters < needed_quorum {
            new_state = ClusterHealth::Fail;
            self.among_minority_time = now;
        }

        if new_state != self.state {
            // returning to OK from a minority stint waits out the rejoin
            // delay so a healed partition can push us a newer config first
            let rejoin_delay = self
                .config
                .node_timeout_ms
                .clamp(MIN_REJOIN_DELAY_MS, MAX_REJOIN_DELAY_MS);
            if new_state == ClusterHealth::Ok
                && self.myself_is_master()
                && now.saturating_sub(self.among_minority_time) < rejoin_delay
            {
                return;
            }
            warn!(state = %new_state, "cluster state changed");
            self.state = new_state;
        }
    }

    /// Post-load agreement check between the keyspace and the slot table:
    /// keys found in a slot we neither own nor import force the slot into
    /// our view (claimed if unowned, importing otherwise). Hosts run this
    /// once after restoring both the keyspace and the node view.
    pub fn verify_config_with_data(&mut self) {
        if !self.myself_is_master() {
            return;
        }
        let mut updated = false;
        for slot in 0..SLOT_COUNT {
            if self.data.count_keys_in_slot(slot) == 0 {
                continue;
            }
            if self.slot_map.owner(slot) == Some(self.myself)
                || self.slot_map.importing_from(slot).is_some()
            {
                continue;
            }
            updated = true;
            match self.slot_map.owner(slot) {
                None => {
                    warn!(slot, "I have keys for an unassigned slot, taking responsibility");
                    let myself = self.myself;
                    let _ = self.add_slot(myself, slot);
                }
                Some(owner) => {
                    warn!(slot, owner = %owner.short(), "I have keys for a slot owned by another node, setting it to importing");
                    self.slot_map.set_importing_from(slot, Some(owner));
                }
            }
        }
        if updated {
            self.todo.insert(Todo::SAVE_CONFIG | Todo::FSYNC_CONFIG);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryDataPlane;
    use crate::node::NodeFlags;
    use crate::test_util::*;
    use crate::Cluster;

    /// Runs update_state twice past the writable delay so the initial
    /// post-boot hold-off does not mask the result under test.
    fn settle(cluster: &mut Cluster<MemoryDataPlane>, now: u64) {
        cluster.update_state(now);
        cluster.update_state(now + WRITABLE_DELAY_MS + 1);
    }

    fn covered_cluster() -> Cluster<MemoryDataPlane> {
        let mut cluster = Cluster::new(test_config(), MemoryDataPlane::new());
        let me = cluster.myself_id();
        for slot in 0..SLOT_COUNT {
            cluster.add_slot(me, slot).unwrap();
        }
        cluster
    }

    #[test]
    fn full_coverage_turns_ok() {
        let mut cluster = covered_cluster();
        settle(&mut cluster, 0);
        assert_eq!(cluster.state(), ClusterHealth::Ok);
        assert_eq!(cluster.size, 1);
    }

    #[test]
    fn missing_slot_is_fail_with_full_coverage() {
        let mut cluster = covered_cluster();
        settle(&mut cluster, 0);
        cluster.del_slot(5000);
        cluster.update_state(10_000);
        assert_eq!(cluster.state(), ClusterHealth::Fail);
    }

    #[test]
    fn missing_slot_tolerated_without_full_coverage() {
        let mut config = test_config();
        config.require_full_coverage = false;
        let mut cluster = Cluster::new(config, MemoryDataPlane::new());
        let me = cluster.myself_id();
        cluster.add_slot(me, 0).unwrap();
        settle(&mut cluster, 0);
        assert_eq!(cluster.state(), ClusterHealth::Ok);
    }

    #[test]
    fn minority_of_reachable_masters_is_fail() {
        let mut config = test_config();
        config.require_full_coverage = false;
        let mut cluster = Cluster::new(config, MemoryDataPlane::new());
        let me = cluster.myself_id();
        let a = add_connected_master(&mut cluster, 1, 0);
        let b = add_connected_master(&mut cluster, 2, 0);
        cluster.add_slot(me, 0).unwrap();
        cluster.add_slot(a, 1).unwrap();
        cluster.add_slot(b, 2).unwrap();
        settle(&mut cluster, 0);
        assert_eq!(cluster.state(), ClusterHealth::Ok);

        // two of three masters unreachable: minority
        cluster.nodes.get_mut(&a).unwrap().flags.insert(NodeFlags::PFAIL);
        cluster.nodes.get_mut(&b).unwrap().flags.insert(NodeFlags::FAIL);
        cluster.update_state(20_000);
        assert_eq!(cluster.state(), ClusterHealth::Fail);
    }

    #[test]
    fn rejoin_delay_holds_ok_back() {
        let mut config = test_config();
        config.require_full_coverage = false;
        let mut cluster = Cluster::new(config, MemoryDataPlane::new());
        let me = cluster.myself_id();
        let a = add_connected_master(&mut cluster, 1, 0);
        cluster.add_slot(me, 0).unwrap();
        cluster.add_slot(a, 1).unwrap();
        settle(&mut cluster, 0);
        assert_eq!(cluster.state(), ClusterHealth::Ok);

        // lose the other master: minority of 2
        cluster.nodes.get_mut(&a).unwrap().flags.insert(NodeFlags::FAIL);
        cluster.update_state(20_000);
        assert_eq!(cluster.state(), ClusterHealth::Fail);

        // it comes back, but OK is withheld within the rejoin delay
        cluster.nodes.get_mut(&a).unwrap().flags.remove(NodeFlags::FAIL);
        cluster.update_state(20_100);
        assert_eq!(cluster.state(), ClusterHealth::Fail);

        // rejoin delay for node_timeout=1000 clamps to 1000
        cluster.update_state(20_000 + 1001);
        assert_eq!(cluster.state(), ClusterHealth::Ok);
    }

    #[test]
    fn writable_delay_after_boot() {
        let mut cluster = covered_cluster();
        cluster.update_state(100);
        // fully covered, but inside the writable delay
        assert_eq!(cluster.state(), ClusterHealth::Fail);
        cluster.update_state(100 + WRITABLE_DELAY_MS + 1);
        assert_eq!(cluster.state(), ClusterHealth::Ok);
    }

    #[test]
    fn keys_in_unowned_slot_are_claimed_on_boot() {
        let mut cluster = Cluster::new(test_config(), MemoryDataPlane::new());
        cluster.data_mut().add_key(bytes::Bytes::from_static(b"foo")); // slot 12182
        cluster.verify_config_with_data();
        assert_eq!(cluster.slot_owner(12182), Some(cluster.myself_id()));
    }

    #[test]
    fn keys_in_foreign_slot_marked_importing() {
        let mut cluster = Cluster::new(test_config(), MemoryDataPlane::new());
        let a = add_connected_master(&mut cluster, 1, 0);
        cluster.add_slot(a, 12182).unwrap();
        cluster.data_mut().add_key(bytes::Bytes::from_static(b"foo"));
        cluster.verify_config_with_data();
        assert_eq!(cluster.slot_owner(12182), Some(a));
        assert_eq!(cluster.importing_from(12182), Some(a));
    }
}

//! Configuration epoch handling.
//!
//! `currentEpoch` is the cluster-wide logical clock; each master's
//! `configEpoch` tags the version of its slot claims. Elections assign
//! epochs with consensus; manual resharding and takeovers assign them
//! unilaterally and rely on the collision resolver to keep every pair of
//! masters on distinct epochs.

use tracing::{info, warn};

use crate::data::DataPlane;
use crate::engine::{Cluster, Todo};
use crate::NodeId;

impl<D: DataPlane> Cluster<D> {
    /// The greatest configEpoch known, or `currentEpoch` if that is larger.
    pub(crate) fn max_epoch(&self) -> u64 {
        self.nodes
            .iter()
            .map(|n| n.config_epoch)
            .max()
            .unwrap_or(0)
            .max(self.current_epoch)
    }

    /// Assigns this node a brand new configEpoch without consensus, unless
    /// it already holds the unique maximum. Used when closing an imported
    /// slot and on manual takeovers; collisions are possible and left to
    /// [`Cluster::handle_config_epoch_collision`] to sort out.
    ///
    /// Returns whether an epoch was assigned.
    pub(crate) fn bump_config_epoch_without_consensus(&mut self, _now: u64) -> bool {
        let max_epoch = self.max_epoch();
        let mine = self.myself_node().config_epoch;
        if mine == 0 || mine != max_epoch {
            self.current_epoch += 1;
            let epoch = self.current_epoch;
            self.myself_node_mut().config_epoch = epoch;
            self.todo.insert(Todo::SAVE_CONFIG | Todo::FSYNC_CONFIG);
            warn!(config_epoch = epoch, "new configEpoch set");
            true
        } else {
            false
        }
    }

    /// Resolves a configEpoch tie with another master.
    ///
    /// Only the side with the lexicographically greater identity yields:
    /// it takes `++currentEpoch` as its new configEpoch and persists
    /// before advertising it. The smallest colliding identity never
    /// moves, so every pair converges in finite rounds regardless of how
    /// many masters collided.
    pub(crate) fn handle_config_epoch_collision(&mut self, sender: NodeId, _now: u64) {
        let mine = self.myself_node().config_epoch;
        let sender_is_master = self.nodes.get(&sender).is_some_and(|n| n.is_master());
        let sender_epoch = self.nodes.get(&sender).map(|n| n.config_epoch);
        if sender_epoch != Some(mine) || !sender_is_master || !self.myself_is_master() {
            return;
        }
        // we only move when we are the greater identity of the pair
        if sender.as_bytes() >= self.myself.as_bytes() {
            return;
        }
        self.current_epoch += 1;
        let epoch = self.current_epoch;
        self.myself_node_mut().config_epoch = epoch;
        if let Err(err) = self.save_config(true) {
            warn!(%err, "failed to persist config after epoch collision");
        }
        info!(
            sender = %sender.short(),
            config_epoch = epoch,
            "configEpoch collision resolved, epoch bumped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryDataPlane;
    use crate::test_util::*;
    use crate::Cluster;

    #[test]
    fn max_epoch_spans_nodes_and_current() {
        let mut cluster = Cluster::new(test_config(), MemoryDataPlane::new());
        let a = add_connected_master(&mut cluster, 1, 0);
        cluster.nodes.get_mut(&a).unwrap().config_epoch = 9;
        assert_eq!(cluster.max_epoch(), 9);
        cluster.current_epoch = 12;
        assert_eq!(cluster.max_epoch(), 12);
    }

    #[test]
    fn bump_assigns_fresh_epoch() {
        let mut cluster = Cluster::new(test_config(), MemoryDataPlane::new());
        assert!(cluster.bump_config_epoch_without_consensus(0));
        assert_eq!(cluster.current_epoch(), 1);
        assert_eq!(cluster.myself_node().config_epoch, 1);

        // already the unique maximum: no-op
        assert!(!cluster.bump_config_epoch_without_consensus(0));
        assert_eq!(cluster.current_epoch(), 1);
    }

    #[test]
    fn bump_when_not_unique_max() {
        let mut cluster = Cluster::new(test_config(), MemoryDataPlane::new());
        let a = add_connected_master(&mut cluster, 1, 0);
        cluster.bump_config_epoch_without_consensus(0);
        cluster.nodes.get_mut(&a).unwrap().config_epoch = 5;
        assert!(cluster.bump_config_epoch_without_consensus(0));
        assert_eq!(cluster.myself_node().config_epoch, 6);
    }

    #[test]
    fn collision_yields_only_for_smaller_id() {
        let mut cluster = Cluster::new(test_config(), MemoryDataPlane::new());
        let peer = add_connected_master(&mut cluster, 1, 0);
        // both at epoch 3
        cluster.myself_node_mut().config_epoch = 3;
        cluster.current_epoch = 3;
        cluster.nodes.get_mut(&peer).unwrap().config_epoch = 3;

        cluster.handle_config_epoch_collision(peer, 0);
        let moved = cluster.myself_node().config_epoch == 4;
        let expected_to_move = peer.as_bytes() < cluster.myself_id().as_bytes();
        assert_eq!(moved, expected_to_move, "only the greater id yields");
        if moved {
            assert_eq!(cluster.current_epoch(), 4);
        }
    }

    #[test]
    fn collision_requires_equal_epochs_and_master_roles() {
        let mut cluster = Cluster::new(test_config(), MemoryDataPlane::new());
        let peer = add_connected_master(&mut cluster, 1, 0);
        cluster.myself_node_mut().config_epoch = 3;
        cluster.nodes.get_mut(&peer).unwrap().config_epoch = 4;
        cluster.handle_config_epoch_collision(peer, 0);
        assert_eq!(cluster.myself_node().config_epoch, 3, "no tie, no move");
    }
}

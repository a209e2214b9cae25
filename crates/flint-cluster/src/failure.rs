//! Failure detection: promoting local suspicion (PFAIL) to cluster-wide
//! FAIL by weak quorum over gossip failure reports, and undoing FAIL once a
//! node proves reachable again.

use tracing::info;

use crate::config::FAIL_UNDO_TIME_MULT;
use crate::data::DataPlane;
use crate::engine::{Cluster, Todo};
use crate::node::NodeFlags;
use crate::NodeId;

impl<D: DataPlane> Cluster<D> {
    /// Promotes `id` from PFAIL to FAIL when enough masters agree.
    ///
    /// The quorum is a majority of the cluster size (masters serving at
    /// least one slot): reports from distinct master peers, still fresh,
    /// plus this node's own vote when it is itself a master. On promotion a
    /// FAIL message is broadcast so the rest of the cluster can skip its
    /// own detection.
    pub(crate) fn mark_failing_if_needed(&mut self, id: NodeId, now: u64) {
        let needed_quorum = self.size / 2 + 1;
        let node_timeout = self.config.node_timeout_ms;
        let myself_is_master = self.myself_is_master();

        let Some(node) = self.nodes.get_mut(&id) else { return };
        if !node.timed_out() || node.failed() {
            return;
        }

        let mut failures = node.fresh_failure_reports(now, node_timeout);
        if myself_is_master {
            failures += 1;
        }
        if failures < needed_quorum {
            return;
        }

        info!(node = %id.short(), failures, "marking node as failing (quorum reached)");
        node.flags.remove(NodeFlags::PFAIL);
        node.flags.insert(NodeFlags::FAIL);
        node.fail_time = now;

        if myself_is_master {
            self.send_fail(id);
        }
        self.todo.insert(Todo::UPDATE_STATE | Todo::SAVE_CONFIG);
    }

    /// Clears FAIL from a node we can reach again, when it is safe:
    /// replicas and slotless masters immediately, slot-serving masters only
    /// after the FAIL has held long enough that evidently nobody took over
    /// their slots.
    pub(crate) fn clear_failure_if_needed(&mut self, id: NodeId, now: u64) {
        let node_timeout = self.config.node_timeout_ms;
        let Some(node) = self.nodes.get_mut(&id) else { return };
        debug_assert!(node.failed());

        if node.is_replica() || node.slots.is_empty() {
            info!(
                node = %id.short(),
                kind = if node.is_replica() { "replica" } else { "master without slots" },
                "clear FAIL state: node is reachable again"
            );
            node.flags.remove(NodeFlags::FAIL);
            self.todo.insert(Todo::UPDATE_STATE | Todo::SAVE_CONFIG);
            return;
        }

        if node.is_master()
            && !node.slots.is_empty()
            && now.saturating_sub(node.fail_time) > node_timeout * FAIL_UNDO_TIME_MULT
        {
            info!(
                node = %id.short(),
                "clear FAIL state: reachable again and nobody took over its slots"
            );
            node.flags.remove(NodeFlags::FAIL);
            self.todo.insert(Todo::UPDATE_STATE | Todo::SAVE_CONFIG);
        }
    }
}

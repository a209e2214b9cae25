//! Replica migration: rebalancing replicas toward orphaned masters.
//!
//! A master is orphaned when it serves slots, has no working replicas, but
//! had at least one replica historically (so masters deliberately deployed
//! bare are left alone). Among the replicas of the best-covered masters,
//! the one with the smallest identity moves, which keeps concurrent
//! migrations rare without any coordination.

use tracing::info;

use crate::data::DataPlane;
use crate::engine::{Cluster, ClusterHealth};
use crate::NodeId;

impl<D: DataPlane> Cluster<D> {
    /// Considers migrating this replica to an orphaned master. Called from
    /// the tick with the precomputed maximum of working replicas per
    /// master, only when orphans were seen and our ring is among the
    /// best-covered.
    pub(crate) fn handle_replica_migration(&mut self, max_replicas: usize, now: u64) {
        if self.state != ClusterHealth::Ok {
            return;
        }
        let Some(my_master) = self.myself_master() else {
            return;
        };

        // never leave the current master below the migration barrier;
        // locally suspected replicas don't count as cover
        let ok_replicas = self
            .nodes
            .get(&my_master)
            .map(|m| {
                m.replicas
                    .iter()
                    .filter_map(|id| self.nodes.get(id))
                    .filter(|n| !n.failed() && !n.timed_out())
                    .count()
            })
            .unwrap_or(0);
        if ok_replicas <= self.config.migration_barrier {
            return;
        }

        // pick the first orphan as target, and across all best-covered
        // rings find the smallest replica identity
        let mut target: Option<NodeId> = None;
        let mut candidate = self.myself;
        for id in self.nodes.ids() {
            let Some(node) = self.nodes.get(&id) else { continue };
            if !node.is_master() || node.failed() {
                continue;
            }
            // a master that never had replicas is not an orphan
            if node.replicas.is_empty() {
                continue;
            }
            let ok = self.count_ok_replicas(node);
            if ok == 0 && target.is_none() && node.slots.count() > 0 {
                target = Some(id);
            }
            if ok == max_replicas {
                for replica in &node.replicas {
                    if replica.as_bytes() < candidate.as_bytes() {
                        candidate = *replica;
                    }
                }
            }
        }

        if let Some(target) = target {
            if candidate == self.myself {
                info!(target = %target.short(), "migrating to orphaned master");
                self.set_master(target, now);
            }
        }
    }
}

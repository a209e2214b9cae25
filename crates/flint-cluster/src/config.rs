//! Cluster engine configuration.

use serde::{Deserialize, Serialize};

/// Default offset between the client port and the cluster bus port.
pub const DEFAULT_BUS_PORT_OFFSET: u16 = 10000;

/// Tunables for the cluster engine.
///
/// Durations are milliseconds. The defaults mirror a conservative production
/// setup; tests shrink `node_timeout_ms` aggressively to make failure
/// detection and elections run in a few simulated seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Time without contact after which a peer is locally suspected (PFAIL),
    /// and the base unit for most other protocol timeouts.
    pub node_timeout_ms: u64,

    /// Minimum number of working replicas a master must retain for one of
    /// its replicas to migrate away to an orphaned master.
    pub migration_barrier: usize,

    /// When set, any unowned (or FAIL-owned) slot turns the whole cluster
    /// state to FAIL and clients get CLUSTERDOWN.
    pub require_full_coverage: bool,

    /// Multiplied by `node_timeout_ms` to bound how stale a replica's data
    /// may be before it refuses to start an election. Zero disables the
    /// check.
    pub replica_validity_factor: u64,

    /// How often the replication layer pings its master, used in the data
    /// freshness bound together with the validity factor.
    pub repl_ping_replica_period_ms: u64,

    /// Added to the client port to form the bus port. Fixed at 10000 in
    /// production; configurable so tests using high ephemeral ports stay
    /// inside u16.
    pub bus_port_offset: u16,

    /// Host advertised to peers in MEET handshakes and persisted snapshots.
    pub announce_host: String,

    /// Client port advertised in bus headers; peers derive the bus port by
    /// adding the offset.
    pub announce_port: u16,

    /// fsync the node-view file on epoch-critical saves.
    pub fsync: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: 15_000,
            migration_barrier: 1,
            require_full_coverage: true,
            replica_validity_factor: 10,
            repl_ping_replica_period_ms: 10_000,
            bus_port_offset: DEFAULT_BUS_PORT_OFFSET,
            announce_host: "127.0.0.1".to_string(),
            announce_port: 6379,
            fsync: true,
        }
    }
}

impl ClusterConfig {
    /// Handshake entries without a completed exchange are dropped after
    /// this long. Clamped below so a tiny node timeout can't reap
    /// handshakes before the first round trip.
    pub(crate) fn handshake_timeout_ms(&self) -> u64 {
        self.node_timeout_ms.max(1000)
    }

    /// Election attempt window: `max(2 * node_timeout, 2000)`.
    pub(crate) fn auth_timeout_ms(&self) -> u64 {
        (self.node_timeout_ms * 2).max(2000)
    }

    /// Wait between failed election attempts: twice the attempt window.
    pub(crate) fn auth_retry_ms(&self) -> u64 {
        self.auth_timeout_ms() * 2
    }
}

/// How long a failure report from another master stays fresh, in units of
/// the node timeout.
pub(crate) const FAIL_REPORT_VALIDITY_MULT: u64 = 2;

/// How long a slot-serving master keeps its FAIL flag with nobody claiming
/// its slots before the flag is dropped, in units of the node timeout.
pub(crate) const FAIL_UNDO_TIME_MULT: u64 = 2;

/// Window for a manual failover to complete before its state is cleared.
pub(crate) const MF_TIMEOUT_MS: u64 = 5000;

/// Forgotten node ids stay blacklisted this long.
pub(crate) const BLACKLIST_TTL_MS: u64 = 60_000;

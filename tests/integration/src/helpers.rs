//! In-process cluster harness.
//!
//! Runs several engines against a loopback bus with a scripted clock:
//! every outbound action is delivered synchronously to the addressed
//! engine, replies flow back over the originating link, and `step()`
//! advances time in tick-sized increments. Killed nodes drop everything,
//! which makes failure detection and elections reproducible to the
//! millisecond.

use std::collections::HashSet;
use std::path::PathBuf;

use flint_cluster::{Cluster, ClusterConfig, LinkId, MemoryDataPlane, NodeId, Outbound};

/// Engine tick period mirrored by the harness clock.
pub const TICK_MS: u64 = 100;

/// One simulated node: its engine plus the harness bookkeeping.
struct TestNode {
    engine: Option<Cluster<MemoryDataPlane>>,
    host: String,
    config_path: Option<PathBuf>,
}

/// A simulated cluster of in-process engines.
pub struct TestCluster {
    nodes: Vec<TestNode>,
    killed: HashSet<usize>,
    pub now: u64,
}

/// The per-test engine config: a short node timeout so detection and
/// elections resolve within a few simulated seconds, no coverage
/// requirement so partial slot layouts stay serviceable.
pub fn test_config(host: &str) -> ClusterConfig {
    ClusterConfig {
        node_timeout_ms: 1000,
        require_full_coverage: false,
        announce_host: host.to_string(),
        announce_port: 6379,
        fsync: false,
        ..ClusterConfig::default()
    }
}

impl TestCluster {
    /// Builds `n` fresh engines at `10.0.0.1..n`, all unaware of each
    /// other until `meet` is called.
    pub fn new(n: usize) -> Self {
        let mut nodes = Vec::new();
        for i in 0..n {
            let host = format!("10.0.0.{}", i + 1);
            let engine = Cluster::new(test_config(&host), MemoryDataPlane::new());
            nodes.push(TestNode {
                engine: Some(engine),
                host,
                config_path: None,
            });
        }
        Self {
            nodes,
            killed: HashSet::new(),
            now: 1000,
        }
    }

    /// Like [`TestCluster::new`] but every engine persists to its own
    /// nodes file under `dir`, so nodes can be restarted.
    pub fn new_persistent(n: usize, dir: &std::path::Path) -> Self {
        let mut cluster = Self::new(0);
        for i in 0..n {
            let host = format!("10.0.0.{}", i + 1);
            let path = dir.join(format!("nodes-{}.conf", i + 1));
            let engine = Cluster::open(
                test_config(&host),
                MemoryDataPlane::new(),
                path.clone(),
                cluster.now,
            )
            .expect("open nodes file");
            cluster.nodes.push(TestNode {
                engine: Some(engine),
                host,
                config_path: Some(path),
            });
        }
        cluster
    }

    pub fn engine(&mut self, i: usize) -> &mut Cluster<MemoryDataPlane> {
        self.nodes[i].engine.as_mut().expect("node is running")
    }

    pub fn engine_ref(&self, i: usize) -> &Cluster<MemoryDataPlane> {
        self.nodes[i].engine.as_ref().expect("node is running")
    }

    pub fn id(&self, i: usize) -> NodeId {
        self.engine_ref(i).myself_id()
    }

    pub fn host(&self, i: usize) -> String {
        self.nodes[i].host.clone()
    }

    /// Operator MEET from node `i` toward node `j`.
    pub fn meet(&mut self, i: usize, j: usize) {
        let host = self.nodes[j].host.clone();
        let now = self.now;
        self.engine(i)
            .cluster_meet(&host, 6379, now)
            .expect("meet accepted");
    }

    /// Drops a node: it stops answering, its dials fail, its state is gone.
    pub fn kill(&mut self, i: usize) {
        self.killed.insert(i);
        self.nodes[i].engine = None;
    }

    /// Restarts a persistent node from its nodes file.
    pub fn restart(&mut self, i: usize) {
        let path = self.nodes[i]
            .config_path
            .clone()
            .expect("restart needs a persistent node");
        let host = self.nodes[i].host.clone();
        self.nodes[i].engine = None; // release the file lock first
        let engine = Cluster::open(
            test_config(&host),
            MemoryDataPlane::new(),
            path,
            self.now,
        )
        .expect("reopen nodes file");
        self.nodes[i].engine = Some(engine);
        self.killed.remove(&i);
    }

    fn index_of_host(&self, host: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.host == host)
    }

    /// Advances the clock one tick, runs every live engine's tick and
    /// before-sleep, and delivers all traffic until the bus is quiet.
    pub fn step(&mut self) {
        self.now += TICK_MS;
        let now = self.now;
        for i in 0..self.nodes.len() {
            if self.killed.contains(&i) {
                continue;
            }
            self.engine(i).tick(now);
        }
        self.pump();
        for i in 0..self.nodes.len() {
            if self.killed.contains(&i) {
                continue;
            }
            self.engine(i).before_sleep(now).expect("before_sleep");
            let _ = self.engine(i).take_events();
        }
        self.pump();
    }

    /// Runs the cluster for `ms` simulated milliseconds.
    pub fn run_for(&mut self, ms: u64) {
        for _ in 0..ms.div_ceil(TICK_MS) {
            self.step();
        }
    }

    /// Delivers queued outbound actions until every outbox is empty.
    pub fn pump(&mut self) {
        for _ in 0..1000 {
            let mut quiet = true;
            for i in 0..self.nodes.len() {
                if self.killed.contains(&i) || self.nodes[i].engine.is_none() {
                    continue;
                }
                let actions = self.engine(i).take_outbox();
                if !actions.is_empty() {
                    quiet = false;
                }
                for action in actions {
                    self.deliver(i, action);
                }
            }
            if quiet {
                return;
            }
        }
        panic!("bus never went quiet; a message loop is likely");
    }

    fn deliver(&mut self, from: usize, action: Outbound) {
        let now = self.now;
        match action {
            Outbound::Connect {
                node,
                host,
                bus_port,
            } => {
                let target = self.index_of_host(&host).filter(|t| {
                    !self.killed.contains(t)
                        && bus_port == 6379 + self.engine_ref(*t).config().bus_port_offset
                });
                match target {
                    Some(_) => self.engine(from).link_established(node, now),
                    None => self.engine(from).connect_failed(node, now),
                }
            }
            Outbound::Send { node, bytes } => {
                let host = self
                    .engine_ref(from)
                    .node(&node)
                    .map(|n| n.host.clone())
                    .unwrap_or_default();
                let Some(target) = self.index_of_host(&host) else {
                    return;
                };
                if self.killed.contains(&target) {
                    return;
                }
                let from_host = self.nodes[from].host.clone();
                // traffic on `from`'s outbound link lands on an accepted
                // connection at the target
                let outcome = self.engine(target).handle_packet(
                    LinkId::Accepted {
                        peer_host: from_host,
                    },
                    &bytes,
                    now,
                );
                // replies come back over the same link
                for reply in outcome.replies {
                    let back = self
                        .engine(from)
                        .handle_packet(LinkId::Peer(node), &reply, now);
                    if back.close_link {
                        self.engine(from).link_closed(node);
                    }
                }
            }
            Outbound::Disconnect { .. } => {
                // the engine already downgraded its own link state
            }
        }
    }

    /// True when node `i` knows a peer with exactly the identity `id`.
    pub fn knows(&self, i: usize, id: NodeId) -> bool {
        self.engine_ref(i).node(&id).is_some()
    }
}

//! Server configuration: CLI options and their conversion into the
//! engine's [`ClusterConfig`].

use std::path::PathBuf;

use clap::Parser;
use flint_cluster::{ClusterConfig, DEFAULT_BUS_PORT_OFFSET};

/// Command-line options for a flint node.
#[derive(Debug, Parser)]
#[command(name = "flint-server", about = "flint cluster coordination node")]
pub struct Args {
    /// Host to bind and to advertise to peers.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Client port; the cluster bus listens on this plus the bus offset.
    #[arg(long, default_value_t = 6379)]
    pub port: u16,

    /// Path of the node-view file. Defaults to `nodes-<port>.conf` in the
    /// working directory.
    #[arg(long)]
    pub cluster_config_file: Option<PathBuf>,

    /// Node timeout in milliseconds: the base unit for failure detection
    /// and election timing.
    #[arg(long, default_value_t = 15_000)]
    pub node_timeout_ms: u64,

    /// Offset added to the client port to form the bus port.
    #[arg(long, default_value_t = DEFAULT_BUS_PORT_OFFSET)]
    pub bus_port_offset: u16,

    /// Replicas a master must keep before one may migrate away.
    #[arg(long, default_value_t = 1)]
    pub migration_barrier: usize,

    /// Serve requests even when some slots have no owner.
    #[arg(long)]
    pub no_full_coverage: bool,

    /// Replica staleness bound multiplier for elections (0 disables).
    #[arg(long, default_value_t = 10)]
    pub replica_validity_factor: u64,

    /// Skip fsync on node-view writes (tests and benchmarks only).
    #[arg(long)]
    pub no_fsync: bool,

    /// Claim all 16384 slots at first start (single-node bootstrap).
    #[arg(long)]
    pub bootstrap: bool,
}

impl Args {
    /// The node-view path, defaulting to a per-port file name so several
    /// nodes can share a working directory.
    pub fn config_file(&self) -> PathBuf {
        self.cluster_config_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("nodes-{}.conf", self.port)))
    }

    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            node_timeout_ms: self.node_timeout_ms,
            migration_barrier: self.migration_barrier,
            require_full_coverage: !self.no_full_coverage,
            replica_validity_factor: self.replica_validity_factor,
            bus_port_offset: self.bus_port_offset,
            announce_host: self.host.clone(),
            announce_port: self.port,
            fsync: !self.no_fsync,
            ..ClusterConfig::default()
        }
    }
}

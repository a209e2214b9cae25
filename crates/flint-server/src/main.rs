mod bus;
mod client;
mod commands;
mod config;
mod resp;
mod time;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use flint_cluster::{Cluster, MemoryDataPlane, SLOT_COUNT};
use tokio::sync::Mutex;
use tracing::info;

use crate::bus::Bus;
use crate::config::Args;
use crate::time::now_ms;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flint=info".into()),
        )
        .init();

    let args = Args::parse();
    let config_file = args.config_file();
    let cluster_config = args.cluster_config();
    let bus_port = args
        .port
        .checked_add(cluster_config.bus_port_offset)
        .context("client port too high: the bus port would overflow")?;

    let now = now_ms();
    let mut engine = Cluster::open(
        cluster_config,
        MemoryDataPlane::new(),
        config_file,
        now,
    )?;

    if args.bootstrap
        && engine.known_nodes() == 1
        && engine.nodes_iter().all(|n| n.slots.is_empty())
    {
        info!("bootstrap: claiming all {SLOT_COUNT} slots");
        let slots: Vec<u16> = (0..SLOT_COUNT).collect();
        engine
            .cluster_addslots(&slots)
            .map_err(|e| anyhow::anyhow!("bootstrap failed: {e}"))?;
    }
    engine.verify_config_with_data();
    engine.save_config(true)?;
    info!(id = %engine.myself_id(), "node ready");

    let bus = Bus::new(Arc::new(Mutex::new(engine)));

    let bus_listener = bus::bind_bus(&args.host, bus_port)
        .await
        .context("failed to bind the cluster bus port")?;
    let client_listener = client::bind(&args.host, args.port)
        .await
        .context("failed to bind the client port")?;

    let bus_task = bus.clone().run(bus_listener);
    let client_task = client::run(bus.clone(), client_listener);

    tokio::select! {
        err = bus_task => Err(err).context("cluster bus failed"),
        err = client_task => Err(err).context("client listener failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

//! Lodestone Coordinator Binary
//!
//! Runs the index and query coordinators in one process against the
//! configured metadata store and object store. With active/standby enabled
//! the process parks until it wins the election, then promotes and serves.

use lodestone::cluster::{
    Election, LocalDataCoord, LocalIndexWorkerFactory, LocalQueryWorkerFactory, Role,
    ROLE_COORDINATOR,
};
use lodestone::config::{ComponentFactory, CoordinatorConfig};
use lodestone::indexcoord::IndexCoordinator;
use lodestone::querycoord::QueryCoordinator;
use lodestone::telemetry::Telemetry;

use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Lodestone Coordinator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Coordinator node id (session identity)
    #[arg(long, env = "LODESTONE_NODE_ID", default_value = "1")]
    node_id: i64,

    /// Enable active/standby election
    #[arg(long, env = "LODESTONE_ACTIVE_STANDBY", default_value = "false")]
    active_standby: bool,

    /// Collection load timeout in seconds
    #[arg(long, env = "LODESTONE_LOAD_TIMEOUT_SECS", default_value = "600")]
    load_timeout_secs: u64,

    /// Garbage collection interval in seconds
    #[arg(long, env = "LODESTONE_GC_INTERVAL_SECS", default_value = "30")]
    gc_interval_secs: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _telemetry = Telemetry::init_for_component("lodestone-coordinator", &args.log_level)?;

    info!("Starting Lodestone Coordinator");

    let mut config = CoordinatorConfig::from_env()?;
    config.node_id = args.node_id;
    config.enable_active_standby = args.active_standby;
    config.query.load_timeout = std::time::Duration::from_secs(args.load_timeout_secs);
    config.index.gc_interval = std::time::Duration::from_secs(args.gc_interval_secs);

    let kv = ComponentFactory::create_meta_kv().await?;
    let object_store = ComponentFactory::create_object_store().await?;

    // collaborators; a deployment embeds transport-backed implementations
    let data_coord = Arc::new(LocalDataCoord::new());
    let index_workers = Arc::new(LocalIndexWorkerFactory::new());
    let query_workers = Arc::new(LocalQueryWorkerFactory::new());

    let root = CancellationToken::new();

    if config.enable_active_standby {
        let election = Election::new(kv.clone(), ROLE_COORDINATOR, config.node_id);
        info!(node_id = config.node_id, "campaigning for leadership");
        match election.wait_active(&root).await? {
            Role::Active => info!(node_id = config.node_id, "promoted to active"),
            Role::Standby => unreachable!("wait_active only returns active"),
        }
    }

    let index_coord = IndexCoordinator::new(
        config.clone(),
        kv.clone(),
        object_store,
        data_coord.clone(),
        index_workers,
    )
    .await?;
    index_coord.start().await?;

    let query_coord =
        QueryCoordinator::new(config, kv, data_coord, query_workers).await?;
    query_coord.start().await?;

    info!("Coordinator ready");

    let revoked = index_coord.shutdown_signal();
    let mut session_lost = false;
    tokio::select! {
        _ = signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = revoked.cancelled() => {
            info!("session revoked, shutting down");
            session_lost = true;
        }
    }

    query_coord.stop().await;
    index_coord.stop().await;

    if session_lost {
        // revoked session: exit non-zero so the supervisor restarts us
        std::process::exit(1);
    }
    Ok(())
}

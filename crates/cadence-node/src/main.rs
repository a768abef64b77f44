use std::sync::Arc;

use cadence_cluster::{
    ChannelSignaler, ClusterManager, ClusterScanner, JobStore, MisfireHandler, MisfireScanner,
    SchedulerSignal, SchedulerSignaler,
};
use cadence_core::CadenceConfig;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run one cadence scheduler instance against a shared store.
#[derive(Debug, Parser)]
#[command(name = "cadence-node", version)]
struct Args {
    /// Config file. Falls back to $CADENCE_CONFIG, then ~/.cadence/cadence.toml.
    #[arg(long)]
    config: Option<String>,

    /// Override `store.instance_id`.
    #[arg(long)]
    instance_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_node=info,cadence_cluster=info".into()),
        )
        .init();

    let args = Args::parse();
    let config_path = args.config.or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let mut config = CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });
    if let Some(id) = args.instance_id {
        config.store.instance_id = id;
    }

    ensure_parent_dir(&config.store.path);
    info!(path = %config.store.path, "opening store");

    let (signaler, signals) = ChannelSignaler::channel(256);
    let signaler: Arc<dyn SchedulerSignaler> = Arc::new(signaler);
    tokio::spawn(log_signals(signals));

    let checkin_interval = config.cluster.checkin_interval();
    let misfire_threshold = config.misfire.threshold();
    let retry_interval = config.store.db_retry_interval();
    let failure_log_every = config.cluster.failure_log_every;

    let store = Arc::new(JobStore::open(config, Arc::clone(&signaler))?);
    let shutdown = CancellationToken::new();

    let cluster = if store.is_clustered() {
        let manager = ClusterManager::new(
            Arc::clone(&store) as Arc<dyn ClusterScanner>,
            Arc::clone(&signaler),
            checkin_interval,
            retry_interval,
            failure_log_every,
        );
        Some(manager.start(&shutdown).await)
    } else {
        let recovering = Arc::clone(&store);
        tokio::task::spawn_blocking(move || recovering.scheduler_started()).await??;
        None
    };

    let misfires = MisfireHandler::new(
        Arc::clone(&store) as Arc<dyn MisfireScanner>,
        Arc::clone(&signaler),
        misfire_threshold,
        retry_interval,
        failure_log_every,
    )
    .start(&shutdown);

    info!(
        instance_id = %store.instance_id(),
        clustered = store.is_clustered(),
        "cadence node running; Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    store.shutdown();
    shutdown.cancel();
    misfires.shutdown().await;
    if let Some(cluster) = cluster {
        cluster.shutdown().await;
    }
    info!("cadence node stopped");
    Ok(())
}

async fn log_signals(mut signals: tokio::sync::mpsc::Receiver<SchedulerSignal>) {
    while let Some(signal) = signals.recv().await {
        match signal {
            SchedulerSignal::SchedulingChange(Some(at)) => {
                info!(earliest = %at, "scheduling changed")
            }
            SchedulerSignal::SchedulingChange(None) => info!("scheduling changed"),
            SchedulerSignal::TriggerMisfired(key) => warn!(trigger = %key, "trigger misfired"),
            SchedulerSignal::TriggerFinalized(key) => debug!(trigger = %key, "trigger finalized"),
        }
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

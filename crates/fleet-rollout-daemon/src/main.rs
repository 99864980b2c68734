//! Demo tick-loop binary: wires both reconcilers over the in-memory reference
//! store and runs one tick task per configured organization, exactly as §5
//! describes ("one orchestrating task per reconciler per organization"), merged
//! here into one task per organization running both reconcilers in sequence.
//!
//! Grounded on `service::daemon::ServiceDaemon`'s task-per-concern shape, adapted
//! from its `broadcast::Sender<()>` shutdown signal to a `CancellationToken` since
//! cancellation here is per-reconciliation rather than whole-process shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleet_rollout_core::{
    DeviceSelectionReconciler, DisruptionBudgetReconciler, EngineConfig, EventDispatcher, RolloutEvent,
    mem::InMemoryStore,
};
use fleet_rollout_errors::StoreResult;

#[derive(Debug, Parser)]
#[command(about = "Runs the fleet rollout reconcilers over an in-memory demo store")]
struct Cli {
    /// Organization IDs to reconcile. Repeat the flag for more than one.
    #[arg(long = "org", required = true)]
    orgs: Vec<String>,

    /// Path to the engine config file. Defaults to the platform config directory.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Logs every emitted lifecycle event instead of forwarding it anywhere; a real
/// deployment would dispatch to its worker/event queue.
struct LoggingDispatcher;

#[async_trait]
impl EventDispatcher for LoggingDispatcher {
    async fn emit(&self, event: RolloutEvent) -> StoreResult<()> {
        info!(
            org_id = %event.org_id,
            fleet_name = %event.fleet_name,
            device_name = ?event.device_name,
            kind = ?event.kind,
            "rollout event"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => EngineConfig::default_path()?,
    };
    let config = EngineConfig::load(&config_path).await?;

    let store = Arc::new(InMemoryStore::new());
    let dispatcher: Arc<dyn EventDispatcher> = Arc::new(LoggingDispatcher);

    let cancellation = CancellationToken::new();
    let shutdown = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let device_reconciler = Arc::new(DeviceSelectionReconciler::new(
        store.clone(),
        store.clone(),
        Arc::clone(&dispatcher),
        config.clone(),
    ));
    let disruption_reconciler = Arc::new(DisruptionBudgetReconciler::new(
        store.clone(),
        store.clone(),
        Arc::clone(&dispatcher),
    ));

    let mut tasks = Vec::new();
    for org_id in cli.orgs {
        let device_reconciler = Arc::clone(&device_reconciler);
        let disruption_reconciler = Arc::clone(&disruption_reconciler);
        let cancel = cancellation.clone();
        let tick_interval = config.tick_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(org_id = %org_id, "stopping reconciliation task");
                        break;
                    }
                    _ = ticker.tick() => {
                        device_reconciler.reconcile_organization(&org_id).await;
                        disruption_reconciler.reconcile_organization(&org_id).await;
                    }
                }
            }
        }));
    }

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "reconciliation task panicked");
        }
    }
    Ok(())
}

//! The long-running daemon.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use hangar_provider::HostClient;
use hangar_scheduler::{AllocationPolicy, ControlLoop, JobScheduler, StatusNotifier};
use tokio::sync::{mpsc, watch};
use tracing::info;

use super::{Stores, build_pools, load_config, load_provider_tokens};

const EVENT_BUFFER: usize = 1024;

pub async fn run(config_path: &Path, database_url: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let stores = Stores::connect(database_url).await?;
    load_provider_tokens(&config, stores.credentials.as_ref()).await;

    let pools = build_pools(&config, stores.credentials.clone())?;
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

    let scheduler = JobScheduler::new(
        stores.jobs.clone(),
        stores.builds.clone(),
        pools.clone(),
        config.scheduler.claim_batch,
    )
    .with_events(events_tx);
    let policy = AllocationPolicy::new(pools, config.scheduler.scale_down_window);
    let control = ControlLoop::new(Arc::new(scheduler), Arc::new(policy), &config.scheduler);

    let host = Arc::new(HostClient::new(config.hosts.clone(), stores.credentials.clone()));
    let notifier = StatusNotifier::new(
        stores.projects.clone(),
        stores.builds.clone(),
        host,
        config.hosts.public_url.as_str(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let notifier_task = tokio::spawn(async move { notifier.run(events_rx).await });
    let control_task = tokio::spawn(async move { control.run(shutdown_rx).await });

    info!(pools = config.pools.len(), "hangar started");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    // The scheduler owns the event sender, so the notifier drains and exits
    // once the control loop is gone.
    control_task.await?;
    notifier_task.await?;
    info!("hangar stopped");
    Ok(())
}

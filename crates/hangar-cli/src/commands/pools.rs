//! Pool inspection and power control.

use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use hangar_core::UnitId;
use hangar_core::capacity::PowerAction;
use hangar_scheduler::{AllocationPolicy, JobScheduler};

use super::{Stores, build_pools, load_config, load_provider_tokens};

#[derive(Clone, Copy, ValueEnum)]
pub enum PowerArg {
    On,
    Off,
    Restart,
}

impl From<PowerArg> for PowerAction {
    fn from(arg: PowerArg) -> Self {
        match arg {
            PowerArg::On => PowerAction::PowerOn,
            PowerArg::Off => PowerAction::PowerOff,
            PowerArg::Restart => PowerAction::Restart,
        }
    }
}

pub async fn list(config_path: &Path, database_url: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let stores = Stores::connect(database_url).await?;
    load_provider_tokens(&config, stores.credentials.as_ref()).await;

    let pools = build_pools(&config, stores.credentials.clone())?;
    let policy = AllocationPolicy::new(pools.clone(), config.scheduler.scale_down_window);
    for (pool, result) in policy.refresh_all().await {
        if let Err(e) = result {
            println!("{}: refresh failed: {}", pool, e);
        }
    }
    // Slot usage comes from the jobs recorded as active.
    JobScheduler::new(stores.jobs.clone(), stores.builds.clone(), pools, 1)
        .recover()
        .await?;

    for pool in policy.pools() {
        let totals = pool.totals();
        println!(
            "{} ({}): {} unit(s), {}/{} slots free, {} in use",
            pool.name(),
            pool.class().instance_class,
            pool.units().len(),
            totals.available,
            totals.total,
            totals.in_use
        );
        for unit in pool.units() {
            let counts = unit.counts();
            println!(
                "  {}  created {}  {}/{} free{}",
                unit.id,
                unit.created_at.format("%Y-%m-%dT%H:%M:%SZ"),
                counts.available,
                counts.total,
                if unit.is_draining() { "  draining" } else { "" }
            );
        }
    }
    let totals = policy.totals();
    println!("Total: {}/{} slots free", totals.available, totals.total);
    Ok(())
}

pub async fn power(config_path: &Path, pool_name: &str, unit: &str, action: PowerArg) -> Result<()> {
    let config = load_config(config_path)?;
    let stores = Stores::connect(None).await?;
    load_provider_tokens(&config, stores.credentials.as_ref()).await;

    let pools = build_pools(&config, stores.credentials.clone())?;
    let pool = pools
        .iter()
        .find(|p| p.name() == pool_name)
        .with_context(|| format!("no pool named {}", pool_name))?;
    pool.refresh().await?;

    let action = PowerAction::from(action);
    pool.power(&UnitId::new(unit), action).await?;
    println!("{} {}", action, unit);
    Ok(())
}

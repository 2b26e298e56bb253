//! The periodic driver: refresh pools, schedule jobs, adjust capacity.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hangar_config::SchedulerConfig;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::allocation::{AllocationPolicy, TickOutcome};
use crate::error::SchedulerResult;
use crate::scheduler::{JobScheduler, RecoveryReport, ScheduleReport};

/// What one pass of the loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub refreshed: bool,
    pub recovered: RecoveryReport,
    /// Jobs moved to `error` because their unit vanished.
    pub failed: usize,
    pub schedule: ScheduleReport,
    pub allocation: TickOutcome,
}

pub struct ControlLoop {
    scheduler: Arc<JobScheduler>,
    policy: Arc<AllocationPolicy>,
    tick_interval: Duration,
    refresh_every: u64,
    ticks: AtomicU64,
}

impl ControlLoop {
    pub fn new(scheduler: Arc<JobScheduler>, policy: Arc<AllocationPolicy>, config: &SchedulerConfig) -> Self {
        Self {
            scheduler,
            policy,
            tick_interval: config.tick_interval,
            refresh_every: u64::from(config.refresh_every.max(1)),
            ticks: AtomicU64::new(0),
        }
    }

    /// Run one pass. The first pass always reconciles pools with providers.
    /// Reservations are checked against the store on every pass, so slots
    /// of jobs finished by other processes come back before scheduling.
    pub async fn tick(&self) -> SchedulerResult<TickReport> {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        let refreshed = tick % self.refresh_every == 0;
        if refreshed {
            self.policy.refresh_all().await;
        }

        let recovered = self.scheduler.recover().await?;
        let failed = self.scheduler.fail_orphaned(&recovered.orphaned).await?;

        let schedule = self.scheduler.schedule().await?;
        let allocation = self.policy.tick(&schedule.waiting).await;
        match &allocation {
            TickOutcome::Allocated { pool, unit } => info!(pool = %pool, unit = %unit, "capacity added"),
            TickOutcome::Deallocated { pool, unit } => info!(pool = %pool, unit = %unit, "capacity released"),
            TickOutcome::Failed(e) => error!(error = %e, "allocation failed"),
            TickOutcome::Idle | TickOutcome::CapacityExhausted => {}
        }

        Ok(TickReport {
            refreshed,
            recovered,
            failed,
            schedule,
            allocation,
        })
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            refresh_every = self.refresh_every,
            pools = self.policy.pools().len(),
            "starting control loop"
        );

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) => debug!(?report, "control loop tick"),
                        Err(e) => error!(error = %e, "control loop tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("control loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

//! Cost-aware growth and hysteresis-based shrinking across pools.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use hangar_core::UnitId;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::AllocationError;
use crate::pool::{PoolManager, RefreshReport, SlotCounts};

/// Which idle unit to give back first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShrinkOrder {
    Cheapest,
    MostExpensive,
}

/// What the policy wants to do this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationDecision {
    Hold,
    /// Indices of non-saturated pools whose units can host the waiting
    /// job, best cost per slot first.
    Grow(Vec<usize>),
    /// Some waiting job has no room and every pool that could host it is at
    /// its cap.
    Exhausted,
    Shrink { pool: usize, unit: UnitId },
}

/// What a tick actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Allocated { pool: String, unit: UnitId },
    Deallocated { pool: String, unit: UnitId },
    CapacityExhausted,
    Failed(AllocationError),
}

pub struct AllocationPolicy {
    /// Sorted by ascending cost per slot.
    pools: Vec<Arc<PoolManager>>,
    scale_down_window: Duration,
    /// Start of the current run of surplus capacity.
    surplus_since: Mutex<Option<Instant>>,
}

impl AllocationPolicy {
    pub fn new(mut pools: Vec<Arc<PoolManager>>, scale_down_window: Duration) -> Self {
        pools.sort_by(|a, b| a.cost_per_slot().total_cmp(&b.cost_per_slot()));
        Self {
            pools,
            scale_down_window,
            surplus_since: Mutex::new(None),
        }
    }

    pub fn pools(&self) -> &[Arc<PoolManager>] {
        &self.pools
    }

    pub fn pool(&self, name: &str) -> Option<&Arc<PoolManager>> {
        self.pools.iter().find(|p| p.name() == name)
    }

    /// Available slots across every pool.
    pub fn supply(&self) -> u32 {
        self.totals().available
    }

    pub fn totals(&self) -> SlotCounts {
        self.pools.iter().map(|p| p.totals()).sum()
    }

    /// The idle unit to release first under `order`, oldest first on ties.
    pub fn shrink_candidate(&self, order: ShrinkOrder) -> Option<(usize, UnitId)> {
        let mut idle: Vec<(usize, f64, DateTime<Utc>, UnitId)> = self
            .pools
            .iter()
            .enumerate()
            .flat_map(|(index, pool)| {
                let cost = pool.cost_per_slot();
                pool.idle_units()
                    .into_iter()
                    .map(move |(id, created_at)| (index, cost, created_at, id))
            })
            .collect();

        idle.sort_by(|a, b| {
            let by_cost = match order {
                ShrinkOrder::Cheapest => a.1.total_cmp(&b.1),
                ShrinkOrder::MostExpensive => b.1.total_cmp(&a.1),
            };
            by_cost
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| a.3.cmp(&b.3))
        });
        idle.into_iter().next().map(|(index, _, _, id)| (index, id))
    }

    /// Waiting jobs that the free room of existing units cannot take,
    /// placed first fit in pool order and oldest unit first.
    fn unmet(&self, waiting: &[u32]) -> Vec<u32> {
        let mut free: Vec<u32> = self.pools.iter().flat_map(|p| p.free_slots()).collect();
        let mut unmet = Vec::new();
        for &slots in waiting {
            match free.iter_mut().find(|room| **room >= slots) {
                Some(room) => *room -= slots,
                None => unmet.push(slots),
            }
        }
        unmet
    }

    /// Decide the action for the slot requests of waiting jobs at `now`.
    ///
    /// Also advances the surplus window, so call it once per tick.
    pub fn decide(&self, waiting: &[u32], now: Instant) -> AllocationDecision {
        let mut surplus_since = self.surplus_since.lock();

        let unmet = self.unmet(waiting);
        if !unmet.is_empty() {
            *surplus_since = None;
            // Grow for the first job in queue order that some pool can still host.
            for slots in unmet {
                let candidates: Vec<usize> = self
                    .pools
                    .iter()
                    .enumerate()
                    .filter(|(_, pool)| pool.unit_size() >= slots && !pool.is_saturated())
                    .map(|(index, _)| index)
                    .collect();
                if !candidates.is_empty() {
                    return AllocationDecision::Grow(candidates);
                }
            }
            return AllocationDecision::Exhausted;
        }

        let demand: u32 = waiting.iter().sum();
        let surplus = self.supply().saturating_sub(demand);
        let Some((pool, unit)) = self.shrink_candidate(ShrinkOrder::MostExpensive) else {
            *surplus_since = None;
            return AllocationDecision::Hold;
        };
        if surplus <= self.pools[pool].unit_size() {
            *surplus_since = None;
            return AllocationDecision::Hold;
        }

        let since = *surplus_since.get_or_insert(now);
        if now.saturating_duration_since(since) >= self.scale_down_window {
            AllocationDecision::Shrink { pool, unit }
        } else {
            debug!(surplus, "surplus capacity inside scale-down window");
            AllocationDecision::Hold
        }
    }

    /// Run one allocation step for the slot requests of waiting jobs.
    pub async fn tick(&self, waiting: &[u32]) -> TickOutcome {
        match self.decide(waiting, Instant::now()) {
            AllocationDecision::Hold => TickOutcome::Idle,
            AllocationDecision::Exhausted => {
                info!(waiting = waiting.len(), supply = self.supply(), "all pools at capacity");
                TickOutcome::CapacityExhausted
            }
            AllocationDecision::Grow(candidates) => self.grow(&candidates).await,
            AllocationDecision::Shrink { pool, unit } => self.shrink(pool, unit).await,
        }
    }

    async fn grow(&self, candidates: &[usize]) -> TickOutcome {
        let mut last_error = None;

        for &index in candidates {
            let pool = &self.pools[index];
            match pool.allocate().await {
                Ok(unit) => {
                    return TickOutcome::Allocated {
                        pool: pool.name().to_string(),
                        unit,
                    };
                }
                Err(e @ AllocationError::AuthExpired(_)) => {
                    warn!(pool = %pool.name(), error = %e, "provider credential expired, halting allocation");
                    return TickOutcome::Failed(e);
                }
                Err(AllocationError::CapacityExhausted(_)) => continue,
                Err(e) => {
                    warn!(pool = %pool.name(), error = %e, "pool class unavailable this tick");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => TickOutcome::Failed(e),
            None => TickOutcome::CapacityExhausted,
        }
    }

    async fn shrink(&self, index: usize, unit: UnitId) -> TickOutcome {
        let pool = &self.pools[index];
        match pool.deallocate(&unit).await {
            Ok(()) => {
                *self.surplus_since.lock() = None;
                TickOutcome::Deallocated {
                    pool: pool.name().to_string(),
                    unit,
                }
            }
            // Claimed between the decision and the provider call.
            Err(AllocationError::Busy(_)) => TickOutcome::Idle,
            Err(e) => TickOutcome::Failed(e),
        }
    }

    /// Reconcile every pool with its provider concurrently.
    pub async fn refresh_all(&self) -> Vec<(String, Result<RefreshReport, AllocationError>)> {
        let results = join_all(self.pools.iter().map(|pool| pool.refresh())).await;
        self.pools
            .iter()
            .zip(results)
            .map(|(pool, result)| {
                if let Err(e) = &result {
                    warn!(pool = %pool.name(), error = %e, "pool refresh failed");
                }
                (pool.name().to_string(), result)
            })
            .collect()
    }
}

impl std::fmt::Debug for AllocationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationPolicy")
            .field("pools", &self.pools.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("scale_down_window", &self.scale_down_window)
            .finish()
    }
}

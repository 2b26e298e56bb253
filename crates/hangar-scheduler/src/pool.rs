//! Worker pools: homogeneous sets of capacity units of one instance class.
//!
//! A [`PoolManager`] keeps its units behind a mutex that is only held for
//! bookkeeping; provider calls always happen with the lock released. Slot
//! reservations are keyed by job id, so releasing a job twice is harmless.

use std::collections::HashMap;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use hangar_config::PoolClass;
use hangar_core::capacity::{CapacityProvider, PowerAction, ProviderError, ServerInfo, ServerRequest};
use hangar_core::job::UnitAssignment;
use hangar_core::{ResourceId, UnitId};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::AllocationError;
use crate::retry::RetryPolicy;

/// Slot counts of a unit or a whole pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlotCounts {
    pub available: u32,
    pub in_use: u32,
    pub total: u32,
}

impl Add for SlotCounts {
    type Output = SlotCounts;

    fn add(self, other: SlotCounts) -> SlotCounts {
        SlotCounts {
            available: self.available + other.available,
            in_use: self.in_use + other.in_use,
            total: self.total + other.total,
        }
    }
}

impl AddAssign for SlotCounts {
    fn add_assign(&mut self, other: SlotCounts) {
        *self = *self + other;
    }
}

impl Sum for SlotCounts {
    fn sum<I: Iterator<Item = SlotCounts>>(iter: I) -> SlotCounts {
        iter.fold(SlotCounts::default(), Add::add)
    }
}

/// One rented machine.
#[derive(Debug, Clone)]
pub struct CapacityUnit {
    pub id: UnitId,
    pub instance_class: String,
    pub created_at: DateTime<Utc>,
    total: u32,
    reservations: HashMap<ResourceId, u32>,
    /// Set while a deallocation is in flight; no new claims land here.
    draining: bool,
    /// When this manager started tracking the unit.
    recorded_at: Instant,
}

impl CapacityUnit {
    pub fn new(id: UnitId, instance_class: impl Into<String>, total: u32, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            instance_class: instance_class.into(),
            created_at,
            total,
            reservations: HashMap::new(),
            draining: false,
            recorded_at: Instant::now(),
        }
    }

    pub fn in_use(&self) -> u32 {
        self.reservations.values().sum()
    }

    pub fn available(&self) -> u32 {
        if self.draining {
            0
        } else {
            self.total.saturating_sub(self.in_use())
        }
    }

    pub fn counts(&self) -> SlotCounts {
        SlotCounts {
            available: self.available(),
            in_use: self.in_use(),
            total: self.total,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.reservations.is_empty() && !self.draining
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn holds(&self, job_id: ResourceId) -> bool {
        self.reservations.contains_key(&job_id)
    }

    fn reserve(&mut self, job_id: ResourceId, slots: u32) -> bool {
        if self.holds(job_id) || self.available() < slots {
            return false;
        }
        self.reservations.insert(job_id, slots);
        true
    }

    fn release(&mut self, job_id: ResourceId) -> Option<u32> {
        self.reservations.remove(&job_id)
    }
}

/// Result of reconciling a pool with the provider listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub added: Vec<UnitId>,
    pub removed: Vec<UnitId>,
}

#[derive(Debug, Default)]
struct PoolState {
    units: Vec<CapacityUnit>,
    /// Allocations accepted against the cap but not yet recorded.
    pending: u32,
    /// Set once a provider listing has been applied.
    synced: bool,
}

/// Holds one pending allocation against the cap until it is recorded or
/// the allocating future goes away.
struct PendingSlot<'a> {
    state: &'a Mutex<PoolState>,
    armed: bool,
}

impl PendingSlot<'_> {
    fn finish(mut self, state: &mut PoolState) {
        state.pending = state.pending.saturating_sub(1);
        self.armed = false;
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock();
            state.pending = state.pending.saturating_sub(1);
        }
    }
}

/// Owns the units of one pool class.
pub struct PoolManager {
    class: PoolClass,
    provider: Arc<dyn CapacityProvider>,
    retry: RetryPolicy,
    state: Mutex<PoolState>,
}

impl PoolManager {
    pub fn new(class: PoolClass, provider: Arc<dyn CapacityProvider>, retry: RetryPolicy) -> Self {
        Self {
            class,
            provider,
            retry,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.class.name
    }

    pub fn class(&self) -> &PoolClass {
        &self.class
    }

    pub fn cost_per_slot(&self) -> f64 {
        self.class.cost_per_slot()
    }

    pub fn unit_size(&self) -> u32 {
        self.class.unit_size
    }

    /// Snapshot of the current units.
    pub fn units(&self) -> Vec<CapacityUnit> {
        self.state.lock().units.clone()
    }

    pub fn contains(&self, unit_id: &UnitId) -> bool {
        self.state.lock().units.iter().any(|u| &u.id == unit_id)
    }

    /// Whether recorded plus in-flight units have reached `max_pools`.
    pub fn is_saturated(&self) -> bool {
        let state = self.state.lock();
        state.units.len() as u32 + state.pending >= self.class.max_pools
    }

    pub fn totals(&self) -> SlotCounts {
        self.state.lock().units.iter().map(CapacityUnit::counts).sum()
    }

    /// Free slots of each unit, oldest unit first.
    pub fn free_slots(&self) -> Vec<u32> {
        let state = self.state.lock();
        let mut units: Vec<&CapacityUnit> = state.units.iter().collect();
        units.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        units.iter().map(|u| u.available()).collect()
    }

    /// Whether the unit list reflects at least one provider listing.
    /// Before that, a unit missing here may still exist.
    pub fn is_synced(&self) -> bool {
        self.state.lock().synced
    }

    /// Idle units with their creation time.
    pub fn idle_units(&self) -> Vec<(UnitId, DateTime<Utc>)> {
        self.state
            .lock()
            .units
            .iter()
            .filter(|u| u.is_idle())
            .map(|u| (u.id.clone(), u.created_at))
            .collect()
    }

    /// Rent one more unit.
    ///
    /// Every attempt reuses one generated server name. After a transient
    /// failure the provider is asked for a server with that name, and an
    /// existing one is adopted instead of creating a second machine.
    pub async fn allocate(&self) -> Result<UnitId, AllocationError> {
        let pending = {
            let mut state = self.state.lock();
            if state.units.len() as u32 + state.pending >= self.class.max_pools {
                return Err(AllocationError::CapacityExhausted(self.class.name.clone()));
            }
            state.pending += 1;
            PendingSlot {
                state: &self.state,
                armed: true,
            }
        };

        let request = ServerRequest {
            name: format!("hangar-{}-{}", self.class.name, uuid::Uuid::new_v4().simple()),
            instance_class: self.class.instance_class.clone(),
        };
        debug!(pool = %self.class.name, server = %request.name, "allocating unit");

        let provider = &self.provider;
        let request_ref = &request;
        let result = self
            .retry
            .run("create_server", || async move {
                match provider.create_server(request_ref).await {
                    Err(ProviderError::Transient(message)) => {
                        match provider.find_server(&request_ref.name).await? {
                            Some(server) => {
                                info!(server = %server.id, "adopting server created by a failed request");
                                Ok(server)
                            }
                            None => Err(ProviderError::Transient(message)),
                        }
                    }
                    other => other,
                }
            })
            .await;

        let mut state = self.state.lock();
        pending.finish(&mut state);

        let server = match result {
            Ok(server) => server,
            Err(e) => {
                warn!(pool = %self.class.name, error = %e, "allocation failed");
                return Err(e);
            }
        };

        if !state.units.iter().any(|u| u.id == server.id) {
            state.units.push(self.unit_from(&server));
        }
        info!(
            pool = %self.class.name,
            unit = %server.id,
            units = state.units.len(),
            "unit allocated"
        );
        Ok(server.id)
    }

    /// Release one idle unit back to the provider.
    pub async fn deallocate(&self, unit_id: &UnitId) -> Result<(), AllocationError> {
        {
            let mut state = self.state.lock();
            let unit = state
                .units
                .iter_mut()
                .find(|u| &u.id == unit_id)
                .ok_or_else(|| AllocationError::UnknownUnit(unit_id.clone()))?;
            if !unit.is_idle() {
                return Err(AllocationError::Busy(unit_id.clone()));
            }
            unit.draining = true;
        }

        let provider = &self.provider;
        let result = self
            .retry
            .run("delete_server", || async move { provider.delete_server(unit_id).await })
            .await;

        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                state.units.retain(|u| &u.id != unit_id);
                info!(pool = %self.class.name, unit = %unit_id, units = state.units.len(), "unit released");
                Ok(())
            }
            Err(e) => {
                if let Some(unit) = state.units.iter_mut().find(|u| &u.id == unit_id) {
                    unit.draining = false;
                }
                warn!(pool = %self.class.name, unit = %unit_id, error = %e, "deallocation failed");
                Err(e)
            }
        }
    }

    /// Reconcile local units with what the provider reports for this class.
    pub async fn refresh(&self) -> Result<RefreshReport, AllocationError> {
        let started = Instant::now();
        let provider = &self.provider;
        let servers = self
            .retry
            .run("list_servers", || async move { provider.list_servers().await })
            .await?;

        let listed: Vec<&ServerInfo> = servers
            .iter()
            .filter(|s| s.instance_class == self.class.instance_class)
            .collect();

        let mut report = RefreshReport::default();
        let mut state = self.state.lock();
        state.synced = true;

        // Units recorded after the listing started may simply be missing from it.
        state.units.retain(|unit| {
            let keep = unit.recorded_at >= started || listed.iter().any(|s| s.id == unit.id);
            if !keep {
                report.removed.push(unit.id.clone());
            }
            keep
        });

        for server in listed {
            if !state.units.iter().any(|u| u.id == server.id) {
                state.units.push(self.unit_from(server));
                report.added.push(server.id.clone());
            }
        }

        if !report.added.is_empty() || !report.removed.is_empty() {
            info!(
                pool = %self.class.name,
                added = report.added.len(),
                removed = report.removed.len(),
                units = state.units.len(),
                "pool reconciled"
            );
        }
        Ok(report)
    }

    /// Reserve `slots` for `job_id` on the oldest unit with room.
    ///
    /// A job holds at most one reservation per pool.
    pub fn reserve(&self, job_id: ResourceId, slots: u32) -> Option<UnitAssignment> {
        let mut state = self.state.lock();
        if state.units.iter().any(|u| u.holds(job_id)) {
            return None;
        }
        let mut candidates: Vec<&mut CapacityUnit> = state
            .units
            .iter_mut()
            .filter(|u| u.available() >= slots)
            .collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let unit = candidates.into_iter().next()?;
        if !unit.reserve(job_id, slots) {
            return None;
        }
        Some(UnitAssignment {
            id: unit.id.clone(),
            instance_class: unit.instance_class.clone(),
        })
    }

    /// Drop `job_id`'s reservation. Returns whether anything was released.
    pub fn release(&self, unit_id: &UnitId, job_id: ResourceId) -> bool {
        let mut state = self.state.lock();
        let released = state
            .units
            .iter_mut()
            .find(|u| &u.id == unit_id)
            .and_then(|u| u.release(job_id));
        if let Some(slots) = released {
            debug!(pool = %self.class.name, unit = %unit_id, job = %job_id, slots, "slots released");
        }
        released.is_some()
    }

    /// Every `(unit, job)` reservation currently held.
    pub fn reservations(&self) -> Vec<(UnitId, ResourceId)> {
        self.state
            .lock()
            .units
            .iter()
            .flat_map(|u| u.reservations.keys().map(|job| (u.id.clone(), *job)))
            .collect()
    }

    /// Re-attach a reservation known from storage, e.g. after a restart.
    pub fn restore(&self, unit_id: &UnitId, job_id: ResourceId, slots: u32) -> bool {
        let mut state = self.state.lock();
        match state.units.iter_mut().find(|u| &u.id == unit_id) {
            Some(unit) if unit.holds(job_id) => true,
            Some(unit) => {
                let restored = unit.reserve(job_id, slots);
                if !restored {
                    warn!(pool = %self.class.name, unit = %unit_id, job = %job_id, "unit has no room for restored reservation");
                }
                restored
            }
            None => false,
        }
    }

    pub async fn power(&self, unit_id: &UnitId, action: PowerAction) -> Result<(), AllocationError> {
        if !self.contains(unit_id) {
            return Err(AllocationError::UnknownUnit(unit_id.clone()));
        }
        let provider = &self.provider;
        self.retry
            .run("server_action", || async move { provider.server_action(unit_id, action).await })
            .await?;
        info!(pool = %self.class.name, unit = %unit_id, action = %action, "power action applied");
        Ok(())
    }

    fn unit_from(&self, server: &ServerInfo) -> CapacityUnit {
        CapacityUnit::new(
            server.id.clone(),
            server.instance_class.clone(),
            self.class.unit_size,
            server.created_at.unwrap_or_else(Utc::now),
        )
    }

    #[cfg(test)]
    pub(crate) fn insert_unit(&self, unit: CapacityUnit) {
        let mut state = self.state.lock();
        state.units.push(unit);
        state.synced = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProvider, pool_class, unit_at};
    use proptest::prelude::*;
    use std::time::Duration;

    fn manager(provider: Arc<FakeProvider>, max_pools: u32) -> PoolManager {
        PoolManager::new(
            pool_class("small", "DEV1-S", 2, 0.01, max_pools),
            provider,
            RetryPolicy::new(3, Duration::ZERO, Duration::ZERO),
        )
    }

    #[tokio::test]
    async fn test_allocate_respects_cap() {
        let provider = Arc::new(FakeProvider::new());
        let pool = manager(provider.clone(), 2);

        pool.allocate().await.unwrap();
        pool.allocate().await.unwrap();
        let err = pool.allocate().await.unwrap_err();

        assert_eq!(err, AllocationError::CapacityExhausted("small".to_string()));
        assert_eq!(provider.create_calls(), 2);
        assert_eq!(pool.totals().total, 4);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_never_exceed_cap() {
        let provider = Arc::new(FakeProvider::new());
        let pool = Arc::new(manager(provider.clone(), 3));

        let attempts = (0..8).map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.allocate().await })
        });
        let results = futures::future::join_all(attempts).await;
        let succeeded = results.into_iter().filter(|r| matches!(r, Ok(Ok(_)))).count();

        assert_eq!(succeeded, 3);
        assert_eq!(provider.create_calls(), 3);
        assert_eq!(pool.units().len(), 3);
    }

    #[tokio::test]
    async fn test_allocate_adopts_server_after_transient_failure() {
        let provider = Arc::new(FakeProvider::new());
        // The server gets created but the response is lost.
        provider.fail_create_after_commit(1);
        let pool = manager(provider.clone(), 4);

        let unit = pool.allocate().await.unwrap();

        assert_eq!(provider.create_calls(), 1);
        assert_eq!(provider.server_count(), 1);
        assert_eq!(pool.units().len(), 1);
        assert_eq!(pool.units()[0].id, unit);
    }

    #[tokio::test]
    async fn test_allocate_retries_then_gives_up() {
        let provider = Arc::new(FakeProvider::new());
        provider.fail_create(ProviderError::Transient("503".to_string()), 10);
        let pool = manager(provider.clone(), 4);

        let err = pool.allocate().await.unwrap_err();
        assert!(matches!(err, AllocationError::Transient { attempts: 3, .. }));
        assert!(pool.units().is_empty());
        assert!(!pool.is_saturated());
    }

    #[tokio::test]
    async fn test_auth_expired_stops_provider_calls() {
        let provider = Arc::new(FakeProvider::new());
        provider.expire_credentials();
        let pool = manager(provider.clone(), 4);

        let err = pool.allocate().await.unwrap_err();
        assert!(matches!(err, AllocationError::AuthExpired(_)));
        assert_eq!(provider.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_deallocate_refuses_busy_unit() {
        let provider = Arc::new(FakeProvider::new());
        let pool = manager(provider.clone(), 4);
        let unit = pool.allocate().await.unwrap();

        let job = ResourceId::new();
        pool.reserve(job, 1).unwrap();
        assert_eq!(
            pool.deallocate(&unit).await,
            Err(AllocationError::Busy(unit.clone()))
        );
        assert_eq!(provider.delete_calls(), 0);

        assert!(pool.release(&unit, job));
        pool.deallocate(&unit).await.unwrap();
        assert!(pool.units().is_empty());
        assert_eq!(provider.server_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_deallocation_restores_unit() {
        let provider = Arc::new(FakeProvider::new());
        let pool = manager(provider.clone(), 4);
        let unit = pool.allocate().await.unwrap();
        provider.fail_delete(ProviderError::Permanent("locked".to_string()), 1);

        assert!(pool.deallocate(&unit).await.is_err());
        let units = pool.units();
        assert_eq!(units.len(), 1);
        assert!(units[0].is_idle());
        assert!(pool.reserve(ResourceId::new(), 2).is_some());
    }

    #[tokio::test]
    async fn test_refresh_adds_and_drops_units() {
        let provider = Arc::new(FakeProvider::new());
        let pool = manager(provider.clone(), 4);
        let kept = pool.allocate().await.unwrap();
        let vanished = pool.allocate().await.unwrap();

        provider.remove_server(&vanished);
        let foreign = provider.add_server("DEV1-S");
        provider.add_server("GP1-XL");

        let report = pool.refresh().await.unwrap();
        assert_eq!(report.added, vec![foreign.clone()]);
        assert_eq!(report.removed, vec![vanished]);

        let ids: Vec<UnitId> = pool.units().into_iter().map(|u| u.id).collect();
        assert!(ids.contains(&kept));
        assert!(ids.contains(&foreign));
        assert_eq!(ids.len(), 2);

        // A second pass changes nothing.
        assert_eq!(pool.refresh().await.unwrap(), RefreshReport::default());
    }

    #[tokio::test]
    async fn test_synced_only_after_successful_listing() {
        let provider = Arc::new(FakeProvider::new());
        let pool = manager(provider.clone(), 4);
        assert!(!pool.is_synced());

        provider.expire_credentials();
        assert!(pool.refresh().await.is_err());
        assert!(!pool.is_synced());

        let fresh = manager(Arc::new(FakeProvider::new()), 4);
        fresh.refresh().await.unwrap();
        assert!(fresh.is_synced());
    }

    #[test]
    fn test_free_slots_oldest_unit_first() {
        let pool = manager(Arc::new(FakeProvider::new()), 4);
        pool.insert_unit(unit_at("young", 2, 100));
        pool.insert_unit(unit_at("old", 2, 10));
        pool.reserve(ResourceId::new(), 1).unwrap();

        assert_eq!(pool.free_slots(), vec![1, 2]);
    }

    #[test]
    fn test_reserve_prefers_oldest_unit_and_never_oversubscribes() {
        let provider = Arc::new(FakeProvider::new());
        let pool = manager(provider, 4);
        pool.insert_unit(unit_at("young", 2, 100));
        pool.insert_unit(unit_at("old", 2, 10));

        let first = pool.reserve(ResourceId::new(), 1).unwrap();
        assert_eq!(first.id.as_str(), "old");
        let second = pool.reserve(ResourceId::new(), 2).unwrap();
        assert_eq!(second.id.as_str(), "young");
        let third = pool.reserve(ResourceId::new(), 1).unwrap();
        assert_eq!(third.id.as_str(), "old");

        assert!(pool.reserve(ResourceId::new(), 1).is_none());
        assert_eq!(
            pool.totals(),
            SlotCounts {
                available: 0,
                in_use: 4,
                total: 4
            }
        );
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = manager(Arc::new(FakeProvider::new()), 4);
        pool.insert_unit(unit_at("u1", 2, 0));
        let job = ResourceId::new();
        let assignment = pool.reserve(job, 2).unwrap();

        assert!(pool.release(&assignment.id, job));
        assert!(!pool.release(&assignment.id, job));
        assert_eq!(pool.totals().available, 2);
    }

    #[test]
    fn test_restore_reattaches_known_units_only() {
        let pool = manager(Arc::new(FakeProvider::new()), 4);
        pool.insert_unit(unit_at("u1", 2, 0));
        let job = ResourceId::new();

        assert!(pool.restore(&UnitId::new("u1"), job, 2));
        assert!(pool.restore(&UnitId::new("u1"), job, 2));
        assert!(!pool.restore(&UnitId::new("gone"), ResourceId::new(), 1));
        assert_eq!(pool.totals().in_use, 2);
    }

    #[tokio::test]
    async fn test_power_only_for_known_units() {
        let provider = Arc::new(FakeProvider::new());
        let pool = manager(provider.clone(), 4);
        let unit = pool.allocate().await.unwrap();

        pool.power(&unit, PowerAction::Restart).await.unwrap();
        assert_eq!(
            pool.power(&UnitId::new("nope"), PowerAction::PowerOff).await,
            Err(AllocationError::UnknownUnit(UnitId::new("nope")))
        );
        assert_eq!(provider.actions(), vec![(unit, PowerAction::Restart)]);
    }

    proptest! {
        #[test]
        fn totals_equal_sum_of_units(
            units in proptest::collection::vec((1u32..16, proptest::collection::vec(1u32..4, 0..6)), 0..12)
        ) {
            let pool = manager(Arc::new(FakeProvider::new()), 64);
            let mut expected = SlotCounts::default();

            for (i, (size, claims)) in units.iter().enumerate() {
                let mut unit = unit_at(&format!("u{}", i), *size, i as i64);
                for slots in claims {
                    unit.reserve(ResourceId::new(), *slots);
                }
                expected.available += unit.available();
                expected.in_use += unit.in_use();
                expected.total += unit.total;
                prop_assert_eq!(unit.available() + unit.in_use(), unit.total);
                pool.insert_unit(unit);
            }

            prop_assert_eq!(pool.totals(), expected);
        }
    }
}

//! Matching queued jobs against pool capacity.
//!
//! A claim reserves slots in memory first and then commits the job with a
//! compare-and-swap on its version. Whoever loses a race undoes its own
//! effect: a claim that loses gives its slots back, a cancel that loses
//! re-reads the job and tries again.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use hangar_core::ResourceId;
use hangar_core::job::{Job, JobStatus, UnitAssignment};
use hangar_db::{BuildRepo, DbError, JobRepo};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::events::SchedulerEvent;
use crate::pool::PoolManager;

/// Attempts at a version-checked write before giving up.
const MAX_CAS_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(UnitAssignment),
    /// No unit has enough free slots right now.
    NoCapacity,
    /// Someone else changed the job first; retried next tick.
    Conflict,
}

/// Summary of one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub claimed: usize,
    pub conflicts: usize,
    /// Slot requests of the jobs left queued for lack of room, in queue order.
    pub waiting: Vec<u32>,
}

impl ScheduleReport {
    pub fn waiting_slots(&self) -> u32 {
        self.waiting.iter().sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Active jobs whose reservation is held, re-attached where missing.
    pub restored: usize,
    /// Active jobs whose unit is gone from a pool view that has been synced
    /// with its provider.
    pub orphaned: Vec<ResourceId>,
    /// Reservations held for jobs that are no longer active.
    pub released: usize,
}

pub struct JobScheduler {
    jobs: Arc<dyn JobRepo>,
    builds: Arc<dyn BuildRepo>,
    /// Sorted by ascending cost per slot.
    pools: Vec<Arc<PoolManager>>,
    claim_batch: usize,
    events: Option<mpsc::Sender<SchedulerEvent>>,
}

impl JobScheduler {
    pub fn new(
        jobs: Arc<dyn JobRepo>,
        builds: Arc<dyn BuildRepo>,
        mut pools: Vec<Arc<PoolManager>>,
        claim_batch: usize,
    ) -> Self {
        pools.sort_by(|a, b| a.cost_per_slot().total_cmp(&b.cost_per_slot()));
        Self {
            jobs,
            builds,
            pools,
            claim_batch: claim_batch.max(1),
            events: None,
        }
    }

    /// Publish a [`SchedulerEvent`] for every transition on `events`.
    pub fn with_events(mut self, events: mpsc::Sender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Offer queued jobs to the pools in FIFO order.
    ///
    /// A job that does not fit is skipped; smaller jobs behind it still get
    /// a chance this pass. Jobs larger than every pool's unit are never
    /// fetched, so they cannot crowd the batch.
    pub async fn schedule(&self) -> SchedulerResult<ScheduleReport> {
        let mut report = ScheduleReport::default();
        let Some(max_slots) = self.pools.iter().map(|p| p.unit_size()).max() else {
            return Ok(report);
        };
        let queued = self.jobs.queued_jobs(max_slots, self.claim_batch).await?;

        for job in &queued {
            match self.claim(job).await? {
                ClaimOutcome::Claimed(_) => report.claimed += 1,
                ClaimOutcome::Conflict => report.conflicts += 1,
                ClaimOutcome::NoCapacity => report.waiting.push(job.slots),
            }
        }

        if report.claimed > 0 || !report.waiting.is_empty() {
            info!(
                claimed = report.claimed,
                waiting = report.waiting.len(),
                waiting_slots = report.waiting_slots(),
                conflicts = report.conflicts,
                "scheduling pass complete"
            );
        }
        Ok(report)
    }

    /// Claim capacity for one queued job, `queued -> starting`.
    pub async fn claim(&self, job: &Job) -> SchedulerResult<ClaimOutcome> {
        if job.status != JobStatus::Queued {
            return Ok(ClaimOutcome::Conflict);
        }
        let Some((pool, assignment)) = self.reserve(job) else {
            return Ok(ClaimOutcome::NoCapacity);
        };

        let mut claimed = job.clone();
        claimed.assign(assignment.clone(), Utc::now())?;

        match self.jobs.compare_and_swap(&claimed, job.version).await {
            Ok(stored) => {
                debug!(job = %job.id, unit = %assignment.id, pool = %pool.name(), "job claimed");
                self.emit(Some(job.status), &stored).await;
                Ok(ClaimOutcome::Claimed(assignment))
            }
            Err(DbError::Conflict(_)) | Err(DbError::NotFound(_)) => {
                pool.release(&assignment.id, job.id);
                debug!(job = %job.id, "claim lost to a concurrent update");
                Ok(ClaimOutcome::Conflict)
            }
            Err(e) => {
                pool.release(&assignment.id, job.id);
                Err(e.into())
            }
        }
    }

    /// Execution environment reports the job booted, `starting -> running`.
    pub async fn mark_running(&self, job_id: ResourceId) -> SchedulerResult<Job> {
        self.transition(job_id, JobStatus::Running).await
    }

    /// Execution environment reports the job finished.
    pub async fn complete(&self, job_id: ResourceId, status: JobStatus) -> SchedulerResult<Job> {
        if !status.is_terminal() {
            return Err(hangar_core::Error::InvalidInput(format!(
                "{} is not a terminal job status",
                status
            ))
            .into());
        }
        self.transition(job_id, status).await
    }

    /// Cancel a job. Canceling a finished job changes nothing.
    pub async fn cancel(&self, job_id: ResourceId) -> SchedulerResult<Job> {
        self.transition(job_id, JobStatus::Canceled).await
    }

    /// Bring in-memory reservations in line with the store.
    ///
    /// Re-attaches reservations of active jobs (after a restart) and drops
    /// reservations of jobs that moved on through another process, emitting
    /// [`SchedulerEvent::JobSettled`] for each. The control loop runs it every tick.
    pub async fn recover(&self) -> SchedulerResult<RecoveryReport> {
        let active = self.jobs.active_jobs().await?;
        let mut report = RecoveryReport::default();
        let synced = self.pools.iter().all(|p| p.is_synced());

        for job in &active {
            let Some(unit) = &job.unit else {
                continue;
            };
            let pool = self.pools.iter().find(|p| p.contains(&unit.id));
            match pool {
                Some(pool) if pool.restore(&unit.id, job.id, job.slots) => report.restored += 1,
                Some(_) => {}
                None if synced => report.orphaned.push(job.id),
                None => debug!(job = %job.id, unit = %unit.id, "unit not known yet"),
            }
        }

        let live: HashSet<ResourceId> = active.iter().map(|j| j.id).collect();
        let mut settled = Vec::new();
        for pool in &self.pools {
            for (unit, job_id) in pool.reservations() {
                if !live.contains(&job_id) && pool.release(&unit, job_id) {
                    report.released += 1;
                    settled.push(job_id);
                }
            }
        }
        for job_id in settled {
            match self.jobs.get_job(job_id).await {
                Ok(job) => self.emit(None, &job).await,
                Err(e) => warn!(job = %job_id, error = %e, "cannot read settled job"),
            }
        }

        if !report.orphaned.is_empty() {
            error!(jobs = ?report.orphaned, "active jobs reference units that no longer exist");
        }
        debug!(
            restored = report.restored,
            orphaned = report.orphaned.len(),
            released = report.released,
            "reservations reconciled"
        );
        Ok(report)
    }

    /// Move jobs whose unit vanished to `error`. Returns how many moved.
    ///
    /// A job that reached a terminal status in the meantime is left alone.
    pub async fn fail_orphaned(&self, job_ids: &[ResourceId]) -> SchedulerResult<usize> {
        let mut failed = 0;
        for &job_id in job_ids {
            let job = self.jobs.get_job(job_id).await?;
            if !job.holds_capacity() {
                continue;
            }
            match self.transition(job_id, JobStatus::Error).await {
                Ok(job) if job.status == JobStatus::Error => {
                    error!(job = %job_id, build = %job.build_id, "job failed, its unit is gone");
                    failed += 1;
                }
                Ok(_) => {}
                Err(SchedulerError::Domain(hangar_core::Error::InvalidTransition { .. })) => {
                    debug!(job = %job_id, "orphaned job finished before it could be failed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(failed)
    }

    fn reserve(&self, job: &Job) -> Option<(&Arc<PoolManager>, UnitAssignment)> {
        self.pools
            .iter()
            .find_map(|pool| pool.reserve(job.id, job.slots).map(|a| (pool, a)))
    }

    fn release(&self, job: &Job) {
        let Some(unit) = &job.unit else {
            return;
        };
        let released = self
            .pools
            .iter()
            .find(|p| p.contains(&unit.id))
            .is_some_and(|pool| pool.release(&unit.id, job.id));
        if !released {
            debug!(job = %job.id, unit = %unit.id, "no reservation to release");
        }
    }

    /// Fetch, transition and compare-and-swap, retrying on conflicts.
    async fn transition(&self, job_id: ResourceId, next: JobStatus) -> SchedulerResult<Job> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.jobs.get_job(job_id).await?;
            let settled = current.status == next
                || (next == JobStatus::Canceled && current.status.is_terminal());
            if settled {
                return Ok(current);
            }

            let mut updated = current.clone();
            updated.transition(next, Utc::now())?;

            match self.jobs.compare_and_swap(&updated, current.version).await {
                Ok(stored) => {
                    if current.holds_capacity() && !stored.holds_capacity() {
                        self.release(&current);
                    }
                    self.emit(Some(current.status), &stored).await;
                    return Ok(stored);
                }
                Err(DbError::Conflict(_)) => {
                    debug!(job = %job_id, attempt, "job changed underneath update, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchedulerError::Contention(job_id))
    }

    /// `from` is `None` for changes written by another process.
    async fn emit(&self, from: Option<JobStatus>, job: &Job) {
        match from {
            Some(from) => info!(job = %job.id, build = %job.build_id, from = %from, to = %job.status, "job transitioned"),
            None => info!(job = %job.id, build = %job.build_id, status = %job.status, "job settled elsewhere"),
        }

        let Some(events) = &self.events else {
            return;
        };
        let build_status = match self.builds.get_build(job.build_id).await {
            Ok(build) => build.status(),
            Err(e) => {
                warn!(build = %job.build_id, error = %e, "cannot derive build status for event");
                return;
            }
        };
        let event = match from {
            Some(from) => SchedulerEvent::JobTransitioned {
                job_id: job.id,
                build_id: job.build_id,
                from,
                to: job.status,
                build_status,
            },
            None => SchedulerEvent::JobSettled {
                job_id: job.id,
                build_id: job.build_id,
                status: job.status,
                build_status,
            },
        };
        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!(job = %job.id, "event channel full, dropping event"),
            Err(TrySendError::Closed(_)) => debug!("event receiver gone"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProvider, at, commit, fake_pool, pool_class, unit_at};
    use hangar_core::UnitId;
    use hangar_core::build::{Build, BuildStatus};
    use hangar_db::MemoryStore;

    async fn seed(store: &MemoryStore, slots: &[u32], created_secs: i64) -> Build {
        let mut build = Build::new(ResourceId::new(), 1, commit("main"), None, at(created_secs));
        build.jobs = slots
            .iter()
            .enumerate()
            .map(|(i, s)| Job::new(build.id, i as u32 + 1, at(created_secs)).with_slots(*s))
            .collect();
        store.create_build(&build).await.unwrap();
        build
    }

    /// One pool holding one unit per entry of `units`.
    fn scheduler(store: &Arc<MemoryStore>, units: &[u32]) -> (JobScheduler, Arc<PoolManager>) {
        let size = units.iter().copied().max().unwrap_or(1);
        let pool = fake_pool(pool_class("small", "DEV1-S", size, 0.01, 8), Arc::new(FakeProvider::new()));
        for (i, slots) in units.iter().enumerate() {
            pool.insert_unit(unit_at(&format!("u{}", i), *slots, i as i64));
        }
        let scheduler = JobScheduler::new(store.clone(), store.clone(), vec![pool.clone()], 100);
        (scheduler, pool)
    }

    #[tokio::test]
    async fn test_schedule_is_fifo_across_builds() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, pool) = scheduler(&store, &[1]);
        let older = seed(&store, &[1], 0).await;
        let newer = seed(&store, &[1], 10).await;

        let report = scheduler.schedule().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.waiting, vec![1]);

        let first = store.get_job(older.jobs[0].id).await.unwrap();
        assert_eq!(first.status, JobStatus::Starting);
        assert_eq!(first.unit.unwrap().id, UnitId::new("u0"));
        assert!(first.start_time.is_some());
        assert_eq!(store.get_job(newer.jobs[0].id).await.unwrap().status, JobStatus::Queued);
        assert_eq!(pool.totals().available, 0);
    }

    #[tokio::test]
    async fn test_large_job_does_not_block_smaller_ones() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, _pool) = scheduler(&store, &[4]);
        let blocker = seed(&store, &[2], 0).await;
        scheduler.schedule().await.unwrap();
        assert_eq!(store.get_job(blocker.jobs[0].id).await.unwrap().status, JobStatus::Starting);

        let build = seed(&store, &[3, 1], 5).await;
        let report = scheduler.schedule().await.unwrap();

        assert_eq!(report.claimed, 1);
        assert_eq!(report.waiting_slots(), 3);
        assert_eq!(store.get_job(build.jobs[0].id).await.unwrap().status, JobStatus::Queued);
        assert_eq!(store.get_job(build.jobs[1].id).await.unwrap().status, JobStatus::Starting);
    }

    #[tokio::test]
    async fn test_oversized_job_excluded_from_demand() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, _pool) = scheduler(&store, &[2]);
        seed(&store, &[8], 0).await;

        let report = scheduler.schedule().await.unwrap();
        assert_eq!(report, ScheduleReport::default());
    }

    #[tokio::test]
    async fn test_oversized_jobs_do_not_fill_the_batch() {
        let store = Arc::new(MemoryStore::new());
        let pool = fake_pool(pool_class("small", "DEV1-S", 2, 0.01, 8), Arc::new(FakeProvider::new()));
        pool.insert_unit(unit_at("u0", 2, 0));
        let scheduler = JobScheduler::new(store.clone(), store.clone(), vec![pool.clone()], 3);

        seed(&store, &[8, 8, 8], 0).await;
        let small = seed(&store, &[1], 10).await;

        let report = scheduler.schedule().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(store.get_job(small.jobs[0].id).await.unwrap().status, JobStatus::Starting);
        assert_eq!(pool.totals().available, 1);
    }

    #[tokio::test]
    async fn test_concurrent_claims_for_last_slot() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, pool) = scheduler(&store, &[1]);
        let build = seed(&store, &[1, 1], 0).await;
        let (job_a, job_b) = (build.jobs[0].clone(), build.jobs[1].clone());

        let (a, b) = tokio::join!(scheduler.claim(&job_a), scheduler.claim(&job_b));
        let (a, b) = (a.unwrap(), b.unwrap());

        let (winner, loser) = match (&a, &b) {
            (ClaimOutcome::Claimed(_), ClaimOutcome::NoCapacity) => (&job_a, &job_b),
            (ClaimOutcome::NoCapacity, ClaimOutcome::Claimed(_)) => (&job_b, &job_a),
            other => panic!("expected one claim and one miss, got {:?}", other),
        };
        assert_eq!(pool.totals().in_use, 1);
        assert_eq!(store.get_job(winner.id).await.unwrap().status, JobStatus::Starting);
        let loser = store.get_job(loser.id).await.unwrap();
        assert_eq!(loser.status, JobStatus::Queued);
        assert_eq!(loser.version, 0);
    }

    #[tokio::test]
    async fn test_concurrent_claims_on_one_job() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, pool) = scheduler(&store, &[2, 2]);
        let build = seed(&store, &[2], 0).await;
        let job = build.jobs[0].clone();

        let (a, b) = tokio::join!(scheduler.claim(&job), scheduler.claim(&job));
        let outcomes = [a.unwrap(), b.unwrap()];

        let wins = outcomes
            .iter()
            .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(pool.totals().in_use, 2);
        assert_eq!(store.get_job(job.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_claim_loses_to_cancel_and_gives_slots_back() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, pool) = scheduler(&store, &[1]);
        let build = seed(&store, &[1], 0).await;
        let stale = build.jobs[0].clone();

        let canceled = scheduler.cancel(stale.id).await.unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);

        assert_eq!(scheduler.claim(&stale).await.unwrap(), ClaimOutcome::Conflict);
        assert_eq!(pool.totals().in_use, 0);
        assert_eq!(store.get_job(stale.id).await.unwrap().status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_releases_reservation_once() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, pool) = scheduler(&store, &[2]);
        let build = seed(&store, &[1, 1], 0).await;
        scheduler.schedule().await.unwrap();
        assert_eq!(pool.totals().in_use, 2);

        let job = scheduler.cancel(build.jobs[0].id).await.unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert!(job.finish_time.is_some());
        assert_eq!(pool.totals().in_use, 1);

        // A second cancel is a no-op and must not touch the sibling's slot.
        let again = scheduler.cancel(build.jobs[0].id).await.unwrap();
        assert_eq!(again.version, job.version);
        assert_eq!(pool.totals().in_use, 1);
    }

    #[tokio::test]
    async fn test_completion_flow_emits_events() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, pool) = scheduler(&store, &[1]);
        let (tx, mut rx) = mpsc::channel(16);
        let scheduler = scheduler.with_events(tx);
        let build = seed(&store, &[1], 0).await;
        let job_id = build.jobs[0].id;

        scheduler.schedule().await.unwrap();
        scheduler.mark_running(job_id).await.unwrap();
        let done = scheduler.complete(job_id, JobStatus::Success).await.unwrap();
        assert_eq!(done.status, JobStatus::Success);
        assert_eq!(pool.totals().available, 1);

        let mut seen = Vec::new();
        while let Ok(SchedulerEvent::JobTransitioned { to, build_status, .. }) = rx.try_recv() {
            seen.push((to, build_status));
        }
        assert_eq!(
            seen,
            vec![
                (JobStatus::Starting, BuildStatus::Running),
                (JobStatus::Running, BuildStatus::Running),
                (JobStatus::Success, BuildStatus::Success),
            ]
        );
    }

    #[tokio::test]
    async fn test_starting_job_can_fail_to_boot() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, pool) = scheduler(&store, &[1]);
        let build = seed(&store, &[1], 0).await;
        scheduler.schedule().await.unwrap();

        let job = scheduler.complete(build.jobs[0].id, JobStatus::Error).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(pool.totals().available, 1);
        assert_eq!(store.get_build(build.id).await.unwrap().status(), BuildStatus::Failure);
    }

    #[tokio::test]
    async fn test_invalid_signals_rejected() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, _pool) = scheduler(&store, &[1]);
        let build = seed(&store, &[1], 0).await;
        let job_id = build.jobs[0].id;

        let err = scheduler.complete(job_id, JobStatus::Running).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Domain(hangar_core::Error::InvalidInput(_))));

        // Still queued, so it cannot start running.
        let err = scheduler.mark_running(job_id).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Domain(hangar_core::Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_recover_reattaches_known_units() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, pool) = scheduler(&store, &[2]);
        let build = seed(&store, &[2, 1], 0).await;

        let mut on_known = build.jobs[0].clone();
        on_known
            .assign(
                UnitAssignment {
                    id: UnitId::new("u0"),
                    instance_class: "fake".to_string(),
                },
                at(1),
            )
            .unwrap();
        store.compare_and_swap(&on_known, 0).await.unwrap();

        let mut on_gone = build.jobs[1].clone();
        on_gone
            .assign(
                UnitAssignment {
                    id: UnitId::new("vanished"),
                    instance_class: "fake".to_string(),
                },
                at(1),
            )
            .unwrap();
        store.compare_and_swap(&on_gone, 0).await.unwrap();

        let report = scheduler.recover().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                restored: 1,
                orphaned: vec![on_gone.id],
                released: 0
            }
        );
        assert_eq!(pool.totals().in_use, 2);

        assert_eq!(scheduler.fail_orphaned(&report.orphaned).await.unwrap(), 1);
        let failed = store.get_job(on_gone.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert!(failed.finish_time.is_some());
        assert_eq!(store.get_job(on_known.id).await.unwrap().status, JobStatus::Starting);
        assert_eq!(pool.totals().in_use, 2);

        // Already terminal, nothing left to fail.
        assert_eq!(scheduler.fail_orphaned(&report.orphaned).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recover_waits_for_first_listing() {
        let store = Arc::new(MemoryStore::new());
        let pool = fake_pool(pool_class("small", "DEV1-S", 2, 0.01, 8), Arc::new(FakeProvider::new()));
        let scheduler = JobScheduler::new(store.clone(), store.clone(), vec![pool], 10);
        let build = seed(&store, &[1], 0).await;

        let mut running = build.jobs[0].clone();
        running
            .assign(
                UnitAssignment {
                    id: UnitId::new("srv-1"),
                    instance_class: "DEV1-S".to_string(),
                },
                at(1),
            )
            .unwrap();
        store.compare_and_swap(&running, 0).await.unwrap();

        // The pool has never listed its provider, so the unit may well exist.
        let report = scheduler.recover().await.unwrap();
        assert!(report.orphaned.is_empty());
        assert_eq!(report.restored, 0);
    }

    #[tokio::test]
    async fn test_recover_drops_reservations_of_finished_jobs() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, pool) = scheduler(&store, &[2]);
        let build = seed(&store, &[1, 1], 0).await;
        scheduler.schedule().await.unwrap();
        assert_eq!(pool.totals().in_use, 2);

        // Finished by another process; this scheduler never saw it.
        let mut done = store.get_job(build.jobs[0].id).await.unwrap();
        let version = done.version;
        done.transition(JobStatus::Canceled, at(5)).unwrap();
        store.compare_and_swap(&done, version).await.unwrap();

        let report = scheduler.recover().await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(report.restored, 1);
        assert_eq!(pool.totals().in_use, 1);
    }

    #[tokio::test]
    async fn test_recover_announces_jobs_settled_elsewhere() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, pool) = scheduler(&store, &[1]);
        let (tx, mut rx) = mpsc::channel(16);
        let scheduler = scheduler.with_events(tx);
        let build = seed(&store, &[1], 0).await;
        let job_id = build.jobs[0].id;
        scheduler.schedule().await.unwrap();
        while rx.try_recv().is_ok() {}

        // A worker reports through a scheduler that owns no pools.
        let elsewhere = JobScheduler::new(store.clone(), store.clone(), Vec::new(), 1);
        elsewhere.mark_running(job_id).await.unwrap();
        elsewhere.complete(job_id, JobStatus::Failure).await.unwrap();
        assert_eq!(pool.totals().in_use, 1);

        scheduler.recover().await.unwrap();
        assert_eq!(pool.totals().in_use, 0);
        assert_eq!(
            rx.try_recv().unwrap(),
            SchedulerEvent::JobSettled {
                job_id,
                build_id: build.id,
                status: JobStatus::Failure,
                build_status: BuildStatus::Failure,
            }
        );

        // Released once; a second pass stays quiet.
        assert_eq!(scheduler.recover().await.unwrap().released, 0);
        assert!(rx.try_recv().is_err());
    }
}

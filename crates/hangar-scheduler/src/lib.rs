//! Capacity allocation and job scheduling for Hangar.
//!
//! Pools of rented machines grow and shrink with demand; queued jobs are
//! claimed onto free slots with optimistic concurrency against the store.
//! A single [`ControlLoop`] drives refresh, scheduling and allocation.

pub mod allocation;
pub mod builds;
pub mod control_loop;
pub mod error;
pub mod events;
pub mod notify;
pub mod pool;
pub mod retry;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use allocation::{AllocationDecision, AllocationPolicy, ShrinkOrder, TickOutcome};
pub use builds::BuildService;
pub use control_loop::{ControlLoop, TickReport};
pub use error::{AllocationError, SchedulerError, SchedulerResult};
pub use events::SchedulerEvent;
pub use notify::StatusNotifier;
pub use pool::{CapacityUnit, PoolManager, RefreshReport, SlotCounts};
pub use retry::RetryPolicy;
pub use scheduler::{ClaimOutcome, JobScheduler, RecoveryReport, ScheduleReport};

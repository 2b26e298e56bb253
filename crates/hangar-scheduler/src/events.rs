//! Events emitted by the scheduler.

use hangar_core::ResourceId;
use hangar_core::build::BuildStatus;
use hangar_core::job::JobStatus;

/// Event emitted whenever a job changes status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    JobTransitioned {
        job_id: ResourceId,
        build_id: ResourceId,
        from: JobStatus,
        to: JobStatus,
        /// Build status derived right after the transition.
        build_status: BuildStatus,
    },
    /// A job left its unit through another process (a worker callback or
    /// the CLI); seen when its reservation was reconciled.
    JobSettled {
        job_id: ResourceId,
        build_id: ResourceId,
        status: JobStatus,
        build_status: BuildStatus,
    },
}

impl SchedulerEvent {
    pub fn build_id(&self) -> ResourceId {
        match self {
            SchedulerEvent::JobTransitioned { build_id, .. }
            | SchedulerEvent::JobSettled { build_id, .. } => *build_id,
        }
    }
}

//! Jobs and the job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::id::UnitId;
use crate::{Error, ResourceId, Result};

/// Status of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for capacity.
    Queued,
    /// Capacity claimed, machine not yet ready.
    Starting,
    /// Executing on its capacity unit.
    Running,
    Success,
    Failure,
    /// The job could not complete for reasons outside the user's build.
    Error,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Queued,
        JobStatus::Starting,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::Failure,
        JobStatus::Error,
        JobStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Starting => "starting",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Error | JobStatus::Canceled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Queued => matches!(next, Starting | Canceled),
            Starting => matches!(next, Running | Failure | Error | Canceled),
            Running => matches!(next, Success | Failure | Error | Canceled),
            Success | Failure | Error | Canceled => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown job status: {}", s)))
    }
}

/// The capacity unit a job has been scheduled onto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitAssignment {
    pub id: UnitId,
    pub instance_class: String,
}

/// One entry of a build's matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    pub build_id: ResourceId,
    /// Sequence number within the build, starting at 1.
    pub number: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Set when the job enters `starting`.
    pub start_time: Option<DateTime<Utc>>,
    /// Set when the job reaches a terminal status.
    pub finish_time: Option<DateTime<Utc>>,
    /// Slots requested on a capacity unit.
    pub slots: u32,
    pub unit: Option<UnitAssignment>,
    /// Encoded job-level environment blob.
    pub env: Option<String>,
    pub run_deploy: bool,
    /// Optimistic concurrency version, bumped by the store on every write.
    pub version: u64,
}

impl Job {
    pub fn new(build_id: ResourceId, number: u32, created_at: DateTime<Utc>) -> Self {
        Self {
            id: ResourceId::new(),
            build_id,
            number,
            status: JobStatus::Queued,
            created_at,
            start_time: None,
            finish_time: None,
            slots: 1,
            unit: None,
            env: None,
            run_deploy: false,
            version: 0,
        }
    }

    pub fn with_slots(mut self, slots: u32) -> Self {
        self.slots = slots.max(1);
        self
    }

    pub fn with_env(mut self, env: Option<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_deploy(mut self, run_deploy: bool) -> Self {
        self.run_deploy = run_deploy;
        self
    }

    /// Move the job to `next`, stamping start/finish times.
    pub fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        match next {
            JobStatus::Starting => self.start_time = Some(now),
            JobStatus::Running => {
                self.start_time.get_or_insert(now);
            }
            _ if next.is_terminal() => self.finish_time = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Claim transition: `queued -> starting` onto `unit`.
    pub fn assign(&mut self, unit: UnitAssignment, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Starting, now)?;
        self.unit = Some(unit);
        Ok(())
    }

    /// Whether the job currently holds slots on a unit.
    pub fn holds_capacity(&self) -> bool {
        matches!(self.status, JobStatus::Starting | JobStatus::Running) && self.unit.is_some()
    }

    /// Seconds the job has been executing, `None` until it has started.
    pub fn duration_at(&self, now: DateTime<Utc>) -> Option<i64> {
        let start = self.start_time?;
        Some(whole_seconds(start, self.finish_time.unwrap_or(now)))
    }

    pub fn duration(&self) -> Option<i64> {
        self.duration_at(Utc::now())
    }

    /// Seconds between creation and entering `starting`; measured against
    /// `now` while the job is still queued. Never mutates the job.
    pub fn queue_time_at(&self, now: DateTime<Utc>) -> i64 {
        whole_seconds(self.created_at, self.start_time.unwrap_or(now))
    }

    pub fn queue_time(&self) -> i64 {
        self.queue_time_at(Utc::now())
    }
}

/// Whole seconds from `from` to `to`, clamped at zero for clock skew.
fn whole_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_seconds().max(0)
}

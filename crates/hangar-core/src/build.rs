//! Builds and build status aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job::{Job, JobStatus};
use crate::{Error, ResourceId, Result};

/// Derived status of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Queued,
    Running,
    Success,
    Failure,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive a build status from its job statuses.
///
/// A failed or errored job wins over everything, then in-flight work,
/// then queued work. Only successes and cancellations (or no jobs at all)
/// yield `success`.
pub fn aggregate_status<I>(statuses: I) -> BuildStatus
where
    I: IntoIterator<Item = JobStatus>,
{
    let mut in_flight = false;
    let mut queued = false;

    for status in statuses {
        match status {
            JobStatus::Failure | JobStatus::Error => return BuildStatus::Failure,
            JobStatus::Starting | JobStatus::Running => in_flight = true,
            JobStatus::Queued => queued = true,
            JobStatus::Success | JobStatus::Canceled => {}
        }
    }

    if in_flight {
        BuildStatus::Running
    } else if queued {
        BuildStatus::Queued
    } else {
        BuildStatus::Success
    }
}

/// The commit a build runs against (HEAD or merge commit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub branch: String,
    pub sha: String,
    pub author: String,
    pub url: String,
    pub tag: Option<String>,
}

/// Pull request that triggered a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub branch: String,
    pub slug: String,
    pub url: String,
}

/// A build and the jobs it owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: ResourceId,
    pub project_id: ResourceId,
    /// Sequence number within the project, starting at 1.
    pub number: u64,
    pub created_at: DateTime<Utc>,
    pub commit: Commit,
    pub pull_request: Option<PullRequest>,
    /// Encoded build-level environment blob.
    pub env: Option<String>,
    /// Jobs ordered by number.
    pub jobs: Vec<Job>,
}

impl Build {
    pub fn new(
        project_id: ResourceId,
        number: u64,
        commit: Commit,
        pull_request: Option<PullRequest>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            project_id,
            number,
            created_at,
            commit,
            pull_request,
            env: None,
            jobs: Vec::new(),
        }
    }

    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }

    /// Always recomputed from the jobs.
    pub fn status(&self) -> BuildStatus {
        aggregate_status(self.jobs.iter().map(|j| j.status))
    }

    /// Sum of the durations of every started job.
    pub fn duration_at(&self, now: DateTime<Utc>) -> i64 {
        self.jobs.iter().filter_map(|j| j.duration_at(now)).sum()
    }

    pub fn duration(&self) -> i64 {
        self.duration_at(Utc::now())
    }

    /// Earliest job start.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.jobs.iter().filter_map(|j| j.start_time).min()
    }

    /// Latest job finish, once every job is terminal.
    pub fn finish_time(&self) -> Option<DateTime<Utc>> {
        if self.jobs.is_empty() || !self.jobs.iter().all(|j| j.status.is_terminal()) {
            return None;
        }
        self.jobs.iter().filter_map(|j| j.finish_time).max()
    }

    pub fn deploy_job(&self) -> Option<&Job> {
        self.jobs.iter().find(|j| j.run_deploy)
    }

    /// Check structural invariants before the build is persisted.
    pub fn validate(&self) -> Result<()> {
        let deploy_jobs = self.jobs.iter().filter(|j| j.run_deploy).count();
        if deploy_jobs > 1 {
            return Err(Error::InvalidInput(format!(
                "build {} has {} deploy jobs, at most one allowed",
                self.number, deploy_jobs
            )));
        }

        for pair in self.jobs.windows(2) {
            if pair[0].number >= pair[1].number {
                return Err(Error::InvalidInput(format!(
                    "build {} job numbers must be strictly ascending",
                    self.number
                )));
            }
        }

        if let Some(job) = self.jobs.iter().find(|j| j.build_id != self.id) {
            return Err(Error::InvalidInput(format!(
                "job {} does not belong to build {}",
                job.id, self.id
            )));
        }

        Ok(())
    }
}

//! Read-model snapshots consumed by the REST layer.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::build::{Build, BuildStatus, Commit, PullRequest};
use crate::job::{Job, JobStatus, UnitAssignment};
use crate::project::{Project, SourceHost};
use crate::ResourceId;

/// ISO-8601 UTC timestamps with second precision and a `Z` suffix.
mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::Serializer;

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => serializer.serialize_str(&dt.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: ResourceId,
    pub number: u32,
    pub status: JobStatus,
    #[serde(with = "timestamp")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(with = "timestamp")]
    pub finish_time: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub slots: u32,
    pub unit: Option<UnitAssignment>,
}

impl JobSnapshot {
    pub fn at(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            id: job.id,
            number: job.number,
            status: job.status,
            start_time: job.start_time,
            finish_time: job.finish_time,
            duration: job.duration_at(now),
            slots: job.slots,
            unit: job.unit.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildSnapshot {
    pub id: ResourceId,
    pub number: u64,
    pub duration: i64,
    #[serde(with = "timestamp")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(with = "timestamp")]
    pub finish_time: Option<DateTime<Utc>>,
    pub status: BuildStatus,
    pub commit: Commit,
    pub pull_request: Option<PullRequest>,
    pub jobs: Vec<JobSnapshot>,
}

impl BuildSnapshot {
    pub fn at(build: &Build, now: DateTime<Utc>) -> Self {
        let mut jobs: Vec<JobSnapshot> = build.jobs.iter().map(|j| JobSnapshot::at(j, now)).collect();
        jobs.sort_by_key(|j| j.number);

        Self {
            id: build.id,
            number: build.number,
            duration: build.duration_at(now),
            start_time: build.start_time(),
            finish_time: build.finish_time(),
            status: build.status(),
            commit: build.commit.clone(),
            pull_request: build.pull_request.clone(),
            jobs,
        }
    }
}

/// Summary of a project's most recent build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub id: ResourceId,
    pub number: u64,
    pub status: BuildStatus,
    pub duration: i64,
    #[serde(with = "timestamp")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(with = "timestamp")]
    pub finish_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectSnapshot {
    pub id: ResourceId,
    pub owner: String,
    pub name: String,
    pub slug: String,
    pub host: SourceHost,
    pub remote_id: i64,
    pub remote_url: String,
    pub default_branch: String,
    pub private: bool,
    pub active: bool,
    pub latest_build: Option<BuildSummary>,
}

impl ProjectSnapshot {
    pub fn at(project: &Project, latest: Option<&Build>, now: DateTime<Utc>) -> Self {
        Self {
            id: project.id,
            owner: project.owner.clone(),
            name: project.name.clone(),
            slug: project.slug(),
            host: project.host,
            remote_id: project.remote_id,
            remote_url: project.remote_url(),
            default_branch: project.default_branch.clone(),
            private: project.private,
            active: project.active,
            latest_build: latest.map(|build| BuildSummary {
                id: build.id,
                number: build.number,
                status: build.status(),
                duration: build.duration_at(now),
                start_time: build.start_time(),
                finish_time: build.finish_time(),
            }),
        }
    }
}

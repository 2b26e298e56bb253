//! In-memory store.
//!
//! Implements every repository trait over a single lock-protected state.
//! Used by tests and by `hangar serve` when no database URL is configured;
//! nothing survives a restart.

use std::collections::HashMap;

use async_trait::async_trait;
use hangar_core::ResourceId;
use hangar_core::build::Build;
use hangar_core::credential::{CredentialKey, CredentialStore};
use hangar_core::job::{Job, JobStatus};
use hangar_core::project::{Project, SourceHost};
use hangar_core::query::BuildQuery;
use tokio::sync::RwLock;

use crate::repo::{BuildRepo, JobRepo, ProjectRepo};
use crate::{DbError, DbResult};

#[derive(Debug, Default)]
struct State {
    projects: HashMap<ResourceId, Project>,
    /// Builds are stored without jobs; jobs live in `jobs`.
    builds: HashMap<ResourceId, Build>,
    jobs: HashMap<ResourceId, Job>,
    credentials: HashMap<CredentialKey, String>,
}

impl State {
    fn assemble(&self, build: &Build) -> Build {
        let mut build = build.clone();
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|j| j.build_id == build.id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.number);
        build.jobs = jobs;
        build
    }

    fn project_builds(&self, project_id: ResourceId) -> Vec<Build> {
        let mut builds: Vec<Build> = self
            .builds
            .values()
            .filter(|b| b.project_id == project_id)
            .map(|b| self.assemble(b))
            .collect();
        builds.sort_by(|a, b| b.number.cmp(&a.number));
        builds
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectRepo for MemoryStore {
    async fn create_project(&self, project: &Project) -> DbResult<()> {
        let mut state = self.state.write().await;
        let taken = state
            .projects
            .values()
            .any(|p| p.id == project.id || (p.host == project.host && p.remote_id == project.remote_id));
        if taken {
            return Err(DbError::Duplicate(format!("project {}", project.slug())));
        }
        state.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn get_project(&self, id: ResourceId) -> DbResult<Project> {
        self.state
            .read()
            .await
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("project {}", id)))
    }

    async fn get_project_by_remote(&self, host: SourceHost, remote_id: i64) -> DbResult<Project> {
        self.state
            .read()
            .await
            .projects
            .values()
            .find(|p| p.host == host && p.remote_id == remote_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("project {}:{}", host, remote_id)))
    }

    async fn update_project(&self, project: &Project) -> DbResult<()> {
        let mut state = self.state.write().await;
        let stored = state
            .projects
            .get_mut(&project.id)
            .ok_or_else(|| DbError::NotFound(format!("project {}", project.id)))?;
        *stored = Project {
            account_id: stored.account_id,
            host: stored.host,
            remote_id: stored.remote_id,
            ..project.clone()
        };
        Ok(())
    }

    async fn list_projects(&self) -> DbResult<Vec<Project>> {
        let mut projects: Vec<Project> = self.state.read().await.projects.values().cloned().collect();
        projects.sort_by(|a, b| (&a.owner, &a.name).cmp(&(&b.owner, &b.name)));
        Ok(projects)
    }
}

#[async_trait]
impl BuildRepo for MemoryStore {
    async fn create_build(&self, build: &Build) -> DbResult<()> {
        let mut state = self.state.write().await;
        let taken = state
            .builds
            .values()
            .any(|b| b.id == build.id || (b.project_id == build.project_id && b.number == build.number));
        if taken {
            return Err(DbError::Duplicate(format!(
                "build #{} of project {}",
                build.number, build.project_id
            )));
        }
        if let Some(job) = build.jobs.iter().find(|j| state.jobs.contains_key(&j.id)) {
            return Err(DbError::Duplicate(format!("job {}", job.id)));
        }

        for job in &build.jobs {
            state.jobs.insert(job.id, job.clone());
        }
        let mut stored = build.clone();
        stored.jobs.clear();
        state.builds.insert(stored.id, stored);
        Ok(())
    }

    async fn get_build(&self, id: ResourceId) -> DbResult<Build> {
        let state = self.state.read().await;
        state
            .builds
            .get(&id)
            .map(|b| state.assemble(b))
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    async fn get_build_by_number(&self, project_id: ResourceId, number: u64) -> DbResult<Build> {
        let state = self.state.read().await;
        state
            .builds
            .values()
            .find(|b| b.project_id == project_id && b.number == number)
            .map(|b| state.assemble(b))
            .ok_or_else(|| DbError::NotFound(format!("build #{} of project {}", number, project_id)))
    }

    async fn list_builds(&self, project_id: ResourceId, query: &BuildQuery) -> DbResult<Vec<Build>> {
        let state = self.state.read().await;
        let offset = usize::try_from(query.offset()).unwrap_or(usize::MAX);
        Ok(state
            .project_builds(project_id)
            .into_iter()
            .filter(|b| query.matches(b))
            .skip(offset)
            .take(query.count as usize)
            .collect())
    }

    async fn next_build_number(&self, project_id: ResourceId) -> DbResult<u64> {
        let state = self.state.read().await;
        let max = state
            .builds
            .values()
            .filter(|b| b.project_id == project_id)
            .map(|b| b.number)
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    async fn latest_build(&self, project_id: ResourceId) -> DbResult<Option<Build>> {
        Ok(self
            .state
            .read()
            .await
            .project_builds(project_id)
            .into_iter()
            .next())
    }
}

#[async_trait]
impl JobRepo for MemoryStore {
    async fn get_job(&self, id: ResourceId) -> DbResult<Job> {
        self.state
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn queued_jobs(&self, max_slots: u32, limit: usize) -> DbResult<Vec<Job>> {
        let state = self.state.read().await;
        let mut queued: Vec<(&Build, &Job)> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && j.slots <= max_slots)
            .filter_map(|j| state.builds.get(&j.build_id).map(|b| (b, j)))
            .collect();
        queued.sort_by(|(ba, ja), (bb, jb)| {
            (ba.created_at, ba.number, ja.number).cmp(&(bb.created_at, bb.number, jb.number))
        });
        Ok(queued
            .into_iter()
            .take(limit)
            .map(|(_, j)| j.clone())
            .collect())
    }

    async fn active_jobs(&self) -> DbResult<Vec<Job>> {
        let state = self.state.read().await;
        let mut active: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Starting | JobStatus::Running))
            .cloned()
            .collect();
        active.sort_by_key(|j| j.created_at);
        Ok(active)
    }

    async fn compare_and_swap(&self, job: &Job, expected_version: u64) -> DbResult<Job> {
        let mut state = self.state.write().await;
        let stored = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", job.id)))?;
        if stored.version != expected_version {
            return Err(DbError::Conflict(format!(
                "job {} is at version {}, expected {}",
                job.id, stored.version, expected_version
            )));
        }

        let mut next = job.clone();
        next.build_id = stored.build_id;
        next.number = stored.number;
        next.created_at = stored.created_at;
        next.version = expected_version + 1;
        *stored = next.clone();
        Ok(next)
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn token(&self, key: &CredentialKey) -> Option<String> {
        self.state.read().await.credentials.get(key).cloned()
    }

    async fn set(&self, key: CredentialKey, token: String) {
        self.state.write().await.credentials.insert(key, token);
    }

    async fn invalidate(&self, key: &CredentialKey) {
        self.state.write().await.credentials.remove(key);
    }
}

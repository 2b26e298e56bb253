//! Build creation and the read side of builds and projects.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hangar_config::{BuildManifest, Environment, pack_env, resolve_env};
use hangar_core::ResourceId;
use hangar_core::build::{Build, Commit, PullRequest};
use hangar_core::host::SourceHostClient;
use hangar_core::job::Job;
use hangar_core::project::Project;
use hangar_core::query::BuildQuery;
use hangar_core::snapshot::{BuildSnapshot, ProjectSnapshot};
use hangar_db::{BuildRepo, DbError, JobRepo, ProjectRepo};
use tracing::{debug, info};

use crate::error::{SchedulerError, SchedulerResult};

/// Attempts at claiming a build number before giving up.
const MAX_NUMBER_ATTEMPTS: usize = 5;

pub struct BuildService {
    projects: Arc<dyn ProjectRepo>,
    builds: Arc<dyn BuildRepo>,
    jobs: Arc<dyn JobRepo>,
}

impl BuildService {
    pub fn new(
        projects: Arc<dyn ProjectRepo>,
        builds: Arc<dyn BuildRepo>,
        jobs: Arc<dyn JobRepo>,
    ) -> Self {
        Self {
            projects,
            builds,
            jobs,
        }
    }

    /// Create the next build of a project with one queued job per matrix entry.
    pub async fn create_build(
        &self,
        project_id: ResourceId,
        commit: Commit,
        pull_request: Option<PullRequest>,
        manifest: &BuildManifest,
    ) -> SchedulerResult<Build> {
        let project = self.projects.get_project(project_id).await?;
        let run_deploy = manifest
            .deploy_policy(&project)
            .should_deploy(&commit, pull_request.is_some());

        for attempt in 1..=MAX_NUMBER_ATTEMPTS {
            let number = self.builds.next_build_number(project_id).await?;
            let build = assemble(
                &project,
                number,
                commit.clone(),
                pull_request.clone(),
                manifest,
                run_deploy,
                Utc::now(),
            );
            build.validate()?;

            match self.builds.create_build(&build).await {
                Ok(()) => {
                    info!(
                        project = %project.slug(),
                        build = build.number,
                        jobs = build.jobs.len(),
                        run_deploy,
                        "build created"
                    );
                    return Ok(build);
                }
                Err(DbError::Duplicate(_)) => {
                    debug!(project = %project.slug(), number, attempt, "build number taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchedulerError::Contention(project_id))
    }

    pub async fn build_snapshot(&self, project_id: ResourceId, number: u64) -> SchedulerResult<BuildSnapshot> {
        let build = self.builds.get_build_by_number(project_id, number).await?;
        Ok(BuildSnapshot::at(&build, Utc::now()))
    }

    pub async fn project_snapshot(&self, project_id: ResourceId) -> SchedulerResult<ProjectSnapshot> {
        let project = self.projects.get_project(project_id).await?;
        let latest = self.builds.latest_build(project_id).await?;
        Ok(ProjectSnapshot::at(&project, latest.as_ref(), Utc::now()))
    }

    /// Builds of a project, newest first.
    pub async fn list_builds(
        &self,
        project_id: ResourceId,
        query: &BuildQuery,
    ) -> SchedulerResult<Vec<BuildSnapshot>> {
        self.projects.get_project(project_id).await?;
        let now = Utc::now();
        Ok(self
            .builds
            .list_builds(project_id, query)
            .await?
            .iter()
            .map(|build| BuildSnapshot::at(build, now))
            .collect())
    }

    /// The variables a job runs with.
    pub async fn job_environment(&self, job_id: ResourceId) -> SchedulerResult<Environment> {
        let job = self.jobs.get_job(job_id).await?;
        let build = self.builds.get_build(job.build_id).await?;
        let project = self.projects.get_project(build.project_id).await?;
        Ok(resolve_env(&project, &build, &job))
    }

    /// Refresh a project's metadata from its source host.
    pub async fn sync_project(
        &self,
        project_id: ResourceId,
        host: &dyn SourceHostClient,
    ) -> SchedulerResult<Project> {
        let mut project = self.projects.get_project(project_id).await?;
        let remote = host.sync_project(&project).await?;

        let changed = project.owner != remote.owner
            || project.name != remote.name
            || project.default_branch != remote.default_branch
            || project.private != remote.private;
        if changed {
            project.owner = remote.owner;
            project.name = remote.name;
            project.default_branch = remote.default_branch;
            project.private = remote.private;
            self.projects.update_project(&project).await?;
            info!(project = %project.slug(), "project metadata updated");
        }
        Ok(project)
    }

    /// Register a fresh webhook delivering to `callback_url` and mark the
    /// project active. A hook recorded earlier is removed first.
    pub async fn activate_project(
        &self,
        project_id: ResourceId,
        host: &dyn SourceHostClient,
        callback_url: &str,
    ) -> SchedulerResult<Project> {
        let mut project = self.projects.get_project(project_id).await?;
        if let Some(old) = project.webhook.clone() {
            if host.has_webhook(&project).await? {
                host.delete_webhook(&project, &old.id).await?;
            }
            project.detach_webhook();
        }

        let secret = uuid::Uuid::new_v4().simple().to_string();
        let hook = host.create_webhook(&project, callback_url, &secret).await?;
        project.attach_webhook(hook);
        self.projects.update_project(&project).await?;
        info!(project = %project.slug(), "project activated");
        Ok(project)
    }

    pub async fn deactivate_project(
        &self,
        project_id: ResourceId,
        host: &dyn SourceHostClient,
    ) -> SchedulerResult<Project> {
        let mut project = self.projects.get_project(project_id).await?;
        if let Some(hook) = &project.webhook {
            host.delete_webhook(&project, &hook.id).await?;
        }
        project.detach_webhook();
        self.projects.update_project(&project).await?;
        info!(project = %project.slug(), "project deactivated");
        Ok(project)
    }
}

fn encode(vars: &[(String, String)]) -> Option<String> {
    if vars.is_empty() {
        None
    } else {
        Some(pack_env(vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))))
    }
}

fn assemble(
    project: &Project,
    number: u64,
    commit: Commit,
    pull_request: Option<PullRequest>,
    manifest: &BuildManifest,
    run_deploy: bool,
    now: DateTime<Utc>,
) -> Build {
    let mut build = Build::new(project.id, number, commit, pull_request, now);
    build.env = encode(&manifest.env);
    build.jobs = manifest
        .jobs()
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            Job::new(build.id, index as u32 + 1, now)
                .with_slots(entry.slots)
                .with_env(encode(&entry.env))
                .with_deploy(run_deploy && index == 0)
        })
        .collect();
    build
}

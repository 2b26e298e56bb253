//! Pushes derived build statuses to source hosts as commit statuses.

use std::collections::HashMap;
use std::sync::Arc;

use hangar_core::ResourceId;
use hangar_core::host::{CommitState, HostError, SourceHostClient};
use hangar_db::{BuildRepo, ProjectRepo};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::events::SchedulerEvent;

pub struct StatusNotifier {
    projects: Arc<dyn ProjectRepo>,
    builds: Arc<dyn BuildRepo>,
    host: Arc<dyn SourceHostClient>,
    /// Base URL of the web UI, used for status links.
    public_url: String,
    /// Last state published per unfinished build.
    published: Mutex<HashMap<ResourceId, CommitState>>,
}

impl StatusNotifier {
    pub fn new(
        projects: Arc<dyn ProjectRepo>,
        builds: Arc<dyn BuildRepo>,
        host: Arc<dyn SourceHostClient>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            projects,
            builds,
            host,
            public_url: public_url.into().trim_end_matches('/').to_string(),
            published: Mutex::new(HashMap::new()),
        }
    }

    /// Publish the build's current state unless it was already published.
    /// Returns whether a status was sent.
    pub async fn handle(&self, event: &SchedulerEvent) -> SchedulerResult<bool> {
        let build = self.builds.get_build(event.build_id()).await?;
        let finished = build.finish_time().is_some();

        let Some(state) = CommitState::for_build(build.status()) else {
            return Ok(false);
        };
        if self.published.lock().get(&build.id) == Some(&state) {
            debug!(build = %build.id, ?state, "commit status unchanged");
            if finished {
                self.published.lock().remove(&build.id);
            }
            return Ok(false);
        }

        let project = self.projects.get_project(build.project_id).await?;
        let target_url = format!("{}/{}/builds/{}", self.public_url, project.slug(), build.number);
        self.host
            .update_commit_status(&project, &build.commit.sha, state, &target_url)
            .await?;
        info!(project = %project.slug(), build = build.number, ?state, "commit status published");

        let mut published = self.published.lock();
        if finished {
            published.remove(&build.id);
        } else {
            published.insert(build.id, state);
        }
        Ok(true)
    }

    /// Drain `events` until every sender is gone.
    pub async fn run(&self, mut events: mpsc::Receiver<SchedulerEvent>) {
        while let Some(event) = events.recv().await {
            match self.handle(&event).await {
                Ok(_) => {}
                Err(SchedulerError::Host(HostError::AuthExpired(account))) => {
                    warn!(account = %account, "host credential expired, commit status skipped");
                }
                Err(e) => warn!(build = %event.build_id(), error = %e, "failed to publish commit status"),
            }
        }
        debug!("status notifier stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHost, at, commit};
    use hangar_core::build::{Build, BuildStatus};
    use hangar_core::job::{Job, JobStatus, UnitAssignment};
    use hangar_core::project::{Project, SourceHost};
    use hangar_db::{JobRepo, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        host: Arc<FakeHost>,
        notifier: StatusNotifier,
        build: Build,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let host = Arc::new(FakeHost::new());
        let project = Project::new(ResourceId::new(), SourceHost::GitHub, "acme", "widgets", 7);
        store.create_project(&project).await.unwrap();

        let mut build = Build::new(project.id, 12, commit("main"), None, at(0));
        build.jobs = vec![Job::new(build.id, 1, at(0)), Job::new(build.id, 2, at(0))];
        store.create_build(&build).await.unwrap();

        let notifier = StatusNotifier::new(
            store.clone(),
            store.clone(),
            host.clone(),
            "https://ci.example.com/",
        );
        Fixture {
            store,
            host,
            notifier,
            build,
        }
    }

    async fn move_job(store: &MemoryStore, job_id: ResourceId, to: JobStatus) {
        let current = store.get_job(job_id).await.unwrap();
        let mut next = current.clone();
        if to == JobStatus::Starting {
            next.assign(
                UnitAssignment {
                    id: "srv-1".into(),
                    instance_class: "DEV1-S".to_string(),
                },
                at(1),
            )
            .unwrap();
        } else {
            next.transition(to, at(2)).unwrap();
        }
        store.compare_and_swap(&next, current.version).await.unwrap();
    }

    fn event(build: &Build, to: JobStatus, build_status: BuildStatus) -> SchedulerEvent {
        SchedulerEvent::JobTransitioned {
            job_id: build.jobs[0].id,
            build_id: build.id,
            from: JobStatus::Queued,
            to,
            build_status,
        }
    }

    #[tokio::test]
    async fn test_queued_build_reports_nothing() {
        let f = fixture().await;
        let sent = f
            .notifier
            .handle(&event(&f.build, JobStatus::Queued, BuildStatus::Queued))
            .await
            .unwrap();
        assert!(!sent);
        assert!(f.host.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_states_are_deduplicated() {
        let f = fixture().await;
        let [first, second] = [f.build.jobs[0].id, f.build.jobs[1].id];

        move_job(&f.store, first, JobStatus::Starting).await;
        assert!(f.notifier.handle(&event(&f.build, JobStatus::Starting, BuildStatus::Running)).await.unwrap());

        move_job(&f.store, first, JobStatus::Running).await;
        assert!(!f.notifier.handle(&event(&f.build, JobStatus::Running, BuildStatus::Running)).await.unwrap());

        move_job(&f.store, first, JobStatus::Success).await;
        move_job(&f.store, second, JobStatus::Canceled).await;
        assert!(f.notifier.handle(&event(&f.build, JobStatus::Canceled, BuildStatus::Success)).await.unwrap());

        let statuses = f.host.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].1, CommitState::Pending);
        assert_eq!(statuses[1].1, CommitState::Success);
        assert_eq!(statuses[1].0, f.build.commit.sha);
        assert_eq!(statuses[1].2, "https://ci.example.com/acme/widgets/builds/12");
        assert!(f.notifier.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let f = fixture().await;
        move_job(&f.store, f.build.jobs[0].id, JobStatus::Starting).await;
        move_job(&f.store, f.build.jobs[0].id, JobStatus::Failure).await;

        let (tx, rx) = mpsc::channel(4);
        tx.send(event(&f.build, JobStatus::Failure, BuildStatus::Failure)).await.unwrap();
        drop(tx);
        f.notifier.run(rx).await;

        assert_eq!(f.host.statuses()[0].1, CommitState::Failure);
    }
}

//! Status reports from workers and operators.
//!
//! These commands write through the same version check the daemon uses; the
//! daemon reconciles its slot reservations on its next refresh.

use anyhow::Result;
use hangar_core::ResourceId;
use hangar_core::job::{Job, JobStatus};
use hangar_scheduler::JobScheduler;

use super::{Stores, persistent_stores};

fn scheduler(stores: &Stores) -> JobScheduler {
    JobScheduler::new(stores.jobs.clone(), stores.builds.clone(), Vec::new(), 1)
}

fn report(job: &Job) {
    println!("job {} is now {}", job.id, job.status);
}

pub async fn start(database_url: Option<&str>, id: ResourceId) -> Result<()> {
    let stores = persistent_stores(database_url).await?;
    report(&scheduler(&stores).mark_running(id).await?);
    Ok(())
}

pub async fn finish(database_url: Option<&str>, id: ResourceId, status: JobStatus) -> Result<()> {
    let stores = persistent_stores(database_url).await?;
    report(&scheduler(&stores).complete(id, status).await?);
    Ok(())
}

pub async fn cancel(database_url: Option<&str>, id: ResourceId) -> Result<()> {
    let stores = persistent_stores(database_url).await?;
    report(&scheduler(&stores).cancel(id).await?);
    Ok(())
}

pub async fn env(database_url: Option<&str>, id: ResourceId) -> Result<()> {
    let stores = persistent_stores(database_url).await?;
    for (key, value) in stores.build_service().job_environment(id).await? {
        println!("{}={}", key, value);
    }
    Ok(())
}

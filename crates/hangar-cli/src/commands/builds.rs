//! Build creation and listing.

use std::path::PathBuf;

use anyhow::{Context, Result};
use hangar_config::{BuildManifest, parse_manifest};
use hangar_core::ResourceId;
use hangar_core::build::{Commit, PullRequest};
use hangar_core::query::BuildQuery;

use super::{persistent_stores, print_json};

pub struct NewBuild {
    pub project: ResourceId,
    pub branch: String,
    pub sha: String,
    pub author: String,
    pub tag: Option<String>,
    pub pull_request: Option<u64>,
    pub pr_branch: Option<String>,
    pub manifest: Option<PathBuf>,
}

fn read_manifest(path: Option<&PathBuf>) -> Result<BuildManifest> {
    let Some(path) = path else {
        return Ok(BuildManifest::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
    parse_manifest(&content).with_context(|| format!("Invalid manifest: {}", path.display()))
}

pub async fn create(database_url: Option<&str>, new: NewBuild) -> Result<()> {
    let manifest = read_manifest(new.manifest.as_ref())?;
    let stores = persistent_stores(database_url).await?;
    let project = stores.projects.get_project(new.project).await?;
    let remote_url = project.remote_url();

    let commit = Commit {
        url: format!("{}/commit/{}", remote_url, new.sha),
        branch: new.branch.clone(),
        sha: new.sha,
        author: new.author,
        tag: new.tag,
    };
    let pull_request = new.pull_request.map(|number| PullRequest {
        number,
        branch: new.pr_branch.unwrap_or_else(|| new.branch.clone()),
        slug: project.slug(),
        url: format!("{}/pull/{}", remote_url, number),
    });

    let service = stores.build_service();
    let build = service
        .create_build(project.id, commit, pull_request, &manifest)
        .await?;
    print_json(&service.build_snapshot(project.id, build.number).await?)
}

pub async fn list(database_url: Option<&str>, project: ResourceId, query: &BuildQuery) -> Result<()> {
    let stores = persistent_stores(database_url).await?;
    let builds = stores.build_service().list_builds(project, query).await?;
    if builds.is_empty() {
        println!("No builds found");
        return Ok(());
    }
    print_json(&builds)
}

pub async fn show(database_url: Option<&str>, project: ResourceId, number: u64) -> Result<()> {
    let stores = persistent_stores(database_url).await?;
    print_json(&stores.build_service().build_snapshot(project, number).await?)
}

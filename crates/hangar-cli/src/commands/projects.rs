//! Project registration and host sync.

use std::path::Path;

use anyhow::{Context, Result};
use hangar_config::pack_env;
use hangar_core::ResourceId;
use hangar_core::credential::CredentialKey;
use hangar_core::project::{DeployOn, Project, SourceHost};
use hangar_provider::HostClient;

use super::{load_config, persistent_stores, print_json};

pub struct NewProject {
    pub host: SourceHost,
    pub owner: String,
    pub name: String,
    pub remote_id: i64,
    pub account: Option<ResourceId>,
    pub deploy_on: DeployOn,
    pub deploy_branch: String,
    pub secrets: Vec<String>,
}

fn parse_secrets(secrets: &[String]) -> Result<Vec<(&str, &str)>> {
    secrets
        .iter()
        .map(|s| {
            s.split_once('=')
                .filter(|(k, _)| !k.is_empty())
                .with_context(|| format!("secret must look like KEY=VALUE: {}", s))
        })
        .collect()
}

pub async fn add(database_url: Option<&str>, new: NewProject) -> Result<()> {
    let stores = persistent_stores(database_url).await?;

    let mut project = Project::new(
        new.account.unwrap_or_default(),
        new.host,
        new.owner,
        new.name,
        new.remote_id,
    );
    project.deploy_on = new.deploy_on;
    project.deploy_branch = new.deploy_branch;
    let secrets = parse_secrets(&new.secrets)?;
    if !secrets.is_empty() {
        project.secret_env = Some(pack_env(secrets));
    }

    stores.projects.create_project(&project).await?;
    println!("Created project {} ({})", project.slug(), project.id);
    print_json(&stores.build_service().project_snapshot(project.id).await?)
}

pub async fn show(database_url: Option<&str>, id: ResourceId) -> Result<()> {
    let stores = persistent_stores(database_url).await?;
    print_json(&stores.build_service().project_snapshot(id).await?)
}

pub async fn sync(
    config_path: &Path,
    database_url: Option<&str>,
    id: ResourceId,
    token: Option<String>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let stores = persistent_stores(database_url).await?;

    if let Some(token) = token {
        let project = stores.projects.get_project(id).await?;
        stores
            .credentials
            .set(
                CredentialKey::Host(project.account_id, project.host.tag().to_string()),
                token,
            )
            .await;
    }

    let host = HostClient::new(config.hosts, stores.credentials.clone());
    let project = stores.build_service().sync_project(id, &host).await?;
    println!("Synced {} (default branch {})", project.slug(), project.default_branch);
    Ok(())
}

/// Where the host delivers push events for `host` projects.
fn webhook_url(public_url: &str, host: SourceHost) -> String {
    format!("{}/hooks/{}", public_url.trim_end_matches('/'), host.tag())
}

pub async fn activate(config_path: &Path, database_url: Option<&str>, id: ResourceId) -> Result<()> {
    let config = load_config(config_path)?;
    let stores = persistent_stores(database_url).await?;
    let service = stores.build_service();
    let project = stores.projects.get_project(id).await?;

    let host = HostClient::new(config.hosts.clone(), stores.credentials.clone());
    let callback = webhook_url(config.hosts.public_url.as_str(), project.host);
    let project = service.activate_project(id, &host, &callback).await?;
    println!("Activated {} (webhook to {})", project.slug(), callback);
    Ok(())
}

pub async fn deactivate(config_path: &Path, database_url: Option<&str>, id: ResourceId) -> Result<()> {
    let config = load_config(config_path)?;
    let stores = persistent_stores(database_url).await?;

    let host = HostClient::new(config.hosts, stores.credentials.clone());
    let project = stores.build_service().deactivate_project(id, &host).await?;
    println!("Deactivated {}", project.slug());
    Ok(())
}

//! CLI command implementations.

pub mod builds;
pub mod jobs;
pub mod pools;
pub mod projects;
pub mod serve;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use hangar_config::{SystemConfig, load_system_config, parse_manifest};
use hangar_core::capacity::CapacityProvider;
use hangar_core::credential::{CredentialKey, CredentialStore};
use hangar_db::{
    BuildRepo, JobRepo, MemoryStore, PgBuildRepo, PgCredentialStore, PgJobRepo, PgProjectRepo,
    ProjectRepo, create_pool, run_migrations,
};
use hangar_provider::build_provider;
use hangar_scheduler::{BuildService, PoolManager, RetryPolicy};
use serde::Serialize;
use tracing::{info, warn};

/// Repositories behind one backend.
#[derive(Clone)]
pub struct Stores {
    pub projects: Arc<dyn ProjectRepo>,
    pub builds: Arc<dyn BuildRepo>,
    pub jobs: Arc<dyn JobRepo>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl Stores {
    /// Connect to PostgreSQL and migrate, or fall back to memory.
    pub async fn connect(database_url: Option<&str>) -> Result<Self> {
        let Some(url) = database_url else {
            warn!("no database configured, state will not survive a restart");
            let store = Arc::new(MemoryStore::new());
            return Ok(Self {
                projects: store.clone(),
                builds: store.clone(),
                jobs: store.clone(),
                credentials: store,
            });
        };

        info!("Connecting to database...");
        let pool = create_pool(url).await.context("Failed to connect to database")?;
        run_migrations(&pool).await.context("Failed to run migrations")?;
        info!("Database connected");

        Ok(Self {
            projects: Arc::new(PgProjectRepo::new(pool.clone())),
            builds: Arc::new(PgBuildRepo::new(pool.clone())),
            jobs: Arc::new(PgJobRepo::new(pool.clone())),
            credentials: Arc::new(PgCredentialStore::new(pool)),
        })
    }

    pub fn build_service(&self) -> BuildService {
        BuildService::new(self.projects.clone(), self.builds.clone(), self.jobs.clone())
    }
}

/// Commands that only make sense against a persistent store.
pub async fn persistent_stores(database_url: Option<&str>) -> Result<Stores> {
    if database_url.is_none() {
        anyhow::bail!("this command needs --database-url or DATABASE_URL");
    }
    Stores::connect(database_url).await
}

pub fn load_config(path: &Path) -> Result<SystemConfig> {
    load_system_config(path)
        .with_context(|| format!("Failed to load configuration: {}", path.display()))
}

/// Copy provider API tokens from the environment into the credential store.
pub async fn load_provider_tokens(config: &SystemConfig, credentials: &dyn CredentialStore) {
    for provider in &config.providers {
        match std::env::var(&provider.token_env) {
            Ok(token) if !token.is_empty() => {
                credentials
                    .set(CredentialKey::Provider(provider.name.clone()), token)
                    .await;
            }
            _ => warn!(
                provider = %provider.name,
                env = %provider.token_env,
                "provider token not set, calls will fail until it is"
            ),
        }
    }
}

/// One manager per configured pool class.
pub fn build_pools(
    config: &SystemConfig,
    credentials: Arc<dyn CredentialStore>,
) -> Result<Vec<Arc<PoolManager>>> {
    let providers: HashMap<&str, Arc<dyn CapacityProvider>> = config
        .providers
        .iter()
        .map(|p| (p.name.as_str(), build_provider(p, credentials.clone())))
        .collect();
    let retry = RetryPolicy::from(&config.retry);

    config
        .pools
        .iter()
        .map(|class| {
            let provider = providers
                .get(class.provider.as_str())
                .cloned()
                .with_context(|| format!("pool {} names unknown provider {}", class.name, class.provider))?;
            Ok(Arc::new(PoolManager::new(class.clone(), provider, retry.clone())))
        })
        .collect()
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn validate(config_path: &Path, manifests: &[PathBuf]) -> Result<()> {
    let config = load_config(config_path)?;
    println!("Configuration is valid");
    println!("Providers: {}", config.providers.len());
    for pool in &config.pools {
        println!(
            "  {} ({} on {}): {} slots/unit, up to {} units, {:.4}/slot-hour",
            pool.name,
            pool.instance_class,
            pool.provider,
            pool.unit_size,
            pool.max_pools,
            pool.cost_per_slot()
        );
    }

    let mut failed = false;
    for path in manifests {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        match parse_manifest(&content) {
            Ok(manifest) => println!("{}: {} job(s)", path.display(), manifest.jobs().len()),
            Err(e) => {
                println!("{}: {}", path.display(), e);
                failed = true;
            }
        }
    }
    if failed {
        anyhow::bail!("one or more manifests are invalid");
    }
    Ok(())
}

//! System configuration parsing.
//!
//! ```kdl
//! scheduler {
//!     tick-interval "5s"
//!     refresh-every 12
//!     scale-down-window "5m"
//!     claim-batch 100
//! }
//! retry max-attempts=5 base-delay="500ms" max-delay="30s"
//! provider "scaleway-par1" kind="scaleway" {
//!     region "par1"
//!     organization "org-id"
//!     image "c1d407de-0d4c-462c-95df-42a2fe0479fe"
//!     token-env "SCALEWAY_API_TOKEN"
//! }
//! pool "scaleway-c2m" provider="scaleway-par1" class="C2M" unit-size=8 hourly-cost=0.048 max-pools=4
//! hosts {
//!     github-api "https://api.github.com"
//!     public-url "https://ci.example.com"
//! }
//! ```

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

use crate::nodes::{
    duration_setting, f64_setting, get_first_string_arg, get_string_prop, invalid, string_setting,
    u32_setting,
};
use crate::{ConfigError, ConfigResult};

/// System-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub providers: Vec<ProviderConfig>,
    pub pools: Vec<PoolClass>,
    pub hosts: HostEndpoints,
}

impl SystemConfig {
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

/// Control loop timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Pause between control loop ticks.
    pub tick_interval: Duration,
    /// Reconcile pools with the provider every N ticks.
    pub refresh_every: u32,
    /// How long surplus capacity must persist before a unit is released.
    pub scale_down_window: Duration,
    /// Maximum queued jobs considered per tick.
    pub claim_batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            refresh_every: 12,
            scale_down_window: Duration::from_secs(300),
            claim_batch: 100,
        }
    }
}

/// Exponential backoff for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Scaleway,
}

/// One cloud provider account and region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub region: String,
    pub organization: String,
    /// Image servers boot from.
    pub image: String,
    /// Environment variable holding the API token.
    pub token_env: String,
    /// Tag marking servers owned by Hangar.
    pub tag: String,
    /// Overrides the vendor API endpoint.
    pub api_url: Option<Url>,
}

/// An instance class with its own cap, size and price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolClass {
    pub name: String,
    pub provider: String,
    pub instance_class: String,
    /// Job slots per unit.
    pub unit_size: u32,
    pub hourly_cost: f64,
    pub max_pools: u32,
}

impl PoolClass {
    pub fn cost_per_slot(&self) -> f64 {
        self.hourly_cost / self.unit_size as f64
    }

    /// Hard cap on slots this class may ever hold.
    pub fn max_slots(&self) -> u32 {
        self.max_pools * self.unit_size
    }
}

/// Source-host API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEndpoints {
    pub github_api: Url,
    pub gitlab_api: Url,
    pub bitbucket_api: Url,
    /// Where Hangar's own build pages live; commit statuses link here.
    pub public_url: Url,
}

impl Default for HostEndpoints {
    fn default() -> Self {
        Self {
            github_api: Url::parse("https://api.github.com").expect("static url"),
            gitlab_api: Url::parse("https://gitlab.com/api/v4").expect("static url"),
            bitbucket_api: Url::parse("https://api.bitbucket.org").expect("static url"),
            public_url: Url::parse("http://localhost:8080").expect("static url"),
        }
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut scheduler = SchedulerConfig::default();
    let mut retry = RetryConfig::default();
    let mut providers = Vec::new();
    let mut pools = Vec::new();
    let mut hosts = HostEndpoints::default();

    for node in doc.nodes() {
        match node.name().value() {
            "scheduler" => scheduler = parse_scheduler(node)?,
            "retry" => retry = parse_retry(node)?,
            "provider" => providers.push(parse_provider(node)?),
            "pool" => pools.push(parse_pool(node)?),
            "hosts" => hosts = parse_hosts(node)?,
            _ => {} // Ignore unknown nodes
        }
    }

    let mut seen = HashSet::new();
    for provider in &providers {
        if !seen.insert(provider.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("provider '{}'", provider.name)));
        }
    }

    let mut seen = HashSet::new();
    for pool in &pools {
        if !seen.insert(pool.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("pool '{}'", pool.name)));
        }
        if !providers.iter().any(|p| p.name == pool.provider) {
            return Err(ConfigError::InvalidReference(format!(
                "pool '{}' uses unknown provider '{}'",
                pool.name, pool.provider
            )));
        }
    }

    Ok(SystemConfig {
        scheduler,
        retry,
        providers,
        pools,
        hosts,
    })
}

/// Read and parse a system configuration file.
pub fn load_system_config(path: &std::path::Path) -> ConfigResult<SystemConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_system_config(&content)
}

fn parse_scheduler(node: &KdlNode) -> ConfigResult<SchedulerConfig> {
    let defaults = SchedulerConfig::default();
    let config = SchedulerConfig {
        tick_interval: duration_setting(node, "tick-interval")?.unwrap_or(defaults.tick_interval),
        refresh_every: u32_setting(node, "refresh-every")?.unwrap_or(defaults.refresh_every),
        scale_down_window: duration_setting(node, "scale-down-window")?
            .unwrap_or(defaults.scale_down_window),
        claim_batch: u32_setting(node, "claim-batch")?
            .map(|n| n as usize)
            .unwrap_or(defaults.claim_batch),
    };

    if config.tick_interval.is_zero() {
        return Err(invalid("tick-interval", "must be greater than zero"));
    }
    if config.refresh_every == 0 {
        return Err(invalid("refresh-every", "must be at least 1"));
    }
    Ok(config)
}

fn parse_retry(node: &KdlNode) -> ConfigResult<RetryConfig> {
    let defaults = RetryConfig::default();
    let config = RetryConfig {
        max_attempts: u32_setting(node, "max-attempts")?.unwrap_or(defaults.max_attempts),
        base_delay: duration_setting(node, "base-delay")?.unwrap_or(defaults.base_delay),
        max_delay: duration_setting(node, "max-delay")?.unwrap_or(defaults.max_delay),
    };

    if config.max_attempts == 0 {
        return Err(invalid("max-attempts", "must be at least 1"));
    }
    Ok(config)
}

fn parse_provider(node: &KdlNode) -> ConfigResult<ProviderConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("provider name".to_string()))?;

    let kind = match get_string_prop(node, "kind").as_deref() {
        Some("scaleway") | None => ProviderKind::Scaleway,
        Some(other) => {
            return Err(invalid("provider kind", &format!("unknown provider kind: {}", other)));
        }
    };

    let required = |field: &str| -> ConfigResult<String> {
        string_setting(node, field)?
            .ok_or_else(|| ConfigError::MissingField(format!("{} for provider '{}'", field, name)))
    };

    let api_url = string_setting(node, "api-url")?
        .map(|raw| Url::parse(&raw).map_err(|e| invalid("api-url", &e.to_string())))
        .transpose()?;

    Ok(ProviderConfig {
        kind,
        region: required("region")?,
        organization: required("organization")?,
        image: required("image")?,
        token_env: string_setting(node, "token-env")?
            .unwrap_or_else(|| "SCALEWAY_API_TOKEN".to_string()),
        tag: string_setting(node, "tag")?.unwrap_or_else(|| "hangar".to_string()),
        api_url,
        name,
    })
}

fn parse_pool(node: &KdlNode) -> ConfigResult<PoolClass> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("pool name".to_string()))?;

    let provider = string_setting(node, "provider")?
        .ok_or_else(|| ConfigError::MissingField(format!("provider for pool '{}'", name)))?;
    let instance_class = string_setting(node, "class")?
        .ok_or_else(|| ConfigError::MissingField(format!("class for pool '{}'", name)))?;
    let unit_size = u32_setting(node, "unit-size")?
        .ok_or_else(|| ConfigError::MissingField(format!("unit-size for pool '{}'", name)))?;
    let hourly_cost = f64_setting(node, "hourly-cost")?
        .ok_or_else(|| ConfigError::MissingField(format!("hourly-cost for pool '{}'", name)))?;
    let max_pools = u32_setting(node, "max-pools")?
        .ok_or_else(|| ConfigError::MissingField(format!("max-pools for pool '{}'", name)))?;

    if unit_size == 0 {
        return Err(invalid("unit-size", "must be at least 1"));
    }
    if !hourly_cost.is_finite() || hourly_cost < 0.0 {
        return Err(invalid("hourly-cost", "must be a non-negative number"));
    }

    Ok(PoolClass {
        name,
        provider,
        instance_class,
        unit_size,
        hourly_cost,
        max_pools,
    })
}

fn parse_hosts(node: &KdlNode) -> ConfigResult<HostEndpoints> {
    let defaults = HostEndpoints::default();
    let url = |field: &str, default: Url| -> ConfigResult<Url> {
        match string_setting(node, field)? {
            Some(raw) => Url::parse(&raw).map_err(|e| invalid(field, &e.to_string())),
            None => Ok(default),
        }
    };

    Ok(HostEndpoints {
        github_api: url("github-api", defaults.github_api)?,
        gitlab_api: url("gitlab-api", defaults.gitlab_api)?,
        bitbucket_api: url("bitbucket-api", defaults.bitbucket_api)?,
        public_url: url("public-url", defaults.public_url)?,
    })
}

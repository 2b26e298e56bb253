//! KDL configuration parsing for Hangar.
//!
//! This crate handles parsing of:
//! - System configuration (providers, worker pools, scheduler tuning)
//! - Build manifests (environment, job matrix, deploy policy)
//! - Encoded job environments

pub mod environment;
pub mod error;
pub mod manifest;
mod nodes;
pub mod system;

pub use environment::{Environment, pack_env, resolve_env, unpack_env};
pub use error::{ConfigError, ConfigResult};
pub use manifest::{BuildManifest, DeployPolicy, MatrixEntry, parse_manifest};
pub use system::{
    HostEndpoints, PoolClass, ProviderConfig, ProviderKind, RetryConfig, SchedulerConfig,
    SystemConfig, load_system_config, parse_system_config,
};

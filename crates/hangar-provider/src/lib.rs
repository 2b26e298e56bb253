//! External service adapters for Hangar.
//!
//! - Cloud capacity providers (Scaleway)
//! - Source hosts (GitHub, GitLab, Bitbucket) for commit statuses and
//!   repository metadata

pub mod hosts;
pub mod scaleway;

use std::sync::Arc;

use hangar_config::{ProviderConfig, ProviderKind};
use hangar_core::capacity::CapacityProvider;
use hangar_core::credential::CredentialStore;

pub use hosts::HostClient;
pub use scaleway::ScalewayClient;

/// Build the capacity provider described by `config`.
pub fn build_provider(
    config: &ProviderConfig,
    credentials: Arc<dyn CredentialStore>,
) -> Arc<dyn CapacityProvider> {
    match config.kind {
        ProviderKind::Scaleway => Arc::new(ScalewayClient::new(config.clone(), credentials)),
    }
}

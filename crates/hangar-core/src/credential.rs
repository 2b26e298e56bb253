//! Credential storage abstraction.
//!
//! Provider API tokens and source-host access tokens live behind this trait.
//! A rejected credential is invalidated rather than retried, and callers
//! fail fast until someone stores a new one.

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Identifies one stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum CredentialKey {
    /// A cloud provider account, by configured provider name.
    #[display("provider:{_0}")]
    Provider(String),
    /// An account's access token for one source host tag.
    #[display("host:{_0}:{_1}")]
    Host(ResourceId, String),
}

/// Trait for credential storage backends.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Current token, `None` when missing or invalidated.
    async fn token(&self, key: &CredentialKey) -> Option<String>;

    /// Store or replace a token.
    async fn set(&self, key: CredentialKey, token: String);

    /// Drop a token after the remote rejected it.
    async fn invalidate(&self, key: &CredentialKey);
}

//! Capacity provider trait and server types.
//!
//! Providers rent machines from a cloud vendor. The scheduler only talks to
//! this trait; vendor adapters live in `hangar-provider`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::id::UnitId;

/// Errors reported by a capacity provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network failure, 5xx or throttling. Worth retrying.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Request rejected (4xx other than 401). Retrying will not help.
    #[error("provider rejected request: {0}")]
    Permanent(String),

    /// Credential missing or rejected; calls stay halted until replaced.
    #[error("provider credential expired for {0}")]
    AuthExpired(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Power actions a provider can apply to a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    PowerOn,
    PowerOff,
    Restart,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::PowerOn => "poweron",
            PowerAction::PowerOff => "poweroff",
            PowerAction::Restart => "restart",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request for a new server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRequest {
    /// Client-chosen unique name, used to detect duplicate creation on retry.
    pub name: String,
    /// Provider machine type (e.g. `C2M`).
    pub instance_class: String,
}

/// A server as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: UnitId,
    pub name: String,
    pub instance_class: String,
    pub created_at: Option<DateTime<Utc>>,
    pub state: String,
}

/// Trait for cloud capacity providers.
#[async_trait]
pub trait CapacityProvider: Send + Sync {
    /// Name of this provider (e.g. `scaleway-par1`).
    fn name(&self) -> &str;

    /// Create one server. Returns once the provider has accepted it.
    async fn create_server(&self, request: &ServerRequest) -> ProviderResult<ServerInfo>;

    /// Delete a server.
    async fn delete_server(&self, id: &UnitId) -> ProviderResult<()>;

    /// Apply a power action to a server.
    async fn server_action(&self, id: &UnitId, action: PowerAction) -> ProviderResult<()>;

    /// List every server this provider account manages for Hangar.
    async fn list_servers(&self) -> ProviderResult<Vec<ServerInfo>>;

    /// Look a server up by the name it was created with.
    async fn find_server(&self, name: &str) -> ProviderResult<Option<ServerInfo>> {
        Ok(self
            .list_servers()
            .await?
            .into_iter()
            .find(|server| server.name == name))
    }
}

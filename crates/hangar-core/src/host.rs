//! Source-host capability trait.
//!
//! Every host adapter reports commit statuses and syncs repository metadata.
//! Calls are dispatched on `Project::host`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::build::BuildStatus;
use crate::project::{Project, Webhook};

/// Commit status shown on the source host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitState {
    /// Commit state for a build status; queued builds report nothing.
    pub fn for_build(status: BuildStatus) -> Option<Self> {
        match status {
            BuildStatus::Queued => None,
            BuildStatus::Running => Some(CommitState::Pending),
            BuildStatus::Success => Some(CommitState::Success),
            BuildStatus::Failure => Some(CommitState::Failure),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CommitState::Pending => "The Hangar build is running",
            CommitState::Success => "The Hangar build passed",
            CommitState::Failure => "The Hangar build failed",
            CommitState::Error => "The Hangar build encountered an error",
        }
    }
}

/// Repository metadata fetched from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProject {
    pub owner: String,
    pub name: String,
    pub default_branch: String,
    pub private: bool,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("host API error: {0}")]
    Api(String),

    #[error("not found on host: {0}")]
    NotFound(String),

    #[error("{0} is not supported on this host")]
    Unsupported(&'static str),

    #[error("failed to parse host response: {0}")]
    Parse(String),

    /// Access token missing or rejected; it has been invalidated.
    #[error("access token expired for {0}")]
    AuthExpired(String),
}

pub type HostResult<T> = std::result::Result<T, HostError>;

/// Trait for source-control host clients.
#[async_trait]
pub trait SourceHostClient: Send + Sync {
    /// Publish a commit status for `sha` on the project's host.
    async fn update_commit_status(
        &self,
        project: &Project,
        sha: &str,
        state: CommitState,
        target_url: &str,
    ) -> HostResult<()>;

    /// Fetch the current repository metadata.
    async fn sync_project(&self, project: &Project) -> HostResult<RemoteProject>;

    /// Whether the project's recorded webhook still exists on the host.
    async fn has_webhook(&self, project: &Project) -> HostResult<bool>;

    /// Register a push hook delivering to `callback_url`, signed with
    /// `secret`. Returns the hook.
    async fn create_webhook(&self, project: &Project, callback_url: &str, secret: &str) -> HostResult<Webhook>;

    /// Remove a hook. A hook already gone counts as removed.
    async fn delete_webhook(&self, project: &Project, hook_id: &str) -> HostResult<()>;
}

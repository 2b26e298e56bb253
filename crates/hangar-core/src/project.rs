//! Projects and source-control hosts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, ResourceId, Result};

/// Source-control host a project lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceHost {
    #[serde(rename = "gh")]
    GitHub,
    #[serde(rename = "gl")]
    GitLab,
    #[serde(rename = "bb")]
    Bitbucket,
}

impl SourceHost {
    /// Two-letter tag used in storage and URLs.
    pub fn tag(&self) -> &'static str {
        match self {
            SourceHost::GitHub => "gh",
            SourceHost::GitLab => "gl",
            SourceHost::Bitbucket => "bb",
        }
    }

    pub fn domain(&self) -> &'static str {
        match self {
            SourceHost::GitHub => "github.com",
            SourceHost::GitLab => "gitlab.com",
            SourceHost::Bitbucket => "bitbucket.org",
        }
    }
}

impl fmt::Display for SourceHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for SourceHost {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gh" => Ok(SourceHost::GitHub),
            "gl" => Ok(SourceHost::GitLab),
            "bb" => Ok(SourceHost::Bitbucket),
            other => Err(Error::InvalidInput(format!("unknown source host: {}", other))),
        }
    }
}

/// When a build should run its deploy step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployOn {
    /// Only builds of tagged commits deploy.
    #[default]
    Tag,
    /// Builds of the deploy branch deploy.
    Success,
    Never,
}

impl FromStr for DeployOn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tag" => Ok(DeployOn::Tag),
            "success" => Ok(DeployOn::Success),
            "never" => Ok(DeployOn::Never),
            other => Err(Error::InvalidInput(format!("unknown deploy policy: {}", other))),
        }
    }
}

impl DeployOn {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployOn::Tag => "tag",
            DeployOn::Success => "success",
            DeployOn::Never => "never",
        }
    }
}

/// Push hook registered on the source host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    /// Hook id assigned by the host.
    pub id: String,
    /// Shared secret the host signs deliveries with.
    pub secret: String,
}

/// A repository connected to Hangar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ResourceId,
    /// Account whose host credential is used for API calls.
    pub account_id: ResourceId,
    pub host: SourceHost,
    pub owner: String,
    pub name: String,
    /// Repository id on the source host.
    pub remote_id: i64,
    pub default_branch: String,
    pub private: bool,
    /// Encoded secret environment blob, withheld from pull-request builds.
    pub secret_env: Option<String>,
    pub deploy_on: DeployOn,
    pub deploy_branch: String,
    /// Set while a webhook feeds this project builds.
    pub active: bool,
    pub webhook: Option<Webhook>,
}

impl Project {
    pub fn new(
        account_id: ResourceId,
        host: SourceHost,
        owner: impl Into<String>,
        name: impl Into<String>,
        remote_id: i64,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            account_id,
            host,
            owner: owner.into(),
            name: name.into(),
            remote_id,
            default_branch: "master".to_string(),
            private: false,
            secret_env: None,
            deploy_on: DeployOn::default(),
            deploy_branch: "master".to_string(),
            active: false,
            webhook: None,
        }
    }

    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn remote_url(&self) -> String {
        format!("https://{}/{}", self.host.domain(), self.slug())
    }

    pub fn attach_webhook(&mut self, webhook: Webhook) {
        self.webhook = Some(webhook);
        self.active = true;
    }

    /// Forget the webhook and stop accepting builds from it.
    pub fn detach_webhook(&mut self) -> Option<Webhook> {
        self.active = false;
        self.webhook.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_url_per_host() {
        let mut project = Project::new(ResourceId::new(), SourceHost::GitHub, "hangar", "hangar", 1);
        assert_eq!(project.remote_url(), "https://github.com/hangar/hangar");

        project.host = SourceHost::GitLab;
        assert_eq!(project.remote_url(), "https://gitlab.com/hangar/hangar");

        project.host = SourceHost::Bitbucket;
        assert_eq!(project.remote_url(), "https://bitbucket.org/hangar/hangar");
    }

    #[test]
    fn test_webhook_drives_active_flag() {
        let mut project = Project::new(ResourceId::new(), SourceHost::GitHub, "hangar", "hangar", 1);
        assert!(!project.active);

        project.attach_webhook(Webhook {
            id: "42".to_string(),
            secret: "s3cret".to_string(),
        });
        assert!(project.active);

        let hook = project.detach_webhook().unwrap();
        assert_eq!(hook.id, "42");
        assert!(!project.active);
        assert_eq!(project.detach_webhook(), None);
    }

    #[test]
    fn test_host_tag_round_trip() {
        for host in [SourceHost::GitHub, SourceHost::GitLab, SourceHost::Bitbucket] {
            assert_eq!(host.tag().parse::<SourceHost>().unwrap(), host);
        }
        assert!("sv".parse::<SourceHost>().is_err());
    }
}

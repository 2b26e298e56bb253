//! Build listing filters.

use serde::{Deserialize, Serialize};

use crate::build::Build;
use crate::job::JobStatus;
use crate::{Error, Result};

pub const MAX_PAGE_SIZE: u32 = 50;

/// Filters and paging for listing a project's builds, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildQuery {
    /// Page size, always within `1..=MAX_PAGE_SIZE`.
    pub count: u32,
    /// 1-based page number.
    pub page: u32,
    pub branch: Option<String>,
    /// Compared against the derived build status.
    pub status: Option<JobStatus>,
    pub pull_request: Option<u64>,
}

impl Default for BuildQuery {
    fn default() -> Self {
        Self {
            count: MAX_PAGE_SIZE,
            page: 1,
            branch: None,
            status: None,
            pull_request: None,
        }
    }
}

impl BuildQuery {
    /// Build a query from raw request parameters.
    pub fn parse(
        count: Option<&str>,
        page: Option<&str>,
        branch: Option<&str>,
        status: Option<&str>,
        pull_request: Option<&str>,
    ) -> Result<Self> {
        let count = match count {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| Error::InvalidInput("parameter `count` must be an integer".to_string()))?,
            None => MAX_PAGE_SIZE as i64,
        };
        let page = match page {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| Error::InvalidInput("parameter `page` must be an integer".to_string()))?,
            None => 1,
        };
        let status = status
            .map(|raw| {
                raw.parse::<JobStatus>().map_err(|_| {
                    Error::InvalidInput("parameter `status` must be a valid status string".to_string())
                })
            })
            .transpose()?;
        let pull_request = pull_request
            .map(|raw| {
                raw.parse::<u64>().map_err(|_| {
                    Error::InvalidInput("parameter `pull_request` must be an integer".to_string())
                })
            })
            .transpose()?;

        Ok(Self {
            count: count.clamp(1, MAX_PAGE_SIZE as i64) as u32,
            page: page.clamp(1, u32::MAX as i64) as u32,
            branch: branch.map(str::to_string),
            status,
            pull_request,
        })
    }

    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.count as u64
    }

    /// Whether `build` passes the branch, status and pull request filters.
    pub fn matches(&self, build: &Build) -> bool {
        if let Some(branch) = &self.branch {
            if &build.commit.branch != branch {
                return false;
            }
        }
        if let Some(status) = self.status {
            if build.status().as_str() != status.as_str() {
                return false;
            }
        }
        if let Some(number) = self.pull_request {
            if build.pull_request.as_ref().map(|pr| pr.number) != Some(number) {
                return false;
            }
        }
        true
    }
}

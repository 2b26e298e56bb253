//! Build manifest parsing.
//!
//! ```kdl
//! env {
//!     RUST_LOG "debug"
//! }
//! matrix {
//!     job {
//!         env { TOOLCHAIN "stable" }
//!     }
//!     job slots=2 {
//!         env { TOOLCHAIN "nightly" }
//!     }
//! }
//! deploy on="success" branch="main"
//! ```

use std::str::FromStr;

use crate::nodes::{get_first_string_arg, get_string_prop, invalid, u32_setting};
use crate::{ConfigError, ConfigResult};
use hangar_core::build::Commit;
use hangar_core::project::{DeployOn, Project};
use kdl::{KdlDocument, KdlNode};

/// A declared build: build-level variables plus one entry per job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildManifest {
    pub env: Vec<(String, String)>,
    pub matrix: Vec<MatrixEntry>,
    /// Overrides the project's deploy policy when present.
    pub deploy: Option<DeployPolicy>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixEntry {
    pub env: Vec<(String, String)>,
    pub slots: u32,
}

impl Default for MatrixEntry {
    fn default() -> Self {
        Self {
            env: Vec::new(),
            slots: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployPolicy {
    pub on: DeployOn,
    pub branch: String,
}

impl DeployPolicy {
    pub fn for_project(project: &Project) -> Self {
        Self {
            on: project.deploy_on,
            branch: project.deploy_branch.clone(),
        }
    }

    /// Whether a build of `commit` should carry the deploy job.
    pub fn should_deploy(&self, commit: &Commit, pull_request: bool) -> bool {
        if pull_request {
            return false;
        }
        match self.on {
            DeployOn::Tag => commit.tag.as_deref().is_some_and(|t| !t.is_empty()),
            DeployOn::Success => commit.branch == self.branch,
            DeployOn::Never => false,
        }
    }
}

impl BuildManifest {
    /// Matrix entries, with a single default entry for an empty matrix.
    pub fn jobs(&self) -> Vec<MatrixEntry> {
        if self.matrix.is_empty() {
            vec![MatrixEntry::default()]
        } else {
            self.matrix.clone()
        }
    }

    /// The effective deploy policy for `project`.
    pub fn deploy_policy(&self, project: &Project) -> DeployPolicy {
        self.deploy
            .clone()
            .unwrap_or_else(|| DeployPolicy::for_project(project))
    }
}

/// Parse a build manifest from KDL text.
pub fn parse_manifest(kdl: &str) -> ConfigResult<BuildManifest> {
    let doc: KdlDocument = kdl.parse()?;
    let mut manifest = BuildManifest::default();
    let mut seen_deploy = false;

    for node in doc.nodes() {
        match node.name().value() {
            "env" => manifest.env.extend(parse_env(node)?),
            "matrix" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        if child.name().value() == "job" {
                            manifest.matrix.push(parse_matrix_entry(child)?);
                        }
                    }
                }
            }
            "deploy" => {
                if seen_deploy {
                    return Err(ConfigError::Duplicate("deploy".to_string()));
                }
                seen_deploy = true;
                manifest.deploy = Some(parse_deploy(node)?);
            }
            _ => {}
        }
    }

    Ok(manifest)
}

fn parse_env(node: &KdlNode) -> ConfigResult<Vec<(String, String)>> {
    let mut vars = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if key.is_empty() || key.contains('=') || key.chars().any(char::is_whitespace) {
                return Err(invalid("env", &format!("invalid variable name '{}'", key)));
            }
            let value = get_first_string_arg(child)
                .or_else(|| {
                    child
                        .entries()
                        .iter()
                        .find(|e| e.name().is_none())
                        .map(|e| e.value().to_string())
                })
                .ok_or_else(|| invalid("env", &format!("variable '{}' has no value", key)))?;
            if value.contains('\n') {
                return Err(invalid("env", &format!("variable '{}' spans lines", key)));
            }
            vars.push((key, value));
        }
    }
    Ok(vars)
}

fn parse_matrix_entry(node: &KdlNode) -> ConfigResult<MatrixEntry> {
    let slots = u32_setting(node, "slots")?.unwrap_or(1);
    if slots == 0 {
        return Err(invalid("slots", "must be at least 1"));
    }

    let mut env = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "env" {
                env.extend(parse_env(child)?);
            }
        }
    }

    Ok(MatrixEntry { env, slots })
}

fn parse_deploy(node: &KdlNode) -> ConfigResult<DeployPolicy> {
    let on = match get_string_prop(node, "on") {
        Some(raw) => DeployOn::from_str(&raw).map_err(|e| invalid("deploy on", &e.to_string()))?,
        None => DeployOn::default(),
    };
    let branch = get_string_prop(node, "branch").unwrap_or_else(|| "master".to_string());
    Ok(DeployPolicy { on, branch })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_core::project::SourceHost;
    use hangar_core::ResourceId;

    fn commit(branch: &str, tag: Option<&str>) -> Commit {
        Commit {
            branch: branch.to_string(),
            sha: "abc".to_string(),
            author: "dev@example.com".to_string(),
            url: "https://example.com/c/abc".to_string(),
            tag: tag.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_full_manifest() {
        let kdl = r#"
            env {
                RUST_LOG "debug"
            }
            matrix {
                job {
                    env { TOOLCHAIN "stable" }
                }
                job slots=2 {
                    env { TOOLCHAIN "nightly" }
                }
            }
            deploy on="success" branch="main"
        "#;

        let manifest = parse_manifest(kdl).unwrap();
        assert_eq!(manifest.env, vec![("RUST_LOG".to_string(), "debug".to_string())]);
        assert_eq!(manifest.matrix.len(), 2);
        assert_eq!(manifest.matrix[0].slots, 1);
        assert_eq!(manifest.matrix[1].slots, 2);
        assert_eq!(
            manifest.matrix[1].env,
            vec![("TOOLCHAIN".to_string(), "nightly".to_string())]
        );
        assert_eq!(
            manifest.deploy,
            Some(DeployPolicy {
                on: DeployOn::Success,
                branch: "main".to_string()
            })
        );
    }

    #[test]
    fn test_empty_matrix_yields_single_job() {
        let manifest = parse_manifest("env { A \"1\" }").unwrap();
        let jobs = manifest.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].slots, 1);
    }

    #[test]
    fn test_zero_slots_rejected() {
        let result = parse_manifest("matrix { job slots=0 }");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_unknown_deploy_policy_rejected() {
        let result = parse_manifest(r#"deploy on="always""#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_duplicate_deploy_rejected() {
        let result = parse_manifest("deploy on=\"tag\"\ndeploy on=\"never\"");
        assert!(matches!(result, Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_deploy_rules() {
        let tag = DeployPolicy {
            on: DeployOn::Tag,
            branch: "master".to_string(),
        };
        assert!(tag.should_deploy(&commit("master", Some("v1.0")), false));
        assert!(!tag.should_deploy(&commit("master", None), false));
        assert!(!tag.should_deploy(&commit("master", Some("v1.0")), true));

        let success = DeployPolicy {
            on: DeployOn::Success,
            branch: "main".to_string(),
        };
        assert!(success.should_deploy(&commit("main", None), false));
        assert!(!success.should_deploy(&commit("feature", None), false));

        let never = DeployPolicy {
            on: DeployOn::Never,
            branch: "master".to_string(),
        };
        assert!(!never.should_deploy(&commit("master", Some("v1")), false));
    }

    #[test]
    fn test_project_policy_used_without_override() {
        let mut project = Project::new(ResourceId::new(), SourceHost::GitLab, "o", "n", 7);
        project.deploy_on = DeployOn::Success;
        project.deploy_branch = "release".to_string();

        let manifest = BuildManifest::default();
        let policy = manifest.deploy_policy(&project);
        assert_eq!(policy.on, DeployOn::Success);
        assert_eq!(policy.branch, "release");
    }
}

//! Source-host API client.
//!
//! One client serves GitHub, GitLab and Bitbucket; each call is dispatched
//! on the project's host. Tokens come from the credential store, keyed by
//! the project's account and host tag.

use std::sync::Arc;

use async_trait::async_trait;
use hangar_config::HostEndpoints;
use hangar_core::credential::{CredentialKey, CredentialStore};
use hangar_core::host::{CommitState, HostError, HostResult, RemoteProject, SourceHostClient};
use hangar_core::project::{Project, SourceHost, Webhook};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

const STATUS_CONTEXT: &str = "continuous-integration/hangar";
const WEBHOOK_EVENTS: [&str; 2] = ["push", "pull_request"];

fn github_state(state: CommitState) -> &'static str {
    match state {
        CommitState::Pending => "pending",
        CommitState::Success => "success",
        CommitState::Failure => "failure",
        CommitState::Error => "error",
    }
}

fn gitlab_state(state: CommitState) -> &'static str {
    match state {
        CommitState::Pending => "pending",
        CommitState::Success => "success",
        CommitState::Failure | CommitState::Error => "failed",
    }
}

fn bitbucket_state(state: CommitState) -> &'static str {
    match state {
        CommitState::Pending => "INPROGRESS",
        CommitState::Success => "SUCCESSFUL",
        CommitState::Failure | CommitState::Error => "FAILED",
    }
}

#[derive(Debug, Deserialize)]
struct GitHubRepo {
    name: String,
    owner: GitHubOwner,
    default_branch: String,
    private: bool,
}

#[derive(Debug, Deserialize)]
struct GitHubOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GitHubHook {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct GitLabProject {
    path: String,
    namespace: GitLabNamespace,
    #[serde(default)]
    default_branch: Option<String>,
    visibility: String,
}

#[derive(Debug, Deserialize)]
struct GitLabNamespace {
    full_path: String,
}

#[derive(Debug, Deserialize)]
struct BitbucketRepo {
    slug: String,
    owner: BitbucketOwner,
    #[serde(default)]
    mainbranch: Option<BitbucketBranch>,
    is_private: bool,
}

#[derive(Debug, Deserialize)]
struct BitbucketOwner {
    #[serde(alias = "nickname")]
    username: String,
}

#[derive(Debug, Deserialize)]
struct BitbucketBranch {
    name: String,
}

/// Source-host client for every supported host.
pub struct HostClient {
    client: reqwest::Client,
    endpoints: HostEndpoints,
    credentials: Arc<dyn CredentialStore>,
}

impl HostClient {
    pub fn new(endpoints: HostEndpoints, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
            credentials,
        }
    }

    fn base(&self, host: SourceHost) -> &Url {
        match host {
            SourceHost::GitHub => &self.endpoints.github_api,
            SourceHost::GitLab => &self.endpoints.gitlab_api,
            SourceHost::Bitbucket => &self.endpoints.bitbucket_api,
        }
    }

    fn credential_key(project: &Project) -> CredentialKey {
        CredentialKey::Host(project.account_id, project.host.tag().to_string())
    }

    async fn request(&self, project: &Project, method: Method, path: &str) -> HostResult<RequestBuilder> {
        let key = Self::credential_key(project);
        let token = self
            .credentials
            .token(&key)
            .await
            .ok_or_else(|| HostError::AuthExpired(key.to_string()))?;

        let url = format!("{}{}", self.base(project.host).as_str().trim_end_matches('/'), path);
        let mut builder = self
            .client
            .request(method, url)
            .bearer_auth(token)
            .header("User-Agent", concat!("Hangar/", env!("CARGO_PKG_VERSION")));
        if project.host == SourceHost::GitHub {
            builder = builder.header("Accept", "application/vnd.github+json");
        }
        Ok(builder)
    }

    async fn send(&self, project: &Project, request: RequestBuilder) -> HostResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| HostError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::NOT_FOUND {
            return Err(HostError::NotFound(response.url().path().to_string()));
        }
        if status == StatusCode::UNAUTHORIZED {
            let key = Self::credential_key(project);
            warn!(project = %project.slug(), credential = %key, "host rejected access token, invalidating");
            self.credentials.invalidate(&key).await;
            return Err(HostError::AuthExpired(key.to_string()));
        }

        let text = response.text().await.unwrap_or_default();
        Err(HostError::Api(format!("{}: {}", status, text)))
    }

    async fn fetch<T: DeserializeOwned>(&self, project: &Project, path: &str) -> HostResult<T> {
        let builder = self.request(project, Method::GET, path).await?;
        self.send(project, builder)
            .await?
            .json()
            .await
            .map_err(|e| HostError::Parse(e.to_string()))
    }

    /// Hooks are only managed on GitHub.
    fn hooks_path(project: &Project) -> HostResult<String> {
        match project.host {
            SourceHost::GitHub => Ok(format!("/repos/{}/{}/hooks", project.owner, project.name)),
            SourceHost::GitLab | SourceHost::Bitbucket => Err(HostError::Unsupported("webhook management")),
        }
    }
}

#[async_trait]
impl SourceHostClient for HostClient {
    async fn update_commit_status(
        &self,
        project: &Project,
        sha: &str,
        state: CommitState,
        target_url: &str,
    ) -> HostResult<()> {
        let (path, body) = match project.host {
            SourceHost::GitHub => (
                format!("/repos/{}/{}/statuses/{}", project.owner, project.name, sha),
                json!({
                    "state": github_state(state),
                    "target_url": target_url,
                    "description": state.description(),
                    "context": STATUS_CONTEXT,
                }),
            ),
            SourceHost::GitLab => (
                format!("/projects/{}/statuses/{}", project.remote_id, sha),
                json!({
                    "state": gitlab_state(state),
                    "target_url": target_url,
                    "description": state.description(),
                    "name": STATUS_CONTEXT,
                }),
            ),
            SourceHost::Bitbucket => (
                format!(
                    "/2.0/repositories/{}/{}/commit/{}/statuses/build",
                    project.owner, project.name, sha
                ),
                json!({
                    "state": bitbucket_state(state),
                    "url": target_url,
                    "description": state.description(),
                    "key": STATUS_CONTEXT,
                }),
            ),
        };

        let builder = self.request(project, Method::POST, &path).await?.json(&body);
        self.send(project, builder).await?;
        debug!(project = %project.slug(), sha, state = ?state, "commit status published");
        Ok(())
    }

    async fn sync_project(&self, project: &Project) -> HostResult<RemoteProject> {
        match project.host {
            SourceHost::GitHub => {
                let repo: GitHubRepo = self
                    .fetch(project, &format!("/repos/{}/{}", project.owner, project.name))
                    .await?;
                Ok(RemoteProject {
                    owner: repo.owner.login,
                    name: repo.name,
                    default_branch: repo.default_branch,
                    private: repo.private,
                })
            }
            SourceHost::GitLab => {
                let remote: GitLabProject = self
                    .fetch(project, &format!("/projects/{}", project.remote_id))
                    .await?;
                Ok(RemoteProject {
                    owner: remote.namespace.full_path,
                    name: remote.path,
                    default_branch: remote
                        .default_branch
                        .unwrap_or_else(|| project.default_branch.clone()),
                    private: remote.visibility != "public",
                })
            }
            SourceHost::Bitbucket => {
                let repo: BitbucketRepo = self
                    .fetch(
                        project,
                        &format!("/2.0/repositories/{}/{}", project.owner, project.name),
                    )
                    .await?;
                Ok(RemoteProject {
                    owner: repo.owner.username,
                    name: repo.slug,
                    default_branch: repo
                        .mainbranch
                        .map(|b| b.name)
                        .unwrap_or_else(|| project.default_branch.clone()),
                    private: repo.is_private,
                })
            }
        }
    }

    async fn has_webhook(&self, project: &Project) -> HostResult<bool> {
        let Some(hook) = &project.webhook else {
            return Ok(false);
        };
        let path = format!("{}/{}", Self::hooks_path(project)?, hook.id);
        let builder = self.request(project, Method::HEAD, &path).await?;
        match self.send(project, builder).await {
            Ok(_) => Ok(true),
            Err(HostError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_webhook(&self, project: &Project, callback_url: &str, secret: &str) -> HostResult<Webhook> {
        let body = json!({
            "name": "web",
            "active": true,
            "events": WEBHOOK_EVENTS,
            "config": {
                "url": callback_url,
                "secret": secret,
                "content_type": "json",
            },
        });
        let builder = self
            .request(project, Method::POST, &Self::hooks_path(project)?)
            .await?
            .json(&body);
        let hook: GitHubHook = self
            .send(project, builder)
            .await?
            .json()
            .await
            .map_err(|e| HostError::Parse(e.to_string()))?;
        debug!(project = %project.slug(), hook = hook.id, "webhook created");
        Ok(Webhook {
            id: hook.id.to_string(),
            secret: secret.to_string(),
        })
    }

    async fn delete_webhook(&self, project: &Project, hook_id: &str) -> HostResult<()> {
        let path = format!("{}/{}", Self::hooks_path(project)?, hook_id);
        let builder = self.request(project, Method::DELETE, &path).await?;
        match self.send(project, builder).await {
            Ok(_) | Err(HostError::NotFound(_)) => {
                debug!(project = %project.slug(), hook = hook_id, "webhook deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_core::ResourceId;
    use hangar_db::MemoryStore;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(server: &MockServer, host: SourceHost) -> (HostClient, Arc<MemoryStore>, Project) {
        let uri: Url = server.uri().parse().unwrap();
        let endpoints = HostEndpoints {
            github_api: uri.clone(),
            gitlab_api: uri.clone(),
            bitbucket_api: uri.clone(),
            public_url: uri,
        };
        let project = Project::new(ResourceId::new(), host, "octo", "widgets", 77);
        let store = Arc::new(MemoryStore::new());
        store
            .set(HostClient::credential_key(&project), "host-token".to_string())
            .await;
        (HostClient::new(endpoints, store.clone()), store, project)
    }

    #[tokio::test]
    async fn test_github_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/octo/widgets/statuses/abc123"))
            .and(header("Authorization", "Bearer host-token"))
            .and(body_partial_json(json!({
                "state": "pending",
                "target_url": "https://ci.example.com/b/1",
                "context": "continuous-integration/hangar"
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _, project) = setup(&server, SourceHost::GitHub).await;
        client
            .update_commit_status(&project, "abc123", CommitState::Pending, "https://ci.example.com/b/1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_gitlab_status_uses_remote_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/projects/77/statuses/abc123"))
            .and(body_partial_json(json!({"state": "failed"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _, project) = setup(&server, SourceHost::GitLab).await;
        client
            .update_commit_status(&project, "abc123", CommitState::Failure, "https://ci")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bitbucket_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2.0/repositories/octo/widgets/commit/abc123/statuses/build"))
            .and(body_partial_json(json!({"state": "SUCCESSFUL", "key": "continuous-integration/hangar"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _, project) = setup(&server, SourceHost::Bitbucket).await;
        client
            .update_commit_status(&project, "abc123", CommitState::Success, "https://ci")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unauthorized_invalidates_account_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/widgets"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let (client, store, project) = setup(&server, SourceHost::GitHub).await;
        let err = client.sync_project(&project).await.unwrap_err();
        assert!(matches!(err, HostError::AuthExpired(_)));
        assert_eq!(store.token(&HostClient::credential_key(&project)).await, None);

        let err = client.sync_project(&project).await.unwrap_err();
        assert!(matches!(err, HostError::AuthExpired(_)));
    }

    #[tokio::test]
    async fn test_github_sync_project() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/widgets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "gadgets",
                "owner": {"login": "octocat"},
                "default_branch": "main",
                "private": true
            })))
            .mount(&server)
            .await;

        let (client, _, project) = setup(&server, SourceHost::GitHub).await;
        let remote = client.sync_project(&project).await.unwrap();
        assert_eq!(
            remote,
            RemoteProject {
                owner: "octocat".to_string(),
                name: "gadgets".to_string(),
                default_branch: "main".to_string(),
                private: true,
            }
        );
    }

    #[tokio::test]
    async fn test_github_webhook_lifecycle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/octo/widgets/hooks"))
            .and(body_partial_json(json!({
                "name": "web",
                "events": ["push", "pull_request"],
                "config": {"url": "https://ci.example.com/hooks/gh", "secret": "s3cret"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 9001, "active": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/repos/octo/widgets/hooks/9001"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/repos/octo/widgets/hooks/9001"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _, mut project) = setup(&server, SourceHost::GitHub).await;
        assert!(!client.has_webhook(&project).await.unwrap());

        let hook = client
            .create_webhook(&project, "https://ci.example.com/hooks/gh", "s3cret")
            .await
            .unwrap();
        assert_eq!(hook.id, "9001");
        assert_eq!(hook.secret, "s3cret");

        project.attach_webhook(hook);
        assert!(client.has_webhook(&project).await.unwrap());
        client.delete_webhook(&project, "9001").await.unwrap();
    }

    #[tokio::test]
    async fn test_removed_webhook_is_reported_missing() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/repos/octo/widgets/hooks/5"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/repos/octo/widgets/hooks/5"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _, mut project) = setup(&server, SourceHost::GitHub).await;
        project.attach_webhook(Webhook {
            id: "5".to_string(),
            secret: "old".to_string(),
        });
        assert!(!client.has_webhook(&project).await.unwrap());
        client.delete_webhook(&project, "5").await.unwrap();
    }

    #[tokio::test]
    async fn test_webhooks_unsupported_off_github() {
        let server = MockServer::start().await;
        let (client, _, project) = setup(&server, SourceHost::GitLab).await;
        let err = client.create_webhook(&project, "https://ci", "x").await.unwrap_err();
        assert!(matches!(err, HostError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_gitlab_sync_project() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/77"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "path": "widgets",
                "namespace": {"full_path": "octo"},
                "default_branch": "develop",
                "visibility": "internal"
            })))
            .mount(&server)
            .await;

        let (client, _, project) = setup(&server, SourceHost::GitLab).await;
        let remote = client.sync_project(&project).await.unwrap();
        assert_eq!(remote.default_branch, "develop");
        assert!(remote.private);
    }
}

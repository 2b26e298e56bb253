//! Scaleway compute API adapter.
//!
//! Servers are created with the configured owner tag so listing only ever
//! returns machines Hangar manages.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hangar_config::ProviderConfig;
use hangar_core::UnitId;
use hangar_core::capacity::{
    CapacityProvider, PowerAction, ProviderError, ProviderResult, ServerInfo, ServerRequest,
};
use hangar_core::credential::{CredentialKey, CredentialStore};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const PER_PAGE: usize = 100;

/// Map a non-success response status to a provider error.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let message = format!("{}: {}", status, body);
    if status == StatusCode::UNAUTHORIZED {
        ProviderError::AuthExpired(message)
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

#[derive(Debug, Serialize)]
struct CreateServerBody<'a> {
    organization: &'a str,
    name: &'a str,
    image: &'a str,
    commercial_type: &'a str,
    enable_ipv6: bool,
    tags: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct ActionBody<'a> {
    action: &'a str,
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: ScalewayServer,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Vec<ScalewayServer>,
}

#[derive(Debug, Deserialize)]
struct ScalewayServer {
    id: String,
    name: String,
    commercial_type: String,
    #[serde(default)]
    creation_date: Option<DateTime<Utc>>,
    #[serde(default)]
    state: String,
}

impl From<ScalewayServer> for ServerInfo {
    fn from(server: ScalewayServer) -> Self {
        ServerInfo {
            id: UnitId::new(server.id),
            name: server.name,
            instance_class: server.commercial_type,
            created_at: server.creation_date,
            state: server.state,
        }
    }
}

/// Capacity provider backed by one Scaleway organization and region.
pub struct ScalewayClient {
    client: reqwest::Client,
    config: ProviderConfig,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
}

impl ScalewayClient {
    pub fn new(config: ProviderConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        let base_url = match &config.api_url {
            Some(url) => url.as_str().trim_end_matches('/').to_string(),
            None => format!("https://cp-{}.scaleway.com", config.region),
        };
        Self {
            client: reqwest::Client::new(),
            config,
            base_url,
            credentials,
        }
    }

    fn credential_key(&self) -> CredentialKey {
        CredentialKey::Provider(self.config.name.clone())
    }

    async fn request(&self, method: Method, path: &str) -> ProviderResult<RequestBuilder> {
        let token = self
            .credentials
            .token(&self.credential_key())
            .await
            .ok_or_else(|| ProviderError::AuthExpired(format!("no API token for {}", self.config.name)))?;

        Ok(self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("X-Auth-Token", token)
            .header("User-Agent", concat!("Hangar/", env!("CARGO_PKG_VERSION"))))
    }

    /// Send a request, turning transport failures and error statuses into
    /// provider errors. A rejected token is invalidated.
    async fn send(&self, request: RequestBuilder, expected: StatusCode) -> ProviderResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = response.status();
        if status == expected || (expected == StatusCode::OK && status.is_success()) {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let err = classify_status(status, &body);
        if let ProviderError::AuthExpired(_) = err {
            warn!(provider = %self.config.name, "API token rejected, invalidating");
            self.credentials.invalidate(&self.credential_key()).await;
        }
        Err(err)
    }
}

#[async_trait]
impl CapacityProvider for ScalewayClient {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn create_server(&self, request: &ServerRequest) -> ProviderResult<ServerInfo> {
        let body = CreateServerBody {
            organization: &self.config.organization,
            name: &request.name,
            image: &self.config.image,
            commercial_type: &request.instance_class,
            enable_ipv6: true,
            tags: vec![self.config.tag.as_str()],
        };
        let builder = self.request(Method::POST, "/servers").await?.json(&body);
        let response = self.send(builder, StatusCode::CREATED).await?;

        let envelope: ServerEnvelope = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("invalid server response: {}", e)))?;
        debug!(provider = %self.config.name, server = %envelope.server.id, "server created");
        Ok(envelope.server.into())
    }

    async fn delete_server(&self, id: &UnitId) -> ProviderResult<()> {
        let builder = self
            .request(Method::DELETE, &format!("/servers/{}", id))
            .await?;
        self.send(builder, StatusCode::NO_CONTENT).await?;
        Ok(())
    }

    async fn server_action(&self, id: &UnitId, action: PowerAction) -> ProviderResult<()> {
        let builder = self
            .request(Method::POST, &format!("/servers/{}/action", id))
            .await?
            .json(&ActionBody {
                action: action.as_str(),
            });
        self.send(builder, StatusCode::ACCEPTED).await?;
        Ok(())
    }

    async fn list_servers(&self) -> ProviderResult<Vec<ServerInfo>> {
        let mut servers = Vec::new();
        let mut page = 1;

        loop {
            let builder = self.request(Method::GET, "/servers").await?.query(&[
                ("tags", self.config.tag.clone()),
                ("page", page.to_string()),
                ("per_page", PER_PAGE.to_string()),
            ]);
            let response = self.send(builder, StatusCode::OK).await?;
            let list: ServerList = response
                .json()
                .await
                .map_err(|e| ProviderError::Transient(format!("invalid server list: {}", e)))?;

            let count = list.servers.len();
            servers.extend(list.servers.into_iter().map(ServerInfo::from));
            if count < PER_PAGE {
                break;
            }
            page += 1;
        }

        Ok(servers)
    }
}

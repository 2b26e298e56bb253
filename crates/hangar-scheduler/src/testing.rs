//! In-process fakes shared by the scheduler tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hangar_config::PoolClass;
use hangar_core::build::Commit;
use hangar_core::capacity::{
    CapacityProvider, PowerAction, ProviderError, ProviderResult, ServerInfo, ServerRequest,
};
use hangar_core::host::{CommitState, HostResult, RemoteProject, SourceHostClient};
use hangar_core::project::{Project, Webhook};
use hangar_core::UnitId;
use parking_lot::Mutex;

use crate::pool::{CapacityUnit, PoolManager};
use crate::retry::RetryPolicy;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn commit(branch: &str) -> Commit {
    Commit {
        branch: branch.to_string(),
        sha: "0123456789abcdef0123456789abcdef01234567".to_string(),
        author: "dev@example.com".to_string(),
        url: "https://github.com/acme/widgets/commit/0123456".to_string(),
        tag: None,
    }
}

pub fn pool_class(name: &str, instance_class: &str, unit_size: u32, hourly_cost: f64, max_pools: u32) -> PoolClass {
    PoolClass {
        name: name.to_string(),
        provider: "fake".to_string(),
        instance_class: instance_class.to_string(),
        unit_size,
        hourly_cost,
        max_pools,
    }
}

pub fn unit_at(id: &str, size: u32, created_secs: i64) -> CapacityUnit {
    CapacityUnit::new(UnitId::new(id), "fake", size, at(created_secs))
}

/// A pool with no retry delay backed by `provider`.
pub fn fake_pool(class: PoolClass, provider: Arc<FakeProvider>) -> Arc<PoolManager> {
    Arc::new(PoolManager::new(
        class,
        provider,
        RetryPolicy::new(2, std::time::Duration::ZERO, std::time::Duration::ZERO),
    ))
}

#[derive(Default)]
struct FakeState {
    servers: Vec<ServerInfo>,
    create_failures: Vec<ProviderError>,
    /// Creates that succeed at the provider but report a transient error.
    lost_responses: u32,
    delete_failures: Vec<ProviderError>,
    actions: Vec<(UnitId, PowerAction)>,
    expired: bool,
    next_id: u32,
}

/// Scriptable capacity provider.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
    create_calls: AtomicU32,
    delete_calls: AtomicU32,
    list_calls: AtomicU32,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, err: ProviderError, times: usize) {
        self.state.lock().create_failures.extend(std::iter::repeat_n(err, times));
    }

    pub fn fail_create_after_commit(&self, times: u32) {
        self.state.lock().lost_responses += times;
    }

    pub fn fail_delete(&self, err: ProviderError, times: usize) {
        self.state.lock().delete_failures.extend(std::iter::repeat_n(err, times));
    }

    pub fn expire_credentials(&self) {
        self.state.lock().expired = true;
    }

    pub fn add_server(&self, instance_class: &str) -> UnitId {
        let mut state = self.state.lock();
        let server = Self::server(&mut state, "external", instance_class);
        let id = server.id.clone();
        state.servers.push(server);
        id
    }

    pub fn remove_server(&self, id: &UnitId) {
        self.state.lock().servers.retain(|s| &s.id != id);
    }

    pub fn server_count(&self) -> usize {
        self.state.lock().servers.len()
    }

    pub fn actions(&self) -> Vec<(UnitId, PowerAction)> {
        self.state.lock().actions.clone()
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u32 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn server(state: &mut FakeState, name: &str, instance_class: &str) -> ServerInfo {
        state.next_id += 1;
        ServerInfo {
            id: UnitId::new(format!("srv-{}", state.next_id)),
            name: name.to_string(),
            instance_class: instance_class.to_string(),
            created_at: Some(at(i64::from(state.next_id))),
            state: "running".to_string(),
        }
    }

    fn check_auth(state: &FakeState) -> ProviderResult<()> {
        if state.expired {
            Err(ProviderError::AuthExpired("fake".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CapacityProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create_server(&self, request: &ServerRequest) -> ProviderResult<ServerInfo> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Self::check_auth(&state)?;
        if !state.create_failures.is_empty() {
            return Err(state.create_failures.remove(0));
        }
        let server = Self::server(&mut state, &request.name, &request.instance_class);
        state.servers.push(server.clone());
        if state.lost_responses > 0 {
            state.lost_responses -= 1;
            return Err(ProviderError::Transient("connection reset".to_string()));
        }
        Ok(server)
    }

    async fn delete_server(&self, id: &UnitId) -> ProviderResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Self::check_auth(&state)?;
        if !state.delete_failures.is_empty() {
            return Err(state.delete_failures.remove(0));
        }
        state.servers.retain(|s| &s.id != id);
        Ok(())
    }

    async fn server_action(&self, id: &UnitId, action: PowerAction) -> ProviderResult<()> {
        let mut state = self.state.lock();
        Self::check_auth(&state)?;
        state.actions.push((id.clone(), action));
        Ok(())
    }

    async fn list_servers(&self) -> ProviderResult<Vec<ServerInfo>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        Self::check_auth(&state)?;
        Ok(state.servers.clone())
    }
}

/// Source host that records every status it is sent.
#[derive(Default)]
pub struct FakeHost {
    statuses: Mutex<Vec<(String, CommitState, String)>>,
    remote: Mutex<HashMap<i64, RemoteProject>>,
    hooks: Mutex<Vec<String>>,
    next_hook: AtomicU32,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(sha, state, target_url)` in the order they were published.
    pub fn statuses(&self) -> Vec<(String, CommitState, String)> {
        self.statuses.lock().clone()
    }

    pub fn set_remote(&self, remote_id: i64, remote: RemoteProject) {
        self.remote.lock().insert(remote_id, remote);
    }

    /// Ids of the hooks currently registered.
    pub fn hooks(&self) -> Vec<String> {
        self.hooks.lock().clone()
    }
}

#[async_trait]
impl SourceHostClient for FakeHost {
    async fn update_commit_status(
        &self,
        _project: &Project,
        sha: &str,
        state: CommitState,
        target_url: &str,
    ) -> HostResult<()> {
        self.statuses
            .lock()
            .push((sha.to_string(), state, target_url.to_string()));
        Ok(())
    }

    async fn sync_project(&self, project: &Project) -> HostResult<RemoteProject> {
        self.remote
            .lock()
            .get(&project.remote_id)
            .cloned()
            .ok_or_else(|| hangar_core::host::HostError::NotFound(project.slug()))
    }

    async fn has_webhook(&self, project: &Project) -> HostResult<bool> {
        Ok(project
            .webhook
            .as_ref()
            .is_some_and(|w| self.hooks.lock().contains(&w.id)))
    }

    async fn create_webhook(&self, _project: &Project, _callback_url: &str, secret: &str) -> HostResult<Webhook> {
        let id = format!("hook-{}", self.next_hook.fetch_add(1, Ordering::SeqCst));
        self.hooks.lock().push(id.clone());
        Ok(Webhook {
            id,
            secret: secret.to_string(),
        })
    }

    async fn delete_webhook(&self, _project: &Project, hook_id: &str) -> HostResult<()> {
        self.hooks.lock().retain(|h| h != hook_id);
        Ok(())
    }
}

// Common test utilities and fixtures
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use lessor_common::{
    CreateInstanceRequest, DemandOptions, LaunchScript, Network, OrderOptions, ServiceConfig, ServiceKind,
    ServiceOptions, SshKey, TunnelConfig,
};
use lessor_orchestrator::ports::PortAllocator;
use lessor_orchestrator::ssh::{ShellIo, SshConnection, SshConnector, SshTarget};
use lessor_orchestrator::store::{EntityKind, MemoryStore, Store};
use lessor_orchestrator::web_proxy::RouteStore;
use lessor_orchestrator::{AppState, Collaborators, Settings};
use lessor_providers::mock::{MockConnector, MockMarketplace};
use serde_json::{json, Value};
use tokio::sync::Notify;

/// Hands out 40000, 40001, ...
pub struct SequentialPorts {
    next: AtomicU16,
}

impl SequentialPorts {
    pub fn new() -> Self {
        Self {
            next: AtomicU16::new(40000),
        }
    }
}

#[async_trait]
impl PortAllocator for SequentialPorts {
    async fn allocate(&self) -> Result<u16> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

/// Route table kept in memory; hostnames are `<route_id>.test.local`.
#[derive(Default)]
pub struct MemoryRoutes {
    routes: Mutex<HashMap<String, u16>>,
    registrations: AtomicUsize,
}

impl MemoryRoutes {
    pub fn routes(&self) -> HashMap<String, u16> {
        self.routes.lock().unwrap().clone()
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RouteStore for MemoryRoutes {
    async fn register(&self, route_id: &str, listen_port: u16) -> Result<String> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.routes
            .lock()
            .unwrap()
            .insert(route_id.to_string(), listen_port);
        Ok(format!("{route_id}.test.local"))
    }

    async fn remove(&self, route_id: &str) -> Result<()> {
        self.routes.lock().unwrap().remove(route_id);
        Ok(())
    }
}

/// Parked state write: `reached` fires once the write is held, `release` lets it go.
#[derive(Clone)]
pub struct HeldUpdate {
    pub state: String,
    pub reached: Arc<Notify>,
    pub release: Arc<Notify>,
}

/// In-memory store whose next `n` deletes fail, and which can hold back a state write.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_deletes: AtomicUsize,
    held: Mutex<Option<HeldUpdate>>,
}

impl FlakyStore {
    pub fn fail_next_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    /// Hold the next guarded write that moves a record to `state`.
    pub fn hold_next_update_to(&self, state: &str) -> HeldUpdate {
        let held = HeldUpdate {
            state: state.to_string(),
            reached: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        *self.held.lock().unwrap() = Some(held.clone());
        held
    }

    fn take_held(&self, patch: &Value) -> Option<HeldUpdate> {
        let mut held = self.held.lock().unwrap();
        let matches = held
            .as_ref()
            .is_some_and(|h| patch.get("state").and_then(Value::as_str) == Some(h.state.as_str()));
        if matches {
            held.take()
        } else {
            None
        }
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn get(&self, entity: EntityKind, id: &str, network: Network) -> Result<Option<Value>> {
        self.inner.get(entity, id, network).await
    }

    async fn list(&self, entity: EntityKind, network: Option<Network>) -> Result<Vec<Value>> {
        self.inner.list(entity, network).await
    }

    async fn insert(&self, entity: EntityKind, network: Network, doc: Value) -> Result<()> {
        self.inner.insert(entity, network, doc).await
    }

    async fn update(&self, entity: EntityKind, id: &str, network: Network, patch: Value) -> Result<bool> {
        self.inner.update(entity, id, network, patch).await
    }

    async fn update_if(
        &self,
        entity: EntityKind,
        id: &str,
        network: Network,
        field: &str,
        expected: &Value,
        patch: Value,
    ) -> Result<bool> {
        if let Some(held) = self.take_held(&patch) {
            held.reached.notify_one();
            held.release.notified().await;
        }
        self.inner
            .update_if(entity, id, network, field, expected, patch)
            .await
    }

    async fn delete(&self, entity: EntityKind, id: &str, network: Network) -> Result<bool> {
        let failing = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("database unavailable");
        }
        self.inner.delete(entity, id, network).await
    }
}

/// SSH transport double. Every call lands in a shared log as `<op>:<connection>[:<port>]`.
#[derive(Default)]
pub struct FakeSsh {
    log: Arc<Mutex<Vec<String>>>,
    connections: AtomicUsize,
    fail_forwards: Arc<AtomicBool>,
    targets: Mutex<Vec<SshTarget>>,
}

impl FakeSsh {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn targets(&self) -> Vec<SshTarget> {
        self.targets.lock().unwrap().clone()
    }

    pub fn fail_forwards(&self) {
        self.fail_forwards.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SshConnector for FakeSsh {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn SshConnection>> {
        let id = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        self.targets.lock().unwrap().push(target.clone());
        self.log.lock().unwrap().push(format!("connect:{id}"));
        Ok(Box::new(FakeConnection {
            id,
            log: self.log.clone(),
            fail_forwards: self.fail_forwards.clone(),
        }))
    }
}

struct FakeConnection {
    id: usize,
    log: Arc<Mutex<Vec<String>>>,
    fail_forwards: Arc<AtomicBool>,
}

impl FakeConnection {
    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl SshConnection for FakeConnection {
    async fn forward_in(&self, tunnel: &TunnelConfig) -> Result<()> {
        if self.fail_forwards.load(Ordering::SeqCst) {
            return Err(anyhow!("forwarding refused"));
        }
        self.record(format!("forward:{}:{}", self.id, tunnel.local_port));
        Ok(())
    }

    async fn unforward_in(&self, local_port: u16) -> Result<()> {
        self.record(format!("unforward:{}:{}", self.id, local_port));
        Ok(())
    }

    async fn open_shell(&self) -> Result<Box<dyn ShellIo>> {
        let (shell, _remote) = tokio::io::duplex(1024);
        Ok(Box::new(shell))
    }

    async fn close(&self) -> Result<()> {
        self.record(format!("close:{}", self.id));
        Ok(())
    }
}

pub struct Fixture {
    pub state: Arc<AppState>,
    pub connector: Arc<MockConnector>,
    pub store: Arc<FlakyStore>,
    pub routes: Arc<MemoryRoutes>,
    pub ssh: Arc<FakeSsh>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let connector = Arc::new(MockConnector::new());
        let store = Arc::new(FlakyStore::default());
        let routes = Arc::new(MemoryRoutes::default());
        let ssh = Arc::new(FakeSsh::default());
        let state = AppState::new(
            settings,
            Collaborators {
                connector: connector.clone(),
                store: store.clone(),
                ports: Arc::new(SequentialPorts::new()),
                routes: routes.clone(),
                ssh: ssh.clone(),
                redis_client: None,
            },
        );
        Self {
            state,
            connector,
            store,
            routes,
            ssh,
        }
    }

    pub fn market(&self, network: Network) -> Arc<MockMarketplace> {
        self.connector.market(network).unwrap()
    }

    pub async fn add_ssh_key(&self, network: Network, key_id: &str, private_key: Option<&str>) {
        let key = SshKey {
            key_id: key_id.to_string(),
            name: key_id.to_string(),
            public_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITest tester@lessor".to_string(),
            private_key: private_key.map(str::to_string),
            created_at: None,
        };
        self.store
            .insert(EntityKind::SshKey, network, json!(key))
            .await
            .unwrap();
    }

    pub async fn add_launch_script(&self, network: Network, script_id: &str, content: &str) {
        let script = LaunchScript {
            script_id: script_id.to_string(),
            name: script_id.to_string(),
            content: content.to_string(),
            tags: None,
            updated_at: None,
        };
        self.store
            .insert(EntityKind::LaunchScript, network, json!(script))
            .await
            .unwrap();
    }
}

pub fn fast_settings() -> Settings {
    Settings {
        creation_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_secs(1),
        ..Settings::default()
    }
}

pub fn request(agreement_id: &str, network: Network, services: Vec<ServiceConfig>) -> CreateInstanceRequest {
    CreateInstanceRequest {
        agreement_id: agreement_id.to_string(),
        network,
        instance_name: format!("{agreement_id}-box"),
        demand_options: DemandOptions {
            capabilities: vec!["vpn".to_string()],
            image_tag: "lessor/ubuntu:22.04".to_string(),
            extra: Default::default(),
        },
        order_options: OrderOptions {
            rent_hours: 1.0,
            pricing: json!({"max_start_price": 0.5}),
        },
        allocation_id: "alloc-1".to_string(),
        launch_script_id: None,
        vpn_id: None,
        services,
    }
}

pub fn web() -> ServiceConfig {
    ServiceConfig::new(ServiceKind::Web)
}

pub fn ssh(key_id: &str) -> ServiceConfig {
    ServiceConfig {
        options: Some(ServiceOptions {
            ssh_key_id: Some(key_id.to_string()),
        }),
        ..ServiceConfig::new(ServiceKind::Ssh)
    }
}

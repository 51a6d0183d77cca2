//! Transient in-memory registries for live handles. None of this is persisted: after
//! a restart, restored instances have no rental handle and no bindings until recreated.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lessor_common::{Network, ServiceKind};
use lessor_providers::{Rental, TcpProxy, VirtualNetwork};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub agreement_id: String,
    pub network: Network,
}

impl InstanceKey {
    pub fn new(agreement_id: impl Into<String>, network: Network) -> Self {
        Self {
            agreement_id: agreement_id.into(),
            network,
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.agreement_id)
    }
}

#[derive(Default)]
pub struct RentalRegistry {
    rentals: Mutex<HashMap<InstanceKey, Arc<dyn Rental>>>,
}

impl RentalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, key: InstanceKey, rental: Arc<dyn Rental>) {
        self.rentals.lock().await.insert(key, rental);
    }

    pub async fn contains(&self, key: &InstanceKey) -> bool {
        self.rentals.lock().await.contains_key(key)
    }

    /// Removes the handle under the lock. Whoever gets `Some` owns the stop.
    pub async fn take(&self, key: &InstanceKey) -> Option<Arc<dyn Rental>> {
        self.rentals.lock().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.rentals.lock().await.len()
    }
}

/// One async lock per instance key; teardowns of the same instance run one at a time.
#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<InstanceKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &InstanceKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // idle entries are only referenced by the map
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// A local port proxied to a port of the instance.
pub struct ServiceBinding {
    pub kind: ServiceKind,
    pub remote_port: u16,
    pub listen_port: u16,
    /// Reverse-proxy route owned by a `web` binding. Removing an unregistered route is a no-op.
    pub route_id: Option<String>,
    pub ssh_key_id: Option<String>,
    pub proxy: Box<dyn TcpProxy>,
}

#[derive(Default)]
pub struct BindingRegistry {
    bindings: Mutex<HashMap<InstanceKey, Vec<Arc<ServiceBinding>>>>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, key: &InstanceKey, binding: ServiceBinding) {
        self.bindings
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .push(Arc::new(binding));
    }

    pub async fn list(&self, key: &InstanceKey) -> Vec<Arc<ServiceBinding>> {
        self.bindings
            .lock()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn take_all(&self, key: &InstanceKey) -> Vec<Arc<ServiceBinding>> {
        self.bindings.lock().await.remove(key).unwrap_or_default()
    }

    /// Local port and key id of the `ssh` binding, if the instance has one.
    pub async fn ssh_binding(&self, key: &InstanceKey) -> Option<(u16, Option<String>)> {
        let bindings = self.bindings.lock().await;
        let list = bindings.get(key)?;
        list.iter()
            .find(|b| b.kind == ServiceKind::Ssh)
            .map(|b| (b.listen_port, b.ssh_key_id.clone()))
    }
}

#[derive(Default)]
pub struct VpnRegistry {
    networks: Mutex<HashMap<(Network, String), Arc<dyn VirtualNetwork>>>,
}

impl VpnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, network: Network, handle: Arc<dyn VirtualNetwork>) {
        let id = handle.id().to_string();
        self.networks.lock().await.insert((network, id), handle);
    }

    pub async fn get(&self, network: Network, vpn_id: &str) -> Option<Arc<dyn VirtualNetwork>> {
        self.networks
            .lock()
            .await
            .get(&(network, vpn_id.to_string()))
            .cloned()
    }

    pub async fn remove(&self, network: Network, vpn_id: &str) -> Option<Arc<dyn VirtualNetwork>> {
        self.networks
            .lock()
            .await
            .remove(&(network, vpn_id.to_string()))
    }
}

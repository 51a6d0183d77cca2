//! Document persistence. Records are opaque JSON documents keyed by (entity, id, network);
//! [`Records`] adds the typed accessors the rest of the orchestrator uses.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lessor_common::{Instance, InstanceState, LaunchScript, Network, SshKey, VpnInfo};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::LifecycleError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Instance,
    SshKey,
    LaunchScript,
    Vpn,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Instance => "instance",
            EntityKind::SshKey => "ssh_key",
            EntityKind::LaunchScript => "launch_script",
            EntityKind::Vpn => "vpn",
        }
    }

    /// Document field holding the record id.
    pub fn key_field(&self) -> &'static str {
        match self {
            EntityKind::Instance => "agreement_id",
            EntityKind::SshKey => "key_id",
            EntityKind::LaunchScript => "script_id",
            EntityKind::Vpn => "vpn_id",
        }
    }

    pub fn key_of(&self, doc: &Value) -> Option<String> {
        doc.get(self.key_field())
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, entity: EntityKind, id: &str, network: Network) -> Result<Option<Value>>;

    /// All documents of `entity`, optionally restricted to one network.
    async fn list(&self, entity: EntityKind, network: Option<Network>) -> Result<Vec<Value>>;

    /// Fails if a document with the same key already exists.
    async fn insert(&self, entity: EntityKind, network: Network, doc: Value) -> Result<()>;

    /// Shallow merge of `patch` into the stored document. A patch carrying a different
    /// key field moves the document to that key. Returns false when nothing matched.
    async fn update(&self, entity: EntityKind, id: &str, network: Network, patch: Value) -> Result<bool>;

    /// [`Store::update`] applied only while the stored `field` still equals `expected`,
    /// checked and written atomically. Returns false when the guard did not hold.
    async fn update_if(
        &self,
        entity: EntityKind,
        id: &str,
        network: Network,
        field: &str,
        expected: &Value,
        patch: Value,
    ) -> Result<bool>;

    async fn delete(&self, entity: EntityKind, id: &str, network: Network) -> Result<bool>;
}

pub fn merge_patch(doc: &mut Value, patch: Value) {
    match (doc, patch) {
        (Value::Object(target), Value::Object(fields)) => {
            for (k, v) in fields {
                target.insert(k, v);
            }
        }
        (doc, patch) => *doc = patch,
    }
}

/// Typed view over a [`Store`].
#[derive(Clone)]
pub struct Records {
    store: Arc<dyn Store>,
}

impl Records {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    async fn get_typed<T: DeserializeOwned>(
        &self,
        entity: EntityKind,
        id: &str,
        network: Network,
    ) -> Result<Option<T>, LifecycleError> {
        let doc = self
            .store
            .get(entity, id, network)
            .await
            .map_err(LifecycleError::store)?;
        match doc {
            Some(doc) => serde_json::from_value(doc).map(Some).map_err(|e| {
                LifecycleError::Store(format!("malformed {} {}: {}", entity.as_str(), id, e))
            }),
            None => Ok(None),
        }
    }

    async fn insert_typed<T: serde::Serialize>(
        &self,
        entity: EntityKind,
        network: Network,
        doc: &T,
    ) -> Result<(), LifecycleError> {
        let doc = serde_json::to_value(doc).map_err(|e| LifecycleError::Store(e.to_string()))?;
        self.store
            .insert(entity, network, doc)
            .await
            .map_err(LifecycleError::store)
    }

    pub async fn get_instance(&self, id: &str, network: Network) -> Result<Option<Instance>, LifecycleError> {
        self.get_typed(EntityKind::Instance, id, network).await
    }

    /// Every instance across networks. Malformed documents are skipped with a warning.
    pub async fn list_instances(&self) -> Result<Vec<Instance>, LifecycleError> {
        let docs = self
            .store
            .list(EntityKind::Instance, None)
            .await
            .map_err(LifecycleError::store)?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            match serde_json::from_value::<Instance>(doc) {
                Ok(i) => out.push(i),
                Err(e) => tracing::warn!("⚠️ skipping malformed instance record: {}", e),
            }
        }
        Ok(out)
    }

    pub async fn insert_instance(&self, instance: &Instance) -> Result<(), LifecycleError> {
        self.insert_typed(EntityKind::Instance, instance.network, instance)
            .await
    }

    /// Applies `patch` only if the record is still in `expected`.
    pub async fn update_instance_from(
        &self,
        id: &str,
        network: Network,
        expected: InstanceState,
        patch: Value,
    ) -> Result<bool, LifecycleError> {
        let expected = serde_json::to_value(expected).map_err(|e| LifecycleError::Store(e.to_string()))?;
        self.store
            .update_if(EntityKind::Instance, id, network, "state", &expected, patch)
            .await
            .map_err(LifecycleError::store)
    }

    pub async fn delete_instance(&self, id: &str, network: Network) -> Result<bool, LifecycleError> {
        self.store
            .delete(EntityKind::Instance, id, network)
            .await
            .map_err(LifecycleError::store)
    }

    pub async fn get_ssh_key(&self, key_id: &str, network: Network) -> Result<Option<SshKey>, LifecycleError> {
        self.get_typed(EntityKind::SshKey, key_id, network).await
    }

    pub async fn get_launch_script(
        &self,
        script_id: &str,
        network: Network,
    ) -> Result<Option<LaunchScript>, LifecycleError> {
        self.get_typed(EntityKind::LaunchScript, script_id, network)
            .await
    }

    pub async fn get_vpn(&self, vpn_id: &str, network: Network) -> Result<Option<VpnInfo>, LifecycleError> {
        self.get_typed(EntityKind::Vpn, vpn_id, network).await
    }

    pub async fn insert_vpn(&self, vpn: &VpnInfo) -> Result<(), LifecycleError> {
        self.insert_typed(EntityKind::Vpn, vpn.network, vpn).await
    }

    pub async fn delete_vpn(&self, vpn_id: &str, network: Network) -> Result<bool, LifecycleError> {
        self.store
            .delete(EntityKind::Vpn, vpn_id, network)
            .await
            .map_err(LifecycleError::store)
    }
}

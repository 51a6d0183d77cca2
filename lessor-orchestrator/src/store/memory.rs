use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use lessor_common::Network;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{merge_patch, EntityKind, Store};

type RecordKey = (EntityKind, Network, String);

/// Process-local store, used when no `DATABASE_URL` is configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<RecordKey, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_update(
    records: &mut HashMap<RecordKey, Value>,
    entity: EntityKind,
    id: &str,
    network: Network,
    guard: Option<(&str, &Value)>,
    patch: Value,
) -> Result<bool> {
    let old_key = (entity, network, id.to_string());
    let Some(mut doc) = records.get(&old_key).cloned() else {
        return Ok(false);
    };
    if let Some((field, expected)) = guard {
        if doc.get(field) != Some(expected) {
            return Ok(false);
        }
    }
    merge_patch(&mut doc, patch);

    let new_id = entity.key_of(&doc).unwrap_or_else(|| id.to_string());
    if new_id == id {
        records.insert(old_key, doc);
        return Ok(true);
    }

    let new_key = (entity, network, new_id);
    if records.contains_key(&new_key) {
        bail!("{} {} already exists on {}", entity.as_str(), new_key.2, network);
    }
    records.remove(&old_key);
    records.insert(new_key, doc);
    Ok(true)
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, entity: EntityKind, id: &str, network: Network) -> Result<Option<Value>> {
        let records = self.records.read().await;
        Ok(records.get(&(entity, network, id.to_string())).cloned())
    }

    async fn list(&self, entity: EntityKind, network: Option<Network>) -> Result<Vec<Value>> {
        let records = self.records.read().await;
        let mut out: Vec<(String, Value)> = records
            .iter()
            .filter(|((e, n, _), _)| *e == entity && network.map_or(true, |want| want == *n))
            .map(|((_, n, id), doc)| (format!("{n}/{id}"), doc.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out.into_iter().map(|(_, doc)| doc).collect())
    }

    async fn insert(&self, entity: EntityKind, network: Network, doc: Value) -> Result<()> {
        let id = entity
            .key_of(&doc)
            .ok_or_else(|| anyhow!("{} document has no {}", entity.as_str(), entity.key_field()))?;
        let mut records = self.records.write().await;
        let key = (entity, network, id);
        if records.contains_key(&key) {
            bail!("{} {} already exists on {}", entity.as_str(), key.2, network);
        }
        records.insert(key, doc);
        Ok(())
    }

    async fn update(&self, entity: EntityKind, id: &str, network: Network, patch: Value) -> Result<bool> {
        let mut records = self.records.write().await;
        apply_update(&mut records, entity, id, network, None, patch)
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
        let mut records = self.records.write().await;
        apply_update(&mut records, entity, id, network, Some((field, expected)), patch)
    }

    async fn delete(&self, entity: EntityKind, id: &str, network: Network) -> Result<bool> {
        let mut records = self.records.write().await;
        Ok(records.remove(&(entity, network, id.to_string())).is_some())
    }
}

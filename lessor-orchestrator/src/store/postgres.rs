use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lessor_common::Network;
use serde_json::Value;
use sqlx::{Pool, Postgres};

use super::{merge_patch, EntityKind, Store};

/// JSONB documents in the `records` table (see `migrations.rs`).
#[derive(Clone)]
pub struct PgStore {
    db: Pool<Postgres>,
}

impl PgStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

impl PgStore {
    /// Read-modify-write under a row lock; `guard` is checked on the locked row.
    async fn apply_update(
        &self,
        entity: EntityKind,
        id: &str,
        network: Network,
        guard: Option<(&str, &Value)>,
        patch: Value,
    ) -> Result<bool> {
        let mut tx = self.db.begin().await.context("begin update")?;

        let current: Option<Value> = sqlx::query_scalar(
            "SELECT doc FROM records WHERE entity = $1 AND network = $2 AND id = $3 FOR UPDATE",
        )
        .bind(entity.as_str())
        .bind(network.as_str())
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut doc) = current else {
            return Ok(false);
        };
        if let Some((field, expected)) = guard {
            if doc.get(field) != Some(expected) {
                return Ok(false);
            }
        }
        merge_patch(&mut doc, patch);
        let new_id = entity.key_of(&doc).unwrap_or_else(|| id.to_string());

        sqlx::query(
            "UPDATE records SET id = $4, doc = $5, updated_at = NOW()
             WHERE entity = $1 AND network = $2 AND id = $3",
        )
        .bind(entity.as_str())
        .bind(network.as_str())
        .bind(id)
        .bind(&new_id)
        .bind(&doc)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("update {} {} -> {}", entity.as_str(), id, new_id))?;

        tx.commit().await.context("commit update")?;
        Ok(true)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get(&self, entity: EntityKind, id: &str, network: Network) -> Result<Option<Value>> {
        let doc: Option<Value> = sqlx::query_scalar(
            "SELECT doc FROM records WHERE entity = $1 AND network = $2 AND id = $3",
        )
        .bind(entity.as_str())
        .bind(network.as_str())
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .with_context(|| format!("get {} {}", entity.as_str(), id))?;
        Ok(doc)
    }

    async fn list(&self, entity: EntityKind, network: Option<Network>) -> Result<Vec<Value>> {
        let docs: Vec<Value> = sqlx::query_scalar(
            "SELECT doc FROM records
             WHERE entity = $1 AND ($2::text IS NULL OR network = $2)
             ORDER BY network, id",
        )
        .bind(entity.as_str())
        .bind(network.map(|n| n.as_str()))
        .fetch_all(&self.db)
        .await
        .with_context(|| format!("list {}", entity.as_str()))?;
        Ok(docs)
    }

    async fn insert(&self, entity: EntityKind, network: Network, doc: Value) -> Result<()> {
        let Some(id) = entity.key_of(&doc) else {
            bail!("{} document has no {}", entity.as_str(), entity.key_field());
        };
        let res = sqlx::query(
            "INSERT INTO records (entity, network, id, doc) VALUES ($1, $2, $3, $4)
             ON CONFLICT (entity, network, id) DO NOTHING",
        )
        .bind(entity.as_str())
        .bind(network.as_str())
        .bind(&id)
        .bind(&doc)
        .execute(&self.db)
        .await
        .with_context(|| format!("insert {} {}", entity.as_str(), id))?;
        if res.rows_affected() == 0 {
            bail!("{} {} already exists on {}", entity.as_str(), id, network);
        }
        Ok(())
    }

    async fn update(&self, entity: EntityKind, id: &str, network: Network, patch: Value) -> Result<bool> {
        self.apply_update(entity, id, network, None, patch).await
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
        self.apply_update(entity, id, network, Some((field, expected)), patch)
            .await
    }

    async fn delete(&self, entity: EntityKind, id: &str, network: Network) -> Result<bool> {
        let res = sqlx::query("DELETE FROM records WHERE entity = $1 AND network = $2 AND id = $3")
            .bind(entity.as_str())
            .bind(network.as_str())
            .bind(id)
            .execute(&self.db)
            .await
            .with_context(|| format!("delete {} {}", entity.as_str(), id))?;
        Ok(res.rows_affected() > 0)
    }
}

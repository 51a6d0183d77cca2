use anyhow::Context;
use redis::AsyncCommands;
use serde_json::json;
use tokio::sync::broadcast;

use lessor_common::bus::{LifecycleEventEnvelope, LifecycleEventType, CHANNEL_LIFECYCLE_EVENTS};
use lessor_common::Instance;

use crate::registry::InstanceKey;

pub async fn publish_lifecycle_event(
    redis_client: &redis::Client,
    evt: &LifecycleEventEnvelope,
) -> anyhow::Result<()> {
    let mut conn = redis_client
        .get_multiplexed_async_connection()
        .await
        .context("Failed to connect to Redis (publisher)")?;
    let payload = serde_json::to_string(evt)?;

    let _: () = conn.publish(CHANNEL_LIFECYCLE_EVENTS, payload).await?;
    Ok(())
}

/// Lifecycle event fan-out: in-process subscribers always, Redis when configured.
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEventEnvelope>,
    redis_client: Option<redis::Client>,
}

impl EventBus {
    pub fn new(redis_client: Option<redis::Client>) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx, redis_client }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEventEnvelope> {
        self.tx.subscribe()
    }

    pub async fn emit(&self, event_type: LifecycleEventType, payload: serde_json::Value, source: &str) {
        let evt = LifecycleEventEnvelope::new(event_type, payload, source);
        // No subscriber is fine.
        let _ = self.tx.send(evt.clone());

        if let Some(client) = &self.redis_client {
            if let Err(e) = publish_lifecycle_event(client, &evt).await {
                tracing::warn!("⚠️ failed to publish {}: {:#}", event_type.as_str(), e);
            }
        }
    }

    pub async fn emit_instance(&self, event_type: LifecycleEventType, instance: &Instance, source: &str) {
        self.emit(
            event_type,
            json!({
                "agreement_id": instance.agreement_id,
                "network": instance.network,
                "name": instance.name,
                "provider_id": instance.provider_id,
                "activity_id": instance.activity_id,
                "endpoint": instance.endpoint,
                "state": instance.state,
                "details": instance.details,
            }),
            source,
        )
        .await;
    }

    pub async fn emit_key(&self, event_type: LifecycleEventType, key: &InstanceKey, source: &str) {
        self.emit(
            event_type,
            json!({"agreement_id": key.agreement_id, "network": key.network}),
            source,
        )
        .await;
    }

    pub async fn emit_error(&self, key: &InstanceKey, message: &str, source: &str) {
        self.emit(
            LifecycleEventType::Error,
            json!({
                "agreement_id": key.agreement_id,
                "network": key.network,
                "message": message,
            }),
            source,
        )
        .await;
    }
}

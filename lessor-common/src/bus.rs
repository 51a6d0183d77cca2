use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Channels / Streams
// -----------------------------------------------------------------------------

pub const CHANNEL_LIFECYCLE_EVENTS: &str = "lessor_lifecycle_events";

// -----------------------------------------------------------------------------
// Lifecycle events (EVT:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEventType {
    #[serde(rename = "EVT:INSTANCE_CREATED")]
    InstanceCreated,
    #[serde(rename = "EVT:INSTANCE_CREATE_FAILED")]
    InstanceCreateFailed,
    #[serde(rename = "EVT:INSTANCE_TERMINATED")]
    InstanceTerminated,
    #[serde(rename = "EVT:DELETION_QUEUED")]
    DeletionQueued,
    #[serde(rename = "EVT:INSTANCE_DELETED")]
    InstanceDeleted,
    #[serde(rename = "EVT:ERROR")]
    Error,
}

impl LifecycleEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEventType::InstanceCreated => "EVT:INSTANCE_CREATED",
            LifecycleEventType::InstanceCreateFailed => "EVT:INSTANCE_CREATE_FAILED",
            LifecycleEventType::InstanceTerminated => "EVT:INSTANCE_TERMINATED",
            LifecycleEventType::DeletionQueued => "EVT:DELETION_QUEUED",
            LifecycleEventType::InstanceDeleted => "EVT:INSTANCE_DELETED",
            LifecycleEventType::Error => "EVT:ERROR",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LifecycleEventEnvelope {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: LifecycleEventType,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub source: String,
}

impl LifecycleEventEnvelope {
    pub fn new(event_type: LifecycleEventType, payload: serde_json::Value, source: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            occurred_at: Utc::now(),
            payload,
            source: source.to_string(),
        }
    }
}

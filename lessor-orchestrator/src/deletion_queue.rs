use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::registry::InstanceKey;

/// Terminal instances waiting for their record to be deleted. Each key is queued at
/// most once; the deadline is fixed when the key is first queued.
pub struct DeletionQueue {
    delay: Duration,
    entries: Mutex<HashMap<InstanceKey, Instant>>,
}

impl DeletionQueue {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Returns false if the key was already queued.
    pub async fn enqueue(&self, key: &InstanceKey) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(key.clone(), Instant::now() + self.delay);
        true
    }

    pub async fn contains(&self, key: &InstanceKey) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    pub async fn remove(&self, key: &InstanceKey) -> bool {
        self.entries.lock().await.remove(key).is_some()
    }

    pub async fn deadline(&self, key: &InstanceKey) -> Option<Instant> {
        self.entries.lock().await.get(key).copied()
    }

    /// Keys whose deadline has passed. They stay queued until removed.
    pub async fn due(&self, now: Instant) -> Vec<InstanceKey> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

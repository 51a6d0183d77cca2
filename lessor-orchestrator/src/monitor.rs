use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use lessor_common::bus::LifecycleEventType;
use lessor_common::{Instance, InstanceState, Network};
use lessor_providers::Marketplace;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::controller::{CleanupOptions, LifecycleController};
use crate::deletion_queue::DeletionQueue;
use crate::error::LifecycleError;
use crate::events::EventBus;
use crate::provider_manager::MarketplaceManager;
use crate::registry::InstanceKey;
use crate::store::Records;

const SOURCE: &str = "lessor-orchestrator/monitor";

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub interval: Duration,
    /// An allocation expiring within this window is treated as expired.
    pub allocation_threshold: Duration,
    pub min_remaining_amount: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            allocation_threshold: Duration::from_secs(120),
            min_remaining_amount: 0.01,
        }
    }
}

/// Outcome of one tick, mostly for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub checked: usize,
    pub invalidated: usize,
    pub queued: usize,
    pub deleted: usize,
    pub errors: usize,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

enum Verdict {
    Skipped,
    Healthy,
    Queued,
    Invalidated,
    Failed,
}

/// job-monitor: validates every Active instance against its allocation and
/// activity, tears down the invalid ones, and sweeps the delayed-deletion queue.
pub struct Monitor {
    settings: MonitorSettings,
    markets: Arc<MarketplaceManager>,
    records: Records,
    controller: Arc<LifecycleController>,
    queue: Arc<DeletionQueue>,
    events: Arc<EventBus>,
    running: Mutex<Option<Running>>,
}

impl Monitor {
    pub fn new(
        settings: MonitorSettings,
        markets: Arc<MarketplaceManager>,
        controller: Arc<LifecycleController>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            settings,
            markets,
            records: controller.records().clone(),
            queue: controller.deletion_queue().clone(),
            controller,
            events,
            running: Mutex::new(None),
        }
    }

    /// Starts the timer. Returns false if it was already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return false;
        }

        let period = self.settings.interval;
        let monitor: Weak<Monitor> = Arc::downgrade(self);
        let (shutdown, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!("🩺 job-monitor started (every {:?})", period);
            loop {
                // stop is only observed between ticks
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stopped.changed() => break,
                }
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.run_tick().await;
            }
        });
        *running = Some(Running { shutdown, task });
        true
    }

    /// Stops the timer, waiting for a tick in progress to finish. Returns false if
    /// it was not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return false;
        };
        let _ = running.shutdown.send(true);
        if let Err(e) = running.task.await {
            tracing::error!("❌ job-monitor task failed: {}", e);
        }
        tracing::info!("🩺 job-monitor stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    pub async fn run_tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let markets = match self.markets.get_all().await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("⚠️ job-monitor: marketplace unavailable, skipping tick: {}", e);
                return report;
            }
        };

        let instances = match self.records.list_instances().await {
            Ok(i) => i,
            Err(e) => {
                tracing::error!("❌ job-monitor: failed to list instances: {}", e);
                report.errors += 1;
                return report;
            }
        };

        let verdicts = join_all(instances.into_iter().map(|i| self.process(i, &markets))).await;
        for verdict in verdicts {
            match verdict {
                Verdict::Skipped => {}
                Verdict::Healthy => report.checked += 1,
                Verdict::Queued => report.queued += 1,
                Verdict::Invalidated => {
                    report.checked += 1;
                    report.invalidated += 1;
                }
                Verdict::Failed => report.errors += 1,
            }
        }

        report.deleted = self.sweep_deletions().await;

        if report.invalidated > 0 || report.deleted > 0 || report.errors > 0 {
            tracing::info!(
                "🩺 job-monitor: checked={} invalidated={} queued={} deleted={} errors={}",
                report.checked,
                report.invalidated,
                report.queued,
                report.deleted,
                report.errors
            );
        }
        report
    }

    async fn process(&self, instance: Instance, markets: &HashMap<Network, Arc<dyn Marketplace>>) -> Verdict {
        let key = InstanceKey::new(instance.agreement_id.clone(), instance.network);
        if self.queue.contains(&key).await {
            return Verdict::Skipped;
        }

        if instance.state.is_terminal() {
            // Terminated elsewhere (or before a restart) and never queued.
            if self.queue.enqueue(&key).await {
                self.events
                    .emit_key(LifecycleEventType::DeletionQueued, &key, SOURCE)
                    .await;
            }
            return Verdict::Queued;
        }
        if instance.state != InstanceState::Active {
            return Verdict::Skipped;
        }

        let Some(market) = markets.get(&instance.network) else {
            return Verdict::Skipped;
        };

        let result = match self.check(&instance, market.as_ref()).await {
            Ok(()) => return Verdict::Healthy,
            Err(LifecycleError::Invalidation(reason)) => {
                tracing::warn!(
                    agreement_id = %key.agreement_id,
                    network = %key.network,
                    "💀 instance invalid: {}",
                    reason
                );
                self.invalidate(&key).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Verdict::Invalidated,
            Err(e) => {
                tracing::error!(
                    agreement_id = %key.agreement_id,
                    network = %key.network,
                    "❌ job-monitor error: {}",
                    e
                );
                self.events.emit_error(&key, &e.to_string(), SOURCE).await;
                Verdict::Failed
            }
        }
    }

    async fn check(&self, instance: &Instance, market: &dyn Marketplace) -> Result<(), LifecycleError> {
        let allocation = market
            .get_allocation(&instance.allocation_id)
            .await
            .map_err(LifecycleError::marketplace)?;

        if let Some(timeout) = allocation.timeout {
            let left = timeout - chrono::Utc::now();
            let threshold = chrono::Duration::from_std(self.settings.allocation_threshold)
                .unwrap_or_else(|_| chrono::Duration::zero());
            if left <= threshold {
                return Err(LifecycleError::Invalidation(format!(
                    "allocation {} expires at {}",
                    allocation.id, timeout
                )));
            }
        }
        if allocation.remaining_amount <= self.settings.min_remaining_amount {
            return Err(LifecycleError::Invalidation(format!(
                "allocation {} has {} left",
                allocation.id, allocation.remaining_amount
            )));
        }

        let Some(activity_id) = instance.activity_id.as_deref() else {
            return Err(LifecycleError::Invalidation("no activity".to_string()));
        };
        match market.get_activity_state(activity_id).await {
            Ok(state) if state.is_terminated() => Err(LifecycleError::Invalidation(format!(
                "activity {activity_id} is terminated"
            ))),
            Ok(_) => Ok(()),
            Err(e) => Err(LifecycleError::Invalidation(format!(
                "activity {activity_id} unreachable: {e:#}"
            ))),
        }
    }

    async fn invalidate(&self, key: &InstanceKey) -> Result<(), LifecycleError> {
        if self.queue.contains(key).await {
            return Ok(());
        }
        self.controller
            .cleanup_instance(key, CleanupOptions::default())
            .await
    }

    /// Deletes due records. A failed deletion stays queued for the next tick.
    pub async fn sweep_deletions(&self) -> usize {
        let mut deleted = 0;
        for key in self.queue.due(Instant::now()).await {
            match self.records.delete_instance(&key.agreement_id, key.network).await {
                Ok(_) => {
                    self.queue.remove(&key).await;
                    deleted += 1;
                    tracing::info!("🗑️ instance record {} deleted", key);
                    self.events
                        .emit_key(LifecycleEventType::InstanceDeleted, &key, SOURCE)
                        .await;
                }
                Err(e) => {
                    tracing::warn!("⚠️ failed to delete {}, will retry: {}", key, e);
                }
            }
        }
        deleted
    }
}

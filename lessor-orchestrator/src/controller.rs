//! Instance lifecycle: creation raced against a timeout, service attachment, and
//! phased teardown that keeps going when a phase fails.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use lessor_common::bus::LifecycleEventType;
use lessor_common::{CreateInstanceRequest, Instance, InstanceState, Network};
use lessor_providers::{ExeUnit, ExeUnitSetup, MarketOrder, Rental};
use serde_json::json;
use tokio::task::JoinHandle;

use crate::deletion_queue::DeletionQueue;
use crate::error::{CleanupPhase, LifecycleError};
use crate::events::EventBus;
use crate::provider_manager::MarketplaceManager;
use crate::registry::{InstanceKey, KeyLocks, RentalRegistry};
use crate::services::ServiceBinder;
use crate::state_machine;
use crate::store::Records;
use crate::vpn::VpnManager;

const SOURCE: &str = "lessor-orchestrator/controller";

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub creation_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            creation_timeout: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(120),
        }
    }
}

/// Which teardown phases to run. All on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOptions {
    pub stop_instance: bool,
    pub close_services: bool,
    pub delete_node: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            stop_instance: true,
            close_services: true,
            delete_node: true,
        }
    }
}

/// Where the live resources of an instance are, independent of its record key.
struct Teardown {
    live: InstanceKey,
    vpn_id: Option<String>,
    provider_id: Option<String>,
}

/// Runs the launch script once the execution unit is ready.
struct LaunchScriptSetup {
    script: String,
}

#[async_trait::async_trait]
impl ExeUnitSetup for LaunchScriptSetup {
    async fn setup(&self, exe: &dyn ExeUnit) -> anyhow::Result<()> {
        let output = exe.run(&self.script).await?;
        if !output.success() {
            anyhow::bail!(
                "launch script exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(())
    }
}

enum Race {
    Finished(Result<Arc<dyn Rental>, LifecycleError>),
    TimedOut,
}

pub struct LifecycleController {
    settings: ControllerSettings,
    markets: Arc<MarketplaceManager>,
    records: Records,
    rentals: Arc<RentalRegistry>,
    binder: Arc<ServiceBinder>,
    vpns: Arc<VpnManager>,
    queue: Arc<DeletionQueue>,
    events: Arc<EventBus>,
    teardowns: KeyLocks,
}

impl LifecycleController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: ControllerSettings,
        markets: Arc<MarketplaceManager>,
        records: Records,
        rentals: Arc<RentalRegistry>,
        binder: Arc<ServiceBinder>,
        vpns: Arc<VpnManager>,
        queue: Arc<DeletionQueue>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            settings,
            markets,
            records,
            rentals,
            binder,
            vpns,
            queue,
            events,
            teardowns: KeyLocks::new(),
        }
    }

    pub fn records(&self) -> &Records {
        &self.records
    }

    pub fn rentals(&self) -> &Arc<RentalRegistry> {
        &self.rentals
    }

    pub fn deletion_queue(&self) -> &Arc<DeletionQueue> {
        &self.queue
    }

    fn validate(request: &CreateInstanceRequest) -> Result<(), LifecycleError> {
        let required = [
            ("agreement_id", request.agreement_id.as_str()),
            ("instance_name", request.instance_name.as_str()),
            ("allocation_id", request.allocation_id.as_str()),
            ("demand_options.image_tag", request.demand_options.image_tag.as_str()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(LifecycleError::Validation(format!("{field} is required")));
            }
        }
        if !(request.order_options.rent_hours > 0.0) {
            return Err(LifecycleError::Validation(
                "order_options.rent_hours must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Create an instance from `request`. The record is keyed by the placeholder
    /// `request.agreement_id` until the marketplace assigns the real agreement id.
    pub async fn create_instance(&self, request: CreateInstanceRequest) -> Result<Instance, LifecycleError> {
        Self::validate(&request)?;
        let network = request.network;
        let placeholder = InstanceKey::new(request.agreement_id.clone(), network);

        let vpn = match request.vpn_id.as_deref() {
            Some(vpn_id) => Some(self.vpns.handle(network, vpn_id).await.ok_or_else(|| {
                LifecycleError::Validation(format!("VPN not found: {vpn_id}"))
            })?),
            None => None,
        };

        match self
            .records
            .get_instance(&placeholder.agreement_id, network)
            .await?
        {
            None => self.records.insert_instance(&Instance::creating(&request)).await?,
            Some(existing) if existing.state == InstanceState::Creating => {}
            Some(existing) => {
                return Err(LifecycleError::Validation(format!(
                    "instance {} already exists in state {}",
                    placeholder.agreement_id, existing.state
                )))
            }
        }

        tracing::info!(
            agreement_id = %placeholder.agreement_id,
            network = %network,
            "🚀 creating instance {}",
            request.instance_name
        );

        let setup = match self.launch_script(&request).await {
            Ok(setup) => setup,
            Err(e) => return Err(self.fail_creation(&placeholder, None, e).await),
        };
        let market = match self.markets.get(network).await {
            Ok(m) => m,
            Err(e) => return Err(self.fail_creation(&placeholder, None, e).await),
        };

        let order = MarketOrder {
            demand: request.demand_options.clone(),
            market: request.order_options.clone(),
            allocation_id: request.allocation_id.clone(),
            network: vpn.clone(),
        };
        let mut acquisition: JoinHandle<anyhow::Result<Arc<dyn Rental>>> =
            tokio::spawn(async move { market.acquire_rental(order, setup).await });

        let race = tokio::select! {
            joined = &mut acquisition => Race::Finished(match joined {
                Ok(Ok(rental)) => Ok(rental),
                Ok(Err(e)) => Err(LifecycleError::Acquisition(format!("{e:#}"))),
                Err(e) => Err(LifecycleError::Acquisition(format!("acquisition task failed: {e}"))),
            }),
            _ = tokio::time::sleep(self.settings.creation_timeout) => Race::TimedOut,
        };

        let rental = match race {
            Race::Finished(Ok(rental)) => rental,
            Race::Finished(Err(e)) => return Err(self.fail_creation(&placeholder, None, e).await),
            Race::TimedOut => {
                self.reconcile_late_rental(placeholder.clone(), acquisition);
                return Err(self
                    .fail_creation(&placeholder, None, LifecycleError::AcquisitionTimeout)
                    .await);
            }
        };

        let live = InstanceKey::new(rental.agreement_id(), network);
        self.rentals.insert(live.clone(), rental.clone()).await;
        let exe = rental.exe_unit();
        let teardown = Teardown {
            live: live.clone(),
            vpn_id: request.vpn_id.clone(),
            provider_id: Some(exe.provider().id.clone()),
        };

        let attached = if request.services.is_empty() {
            None
        } else {
            match self
                .binder
                .setup_services(&live, exe.as_ref(), &request.services)
                .await
            {
                Ok(a) => Some(a),
                Err(e) => return Err(self.fail_creation(&placeholder, Some(teardown), e).await),
            }
        };

        let expiration =
            chrono::Utc::now().timestamp() + (request.order_options.rent_hours * 3600.0) as i64;
        let mut fields = json!({
            "agreement_id": live.agreement_id,
            "activity_id": exe.activity_id(),
            "provider_id": exe.provider().id,
            "ipv4_address": exe.ip(),
            "expiration": expiration,
            "details": null,
            "configure": request,
        });
        if let Some(attached) = &attached {
            fields["services"] = json!(attached.services);
            fields["endpoint"] = json!(attached.endpoint);
        }

        let activated = match state_machine::creating_to_active(&self.records, &placeholder, fields).await {
            Ok(a) => a,
            Err(e) => return Err(self.fail_creation(&placeholder, Some(teardown), e).await),
        };
        if !activated {
            // Terminated while the order was in flight.
            let err = LifecycleError::Acquisition(format!(
                "instance {} left Creating before the rental was ready",
                placeholder.agreement_id
            ));
            return Err(self.fail_creation(&placeholder, Some(teardown), err).await);
        }

        let instance = self
            .records
            .get_instance(&live.agreement_id, network)
            .await?
            .ok_or_else(|| LifecycleError::NotFound {
                entity: "instance",
                id: live.agreement_id.clone(),
                network,
            })?;

        tracing::info!(
            agreement_id = %instance.agreement_id,
            network = %network,
            "✅ instance active (provider {:?}, endpoint {:?})",
            instance.provider_id,
            instance.endpoint
        );
        self.events
            .emit_instance(LifecycleEventType::InstanceCreated, &instance, SOURCE)
            .await;
        Ok(instance)
    }

    async fn launch_script(
        &self,
        request: &CreateInstanceRequest,
    ) -> Result<Option<Arc<dyn ExeUnitSetup>>, LifecycleError> {
        let Some(script_id) = request.launch_script_id.as_deref() else {
            return Ok(None);
        };
        let script = self
            .records
            .get_launch_script(script_id, request.network)
            .await?
            .ok_or_else(|| LifecycleError::Validation(format!("Launch script not found: {script_id}")))?;
        if script.content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(Arc::new(LaunchScriptSetup {
            script: script.content,
        })))
    }

    /// Stops a rental that arrives after its creation already timed out.
    fn reconcile_late_rental(
        &self,
        key: InstanceKey,
        acquisition: JoinHandle<anyhow::Result<Arc<dyn Rental>>>,
    ) {
        let stop_timeout = self.settings.stop_timeout;
        let events = self.events.clone();
        tokio::spawn(async move {
            match acquisition.await {
                Ok(Ok(rental)) => {
                    tracing::warn!(
                        agreement_id = %rental.agreement_id(),
                        "⏱️ late rental for timed out {}, stopping it",
                        key
                    );
                    if let Err(e) = rental.stop_and_finalize(stop_timeout).await {
                        tracing::error!("❌ failed to stop late rental {}: {:#}", rental.agreement_id(), e);
                        events
                            .emit_error(&key, &format!("late rental not stopped: {e:#}"), SOURCE)
                            .await;
                    }
                }
                Ok(Err(e)) => {
                    tracing::info!("late acquisition for {} failed after timeout: {:#}", key, e)
                }
                Err(e) => tracing::warn!("late acquisition task for {} aborted: {}", key, e),
            }
        });
    }

    /// Marks the record `CreateFailed`, tears down whatever was acquired and queues
    /// the record. Returns the error for the caller.
    async fn fail_creation(
        &self,
        placeholder: &InstanceKey,
        teardown: Option<Teardown>,
        err: LifecycleError,
    ) -> LifecycleError {
        tracing::error!(
            agreement_id = %placeholder.agreement_id,
            network = %placeholder.network,
            "❌ creation failed: {}",
            err
        );

        if let Err(e) = state_machine::mark_create_failed(&self.records, placeholder, &err.to_string()).await {
            tracing::error!("❌ failed to mark {} CreateFailed: {}", placeholder, e);
        }

        let teardown = teardown.unwrap_or(Teardown {
            live: placeholder.clone(),
            vpn_id: None,
            provider_id: None,
        });
        let failed = self.run_phases(&teardown, CleanupOptions::default()).await;
        if !failed.is_empty() {
            tracing::warn!("⚠️ partial cleanup after failed creation of {}: {:?}", placeholder, failed);
        }

        if self.queue.enqueue(placeholder).await {
            self.events
                .emit_key(LifecycleEventType::DeletionQueued, placeholder, SOURCE)
                .await;
        }
        self.events
            .emit(
                LifecycleEventType::InstanceCreateFailed,
                json!({
                    "agreement_id": placeholder.agreement_id,
                    "network": placeholder.network,
                    "error": err.classification(),
                    "details": err.to_string(),
                }),
                SOURCE,
            )
            .await;
        err
    }

    /// Tear down an instance. Every phase runs even if an earlier one failed; the
    /// record ends `Terminated` (or `Error` if a phase failed, unless it was already
    /// terminal) and is queued for deletion. Unknown keys are a no-op. Concurrent
    /// cleanups of one key are serialized; the later one finds the record terminal.
    pub async fn cleanup_instance(&self, key: &InstanceKey, options: CleanupOptions) -> Result<(), LifecycleError> {
        let _teardown = self.teardowns.lock(key).await;
        let record = self
            .records
            .get_instance(&key.agreement_id, key.network)
            .await?;

        let teardown = Teardown {
            live: key.clone(),
            vpn_id: record.as_ref().and_then(|r| r.vpn_id.clone()),
            provider_id: record.as_ref().and_then(|r| r.provider_id.clone()),
        };
        let failed = self.run_phases(&teardown, options).await;
        let failed_names: Vec<String> = failed.iter().map(|p| p.to_string()).collect();

        let Some(record) = record else {
            return if failed.is_empty() {
                Ok(())
            } else {
                Err(LifecycleError::CleanupPhase {
                    agreement_id: key.agreement_id.clone(),
                    phases: failed,
                })
            };
        };

        let final_state = match state_machine::mark_torn_down(&self.records, key, &failed_names).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("❌ failed to record teardown of {}: {}", key, e);
                None
            }
        };

        if self.queue.enqueue(key).await {
            self.events
                .emit_key(LifecycleEventType::DeletionQueued, key, SOURCE)
                .await;
        }
        if let Some(state) = final_state {
            let mut terminated = record.clone();
            terminated.state = state;
            self.events
                .emit_instance(LifecycleEventType::InstanceTerminated, &terminated, SOURCE)
                .await;
        }

        if failed.is_empty() {
            tracing::info!(agreement_id = %key.agreement_id, network = %key.network, "🧹 instance cleaned up");
            Ok(())
        } else {
            let err = LifecycleError::CleanupPhase {
                agreement_id: key.agreement_id.clone(),
                phases: failed,
            };
            self.events.emit_error(key, &err.to_string(), SOURCE).await;
            Err(err)
        }
    }

    async fn run_phases(&self, teardown: &Teardown, options: CleanupOptions) -> Vec<CleanupPhase> {
        let key = &teardown.live;
        let mut failed = Vec::new();

        if options.stop_instance {
            if let Some(rental) = self.rentals.take(key).await {
                tracing::info!("🛑 stopping rental {}", key);
                if let Err(e) = rental.stop_and_finalize(self.settings.stop_timeout).await {
                    tracing::error!("❌ [{}] stop phase failed for {}: {:#}", CleanupPhase::Stop, key, e);
                    failed.push(CleanupPhase::Stop);
                }
            }
        }

        if options.close_services {
            let failures = self.binder.close_services(key).await;
            if !failures.is_empty() {
                tracing::error!(
                    "❌ [{}] phase failed for {}: {}",
                    CleanupPhase::CloseServices,
                    key,
                    failures.join("; ")
                );
                failed.push(CleanupPhase::CloseServices);
            }
        }

        if options.delete_node {
            if let (Some(vpn_id), Some(provider_id)) = (&teardown.vpn_id, &teardown.provider_id) {
                if let Err(e) = self.delete_node(key.network, vpn_id, provider_id).await {
                    tracing::error!("❌ [{}] phase failed for {}: {:#}", CleanupPhase::DeleteNode, key, e);
                    failed.push(CleanupPhase::DeleteNode);
                }
            }
        }

        failed
    }

    async fn delete_node(&self, network: Network, vpn_id: &str, provider_id: &str) -> anyhow::Result<()> {
        let Some(handle) = self.vpns.handle(network, vpn_id).await else {
            tracing::info!("vpn {} has no live handle, node of {} not removed", vpn_id, provider_id);
            return Ok(());
        };
        let ip = handle
            .nodes()
            .into_iter()
            .find(|(_, node)| node == provider_id)
            .map(|(ip, _)| ip);
        match ip {
            Some(ip) => {
                handle.remove_node(provider_id, &ip).await?;
                tracing::info!("🔌 node {} ({}) removed from vpn {}", ip, provider_id, vpn_id);
            }
            None => tracing::info!("no node of {} in vpn {}", provider_id, vpn_id),
        }
        Ok(())
    }

    /// Terminate many instances concurrently; succeeds only if all of them do.
    pub async fn terminate_instances(&self, network: Network, ids: &[String]) -> Result<(), LifecycleError> {
        if ids.is_empty() {
            return Err(LifecycleError::Validation("no agreement ids given".to_string()));
        }

        let results = join_all(ids.iter().map(|id| async move {
            let key = InstanceKey::new(id.clone(), network);
            let res = async {
                state_machine::mark_terminating(&self.records, &key, "terminate requested").await?;
                self.cleanup_instance(&key, CleanupOptions::default()).await
            }
            .await;
            (id.clone(), res)
        }))
        .await;

        let failures: Vec<(String, String)> = results
            .into_iter()
            .filter_map(|(id, res)| res.err().map(|e| (id, e.to_string())))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Aggregate { failures })
        }
    }

    /// Replay the stored request of a `CreateFailed` instance.
    pub async fn retry_instance(&self, network: Network, agreement_id: &str) -> Result<Instance, LifecycleError> {
        let key = InstanceKey::new(agreement_id, network);
        let record = self
            .records
            .get_instance(agreement_id, network)
            .await?
            .ok_or_else(|| LifecycleError::NotFound {
                entity: "instance",
                id: agreement_id.to_string(),
                network,
            })?;
        if record.state != InstanceState::CreateFailed {
            return Err(LifecycleError::Validation(format!(
                "only CreateFailed instances can be retried ({} is {})",
                agreement_id, record.state
            )));
        }
        let Some(mut request) = record.configure else {
            return Err(LifecycleError::Validation(format!(
                "instance {agreement_id} has no stored configuration"
            )));
        };
        request.agreement_id = agreement_id.to_string();

        self.queue.remove(&key).await;
        state_machine::retry_creation(&self.records, &key).await?;
        tracing::info!(agreement_id = %agreement_id, network = %network, "🔁 retrying creation");
        self.create_instance(request).await
    }
}

use std::sync::Arc;

use lessor_providers::MarketplaceConnector;

use crate::controller::{ControllerSettings, LifecycleController};
use crate::deletion_queue::DeletionQueue;
use crate::events::EventBus;
use crate::monitor::{Monitor, MonitorSettings};
use crate::ports::PortAllocator;
use crate::provider_manager::MarketplaceManager;
use crate::registry::{BindingRegistry, RentalRegistry, VpnRegistry};
use crate::services::ServiceBinder;
use crate::settings::Settings;
use crate::ssh::{SshConnector, SshSessionManager};
use crate::store::{Records, Store};
use crate::vpn::VpnManager;
use crate::web_proxy::RouteStore;

/// External collaborators, injected so tests can swap any of them.
pub struct Collaborators {
    pub connector: Arc<dyn MarketplaceConnector>,
    pub store: Arc<dyn Store>,
    pub ports: Arc<dyn PortAllocator>,
    pub routes: Arc<dyn RouteStore>,
    pub ssh: Arc<dyn SshConnector>,
    pub redis_client: Option<redis::Client>,
}

pub struct AppState {
    pub settings: Settings,
    pub records: Records,
    pub markets: Arc<MarketplaceManager>,
    pub bindings: Arc<BindingRegistry>,
    pub controller: Arc<LifecycleController>,
    pub monitor: Arc<Monitor>,
    pub ssh: Arc<SshSessionManager>,
    pub vpns: Arc<VpnManager>,
    pub events: Arc<EventBus>,
}

impl AppState {
    pub fn new(settings: Settings, collaborators: Collaborators) -> Arc<Self> {
        let Collaborators {
            connector,
            store,
            ports,
            routes,
            ssh,
            redis_client,
        } = collaborators;

        let records = Records::new(store);
        let markets = Arc::new(MarketplaceManager::new(connector));
        let events = Arc::new(EventBus::new(redis_client));
        let bindings = Arc::new(BindingRegistry::new());
        let queue = Arc::new(DeletionQueue::new(settings.deletion_delay));

        let vpns = Arc::new(VpnManager::new(
            markets.clone(),
            records.clone(),
            Arc::new(VpnRegistry::new()),
        ));
        let binder = Arc::new(ServiceBinder::new(
            ports,
            routes,
            bindings.clone(),
            records.clone(),
        ));
        let controller = Arc::new(LifecycleController::new(
            ControllerSettings {
                creation_timeout: settings.creation_timeout,
                stop_timeout: settings.stop_timeout,
            },
            markets.clone(),
            records.clone(),
            Arc::new(RentalRegistry::new()),
            binder,
            vpns.clone(),
            queue,
            events.clone(),
        ));
        let monitor = Arc::new(Monitor::new(
            MonitorSettings {
                interval: settings.check_interval,
                allocation_threshold: settings.allocation_threshold,
                min_remaining_amount: settings.min_remaining_amount,
            },
            markets.clone(),
            controller.clone(),
            events.clone(),
        ));
        let ssh = Arc::new(SshSessionManager::new(ssh, bindings.clone(), records.clone()));

        Arc::new(Self {
            settings,
            records,
            markets,
            bindings,
            controller,
            monitor,
            ssh,
            vpns,
            events,
        })
    }

    pub async fn shutdown(&self) {
        self.monitor.stop().await;
        self.ssh.terminate_all().await;
    }
}

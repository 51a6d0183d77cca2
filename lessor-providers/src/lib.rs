use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lessor_common::{DemandOptions, Network, OrderOptions};

/// A market order as handed to the marketplace. Demand and pricing are opaque to the
/// orchestrator.
pub struct MarketOrder {
    pub demand: DemandOptions,
    pub market: OrderOptions,
    pub allocation_id: String,
    /// Virtual network the rented instance should join.
    pub network: Option<Arc<dyn VirtualNetwork>>,
}

#[async_trait]
pub trait Marketplace: Send + Sync {
    fn network(&self) -> Network;

    /// Negotiate and sign an agreement, start an activity and deploy the image.
    /// `setup` runs once the execution unit is ready, before the rental is returned.
    async fn acquire_rental(
        &self,
        order: MarketOrder,
        setup: Option<Arc<dyn ExeUnitSetup>>,
    ) -> Result<Arc<dyn Rental>>;

    async fn get_allocation(&self, allocation_id: &str) -> Result<inventory::AllocationInfo>;

    async fn get_activity_state(&self, activity_id: &str) -> Result<inventory::ActivityState>;

    // Virtual networks (VPN)
    async fn create_network(&self, cidr: &str) -> Result<Arc<dyn VirtualNetwork>>;
    async fn destroy_network(&self, network_id: &str) -> Result<()>;
}

/// Opens the marketplace connection for a payment network.
#[async_trait]
pub trait MarketplaceConnector: Send + Sync {
    async fn connect(&self, network: Network) -> Result<Arc<dyn Marketplace>>;
}

#[async_trait]
pub trait Rental: Send + Sync {
    fn agreement_id(&self) -> &str;
    fn exe_unit(&self) -> Arc<dyn ExeUnit>;

    /// Stop the activity, terminate the agreement and settle payments. Bounded by
    /// `timeout`. Stopping a rental that already stopped is a no-op.
    async fn stop_and_finalize(&self, timeout: Duration) -> Result<()>;
}

#[async_trait]
pub trait ExeUnit: Send + Sync {
    fn activity_id(&self) -> &str;
    fn provider(&self) -> &inventory::ProviderInfo;

    /// Address of the unit inside its virtual network, if it joined one.
    fn ip(&self) -> Option<String>;

    async fn run(&self, command: &str) -> Result<inventory::CommandOutput>;

    /// Bind `listen_port` on this host and forward it to `remote_port` of the unit.
    async fn create_tcp_proxy(&self, remote_port: u16, listen_port: u16) -> Result<Box<dyn TcpProxy>>;
}

#[async_trait]
pub trait ExeUnitSetup: Send + Sync {
    async fn setup(&self, exe: &dyn ExeUnit) -> Result<()>;
}

#[async_trait]
pub trait TcpProxy: Send + Sync {
    fn remote_port(&self) -> u16;
    fn listen_port(&self) -> u16;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait VirtualNetwork: Send + Sync {
    fn id(&self) -> &str;
    fn cidr(&self) -> &str;

    /// ip -> provider id
    fn nodes(&self) -> HashMap<String, String>;

    async fn remove_node(&self, provider_id: &str, ip: &str) -> Result<()>;
}

pub mod inventory {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    pub struct ProviderInfo {
        pub id: String,
        pub name: String,
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct CommandOutput {
        pub stdout: String,
        pub stderr: String,
        pub exit_code: i32,
    }

    impl CommandOutput {
        pub fn success(&self) -> bool {
            self.exit_code == 0
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct AllocationInfo {
        pub id: String,
        /// None means the allocation never expires.
        pub timeout: Option<DateTime<Utc>>,
        pub remaining_amount: f64,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum ActivityState {
        New,
        Initialized,
        Deployed,
        Ready,
        Unresponsive,
        Terminated,
        Unknown(String),
    }

    impl ActivityState {
        pub fn parse(s: &str) -> Self {
            match s {
                "New" => ActivityState::New,
                "Initialized" => ActivityState::Initialized,
                "Deployed" => ActivityState::Deployed,
                "Ready" => ActivityState::Ready,
                "Unresponsive" => ActivityState::Unresponsive,
                "Terminated" => ActivityState::Terminated,
                other => ActivityState::Unknown(other.to_string()),
            }
        }

        pub fn is_terminated(&self) -> bool {
            matches!(self, ActivityState::Terminated)
        }
    }
}

#[cfg(feature = "mock")]
pub mod mock;

//! In-memory marketplace used for local development and tests.
//!
//! Every knob is set through `&self` so tests can keep an `Arc<MockMarketplace>` and
//! reshape its behaviour while the orchestrator holds the same handle.

use crate::inventory::{ActivityState, AllocationInfo, CommandOutput, ProviderInfo};
use crate::{
    ExeUnit, ExeUnitSetup, MarketOrder, Marketplace, MarketplaceConnector, Rental, TcpProxy,
    VirtualNetwork,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use lessor_common::Network;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct MockState {
    acquisition_delay: Duration,
    acquisition_error: Option<String>,
    allocations: HashMap<String, AllocationInfo>,
    allocation_error: Option<String>,
    activity_states: HashMap<String, ActivityState>,
    activity_error: Option<String>,
    failing_commands: Vec<String>,
    stop_error: Option<String>,
    stop_delay: Duration,
    rentals: Vec<Arc<MockRental>>,
    networks: HashMap<String, Arc<MockNetwork>>,
}

pub struct MockMarketplace {
    network: Network,
    seq: AtomicU64,
    state: Mutex<MockState>,
}

impl MockMarketplace {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            seq: AtomicU64::new(0),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn set_acquisition_delay(&self, delay: Duration) {
        lock(&self.state).acquisition_delay = delay;
    }

    pub fn fail_acquisitions(&self, message: &str) {
        lock(&self.state).acquisition_error = Some(message.to_string());
    }

    pub fn set_allocation(&self, allocation: AllocationInfo) {
        lock(&self.state)
            .allocations
            .insert(allocation.id.clone(), allocation);
    }

    pub fn fail_allocation_lookups(&self, message: &str) {
        lock(&self.state).allocation_error = Some(message.to_string());
    }

    pub fn set_activity_state(&self, activity_id: &str, state: ActivityState) {
        lock(&self.state)
            .activity_states
            .insert(activity_id.to_string(), state);
    }

    pub fn fail_activity_lookups(&self, message: &str) {
        lock(&self.state).activity_error = Some(message.to_string());
    }

    /// Commands containing `needle` exit with status 1.
    pub fn fail_commands_matching(&self, needle: &str) {
        lock(&self.state).failing_commands.push(needle.to_string());
    }

    pub fn fail_stops(&self, message: &str) {
        lock(&self.state).stop_error = Some(message.to_string());
    }

    /// Rentals acquired from now on take `delay` to stop.
    pub fn set_stop_delay(&self, delay: Duration) {
        lock(&self.state).stop_delay = delay;
    }

    pub fn rentals(&self) -> Vec<Arc<MockRental>> {
        lock(&self.state).rentals.clone()
    }

    pub fn rental(&self, agreement_id: &str) -> Option<Arc<MockRental>> {
        lock(&self.state)
            .rentals
            .iter()
            .find(|r| r.agreement_id == agreement_id)
            .cloned()
    }

    pub fn mock_network(&self, network_id: &str) -> Option<Arc<MockNetwork>> {
        lock(&self.state).networks.get(network_id).cloned()
    }
}

#[async_trait]
impl Marketplace for MockMarketplace {
    fn network(&self) -> Network {
        self.network
    }

    async fn acquire_rental(
        &self,
        order: MarketOrder,
        setup: Option<Arc<dyn ExeUnitSetup>>,
    ) -> Result<Arc<dyn Rental>> {
        let (delay, error) = {
            let st = lock(&self.state);
            (st.acquisition_delay, st.acquisition_error.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(msg) = error {
            return Err(anyhow!(msg));
        }

        let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut ip = None;
        if let Some(net) = order.network.as_ref() {
            let mock_net = lock(&self.state).networks.get(net.id()).cloned();
            let Some(mock_net) = mock_net else {
                return Err(anyhow!("MockMarketplace: unknown network {}", net.id()));
            };
            let addr = format!("192.168.0.{}", n + 1);
            mock_net.add_node(&addr, &format!("provider-{n}"));
            ip = Some(addr);
        }

        let exe = Arc::new(MockExeUnit {
            activity_id: format!("activity-{n}"),
            provider: ProviderInfo {
                id: format!("provider-{n}"),
                name: format!("mock-provider-{n}"),
            },
            ip,
            marketplace_failing: lock(&self.state).failing_commands.clone(),
            commands: Mutex::new(Vec::new()),
            proxies: Mutex::new(Vec::new()),
        });
        let rental = Arc::new(MockRental {
            agreement_id: format!("agreement-{n}"),
            exe,
            stop_calls: AtomicUsize::new(0),
            stops_finished: AtomicUsize::new(0),
            stop_error: lock(&self.state).stop_error.clone(),
            stop_delay: lock(&self.state).stop_delay,
        });
        lock(&self.state).rentals.push(rental.clone());

        if let Some(setup) = setup {
            if let Err(e) = setup.setup(rental.exe.as_ref()).await {
                let _ = rental.stop_and_finalize(Duration::from_secs(1)).await;
                return Err(e);
            }
        }

        Ok(rental)
    }

    async fn get_allocation(&self, allocation_id: &str) -> Result<AllocationInfo> {
        let st = lock(&self.state);
        if let Some(msg) = &st.allocation_error {
            return Err(anyhow!(msg.clone()));
        }
        Ok(st
            .allocations
            .get(allocation_id)
            .cloned()
            .unwrap_or_else(|| AllocationInfo {
                id: allocation_id.to_string(),
                timeout: Some(Utc::now() + chrono::Duration::days(1)),
                remaining_amount: 100.0,
            }))
    }

    async fn get_activity_state(&self, activity_id: &str) -> Result<ActivityState> {
        let st = lock(&self.state);
        if let Some(msg) = &st.activity_error {
            return Err(anyhow!(msg.clone()));
        }
        Ok(st
            .activity_states
            .get(activity_id)
            .cloned()
            .unwrap_or(ActivityState::Ready))
    }

    async fn create_network(&self, cidr: &str) -> Result<Arc<dyn VirtualNetwork>> {
        let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let net = Arc::new(MockNetwork {
            id: format!("net-{n}"),
            cidr: cidr.to_string(),
            nodes: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        });
        // the requestor itself is the first node
        net.add_node("192.168.0.1", "requestor");
        lock(&self.state)
            .networks
            .insert(net.id.clone(), net.clone());
        Ok(net)
    }

    async fn destroy_network(&self, network_id: &str) -> Result<()> {
        let net = lock(&self.state).networks.remove(network_id);
        match net {
            Some(net) => {
                net.destroyed.store(true, Ordering::SeqCst);
                Ok(())
            }
            None => Err(anyhow!("MockMarketplace: network {} not found", network_id)),
        }
    }
}

pub struct MockRental {
    agreement_id: String,
    exe: Arc<MockExeUnit>,
    stop_calls: AtomicUsize,
    stops_finished: AtomicUsize,
    stop_error: Option<String>,
    stop_delay: Duration,
}

impl MockRental {
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Stops that ran to the end (after the configured delay).
    pub fn stops_finished(&self) -> usize {
        self.stops_finished.load(Ordering::SeqCst)
    }

    pub fn mock_exe(&self) -> Arc<MockExeUnit> {
        self.exe.clone()
    }
}

#[async_trait]
impl Rental for MockRental {
    fn agreement_id(&self) -> &str {
        &self.agreement_id
    }

    fn exe_unit(&self) -> Arc<dyn ExeUnit> {
        self.exe.clone()
    }

    async fn stop_and_finalize(&self, _timeout: Duration) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        self.stops_finished.fetch_add(1, Ordering::SeqCst);
        match &self.stop_error {
            Some(msg) => Err(anyhow!(msg.clone())),
            None => Ok(()),
        }
    }
}

pub struct MockExeUnit {
    activity_id: String,
    provider: ProviderInfo,
    ip: Option<String>,
    marketplace_failing: Vec<String>,
    commands: Mutex<Vec<String>>,
    proxies: Mutex<Vec<Arc<MockProxyState>>>,
}

impl MockExeUnit {
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    pub fn proxies(&self) -> Vec<Arc<MockProxyState>> {
        lock(&self.proxies).clone()
    }
}

#[async_trait]
impl ExeUnit for MockExeUnit {
    fn activity_id(&self) -> &str {
        &self.activity_id
    }

    fn provider(&self) -> &ProviderInfo {
        &self.provider
    }

    fn ip(&self) -> Option<String> {
        self.ip.clone()
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        lock(&self.commands).push(command.to_string());
        if self
            .marketplace_failing
            .iter()
            .any(|needle| command.contains(needle.as_str()))
        {
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: "mock: command failed".to_string(),
                exit_code: 1,
            });
        }
        Ok(CommandOutput::default())
    }

    async fn create_tcp_proxy(&self, remote_port: u16, listen_port: u16) -> Result<Box<dyn TcpProxy>> {
        let state = Arc::new(MockProxyState {
            remote_port,
            listen_port,
            closed: AtomicBool::new(false),
        });
        lock(&self.proxies).push(state.clone());
        Ok(Box::new(MockTcpProxy { state }))
    }
}

pub struct MockProxyState {
    pub remote_port: u16,
    pub listen_port: u16,
    closed: AtomicBool,
}

impl MockProxyState {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockTcpProxy {
    state: Arc<MockProxyState>,
}

#[async_trait]
impl TcpProxy for MockTcpProxy {
    fn remote_port(&self) -> u16 {
        self.state.remote_port
    }

    fn listen_port(&self) -> u16 {
        self.state.listen_port
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockNetwork {
    id: String,
    cidr: String,
    nodes: Mutex<HashMap<String, String>>,
    destroyed: AtomicBool,
}

impl MockNetwork {
    pub fn add_node(&self, ip: &str, provider_id: &str) {
        lock(&self.nodes).insert(ip.to_string(), provider_id.to_string());
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VirtualNetwork for MockNetwork {
    fn id(&self) -> &str {
        &self.id
    }

    fn cidr(&self) -> &str {
        &self.cidr
    }

    fn nodes(&self) -> HashMap<String, String> {
        lock(&self.nodes).clone()
    }

    async fn remove_node(&self, provider_id: &str, ip: &str) -> Result<()> {
        let mut nodes = lock(&self.nodes);
        match nodes.get(ip) {
            Some(p) if p == provider_id => {
                nodes.remove(ip);
                Ok(())
            }
            _ => Err(anyhow!("MockNetwork: node {} ({}) not attached", ip, provider_id)),
        }
    }
}

/// Hands out one `MockMarketplace` per network; the same handle on every connect.
pub struct MockConnector {
    markets: HashMap<Network, Arc<MockMarketplace>>,
    unavailable: Mutex<Vec<Network>>,
}

impl MockConnector {
    pub fn new() -> Self {
        let markets = Network::ALL
            .iter()
            .map(|n| (*n, Arc::new(MockMarketplace::new(*n))))
            .collect();
        Self {
            markets,
            unavailable: Mutex::new(Vec::new()),
        }
    }

    pub fn market(&self, network: Network) -> Option<Arc<MockMarketplace>> {
        self.markets.get(&network).cloned()
    }

    pub fn set_unavailable(&self, network: Network) {
        lock(&self.unavailable).push(network);
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketplaceConnector for MockConnector {
    async fn connect(&self, network: Network) -> Result<Arc<dyn Marketplace>> {
        if lock(&self.unavailable).contains(&network) {
            return Err(anyhow!("MockConnector: {} unavailable", network));
        }
        let market = self
            .markets
            .get(&network)
            .cloned()
            .ok_or_else(|| anyhow!("MockConnector: no market for {}", network))?;
        Ok(market)
    }
}

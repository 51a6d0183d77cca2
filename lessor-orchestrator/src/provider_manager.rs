use std::collections::HashMap;
use std::sync::Arc;

use lessor_common::Network;
use lessor_providers::{Marketplace, MarketplaceConnector};
use tokio::sync::OnceCell;

use crate::error::LifecycleError;

/// One lazily-opened marketplace connection per supported network. Concurrent callers
/// share a single in-flight connection attempt; a failed attempt is retried on the
/// next call.
pub struct MarketplaceManager {
    connector: Arc<dyn MarketplaceConnector>,
    connections: HashMap<Network, OnceCell<Arc<dyn Marketplace>>>,
}

impl MarketplaceManager {
    pub fn new(connector: Arc<dyn MarketplaceConnector>) -> Self {
        let connections = Network::ALL
            .iter()
            .map(|n| (*n, OnceCell::new()))
            .collect();
        Self {
            connector,
            connections,
        }
    }

    /// Picks the connector named by `MARKETPLACE`.
    pub fn connector_for(name: &str) -> Option<Arc<dyn MarketplaceConnector>> {
        match name.to_lowercase().as_str() {
            #[cfg(feature = "provider-mock")]
            "mock" => Some(Arc::new(lessor_providers::mock::MockConnector::new())),
            // Add other marketplaces here.
            _ => None,
        }
    }

    pub async fn get(&self, network: Network) -> Result<Arc<dyn Marketplace>, LifecycleError> {
        let cell = self
            .connections
            .get(&network)
            .ok_or_else(|| LifecycleError::Validation(format!("Network not supported: {network}")))?;
        let market = cell
            .get_or_try_init(|| async {
                tracing::info!("🔌 connecting to marketplace on {}", network);
                self.connector.connect(network).await
            })
            .await
            .map_err(|e| {
                tracing::error!("❌ marketplace on {} unavailable: {:#}", network, e);
                LifecycleError::marketplace(e)
            })?;
        Ok(market.clone())
    }

    /// All networks or nothing.
    pub async fn get_all(&self) -> Result<HashMap<Network, Arc<dyn Marketplace>>, LifecycleError> {
        let mut out = HashMap::new();
        for network in Network::ALL {
            out.insert(network, self.get(network).await?);
        }
        Ok(out)
    }
}

use std::sync::Arc;

use lessor_common::{Network, VpnInfo};
use lessor_providers::VirtualNetwork;
use serde_json::json;

use crate::error::LifecycleError;
use crate::provider_manager::MarketplaceManager;
use crate::registry::VpnRegistry;
use crate::store::{EntityKind, Records};

/// Marketplace virtual networks. Live handles only exist in the registry; a network
/// created before a restart can no longer be joined or destroyed from here.
pub struct VpnManager {
    markets: Arc<MarketplaceManager>,
    records: Records,
    handles: Arc<VpnRegistry>,
}

impl VpnManager {
    pub fn new(markets: Arc<MarketplaceManager>, records: Records, handles: Arc<VpnRegistry>) -> Self {
        Self {
            markets,
            records,
            handles,
        }
    }

    pub async fn handle(&self, network: Network, vpn_id: &str) -> Option<Arc<dyn VirtualNetwork>> {
        self.handles.get(network, vpn_id).await
    }

    /// `temp_id` names a placeholder record written by the caller; it is re-keyed to
    /// the marketplace network id.
    pub async fn create_vpn(
        &self,
        network: Network,
        name: &str,
        cidr: &str,
        temp_id: Option<&str>,
    ) -> Result<VpnInfo, LifecycleError> {
        if name.trim().is_empty() || cidr.trim().is_empty() {
            return Err(LifecycleError::Validation("vpn name and cidr are required".to_string()));
        }

        let market = self.markets.get(network).await?;
        let handle = market
            .create_network(cidr)
            .await
            .map_err(LifecycleError::marketplace)?;

        let info = VpnInfo {
            vpn_id: handle.id().to_string(),
            network,
            name: name.to_string(),
            cidr: cidr.to_string(),
            state: "Active".to_string(),
            created_at: Some(chrono::Utc::now().timestamp()),
        };
        self.handles.insert(network, handle).await;

        let moved = match temp_id {
            Some(temp_id) => self
                .records
                .store()
                .update(EntityKind::Vpn, temp_id, network, json!(info))
                .await
                .map_err(LifecycleError::store)?,
            None => false,
        };
        if !moved {
            self.records.insert_vpn(&info).await?;
        }

        tracing::info!("🛰️ vpn {} created on {} ({})", info.vpn_id, network, cidr);
        Ok(info)
    }

    /// Refuses while instances other than the requestor are attached.
    pub async fn terminate_vpn(&self, network: Network, vpn_id: &str) -> Result<(), LifecycleError> {
        let handle = self
            .handles
            .get(network, vpn_id)
            .await
            .ok_or_else(|| LifecycleError::NotFound {
                entity: "vpn",
                id: vpn_id.to_string(),
                network,
            })?;

        let node_count = handle.nodes().len();
        if node_count > 1 {
            return Err(LifecycleError::Validation(format!(
                "There are running nodes on this VPN: {vpn_id} ({node_count} nodes)."
            )));
        }

        let market = self.markets.get(network).await?;
        market
            .destroy_network(vpn_id)
            .await
            .map_err(LifecycleError::marketplace)?;
        self.handles.remove(network, vpn_id).await;
        self.records.delete_vpn(vpn_id, network).await?;

        tracing::info!("🧹 vpn {} destroyed on {}", vpn_id, network);
        Ok(())
    }

    /// IPs attached to the network, sorted.
    pub async fn nodes(&self, network: Network, vpn_id: &str) -> Result<Vec<String>, LifecycleError> {
        let handle = self
            .handles
            .get(network, vpn_id)
            .await
            .ok_or_else(|| LifecycleError::NotFound {
                entity: "vpn",
                id: vpn_id.to_string(),
                network,
            })?;
        let mut ips: Vec<String> = handle.nodes().into_keys().collect();
        ips.sort();
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use lessor_providers::mock::MockConnector;
    use lessor_common::{DemandOptions, OrderOptions};
    use lessor_providers::MarketOrder;

    fn manager() -> (VpnManager, Arc<MockConnector>, Records) {
        let connector = Arc::new(MockConnector::new());
        let records = Records::new(Arc::new(MemoryStore::new()));
        let vpns = VpnManager::new(
            Arc::new(MarketplaceManager::new(connector.clone())),
            records.clone(),
            Arc::new(VpnRegistry::new()),
        );
        (vpns, connector, records)
    }

    #[tokio::test]
    async fn create_list_and_destroy() {
        let (vpns, connector, records) = manager();
        let info = vpns
            .create_vpn(Network::Holesky, "lab", "192.168.0.0/24", None)
            .await
            .unwrap();
        assert!(records.get_vpn(&info.vpn_id, Network::Holesky).await.unwrap().is_some());
        assert_eq!(vpns.nodes(Network::Holesky, &info.vpn_id).await.unwrap(), vec!["192.168.0.1"]);

        vpns.terminate_vpn(Network::Holesky, &info.vpn_id).await.unwrap();
        let market = connector.market(Network::Holesky).unwrap();
        assert!(market.mock_network(&info.vpn_id).is_none());
        assert!(records.get_vpn(&info.vpn_id, Network::Holesky).await.unwrap().is_none());
        assert!(matches!(
            vpns.nodes(Network::Holesky, &info.vpn_id).await,
            Err(LifecycleError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn refuses_to_destroy_network_with_nodes() {
        let (vpns, connector, _) = manager();
        let info = vpns
            .create_vpn(Network::Polygon, "lab", "10.0.0.0/24", None)
            .await
            .unwrap();
        let handle = vpns.handle(Network::Polygon, &info.vpn_id).await.unwrap();
        let market = connector.market(Network::Polygon).unwrap();
        let order = MarketOrder {
            demand: DemandOptions::default(),
            market: OrderOptions::default(),
            allocation_id: "alloc".to_string(),
            network: Some(handle),
        };
        lessor_providers::Marketplace::acquire_rental(market.as_ref(), order, None)
            .await
            .unwrap();

        let err = vpns.terminate_vpn(Network::Polygon, &info.vpn_id).await.unwrap_err();
        assert_eq!(err.classification(), "validation_error");
        assert_eq!(vpns.nodes(Network::Polygon, &info.vpn_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn placeholder_record_is_rekeyed() {
        let (vpns, _, records) = manager();
        records
            .store()
            .insert(
                EntityKind::Vpn,
                Network::Holesky,
                json!({"vpn_id": "tmp-vpn", "network": "holesky", "name": "lab", "cidr": "", "state": "Pending"}),
            )
            .await
            .unwrap();
        let info = vpns
            .create_vpn(Network::Holesky, "lab", "192.168.8.0/24", Some("tmp-vpn"))
            .await
            .unwrap();
        assert!(records.get_vpn("tmp-vpn", Network::Holesky).await.unwrap().is_none());
        let stored = records.get_vpn(&info.vpn_id, Network::Holesky).await.unwrap().unwrap();
        assert_eq!(stored.state, "Active");
    }
}

use std::sync::Arc;

use lessor_common::{Network, ServiceConfig, ServiceKind};
use lessor_providers::ExeUnit;

use crate::error::LifecycleError;
use crate::ports::PortAllocator;
use crate::registry::{BindingRegistry, InstanceKey, ServiceBinding};
use crate::store::Records;
use crate::web_proxy::RouteStore;

/// Result of attaching the requested services to a fresh rental.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachedServices {
    /// Requested services with `port` and `listen` filled in.
    pub services: Vec<ServiceConfig>,
    /// Public hostname of the `web` service.
    pub endpoint: Option<String>,
}

/// Exposes instance ports locally (TCP proxies) and publicly (reverse-proxy routes).
pub struct ServiceBinder {
    ports: Arc<dyn PortAllocator>,
    routes: Arc<dyn RouteStore>,
    bindings: Arc<BindingRegistry>,
    records: Records,
}

impl ServiceBinder {
    pub fn new(
        ports: Arc<dyn PortAllocator>,
        routes: Arc<dyn RouteStore>,
        bindings: Arc<BindingRegistry>,
        records: Records,
    ) -> Self {
        Self {
            ports,
            routes,
            bindings,
            records,
        }
    }

    pub fn bindings(&self) -> &Arc<BindingRegistry> {
        &self.bindings
    }

    /// Attach services in order. Each binding is registered as soon as its proxy is up,
    /// so teardown closes it even when a later service fails. The first failure aborts.
    pub async fn setup_services(
        &self,
        key: &InstanceKey,
        exe: &dyn ExeUnit,
        services: &[ServiceConfig],
    ) -> Result<AttachedServices, LifecycleError> {
        let mut attached = AttachedServices::default();

        for svc in services {
            let remote_port = svc.remote_port();
            let listen_port = self.ports.allocate().await.map_err(|e| {
                LifecycleError::ServiceSetup(format!("no local port for {}: {:#}", svc.name, e))
            })?;

            let proxy = exe
                .create_tcp_proxy(remote_port, listen_port)
                .await
                .map_err(|e| {
                    LifecycleError::ServiceSetup(format!(
                        "failed to proxy {} port {}: {:#}",
                        svc.name, remote_port, e
                    ))
                })?;

            let route_id = match svc.name {
                ServiceKind::Web => Some(exe.activity_id().to_string()),
                ServiceKind::Ssh => None,
            };
            self.bindings
                .add(
                    key,
                    ServiceBinding {
                        kind: svc.name,
                        remote_port,
                        listen_port,
                        route_id: route_id.clone(),
                        ssh_key_id: svc.ssh_key_id().map(str::to_string),
                        proxy,
                    },
                )
                .await;
            tracing::info!(
                "🔗 {} {} proxied: remote {} -> local {}",
                key,
                svc.name,
                remote_port,
                listen_port
            );

            match svc.name {
                ServiceKind::Ssh => {
                    self.enable_ssh(key.network, exe, svc.ssh_key_id()).await?;
                }
                ServiceKind::Web => {
                    let route_id = route_id.unwrap_or_default();
                    let host = self
                        .routes
                        .register(&route_id, listen_port)
                        .await
                        .map_err(|e| {
                            LifecycleError::ServiceSetup(format!("failed to register route: {:#}", e))
                        })?;
                    attached.endpoint = Some(host);
                }
            }

            attached.services.push(ServiceConfig {
                port: Some(remote_port),
                listen: Some(listen_port),
                ..svc.clone()
            });
        }

        Ok(attached)
    }

    async fn enable_ssh(
        &self,
        network: Network,
        exe: &dyn ExeUnit,
        key_id: Option<&str>,
    ) -> Result<(), LifecycleError> {
        let Some(key_id) = key_id else {
            return Err(LifecycleError::ServiceSetup(
                "ssh service requires options.ssh_key_id".to_string(),
            ));
        };
        let key = self
            .records
            .get_ssh_key(key_id, network)
            .await?
            .ok_or_else(|| LifecycleError::ServiceSetup(format!("SSH key not found: {key_id}")))?;

        let public_key = key.public_key.trim();
        if !is_safe_public_key(public_key) {
            return Err(LifecycleError::ServiceSetup(format!(
                "SSH key {key_id} is not a valid public key"
            )));
        }

        let output = exe
            .run(&ssh_setup_command(public_key))
            .await
            .map_err(|e| LifecycleError::ServiceSetup(format!("failed to start sshd: {:#}", e)))?;
        if !output.success() {
            return Err(LifecycleError::ServiceSetup(format!(
                "failed to start sshd (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Close every binding of `key` and drop its registry entry. Returns the failures.
    pub async fn close_services(&self, key: &InstanceKey) -> Vec<String> {
        let mut failures = Vec::new();
        for binding in self.bindings.take_all(key).await {
            if let Err(e) = binding.proxy.close().await {
                tracing::warn!("⚠️ {} failed to close {} proxy on {}: {:#}", key, binding.kind, binding.listen_port, e);
                failures.push(format!("{} proxy: {:#}", binding.kind, e));
            }
            if let Some(route_id) = &binding.route_id {
                if let Err(e) = self.routes.remove(route_id).await {
                    tracing::warn!("⚠️ {} failed to remove route {}: {:#}", key, route_id, e);
                    failures.push(format!("route {route_id}: {:#}", e));
                }
            }
        }
        failures
    }
}

/// One-shot guest command: host keys, authorized key, sshd.
pub fn ssh_setup_command(public_key: &str) -> String {
    format!(
        "mkdir -p /run/sshd /root/.ssh && ssh-keygen -A && ssh-keygen -t rsa -f /root/.ssh/id_rsa -N '' -q && echo -n '{}' > /root/.ssh/authorized_keys && /usr/sbin/sshd",
        public_key
    )
}

/// The key ends up inside a single-quoted shell string.
pub fn is_safe_public_key(key: &str) -> bool {
    const PREFIXES: [&str; 3] = ["ssh-", "ecdsa-", "sk-"];
    !key.is_empty()
        && PREFIXES.iter().any(|p| key.starts_with(p))
        && key
            .chars()
            .all(|c| !c.is_control() && c != '\'' && c != '\\')
}

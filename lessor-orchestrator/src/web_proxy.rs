use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

/// Reverse-proxy routing table: one route per instance web service.
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Route `<route_id>.<domain>` to the local `listen_port`; returns the public hostname.
    async fn register(&self, route_id: &str, listen_port: u16) -> Result<String>;

    /// Removing a route that does not exist is not an error.
    async fn remove(&self, route_id: &str) -> Result<()>;
}

/// Traefik file provider: one dynamic configuration file per route.
#[derive(Debug, Clone)]
pub struct TraefikRouteStore {
    config_dir: PathBuf,
    domain: String,
    upstream_host: String,
}

impl TraefikRouteStore {
    pub fn new(config_dir: impl Into<PathBuf>, domain: impl Into<String>, upstream_host: impl Into<String>) -> Self {
        Self {
            config_dir: config_dir.into(),
            domain: domain.into(),
            upstream_host: upstream_host.into(),
        }
    }

    pub fn hostname(&self, route_id: &str) -> String {
        format!("{}.{}", route_id, self.domain)
    }

    pub fn route_path(&self, route_id: &str) -> PathBuf {
        self.config_dir.join(format!("{route_id}.yml"))
    }

    pub fn route_document(&self, route_id: &str, listen_port: u16) -> serde_json::Value {
        json!({
            "http": {
                "routers": {
                    (route_id): {
                        "rule": format!("Host(`{}`)", self.hostname(route_id)),
                        "service": route_id,
                        "entryPoints": ["web"],
                    }
                },
                "services": {
                    (route_id): {
                        "loadBalancer": {
                            "servers": [{"url": format!("http://{}:{}", self.upstream_host, listen_port)}]
                        }
                    }
                }
            }
        })
    }
}

fn valid_route_id(route_id: &str) -> bool {
    !route_id.is_empty()
        && route_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl RouteStore for TraefikRouteStore {
    async fn register(&self, route_id: &str, listen_port: u16) -> Result<String> {
        if !valid_route_id(route_id) {
            anyhow::bail!("invalid route id {:?}", route_id);
        }
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.config_dir.display()))?;

        let path = self.route_path(route_id);
        let body = serde_yaml::to_string(&self.route_document(route_id, listen_port))
            .context("Failed to serialize route")?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        tracing::info!("🌐 route registered: {} -> :{}", self.hostname(route_id), listen_port);
        Ok(self.hostname(route_id))
    }

    async fn remove(&self, route_id: &str) -> Result<()> {
        if !valid_route_id(route_id) {
            return Ok(());
        }
        let path = self.route_path(route_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!("🧹 route removed: {}", self.hostname(route_id));
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_writes_route_file_and_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraefikRouteStore::new(dir.path().join("traefik"), "lessor.dev", "backend");

        let host = store.register("activity-7", 40123).await.unwrap();
        assert_eq!(host, "activity-7.lessor.dev");

        let raw = std::fs::read_to_string(store.route_path("activity-7")).unwrap();
        let doc: serde_json::Value = serde_yaml::from_str(&raw).unwrap();
        assert!(raw.starts_with("http:"));
        assert_eq!(
            doc["http"]["routers"]["activity-7"]["rule"],
            "Host(`activity-7.lessor.dev`)"
        );
        assert_eq!(
            doc["http"]["services"]["activity-7"]["loadBalancer"]["servers"][0]["url"],
            "http://backend:40123"
        );

        store.remove("activity-7").await.unwrap();
        assert!(!store.route_path("activity-7").exists());
        store.remove("activity-7").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_path_like_route_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraefikRouteStore::new(dir.path(), "lessor.dev", "backend");
        assert!(store.register("../etc/passwd", 80).await.is_err());
    }
}

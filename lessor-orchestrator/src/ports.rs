use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpListener;

/// Source of local ports for new service proxies.
#[async_trait]
pub trait PortAllocator: Send + Sync {
    async fn allocate(&self) -> Result<u16>;
}

/// Lets the OS pick a free port on the loopback interface. The probe listener is
/// released before the port is handed out, so the proxy can bind it right after.
#[derive(Debug, Default, Clone, Copy)]
pub struct EphemeralPortAllocator;

#[async_trait]
impl PortAllocator for EphemeralPortAllocator {
    async fn allocate(&self) -> Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind an ephemeral port")?;
        let port = listener.local_addr()?.port();
        drop(listener);
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocated_port_is_bindable() {
        let port = EphemeralPortAllocator.allocate().await.unwrap();
        assert_ne!(port, 0);

        let _held = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        assert!(TcpListener::bind(("127.0.0.1", port)).await.is_err());
    }
}

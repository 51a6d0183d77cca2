//! SSH sessions to instances through their local `ssh` proxy port, with optional
//! reverse tunnels (guest port -> host side service, typically a SOCKS proxy).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lessor_common::TunnelConfig;
use russh::client::{self, Config, Handle, Handler};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::PublicKey;
use russh::keys::PrivateKey;
use russh::Channel;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, info, warn};

use crate::error::LifecycleError;
use crate::registry::{BindingRegistry, InstanceKey};
use crate::store::Records;

pub const DEFAULT_USER: &str = "root";

/// Byte stream of an interactive shell.
pub trait ShellIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ShellIo for T {}

#[derive(Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key: String,
}

impl std::fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn SshConnection>>;
}

#[async_trait]
pub trait SshConnection: Send + Sync {
    /// Ask the guest to listen on `tunnel.local_port` and pipe every inbound
    /// connection to `tunnel.remote_host:tunnel.remote_port` on this side.
    async fn forward_in(&self, tunnel: &TunnelConfig) -> Result<()>;
    async fn unforward_in(&self, local_port: u16) -> Result<()>;
    async fn open_shell(&self) -> Result<Box<dyn ShellIo>>;
    async fn close(&self) -> Result<()>;
}

struct SshSession {
    generation: u64,
    connection: Arc<dyn SshConnection>,
    tunnels: Vec<TunnelConfig>,
}

/// Identifies one session instance; closing with a stale handle is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub key: InstanceKey,
    pub generation: u64,
}

pub struct OpenSession {
    pub handle: SessionHandle,
    pub shell: Box<dyn ShellIo>,
    /// Requested tunnel; `state` tells whether it is up.
    pub tunnel: Option<TunnelConfig>,
}

/// At most one session per instance; a new session replaces the previous one.
pub struct SshSessionManager {
    connector: Arc<dyn SshConnector>,
    bindings: Arc<BindingRegistry>,
    records: Records,
    sessions: Mutex<HashMap<InstanceKey, SshSession>>,
    generation: AtomicU64,
}

impl SshSessionManager {
    pub fn new(connector: Arc<dyn SshConnector>, bindings: Arc<BindingRegistry>, records: Records) -> Self {
        Self {
            connector,
            bindings,
            records,
            sessions: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub async fn open_session(
        &self,
        key: &InstanceKey,
        username: Option<&str>,
        tunnel: Option<TunnelConfig>,
    ) -> Result<OpenSession, LifecycleError> {
        let (listen_port, key_id) = self.bindings.ssh_binding(key).await.ok_or_else(|| {
            LifecycleError::SshSession(format!(
                "Your instance does not have terminal service enabled for agreement: {}",
                key.agreement_id
            ))
        })?;
        let key_id = key_id
            .ok_or_else(|| LifecycleError::SshSession("SSH key not configured".to_string()))?;
        let private_key = self
            .records
            .get_ssh_key(&key_id, key.network)
            .await?
            .and_then(|k| k.private_key)
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LifecycleError::SshSession(format!("SSH key not found: {key_id}")))?;

        self.terminate_session(key).await;

        let target = SshTarget {
            host: "127.0.0.1".to_string(),
            port: listen_port,
            username: username.unwrap_or(DEFAULT_USER).to_string(),
            private_key,
        };
        let connection: Arc<dyn SshConnection> = Arc::from(
            self.connector
                .connect(&target)
                .await
                .map_err(|e| LifecycleError::SshSession(format!("{e:#}")))?,
        );

        let mut tunnels = Vec::new();
        let tunnel = match tunnel {
            Some(mut t) => {
                match connection.forward_in(&t).await {
                    Ok(()) => {
                        info!(
                            "🚇 {} forwarding port {} -> {}:{}",
                            key, t.local_port, t.remote_host, t.remote_port
                        );
                        tunnels.push(t.clone());
                    }
                    Err(e) => {
                        warn!("⚠️ {} port forward {} failed: {:#}", key, t.local_port, e);
                        t.state = false;
                    }
                }
                Some(t)
            }
            None => None,
        };

        let shell = match connection.open_shell().await {
            Ok(s) => s,
            Err(e) => {
                for t in &tunnels {
                    let _ = connection.unforward_in(t.local_port).await;
                }
                let _ = connection.close().await;
                return Err(LifecycleError::SshSession(format!("failed to open shell: {e:#}")));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let replaced = self.sessions.lock().await.insert(
            key.clone(),
            SshSession {
                generation,
                connection,
                tunnels,
            },
        );
        // Lost a race with another open for the same instance.
        if let Some(old) = replaced {
            Self::teardown(key, old).await;
        }

        info!("🖥️ ssh session {} (gen {}) opened", key, generation);
        Ok(OpenSession {
            handle: SessionHandle {
                key: key.clone(),
                generation,
            },
            shell,
            tunnel,
        })
    }

    pub async fn add_tunnel(&self, key: &InstanceKey, tunnel: TunnelConfig) -> Result<TunnelConfig, LifecycleError> {
        let connection = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(key)
                .map(|s| s.connection.clone())
                .ok_or_else(|| LifecycleError::SshSession("No SSH connection found".to_string()))?
        };
        connection
            .forward_in(&tunnel)
            .await
            .map_err(|e| LifecycleError::SshSession(format!("port forward failed: {e:#}")))?;

        let mut tunnel = tunnel;
        tunnel.state = true;
        if let Some(session) = self.sessions.lock().await.get_mut(key) {
            session.tunnels.push(tunnel.clone());
        }
        Ok(tunnel)
    }

    pub async fn close_tunnel(&self, key: &InstanceKey, local_port: u16) -> bool {
        let connection = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(key) else {
                return false;
            };
            let before = session.tunnels.len();
            session.tunnels.retain(|t| t.local_port != local_port);
            if session.tunnels.len() == before {
                return false;
            }
            session.connection.clone()
        };
        if let Err(e) = connection.unforward_in(local_port).await {
            warn!("⚠️ {} failed to cancel forward {}: {:#}", key, local_port, e);
        }
        true
    }

    pub async fn list_tunnels(&self, key: &InstanceKey) -> Vec<TunnelConfig> {
        self.sessions
            .lock()
            .await
            .get(key)
            .map(|s| s.tunnels.clone())
            .unwrap_or_default()
    }

    pub async fn has_session(&self, key: &InstanceKey) -> bool {
        self.sessions.lock().await.contains_key(key)
    }

    /// Ends whatever session `key` has. Idempotent.
    pub async fn terminate_session(&self, key: &InstanceKey) -> bool {
        let session = self.sessions.lock().await.remove(key);
        match session {
            Some(session) => {
                Self::teardown(key, session).await;
                true
            }
            None => false,
        }
    }

    /// Ends the session only if it is still the one `handle` refers to.
    pub async fn end_session(&self, handle: &SessionHandle) -> bool {
        let session = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&handle.key) {
                Some(s) if s.generation == handle.generation => sessions.remove(&handle.key),
                _ => None,
            }
        };
        match session {
            Some(session) => {
                Self::teardown(&handle.key, session).await;
                true
            }
            None => false,
        }
    }

    pub async fn terminate_all(&self) {
        let sessions: Vec<(InstanceKey, SshSession)> = self.sessions.lock().await.drain().collect();
        for (key, session) in sessions {
            Self::teardown(&key, session).await;
        }
    }

    async fn teardown(key: &InstanceKey, session: SshSession) {
        for tunnel in &session.tunnels {
            if let Err(e) = session.connection.unforward_in(tunnel.local_port).await {
                debug!("{} cancel forward {}: {:#}", key, tunnel.local_port, e);
            }
        }
        if let Err(e) = session.connection.close().await {
            debug!("{} close: {:#}", key, e);
        }
        info!("🔒 ssh session {} (gen {}) terminated", key, session.generation);
    }
}

/// Text shown before the shell stream starts.
pub fn banner(tunnel: Option<&TunnelConfig>) -> String {
    let state = tunnel.is_some_and(|t| t.state);
    let port = tunnel.map(|t| t.local_port).unwrap_or(1080);

    let content: Vec<String> = if state {
        vec![
            "Tunnel: True".to_string(),
            "host: 127.0.0.1".to_string(),
            format!("Port: {port}"),
            "Internet access:".to_string(),
            format!("  socks5: socks5h://127.0.0.1:{port}"),
            "  For curl:".to_string(),
            format!("    echo 'export ALL_PROXY=socks5h://127.0.0.1:{port}' >> ~/.bashrc && source ~/.bashrc"),
            "  For apt:".to_string(),
            format!("    echo -n 'Acquire::http::Proxy \"socks5h://127.0.0.1:{port}/\";' >> /etc/apt/apt.conf.d/12proxy"),
        ]
    } else {
        vec![
            "Tunnel: False".to_string(),
            "Notice: ".to_string(),
            "  Instance will not have internet access.".to_string(),
            "  Please check the network access configuration.".to_string(),
        ]
    };

    let inner = content.iter().map(|l| l.chars().count()).max().unwrap_or(0);
    let mut lines = Vec::with_capacity(content.len() + 4);
    lines.push(String::new());
    lines.push(format!("╔{}╗", "═".repeat(inner + 2)));
    for line in &content {
        lines.push(format!("║ {:<width$} ║", line, width = inner));
    }
    lines.push(format!("╚{}╝", "═".repeat(inner + 2)));
    lines.push(String::new());
    lines.join("\n")
}

/// Outside host the SOCKS check connects to through the proxy.
pub const SOCKS_CHECK_DESTINATION: (&str, u16) = ("www.google.com", 80);

/// True when `host:port` is a SOCKS5 proxy that can reach [`SOCKS_CHECK_DESTINATION`].
pub async fn probe_tunnel_target(host: &str, port: u16, timeout: Duration) -> bool {
    probe_socks5(host, port, SOCKS_CHECK_DESTINATION, timeout).await
}

pub async fn probe_socks5(host: &str, port: u16, destination: (&str, u16), timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, Socks5Stream::connect((host, port), destination)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("socks5 check via {}:{} failed: {}", host, port, e);
            false
        }
        Err(_) => {
            debug!("socks5 check via {}:{} timed out", host, port);
            false
        }
    }
}

// --- russh ---

type TunnelTargets = Arc<std::sync::Mutex<HashMap<u32, (String, u16)>>>;

fn lock_targets(targets: &TunnelTargets) -> std::sync::MutexGuard<'_, HashMap<u32, (String, u16)>> {
    targets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Client handler for russh: routes forwarded connections to their tunnel target.
struct ClientHandler {
    targets: TunnelTargets,
}

impl Handler for ClientHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> impl Future<Output = std::result::Result<bool, Self::Error>> + Send {
        // Host keys are generated on the guest at service setup.
        async { Ok(true) }
    }

    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        _connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> impl Future<Output = std::result::Result<(), Self::Error>> + Send {
        let target = lock_targets(&self.targets).get(&connected_port).cloned();
        let origin = format!("{originator_address}:{originator_port}");
        async move {
            let Some((host, port)) = target else {
                debug!("forwarded connection from {} on unknown port {}", origin, connected_port);
                return Ok(());
            };
            tokio::spawn(async move {
                match TcpStream::connect((host.as_str(), port)).await {
                    Ok(mut upstream) => {
                        let mut stream = channel.into_stream();
                        if let Err(e) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
                            debug!("tunnel {} -> {}:{} closed: {}", origin, host, port, e);
                        }
                    }
                    Err(e) => {
                        warn!("⚠️ tunnel target {}:{} unreachable: {}", host, port, e);
                        let _ = channel.close().await;
                    }
                }
            });
            Ok(())
        }
    }
}

struct RusshConnection {
    handle: Mutex<Handle<ClientHandler>>,
    targets: TunnelTargets,
}

#[async_trait]
impl SshConnection for RusshConnection {
    async fn forward_in(&self, tunnel: &TunnelConfig) -> Result<()> {
        let port = u32::from(tunnel.local_port);
        lock_targets(&self.targets).insert(port, (tunnel.remote_host.clone(), tunnel.remote_port));
        let mut handle = self.handle.lock().await;
        if let Err(e) = handle.tcpip_forward("127.0.0.1", port).await {
            lock_targets(&self.targets).remove(&port);
            return Err(anyhow!("tcpip-forward {} refused: {}", port, e));
        }
        Ok(())
    }

    async fn unforward_in(&self, local_port: u16) -> Result<()> {
        let port = u32::from(local_port);
        lock_targets(&self.targets).remove(&port);
        let handle = self.handle.lock().await;
        handle
            .cancel_tcpip_forward("127.0.0.1", port)
            .await
            .map_err(|e| anyhow!("cancel-tcpip-forward {}: {}", port, e))
    }

    async fn open_shell(&self) -> Result<Box<dyn ShellIo>> {
        let channel = {
            let handle = self.handle.lock().await;
            handle
                .channel_open_session()
                .await
                .context("Failed to open channel")?
        };
        channel
            .request_pty(false, "xterm-256color", 120, 40, 0, 0, &[])
            .await
            .context("Failed to request pty")?;
        channel
            .request_shell(false)
            .await
            .context("Failed to request shell")?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) -> Result<()> {
        let handle = self.handle.lock().await;
        handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .context("Failed to disconnect")
    }
}

/// Real SSH transport.
#[derive(Debug, Clone)]
pub struct RusshConnector {
    pub timeout: Duration,
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn SshConnection>> {
        let key = PrivateKey::from_openssh(&target.private_key)
            .map_err(|e| anyhow!("Failed to parse key: {}", e))?;

        let targets: TunnelTargets = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let handler = ClientHandler {
            targets: targets.clone(),
        };
        let addr = (target.host.as_str(), target.port);
        debug!("Connecting to SSH at {}:{}", target.host, target.port);

        let mut session = tokio::time::timeout(
            self.timeout,
            client::connect(Arc::new(Config::default()), addr, handler),
        )
        .await
        .map_err(|_| anyhow!("SSH connection to {}:{} timed out", target.host, target.port))?
        .map_err(|e| anyhow!("Failed to connect: {}", e))?;

        let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
        let auth = session
            .authenticate_publickey(&target.username, key_with_hash)
            .await
            .map_err(|e| anyhow!("Key auth failed: {}", e))?;
        if !auth.success() {
            return Err(anyhow!("Authentication failed for {}", target.username));
        }

        Ok(Box::new(RusshConnection {
            handle: Mutex::new(session),
            targets,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_reflects_tunnel_state() {
        let off = banner(None);
        assert!(off.contains("Tunnel: False"));
        assert!(off.starts_with("\n╔"));

        let on = banner(Some(&TunnelConfig {
            local_port: 1081,
            remote_host: "socks".to_string(),
            remote_port: 1080,
            state: true,
        }));
        assert!(on.contains("socks5h://127.0.0.1:1081"));

        let widths: Vec<usize> = on
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.chars().count())
            .collect();
        assert!(widths.windows(2).all(|w| w[0] == w[1]));
    }

    /// Minimal SOCKS5 proxy answering every CONNECT with `reply`.
    async fn socks5_proxy(reply: u8) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut greeting = [0u8; 2];
                    conn.read_exact(&mut greeting).await?;
                    let mut methods = vec![0u8; greeting[1] as usize];
                    conn.read_exact(&mut methods).await?;
                    conn.write_all(&[5, 0]).await?;

                    let mut request = [0u8; 4];
                    conn.read_exact(&mut request).await?;
                    let addr_len = match request[3] {
                        1 => 4,
                        4 => 16,
                        _ => conn.read_u8().await? as usize,
                    };
                    let mut rest = vec![0u8; addr_len + 2];
                    conn.read_exact(&mut rest).await?;
                    conn.write_all(&[5, reply, 0, 1, 127, 0, 0, 1, 0, 80]).await?;
                    let _ = conn.read(&mut [0u8; 1]).await;
                    Ok::<_, std::io::Error>(())
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn socks5_check_requires_a_working_proxy() {
        let port = socks5_proxy(0).await;
        assert!(probe_socks5("127.0.0.1", port, ("example.test", 80), Duration::from_secs(2)).await);

        // refused by the proxy
        let port = socks5_proxy(5).await;
        assert!(!probe_socks5("127.0.0.1", port, ("example.test", 80), Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn open_port_is_not_enough() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((conn, _)) = listener.accept().await {
                drop(conn);
            }
        });
        assert!(!probe_tunnel_target("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!probe_tunnel_target("127.0.0.1", port, Duration::from_millis(200)).await);
    }
}

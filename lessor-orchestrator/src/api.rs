use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use lessor_common::{CreateInstanceRequest, Network, TunnelConfig};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower_http::cors::{Any, CorsLayer};

use crate::app::AppState;
use crate::error::LifecycleError;
use crate::registry::InstanceKey;
use crate::ssh::{banner, probe_tunnel_target, OpenSession};

const DEFAULT_SOCKS_HOST: &str = "127.0.0.1";
const DEFAULT_SOCKS_PORT: u16 = 1080;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn create_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/instances", post(create_instance))
        .route("/instances/terminate", post(terminate_instances))
        .route("/instances/{network}/{id}/retry", post(retry_instance))
        .route("/vpns", post(create_vpn))
        .route("/vpns/{network}/{id}", delete(terminate_vpn))
        .route("/vpns/{network}/{id}/nodes", get(vpn_nodes))
        .route("/check_socks5", post(check_socks5))
        .route("/ssh/{network}/{agreement_id}", get(ssh_terminal))
        .layer(create_cors())
        .with_state(state)
}

impl IntoResponse for LifecycleError {
    fn into_response(self) -> Response {
        let status = match &self {
            LifecycleError::Validation(_) | LifecycleError::SshSession(_) => StatusCode::BAD_REQUEST,
            LifecycleError::NotFound { .. } => StatusCode::NOT_FOUND,
            LifecycleError::AcquisitionTimeout => StatusCode::GATEWAY_TIMEOUT,
            LifecycleError::Acquisition(_)
            | LifecycleError::ServiceSetup(_)
            | LifecycleError::Marketplace(_) => StatusCode::BAD_GATEWAY,
            LifecycleError::Invalidation(_)
            | LifecycleError::CleanupPhase { .. }
            | LifecycleError::Store(_)
            | LifecycleError::Aggregate { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(json!({
                "success": false,
                "error": self.classification(),
                "details": self.to_string(),
            })),
        )
            .into_response()
    }
}

fn ok(data: Value) -> Response {
    (StatusCode::OK, Json(json!({"success": true, "data": data}))).into_response()
}

/// Bodies are taken as raw JSON so that shape errors (unknown service names,
/// unsupported networks) surface as validation errors in the common envelope.
fn parse_body<T: DeserializeOwned>(body: Value) -> Result<T, LifecycleError> {
    serde_json::from_value(body).map_err(|e| LifecycleError::Validation(format!("invalid request: {e}")))
}

fn parse_network(raw: &str) -> Result<Network, LifecycleError> {
    raw.parse::<Network>()
        .map_err(|e| LifecycleError::Validation(e.to_string()))
}

async fn root() -> &'static str {
    "Lessor Orchestrator Online"
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    ok(json!({
        "status": "ok",
        "monitor_running": state.monitor.is_running().await,
        "deletion_queue": state.controller.deletion_queue().len().await,
    }))
}

async fn create_instance(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    let request: CreateInstanceRequest = match parse_body(body) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    match state.controller.create_instance(request).await {
        Ok(instance) => ok(json!(instance)),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct TerminateRequest {
    network: Network,
    agreement_ids: Vec<String>,
}

async fn terminate_instances(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    let request: TerminateRequest = match parse_body(body) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    match state
        .controller
        .terminate_instances(request.network, &request.agreement_ids)
        .await
    {
        Ok(()) => ok(json!({"terminated": request.agreement_ids})),
        Err(e) => e.into_response(),
    }
}

async fn retry_instance(
    State(state): State<Arc<AppState>>,
    Path((network, id)): Path<(String, String)>,
) -> Response {
    let result = async {
        let network = parse_network(&network)?;
        state.controller.retry_instance(network, &id).await
    }
    .await;
    match result {
        Ok(instance) => ok(json!(instance)),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct CreateVpnRequest {
    network: Network,
    name: String,
    cidr: String,
    #[serde(default)]
    temp_id: Option<String>,
}

async fn create_vpn(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    let request: CreateVpnRequest = match parse_body(body) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    match state
        .vpns
        .create_vpn(
            request.network,
            &request.name,
            &request.cidr,
            request.temp_id.as_deref(),
        )
        .await
    {
        Ok(info) => ok(json!(info)),
        Err(e) => e.into_response(),
    }
}

async fn terminate_vpn(
    State(state): State<Arc<AppState>>,
    Path((network, id)): Path<(String, String)>,
) -> Response {
    let result = async {
        let network = parse_network(&network)?;
        state.vpns.terminate_vpn(network, &id).await
    }
    .await;
    match result {
        Ok(()) => ok(json!({"vpn_id": id})),
        Err(e) => e.into_response(),
    }
}

async fn vpn_nodes(
    State(state): State<Arc<AppState>>,
    Path((network, id)): Path<(String, String)>,
) -> Response {
    let result = async {
        let network = parse_network(&network)?;
        state.vpns.nodes(network, &id).await
    }
    .await;
    match result {
        Ok(nodes) => ok(json!(nodes)),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct CheckSocksRequest {
    host: String,
    port: u16,
}

async fn check_socks5(Json(body): Json<Value>) -> Response {
    let request: CheckSocksRequest = match parse_body(body) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    if probe_tunnel_target(&request.host, request.port, PROBE_TIMEOUT).await {
        ok(json!(format!("socks5://{}:{}", request.host, request.port)))
    } else {
        (
            StatusCode::ACCEPTED,
            Json(json!({
                "success": false,
                "error": "socks5_unreachable",
                "details": "please check if the proxy server is running",
            })),
        )
            .into_response()
    }
}

// --- terminal ---

#[derive(Debug, Default, Deserialize)]
pub struct TerminalQuery {
    pub user_name: Option<String>,
    pub tunnel_port: Option<u16>,
    pub socks_host: Option<String>,
    pub socks_port: Option<u16>,
    /// Set by callers that already know the tunnel target is reachable.
    pub state: Option<bool>,
}

impl TerminalQuery {
    async fn tunnel(&self) -> Option<TunnelConfig> {
        let local_port = self.tunnel_port?;
        let remote_host = self
            .socks_host
            .clone()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SOCKS_HOST.to_string());
        let remote_port = self.socks_port.unwrap_or(DEFAULT_SOCKS_PORT);
        let state = match self.state {
            Some(true) => true,
            _ => probe_tunnel_target(&remote_host, remote_port, PROBE_TIMEOUT).await,
        };
        Some(TunnelConfig {
            local_port,
            remote_host,
            remote_port,
            state,
        })
    }
}

/// Decodes shell output chunk by chunk; a character split across reads is held
/// back until its remaining bytes arrive.
#[derive(Debug, Default)]
struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Whatever is left once the stream ended.
    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

fn frame(kind: &str, data: &str) -> Message {
    Message::Text(json!({"type": kind, "data": data}).to_string().into())
}

async fn ssh_terminal(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path((network, agreement_id)): Path<(String, String)>,
    Query(query): Query<TerminalQuery>,
) -> Response {
    let network = match parse_network(&network) {
        Ok(n) => n,
        Err(e) => return e.into_response(),
    };
    let key = InstanceKey::new(agreement_id, network);
    ws.on_upgrade(move |socket| terminal_session(socket, state, key, query))
}

async fn terminal_session(mut socket: WebSocket, state: Arc<AppState>, key: InstanceKey, query: TerminalQuery) {
    let tunnel = query.tunnel().await;
    let session = match state
        .ssh
        .open_session(&key, query.user_name.as_deref(), tunnel)
        .await
    {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("⚠️ terminal for {} refused: {}", key, e);
            let _ = socket.send(frame("error", &e.to_string())).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let OpenSession {
        handle,
        mut shell,
        tunnel,
    } = session;

    if socket.send(frame("data", &banner(tunnel.as_ref()))).await.is_ok() {
        let mut buf = vec![0u8; 8192];
        let mut output = Utf8Stream::default();
        loop {
            tokio::select! {
                read = shell.read(&mut buf) => match read {
                    Ok(0) => {
                        let rest = output.finish();
                        if !rest.is_empty() {
                            let _ = socket.send(frame("data", &rest)).await;
                        }
                        break;
                    }
                    Ok(n) => {
                        let text = output.decode(&buf[..n]);
                        if text.is_empty() {
                            continue;
                        }
                        if socket.send(frame("data", &text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = socket.send(frame("error", &e.to_string())).await;
                        break;
                    }
                },
                msg = socket.recv() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if shell.write_all(text.as_str().as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if shell.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    state.ssh.end_session(&handle).await;
    let _ = socket.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn explicit_tunnel_state_skips_probe() {
        let query = TerminalQuery {
            tunnel_port: Some(9050),
            state: Some(true),
            ..Default::default()
        };
        let tunnel = query.tunnel().await.unwrap();
        assert!(tunnel.state);
        assert_eq!(tunnel.remote_host, DEFAULT_SOCKS_HOST);
        assert_eq!(tunnel.remote_port, DEFAULT_SOCKS_PORT);
    }

    #[tokio::test]
    async fn no_tunnel_without_port() {
        assert!(TerminalQuery::default().tunnel().await.is_none());
    }

    #[test]
    fn split_characters_are_reassembled() {
        let bytes = "╔═╗".as_bytes();
        let mut stream = Utf8Stream::default();
        assert_eq!(stream.decode(&bytes[..1]), "");
        assert_eq!(stream.decode(&bytes[1..4]), "╔");
        assert_eq!(stream.decode(&bytes[4..8]), "═");
        assert_eq!(stream.decode(&bytes[8..]), "╗");
        assert_eq!(stream.finish(), "");
    }

    #[test]
    fn invalid_bytes_are_replaced_once() {
        let mut stream = Utf8Stream::default();
        assert_eq!(stream.decode(b"ok\xffgo"), "ok\u{FFFD}go");
        assert_eq!(stream.decode(&[0xe2, 0x95]), "");
        assert_eq!(stream.finish(), "\u{FFFD}");
    }

    #[test]
    fn error_envelope_status() {
        let resp = LifecycleError::Validation("bad".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = LifecycleError::AcquisitionTimeout.into_response();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        let resp = LifecycleError::NotFound {
            entity: "vpn",
            id: "v".into(),
            network: Network::Holesky,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

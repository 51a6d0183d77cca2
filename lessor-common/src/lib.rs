use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod bus;

// --- Enums ---

/// Payment networks the marketplace can settle on. Everything downstream is generic
/// over this closed set.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Holesky,
    Polygon,
}

impl Network {
    pub const ALL: [Network; 2] = [Network::Holesky, Network::Polygon];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Holesky => "holesky",
            Network::Polygon => "polygon",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Network not supported: {0}")]
pub struct UnsupportedNetwork(pub String);

impl FromStr for Network {
    type Err = UnsupportedNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "holesky" => Ok(Network::Holesky),
            "polygon" => Ok(Network::Polygon),
            other => Err(UnsupportedNetwork(other.to_string())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    Creating,     // Order sent to the market, waiting for a provider
    Active,       // Rental running, services attached
    Terminating,  // Teardown requested
    Terminated,   // Teardown done, row waiting for delayed deletion
    CreateFailed, // Acquisition or service setup failed
    Error,        // Teardown finished with failed phases
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Creating => "Creating",
            InstanceState::Active => "Active",
            InstanceState::Terminating => "Terminating",
            InstanceState::Terminated => "Terminated",
            InstanceState::CreateFailed => "CreateFailed",
            InstanceState::Error => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::Terminated | InstanceState::CreateFailed | InstanceState::Error
        )
    }

    /// Transitions are monotonic. The only way back is an explicit retry of a
    /// failed creation.
    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Creating, Active)
                | (Creating, CreateFailed)
                | (Creating, Terminating)
                | (Creating, Terminated)
                | (Active, Terminating)
                | (Active, Terminated)
                | (Active, Error)
                | (Terminating, Terminated)
                | (Terminating, Error)
                | (CreateFailed, Creating)
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Web,
    Ssh,
}

impl ServiceKind {
    pub const DEFAULT_WEB_PORT: u16 = 80;
    pub const DEFAULT_SSH_PORT: u16 = 22;

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Web => "web",
            ServiceKind::Ssh => "ssh",
        }
    }

    pub fn default_remote_port(&self) -> u16 {
        match self {
            ServiceKind::Web => Self::DEFAULT_WEB_PORT,
            ServiceKind::Ssh => Self::DEFAULT_SSH_PORT,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Requests ---

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ServiceOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_id: Option<String>,
}

/// One exposed service. `port` is the port inside the instance, `listen` the local
/// port the proxy was bound to (filled in by service setup).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServiceConfig {
    pub name: ServiceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ServiceOptions>,
}

impl ServiceConfig {
    pub fn new(name: ServiceKind) -> Self {
        Self {
            name,
            port: None,
            listen: None,
            options: None,
        }
    }

    pub fn remote_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.name.default_remote_port())
    }

    pub fn ssh_key_id(&self) -> Option<&str> {
        self.options.as_ref().and_then(|o| o.ssh_key_id.as_deref())
    }
}

/// Workload demand. Only the fields the orchestrator reads are typed; the rest is
/// handed to the marketplace untouched.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DemandOptions {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub image_tag: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct OrderOptions {
    pub rent_hours: f64,
    #[serde(default)]
    pub pricing: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CreateInstanceRequest {
    /// Placeholder key of the record until the market assigns the real agreement id.
    pub agreement_id: String,
    pub network: Network,
    pub instance_name: String,
    pub demand_options: DemandOptions,
    pub order_options: OrderOptions,
    pub allocation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_script_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpn_id: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

// --- Documents ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Instance {
    pub agreement_id: String,
    pub network: Network,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub allocation_id: String,
    #[serde(default)]
    pub activity_id: Option<String>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub image_tag: String,
    /// Unix seconds.
    #[serde(default)]
    pub expiration: i64,
    #[serde(default)]
    pub vpn_id: Option<String>,
    #[serde(default)]
    pub ipv4_address: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub state: InstanceState,
    #[serde(default)]
    pub details: Option<String>,
    /// Original request, kept for replay.
    #[serde(default)]
    pub configure: Option<CreateInstanceRequest>,
}

impl Instance {
    /// Record written before the market has accepted anything.
    pub fn creating(request: &CreateInstanceRequest) -> Self {
        Self {
            agreement_id: request.agreement_id.clone(),
            network: request.network,
            name: Some(request.instance_name.clone()),
            allocation_id: request.allocation_id.clone(),
            activity_id: None,
            provider_id: None,
            capabilities: request.demand_options.capabilities.clone(),
            image_tag: request.demand_options.image_tag.clone(),
            expiration: 0,
            vpn_id: request.vpn_id.clone(),
            ipv4_address: None,
            services: request.services.clone(),
            endpoint: None,
            state: InstanceState::Creating,
            details: None,
            configure: Some(request.clone()),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.agreement_id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SshKey {
    pub key_id: String,
    pub name: String,
    pub public_key: String,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LaunchScript {
    pub script_id: String,
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VpnInfo {
    pub vpn_id: String,
    pub network: Network,
    pub name: String,
    pub cidr: String,
    pub state: String,
    #[serde(default)]
    pub created_at: Option<i64>,
}

/// Reverse tunnel: inbound connections on `local_port` of the guest are piped to
/// `remote_host:remote_port` on our side.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default)]
    pub state: bool,
}

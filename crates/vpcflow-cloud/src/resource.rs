//! Resource identity and remote state types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of VPC resource handled by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Network,
    Subnet,
    AddressPrefix,
    PublicGateway,
    Acl,
    SecurityGroup,
    SshKey,
    DedicatedHost,
    Volume,
    Instance,
    Image,
    LoadBalancer,
    IkePolicy,
    IpsecPolicy,
    VpnGateway,
    VpnConnection,
    Route,
    KubernetesCluster,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::AddressPrefix => "address_prefix",
            ResourceKind::PublicGateway => "public_gateway",
            ResourceKind::Acl => "acl",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::SshKey => "ssh_key",
            ResourceKind::DedicatedHost => "dedicated_host",
            ResourceKind::Volume => "volume",
            ResourceKind::Instance => "instance",
            ResourceKind::Image => "image",
            ResourceKind::LoadBalancer => "load_balancer",
            ResourceKind::IkePolicy => "ike_policy",
            ResourceKind::IpsecPolicy => "ipsec_policy",
            ResourceKind::VpnGateway => "vpn_gateway",
            ResourceKind::VpnConnection => "vpn_connection",
            ResourceKind::Route => "route",
            ResourceKind::KubernetesCluster => "kubernetes_cluster",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account and region a resource lives in
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub account: String,
    pub region: String,
}

impl Scope {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.account, self.region)
    }
}

/// Desired configuration handed to a provider create/update call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Resource kind
    pub kind: ResourceKind,

    /// Logical name, unique per kind within a scope
    pub name: String,

    /// Remote ids of resources this one references, keyed by role (e.g. "network", "subnet")
    pub references: HashMap<String, String>,

    /// Resource-specific configuration
    pub config: serde_json::Value,
}

impl ResourceSpec {
    pub fn new(kind: ResourceKind, name: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            kind,
            name: name.into(),
            references: HashMap::new(),
            config,
        }
    }

    pub fn with_reference(mut self, role: impl Into<String>, remote_id: impl Into<String>) -> Self {
        self.references.insert(role.into(), remote_id.into());
        self
    }

    /// Get a configuration value as a specific type
    pub fn get_config<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// State of a resource as reported by the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteResource {
    /// Provider-assigned id
    pub id: String,

    /// Logical name
    pub name: String,

    /// Resource kind
    pub kind: ResourceKind,

    /// Current provider-side status
    pub status: RemoteStatus,

    /// Server-assigned attributes (IP, fingerprint, CRN, ...)
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the provider created the resource, if it says
    pub created_at: Option<DateTime<Utc>>,
}

impl RemoteResource {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            status: RemoteStatus::Unknown,
            attributes: HashMap::new(),
            created_at: None,
        }
    }

    pub fn with_status(mut self, status: RemoteStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn get_attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Provider-side status of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    /// Being created or starting
    Pending,
    /// Ready (non-compute resources)
    Available,
    /// Compute resource is running
    Running,
    /// Compute resource is stopped
    Stopped,
    /// Being deleted
    Deleting,
    /// Deleted
    Deleted,
    /// Provider reports a failure
    Failed,
    /// Status is unknown
    Unknown,
}

impl RemoteStatus {
    /// Whether another poll may still change the status
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteStatus::Pending | RemoteStatus::Deleting | RemoteStatus::Unknown
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, RemoteStatus::Available | RemoteStatus::Running)
    }
}

impl std::fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteStatus::Pending => write!(f, "pending"),
            RemoteStatus::Available => write!(f, "available"),
            RemoteStatus::Running => write!(f, "running"),
            RemoteStatus::Stopped => write!(f, "stopped"),
            RemoteStatus::Deleting => write!(f, "deleting"),
            RemoteStatus::Deleted => write!(f, "deleted"),
            RemoteStatus::Failed => write!(f, "failed"),
            RemoteStatus::Unknown => write!(f, "unknown"),
        }
    }
}

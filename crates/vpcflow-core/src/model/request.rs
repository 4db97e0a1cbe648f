//! Provisioning request model
//!
//! A declarative description of the infrastructure a caller wants in one
//! VPC. Items flagged `provisioned` already exist and serve as
//! cross-reference targets; one carrying a different `config` is updated.

use serde::{Deserialize, Serialize};
use vpcflow_cloud::{ResourceKind, Scope};

/// Fields every request item carries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemBase {
    /// Logical name, unique per kind within the scope
    pub name: String,

    /// Already exists; contributes no task unless `config` changed
    #[serde(default)]
    pub provisioned: bool,

    /// Provider-specific configuration, passed through untouched
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ItemBase {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Plain item with no cross-references (ssh keys, policies, hosts, volumes)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StandaloneSpec {
    #[serde(flatten)]
    pub base: ItemBase,
}

/// Item attached to a network (address prefix, public gateway, ACL, security group)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkAttachedSpec {
    #[serde(flatten)]
    pub base: ItemBase,

    /// Network name; defaults to the request's network
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubnetSpec {
    #[serde(flatten)]
    pub base: ItemBase,

    #[serde(default)]
    pub network: Option<String>,

    #[serde(default)]
    pub address_prefix: Option<String>,

    #[serde(default)]
    pub public_gateway: Option<String>,

    #[serde(default)]
    pub acl: Option<String>,
}

/// Where an instance's boot image comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ImageSource {
    /// Stock provider image
    Catalog { image: String },

    /// Migrate a running classic instance
    ClassicInstance {
        account: String,
        instance_id: String,
        /// Source OS needs a pre-migration backup instance
        #[serde(default)]
        windows_backup: bool,
    },

    /// Migrate an existing classic image
    ClassicImage { account: String, image_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub name: String,
    pub subnet: String,
    #[serde(default)]
    pub security_groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSpec {
    #[serde(flatten)]
    pub base: ItemBase,

    pub image: ImageSource,

    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,

    /// Data volume names
    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default)]
    pub ssh_keys: Vec<String>,

    #[serde(default)]
    pub dedicated_host: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    #[serde(flatten)]
    pub base: ItemBase,

    #[serde(default)]
    pub subnets: Vec<String>,

    /// Pool member instance names
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VpnGatewaySpec {
    #[serde(flatten)]
    pub base: ItemBase,

    pub subnet: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VpnConnectionSpec {
    #[serde(flatten)]
    pub base: ItemBase,

    pub vpn_gateway: String,

    #[serde(default)]
    pub ike_policy: Option<String>,

    #[serde(default)]
    pub ipsec_policy: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteSpec {
    #[serde(flatten)]
    pub base: ItemBase,

    #[serde(default)]
    pub network: Option<String>,

    /// VPN connection used as next hop
    #[serde(default)]
    pub vpn_connection: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSpec {
    #[serde(flatten)]
    pub base: ItemBase,

    #[serde(default)]
    pub network: Option<String>,

    #[serde(default)]
    pub subnets: Vec<String>,
}

/// Declarative provisioning request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub scope: Scope,

    #[serde(default)]
    pub network: Option<StandaloneSpec>,

    #[serde(default)]
    pub address_prefixes: Vec<NetworkAttachedSpec>,

    #[serde(default)]
    pub public_gateways: Vec<NetworkAttachedSpec>,

    #[serde(default)]
    pub acls: Vec<NetworkAttachedSpec>,

    #[serde(default)]
    pub security_groups: Vec<NetworkAttachedSpec>,

    #[serde(default)]
    pub ssh_keys: Vec<StandaloneSpec>,

    #[serde(default)]
    pub dedicated_hosts: Vec<StandaloneSpec>,

    #[serde(default)]
    pub subnets: Vec<SubnetSpec>,

    #[serde(default)]
    pub volumes: Vec<StandaloneSpec>,

    #[serde(default)]
    pub instances: Vec<InstanceSpec>,

    #[serde(default)]
    pub load_balancers: Vec<LoadBalancerSpec>,

    #[serde(default)]
    pub ike_policies: Vec<StandaloneSpec>,

    #[serde(default)]
    pub ipsec_policies: Vec<StandaloneSpec>,

    #[serde(default)]
    pub vpn_gateways: Vec<VpnGatewaySpec>,

    #[serde(default)]
    pub vpn_connections: Vec<VpnConnectionSpec>,

    #[serde(default)]
    pub routes: Vec<RouteSpec>,

    #[serde(default)]
    pub clusters: Vec<ClusterSpec>,
}

/// A named reference from one request item to another resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Role of the reference, used as the key in the provider spec
    pub role: String,
    pub kind: ResourceKind,
    pub name: String,
}

impl Reference {
    fn new(role: impl Into<String>, kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            kind,
            name: name.into(),
        }
    }
}

/// Flattened, kind-agnostic view of one request item
#[derive(Debug, Clone)]
pub struct RequestItem<'a> {
    pub kind: ResourceKind,
    pub base: &'a ItemBase,
    pub references: Vec<Reference>,
    pub image: Option<&'a ImageSource>,
}

impl RequestItem<'_> {
    pub fn name(&self) -> &str {
        &self.base.name
    }
}

impl ProvisionRequest {
    /// Empty request for a scope
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            network: None,
            address_prefixes: Vec::new(),
            public_gateways: Vec::new(),
            acls: Vec::new(),
            security_groups: Vec::new(),
            ssh_keys: Vec::new(),
            dedicated_hosts: Vec::new(),
            subnets: Vec::new(),
            volumes: Vec::new(),
            instances: Vec::new(),
            load_balancers: Vec::new(),
            ike_policies: Vec::new(),
            ipsec_policies: Vec::new(),
            vpn_gateways: Vec::new(),
            vpn_connections: Vec::new(),
            routes: Vec::new(),
            clusters: Vec::new(),
        }
    }

    fn default_network(&self) -> Option<&str> {
        self.network.as_ref().map(|n| n.base.name.as_str())
    }

    /// Network reference, falling back to the request's own network.
    /// An unresolvable default yields a reference with an empty name.
    fn network_ref(&self, explicit: &Option<String>) -> Reference {
        let name = explicit
            .as_deref()
            .or(self.default_network())
            .unwrap_or_default();
        Reference::new("network", ResourceKind::Network, name)
    }

    /// Every item in the request with its cross-references spelled out
    pub fn items(&self) -> Vec<RequestItem<'_>> {
        let mut items = Vec::new();
        let plain = |kind, base| RequestItem {
            kind,
            base,
            references: Vec::new(),
            image: None,
        };

        if let Some(network) = &self.network {
            items.push(plain(ResourceKind::Network, &network.base));
        }
        for (kind, specs) in [
            (ResourceKind::AddressPrefix, &self.address_prefixes),
            (ResourceKind::PublicGateway, &self.public_gateways),
            (ResourceKind::Acl, &self.acls),
            (ResourceKind::SecurityGroup, &self.security_groups),
        ] {
            for spec in specs {
                items.push(RequestItem {
                    kind,
                    base: &spec.base,
                    references: vec![self.network_ref(&spec.network)],
                    image: None,
                });
            }
        }
        for (kind, specs) in [
            (ResourceKind::SshKey, &self.ssh_keys),
            (ResourceKind::DedicatedHost, &self.dedicated_hosts),
            (ResourceKind::Volume, &self.volumes),
            (ResourceKind::IkePolicy, &self.ike_policies),
            (ResourceKind::IpsecPolicy, &self.ipsec_policies),
        ] {
            for spec in specs {
                items.push(plain(kind, &spec.base));
            }
        }

        for subnet in &self.subnets {
            let mut references = vec![self.network_ref(&subnet.network)];
            if let Some(prefix) = &subnet.address_prefix {
                references.push(Reference::new(
                    "address_prefix",
                    ResourceKind::AddressPrefix,
                    prefix,
                ));
            }
            if let Some(gateway) = &subnet.public_gateway {
                references.push(Reference::new(
                    "public_gateway",
                    ResourceKind::PublicGateway,
                    gateway,
                ));
            }
            if let Some(acl) = &subnet.acl {
                references.push(Reference::new("acl", ResourceKind::Acl, acl));
            }
            items.push(RequestItem {
                kind: ResourceKind::Subnet,
                base: &subnet.base,
                references,
                image: None,
            });
        }

        for instance in &self.instances {
            let mut references = Vec::new();
            for interface in &instance.interfaces {
                references.push(Reference::new(
                    format!("interface.{}.subnet", interface.name),
                    ResourceKind::Subnet,
                    &interface.subnet,
                ));
                for (i, group) in interface.security_groups.iter().enumerate() {
                    references.push(Reference::new(
                        format!("interface.{}.security_group.{}", interface.name, i),
                        ResourceKind::SecurityGroup,
                        group,
                    ));
                }
            }
            for (i, volume) in instance.volumes.iter().enumerate() {
                references.push(Reference::new(
                    format!("volume.{i}"),
                    ResourceKind::Volume,
                    volume,
                ));
            }
            for (i, key) in instance.ssh_keys.iter().enumerate() {
                references.push(Reference::new(
                    format!("ssh_key.{i}"),
                    ResourceKind::SshKey,
                    key,
                ));
            }
            if let Some(host) = &instance.dedicated_host {
                references.push(Reference::new(
                    "dedicated_host",
                    ResourceKind::DedicatedHost,
                    host,
                ));
            }
            items.push(RequestItem {
                kind: ResourceKind::Instance,
                base: &instance.base,
                references,
                image: Some(&instance.image),
            });
        }

        for lb in &self.load_balancers {
            let mut references = Vec::new();
            for (i, subnet) in lb.subnets.iter().enumerate() {
                references.push(Reference::new(
                    format!("subnet.{i}"),
                    ResourceKind::Subnet,
                    subnet,
                ));
            }
            for (i, member) in lb.members.iter().enumerate() {
                references.push(Reference::new(
                    format!("member.{i}"),
                    ResourceKind::Instance,
                    member,
                ));
            }
            items.push(RequestItem {
                kind: ResourceKind::LoadBalancer,
                base: &lb.base,
                references,
                image: None,
            });
        }

        for gateway in &self.vpn_gateways {
            items.push(RequestItem {
                kind: ResourceKind::VpnGateway,
                base: &gateway.base,
                references: vec![Reference::new(
                    "subnet",
                    ResourceKind::Subnet,
                    &gateway.subnet,
                )],
                image: None,
            });
        }

        for connection in &self.vpn_connections {
            let mut references = vec![Reference::new(
                "vpn_gateway",
                ResourceKind::VpnGateway,
                &connection.vpn_gateway,
            )];
            if let Some(ike) = &connection.ike_policy {
                references.push(Reference::new("ike_policy", ResourceKind::IkePolicy, ike));
            }
            if let Some(ipsec) = &connection.ipsec_policy {
                references.push(Reference::new(
                    "ipsec_policy",
                    ResourceKind::IpsecPolicy,
                    ipsec,
                ));
            }
            items.push(RequestItem {
                kind: ResourceKind::VpnConnection,
                base: &connection.base,
                references,
                image: None,
            });
        }

        for route in &self.routes {
            let mut references = vec![self.network_ref(&route.network)];
            if let Some(connection) = &route.vpn_connection {
                references.push(Reference::new(
                    "next_hop",
                    ResourceKind::VpnConnection,
                    connection,
                ));
            }
            items.push(RequestItem {
                kind: ResourceKind::Route,
                base: &route.base,
                references,
                image: None,
            });
        }

        for cluster in &self.clusters {
            let mut references = vec![self.network_ref(&cluster.network)];
            for (i, subnet) in cluster.subnets.iter().enumerate() {
                references.push(Reference::new(
                    format!("subnet.{i}"),
                    ResourceKind::Subnet,
                    subnet,
                ));
            }
            items.push(RequestItem {
                kind: ResourceKind::KubernetesCluster,
                base: &cluster.base,
                references,
                image: None,
            });
        }

        items
    }
}

//! Cluster and node domain types.
//!
//! `ClusterSpec` is the typed cluster configuration (loaded from TOML),
//! `NodeState` is the per-node lifecycle record kept in the registry, and
//! `Cluster` is the `{spec, nodes}` document handed to the external state
//! store and bootstrap collaborator.

use std::collections::BTreeMap;
use std::fmt;

use cirrus_id::{InstanceId, KeyPairId, SecurityGroupId, SubnetId, VpcId};
use cirrus_networking::DEFAULT_CLUSTER_CIDR;
use serde::{Deserialize, Serialize};

/// Default provider region.
pub const DEFAULT_REGION: &str = "ap-guangzhou";

/// Default availability zone of the default region.
pub const DEFAULT_ZONE: &str = "ap-guangzhou-3";

/// Default overlay network mode.
pub const DEFAULT_NETWORK_MODE: &str = "vxlan";

/// Default SSH login user on launched images.
pub const DEFAULT_SSH_USER: &str = "root";

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Suffix appended to a cluster name to form its qualified name.
pub const PROVIDER_NAME: &str = "tencent";

// ============================================================================
// Roles and status
// ============================================================================

/// Node role within the cluster. Never changes once observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Worker,
}

impl Role {
    /// Tag key marking instances of this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Launch accepted, not yet running.
    Pending,

    /// Instance reported running.
    Running,

    /// Instance exists but is in neither a starting nor a running state.
    Unhealthy,

    /// Instance is shutting down or gone.
    Terminated,
}

impl NodeStatus {
    /// Map a provider instance state (`RUNNING`, `PENDING`, ...) to a status.
    pub fn from_provider(state: &str) -> Self {
        match state.to_ascii_uppercase().as_str() {
            "PENDING" | "STARTING" => Self::Pending,
            "RUNNING" => Self::Running,
            "SHUTDOWN" | "TERMINATING" => Self::Terminated,
            _ => Self::Unhealthy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Unhealthy => "unhealthy",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Node state
// ============================================================================

/// SSH credential used to reach a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshCredential {
    pub user: String,
    pub port: u16,

    /// Login password (cleared once a public key is installed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Path of the private key matching the installed key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

impl Default for SshCredential {
    fn default() -> Self {
        Self {
            user: DEFAULT_SSH_USER.to_string(),
            port: DEFAULT_SSH_PORT,
            password: None,
            key_path: None,
        }
    }
}

impl SshCredential {
    /// Returns true when user, port and a secret are all present.
    pub fn is_complete(&self) -> bool {
        !self.user.is_empty() && self.port != 0 && (self.password.is_some() || self.key_path.is_some())
    }
}

/// Lifecycle record of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub instance_id: InstanceId,
    pub role: Role,
    pub status: NodeStatus,

    #[serde(default)]
    pub internal_addresses: Vec<String>,

    #[serde(default)]
    pub external_addresses: Vec<String>,

    /// Floating addresses associated with this node.
    #[serde(default)]
    pub address_ids: Vec<cirrus_id::AddressId>,

    #[serde(default)]
    pub ssh: SshCredential,

    /// Created or touched by the current invocation.
    #[serde(skip)]
    pub current: bool,

    /// Created by the current invocation's launch path.
    #[serde(skip)]
    pub rollback_eligible: bool,
}

impl NodeState {
    /// A node whose launch request was just accepted.
    pub fn launched(instance_id: InstanceId, role: Role) -> Self {
        Self {
            instance_id,
            role,
            status: NodeStatus::Pending,
            internal_addresses: Vec::new(),
            external_addresses: Vec::new(),
            address_ids: Vec::new(),
            ssh: SshCredential::default(),
            current: true,
            rollback_eligible: true,
        }
    }

    /// A pre-existing node found through discovery.
    pub fn discovered(instance_id: InstanceId, role: Role, status: NodeStatus) -> Self {
        Self {
            status,
            current: false,
            rollback_eligible: false,
            ..Self::launched(instance_id, role)
        }
    }

    /// Returns true if the node already has a public address.
    pub fn has_public_address(&self) -> bool {
        !self.external_addresses.is_empty()
    }
}

// ============================================================================
// Cluster spec
// ============================================================================

/// Typed cluster configuration.
///
/// Empty identifiers mean "provision the defaults".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSpec {
    /// Short cluster name.
    pub name: String,
    pub region: String,
    pub zone: String,

    /// Flannel backend; `vxlan` needs the overlay firewall rule.
    pub network_mode: String,

    pub master: usize,
    pub worker: usize,

    /// User tags applied to launched instances.
    pub tags: BTreeMap<String, String>,

    /// Expose the dashboard port.
    pub ui: bool,

    /// Associate a floating address with every launched node.
    pub public_ip_assigned_eip: bool,

    pub vpc_id: Option<VpcId>,
    pub subnet_id: Option<SubnetId>,
    pub security_group_id: Option<SecurityGroupId>,

    // Launch options
    pub image_id: String,
    pub instance_type: String,
    pub system_disk_type: String,
    pub system_disk_size: u32,
    pub internet_max_bandwidth_out: u32,
    pub instance_charge_type: String,
    pub internet_charge_type: String,
    pub keypair_id: Option<KeyPairId>,

    // SSH
    pub ssh_user: String,
    pub ssh_port: u16,
    pub ssh_password: Option<String>,
    pub ssh_key_path: Option<String>,
    pub ssh_public_key_path: Option<String>,

    // Cluster software options consumed by preflight and extra args
    pub cloud_controller_manager: bool,
    pub router: Option<String>,
    pub cluster_cidr: String,
    pub datastore: Option<String>,
    pub embedded_cluster: bool,
    pub master_extra_args: String,
    pub worker_extra_args: String,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            region: DEFAULT_REGION.to_string(),
            zone: DEFAULT_ZONE.to_string(),
            network_mode: DEFAULT_NETWORK_MODE.to_string(),
            master: 0,
            worker: 0,
            tags: BTreeMap::new(),
            ui: false,
            public_ip_assigned_eip: false,
            vpc_id: None,
            subnet_id: None,
            security_group_id: None,
            image_id: "img-pi0ii46r".to_string(),
            instance_type: "SA1.MEDIUM4".to_string(),
            system_disk_type: "CLOUD_SSD".to_string(),
            system_disk_size: 50,
            internet_max_bandwidth_out: 5,
            instance_charge_type: "POSTPAID_BY_HOUR".to_string(),
            internet_charge_type: "TRAFFIC_POSTPAID_BY_HOUR".to_string(),
            keypair_id: None,
            ssh_user: DEFAULT_SSH_USER.to_string(),
            ssh_port: DEFAULT_SSH_PORT,
            ssh_password: None,
            ssh_key_path: None,
            ssh_public_key_path: None,
            cloud_controller_manager: false,
            router: None,
            cluster_cidr: DEFAULT_CLUSTER_CIDR.to_string(),
            datastore: None,
            embedded_cluster: false,
            master_extra_args: String::new(),
            worker_extra_args: String::new(),
        }
    }
}

impl ClusterSpec {
    /// Parse a spec from TOML; missing fields take their defaults.
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    /// Globally unique name: `<name>.<region>.tencent`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.name, self.region, PROVIDER_NAME)
    }

    /// Returns true when the overlay network needs the UDP encapsulation port.
    pub fn uses_default_overlay(&self) -> bool {
        self.network_mode.is_empty() || self.network_mode == DEFAULT_NETWORK_MODE
    }

    /// SSH credential for nodes launched from this spec.
    pub fn ssh_credential(&self) -> SshCredential {
        SshCredential {
            user: if self.ssh_user.is_empty() {
                DEFAULT_SSH_USER.to_string()
            } else {
                self.ssh_user.clone()
            },
            port: if self.ssh_port == 0 {
                DEFAULT_SSH_PORT
            } else {
                self.ssh_port
            },
            password: self.ssh_password.clone(),
            key_path: self.ssh_key_path.clone(),
        }
    }

    /// Apply every non-empty field of `other` onto `self`.
    ///
    /// Counts are taken from `other` unconditionally; strings, options and
    /// maps only when set. Boolean flags are OR-ed so an override can enable
    /// but never silently disable a feature.
    pub fn merge(&mut self, other: &ClusterSpec) {
        fn string(target: &mut String, value: &str) {
            if !value.is_empty() {
                *target = value.to_string();
            }
        }
        fn option<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                target.clone_from(value);
            }
        }
        fn number<T: Copy + Default + PartialEq>(target: &mut T, value: T) {
            if value != T::default() {
                *target = value;
            }
        }

        string(&mut self.name, &other.name);
        string(&mut self.region, &other.region);
        string(&mut self.zone, &other.zone);
        string(&mut self.network_mode, &other.network_mode);
        self.master = other.master;
        self.worker = other.worker;
        for (key, value) in &other.tags {
            self.tags.insert(key.clone(), value.clone());
        }
        self.ui |= other.ui;
        self.public_ip_assigned_eip |= other.public_ip_assigned_eip;
        option(&mut self.vpc_id, &other.vpc_id);
        option(&mut self.subnet_id, &other.subnet_id);
        option(&mut self.security_group_id, &other.security_group_id);
        string(&mut self.image_id, &other.image_id);
        string(&mut self.instance_type, &other.instance_type);
        string(&mut self.system_disk_type, &other.system_disk_type);
        number(&mut self.system_disk_size, other.system_disk_size);
        number(
            &mut self.internet_max_bandwidth_out,
            other.internet_max_bandwidth_out,
        );
        string(&mut self.instance_charge_type, &other.instance_charge_type);
        string(&mut self.internet_charge_type, &other.internet_charge_type);
        option(&mut self.keypair_id, &other.keypair_id);
        string(&mut self.ssh_user, &other.ssh_user);
        number(&mut self.ssh_port, other.ssh_port);
        option(&mut self.ssh_password, &other.ssh_password);
        option(&mut self.ssh_key_path, &other.ssh_key_path);
        option(&mut self.ssh_public_key_path, &other.ssh_public_key_path);
        self.cloud_controller_manager |= other.cloud_controller_manager;
        option(&mut self.router, &other.router);
        string(&mut self.cluster_cidr, &other.cluster_cidr);
        option(&mut self.datastore, &other.datastore);
        self.embedded_cluster |= other.embedded_cluster;
        string(&mut self.master_extra_args, &other.master_extra_args);
        string(&mut self.worker_extra_args, &other.worker_extra_args);
    }
}

// ============================================================================
// Cluster documents
// ============================================================================

/// Assembled cluster: configuration plus node lists.
///
/// This is the structure persisted by the external state store and consumed
/// by the bootstrap collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub spec: ClusterSpec,

    #[serde(default)]
    pub masters: Vec<NodeState>,

    #[serde(default)]
    pub workers: Vec<NodeState>,
}

impl Cluster {
    /// An empty cluster for a spec.
    pub fn new(spec: ClusterSpec) -> Self {
        Self {
            spec,
            masters: Vec::new(),
            workers: Vec::new(),
        }
    }

    /// Node list for a role.
    pub fn nodes(&self, role: Role) -> &[NodeState] {
        match role {
            Role::Master => &self.masters,
            Role::Worker => &self.workers,
        }
    }

    pub fn nodes_mut(&mut self, role: Role) -> &mut Vec<NodeState> {
        match role {
            Role::Master => &mut self.masters,
            Role::Worker => &mut self.workers,
        }
    }

    /// Nodes touched by the current invocation.
    pub fn current_nodes(&self) -> impl Iterator<Item = &NodeState> {
        self.masters
            .iter()
            .chain(self.workers.iter())
            .filter(|node| node.current)
    }
}

/// Per-instance summary reported by `describe_cluster`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub instance_id: InstanceId,
    pub role: Role,
    pub provider_state: String,
    pub internal_addresses: Vec<String>,
    pub external_addresses: Vec<String>,
}

/// Provider-side view of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub name: String,
    pub region: String,
    pub zone: String,
    pub provider: String,
    pub masters: usize,
    pub workers: usize,
    pub nodes: Vec<NodeSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(NodeStatus::from_provider("RUNNING"), NodeStatus::Running);
        assert_eq!(NodeStatus::from_provider("PENDING"), NodeStatus::Pending);
        assert_eq!(NodeStatus::from_provider("STARTING"), NodeStatus::Pending);
        assert_eq!(NodeStatus::from_provider("TERMINATING"), NodeStatus::Terminated);
        assert_eq!(NodeStatus::from_provider("STOPPED"), NodeStatus::Unhealthy);
        assert_eq!(NodeStatus::from_provider("LAUNCH_FAILED"), NodeStatus::Unhealthy);
    }

    #[test]
    fn test_node_constructors() {
        let id = InstanceId::parse("ins-abc123").unwrap();
        let launched = NodeState::launched(id.clone(), Role::Master);
        assert!(launched.current);
        assert!(launched.rollback_eligible);
        assert_eq!(launched.status, NodeStatus::Pending);

        let discovered = NodeState::discovered(id, Role::Worker, NodeStatus::Running);
        assert!(!discovered.current);
        assert!(!discovered.rollback_eligible);
        assert_eq!(discovered.role, Role::Worker);
    }

    #[test]
    fn test_spec_defaults_from_toml() {
        let spec = ClusterSpec::from_toml(
            r#"
            name = "demo"
            master = 1
            worker = 2
            "#,
        )
        .unwrap();

        assert_eq!(spec.region, DEFAULT_REGION);
        assert_eq!(spec.zone, DEFAULT_ZONE);
        assert_eq!(spec.instance_type, "SA1.MEDIUM4");
        assert_eq!(spec.cluster_cidr, "10.42.0.0/16");
        assert_eq!(spec.qualified_name(), "demo.ap-guangzhou.tencent");
        assert!(spec.uses_default_overlay());
    }

    #[test]
    fn test_typed_ids_in_toml() {
        let spec = ClusterSpec::from_toml(
            r#"
            name = "demo"
            vpc_id = "vpc-1a2b3c"
            "#,
        )
        .unwrap();
        assert_eq!(spec.vpc_id.unwrap().as_str(), "vpc-1a2b3c");

        assert!(ClusterSpec::from_toml(r#"vpc_id = "subnet-1a2b3c""#).is_err());
    }

    #[test]
    fn test_merge_applies_set_fields_only() {
        let mut base = ClusterSpec {
            name: "demo".to_string(),
            master: 1,
            worker: 1,
            ui: true,
            ..ClusterSpec::default()
        };
        base.tags.insert("team".to_string(), "infra".to_string());

        let mut update = ClusterSpec {
            name: String::new(),
            region: String::new(),
            master: 0,
            worker: 3,
            instance_type: "S5.LARGE8".to_string(),
            system_disk_size: 0,
            ..ClusterSpec::default()
        };
        update.tags.insert("env".to_string(), "prod".to_string());

        base.merge(&update);

        assert_eq!(base.name, "demo");
        assert_eq!(base.region, DEFAULT_REGION);
        assert_eq!(base.master, 0);
        assert_eq!(base.worker, 3);
        assert_eq!(base.instance_type, "S5.LARGE8");
        assert_eq!(base.system_disk_size, 50);
        assert!(base.ui);
        assert_eq!(base.tags.len(), 2);
    }

    #[test]
    fn test_ssh_credential_defaults() {
        let spec = ClusterSpec {
            ssh_user: String::new(),
            ssh_port: 0,
            ..ClusterSpec::default()
        };
        let ssh = spec.ssh_credential();
        assert_eq!(ssh.user, "root");
        assert_eq!(ssh.port, 22);
        assert!(!ssh.is_complete());
    }

    #[test]
    fn test_cluster_serialization_skips_run_flags() {
        let id = InstanceId::parse("ins-abc123").unwrap();
        let mut cluster = Cluster::new(ClusterSpec::default());
        cluster.masters.push(NodeState::launched(id, Role::Master));

        let json = serde_json::to_string(&cluster).unwrap();
        assert!(!json.contains("rollback_eligible"));

        let back: Cluster = serde_json::from_str(&json).unwrap();
        assert!(!back.masters[0].current);
        assert!(!back.masters[0].rollback_eligible);
    }
}

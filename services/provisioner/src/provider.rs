//! Provider API boundary.
//!
//! `CloudApi` lists the verbs the engine needs from the cloud provider,
//! independent of transport. `TencentClient` implements it over HTTPS and
//! `MockCloud` implements it in memory.

use async_trait::async_trait;
use cirrus_id::{AddressId, InstanceId, KeyPairId, SecurityGroupId, SubnetId, TaskId, VpcId};
use cirrus_networking::Protocol;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A failed provider call.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The provider rejected the request.
    #[error("{action}: {code}: {message} (request id: {request_id})")]
    Service {
        action: String,
        code: String,
        message: String,
        request_id: String,
    },

    /// The request never produced a provider response.
    #[error("{action}: transport error: {source}")]
    Transport {
        action: String,
        #[source]
        source: reqwest::Error,
    },

    /// The provider response could not be interpreted.
    #[error("{action}: malformed response: {message}")]
    Decode { action: String, message: String },

    /// The request could not be signed.
    #[error("{action}: signing failed: {message}")]
    Signing { action: String, message: String },
}

impl ApiError {
    /// Provider error code, if the provider returned one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Service { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Returns true for a provider error code meaning the address is not bound.
    pub fn is_already_disassociated(&self) -> bool {
        matches!(self.code(), Some("InvalidAddressIdStatus.NotBound"))
    }
}

// ============================================================================
// Shared vocabulary
// ============================================================================

/// Resource tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Result of polling an asynchronous task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Running,
    Success,
    Failed,

    /// Any value the provider adds later.
    Other(String),
}

impl TaskResult {
    /// Parse the provider's task result string (case-insensitive).
    pub fn from_provider(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "RUNNING" => Self::Running,
            "SUCCESS" => Self::Success,
            "FAILED" => Self::Failed,
            _ => Self::Other(value.to_string()),
        }
    }
}

// ============================================================================
// Compute
// ============================================================================

/// Login settings for launched instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginSettings {
    KeyPair(KeyPairId),
    Password(String),
}

/// Batch launch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub count: usize,
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    pub zone: String,
    pub vpc_id: Option<VpcId>,
    pub subnet_id: Option<SubnetId>,
    pub security_group_ids: Vec<SecurityGroupId>,
    pub system_disk_type: String,
    pub system_disk_size: u32,
    pub instance_charge_type: String,
    pub internet_charge_type: String,
    pub internet_max_bandwidth_out: u32,
    pub public_ip_assigned: bool,
    pub login: LoginSettings,
    pub tags: Vec<Tag>,
}

/// Instance as reported by the describe call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInstance {
    pub instance_id: InstanceId,

    /// Raw provider state (`RUNNING`, `PENDING`, ...).
    pub state: String,
    pub private_addresses: Vec<String>,
    pub public_addresses: Vec<String>,
    pub tags: Vec<Tag>,
}

impl ProviderInstance {
    /// Returns true if the instance carries `key=true` (case-insensitive).
    pub fn has_flag_tag(&self, key: &str) -> bool {
        self.tags
            .iter()
            .any(|t| t.key.eq_ignore_ascii_case(key) && t.value.eq_ignore_ascii_case("true"))
    }
}

/// One page of instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstancePage {
    pub total: usize,
    pub instances: Vec<ProviderInstance>,
}

/// Instance id and raw provider state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub instance_id: InstanceId,
    pub state: String,
}

// ============================================================================
// Network
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vpc {
    pub vpc_id: VpcId,
    pub name: String,
    pub cidr_block: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub subnet_id: SubnetId,
    pub vpc_id: VpcId,
    pub name: String,
    pub cidr_block: String,
    pub zone: String,
}

/// Subnet lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnetQuery {
    /// By name and tag within a network.
    Named { vpc_id: VpcId, name: String, tag: Tag },

    /// By identifier.
    Id(SubnetId),
}

// ============================================================================
// Firewall
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub group_id: SecurityGroupId,
    pub name: String,
}

/// A single firewall rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupPolicy {
    pub protocol: Protocol,

    /// Provider port expression (`"22"`, `"2379,2380"`, `"ALL"`).
    pub port: String,
    pub cidr_block: String,
    pub action: String,
    pub description: String,
}

/// Ingress and egress rules of a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySet {
    pub ingress: Vec<SecurityGroupPolicy>,
    pub egress: Vec<SecurityGroupPolicy>,
}

// ============================================================================
// Addressing
// ============================================================================

/// Result of a batch address allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressAllocation {
    pub address_ids: Vec<AddressId>,
    pub task_id: TaskId,
}

/// Floating address as described by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub address_id: AddressId,
    pub public_ip: String,
    pub instance_id: Option<InstanceId>,
}

/// Address lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressQuery {
    Ids(Vec<AddressId>),

    /// Addresses bound to any of these instances.
    Instances(Vec<InstanceId>),
}

// ============================================================================
// Tagging
// ============================================================================

/// Tag filter: key must match one of the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub values: Vec<String>,
}

impl From<&Tag> for TagFilter {
    fn from(tag: &Tag) -> Self {
        Self {
            key: tag.key.clone(),
            values: vec![tag.value.clone()],
        }
    }
}

/// One row of the tag service's resource listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedResourceRow {
    pub service_type: String,
    pub resource_prefix: String,
    pub resource_id: String,
    pub region: String,
}

/// One page of tagged resources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaggedResourcePage {
    pub total: usize,
    pub rows: Vec<TaggedResourceRow>,
}

// ============================================================================
// Trait
// ============================================================================

/// Cloud provider API.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Provider region all calls target.
    fn region(&self) -> &str;

    // Compute
    async fn run_instances(&self, request: &LaunchRequest) -> Result<Vec<InstanceId>, ApiError>;
    async fn describe_instances(
        &self,
        tags: &[Tag],
        offset: usize,
        limit: usize,
    ) -> Result<InstancePage, ApiError>;
    async fn describe_instance_status(
        &self,
        ids: &[InstanceId],
    ) -> Result<Vec<InstanceStatus>, ApiError>;
    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), ApiError>;

    // Network
    async fn describe_vpcs(&self, name: &str, tag: &Tag) -> Result<Vec<Vpc>, ApiError>;
    async fn create_vpc(&self, name: &str, cidr_block: &str, tags: &[Tag]) -> Result<Vpc, ApiError>;
    async fn describe_subnets(&self, query: &SubnetQuery) -> Result<Vec<Subnet>, ApiError>;
    async fn create_subnet(
        &self,
        vpc_id: &VpcId,
        name: &str,
        cidr_block: &str,
        zone: &str,
        tags: &[Tag],
    ) -> Result<Subnet, ApiError>;

    // Firewall
    async fn describe_security_groups(
        &self,
        name: &str,
        tag: &Tag,
    ) -> Result<Vec<SecurityGroup>, ApiError>;
    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        tags: &[Tag],
    ) -> Result<SecurityGroup, ApiError>;
    async fn describe_security_group_policies(
        &self,
        group_id: &SecurityGroupId,
    ) -> Result<PolicySet, ApiError>;
    async fn create_security_group_policies(
        &self,
        group_id: &SecurityGroupId,
        policies: &PolicySet,
    ) -> Result<(), ApiError>;

    // Addressing
    async fn allocate_addresses(
        &self,
        count: usize,
        internet_charge_type: &str,
        bandwidth_out: u32,
        tags: &[Tag],
    ) -> Result<AddressAllocation, ApiError>;
    async fn describe_addresses(&self, query: &AddressQuery) -> Result<Vec<Address>, ApiError>;
    async fn associate_address(
        &self,
        address_id: &AddressId,
        instance_id: &InstanceId,
    ) -> Result<TaskId, ApiError>;

    /// Returns `None` when the provider issued no task (nothing to unbind).
    async fn disassociate_address(&self, address_id: &AddressId)
        -> Result<Option<TaskId>, ApiError>;
    async fn release_addresses(&self, address_ids: &[AddressId]) -> Result<TaskId, ApiError>;

    // Async
    async fn describe_task_result(&self, task_id: TaskId) -> Result<TaskResult, ApiError>;

    // Tagging
    async fn describe_resources_by_tags(
        &self,
        filters: &[TagFilter],
        offset: usize,
        limit: usize,
    ) -> Result<TaggedResourcePage, ApiError>;
}

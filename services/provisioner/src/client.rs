//! Tencent Cloud API 3.0 client.
//!
//! Every call is a signed JSON `POST` to the service host. Responses are
//! wrapped in a `Response` object that carries either the payload or an
//! `Error { Code, Message }` plus a `RequestId`.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cirrus_id::{AddressId, InstanceId, SecurityGroupId, TaskId, VpcId};
use cirrus_networking::Protocol;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::config::Config;
use crate::provider::{
    Address, AddressAllocation, AddressQuery, ApiError, CloudApi, InstancePage, InstanceStatus,
    LaunchRequest, LoginSettings, PolicySet, ProviderInstance, SecurityGroup,
    SecurityGroupPolicy, Subnet, SubnetQuery, Tag, TagFilter, TaggedResourcePage,
    TaggedResourceRow, TaskResult, Vpc,
};

/// Request signing algorithm.
pub const SIGNING_ALGORITHM: &str = "TC3-HMAC-SHA256";

const CONTENT_TYPE: &str = "application/json; charset=utf-8";
const SIGNED_HEADERS: &str = "content-type;host";

/// Page size for status queries.
const STATUS_PAGE_SIZE: usize = 100;

type HmacSha256 = Hmac<Sha256>;

/// Provider service a call goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Cvm,
    Vpc,
    Tag,
}

impl Service {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cvm => "cvm",
            Self::Vpc => "vpc",
            Self::Tag => "tag",
        }
    }

    pub fn version(&self) -> &'static str {
        match self {
            Self::Cvm | Self::Vpc => "2017-03-12",
            Self::Tag => "2018-08-13",
        }
    }

    /// Default public host of the service.
    pub fn host(&self) -> String {
        format!("{}.tencentcloudapi.com", self.name())
    }
}

/// API credential pair.
#[derive(Clone)]
pub struct Credentials {
    pub secret_id: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

fn hmac_sha256(key: &[u8], message: &str) -> Result<Vec<u8>, String> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| e.to_string())?;
    mac.update(message.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Build the `Authorization` header for one request.
pub fn authorization(
    credentials: &Credentials,
    service: &str,
    host: &str,
    payload: &str,
    timestamp: i64,
) -> Result<String, String> {
    let date = DateTime::<Utc>::from_timestamp(timestamp, 0)
        .ok_or_else(|| format!("timestamp {timestamp} out of range"))?
        .format("%Y-%m-%d")
        .to_string();

    let canonical_request = format!(
        "POST\n/\n\ncontent-type:{CONTENT_TYPE}\nhost:{host}\n\n{SIGNED_HEADERS}\n{}",
        sha256_hex(payload)
    );
    let scope = format!("{date}/{service}/tc3_request");
    let string_to_sign = format!(
        "{SIGNING_ALGORITHM}\n{timestamp}\n{scope}\n{}",
        sha256_hex(&canonical_request)
    );

    let secret_date = hmac_sha256(format!("TC3{}", credentials.secret_key).as_bytes(), &date)?;
    let secret_service = hmac_sha256(&secret_date, service)?;
    let secret_signing = hmac_sha256(&secret_service, "tc3_request")?;
    let signature = hex::encode(hmac_sha256(&secret_signing, &string_to_sign)?);

    Ok(format!(
        "{SIGNING_ALGORITHM} Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
        credentials.secret_id
    ))
}

/// HTTPS implementation of `CloudApi`.
pub struct TencentClient {
    client: reqwest::Client,
    credentials: Credentials,
    region: String,

    /// Single base URL for every service (tests, private endpoints).
    endpoint: Option<String>,
}

impl TencentClient {
    /// Create a client for a region.
    pub fn new(credentials: Credentials, region: impl Into<String>, endpoint: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            credentials,
            region: region.into(),
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
        }
    }

    /// Create a client from loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Credentials {
                secret_id: config.secret_id.clone(),
                secret_key: config.secret_key.clone(),
            },
            config.region.clone(),
            config.endpoint.clone(),
        )
    }

    fn target(&self, service: Service) -> (String, String) {
        match &self.endpoint {
            Some(endpoint) => {
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string();
                (format!("{endpoint}/"), host)
            }
            None => {
                let host = service.host();
                (format!("https://{host}/"), host)
            }
        }
    }

    /// Sign, send and unwrap one call.
    async fn call<T: DeserializeOwned>(
        &self,
        service: Service,
        action: &'static str,
        body: Value,
    ) -> Result<T, ApiError> {
        let payload = body.to_string();
        let (url, host) = self.target(service);
        let timestamp = Utc::now().timestamp();

        let auth = authorization(&self.credentials, service.name(), &host, &payload, timestamp)
            .map_err(|message| ApiError::Signing {
                action: action.to_string(),
                message,
            })?;

        debug!(action, service = service.name(), region = %self.region, "Calling provider");

        let response = self
            .client
            .post(&url)
            .header("Authorization", auth)
            .header("Content-Type", CONTENT_TYPE)
            .header("Host", &host)
            .header("X-TC-Action", action)
            .header("X-TC-Timestamp", timestamp.to_string())
            .header("X-TC-Version", service.version())
            .header("X-TC-Region", &self.region)
            .body(payload)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                action: action.to_string(),
                source,
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|source| ApiError::Transport {
            action: action.to_string(),
            source,
        })?;

        let envelope: Value = serde_json::from_str(&text).map_err(|e| ApiError::Decode {
            action: action.to_string(),
            message: format!("HTTP {status}: {e}"),
        })?;
        let inner = envelope.get("Response").cloned().ok_or_else(|| ApiError::Decode {
            action: action.to_string(),
            message: format!("HTTP {status}: missing Response object"),
        })?;

        if let Some(err) = inner.get("Error") {
            let code = err.get("Code").and_then(Value::as_str).unwrap_or_default();
            let message = err.get("Message").and_then(Value::as_str).unwrap_or_default();
            let request_id = inner
                .get("RequestId")
                .and_then(Value::as_str)
                .unwrap_or_default();
            error!(
                action,
                code,
                request_id,
                provider_message = message,
                "Provider rejected request"
            );
            return Err(ApiError::Service {
                action: action.to_string(),
                code: code.to_string(),
                message: message.to_string(),
                request_id: request_id.to_string(),
            });
        }

        serde_json::from_value(inner).map_err(|e| ApiError::Decode {
            action: action.to_string(),
            message: e.to_string(),
        })
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct WireTag {
    key: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RunInstancesResponse {
    instance_id_set: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct WireInstance {
    instance_id: String,
    instance_state: String,
    private_ip_addresses: Option<Vec<String>>,
    public_ip_addresses: Option<Vec<String>>,
    tags: Option<Vec<WireTag>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct DescribeInstancesResponse {
    total_count: usize,
    instance_set: Vec<WireInstance>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct WireInstanceStatus {
    instance_id: String,
    instance_state: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct DescribeInstancesStatusResponse {
    instance_status_set: Vec<WireInstanceStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct WireVpc {
    vpc_id: String,
    vpc_name: String,
    cidr_block: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct DescribeVpcsResponse {
    vpc_set: Vec<WireVpc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct CreateVpcResponse {
    vpc: WireVpc,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct WireSubnet {
    subnet_id: String,
    vpc_id: String,
    subnet_name: String,
    cidr_block: String,
    zone: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct DescribeSubnetsResponse {
    subnet_set: Vec<WireSubnet>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct CreateSubnetResponse {
    subnet: WireSubnet,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct WireSecurityGroup {
    security_group_id: String,
    security_group_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct DescribeSecurityGroupsResponse {
    security_group_set: Vec<WireSecurityGroup>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct CreateSecurityGroupResponse {
    security_group: WireSecurityGroup,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct WirePolicy {
    protocol: String,
    port: String,
    cidr_block: String,
    action: String,
    policy_description: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct WirePolicySet {
    ingress: Option<Vec<WirePolicy>>,
    egress: Option<Vec<WirePolicy>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct DescribePoliciesResponse {
    security_group_policy_set: WirePolicySet,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct AllocateAddressesResponse {
    address_set: Vec<String>,
    task_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct WireAddress {
    address_id: String,
    address_ip: String,
    instance_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct DescribeAddressesResponse {
    address_set: Vec<WireAddress>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct TaskIdResponse {
    task_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct TaskResultResponse {
    result: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct WireResourceRow {
    service_type: String,
    resource_prefix: String,
    resource_id: String,
    resource_region: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct DescribeResourcesByTagsResponse {
    total_count: usize,
    rows: Vec<WireResourceRow>,
}

// ============================================================================
// Conversions
// ============================================================================

fn parse_id<T>(action: &str, raw: &str) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse().map_err(|e: T::Err| ApiError::Decode {
        action: action.to_string(),
        message: format!("bad identifier {raw:?}: {e}"),
    })
}

fn parse_ids<T>(action: &str, raw: &[String]) -> Result<Vec<T>, ApiError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.iter().map(|id| parse_id(action, id)).collect()
}

fn parse_task(action: &str, raw: &str) -> Result<TaskId, ApiError> {
    TaskId::parse(raw).map_err(|e| ApiError::Decode {
        action: action.to_string(),
        message: format!("bad task id {raw:?}: {e}"),
    })
}

fn wire_tags(tags: &[Tag]) -> Value {
    Value::Array(
        tags.iter()
            .map(|t| json!({ "Key": t.key, "Value": t.value }))
            .collect(),
    )
}

fn tag_filter(tag: &Tag) -> Value {
    json!({ "Name": format!("tag:{}", tag.key), "Values": [tag.value] })
}

fn wire_policy(policy: &SecurityGroupPolicy) -> Value {
    json!({
        "Protocol": policy.protocol.as_str(),
        "Port": policy.port,
        "CidrBlock": policy.cidr_block,
        "Action": policy.action,
        "PolicyDescription": policy.description,
    })
}

fn from_wire_policies(policies: Option<Vec<WirePolicy>>) -> Vec<SecurityGroupPolicy> {
    policies
        .unwrap_or_default()
        .into_iter()
        .map(|p| SecurityGroupPolicy {
            protocol: Protocol::from_provider(&p.protocol),
            port: p.port,
            cidr_block: p.cidr_block,
            action: p.action,
            description: p.policy_description,
        })
        .collect()
}

fn from_wire_subnet(action: &str, subnet: WireSubnet) -> Result<Subnet, ApiError> {
    Ok(Subnet {
        subnet_id: parse_id(action, &subnet.subnet_id)?,
        vpc_id: parse_id(action, &subnet.vpc_id)?,
        name: subnet.subnet_name,
        cidr_block: subnet.cidr_block,
        zone: subnet.zone,
    })
}

fn from_wire_vpc(action: &str, vpc: WireVpc) -> Result<Vpc, ApiError> {
    Ok(Vpc {
        vpc_id: parse_id(action, &vpc.vpc_id)?,
        name: vpc.vpc_name,
        cidr_block: vpc.cidr_block,
    })
}

fn from_wire_group(action: &str, group: WireSecurityGroup) -> Result<SecurityGroup, ApiError> {
    Ok(SecurityGroup {
        group_id: parse_id(action, &group.security_group_id)?,
        name: group.security_group_name,
    })
}

fn launch_body(request: &LaunchRequest) -> Value {
    let login = match &request.login {
        LoginSettings::KeyPair(key_id) => json!({ "KeyIds": [key_id.as_str()] }),
        LoginSettings::Password(password) => json!({ "Password": password }),
    };

    let mut body = json!({
        "InstanceCount": request.count,
        "InstanceName": request.name,
        "ImageId": request.image_id,
        "InstanceType": request.instance_type,
        "InstanceChargeType": request.instance_charge_type,
        "Placement": { "Zone": request.zone },
        "SystemDisk": {
            "DiskType": request.system_disk_type,
            "DiskSize": request.system_disk_size,
        },
        "InternetAccessible": {
            "InternetChargeType": request.internet_charge_type,
            "InternetMaxBandwidthOut": request.internet_max_bandwidth_out,
            "PublicIpAssigned": request.public_ip_assigned,
        },
        "LoginSettings": login,
        "TagSpecification": [{ "ResourceType": "instance", "Tags": wire_tags(&request.tags) }],
    });

    if let (Some(vpc_id), Some(subnet_id)) = (&request.vpc_id, &request.subnet_id) {
        body["VirtualPrivateCloud"] = json!({
            "VpcId": vpc_id.as_str(),
            "SubnetId": subnet_id.as_str(),
        });
    }
    if !request.security_group_ids.is_empty() {
        body["SecurityGroupIds"] = Value::Array(
            request
                .security_group_ids
                .iter()
                .map(|id| Value::String(id.to_string()))
                .collect(),
        );
    }
    body
}

// ============================================================================
// CloudApi
// ============================================================================

#[async_trait]
impl CloudApi for TencentClient {
    fn region(&self) -> &str {
        &self.region
    }

    async fn run_instances(&self, request: &LaunchRequest) -> Result<Vec<InstanceId>, ApiError> {
        const ACTION: &str = "RunInstances";
        let response: RunInstancesResponse =
            self.call(Service::Cvm, ACTION, launch_body(request)).await?;
        parse_ids(ACTION, &response.instance_id_set)
    }

    async fn describe_instances(
        &self,
        tags: &[Tag],
        offset: usize,
        limit: usize,
    ) -> Result<InstancePage, ApiError> {
        const ACTION: &str = "DescribeInstances";
        let filters: Vec<Value> = tags.iter().map(tag_filter).collect();
        let response: DescribeInstancesResponse = self
            .call(
                Service::Cvm,
                ACTION,
                json!({ "Filters": filters, "Offset": offset, "Limit": limit }),
            )
            .await?;

        let instances = response
            .instance_set
            .into_iter()
            .map(|i| {
                Ok(ProviderInstance {
                    instance_id: parse_id(ACTION, &i.instance_id)?,
                    state: i.instance_state,
                    private_addresses: i.private_ip_addresses.unwrap_or_default(),
                    public_addresses: i.public_ip_addresses.unwrap_or_default(),
                    tags: i
                        .tags
                        .unwrap_or_default()
                        .into_iter()
                        .map(|t| Tag::new(t.key, t.value))
                        .collect(),
                })
            })
            .collect::<Result<_, ApiError>>()?;

        Ok(InstancePage {
            total: response.total_count,
            instances,
        })
    }

    async fn describe_instance_status(
        &self,
        ids: &[InstanceId],
    ) -> Result<Vec<InstanceStatus>, ApiError> {
        const ACTION: &str = "DescribeInstancesStatus";
        let mut statuses = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(STATUS_PAGE_SIZE) {
            let response: DescribeInstancesStatusResponse = self
                .call(
                    Service::Cvm,
                    ACTION,
                    json!({
                        "InstanceIds": chunk.iter().map(InstanceId::as_str).collect::<Vec<_>>(),
                        "Limit": STATUS_PAGE_SIZE,
                    }),
                )
                .await?;
            for status in response.instance_status_set {
                statuses.push(InstanceStatus {
                    instance_id: parse_id(ACTION, &status.instance_id)?,
                    state: status.instance_state,
                });
            }
        }
        Ok(statuses)
    }

    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), ApiError> {
        let _: Value = self
            .call(
                Service::Cvm,
                "TerminateInstances",
                json!({ "InstanceIds": ids.iter().map(InstanceId::as_str).collect::<Vec<_>>() }),
            )
            .await?;
        Ok(())
    }

    async fn describe_vpcs(&self, name: &str, tag: &Tag) -> Result<Vec<Vpc>, ApiError> {
        const ACTION: &str = "DescribeVpcs";
        let response: DescribeVpcsResponse = self
            .call(
                Service::Vpc,
                ACTION,
                json!({ "Filters": [
                    { "Name": "vpc-name", "Values": [name] },
                    tag_filter(tag),
                ] }),
            )
            .await?;
        response
            .vpc_set
            .into_iter()
            .map(|vpc| from_wire_vpc(ACTION, vpc))
            .collect()
    }

    async fn create_vpc(&self, name: &str, cidr_block: &str, tags: &[Tag]) -> Result<Vpc, ApiError> {
        const ACTION: &str = "CreateVpc";
        let response: CreateVpcResponse = self
            .call(
                Service::Vpc,
                ACTION,
                json!({ "VpcName": name, "CidrBlock": cidr_block, "Tags": wire_tags(tags) }),
            )
            .await?;
        from_wire_vpc(ACTION, response.vpc)
    }

    async fn describe_subnets(&self, query: &SubnetQuery) -> Result<Vec<Subnet>, ApiError> {
        const ACTION: &str = "DescribeSubnets";
        let body = match query {
            SubnetQuery::Named { vpc_id, name, tag } => json!({ "Filters": [
                { "Name": "vpc-id", "Values": [vpc_id.as_str()] },
                { "Name": "subnet-name", "Values": [name] },
                tag_filter(tag),
            ] }),
            SubnetQuery::Id(id) => json!({ "SubnetIds": [id.as_str()] }),
        };
        let response: DescribeSubnetsResponse = self.call(Service::Vpc, ACTION, body).await?;
        response
            .subnet_set
            .into_iter()
            .map(|subnet| from_wire_subnet(ACTION, subnet))
            .collect()
    }

    async fn create_subnet(
        &self,
        vpc_id: &VpcId,
        name: &str,
        cidr_block: &str,
        zone: &str,
        tags: &[Tag],
    ) -> Result<Subnet, ApiError> {
        const ACTION: &str = "CreateSubnet";
        let response: CreateSubnetResponse = self
            .call(
                Service::Vpc,
                ACTION,
                json!({
                    "VpcId": vpc_id.as_str(),
                    "SubnetName": name,
                    "CidrBlock": cidr_block,
                    "Zone": zone,
                    "Tags": wire_tags(tags),
                }),
            )
            .await?;
        from_wire_subnet(ACTION, response.subnet)
    }

    async fn describe_security_groups(
        &self,
        name: &str,
        tag: &Tag,
    ) -> Result<Vec<SecurityGroup>, ApiError> {
        const ACTION: &str = "DescribeSecurityGroups";
        let response: DescribeSecurityGroupsResponse = self
            .call(
                Service::Vpc,
                ACTION,
                json!({ "Filters": [
                    { "Name": "security-group-name", "Values": [name] },
                    tag_filter(tag),
                ] }),
            )
            .await?;
        response
            .security_group_set
            .into_iter()
            .map(|group| from_wire_group(ACTION, group))
            .collect()
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        tags: &[Tag],
    ) -> Result<SecurityGroup, ApiError> {
        const ACTION: &str = "CreateSecurityGroup";
        let response: CreateSecurityGroupResponse = self
            .call(
                Service::Vpc,
                ACTION,
                json!({
                    "GroupName": name,
                    "GroupDescription": description,
                    "Tags": wire_tags(tags),
                }),
            )
            .await?;
        from_wire_group(ACTION, response.security_group)
    }

    async fn describe_security_group_policies(
        &self,
        group_id: &SecurityGroupId,
    ) -> Result<PolicySet, ApiError> {
        const ACTION: &str = "DescribeSecurityGroupPolicies";
        let response: DescribePoliciesResponse = self
            .call(
                Service::Vpc,
                ACTION,
                json!({ "SecurityGroupId": group_id.as_str() }),
            )
            .await?;
        let set = response.security_group_policy_set;
        Ok(PolicySet {
            ingress: from_wire_policies(set.ingress),
            egress: from_wire_policies(set.egress),
        })
    }

    async fn create_security_group_policies(
        &self,
        group_id: &SecurityGroupId,
        policies: &PolicySet,
    ) -> Result<(), ApiError> {
        let mut set = json!({});
        if !policies.ingress.is_empty() {
            set["Ingress"] = Value::Array(policies.ingress.iter().map(wire_policy).collect());
        }
        if !policies.egress.is_empty() {
            set["Egress"] = Value::Array(policies.egress.iter().map(wire_policy).collect());
        }
        let _: Value = self
            .call(
                Service::Vpc,
                "CreateSecurityGroupPolicies",
                json!({ "SecurityGroupId": group_id.as_str(), "SecurityGroupPolicySet": set }),
            )
            .await?;
        Ok(())
    }

    async fn allocate_addresses(
        &self,
        count: usize,
        internet_charge_type: &str,
        bandwidth_out: u32,
        tags: &[Tag],
    ) -> Result<AddressAllocation, ApiError> {
        const ACTION: &str = "AllocateAddresses";
        let response: AllocateAddressesResponse = self
            .call(
                Service::Vpc,
                ACTION,
                json!({
                    "AddressCount": count,
                    "InternetChargeType": internet_charge_type,
                    "InternetMaxBandwidthOut": bandwidth_out,
                    "Tags": wire_tags(tags),
                }),
            )
            .await?;
        Ok(AddressAllocation {
            address_ids: parse_ids(ACTION, &response.address_set)?,
            task_id: parse_task(ACTION, &response.task_id)?,
        })
    }

    async fn describe_addresses(&self, query: &AddressQuery) -> Result<Vec<Address>, ApiError> {
        const ACTION: &str = "DescribeAddresses";
        let body = match query {
            AddressQuery::Ids(ids) => json!({
                "AddressIds": ids.iter().map(AddressId::as_str).collect::<Vec<_>>(),
            }),
            AddressQuery::Instances(ids) => json!({ "Filters": [{
                "Name": "instance-id",
                "Values": ids.iter().map(InstanceId::as_str).collect::<Vec<_>>(),
            }] }),
        };
        let response: DescribeAddressesResponse = self.call(Service::Vpc, ACTION, body).await?;
        response
            .address_set
            .into_iter()
            .map(|a| {
                let instance_id = match a.instance_id.as_deref() {
                    Some(id) if !id.is_empty() => Some(parse_id(ACTION, id)?),
                    _ => None,
                };
                Ok(Address {
                    address_id: parse_id(ACTION, &a.address_id)?,
                    public_ip: a.address_ip,
                    instance_id,
                })
            })
            .collect()
    }

    async fn associate_address(
        &self,
        address_id: &AddressId,
        instance_id: &InstanceId,
    ) -> Result<TaskId, ApiError> {
        const ACTION: &str = "AssociateAddress";
        let response: TaskIdResponse = self
            .call(
                Service::Vpc,
                ACTION,
                json!({ "AddressId": address_id.as_str(), "InstanceId": instance_id.as_str() }),
            )
            .await?;
        parse_task(ACTION, response.task_id.as_deref().unwrap_or_default())
    }

    async fn disassociate_address(
        &self,
        address_id: &AddressId,
    ) -> Result<Option<TaskId>, ApiError> {
        const ACTION: &str = "DisassociateAddress";
        let response: TaskIdResponse = self
            .call(
                Service::Vpc,
                ACTION,
                json!({ "AddressId": address_id.as_str() }),
            )
            .await?;
        match response.task_id.as_deref() {
            Some(raw) if !raw.is_empty() => parse_task(ACTION, raw).map(Some),
            _ => Ok(None),
        }
    }

    async fn release_addresses(&self, address_ids: &[AddressId]) -> Result<TaskId, ApiError> {
        const ACTION: &str = "ReleaseAddresses";
        let response: TaskIdResponse = self
            .call(
                Service::Vpc,
                ACTION,
                json!({ "AddressIds": address_ids.iter().map(AddressId::as_str).collect::<Vec<_>>() }),
            )
            .await?;
        parse_task(ACTION, response.task_id.as_deref().unwrap_or_default())
    }

    async fn describe_task_result(&self, task_id: TaskId) -> Result<TaskResult, ApiError> {
        let response: TaskResultResponse = self
            .call(
                Service::Vpc,
                "DescribeTaskResult",
                json!({ "TaskId": task_id.value() }),
            )
            .await?;
        Ok(TaskResult::from_provider(&response.result))
    }

    async fn describe_resources_by_tags(
        &self,
        filters: &[TagFilter],
        offset: usize,
        limit: usize,
    ) -> Result<TaggedResourcePage, ApiError> {
        let tag_filters: Vec<Value> = filters
            .iter()
            .map(|f| json!({ "TagKey": f.key, "TagValue": f.values }))
            .collect();
        let response: DescribeResourcesByTagsResponse = self
            .call(
                Service::Tag,
                "DescribeResourcesByTags",
                json!({ "TagFilters": tag_filters, "Offset": offset, "Limit": limit }),
            )
            .await?;

        Ok(TaggedResourcePage {
            total: response.total_count,
            rows: response
                .rows
                .into_iter()
                .map(|row| TaggedResourceRow {
                    service_type: row.service_type,
                    resource_prefix: row.resource_prefix,
                    resource_id: row.resource_id,
                    region: row.resource_region,
                })
                .collect(),
        })
    }
}

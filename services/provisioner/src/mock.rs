//! In-memory provider for testing and development.
//!
//! `MockCloud` keeps every resource in memory, records each call in order,
//! and exposes knobs for the behaviours the engine has to cope with: tasks
//! that stay `RUNNING` for a while, instances that take several polls to
//! boot, short launches and failing calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use cirrus_id::{AddressId, InstanceId, SecurityGroupId, SubnetId, TaskId, VpcId};
use tracing::{debug, info};

use crate::finder::ResourceKind;
use crate::provider::{
    Address, AddressAllocation, AddressQuery, ApiError, CloudApi, InstancePage, InstanceStatus,
    LaunchRequest, PolicySet, ProviderInstance, SecurityGroup, Subnet, SubnetQuery, Tag,
    TagFilter, TaggedResourcePage, TaggedResourceRow, TaskResult, Vpc,
};
use crate::types::{Role, DEFAULT_REGION};

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Provider action name (e.g. `RunInstances`).
    pub action: &'static str,

    /// Resource identifiers or arguments relevant to the call.
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
struct MockInstance {
    state: String,
    polls_until_running: u32,
    private_addresses: Vec<String>,
    public_addresses: Vec<String>,
    tags: Vec<Tag>,
}

#[derive(Debug, Clone)]
struct MockAddress {
    public_ip: String,
    instance_id: Option<InstanceId>,
    tags: Vec<Tag>,
}

#[derive(Debug, Clone, Default)]
struct MockTask {
    polls: u32,
    running_polls: u32,
    failed: bool,
}

#[derive(Debug, Default)]
struct MockState {
    instances: BTreeMap<InstanceId, MockInstance>,
    vpcs: Vec<(Vpc, Vec<Tag>)>,
    subnets: Vec<(Subnet, Vec<Tag>)>,
    groups: Vec<(SecurityGroup, Vec<Tag>)>,
    policies: HashMap<SecurityGroupId, PolicySet>,
    addresses: BTreeMap<AddressId, MockAddress>,
    tasks: HashMap<TaskId, MockTask>,
    calls: Vec<Call>,

    next_task: u64,
    next_host: u32,

    task_polls_until_done: u32,
    instance_polls_until_running: u32,
    launch_shortfall: usize,

    /// Remaining injected failures per action; `None` fails forever.
    failures: HashMap<&'static str, Option<u32>>,
}

/// In-memory cloud provider.
pub struct MockCloud {
    region: String,
    state: Mutex<MockState>,
}

impl MockCloud {
    /// Create an empty mock in the default region.
    pub fn new() -> Self {
        Self::with_region(DEFAULT_REGION)
    }

    pub fn with_region(region: &str) -> Self {
        Self {
            region: region.to_string(),
            state: Mutex::new(MockState {
                next_task: 1000,
                ..MockState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panic while holding the lock only happens inside a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------------
    // Knobs
    // ------------------------------------------------------------------------

    /// New tasks report `RUNNING` for this many polls before resolving.
    pub fn set_task_polls_until_done(&self, polls: u32) {
        self.lock().task_polls_until_done = polls;
    }

    /// New instances report `PENDING` for this many status polls.
    pub fn set_instance_polls_until_running(&self, polls: u32) {
        self.lock().instance_polls_until_running = polls;
    }

    /// Launches create this many fewer instances than requested.
    pub fn set_launch_shortfall(&self, shortfall: usize) {
        self.lock().launch_shortfall = shortfall;
    }

    /// Fail the next `times` calls to `action`.
    pub fn fail_next(&self, action: &'static str, times: u32) {
        self.lock().failures.insert(action, Some(times));
    }

    /// Fail every call to `action`.
    pub fn fail_always(&self, action: &'static str) {
        self.lock().failures.insert(action, None);
    }

    /// Make a task resolve to `FAILED`.
    ///
    /// Task ids are issued sequentially from 1001, so a task can be marked
    /// before the call that issues it.
    pub fn fail_task(&self, task_id: TaskId) {
        self.lock().tasks.entry(task_id).or_default().failed = true;
    }

    /// Override the provider state of an instance.
    pub fn set_instance_state(&self, id: &InstanceId, state: &str) {
        if let Some(instance) = self.lock().instances.get_mut(id) {
            instance.state = state.to_string();
            instance.polls_until_running = 0;
        }
    }

    /// Put one instance back into `PENDING` for `polls` status queries.
    pub fn set_instance_boot_polls(&self, id: &InstanceId, polls: u32) {
        if let Some(instance) = self.lock().instances.get_mut(id) {
            instance.state = if polls == 0 { "RUNNING" } else { "PENDING" }.to_string();
            instance.polls_until_running = polls;
        }
    }

    // ------------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------------

    /// Issue a task id that follows the configured poll behaviour.
    pub fn issue_task(&self) -> TaskId {
        let mut state = self.lock();
        new_task(&mut state)
    }

    /// Create instances directly, tagged with `tags` plus the role tag.
    pub fn seed_instances(&self, count: usize, role: Role, tags: &[Tag]) -> Vec<InstanceId> {
        let mut state = self.lock();
        let mut tags = tags.to_vec();
        tags.push(Tag::new(role.as_str(), "true"));
        (0..count)
            .map(|_| {
                let id = InstanceId::generate();
                let instance = new_instance(&mut state, tags.clone(), true);
                state.instances.insert(id.clone(), instance);
                id
            })
            .collect()
    }

    /// Create an address, optionally bound to an instance.
    pub fn seed_address(&self, tags: &[Tag], instance_id: Option<&InstanceId>) -> AddressId {
        let mut state = self.lock();
        let id = AddressId::generate();
        let public_ip = next_public_ip(&mut state);
        if let Some(instance_id) = instance_id {
            if let Some(instance) = state.instances.get_mut(instance_id) {
                instance.public_addresses = vec![public_ip.clone()];
            }
        }
        state.addresses.insert(
            id.clone(),
            MockAddress {
                public_ip,
                instance_id: instance_id.cloned(),
                tags: tags.to_vec(),
            },
        );
        id
    }

    /// Create a security group with existing rules.
    pub fn seed_security_group(&self, name: &str, tags: &[Tag], policies: PolicySet) -> SecurityGroupId {
        let mut state = self.lock();
        let group_id = SecurityGroupId::generate();
        state.groups.push((
            SecurityGroup {
                group_id: group_id.clone(),
                name: name.to_string(),
            },
            tags.to_vec(),
        ));
        state.policies.insert(group_id.clone(), policies);
        group_id
    }

    /// Create a subnet outside the engine (e.g. one supplied by the user).
    pub fn seed_subnet(&self, cidr_block: &str) -> SubnetId {
        let mut state = self.lock();
        let subnet = Subnet {
            subnet_id: SubnetId::generate(),
            vpc_id: VpcId::generate(),
            name: "user-subnet".to_string(),
            cidr_block: cidr_block.to_string(),
            zone: String::new(),
        };
        let id = subnet.subnet_id.clone();
        state.subnets.push((subnet, Vec::new()));
        id
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// All calls in order.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Calls to one action, in order.
    pub fn calls_to(&self, action: &str) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.action == action)
            .cloned()
            .collect()
    }

    /// Number of calls to one action.
    pub fn count(&self, action: &str) -> usize {
        self.calls_to(action).len()
    }

    /// Number of times a task was polled.
    pub fn task_polls(&self, task_id: TaskId) -> u32 {
        self.lock().tasks.get(&task_id).map_or(0, |task| task.polls)
    }

    /// Instance ids currently alive.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.lock().instances.keys().cloned().collect()
    }

    /// Tags of an instance.
    pub fn instance_tags(&self, id: &InstanceId) -> Vec<Tag> {
        self.lock()
            .instances
            .get(id)
            .map(|instance| instance.tags.clone())
            .unwrap_or_default()
    }

    /// Address ids currently allocated.
    pub fn address_ids(&self) -> Vec<AddressId> {
        self.lock().addresses.keys().cloned().collect()
    }

    /// Instance an address is bound to.
    pub fn address_binding(&self, id: &AddressId) -> Option<InstanceId> {
        self.lock()
            .addresses
            .get(id)
            .and_then(|address| address.instance_id.clone())
    }

    /// Current rules of a group.
    pub fn policies(&self, group_id: &SecurityGroupId) -> PolicySet {
        self.lock().policies.get(group_id).cloned().unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Record a call and apply any injected failure.
    fn begin(&self, action: &'static str, args: Vec<String>) -> Result<MutexGuard<'_, MockState>, ApiError> {
        let mut state = self.lock();
        state.calls.push(Call { action, args });

        let fail = match state.failures.get_mut(action) {
            Some(None) => true,
            Some(Some(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };

        if fail {
            debug!(action, "[MOCK] Injected failure");
            return Err(ApiError::Service {
                action: action.to_string(),
                code: "InternalError".to_string(),
                message: "injected failure".to_string(),
                request_id: format!("mock-{}", state.calls.len()),
            });
        }
        Ok(state)
    }
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

fn new_task(state: &mut MockState) -> TaskId {
    state.next_task += 1;
    let id = TaskId::new(state.next_task);
    let running_polls = state.task_polls_until_done;
    // Keep a failure marked before the task was issued.
    state.tasks.entry(id).or_default().running_polls = running_polls;
    id
}

fn new_instance(state: &mut MockState, tags: Vec<Tag>, public_ip: bool) -> MockInstance {
    state.next_host += 1;
    let host = state.next_host;
    let polls = state.instance_polls_until_running;
    MockInstance {
        state: if polls == 0 { "RUNNING" } else { "PENDING" }.to_string(),
        polls_until_running: polls,
        private_addresses: vec![format!("192.168.3.{}", host % 250 + 2)],
        public_addresses: if public_ip {
            vec![format!("203.0.113.{}", host % 250 + 2)]
        } else {
            Vec::new()
        },
        tags,
    }
}

fn next_public_ip(state: &mut MockState) -> String {
    state.next_host += 1;
    format!("198.51.100.{}", state.next_host % 250 + 2)
}

fn tags_match(tags: &[Tag], required: &[Tag]) -> bool {
    required.iter().all(|r| tags.contains(r))
}

fn filters_match(tags: &[Tag], filters: &[TagFilter]) -> bool {
    filters.iter().all(|filter| {
        tags.iter()
            .any(|tag| tag.key == filter.key && filter.values.contains(&tag.value))
    })
}

fn page<T: Clone>(items: &[T], offset: usize, limit: usize) -> Vec<T> {
    items.iter().skip(offset).take(limit).cloned().collect()
}

fn strings<T: ToString>(items: &[T]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

#[async_trait]
impl CloudApi for MockCloud {
    fn region(&self) -> &str {
        &self.region
    }

    async fn run_instances(&self, request: &LaunchRequest) -> Result<Vec<InstanceId>, ApiError> {
        let mut state = self.begin(
            "RunInstances",
            request
                .tags
                .iter()
                .map(|t| format!("{}={}", t.key, t.value))
                .collect(),
        )?;

        let created = request.count.saturating_sub(state.launch_shortfall);
        info!(count = created, requested = request.count, name = %request.name, "[MOCK] Launching instances");

        let mut ids = Vec::with_capacity(created);
        for _ in 0..created {
            let id = InstanceId::generate();
            let instance = new_instance(&mut state, request.tags.clone(), request.public_ip_assigned);
            state.instances.insert(id.clone(), instance);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn describe_instances(
        &self,
        tags: &[Tag],
        offset: usize,
        limit: usize,
    ) -> Result<InstancePage, ApiError> {
        let state = self.begin("DescribeInstances", vec![offset.to_string()])?;
        let matching: Vec<ProviderInstance> = state
            .instances
            .iter()
            .filter(|(_, instance)| tags_match(&instance.tags, tags))
            .map(|(id, instance)| ProviderInstance {
                instance_id: id.clone(),
                state: instance.state.clone(),
                private_addresses: instance.private_addresses.clone(),
                public_addresses: instance.public_addresses.clone(),
                tags: instance.tags.clone(),
            })
            .collect();

        Ok(InstancePage {
            total: matching.len(),
            instances: page(&matching, offset, limit),
        })
    }

    async fn describe_instance_status(
        &self,
        ids: &[InstanceId],
    ) -> Result<Vec<InstanceStatus>, ApiError> {
        let mut state = self.begin("DescribeInstancesStatus", strings(ids))?;
        let mut statuses = Vec::new();
        for id in ids {
            if let Some(instance) = state.instances.get_mut(id) {
                if instance.polls_until_running > 0 {
                    instance.polls_until_running -= 1;
                    if instance.polls_until_running == 0 {
                        instance.state = "RUNNING".to_string();
                        // Report the pre-transition state for this poll.
                        statuses.push(InstanceStatus {
                            instance_id: id.clone(),
                            state: "PENDING".to_string(),
                        });
                        continue;
                    }
                }
                statuses.push(InstanceStatus {
                    instance_id: id.clone(),
                    state: instance.state.clone(),
                });
            }
        }
        Ok(statuses)
    }

    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), ApiError> {
        let mut state = self.begin("TerminateInstances", strings(ids))?;
        for id in ids {
            state.instances.remove(id);
        }
        info!(count = ids.len(), "[MOCK] Terminated instances");
        Ok(())
    }

    async fn describe_vpcs(&self, name: &str, tag: &Tag) -> Result<Vec<Vpc>, ApiError> {
        let state = self.begin("DescribeVpcs", vec![name.to_string()])?;
        Ok(state
            .vpcs
            .iter()
            .filter(|(vpc, tags)| vpc.name == name && tags.contains(tag))
            .map(|(vpc, _)| vpc.clone())
            .collect())
    }

    async fn create_vpc(&self, name: &str, cidr_block: &str, tags: &[Tag]) -> Result<Vpc, ApiError> {
        let mut state = self.begin("CreateVpc", vec![name.to_string(), cidr_block.to_string()])?;
        let vpc = Vpc {
            vpc_id: VpcId::generate(),
            name: name.to_string(),
            cidr_block: cidr_block.to_string(),
        };
        state.vpcs.push((vpc.clone(), tags.to_vec()));
        Ok(vpc)
    }

    async fn describe_subnets(&self, query: &SubnetQuery) -> Result<Vec<Subnet>, ApiError> {
        let args = match query {
            SubnetQuery::Named { name, .. } => vec![name.clone()],
            SubnetQuery::Id(id) => vec![id.to_string()],
        };
        let state = self.begin("DescribeSubnets", args)?;
        Ok(state
            .subnets
            .iter()
            .filter(|(subnet, tags)| match query {
                SubnetQuery::Named { vpc_id, name, tag } => {
                    &subnet.vpc_id == vpc_id && &subnet.name == name && tags.contains(tag)
                }
                SubnetQuery::Id(id) => &subnet.subnet_id == id,
            })
            .map(|(subnet, _)| subnet.clone())
            .collect())
    }

    async fn create_subnet(
        &self,
        vpc_id: &VpcId,
        name: &str,
        cidr_block: &str,
        zone: &str,
        tags: &[Tag],
    ) -> Result<Subnet, ApiError> {
        let mut state = self.begin(
            "CreateSubnet",
            vec![vpc_id.to_string(), name.to_string(), zone.to_string()],
        )?;
        let subnet = Subnet {
            subnet_id: SubnetId::generate(),
            vpc_id: vpc_id.clone(),
            name: name.to_string(),
            cidr_block: cidr_block.to_string(),
            zone: zone.to_string(),
        };
        state.subnets.push((subnet.clone(), tags.to_vec()));
        Ok(subnet)
    }

    async fn describe_security_groups(
        &self,
        name: &str,
        tag: &Tag,
    ) -> Result<Vec<SecurityGroup>, ApiError> {
        let state = self.begin("DescribeSecurityGroups", vec![name.to_string()])?;
        Ok(state
            .groups
            .iter()
            .filter(|(group, tags)| group.name == name && tags.contains(tag))
            .map(|(group, _)| group.clone())
            .collect())
    }

    async fn create_security_group(
        &self,
        name: &str,
        _description: &str,
        tags: &[Tag],
    ) -> Result<SecurityGroup, ApiError> {
        let mut state = self.begin("CreateSecurityGroup", vec![name.to_string()])?;
        let group = SecurityGroup {
            group_id: SecurityGroupId::generate(),
            name: name.to_string(),
        };
        state.groups.push((group.clone(), tags.to_vec()));
        state.policies.insert(group.group_id.clone(), PolicySet::default());
        Ok(group)
    }

    async fn describe_security_group_policies(
        &self,
        group_id: &SecurityGroupId,
    ) -> Result<PolicySet, ApiError> {
        let state = self.begin("DescribeSecurityGroupPolicies", vec![group_id.to_string()])?;
        Ok(state.policies.get(group_id).cloned().unwrap_or_default())
    }

    async fn create_security_group_policies(
        &self,
        group_id: &SecurityGroupId,
        policies: &PolicySet,
    ) -> Result<(), ApiError> {
        let args = policies
            .ingress
            .iter()
            .map(|p| format!("ingress:{}/{}", p.port, p.protocol))
            .chain(
                policies
                    .egress
                    .iter()
                    .map(|p| format!("egress:{}/{}", p.port, p.protocol)),
            )
            .collect();
        let mut state = self.begin("CreateSecurityGroupPolicies", args)?;
        let set = state.policies.entry(group_id.clone()).or_default();
        set.ingress.extend(policies.ingress.iter().cloned());
        set.egress.extend(policies.egress.iter().cloned());
        Ok(())
    }

    async fn allocate_addresses(
        &self,
        count: usize,
        _internet_charge_type: &str,
        _bandwidth_out: u32,
        tags: &[Tag],
    ) -> Result<AddressAllocation, ApiError> {
        let mut state = self.begin("AllocateAddresses", vec![count.to_string()])?;
        let mut address_ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = AddressId::generate();
            let public_ip = next_public_ip(&mut state);
            state.addresses.insert(
                id.clone(),
                MockAddress {
                    public_ip,
                    instance_id: None,
                    tags: tags.to_vec(),
                },
            );
            address_ids.push(id);
        }
        let task_id = new_task(&mut state);
        Ok(AddressAllocation {
            address_ids,
            task_id,
        })
    }

    async fn describe_addresses(&self, query: &AddressQuery) -> Result<Vec<Address>, ApiError> {
        let args = match query {
            AddressQuery::Ids(ids) => strings(ids),
            AddressQuery::Instances(ids) => strings(ids),
        };
        let state = self.begin("DescribeAddresses", args)?;
        Ok(state
            .addresses
            .iter()
            .filter(|(id, address)| match query {
                AddressQuery::Ids(ids) => ids.contains(id),
                AddressQuery::Instances(instances) => address
                    .instance_id
                    .as_ref()
                    .is_some_and(|bound| instances.contains(bound)),
            })
            .map(|(id, address)| Address {
                address_id: id.clone(),
                public_ip: address.public_ip.clone(),
                instance_id: address.instance_id.clone(),
            })
            .collect())
    }

    async fn associate_address(
        &self,
        address_id: &AddressId,
        instance_id: &InstanceId,
    ) -> Result<TaskId, ApiError> {
        let mut state = self.begin(
            "AssociateAddress",
            vec![address_id.to_string(), instance_id.to_string()],
        )?;
        let public_ip = match state.addresses.get_mut(address_id) {
            Some(address) => {
                address.instance_id = Some(instance_id.clone());
                address.public_ip.clone()
            }
            None => {
                return Err(ApiError::Service {
                    action: "AssociateAddress".to_string(),
                    code: "InvalidAddressId.NotFound".to_string(),
                    message: format!("{address_id} not found"),
                    request_id: "mock".to_string(),
                })
            }
        };
        if let Some(instance) = state.instances.get_mut(instance_id) {
            instance.public_addresses = vec![public_ip];
        }
        Ok(new_task(&mut state))
    }

    async fn disassociate_address(
        &self,
        address_id: &AddressId,
    ) -> Result<Option<TaskId>, ApiError> {
        let mut state = self.begin("DisassociateAddress", vec![address_id.to_string()])?;
        let bound = state
            .addresses
            .get_mut(address_id)
            .and_then(|address| address.instance_id.take());
        match bound {
            Some(instance_id) => {
                if let Some(instance) = state.instances.get_mut(&instance_id) {
                    instance.public_addresses.clear();
                }
                Ok(Some(new_task(&mut state)))
            }
            None => Err(ApiError::Service {
                action: "DisassociateAddress".to_string(),
                code: "InvalidAddressIdStatus.NotBound".to_string(),
                message: format!("{address_id} is not bound"),
                request_id: "mock".to_string(),
            }),
        }
    }

    async fn release_addresses(&self, address_ids: &[AddressId]) -> Result<TaskId, ApiError> {
        let mut state = self.begin("ReleaseAddresses", strings(address_ids))?;
        for id in address_ids {
            state.addresses.remove(id);
        }
        Ok(new_task(&mut state))
    }

    async fn describe_task_result(&self, task_id: TaskId) -> Result<TaskResult, ApiError> {
        let mut state = self.begin("DescribeTaskResult", vec![task_id.to_string()])?;
        let task = state.tasks.entry(task_id).or_default();
        task.polls += 1;

        let result = if task.polls <= task.running_polls {
            TaskResult::Running
        } else if task.failed {
            TaskResult::Failed
        } else {
            TaskResult::Success
        };

        let label = match &result {
            TaskResult::Running => "RUNNING",
            TaskResult::Success => "SUCCESS",
            TaskResult::Failed => "FAILED",
            TaskResult::Other(_) => "OTHER",
        };
        if let Some(call) = state.calls.last_mut() {
            call.args.push(label.to_string());
        }
        Ok(result)
    }

    async fn describe_resources_by_tags(
        &self,
        filters: &[TagFilter],
        offset: usize,
        limit: usize,
    ) -> Result<TaggedResourcePage, ApiError> {
        let state = self.begin("DescribeResourcesByTags", vec![offset.to_string()])?;

        let row = |kind: ResourceKind, id: String| TaggedResourceRow {
            service_type: kind.service_type().to_string(),
            resource_prefix: kind.resource_prefix().to_string(),
            resource_id: id,
            region: self.region.clone(),
        };

        let mut rows = Vec::new();
        for (id, instance) in &state.instances {
            if filters_match(&instance.tags, filters) {
                rows.push(row(ResourceKind::Instance, id.to_string()));
            }
        }
        for (id, address) in &state.addresses {
            if filters_match(&address.tags, filters) {
                rows.push(row(ResourceKind::Address, id.to_string()));
            }
        }
        for (vpc, tags) in &state.vpcs {
            if filters_match(tags, filters) {
                rows.push(row(ResourceKind::Vpc, vpc.vpc_id.to_string()));
            }
        }
        for (subnet, tags) in &state.subnets {
            if filters_match(tags, filters) {
                rows.push(row(ResourceKind::Subnet, subnet.subnet_id.to_string()));
            }
        }
        for (group, tags) in &state.groups {
            if filters_match(tags, filters) {
                rows.push(row(ResourceKind::SecurityGroup, group.group_id.to_string()));
            }
        }

        Ok(TaggedResourcePage {
            total: rows.len(),
            rows: page(&rows, offset, limit),
        })
    }
}

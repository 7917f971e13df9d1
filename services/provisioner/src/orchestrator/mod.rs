//! Cluster lifecycle workflows.
//!
//! The orchestrator drives Create, Join, Delete and Rollback over the
//! provisioning components. Each invocation owns a fresh `NodeRegistry`;
//! a failed Create is rolled back before its error is returned.

mod assemble;
mod preflight;
mod teardown;

use std::fmt;
use std::sync::Arc;

use cirrus_id::InstanceId;
use cirrus_reconcile::{Backoff, DEFAULT_BACKOFF};
use tracing::{error, info, instrument, warn};

use crate::eip::EipManager;
use crate::error::{ProvisionError, Result};
use crate::finder::{instance_role, TaggedResourceFinder};
use crate::instance::{InstanceProvisioner, Login, Placement};
use crate::network::NetworkProvisioner;
use crate::provider::CloudApi;
use crate::registry::NodeRegistry;
use crate::security::SecurityGroupReconciler;
use crate::ssh::SshTransport;
use crate::task::{TaskWaiter, INSTANCE_RUNNING};
use crate::types::{
    Cluster, ClusterInfo, ClusterSpec, NodeState, NodeStatus, NodeSummary, Role, PROVIDER_NAME,
};

pub use assemble::{apply_ccm_args, node_extra_args, CCM_MASTER_ARGS};
pub use preflight::{create_check, join_check};
pub use teardown::{DeleteReport, RollbackReport};

/// Workflow phase, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Planning,
    ValidatingPreconditions,
    ProvisioningNetwork,
    ProvisioningInstances,
    AwaitingConvergence,
    AllocatingAddresses,
    AssemblingStatus,
    Done,
    Failed,
    RollingBack,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::ValidatingPreconditions => "validating_preconditions",
            Self::ProvisioningNetwork => "provisioning_network",
            Self::ProvisioningInstances => "provisioning_instances",
            Self::AwaitingConvergence => "awaiting_convergence",
            Self::AllocatingAddresses => "allocating_addresses",
            Self::AssemblingStatus => "assembling_status",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::RollingBack => "rolling_back",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn enter(cluster: &str, phase: Phase) {
    info!(cluster, phase = %phase, "Entering phase");
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Budget for task and instance-status waits.
    pub backoff: Backoff,

    /// Budget for terminate retries during rollback.
    pub rollback_backoff: Backoff,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            rollback_backoff: DEFAULT_BACKOFF,
        }
    }
}

/// Top-level cluster lifecycle driver.
pub struct Orchestrator {
    api: Arc<dyn CloudApi>,
    ssh: Arc<dyn SshTransport>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(api: Arc<dyn CloudApi>, ssh: Arc<dyn SshTransport>, config: OrchestratorConfig) -> Self {
        Self { api, ssh, config }
    }

    fn api(&self) -> &dyn CloudApi {
        self.api.as_ref()
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Provision a new cluster.
    ///
    /// On failure every node launched by this call is rolled back. A clean
    /// rollback returns the original error; an incomplete one returns a
    /// `Compensation` error wrapping it.
    #[instrument(skip(self, spec), fields(cluster = %spec.name, region = %spec.region))]
    pub async fn create(&self, spec: &ClusterSpec) -> Result<Cluster> {
        enter(&spec.name, Phase::Planning);
        info!(masters = spec.master, workers = spec.worker, "Creating cluster");

        enter(&spec.name, Phase::ValidatingPreconditions);
        create_check(spec)?;
        let public_key = load_public_key(spec).await?;

        let (exists, _) = self.cluster_exists(spec).await?;
        if exists {
            return Err(ProvisionError::Validation(format!(
                "cluster {} already exists in region {}",
                spec.name, spec.region
            )));
        }

        let registry = NodeRegistry::new();
        let result = self
            .provision(
                spec.clone(),
                Cluster::new(spec.clone()),
                &registry,
                public_key.as_deref(),
            )
            .await;

        match result {
            Ok(cluster) => {
                enter(&spec.name, Phase::Done);
                info!(
                    masters = cluster.masters.len(),
                    workers = cluster.workers.len(),
                    "Cluster created"
                );
                Ok(cluster)
            }
            Err(err) => {
                enter(&spec.name, Phase::Failed);
                error!(error = %err, resources = ?err.resources(), "Cluster creation failed");
                Err(self.compensate(spec, &registry, err).await)
            }
        }
    }

    async fn compensate(&self, spec: &ClusterSpec, registry: &NodeRegistry, err: ProvisionError) -> ProvisionError {
        // Short launches are not registered; make them visible to rollback.
        if let ProvisionError::PartialProvisioning { role, created, .. } = &err {
            for id in created {
                registry.upsert(NodeState::launched(id.clone(), *role));
            }
        }

        enter(&spec.name, Phase::RollingBack);
        match self.rollback(spec, registry).await {
            Ok(_) => err,
            Err(ProvisionError::Compensation { failures, .. }) => ProvisionError::Compensation {
                original: Some(Box::new(err)),
                failures,
            },
            Err(other) => ProvisionError::Compensation {
                original: Some(Box::new(err)),
                failures: vec![other.to_string()],
            },
        }
    }

    // ========================================================================
    // Join
    // ========================================================================

    /// Add `masters` and `workers` nodes to an existing cluster.
    ///
    /// Remembered workers that no longer exist remotely are dropped first.
    /// Join does not roll back on failure.
    #[instrument(skip(self, cluster), fields(cluster = %cluster.spec.name))]
    pub async fn join(&self, mut cluster: Cluster, masters: usize, workers: usize) -> Result<Cluster> {
        let name = cluster.spec.name.clone();
        enter(&name, Phase::ValidatingPreconditions);
        join_check(&cluster.spec, masters, workers)?;
        let public_key = load_public_key(&cluster.spec).await?;

        let (exists, ids) = self.cluster_exists(&cluster.spec).await?;
        if !exists {
            return Err(ProvisionError::Validation(format!(
                "cluster {name} does not exist"
            )));
        }

        let before = cluster.workers.len();
        cluster.workers.retain(|w| ids.contains(&w.instance_id));
        if cluster.workers.len() != before {
            info!(dropped = before - cluster.workers.len(), "Dropped workers missing remotely");
        }

        let mut delta = cluster.spec.clone();
        delta.master = masters;
        delta.worker = workers;

        let registry = NodeRegistry::new();
        match self
            .provision(delta, cluster, &registry, public_key.as_deref())
            .await
        {
            Ok(cluster) => {
                enter(&name, Phase::Done);
                info!(
                    masters = cluster.masters.len(),
                    workers = cluster.workers.len(),
                    "Nodes joined"
                );
                Ok(cluster)
            }
            Err(err) => {
                enter(&name, Phase::Failed);
                error!(error = %err, resources = ?err.resources(), "Join failed; new nodes are left in place");
                Err(err)
            }
        }
    }

    // ========================================================================
    // Shared provisioning path
    // ========================================================================

    /// Network, firewall, launch, convergence, addresses and assembly.
    ///
    /// `spec` carries the counts to launch; the returned cluster carries the
    /// merged node lists.
    async fn provision(
        &self,
        mut spec: ClusterSpec,
        mut cluster: Cluster,
        registry: &NodeRegistry,
        public_key: Option<&str>,
    ) -> Result<Cluster> {
        let api = self.api();
        let backoff = self.config.backoff.clone();

        if spec.vpc_id.is_none() {
            enter(&spec.name, Phase::ProvisioningNetwork);
            let network = NetworkProvisioner::new(api).ensure_network(&spec.zone).await?;
            spec.vpc_id = Some(network.vpc_id);
            spec.subnet_id = Some(network.subnet_id);
        }

        if spec.security_group_id.is_none() {
            let reconciler = SecurityGroupReconciler::new(api);
            let group_id = reconciler.ensure_security_group().await?;
            reconciler
                .reconcile_rules(&group_id, &spec, spec.subnet_id.as_ref())
                .await?;
            spec.security_group_id = Some(group_id);
        }

        enter(&spec.name, Phase::ProvisioningInstances);
        let login = Login::resolve(&spec);
        let placement = Placement {
            vpc_id: spec.vpc_id.clone(),
            subnet_id: spec.subnet_id.clone(),
            security_group_ids: spec.security_group_id.iter().cloned().collect(),
        };
        let launcher = InstanceProvisioner::new(api, registry);
        launcher
            .launch_batch(&spec, &placement, spec.master, Role::Master, &login)
            .await?;
        launcher
            .launch_batch(&spec, &placement, spec.worker, Role::Worker, &login)
            .await?;

        enter(&spec.name, Phase::AwaitingConvergence);
        let waiter = TaskWaiter::new(api, backoff.clone());
        waiter
            .wait_instances(&registry.rollback_candidates(), INSTANCE_RUNNING, registry)
            .await?;

        if spec.public_ip_assigned_eip {
            enter(&spec.name, Phase::AllocatingAddresses);
            let eips = EipManager::new(api, backoff);
            let mut tasks = Vec::new();
            for (role, count) in [(Role::Master, spec.master), (Role::Worker, spec.worker)] {
                let assigned = eips
                    .allocate_and_associate(&spec, count, role, registry)
                    .await?;
                tasks.extend(assigned.into_iter().map(|a| a.task_id));
            }
            waiter.wait_tasks(&tasks, "associate-address").await?;
        }

        enter(&spec.name, Phase::AssemblingStatus);
        let mut ssh = spec.ssh_credential();
        ssh.password = login.password().map(str::to_string);

        let instances = TaggedResourceFinder::new(api).cluster_instances(&spec).await?;
        let bound = if spec.public_ip_assigned_eip {
            assemble::bound_addresses(api, &instances).await
        } else {
            Default::default()
        };
        assemble::observe_instances(registry, &instances, &bound, &ssh, |_| NodeStatus::Running);

        if login.generated {
            match (public_key, spec.ssh_key_path.as_deref()) {
                (Some(key), Some(key_path)) => {
                    assemble::upload_keys(self.ssh.as_ref(), registry, key, key_path).await?;
                }
                _ => warn!("No key pair supplied; new nodes keep the generated password"),
            }
        }

        // Only the new counts were launched; lists and counts come from the merge.
        let counts = (spec.master, spec.worker);
        cluster.spec = spec;
        assemble::merge_into(&mut cluster, registry, &ssh);
        apply_ccm_args(&mut cluster.spec);
        info!(launched_masters = counts.0, launched_workers = counts.1, "Status assembled");

        Ok(cluster)
    }

    // ========================================================================
    // Delete and rollback
    // ========================================================================

    /// Tear down a cluster found by its tags.
    ///
    /// A missing cluster is an error unless `force` is set.
    #[instrument(skip(self, spec), fields(cluster = %spec.name, region = %spec.region))]
    pub async fn delete(&self, spec: &ClusterSpec, force: bool) -> Result<DeleteReport> {
        info!(force, "Deleting cluster");
        let (exists, ids) = self.cluster_exists(spec).await?;
        if !exists {
            if force {
                info!("Cluster not found; nothing to delete");
                return Ok(DeleteReport::default());
            }
            return Err(ProvisionError::Validation(format!(
                "cluster {} does not exist",
                spec.name
            )));
        }

        let report =
            teardown::delete_cluster(self.api(), self.config.backoff.clone(), spec, ids, force)
                .await?;
        info!(
            terminated = report.terminated.len(),
            released = report.released.len(),
            warnings = report.warnings.len(),
            "Cluster deleted"
        );
        Ok(report)
    }

    /// Undo the nodes this run created, as recorded in `registry`.
    #[instrument(skip(self, spec, registry), fields(cluster = %spec.name))]
    pub async fn rollback(&self, spec: &ClusterSpec, registry: &NodeRegistry) -> Result<RollbackReport> {
        teardown::rollback_nodes(
            self.api(),
            self.config.backoff.clone(),
            &self.config.rollback_backoff,
            spec,
            registry,
        )
        .await
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Whether any instance carries the cluster's tags, and their ids.
    #[instrument(skip(self, spec), fields(cluster = %spec.name))]
    pub async fn cluster_exists(&self, spec: &ClusterSpec) -> Result<(bool, Vec<InstanceId>)> {
        let instances = TaggedResourceFinder::new(self.api())
            .cluster_instances(spec)
            .await?;
        let ids: Vec<InstanceId> = instances.into_iter().map(|i| i.instance_id).collect();
        Ok((!ids.is_empty(), ids))
    }

    /// Provider-side view of a cluster: role counts and per-instance state.
    #[instrument(skip(self, spec), fields(cluster = %spec.name))]
    pub async fn describe_cluster(&self, spec: &ClusterSpec) -> Result<ClusterInfo> {
        let instances = TaggedResourceFinder::new(self.api())
            .cluster_instances(spec)
            .await?;

        let nodes: Vec<NodeSummary> = instances
            .into_iter()
            .map(|instance| NodeSummary {
                role: instance_role(&instance),
                instance_id: instance.instance_id,
                provider_state: instance.state,
                internal_addresses: instance.private_addresses,
                external_addresses: instance.public_addresses,
            })
            .collect();
        let masters = nodes.iter().filter(|n| n.role == Role::Master).count();

        Ok(ClusterInfo {
            name: spec.name.clone(),
            region: spec.region.clone(),
            zone: spec.zone.clone(),
            provider: PROVIDER_NAME.to_string(),
            masters,
            workers: nodes.len() - masters,
            nodes,
        })
    }

    /// Refresh `cluster` from the provider.
    ///
    /// Instances not reported running are marked unhealthy; remembered nodes
    /// that no longer exist are marked terminated.
    #[instrument(skip(self, cluster), fields(cluster = %cluster.spec.name))]
    pub async fn sync_nodes(&self, cluster: &mut Cluster) -> Result<()> {
        let api = self.api();
        let instances = TaggedResourceFinder::new(api)
            .cluster_instances(&cluster.spec)
            .await?;

        let bound = if cluster.spec.public_ip_assigned_eip {
            assemble::bound_addresses(api, &instances).await
        } else {
            Default::default()
        };

        let registry = NodeRegistry::new();
        let ssh = cluster.spec.ssh_credential();
        assemble::observe_instances(&registry, &instances, &bound, &ssh, |instance| {
            if instance.state.eq_ignore_ascii_case(INSTANCE_RUNNING) {
                NodeStatus::Running
            } else {
                NodeStatus::Unhealthy
            }
        });

        for node in cluster.masters.iter_mut().chain(cluster.workers.iter_mut()) {
            if registry.get(&node.instance_id).is_none() {
                node.status = NodeStatus::Terminated;
            }
        }
        assemble::merge_into(cluster, &registry, &ssh);

        info!(
            masters = cluster.masters.len(),
            workers = cluster.workers.len(),
            "Nodes synchronized"
        );
        Ok(())
    }
}

/// Read the public key to install when passwords are generated.
async fn load_public_key(spec: &ClusterSpec) -> Result<Option<String>> {
    let Some(path) = spec.ssh_public_key_path.as_deref().filter(|p| !p.is_empty()) else {
        return Ok(None);
    };
    tokio::fs::read_to_string(path)
        .await
        .map(|key| Some(key.trim().to_string()))
        .map_err(|e| ProvisionError::Validation(format!("failed to read public key {path}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::AwaitingConvergence.to_string(), "awaiting_convergence");
        assert_eq!(Phase::RollingBack.as_str(), "rolling_back");
    }

    #[tokio::test]
    async fn test_load_public_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ssh-ed25519 AAAA user@host").unwrap();

        let spec = ClusterSpec {
            ssh_public_key_path: Some(file.path().to_string_lossy().into_owned()),
            ..ClusterSpec::default()
        };
        let key = load_public_key(&spec).await.unwrap();
        assert_eq!(key.as_deref(), Some("ssh-ed25519 AAAA user@host"));

        assert_eq!(load_public_key(&ClusterSpec::default()).await.unwrap(), None);

        let missing = ClusterSpec {
            ssh_public_key_path: Some("/nonexistent/key.pub".to_string()),
            ..ClusterSpec::default()
        };
        assert!(load_public_key(&missing).await.unwrap_err().is_validation());
    }
}

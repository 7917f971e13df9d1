//! Floating public address management.
//!
//! Addresses are allocated in one tagged batch and paired with nodes of a
//! role that have no public address yet. Release always waits for every
//! disassociation task to converge before releasing anything.

use cirrus_id::{AddressId, InstanceId, TaskId};
use cirrus_reconcile::Backoff;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::finder::cluster_tags;
use crate::provider::{AddressQuery, CloudApi};
use crate::registry::NodeRegistry;
use crate::task::TaskWaiter;
use crate::types::{ClusterSpec, Role};

/// One address paired with a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EipAllocation {
    pub address_id: AddressId,
    pub public_ip: String,
    pub instance_id: InstanceId,

    /// Association task; not awaited by the manager.
    pub task_id: TaskId,
}

/// Outcome of a release run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Addresses whose release task converged.
    pub released: Vec<AddressId>,

    /// Sub-step failures, in the order they happened.
    pub failures: Vec<String>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Allocates, associates, disassociates and releases floating addresses.
pub struct EipManager<'a> {
    api: &'a dyn CloudApi,
    waiter: TaskWaiter<'a>,
}

impl<'a> EipManager<'a> {
    pub fn new(api: &'a dyn CloudApi, backoff: Backoff) -> Self {
        Self {
            api,
            waiter: TaskWaiter::new(api, backoff),
        }
    }

    /// Allocate `count` addresses and associate each with a node of `role`
    /// that lacks a public address.
    ///
    /// Candidates are taken in instance id order. The returned association
    /// tasks have been issued but not awaited.
    pub async fn allocate_and_associate(
        &self,
        spec: &ClusterSpec,
        count: usize,
        role: Role,
        registry: &NodeRegistry,
    ) -> Result<Vec<EipAllocation>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let region = self.api.region();

        info!(role = %role, count, "Allocating floating addresses");
        let allocation = self
            .api
            .allocate_addresses(
                count,
                &spec.internet_charge_type,
                spec.internet_max_bandwidth_out,
                &cluster_tags(spec),
            )
            .await
            .map_err(|e| ProvisionError::api("AllocateAddresses", region, e))?;
        registry.record_allocation(&allocation.address_ids);

        self.waiter
            .wait_task(allocation.task_id, "allocate-addresses")
            .await?;

        let addresses = self
            .api
            .describe_addresses(&AddressQuery::Ids(allocation.address_ids.clone()))
            .await
            .map_err(|e| ProvisionError::api("DescribeAddresses", region, e))?;

        let mut candidates: Vec<InstanceId> = registry
            .snapshot()
            .into_iter()
            .filter(|node| node.role == role && node.current && !node.has_public_address())
            .map(|node| node.instance_id)
            .collect();
        candidates.sort();

        if addresses.len() != candidates.len() {
            warn!(
                role = %role,
                addresses = addresses.len(),
                candidates = candidates.len(),
                "Address and node counts differ; extra entries stay unpaired"
            );
        }

        let mut assigned = Vec::with_capacity(addresses.len().min(candidates.len()));
        for (address, instance_id) in addresses.into_iter().zip(candidates) {
            let task_id = self
                .api
                .associate_address(&address.address_id, &instance_id)
                .await
                .map_err(|e| ProvisionError::api("AssociateAddress", region, e))?;

            registry.update(&instance_id, |node| {
                node.address_ids.push(address.address_id.clone());
                node.external_addresses.push(address.public_ip.clone());
            });

            debug!(
                address_id = %address.address_id,
                instance_id = %instance_id,
                task_id = %task_id,
                "Associating floating address"
            );
            assigned.push(EipAllocation {
                address_id: address.address_id,
                public_ip: address.public_ip,
                instance_id,
                task_id,
            });
        }

        info!(role = %role, count = assigned.len(), "Floating addresses associated");
        Ok(assigned)
    }

    /// Disassociate, then release, a set of addresses.
    ///
    /// Addresses that are already unbound count as disassociated. Only
    /// addresses whose disassociation converged are released, in one batch.
    /// Failures are collected in the report rather than returned.
    pub async fn release(&self, address_ids: &[AddressId]) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        if address_ids.is_empty() {
            return report;
        }

        info!(count = address_ids.len(), "Disassociating floating addresses");
        let outcomes = join_all(address_ids.iter().map(|id| self.disassociate(id))).await;

        let mut converged = Vec::with_capacity(address_ids.len());
        for (id, outcome) in address_ids.iter().zip(outcomes) {
            match outcome {
                Ok(()) => converged.push(id.clone()),
                Err(err) => {
                    warn!(address_id = %id, error = %err, "Disassociation did not converge; address kept");
                    report.failures.push(format!("disassociate {id}: {err}"));
                }
            }
        }

        if converged.is_empty() {
            return report;
        }

        let region = self.api.region();
        info!(count = converged.len(), "Releasing floating addresses");
        let task_id = match self.api.release_addresses(&converged).await {
            Ok(task_id) => task_id,
            Err(err) => {
                let err = ProvisionError::api("ReleaseAddresses", region, err);
                warn!(error = %err, "Address release rejected");
                report.failures.push(format!("release {}: {err}", join(&converged)));
                return report;
            }
        };

        match self.waiter.wait_task(task_id, "release-addresses").await {
            Ok(()) => {
                info!(count = converged.len(), "Floating addresses released");
                report.released = converged;
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "Address release did not converge");
                report.failures.push(format!("release task {task_id}: {err}"));
            }
        }

        report
    }

    async fn disassociate(&self, address_id: &AddressId) -> Result<()> {
        match self.api.disassociate_address(address_id).await {
            Ok(Some(task_id)) => self.waiter.wait_task(task_id, "disassociate-address").await,
            Ok(None) => Ok(()),
            Err(err) if err.is_already_disassociated() => {
                debug!(address_id = %address_id, "Address already unbound");
                Ok(())
            }
            Err(err) => Err(ProvisionError::api(
                "DisassociateAddress",
                self.api.region(),
                err,
            )),
        }
    }
}

fn join(ids: &[AddressId]) -> String {
    ids.iter()
        .map(AddressId::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

//! Delete and rollback.
//!
//! Both paths continue past individual failures and report everything that
//! could not be undone at the end.

use cirrus_id::{AddressId, InstanceId};
use cirrus_reconcile::{wait_for, Backoff, PollOutcome, WaitContext};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::eip::EipManager;
use crate::error::{ProvisionError, Result};
use crate::finder::{cluster_tag, ownership_tag, TaggedResourceFinder};
use crate::provider::{AddressQuery, CloudApi};
use crate::registry::NodeRegistry;
use crate::types::{ClusterSpec, NodeStatus};

/// Result of a delete run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    /// False when the cluster was already gone (forced delete only).
    pub existed: bool,
    pub terminated: Vec<InstanceId>,
    pub released: Vec<AddressId>,

    /// Failures tolerated because the delete was forced.
    pub warnings: Vec<String>,
}

/// Result of a clean rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub terminated: Vec<InstanceId>,
    pub released: Vec<AddressId>,
}

/// Tear down every tagged resource of a cluster.
///
/// `instances` are the ids found by the existence check. Address cleanup
/// failures are errors unless `force` is set; a failed termination is always
/// an error.
pub(super) async fn delete_cluster(
    api: &dyn CloudApi,
    backoff: Backoff,
    spec: &ClusterSpec,
    instances: Vec<InstanceId>,
    force: bool,
) -> Result<DeleteReport> {
    let region = api.region();
    let mut failures = Vec::new();

    let address_ids = match TaggedResourceFinder::new(api)
        .find_by_tags(&ownership_tag(), &cluster_tag(spec))
        .await
    {
        Ok(resources) => resources.address_ids(),
        Err(err) => {
            error!(error = %err, "Tagged address lookup failed");
            failures.push(format!("find tagged addresses: {err}"));
            Vec::new()
        }
    };

    let release = EipManager::new(api, backoff).release(&address_ids).await;
    failures.extend(release.failures);

    info!(cluster = %spec.name, count = instances.len(), "Terminating cluster instances");
    if !instances.is_empty() {
        if let Err(err) = api.terminate_instances(&instances).await {
            let err = ProvisionError::api("TerminateInstances", region, err);
            error!(error = %err, "Instance termination failed");
            if failures.is_empty() {
                return Err(err);
            }
            return Err(ProvisionError::Compensation {
                original: Some(Box::new(err)),
                failures,
            });
        }
    }

    if !failures.is_empty() && !force {
        return Err(ProvisionError::Compensation {
            original: None,
            failures,
        });
    }
    for warning in &failures {
        warn!(cluster = %spec.name, failure = %warning, "Ignoring cleanup failure of forced delete");
    }

    Ok(DeleteReport {
        existed: true,
        terminated: instances,
        released: release.released,
        warnings: failures,
    })
}

/// Undo everything this run created.
///
/// Floating addresses allocated by the run, bound to or recorded on
/// rollback-eligible nodes are released first, then the instances are
/// terminated with bounded retry.
pub(super) async fn rollback_nodes(
    api: &dyn CloudApi,
    backoff: Backoff,
    rollback_backoff: &Backoff,
    spec: &ClusterSpec,
    registry: &NodeRegistry,
) -> Result<RollbackReport> {
    let ids = registry.rollback_candidates();
    let allocated = registry.allocated_addresses();
    let mut report = RollbackReport::default();
    if ids.is_empty() && allocated.is_empty() {
        info!(cluster = %spec.name, "Nothing to roll back");
        return Ok(report);
    }

    let region = api.region();
    info!(
        cluster = %spec.name,
        instances = ?ids.iter().map(InstanceId::as_str).collect::<Vec<_>>(),
        addresses = allocated.len(),
        "Rolling back instances"
    );
    let mut failures = Vec::new();

    if spec.public_ip_assigned_eip || !allocated.is_empty() {
        let mut address_ids: Vec<AddressId> = ids
            .iter()
            .filter_map(|id| registry.get(id))
            .flat_map(|node| node.address_ids)
            .chain(allocated)
            .collect();

        if !ids.is_empty() {
            match api.describe_addresses(&AddressQuery::Instances(ids.clone())).await {
                Ok(addresses) => address_ids.extend(addresses.into_iter().map(|a| a.address_id)),
                Err(err) => {
                    let err = ProvisionError::api("DescribeAddresses", region, err);
                    error!(error = %err, "Address lookup for rollback failed");
                    failures.push(format!("find addresses: {err}"));
                }
            }
        }
        address_ids.sort();
        address_ids.dedup();

        let release = EipManager::new(api, backoff).release(&address_ids).await;
        failures.extend(release.failures);
        report.released = release.released;
    }

    if ids.is_empty() {
        return finish_rollback(spec, report, failures);
    }

    let context = WaitContext::new("rollback-terminate", region)
        .with_resources(&ids)
        .with_target("TERMINATED");
    let targets = ids.as_slice();
    let terminated = wait_for(rollback_backoff, context, move || async move {
        match api.terminate_instances(targets).await {
            Ok(()) => PollOutcome::Done(()),
            Err(err) => {
                warn!(error = %err, "Rollback termination failed; retrying");
                PollOutcome::Pending
            }
        }
    })
    .await;

    match terminated {
        Ok(()) => {
            for id in &ids {
                registry.update(id, |node| node.status = NodeStatus::Terminated);
            }
            report.terminated = ids;
        }
        Err(err) => {
            error!(error = %err, "Rollback could not terminate instances; remove them manually");
            failures.push(format!("terminate: {err}"));
        }
    }

    finish_rollback(spec, report, failures)
}

fn finish_rollback(spec: &ClusterSpec, report: RollbackReport, failures: Vec<String>) -> Result<RollbackReport> {
    if !failures.is_empty() {
        return Err(ProvisionError::Compensation {
            original: None,
            failures,
        });
    }

    info!(cluster = %spec.name, "Rollback complete");
    Ok(report)
}

//! Side-effect-free precondition checks.

use crate::error::{ProvisionError, Result};
use crate::types::{ClusterSpec, DEFAULT_REGION, DEFAULT_ZONE};

const DATASTORE_ENDPOINT_ARG: &str = "--datastore-endpoint";

fn invalid(message: impl Into<String>) -> ProvisionError {
    ProvisionError::Validation(message.into())
}

/// Checks that must pass before a cluster is created.
///
/// Remote existence is checked separately by the orchestrator.
pub fn create_check(spec: &ClusterSpec) -> Result<()> {
    if spec.name.is_empty() {
        return Err(invalid("cluster name must be set"));
    }

    if spec.keypair_id.is_some() && spec.ssh_key_path.as_deref().is_none_or(str::is_empty) {
        return Err(invalid(
            "an SSH private key path must be set together with a key pair id",
        ));
    }

    if spec.master < 1 {
        return Err(invalid("master count must be at least 1"));
    }

    if spec.master > 1 && !spec.embedded_cluster && !has_datastore(spec) {
        return Err(invalid(
            "more than one master needs the embedded cluster flag or an external datastore",
        ));
    }

    check_datastore_duplication(spec)?;

    if spec.vpc_id.is_some() != spec.subnet_id.is_some() {
        return Err(invalid(
            "an existing vpc and subnet must be given together",
        ));
    }

    if spec.region != DEFAULT_REGION && spec.zone == DEFAULT_ZONE && spec.vpc_id.is_none() {
        return Err(invalid(format!(
            "region {} needs an explicit zone to create the default network, or an existing vpc and subnet",
            spec.region
        )));
    }

    if spec.cloud_controller_manager && spec.router.as_deref().is_none_or(str::is_empty) {
        return Err(invalid(
            "the cloud controller manager needs a route table name",
        ));
    }

    Ok(())
}

/// Checks that must pass before nodes are added to a cluster.
pub fn join_check(spec: &ClusterSpec, masters: usize, workers: usize) -> Result<()> {
    if masters == 0 && workers == 0 {
        return Err(invalid("master or worker count must be at least 1"));
    }
    check_datastore_duplication(spec)
}

fn has_datastore(spec: &ClusterSpec) -> bool {
    spec.datastore.as_deref().is_some_and(|d| !d.is_empty())
}

fn check_datastore_duplication(spec: &ClusterSpec) -> Result<()> {
    if spec.master_extra_args.contains(DATASTORE_ENDPOINT_ARG) && has_datastore(spec) {
        return Err(invalid(format!(
            "master extra args set {DATASTORE_ENDPOINT_ARG} which duplicates the datastore option"
        )));
    }
    Ok(())
}

//! Status assembly: folding registry state into the cluster document.

use std::collections::HashMap;

use cirrus_id::{AddressId, InstanceId};
use futures_util::future::join_all;
use tracing::{info, warn};

use crate::error::{ProvisionError, Result};
use crate::finder::instance_role;
use crate::provider::{AddressQuery, CloudApi, ProviderInstance};
use crate::registry::NodeRegistry;
use crate::ssh::{upload_key, SshError, SshTransport};
use crate::types::{Cluster, ClusterSpec, NodeState, NodeStatus, SshCredential};

/// Master args appended when the cloud controller manager is enabled.
pub const CCM_MASTER_ARGS: &str = " --disable-cloud-controller --no-deploy servicelb,traefik";

/// Per-node kubelet args for the external cloud provider.
pub fn node_extra_args(spec: &ClusterSpec, node: &NodeState) -> String {
    if !spec.cloud_controller_manager {
        return String::new();
    }
    let node_name = node
        .internal_addresses
        .first()
        .map(String::as_str)
        .unwrap_or(node.instance_id.as_str());
    format!(
        " --kubelet-arg=cloud-provider=external --kubelet-arg=node-status-update-frequency=30s \
         --kubelet-arg=provider-id=tencentcloud:///{}/{} --node-name={}",
        spec.zone, node.instance_id, node_name
    )
}

/// Append the controller-manager master args once.
pub fn apply_ccm_args(spec: &mut ClusterSpec) {
    if spec.cloud_controller_manager && !spec.master_extra_args.contains(CCM_MASTER_ARGS) {
        spec.master_extra_args.push_str(CCM_MASTER_ARGS);
    }
}

/// Addresses bound to each of `instances`, in one lookup.
///
/// A failed lookup is logged and yields no bindings.
pub async fn bound_addresses(
    api: &dyn CloudApi,
    instances: &[ProviderInstance],
) -> HashMap<InstanceId, Vec<AddressId>> {
    let mut bound: HashMap<InstanceId, Vec<AddressId>> = HashMap::new();
    if instances.is_empty() {
        return bound;
    }

    let ids = instances.iter().map(|i| i.instance_id.clone()).collect();
    match api.describe_addresses(&AddressQuery::Instances(ids)).await {
        Ok(addresses) => {
            for address in addresses {
                if let Some(instance_id) = address.instance_id {
                    bound.entry(instance_id).or_default().push(address.address_id);
                }
            }
        }
        Err(err) => warn!(error = %err, "Address lookup for cluster instances failed"),
    }
    bound
}

/// Record provider observations in the registry.
///
/// Known nodes get fresh addresses and the run's SSH credential; unknown
/// instances are registered as discovered nodes with `status`.
pub fn observe_instances<S>(
    registry: &NodeRegistry,
    instances: &[ProviderInstance],
    bound: &HashMap<InstanceId, Vec<AddressId>>,
    ssh: &SshCredential,
    status: S,
) where
    S: Fn(&ProviderInstance) -> NodeStatus,
{
    for instance in instances {
        let address_ids = bound.get(&instance.instance_id).cloned();

        let known = registry.update(&instance.instance_id, |node| {
            node.internal_addresses = instance.private_addresses.clone();
            node.external_addresses = instance.public_addresses.clone();
            if let Some(ids) = &address_ids {
                node.address_ids = ids.clone();
            }
            node.ssh = ssh.clone();
        });
        if known {
            continue;
        }

        let mut node = NodeState::discovered(
            instance.instance_id.clone(),
            instance_role(instance),
            status(instance),
        );
        node.internal_addresses = instance.private_addresses.clone();
        node.external_addresses = instance.public_addresses.clone();
        node.address_ids = address_ids.unwrap_or_default();
        node.ssh = ssh.clone();
        registry.upsert(node);
    }
}

/// Install `public_key` on every node created by this run, then drop the
/// stored password in favour of `key_path`.
pub async fn upload_keys(
    transport: &dyn SshTransport,
    registry: &NodeRegistry,
    public_key: &str,
    key_path: &str,
) -> Result<()> {
    let mut nodes: Vec<NodeState> = registry
        .snapshot()
        .into_iter()
        .filter(|node| node.rollback_eligible)
        .collect();
    nodes.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

    info!(count = nodes.len(), "Uploading public key to new nodes");
    let results = join_all(nodes.iter().map(|node| async move {
        let host = node
            .external_addresses
            .first()
            .or(node.internal_addresses.first())
            .ok_or(SshError::NoAddress);
        match host {
            Ok(host) => upload_key(transport, host, &node.ssh, public_key).await,
            Err(err) => Err(err),
        }
    }))
    .await;

    for (node, result) in nodes.iter().zip(results) {
        result.map_err(|source| ProvisionError::KeyUpload {
            instance_id: node.instance_id.clone(),
            source,
        })?;
        registry.update(&node.instance_id, |n| {
            n.ssh.password = None;
            n.ssh.key_path = Some(key_path.to_string());
        });
    }
    Ok(())
}

/// Merge registry nodes into the cluster's role lists.
///
/// Unknown nodes are appended in instance id order. Known entries take the
/// observed status and addresses; their SSH credential is replaced only when
/// it is incomplete. Role counts in the spec follow the lists.
pub fn merge_into(cluster: &mut Cluster, registry: &NodeRegistry, ssh: &SshCredential) {
    let mut observed = registry.snapshot();
    observed.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

    for node in observed {
        let list = cluster.nodes_mut(node.role);
        match list.iter_mut().find(|n| n.instance_id == node.instance_id) {
            Some(existing) => {
                if !existing.ssh.is_complete() {
                    existing.ssh = if node.ssh.is_complete() {
                        node.ssh.clone()
                    } else {
                        ssh.clone()
                    };
                }
                existing.status = node.status;
                existing.current = node.current;
                if !node.internal_addresses.is_empty() {
                    existing.internal_addresses = node.internal_addresses;
                }
                if !node.external_addresses.is_empty() {
                    existing.external_addresses = node.external_addresses;
                }
                if !node.address_ids.is_empty() {
                    existing.address_ids = node.address_ids;
                }
            }
            None => list.push(node),
        }
    }

    cluster.spec.master = cluster.masters.len();
    cluster.spec.worker = cluster.workers.len();
}

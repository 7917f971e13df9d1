//! End-to-end workflows against the in-memory provider.
//!
//! These tests drive create, join, delete, rollback and sync through the
//! `Orchestrator` and check the resulting cluster documents and the provider
//! calls that produced them.

use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cirrus_id::TaskId;
use cirrus_provisioner::finder::cluster_tags;
use cirrus_provisioner::ssh::{CommandOutput, SshError};
use cirrus_provisioner::types::SshCredential;
use cirrus_provisioner::{
    CloudApi, Cluster, ClusterSpec, MockCloud, NodeStatus, Orchestrator, OrchestratorConfig,
    ProvisionError, Role, SshTransport,
};
use cirrus_reconcile::Backoff;

/// Transport that records every host it was asked to reach.
#[derive(Default)]
struct RecordingSsh {
    hosts: Mutex<Vec<String>>,
}

#[async_trait]
impl SshTransport for RecordingSsh {
    async fn run(
        &self,
        host: &str,
        _credential: &SshCredential,
        _command: &str,
    ) -> Result<CommandOutput, SshError> {
        self.hosts.lock().unwrap().push(host.to_string());
        Ok(CommandOutput::default())
    }
}

fn fast() -> OrchestratorConfig {
    let backoff = Backoff::constant(Duration::from_millis(1), 5);
    OrchestratorConfig {
        backoff: backoff.clone(),
        rollback_backoff: backoff,
    }
}

fn spec(masters: usize, workers: usize) -> ClusterSpec {
    ClusterSpec {
        name: "demo".to_string(),
        master: masters,
        worker: workers,
        ..ClusterSpec::default()
    }
}

fn setup() -> (Arc<MockCloud>, Arc<RecordingSsh>, Orchestrator) {
    let cloud = Arc::new(MockCloud::new());
    let ssh = Arc::new(RecordingSsh::default());
    let orchestrator = Orchestrator::new(cloud.clone(), ssh.clone(), fast());
    (cloud, ssh, orchestrator)
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn test_create_without_floating_addresses() {
    let (cloud, _, orchestrator) = setup();

    let cluster = orchestrator.create(&spec(1, 2)).await.unwrap();

    assert_eq!(cloud.count("RunInstances"), 2);
    assert_eq!(cluster.masters.len(), 1);
    assert_eq!(cluster.workers.len(), 2);
    assert_eq!(cluster.spec.master, 1);
    assert_eq!(cluster.spec.worker, 2);
    assert!(cluster
        .masters
        .iter()
        .chain(&cluster.workers)
        .all(|node| node.status == NodeStatus::Running && !node.internal_addresses.is_empty()));

    for action in ["AllocateAddresses", "AssociateAddress", "DescribeAddresses"] {
        assert_eq!(cloud.count(action), 0, "{action} should not be called");
    }

    // Network and firewall came from the defaults.
    assert!(cluster.spec.vpc_id.is_some());
    assert!(cluster.spec.subnet_id.is_some());
    assert!(cluster.spec.security_group_id.is_some());
}

#[tokio::test]
async fn test_create_tags_every_instance() {
    let (cloud, _, orchestrator) = setup();
    let spec = spec(1, 1);

    orchestrator.create(&spec).await.unwrap();

    let required = cluster_tags(&spec);
    for id in cloud.instance_ids() {
        let tags = cloud.instance_tags(&id);
        assert!(required.iter().all(|tag| tags.contains(tag)), "{id} is missing cluster tags");
    }
}

#[tokio::test]
async fn test_create_with_floating_addresses() {
    let (cloud, _, orchestrator) = setup();
    let spec = ClusterSpec {
        public_ip_assigned_eip: true,
        ..spec(1, 2)
    };

    let cluster = orchestrator.create(&spec).await.unwrap();

    assert_eq!(cloud.count("AllocateAddresses"), 2);
    assert_eq!(cloud.count("AssociateAddress"), 3);
    assert_eq!(cloud.address_ids().len(), 3);

    let mut bound = HashSet::new();
    for node in cluster.masters.iter().chain(&cluster.workers) {
        assert_eq!(node.address_ids.len(), 1, "{} has no address", node.instance_id);
        assert!(node.has_public_address());
        assert_eq!(
            cloud.address_binding(&node.address_ids[0]).as_ref(),
            Some(&node.instance_id)
        );
        assert!(bound.insert(node.address_ids[0].clone()));
    }
}

#[tokio::test]
async fn test_create_rejects_existing_cluster() {
    let (cloud, _, orchestrator) = setup();
    let spec = spec(1, 0);
    cloud.seed_instances(1, Role::Master, &cluster_tags(&spec));

    let err = orchestrator.create(&spec).await.unwrap_err();

    assert!(err.is_validation());
    assert_eq!(cloud.count("RunInstances"), 0);
}

#[tokio::test]
async fn test_create_invalid_spec_makes_no_calls() {
    let (cloud, _, orchestrator) = setup();

    let err = orchestrator.create(&spec(0, 2)).await.unwrap_err();

    assert!(err.is_validation());
    assert!(cloud.calls().is_empty());
}

#[tokio::test]
async fn test_create_uploads_key_when_password_generated() {
    let (cloud, ssh, orchestrator) = setup();
    let mut key = tempfile::NamedTempFile::new().unwrap();
    writeln!(key, "ssh-ed25519 AAAA demo@host").unwrap();

    let spec = ClusterSpec {
        ssh_public_key_path: Some(key.path().to_string_lossy().into_owned()),
        ssh_key_path: Some("/home/demo/.ssh/id_ed25519".to_string()),
        ..spec(1, 1)
    };

    let cluster = orchestrator.create(&spec).await.unwrap();

    assert_eq!(ssh.hosts.lock().unwrap().len(), cloud.instance_ids().len());
    for node in cluster.masters.iter().chain(&cluster.workers) {
        assert_eq!(node.ssh.password, None);
        assert_eq!(node.ssh.key_path.as_deref(), Some("/home/demo/.ssh/id_ed25519"));
    }
}

// ============================================================================
// Rollback
// ============================================================================

#[tokio::test]
async fn test_create_rolls_back_on_convergence_timeout() {
    let (cloud, _, orchestrator) = setup();
    cloud.fail_always("DescribeInstancesStatus");

    let err = orchestrator.create(&spec(1, 2)).await.unwrap_err();

    assert!(matches!(err, ProvisionError::ConvergenceTimeout(_)), "got {err}");
    assert_eq!(cloud.count("DescribeInstancesStatus"), 5);
    assert!(cloud.instance_ids().is_empty());
    assert_eq!(cloud.count("TerminateInstances"), 1);
}

#[tokio::test]
async fn test_rollback_releases_addresses_of_new_nodes() {
    let (cloud, _, orchestrator) = setup();
    // 1001 allocates the master's address, 1002 associates it.
    cloud.fail_task(TaskId::new(1002));
    let spec = ClusterSpec {
        public_ip_assigned_eip: true,
        ..spec(1, 0)
    };

    let err = orchestrator.create(&spec).await.unwrap_err();

    assert!(matches!(err, ProvisionError::TaskFailed(_)), "got {err}");
    assert_eq!(cloud.count("DisassociateAddress"), 1);
    assert_eq!(cloud.count("ReleaseAddresses"), 1);
    assert!(cloud.address_ids().is_empty());
    assert!(cloud.instance_ids().is_empty());
}

#[tokio::test]
async fn test_address_allocation_failure_rolls_back_instances() {
    let (cloud, _, orchestrator) = setup();
    cloud.fail_always("AllocateAddresses");
    let spec = ClusterSpec {
        public_ip_assigned_eip: true,
        ..spec(1, 1)
    };

    let err = orchestrator.create(&spec).await.unwrap_err();

    assert!(
        matches!(err, ProvisionError::Api { action: "AllocateAddresses", .. }),
        "got {err}"
    );
    assert_eq!(cloud.count("AssociateAddress"), 0);
    assert_eq!(cloud.count("ReleaseAddresses"), 0);
    assert!(cloud.instance_ids().is_empty());
}

#[tokio::test]
async fn test_rollback_releases_unassociated_addresses() {
    let (cloud, _, orchestrator) = setup();
    cloud.fail_always("AssociateAddress");
    let spec = ClusterSpec {
        public_ip_assigned_eip: true,
        ..spec(1, 2)
    };

    let err = orchestrator.create(&spec).await.unwrap_err();

    assert!(
        matches!(err, ProvisionError::Api { action: "AssociateAddress", .. }),
        "got {err}"
    );
    assert_eq!(cloud.count("AllocateAddresses"), 1);
    assert_eq!(cloud.count("ReleaseAddresses"), 1);
    assert!(cloud.address_ids().is_empty());
    assert!(cloud.instance_ids().is_empty());
}

#[tokio::test]
async fn test_incomplete_rollback_reports_original_error() {
    let (cloud, _, orchestrator) = setup();
    cloud.fail_always("DescribeInstancesStatus");
    cloud.fail_always("TerminateInstances");

    let err = orchestrator.create(&spec(1, 1)).await.unwrap_err();

    match err {
        ProvisionError::Compensation { original, failures } => {
            let original = original.expect("original error kept");
            assert!(matches!(*original, ProvisionError::ConvergenceTimeout(_)));
            assert_eq!(failures.len(), 1);
            assert!(failures[0].starts_with("terminate"));
        }
        other => panic!("expected compensation error, got {other}"),
    }
    assert_eq!(cloud.instance_ids().len(), 2);
    assert_eq!(cloud.count("TerminateInstances"), 5);
}

// ============================================================================
// Join
// ============================================================================

#[tokio::test]
async fn test_join_adds_workers() {
    let (cloud, _, orchestrator) = setup();
    let cluster = orchestrator.create(&spec(1, 1)).await.unwrap();
    let original_worker = cluster.workers[0].instance_id.clone();

    let cluster = orchestrator.join(cluster, 0, 2).await.unwrap();

    assert_eq!(cluster.masters.len(), 1);
    assert_eq!(cluster.workers.len(), 3);
    assert_eq!(cluster.spec.worker, 3);
    assert_eq!(cluster.workers[0].instance_id, original_worker);
    assert_eq!(cloud.count("RunInstances"), 3);
    assert_eq!(cloud.count("CreateVpc"), 1);
    assert_eq!(cloud.count("CreateSecurityGroup"), 1);
}

#[tokio::test]
async fn test_join_drops_workers_missing_remotely() {
    let (cloud, _, orchestrator) = setup();
    let cluster = orchestrator.create(&spec(1, 2)).await.unwrap();
    let gone = cluster.workers[0].instance_id.clone();
    cloud.terminate_instances(std::slice::from_ref(&gone)).await.unwrap();

    let cluster = orchestrator.join(cluster, 0, 1).await.unwrap();

    assert_eq!(cluster.workers.len(), 2);
    assert!(cluster.workers.iter().all(|w| w.instance_id != gone));
}

#[tokio::test]
async fn test_join_requires_existing_cluster() {
    let (cloud, _, orchestrator) = setup();
    let cluster = Cluster::new(spec(1, 0));

    let err = orchestrator.join(cluster, 0, 1).await.unwrap_err();

    assert!(err.is_validation());
    assert_eq!(cloud.count("RunInstances"), 0);
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_delete_releases_addresses_and_terminates() {
    let (cloud, _, orchestrator) = setup();
    let spec = spec(1, 2);
    let tags = cluster_tags(&spec);
    let mut ids = cloud.seed_instances(1, Role::Master, &tags);
    ids.extend(cloud.seed_instances(2, Role::Worker, &tags));
    cloud.seed_address(&tags, Some(&ids[0]));
    cloud.seed_address(&tags, Some(&ids[1]));

    let report = orchestrator.delete(&spec, false).await.unwrap();

    assert!(report.existed);
    assert_eq!(report.terminated.len(), 3);
    assert_eq!(report.released.len(), 2);
    assert!(report.warnings.is_empty());
    assert!(cloud.instance_ids().is_empty());
    assert!(cloud.address_ids().is_empty());

    // Addresses are gone before the instances are terminated.
    let calls = cloud.calls();
    let release = calls.iter().position(|c| c.action == "ReleaseAddresses").unwrap();
    let terminate = calls.iter().position(|c| c.action == "TerminateInstances").unwrap();
    assert!(release < terminate);
}

#[tokio::test]
async fn test_delete_leaves_other_clusters_alone() {
    let (cloud, _, orchestrator) = setup();
    let ours = spec(1, 0);
    let theirs = ClusterSpec {
        name: "other".to_string(),
        ..spec(1, 0)
    };
    cloud.seed_instances(1, Role::Master, &cluster_tags(&ours));
    let kept = cloud.seed_instances(1, Role::Master, &cluster_tags(&theirs));
    let kept_address = cloud.seed_address(&cluster_tags(&theirs), Some(&kept[0]));

    orchestrator.delete(&ours, false).await.unwrap();

    assert_eq!(cloud.instance_ids(), kept);
    assert_eq!(cloud.address_ids(), vec![kept_address]);
}

#[tokio::test]
async fn test_delete_missing_cluster() {
    let (_, _, orchestrator) = setup();

    let err = orchestrator.delete(&spec(1, 0), false).await.unwrap_err();
    assert!(err.is_validation());

    let report = orchestrator.delete(&spec(1, 0), true).await.unwrap();
    assert!(!report.existed);
    assert!(report.terminated.is_empty());
}

#[tokio::test]
async fn test_forced_delete_tolerates_address_failures() {
    let (cloud, _, orchestrator) = setup();
    let spec = spec(1, 0);
    let tags = cluster_tags(&spec);
    let ids = cloud.seed_instances(1, Role::Master, &tags);
    let address = cloud.seed_address(&tags, Some(&ids[0]));
    cloud.fail_always("DisassociateAddress");

    let report = orchestrator.delete(&spec, true).await.unwrap();

    assert_eq!(report.terminated, ids);
    assert!(report.released.is_empty());
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(cloud.address_ids(), vec![address]);
}

#[tokio::test]
async fn test_unforced_delete_reports_address_failures() {
    let (cloud, _, orchestrator) = setup();
    let spec = spec(1, 0);
    let tags = cluster_tags(&spec);
    let ids = cloud.seed_instances(1, Role::Master, &tags);
    cloud.seed_address(&tags, Some(&ids[0]));
    cloud.fail_always("DisassociateAddress");

    let err = orchestrator.delete(&spec, false).await.unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::Compensation { original: None, ref failures } if failures.len() == 1
    ));
    // Instances are still terminated.
    assert!(cloud.instance_ids().is_empty());
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn test_describe_cluster_counts_roles() {
    let (_, _, orchestrator) = setup();
    let spec = spec(1, 2);
    orchestrator.create(&spec).await.unwrap();

    let info = orchestrator.describe_cluster(&spec).await.unwrap();

    assert_eq!(info.name, "demo");
    assert_eq!(info.provider, "tencent");
    assert_eq!(info.masters, 1);
    assert_eq!(info.workers, 2);
    assert!(info.nodes.iter().all(|n| n.provider_state == "RUNNING"));
}

#[tokio::test]
async fn test_cluster_exists() {
    let (cloud, _, orchestrator) = setup();
    let spec = spec(1, 0);

    let (exists, ids) = orchestrator.cluster_exists(&spec).await.unwrap();
    assert!(!exists);
    assert!(ids.is_empty());

    let seeded = cloud.seed_instances(1, Role::Master, &cluster_tags(&spec));
    let (exists, ids) = orchestrator.cluster_exists(&spec).await.unwrap();
    assert!(exists);
    assert_eq!(ids, seeded);
}

#[tokio::test]
async fn test_sync_marks_unhealthy_and_terminated_nodes() {
    let (cloud, _, orchestrator) = setup();
    let mut cluster = orchestrator.create(&spec(1, 2)).await.unwrap();
    let stopped = cluster.workers[0].instance_id.clone();
    let removed = cluster.workers[1].instance_id.clone();
    cloud.set_instance_state(&stopped, "STOPPED");
    cloud.terminate_instances(std::slice::from_ref(&removed)).await.unwrap();

    orchestrator.sync_nodes(&mut cluster).await.unwrap();

    let status = |id| {
        cluster
            .workers
            .iter()
            .find(|w| &w.instance_id == id)
            .map(|w| w.status)
            .unwrap()
    };
    assert_eq!(status(&stopped), NodeStatus::Unhealthy);
    assert_eq!(status(&removed), NodeStatus::Terminated);
    assert_eq!(cluster.masters[0].status, NodeStatus::Running);
}

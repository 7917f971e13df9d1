//! Batch instance launching.

use cirrus_id::{InstanceId, SecurityGroupId, SubnetId, VpcId};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{error, info};

use crate::error::{ProvisionError, Result};
use crate::finder::{cluster_tag, ownership_tag, role_tag};
use crate::provider::{CloudApi, LaunchRequest, LoginSettings, Tag};
use crate::registry::NodeRegistry;
use crate::types::{ClusterSpec, NodeState, Role};

/// Length of generated login passwords.
pub const PASSWORD_LENGTH: usize = 16;

const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const DIGITS: &[u8] = b"23456789";
const SPECIAL: &[u8] = b"()~!@#$%^&*-+=";

/// Generate a login password containing every character class the
/// provider's password policy asks for.
pub fn random_password() -> String {
    let mut rng = rand::rng();
    let classes = [LOWER, UPPER, DIGITS, SPECIAL];

    let mut chars: Vec<u8> = classes
        .iter()
        .map(|class| class[rng.random_range(0..class.len())])
        .collect();

    let all = classes.concat();
    while chars.len() < PASSWORD_LENGTH {
        chars.push(all[rng.random_range(0..all.len())]);
    }
    chars.shuffle(&mut rng);

    chars.into_iter().map(char::from).collect()
}

/// Instance name for a role: `cirrus.<name>.<role>`.
pub fn instance_name(spec: &ClusterSpec, role: Role) -> String {
    format!("cirrus.{}.{}", spec.name, role)
}

/// Login settings chosen for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub settings: LoginSettings,

    /// The password was generated here, so a public key should replace it.
    pub generated: bool,
}

impl Login {
    /// Key pair if configured, otherwise the explicit password, otherwise a
    /// freshly generated password.
    pub fn resolve(spec: &ClusterSpec) -> Self {
        if let Some(key_id) = &spec.keypair_id {
            return Self {
                settings: LoginSettings::KeyPair(key_id.clone()),
                generated: false,
            };
        }
        if let Some(password) = spec.ssh_password.as_ref().filter(|p| !p.is_empty()) {
            return Self {
                settings: LoginSettings::Password(password.clone()),
                generated: false,
            };
        }
        info!("Launching instances with an auto-generated password");
        Self {
            settings: LoginSettings::Password(random_password()),
            generated: true,
        }
    }

    /// Password to record in node SSH credentials, if any.
    pub fn password(&self) -> Option<&str> {
        match &self.settings {
            LoginSettings::Password(password) => Some(password),
            LoginSettings::KeyPair(_) => None,
        }
    }
}

/// Network placement for launched instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    pub vpc_id: Option<VpcId>,
    pub subnet_id: Option<SubnetId>,
    pub security_group_ids: Vec<SecurityGroupId>,
}

/// Launches tagged instances and seeds the registry.
pub struct InstanceProvisioner<'a> {
    api: &'a dyn CloudApi,
    registry: &'a NodeRegistry,
}

impl<'a> InstanceProvisioner<'a> {
    pub fn new(api: &'a dyn CloudApi, registry: &'a NodeRegistry) -> Self {
        Self { api, registry }
    }

    /// Tags for an instance of `role`: ownership, cluster, user tags, role.
    pub fn launch_tags(spec: &ClusterSpec, role: Role) -> Vec<Tag> {
        let mut tags = vec![ownership_tag(), cluster_tag(spec)];
        tags.extend(spec.tags.iter().map(|(k, v)| Tag::new(k.clone(), v.clone())));
        tags.push(role_tag(role));
        tags
    }

    /// Launch `count` instances of `role` in one call.
    ///
    /// Anything other than exactly `count` ids is a failure and nothing is
    /// registered; instances that were created stay discoverable by tag and
    /// are listed in the error.
    pub async fn launch_batch(
        &self,
        spec: &ClusterSpec,
        placement: &Placement,
        count: usize,
        role: Role,
        login: &Login,
    ) -> Result<Vec<InstanceId>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let region = self.api.region();
        let request = LaunchRequest {
            count,
            name: instance_name(spec, role),
            image_id: spec.image_id.clone(),
            instance_type: spec.instance_type.clone(),
            zone: spec.zone.clone(),
            vpc_id: placement.vpc_id.clone(),
            subnet_id: placement.subnet_id.clone(),
            security_group_ids: placement.security_group_ids.clone(),
            system_disk_type: spec.system_disk_type.clone(),
            system_disk_size: spec.system_disk_size,
            instance_charge_type: spec.instance_charge_type.clone(),
            internet_charge_type: spec.internet_charge_type.clone(),
            internet_max_bandwidth_out: spec.internet_max_bandwidth_out,
            public_ip_assigned: !spec.public_ip_assigned_eip,
            login: login.settings.clone(),
            tags: Self::launch_tags(spec, role),
        };

        info!(role = %role, count, name = %request.name, zone = %spec.zone, "Launching instances");

        let ids = self
            .api
            .run_instances(&request)
            .await
            .map_err(|e| ProvisionError::api("RunInstances", region, e))?;

        if ids.len() != count {
            error!(
                role = %role,
                requested = count,
                created = ids.len(),
                "Launch returned fewer instances than requested"
            );
            return Err(ProvisionError::PartialProvisioning {
                role,
                requested: count,
                created: ids,
            });
        }

        let mut ssh = spec.ssh_credential();
        ssh.password = login.password().map(str::to_string);
        for id in &ids {
            let mut node = NodeState::launched(id.clone(), role);
            node.ssh = ssh.clone();
            self.registry.upsert(node);
        }

        info!(role = %role, count, "Instances launched");
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCloud;
    use crate::types::NodeStatus;

    fn spec() -> ClusterSpec {
        let mut spec = ClusterSpec {
            name: "demo".to_string(),
            ..ClusterSpec::default()
        };
        spec.tags.insert("team".to_string(), "infra".to_string());
        spec
    }

    #[test]
    fn test_random_password_classes() {
        let password = random_password();
        assert_eq!(password.len(), PASSWORD_LENGTH);
        assert!(password.bytes().any(|b| LOWER.contains(&b)));
        assert!(password.bytes().any(|b| UPPER.contains(&b)));
        assert!(password.bytes().any(|b| DIGITS.contains(&b)));
        assert!(password.bytes().any(|b| SPECIAL.contains(&b)));
        assert!(!password.contains('\''));
    }

    #[test]
    fn test_login_resolution() {
        let generated = Login::resolve(&spec());
        assert!(generated.generated);
        assert!(generated.password().is_some());

        let explicit = Login::resolve(&ClusterSpec {
            ssh_password: Some("Secret#123".to_string()),
            ..spec()
        });
        assert!(!explicit.generated);
        assert_eq!(explicit.password(), Some("Secret#123"));

        let keyed = Login::resolve(&ClusterSpec {
            keypair_id: Some("skey-abc123".parse().unwrap()),
            ..spec()
        });
        assert!(matches!(keyed.settings, LoginSettings::KeyPair(_)));
        assert_eq!(keyed.password(), None);
    }

    #[test]
    fn test_launch_tags() {
        let tags = InstanceProvisioner::launch_tags(&spec(), Role::Worker);
        assert_eq!(tags[0], Tag::new("cirrus", "true"));
        assert_eq!(tags[1], Tag::new("cluster", "cirrus-demo.ap-guangzhou.tencent"));
        assert!(tags.contains(&Tag::new("team", "infra")));
        assert_eq!(tags.last(), Some(&Tag::new("worker", "true")));
    }

    #[tokio::test]
    async fn test_launch_batch_registers_pending_nodes() {
        let cloud = MockCloud::new();
        let registry = NodeRegistry::new();
        let login = Login::resolve(&spec());

        let ids = InstanceProvisioner::new(&cloud, &registry)
            .launch_batch(&spec(), &Placement::default(), 2, Role::Master, &login)
            .await
            .unwrap();

        assert_eq!(ids.len(), 2);
        for id in &ids {
            let node = registry.get(id).unwrap();
            assert_eq!(node.status, NodeStatus::Pending);
            assert!(node.rollback_eligible);
            assert_eq!(node.ssh.password.as_deref(), login.password());
        }
    }

    #[tokio::test]
    async fn test_short_launch_is_a_failure() {
        let cloud = MockCloud::new();
        cloud.set_launch_shortfall(1);
        let registry = NodeRegistry::new();

        let err = InstanceProvisioner::new(&cloud, &registry)
            .launch_batch(&spec(), &Placement::default(), 3, Role::Worker, &Login::resolve(&spec()))
            .await
            .unwrap_err();

        match err {
            ProvisionError::PartialProvisioning {
                requested, created, ..
            } => {
                assert_eq!(requested, 3);
                assert_eq!(created.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.is_empty());
        assert_eq!(cloud.instance_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_count_makes_no_call() {
        let cloud = MockCloud::new();
        let registry = NodeRegistry::new();
        let ids = InstanceProvisioner::new(&cloud, &registry)
            .launch_batch(&spec(), &Placement::default(), 0, Role::Worker, &Login::resolve(&spec()))
            .await
            .unwrap();

        assert!(ids.is_empty());
        assert_eq!(cloud.count("RunInstances"), 0);
    }
}

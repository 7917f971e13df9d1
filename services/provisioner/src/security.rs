//! Security group reconciliation.
//!
//! Reconciliation is additive: it computes which required ingress ports are
//! not yet covered, adds them in one batch, and adds an allow-all egress rule
//! when the group has none. Existing rules are never modified or removed.

use cirrus_id::{SecurityGroupId, SubnetId};
use cirrus_networking::{parse_port_list, source_covers, Ipv4Cidr, Protocol, ANY_IPV4};
use tracing::{info, warn};

use crate::error::{ProvisionError, Result};
use crate::finder::ownership_tag;
use crate::network::NetworkProvisioner;
use crate::provider::{CloudApi, PolicySet, SecurityGroupPolicy};
use crate::types::ClusterSpec;

/// Name of the default security group.
pub const SECURITY_GROUP_NAME: &str = "cirrus";

const SECURITY_GROUP_DESCRIPTION: &str = "generated by cirrus";

pub const SSH_PORT: u16 = 22;
pub const VXLAN_PORT: u16 = 8472;
pub const API_SERVER_PORT: u16 = 6443;
pub const KUBELET_PORT: u16 = 10250;
pub const DATASTORE_CLIENT_PORT: u16 = 2379;
pub const DATASTORE_PEER_PORT: u16 = 2380;
pub const DASHBOARD_PORT: u16 = 8999;

/// One required ingress rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityRuleRequirement {
    pub protocol: Protocol,
    pub port: u16,

    /// Source block the rule must admit.
    pub scope: Ipv4Cidr,
    pub purpose: &'static str,

    /// Existing rules only count when their source covers `scope`.
    pub scoped: bool,
}

impl SecurityRuleRequirement {
    fn open(protocol: Protocol, port: u16, purpose: &'static str) -> Self {
        Self {
            protocol,
            port,
            scope: Ipv4Cidr::ANY,
            purpose,
            scoped: false,
        }
    }

    fn scoped(port: u16, scope: Ipv4Cidr, purpose: &'static str) -> Self {
        Self {
            protocol: Protocol::Tcp,
            port,
            scope,
            purpose,
            scoped: true,
        }
    }

    /// Returns true if an existing rule already satisfies this requirement.
    pub fn is_covered_by(&self, rule: &SecurityGroupPolicy) -> bool {
        parse_port_list(&rule.port).contains(&self.port)
            && (!self.scoped || source_covers(&rule.cidr_block, &self.scope))
    }

    pub fn to_policy(&self) -> SecurityGroupPolicy {
        SecurityGroupPolicy {
            protocol: self.protocol.clone(),
            port: self.port.to_string(),
            cidr_block: self.scope.to_string(),
            action: "ACCEPT".to_string(),
            description: format!("accept for {} ({})", self.purpose, SECURITY_GROUP_DESCRIPTION),
        }
    }
}

/// Baseline ingress rules for a cluster.
///
/// `datastore_scope` restricts the datastore client and peer ports.
pub fn required_rules(spec: &ClusterSpec, datastore_scope: Ipv4Cidr) -> Vec<SecurityRuleRequirement> {
    let mut rules = vec![SecurityRuleRequirement::open(Protocol::Tcp, SSH_PORT, "ssh")];

    if spec.uses_default_overlay() {
        rules.push(SecurityRuleRequirement::open(
            Protocol::Udp,
            VXLAN_PORT,
            "overlay network",
        ));
    }

    rules.push(SecurityRuleRequirement::open(
        Protocol::Tcp,
        API_SERVER_PORT,
        "api server",
    ));
    rules.push(SecurityRuleRequirement::open(
        Protocol::Tcp,
        KUBELET_PORT,
        "kubelet",
    ));
    rules.push(SecurityRuleRequirement::scoped(
        DATASTORE_CLIENT_PORT,
        datastore_scope,
        "datastore client",
    ));
    rules.push(SecurityRuleRequirement::scoped(
        DATASTORE_PEER_PORT,
        datastore_scope,
        "datastore peer",
    ));

    if spec.ui {
        rules.push(SecurityRuleRequirement::open(
            Protocol::Tcp,
            DASHBOARD_PORT,
            "dashboard",
        ));
    }

    rules
}

/// Requirements not satisfied by any existing ingress rule.
pub fn missing_rules(
    required: Vec<SecurityRuleRequirement>,
    existing: &PolicySet,
) -> Vec<SecurityRuleRequirement> {
    required
        .into_iter()
        .filter(|req| !existing.ingress.iter().any(|rule| req.is_covered_by(rule)))
        .collect()
}

/// The allow-all egress rule.
pub fn allow_all_egress() -> SecurityGroupPolicy {
    SecurityGroupPolicy {
        protocol: Protocol::All,
        port: "ALL".to_string(),
        cidr_block: ANY_IPV4.to_string(),
        action: "ACCEPT".to_string(),
        description: format!("allow all egress ({})", SECURITY_GROUP_DESCRIPTION),
    }
}

/// Outcome of a rule reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleReport {
    /// Ports added to ingress.
    pub added_ingress: Vec<u16>,
    pub added_egress: bool,
}

/// Ensures the default security group and its baseline rules.
pub struct SecurityGroupReconciler<'a> {
    api: &'a dyn CloudApi,
}

impl<'a> SecurityGroupReconciler<'a> {
    pub fn new(api: &'a dyn CloudApi) -> Self {
        Self { api }
    }

    /// Reuse the tagged default group or create it.
    pub async fn ensure_security_group(&self) -> Result<SecurityGroupId> {
        let region = self.api.region();
        let tag = ownership_tag();

        let groups = self
            .api
            .describe_security_groups(SECURITY_GROUP_NAME, &tag)
            .await
            .map_err(|e| ProvisionError::api("DescribeSecurityGroups", region, e))?;

        if let Some(group) = groups.into_iter().next() {
            info!(group_id = %group.group_id, name = SECURITY_GROUP_NAME, "Reusing default security group");
            return Ok(group.group_id);
        }

        info!(name = SECURITY_GROUP_NAME, region, "Creating default security group");
        let group = self
            .api
            .create_security_group(SECURITY_GROUP_NAME, SECURITY_GROUP_DESCRIPTION, &[tag])
            .await
            .map_err(|e| ProvisionError::api("CreateSecurityGroup", region, e))?;

        info!(group_id = %group.group_id, "Created default security group");
        Ok(group.group_id)
    }

    /// Add every missing baseline rule to `group_id`.
    ///
    /// Datastore ports are scoped to the subnet's address block; when the
    /// subnet is unknown or its block cannot be read, they admit any source.
    pub async fn reconcile_rules(
        &self,
        group_id: &SecurityGroupId,
        spec: &ClusterSpec,
        subnet_id: Option<&SubnetId>,
    ) -> Result<RuleReport> {
        let region = self.api.region();
        info!(group_id = %group_id, "Checking security group rules");

        let existing = self
            .api
            .describe_security_group_policies(group_id)
            .await
            .map_err(|e| ProvisionError::api("DescribeSecurityGroupPolicies", region, e))?;

        let scope = self.datastore_scope(subnet_id).await;
        let missing = missing_rules(required_rules(spec, scope), &existing);
        let mut report = RuleReport::default();

        if !missing.is_empty() {
            let ingress = PolicySet {
                ingress: missing.iter().map(SecurityRuleRequirement::to_policy).collect(),
                egress: Vec::new(),
            };
            self.api
                .create_security_group_policies(group_id, &ingress)
                .await
                .map_err(|e| ProvisionError::api("CreateSecurityGroupPolicies", region, e))?;

            report.added_ingress = missing.iter().map(|r| r.port).collect();
            info!(group_id = %group_id, ports = ?report.added_ingress, "Added ingress rules");
        }

        if existing.egress.is_empty() {
            let egress = PolicySet {
                ingress: Vec::new(),
                egress: vec![allow_all_egress()],
            };
            self.api
                .create_security_group_policies(group_id, &egress)
                .await
                .map_err(|e| ProvisionError::api("CreateSecurityGroupPolicies", region, e))?;

            report.added_egress = true;
            info!(group_id = %group_id, "Added allow-all egress rule");
        }

        Ok(report)
    }

    async fn datastore_scope(&self, subnet_id: Option<&SubnetId>) -> Ipv4Cidr {
        let Some(subnet_id) = subnet_id else {
            return Ipv4Cidr::ANY;
        };

        match NetworkProvisioner::new(self.api).subnet_cidr(subnet_id).await {
            Ok(Some(cidr)) => match Ipv4Cidr::from_cidr(&cidr) {
                Ok(block) => block,
                Err(err) => {
                    warn!(subnet_id = %subnet_id, cidr = %cidr, error = %err, "Unparseable subnet block; datastore ports open to any source");
                    Ipv4Cidr::ANY
                }
            },
            Ok(None) => {
                warn!(subnet_id = %subnet_id, "Subnet not found; datastore ports open to any source");
                Ipv4Cidr::ANY
            }
            Err(err) => {
                warn!(subnet_id = %subnet_id, error = %err, "Subnet lookup failed; datastore ports open to any source");
                Ipv4Cidr::ANY
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_networking::DEFAULT_SUBNET_CIDR;

    fn rule(port: &str, cidr: &str) -> SecurityGroupPolicy {
        SecurityGroupPolicy {
            protocol: Protocol::Tcp,
            port: port.to_string(),
            cidr_block: cidr.to_string(),
            action: "ACCEPT".to_string(),
            description: String::new(),
        }
    }

    fn subnet() -> Ipv4Cidr {
        Ipv4Cidr::from_cidr(DEFAULT_SUBNET_CIDR).unwrap()
    }

    #[test]
    fn test_required_rules_defaults() {
        let spec = ClusterSpec::default();
        let ports: Vec<u16> = required_rules(&spec, subnet()).iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![22, 8472, 6443, 10250, 2379, 2380]);
    }

    #[test]
    fn test_required_rules_optional_ports() {
        let spec = ClusterSpec {
            network_mode: "host-gw".to_string(),
            ui: true,
            ..ClusterSpec::default()
        };
        let ports: Vec<u16> = required_rules(&spec, subnet()).iter().map(|r| r.port).collect();
        assert!(!ports.contains(&VXLAN_PORT));
        assert!(ports.contains(&DASHBOARD_PORT));
    }

    #[test]
    fn test_port_lists_cover_requirements() {
        let existing = PolicySet {
            ingress: vec![rule("22,6443", "0.0.0.0/0")],
            egress: vec![],
        };
        let missing = missing_rules(required_rules(&ClusterSpec::default(), subnet()), &existing);
        let ports: Vec<u16> = missing.iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![8472, 10250, 2379, 2380]);
    }

    #[test]
    fn test_datastore_ports_need_matching_scope() {
        let existing = PolicySet {
            ingress: vec![
                rule("2379", "10.0.0.0/8"),
                rule("2380", "192.168.3.0/24"),
            ],
            egress: vec![],
        };
        let missing = missing_rules(required_rules(&ClusterSpec::default(), subnet()), &existing);
        let ports: Vec<u16> = missing.iter().map(|r| r.port).collect();
        assert!(ports.contains(&2379));
        assert!(!ports.contains(&2380));

        let universal = PolicySet {
            ingress: vec![rule("2379,2380", "0.0.0.0/0")],
            egress: vec![],
        };
        let missing = missing_rules(required_rules(&ClusterSpec::default(), subnet()), &universal);
        assert!(missing.iter().all(|r| !r.scoped));
    }

    #[test]
    fn test_policy_rendering() {
        let req = SecurityRuleRequirement::scoped(2379, subnet(), "datastore client");
        let policy = req.to_policy();
        assert_eq!(policy.port, "2379");
        assert_eq!(policy.cidr_block, "192.168.3.0/24");
        assert_eq!(policy.protocol, Protocol::Tcp);

        let egress = allow_all_egress();
        assert_eq!(egress.protocol, Protocol::All);
        assert_eq!(egress.cidr_block, "0.0.0.0/0");
    }
}

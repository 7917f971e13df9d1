//! Default private network provisioning.

use cirrus_id::{SubnetId, VpcId};
use cirrus_networking::{DEFAULT_SUBNET_CIDR, DEFAULT_VPC_CIDR};
use tracing::info;

use crate::error::{ProvisionError, Result};
use crate::finder::ownership_tag;
use crate::provider::{CloudApi, SubnetQuery};

/// Name of the default private network.
pub const VPC_NAME: &str = "cirrus-vpc";

/// Name of the default subnet.
pub const SUBNET_NAME: &str = "cirrus-subnet";

/// Identifiers of a ready network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIds {
    pub vpc_id: VpcId,
    pub subnet_id: SubnetId,
}

/// Ensures the default network and subnet exist.
///
/// Lookups are by fixed name plus the ownership tag, so sequential runs
/// reuse what an earlier run created. Two runs racing on the same region can
/// both create a network.
pub struct NetworkProvisioner<'a> {
    api: &'a dyn CloudApi,
}

impl<'a> NetworkProvisioner<'a> {
    pub fn new(api: &'a dyn CloudApi) -> Self {
        Self { api }
    }

    /// Reuse or create the default network, then its subnet in `zone`.
    pub async fn ensure_network(&self, zone: &str) -> Result<NetworkIds> {
        let region = self.api.region();
        let tag = ownership_tag();

        let existing = self
            .api
            .describe_vpcs(VPC_NAME, &tag)
            .await
            .map_err(|e| ProvisionError::api("DescribeVpcs", region, e))?;

        let vpc_id = match existing.into_iter().next() {
            Some(vpc) => {
                info!(vpc_id = %vpc.vpc_id, name = VPC_NAME, "Reusing default network");
                vpc.vpc_id
            }
            None => {
                info!(name = VPC_NAME, region, cidr = DEFAULT_VPC_CIDR, "Creating default network");
                let vpc = self
                    .api
                    .create_vpc(VPC_NAME, DEFAULT_VPC_CIDR, &[tag.clone()])
                    .await
                    .map_err(|e| ProvisionError::api("CreateVpc", region, e))?;
                info!(vpc_id = %vpc.vpc_id, "Created default network");
                vpc.vpc_id
            }
        };

        let subnets = self
            .api
            .describe_subnets(&SubnetQuery::Named {
                vpc_id: vpc_id.clone(),
                name: SUBNET_NAME.to_string(),
                tag: tag.clone(),
            })
            .await
            .map_err(|e| ProvisionError::api("DescribeSubnets", region, e))?;

        let subnet_id = match subnets.into_iter().next() {
            Some(subnet) => {
                info!(subnet_id = %subnet.subnet_id, vpc_id = %vpc_id, "Reusing default subnet");
                subnet.subnet_id
            }
            None => {
                info!(vpc_id = %vpc_id, zone, cidr = DEFAULT_SUBNET_CIDR, "Creating default subnet");
                let subnet = self
                    .api
                    .create_subnet(&vpc_id, SUBNET_NAME, DEFAULT_SUBNET_CIDR, zone, &[tag])
                    .await
                    .map_err(|e| ProvisionError::api("CreateSubnet", region, e))?;
                info!(subnet_id = %subnet.subnet_id, "Created default subnet");
                subnet.subnet_id
            }
        };

        Ok(NetworkIds { vpc_id, subnet_id })
    }

    /// Address block of a subnet, if the subnet exists.
    pub async fn subnet_cidr(&self, subnet_id: &SubnetId) -> Result<Option<String>> {
        let subnets = self
            .api
            .describe_subnets(&SubnetQuery::Id(subnet_id.clone()))
            .await
            .map_err(|e| ProvisionError::api("DescribeSubnets", self.api.region(), e))?;
        Ok(subnets.into_iter().next().map(|s| s.cidr_block))
    }
}

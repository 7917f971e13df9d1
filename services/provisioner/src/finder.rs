//! Tag-based resource discovery.
//!
//! Everything the engine creates carries the ownership tag and the cluster
//! tag, so Delete and Rollback can recover the full resource set from the
//! provider without trusting local state.

use std::collections::BTreeSet;

use cirrus_id::{AddressId, InstanceId};
use tracing::{debug, warn};

use crate::error::{ProvisionError, Result};
use crate::provider::{CloudApi, ProviderInstance, Tag, TagFilter};
use crate::types::{ClusterSpec, Role};

/// Ownership tag key; value is always `true`.
pub const OWNERSHIP_TAG_KEY: &str = "cirrus";

/// Cluster membership tag key.
pub const CLUSTER_TAG_KEY: &str = "cluster";

/// Prefix of the cluster membership tag value.
pub const CLUSTER_TAG_PREFIX: &str = "cirrus-";

/// Page size for instance discovery.
pub const INSTANCE_PAGE_SIZE: usize = 20;

/// Page size for the tag service.
pub const TAG_PAGE_SIZE: usize = 100;

/// `cirrus=true`
pub fn ownership_tag() -> Tag {
    Tag::new(OWNERSHIP_TAG_KEY, "true")
}

/// `cluster=cirrus-<qualified name>`
pub fn cluster_tag(spec: &ClusterSpec) -> Tag {
    Tag::new(
        CLUSTER_TAG_KEY,
        format!("{}{}", CLUSTER_TAG_PREFIX, spec.qualified_name()),
    )
}

/// `master=true` or `worker=true`
pub fn role_tag(role: Role) -> Tag {
    Tag::new(role.as_str(), "true")
}

/// Ownership plus cluster tag.
pub fn cluster_tags(spec: &ClusterSpec) -> Vec<Tag> {
    vec![ownership_tag(), cluster_tag(spec)]
}

/// Kind of a tagged resource, keyed by the tag service's
/// `(service_type, resource_prefix)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Instance,
    Address,
    Vpc,
    Subnet,
    SecurityGroup,
    Other {
        service_type: String,
        resource_prefix: String,
    },
}

impl ResourceKind {
    /// Classify a `(service_type, resource_prefix)` pair.
    pub fn classify(service_type: &str, resource_prefix: &str) -> Self {
        let service = service_type.to_ascii_lowercase();
        let prefix = resource_prefix.to_ascii_lowercase();
        match (service.as_str(), prefix.as_str()) {
            ("cvm", "instance") => Self::Instance,
            ("cvm", "eip") => Self::Address,
            ("vpc", "vpc") => Self::Vpc,
            ("vpc", "subnet") => Self::Subnet,
            ("cvm", "sg") => Self::SecurityGroup,
            _ => Self::Other {
                service_type: service,
                resource_prefix: prefix,
            },
        }
    }

    pub fn service_type(&self) -> &str {
        match self {
            Self::Instance | Self::Address | Self::SecurityGroup => "cvm",
            Self::Vpc | Self::Subnet => "vpc",
            Self::Other { service_type, .. } => service_type,
        }
    }

    pub fn resource_prefix(&self) -> &str {
        match self {
            Self::Instance => "instance",
            Self::Address => "eip",
            Self::Vpc => "vpc",
            Self::Subnet => "subnet",
            Self::SecurityGroup => "sg",
            Self::Other {
                resource_prefix, ..
            } => resource_prefix,
        }
    }
}

/// A resource found through its tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaggedResource {
    pub kind: ResourceKind,
    pub resource_id: String,
    pub region: String,
}

/// Resources owned by one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterResources {
    pub resources: Vec<TaggedResource>,
}

impl ClusterResources {
    /// Resources of one kind.
    pub fn of_kind<'a>(&'a self, kind: &'a ResourceKind) -> impl Iterator<Item = &'a TaggedResource> {
        self.resources.iter().filter(move |r| &r.kind == kind)
    }

    /// Floating address ids; ids that do not parse are skipped with a warning.
    pub fn address_ids(&self) -> Vec<AddressId> {
        self.of_kind(&ResourceKind::Address)
            .filter_map(|r| match AddressId::parse(&r.resource_id) {
                Ok(id) => Some(id),
                Err(err) => {
                    warn!(resource_id = %r.resource_id, error = %err, "Skipping malformed address id");
                    None
                }
            })
            .collect()
    }

    /// Instance ids; ids that do not parse are skipped with a warning.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.of_kind(&ResourceKind::Instance)
            .filter_map(|r| match InstanceId::parse(&r.resource_id) {
                Ok(id) => Some(id),
                Err(err) => {
                    warn!(resource_id = %r.resource_id, error = %err, "Skipping malformed instance id");
                    None
                }
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Discovers cluster resources through tags.
pub struct TaggedResourceFinder<'a> {
    api: &'a dyn CloudApi,
}

impl<'a> TaggedResourceFinder<'a> {
    pub fn new(api: &'a dyn CloudApi) -> Self {
        Self { api }
    }

    /// Every resource carrying both tags, deduplicated and sorted.
    pub async fn find_by_tags(&self, ownership: &Tag, cluster: &Tag) -> Result<ClusterResources> {
        let filters = [TagFilter::from(ownership), TagFilter::from(cluster)];
        let mut found = BTreeSet::new();
        let mut offset = 0;

        loop {
            let page = self
                .api
                .describe_resources_by_tags(&filters, offset, TAG_PAGE_SIZE)
                .await
                .map_err(|e| ProvisionError::api("DescribeResourcesByTags", self.api.region(), e))?;

            if page.rows.is_empty() {
                break;
            }
            offset += page.rows.len();

            for row in page.rows {
                found.insert(TaggedResource {
                    kind: ResourceKind::classify(&row.service_type, &row.resource_prefix),
                    resource_id: row.resource_id,
                    region: row.region,
                });
            }

            if offset >= page.total {
                break;
            }
        }

        debug!(cluster = %cluster.value, count = found.len(), "Discovered tagged resources");
        Ok(ClusterResources {
            resources: found.into_iter().collect(),
        })
    }

    /// Instances carrying all `tags`, fetched in pages of 20.
    pub async fn list_instances(&self, tags: &[Tag]) -> Result<Vec<ProviderInstance>> {
        let mut instances = Vec::new();
        let mut offset = 0;

        loop {
            let page = self
                .api
                .describe_instances(tags, offset, INSTANCE_PAGE_SIZE)
                .await
                .map_err(|e| ProvisionError::api("DescribeInstances", self.api.region(), e))?;

            if page.instances.is_empty() {
                break;
            }
            offset += INSTANCE_PAGE_SIZE;
            instances.extend(page.instances);

            if offset >= page.total {
                break;
            }
        }

        Ok(instances)
    }

    /// Instances of one cluster.
    pub async fn cluster_instances(&self, spec: &ClusterSpec) -> Result<Vec<ProviderInstance>> {
        self.list_instances(&cluster_tags(spec)).await
    }
}

/// Role recorded in an instance's tags; untagged instances count as workers.
pub fn instance_role(instance: &ProviderInstance) -> Role {
    if instance.has_flag_tag(Role::Master.as_str()) {
        Role::Master
    } else {
        Role::Worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCloud;
    use rstest::rstest;

    #[rstest]
    #[case("cvm", "instance", ResourceKind::Instance)]
    #[case("CVM", "EIP", ResourceKind::Address)]
    #[case("vpc", "vpc", ResourceKind::Vpc)]
    #[case("vpc", "subnet", ResourceKind::Subnet)]
    #[case("cvm", "sg", ResourceKind::SecurityGroup)]
    fn test_classify_known_pairs(
        #[case] service: &str,
        #[case] prefix: &str,
        #[case] expected: ResourceKind,
    ) {
        assert_eq!(ResourceKind::classify(service, prefix), expected);
    }

    #[test]
    fn test_classify_requires_exact_pair() {
        // An eip prefix under another service is not a floating address.
        assert!(matches!(
            ResourceKind::classify("vpc", "eip"),
            ResourceKind::Other { .. }
        ));
        assert!(matches!(
            ResourceKind::classify("cvm", "eip-"),
            ResourceKind::Other { .. }
        ));
    }

    #[test]
    fn test_cluster_tag_uses_qualified_name() {
        let spec = ClusterSpec {
            name: "demo".to_string(),
            ..ClusterSpec::default()
        };
        assert_eq!(cluster_tag(&spec).value, "cirrus-demo.ap-guangzhou.tencent");
    }

    #[tokio::test]
    async fn test_find_by_tags_scopes_to_cluster() {
        let cloud = MockCloud::new();
        let demo = ClusterSpec {
            name: "demo".to_string(),
            ..ClusterSpec::default()
        };
        let other = ClusterSpec {
            name: "other".to_string(),
            ..ClusterSpec::default()
        };

        let ids = cloud.seed_instances(2, Role::Worker, &cluster_tags(&demo));
        cloud.seed_address(&cluster_tags(&demo), Some(&ids[0]));
        cloud.seed_instances(1, Role::Worker, &cluster_tags(&other));

        let found = TaggedResourceFinder::new(&cloud)
            .find_by_tags(&ownership_tag(), &cluster_tag(&demo))
            .await
            .unwrap();

        assert_eq!(found.instance_ids().len(), 2);
        assert_eq!(found.address_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_list_instances_paginates() {
        let cloud = MockCloud::new();
        let spec = ClusterSpec {
            name: "big".to_string(),
            ..ClusterSpec::default()
        };
        cloud.seed_instances(45, Role::Worker, &cluster_tags(&spec));

        let instances = TaggedResourceFinder::new(&cloud)
            .cluster_instances(&spec)
            .await
            .unwrap();

        assert_eq!(instances.len(), 45);
        assert_eq!(cloud.count("DescribeInstances"), 3);
    }
}

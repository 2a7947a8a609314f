//! Resource kinds and their attribute schemas.
//!
//! Each [`ResourceKind`] knows which attributes a declaration must and may
//! carry, which attributes the provider exports once it is realized, and how
//! long readiness may take.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::value::AttributeValue;

/// Supported resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Virtual private cloud.
    Vpc,
    /// Subnet inside a VPC.
    Subnet,
    /// Internet gateway attached to a VPC.
    InternetGateway,
    /// Route table with routes and subnet associations.
    RouteTable,
    /// Security group.
    SecurityGroup,
    /// Application or network load balancer.
    LoadBalancer,
    /// Load balancer target group.
    TargetGroup,
    /// Load balancer listener.
    Listener,
    /// Launch template for instances.
    LaunchTemplate,
    /// Auto scaling group.
    AutoScalingGroup,
    /// Single compute instance.
    Instance,
    /// Registration of a target in a target group.
    TargetAttachment,
    /// Database subnet group.
    DbSubnetGroup,
    /// Aurora database cluster.
    DbCluster,
    /// Aurora database instance inside a cluster.
    DbInstance,
    /// Cache subnet group.
    CacheSubnetGroup,
    /// `ElastiCache` replication group.
    CacheReplicationGroup,
    /// Elastic file system.
    FileSystem,
    /// File system mount target in a subnet.
    MountTarget,
}

/// Expected type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    /// String or interpolated template.
    String,
    /// Number.
    Number,
    /// Boolean.
    Bool,
    /// List.
    List,
    /// Map.
    Map,
}

/// How a kind reaches readiness after its create call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The create call returns the resource ready.
    Immediate,
    /// The resource must be polled until available, within the bound.
    Polled {
        /// Upper bound on the readiness wait, in seconds.
        timeout_secs: u64,
    },
}

/// Attribute schema for a resource kind.
#[derive(Debug, Clone, Copy)]
pub struct KindSchema {
    /// Attributes that must be present.
    pub required: &'static [(&'static str, AttrType)],
    /// Attributes that may be present.
    pub optional: &'static [(&'static str, AttrType)],
    /// Attributes exported once the resource is realized.
    pub exports: &'static [&'static str],
    /// Readiness behaviour.
    pub readiness: Readiness,
}

/// Exports every kind carries.
const BASE_EXPORTS: &[&str] = &["id", "arn"];

/// All kinds in declaration order, for listings and parsing.
pub const ALL_KINDS: &[ResourceKind] = &[
    ResourceKind::Vpc,
    ResourceKind::Subnet,
    ResourceKind::InternetGateway,
    ResourceKind::RouteTable,
    ResourceKind::SecurityGroup,
    ResourceKind::LoadBalancer,
    ResourceKind::TargetGroup,
    ResourceKind::Listener,
    ResourceKind::LaunchTemplate,
    ResourceKind::AutoScalingGroup,
    ResourceKind::Instance,
    ResourceKind::TargetAttachment,
    ResourceKind::DbSubnetGroup,
    ResourceKind::DbCluster,
    ResourceKind::DbInstance,
    ResourceKind::CacheSubnetGroup,
    ResourceKind::CacheReplicationGroup,
    ResourceKind::FileSystem,
    ResourceKind::MountTarget,
];

impl ResourceKind {
    /// Returns the snake-case tag used in plan files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Vpc => "vpc",
            Self::Subnet => "subnet",
            Self::InternetGateway => "internet_gateway",
            Self::RouteTable => "route_table",
            Self::SecurityGroup => "security_group",
            Self::LoadBalancer => "load_balancer",
            Self::TargetGroup => "target_group",
            Self::Listener => "listener",
            Self::LaunchTemplate => "launch_template",
            Self::AutoScalingGroup => "auto_scaling_group",
            Self::Instance => "instance",
            Self::TargetAttachment => "target_attachment",
            Self::DbSubnetGroup => "db_subnet_group",
            Self::DbCluster => "db_cluster",
            Self::DbInstance => "db_instance",
            Self::CacheSubnetGroup => "cache_subnet_group",
            Self::CacheReplicationGroup => "cache_replication_group",
            Self::FileSystem => "file_system",
            Self::MountTarget => "mount_target",
        }
    }

    /// Returns the attribute schema for this kind.
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub const fn schema(self) -> KindSchema {
        use AttrType::{Bool, List, Map, Number, String};

        match self {
            Self::Vpc => KindSchema {
                required: &[("cidr_block", String)],
                optional: &[("enable_dns_hostnames", Bool), ("enable_dns_support", Bool)],
                exports: &["cidr_block", "default_security_group_id"],
                readiness: Readiness::Polled { timeout_secs: 120 },
            },
            Self::Subnet => KindSchema {
                required: &[("vpc_id", String), ("cidr_block", String)],
                optional: &[("availability_zone", String), ("map_public_ip_on_launch", Bool)],
                exports: &["availability_zone", "cidr_block"],
                readiness: Readiness::Polled { timeout_secs: 120 },
            },
            Self::InternetGateway => KindSchema {
                required: &[("vpc_id", String)],
                optional: &[],
                exports: &[],
                readiness: Readiness::Immediate,
            },
            Self::RouteTable => KindSchema {
                required: &[("vpc_id", String)],
                optional: &[("routes", List), ("subnet_ids", List)],
                exports: &[],
                readiness: Readiness::Immediate,
            },
            Self::SecurityGroup => KindSchema {
                required: &[("vpc_id", String), ("name", String)],
                optional: &[("description", String), ("ingress", List), ("egress", List)],
                exports: &["name"],
                readiness: Readiness::Immediate,
            },
            Self::LoadBalancer => KindSchema {
                required: &[("subnets", List)],
                optional: &[
                    ("name", String),
                    ("security_groups", List),
                    ("scheme", String),
                    ("load_balancer_type", String),
                ],
                exports: &["dns_name", "zone_id"],
                readiness: Readiness::Polled { timeout_secs: 600 },
            },
            Self::TargetGroup => KindSchema {
                required: &[("vpc_id", String), ("port", Number), ("protocol", String)],
                optional: &[("name", String), ("target_type", String), ("health_check", Map)],
                exports: &["name"],
                readiness: Readiness::Immediate,
            },
            Self::Listener => KindSchema {
                required: &[("load_balancer_arn", String), ("port", Number), ("protocol", String)],
                optional: &[("default_target_group_arn", String), ("certificate_arn", String)],
                exports: &[],
                readiness: Readiness::Immediate,
            },
            Self::LaunchTemplate => KindSchema {
                required: &[("image_id", String), ("instance_type", String)],
                optional: &[
                    ("name", String),
                    ("security_group_ids", List),
                    ("user_data", String),
                    ("key_name", String),
                    ("iam_instance_profile", String),
                ],
                exports: &["latest_version"],
                readiness: Readiness::Immediate,
            },
            Self::AutoScalingGroup => KindSchema {
                required: &[
                    ("launch_template_id", String),
                    ("min_size", Number),
                    ("max_size", Number),
                    ("subnet_ids", List),
                ],
                optional: &[
                    ("name", String),
                    ("desired_capacity", Number),
                    ("target_group_arns", List),
                    ("health_check_type", String),
                    ("health_check_grace_period", Number),
                ],
                exports: &["name"],
                readiness: Readiness::Polled { timeout_secs: 900 },
            },
            Self::Instance => KindSchema {
                required: &[("image_id", String), ("instance_type", String)],
                optional: &[
                    ("subnet_id", String),
                    ("security_group_ids", List),
                    ("user_data", String),
                    ("key_name", String),
                    ("associate_public_ip_address", Bool),
                ],
                exports: &["private_ip", "public_ip", "private_dns"],
                readiness: Readiness::Polled { timeout_secs: 600 },
            },
            Self::TargetAttachment => KindSchema {
                required: &[("target_group_arn", String), ("target_id", String)],
                optional: &[("port", Number)],
                exports: &[],
                readiness: Readiness::Polled { timeout_secs: 300 },
            },
            Self::DbSubnetGroup => KindSchema {
                required: &[("subnet_ids", List)],
                optional: &[("name", String), ("description", String)],
                exports: &["name"],
                readiness: Readiness::Immediate,
            },
            Self::DbCluster => KindSchema {
                required: &[("engine", String), ("master_username", String)],
                optional: &[
                    ("engine_version", String),
                    ("database_name", String),
                    ("master_password", String),
                    ("db_subnet_group_name", String),
                    ("vpc_security_group_ids", List),
                    ("backup_retention_period", Number),
                    ("storage_encrypted", Bool),
                ],
                exports: &["endpoint", "reader_endpoint", "port"],
                readiness: Readiness::Polled { timeout_secs: 2400 },
            },
            Self::DbInstance => KindSchema {
                required: &[("cluster_id", String), ("instance_class", String)],
                optional: &[("engine", String), ("publicly_accessible", Bool)],
                exports: &["endpoint"],
                readiness: Readiness::Polled { timeout_secs: 2400 },
            },
            Self::CacheSubnetGroup => KindSchema {
                required: &[("subnet_ids", List)],
                optional: &[("name", String), ("description", String)],
                exports: &["name"],
                readiness: Readiness::Immediate,
            },
            Self::CacheReplicationGroup => KindSchema {
                required: &[("node_type", String), ("engine", String)],
                optional: &[
                    ("description", String),
                    ("engine_version", String),
                    ("num_cache_clusters", Number),
                    ("cache_subnet_group_name", String),
                    ("security_group_ids", List),
                    ("automatic_failover_enabled", Bool),
                    ("port", Number),
                ],
                exports: &["primary_endpoint", "reader_endpoint", "port"],
                readiness: Readiness::Polled { timeout_secs: 1800 },
            },
            Self::FileSystem => KindSchema {
                required: &[],
                optional: &[
                    ("creation_token", String),
                    ("performance_mode", String),
                    ("throughput_mode", String),
                    ("encrypted", Bool),
                ],
                exports: &["dns_name"],
                readiness: Readiness::Polled { timeout_secs: 600 },
            },
            Self::MountTarget => KindSchema {
                required: &[("file_system_id", String), ("subnet_id", String)],
                optional: &[("security_group_ids", List)],
                exports: &["ip_address", "dns_name"],
                readiness: Readiness::Polled { timeout_secs: 600 },
            },
        }
    }

    /// Returns true if the kind exports `attribute` once realized.
    #[must_use]
    pub fn exports(self, attribute: &str) -> bool {
        BASE_EXPORTS.contains(&attribute) || self.schema().exports.contains(&attribute)
    }

    /// Returns every attribute this kind exports.
    #[must_use]
    pub fn exported_attributes(self) -> Vec<&'static str> {
        BASE_EXPORTS
            .iter()
            .chain(self.schema().exports.iter())
            .copied()
            .collect()
    }

    /// Looks up the expected type of a declared attribute.
    ///
    /// `tags` is accepted on every kind.
    #[must_use]
    pub fn attribute_type(self, name: &str) -> Option<AttrType> {
        if name == "tags" {
            return Some(AttrType::Map);
        }
        let schema = self.schema();
        schema
            .required
            .iter()
            .chain(schema.optional.iter())
            .find(|(attr, _)| *attr == name)
            .map(|(_, ty)| *ty)
    }

    /// Returns the readiness upper bound, or `None` for immediate kinds.
    #[must_use]
    pub const fn readiness_timeout(self) -> Option<Duration> {
        match self.schema().readiness {
            Readiness::Immediate => None,
            Readiness::Polled { timeout_secs } => Some(Duration::from_secs(timeout_secs)),
        }
    }
}

impl AttrType {
    /// Returns true if `value` is acceptable for this type.
    ///
    /// References are accepted anywhere since their type is only known once
    /// the referenced resource is realized. Templates always render to strings.
    #[must_use]
    pub const fn accepts(self, value: &AttributeValue) -> bool {
        matches!(
            (self, value),
            (_, AttributeValue::Reference(_))
                | (Self::String, AttributeValue::String(_) | AttributeValue::Template(_))
                | (Self::Number, AttributeValue::Number(_))
                | (Self::Bool, AttributeValue::Bool(_))
                | (Self::List, AttributeValue::List(_))
                | (Self::Map, AttributeValue::Map(_))
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Map => "map",
        };
        write!(f, "{name}")
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_KINDS
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown resource type '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_round_trip_through_from_str() {
        for kind in ALL_KINDS {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), *kind);
        }
        assert!("nat_gateway".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_every_kind_exports_id_and_arn() {
        for kind in ALL_KINDS {
            assert!(kind.exports("id"));
            assert!(kind.exports("arn"));
        }
        assert!(ResourceKind::LoadBalancer.exports("dns_name"));
        assert!(!ResourceKind::Vpc.exports("dns_name"));
    }

    #[test]
    fn test_attribute_types() {
        assert_eq!(ResourceKind::Vpc.attribute_type("cidr_block"), Some(AttrType::String));
        assert_eq!(ResourceKind::Vpc.attribute_type("tags"), Some(AttrType::Map));
        assert_eq!(ResourceKind::Vpc.attribute_type("port"), None);
        assert_eq!(ResourceKind::TargetGroup.attribute_type("port"), Some(AttrType::Number));
    }

    #[test]
    fn test_slow_kinds_have_longer_bounds() {
        let db = ResourceKind::DbCluster.readiness_timeout().unwrap();
        let lb = ResourceKind::LoadBalancer.readiness_timeout().unwrap();
        assert!(db > lb);
        assert!(ResourceKind::SecurityGroup.readiness_timeout().is_none());
    }

    #[test]
    fn test_type_acceptance() {
        let reference = AttributeValue::parse_string("${vpc.id}").unwrap();
        assert!(AttrType::Number.accepts(&reference));
        assert!(AttrType::String.accepts(&AttributeValue::String(String::from("x"))));
        assert!(!AttrType::String.accepts(&AttributeValue::Number(1.0)));
        assert!(!AttrType::List.accepts(&AttributeValue::Bool(true)));
    }

    #[test]
    fn test_serde_uses_snake_case_tags() {
        let kind: ResourceKind = serde_json::from_str("\"cache_replication_group\"").unwrap();
        assert_eq!(kind, ResourceKind::CacheReplicationGroup);
        assert_eq!(serde_json::to_string(&ResourceKind::DbCluster).unwrap(), "\"db_cluster\"");
    }
}

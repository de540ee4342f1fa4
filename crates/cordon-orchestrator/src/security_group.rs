//! Security group access and deletion ordering.
//!
//! Groups reference each other through their ingress rules, and the
//! provider refuses to delete a group that another group's rules still
//! point at. [`deletion_order`] turns the reference graph into a safe
//! deletion sequence so teardown never trips over that constraint.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use aws_sdk_ec2::types::{IpPermission, IpRange, ResourceType, TagSpecification, UserIdGroupPair};
use pathfinding::directed::strongly_connected_components::strongly_connected_components;
use pathfinding::directed::topological_sort::topological_sort;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::gateways::missing_resource;
use crate::tags::{self, TagSet, TYPE_TAG_KEY};

/// A security group as the orchestrator sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupRecord {
    /// Provider-assigned id.
    pub id: String,
    /// Provider group name. The VPC's built-in group is named `default`
    /// and cannot be deleted.
    pub group_name: String,
    /// Owning VPC.
    pub vpc_id: String,
    /// Ids of groups this group's ingress rules reference.
    pub referenced_group_ids: Vec<String>,
    /// Role marker tag, when present.
    pub role: Option<String>,
}

impl SecurityGroupRecord {
    /// Whether this is the VPC's built-in group, which the provider
    /// deletes together with the VPC itself.
    pub fn is_builtin(&self) -> bool {
        self.group_name == "default"
    }
}

/// Source of an ingress rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    /// Traffic from members of another security group.
    Group(String),
    /// Traffic from an IPv4 range.
    Cidr(String),
}

/// One ingress rule to authorize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    /// IP protocol, `-1` for all.
    pub protocol: String,
    /// First port of the range, `None` for all-protocol rules.
    pub from_port: Option<i32>,
    /// Last port of the range, `None` for all-protocol rules.
    pub to_port: Option<i32>,
    /// Where the traffic may come from.
    pub source: RuleSource,
}

impl IngressRule {
    /// Admit all traffic from members of `group_id`.
    pub fn all_from_group(group_id: impl Into<String>) -> Self {
        Self {
            protocol: "-1".to_string(),
            from_port: None,
            to_port: None,
            source: RuleSource::Group(group_id.into()),
        }
    }

    /// Admit all traffic from an IPv4 range.
    pub fn all_from_cidr(cidr: impl Into<String>) -> Self {
        Self {
            protocol: "-1".to_string(),
            from_port: None,
            to_port: None,
            source: RuleSource::Cidr(cidr.into()),
        }
    }
}

/// Security group lookup and lifecycle calls.
#[async_trait]
pub trait SecurityGroupPort: Send + Sync {
    /// The reservation's group carrying the given role marker, if any.
    async fn find_by_role(
        &self,
        reservation_id: &str,
        role_marker: &str,
    ) -> Result<Option<SecurityGroupRecord>>;

    /// All groups of a VPC, including the built-in one.
    async fn list_by_vpc(&self, vpc_id: &str) -> Result<Vec<SecurityGroupRecord>>;

    /// Create a group, tagged at creation. Returns its id.
    async fn create(
        &self,
        vpc_id: &str,
        name: &str,
        description: &str,
        tags: &TagSet,
    ) -> Result<String>;

    /// Authorize ingress rules. Rules that already exist are tolerated,
    /// so repeated provisioning converges instead of failing.
    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<()>;

    /// Drop every ingress rule of a group. Used to break reference
    /// cycles before deletion.
    async fn revoke_all_ingress(&self, group_id: &str) -> Result<()>;

    /// Delete a group. Already-deleted is tolerated.
    async fn delete(&self, group_id: &str) -> Result<()>;
}

/// A deletion sequence over a set of security groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionPlan {
    /// Group ids in deletion order. Every group precedes the groups its
    /// rules reference, so referencers are gone before their targets.
    pub ordered: Vec<String>,
    /// Groups involved in mutual reference cycles. Their rules must be
    /// revoked before deletion can proceed in any order.
    pub cyclic: Vec<String>,
}

/// Compute the order in which `groups` can be deleted.
///
/// Edges run from a group to the groups its ingress rules reference.
/// References to groups outside the set and self-references are ignored,
/// since neither blocks deletion.
pub fn deletion_order(groups: &[SecurityGroupRecord]) -> DeletionPlan {
    let nodes: Vec<String> = groups.iter().map(|g| g.id.clone()).collect();
    let references: HashMap<&str, Vec<String>> = groups
        .iter()
        .map(|g| {
            let targets = g
                .referenced_group_ids
                .iter()
                .filter(|target| **target != g.id && nodes.contains(target))
                .cloned()
                .collect();
            (g.id.as_str(), targets)
        })
        .collect();
    let successors = |id: &String| -> Vec<String> {
        references.get(id.as_str()).cloned().unwrap_or_default()
    };

    match topological_sort(&nodes, successors) {
        Ok(ordered) => DeletionPlan {
            ordered,
            cyclic: Vec::new(),
        },
        Err(_) => {
            // Mutual references. Order the condensation instead and mark
            // the entangled groups for rule revocation.
            let components = strongly_connected_components(&nodes, successors);
            let component_of: HashMap<&str, usize> = components
                .iter()
                .enumerate()
                .flat_map(|(i, comp)| comp.iter().map(move |id| (id.as_str(), i)))
                .collect();
            let indices: Vec<usize> = (0..components.len()).collect();
            let component_successors = |i: &usize| -> Vec<usize> {
                components[*i]
                    .iter()
                    .flat_map(|id| successors(id))
                    .filter_map(|target| component_of.get(target.as_str()).copied())
                    .filter(|j| j != i)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            };
            let component_order =
                topological_sort(&indices, component_successors).unwrap_or(indices);

            let mut ordered = Vec::with_capacity(nodes.len());
            let mut cyclic = Vec::new();
            for i in component_order {
                if components[i].len() > 1 {
                    cyclic.extend(components[i].iter().cloned());
                }
                ordered.extend(components[i].iter().cloned());
            }
            DeletionPlan { ordered, cyclic }
        }
    }
}

/// EC2-backed implementation of [`SecurityGroupPort`].
pub struct AwsSecurityGroupGateway {
    client: aws_sdk_ec2::Client,
}

impl AwsSecurityGroupGateway {
    /// Wrap an EC2 client.
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

fn group_record(group: &aws_sdk_ec2::types::SecurityGroup) -> SecurityGroupRecord {
    let referenced: Vec<String> = group
        .ip_permissions()
        .iter()
        .flat_map(|perm| perm.user_id_group_pairs())
        .filter_map(|pair| pair.group_id().map(str::to_string))
        .collect();
    SecurityGroupRecord {
        id: group.group_id().unwrap_or_default().to_string(),
        group_name: group.group_name().unwrap_or_default().to_string(),
        vpc_id: group.vpc_id().unwrap_or_default().to_string(),
        referenced_group_ids: referenced,
        role: tags::tag_value(group.tags(), TYPE_TAG_KEY),
    }
}

fn to_ip_permission(rule: &IngressRule) -> IpPermission {
    let mut builder = IpPermission::builder().ip_protocol(&rule.protocol);
    if let Some(port) = rule.from_port {
        builder = builder.from_port(port);
    }
    if let Some(port) = rule.to_port {
        builder = builder.to_port(port);
    }
    match &rule.source {
        RuleSource::Group(group_id) => builder.user_id_group_pairs(
            UserIdGroupPair::builder().group_id(group_id).build(),
        ),
        RuleSource::Cidr(cidr) => {
            builder.ip_ranges(IpRange::builder().cidr_ip(cidr).build())
        }
    }
    .build()
}

#[async_trait]
impl SecurityGroupPort for AwsSecurityGroupGateway {
    async fn find_by_role(
        &self,
        reservation_id: &str,
        role_marker: &str,
    ) -> Result<Option<SecurityGroupRecord>> {
        let response = self
            .client
            .describe_security_groups()
            .filters(tags::reservation_filter(reservation_id))
            .filters(tags::tag_filter(TYPE_TAG_KEY, role_marker))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        Ok(response.security_groups().first().map(group_record))
    }

    async fn list_by_vpc(&self, vpc_id: &str) -> Result<Vec<SecurityGroupRecord>> {
        let response = self
            .client
            .describe_security_groups()
            .filters(tags::attribute_filter("vpc-id", vpc_id))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        Ok(response.security_groups().iter().map(group_record).collect())
    }

    async fn create(
        &self,
        vpc_id: &str,
        name: &str,
        description: &str,
        tags: &TagSet,
    ) -> Result<String> {
        let response = self
            .client
            .create_security_group()
            .vpc_id(vpc_id)
            .group_name(name)
            .description(description)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::SecurityGroup)
                    .set_tags(Some(tags.to_ec2_tags()))
                    .build(),
            )
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        let group_id = response
            .group_id()
            .ok_or_else(|| {
                OrchestratorError::provider("create_security_group returned no group id")
            })?
            .to_string();
        info!(group_id = %group_id, name = %name, "created security group");
        Ok(group_id)
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<()> {
        if rules.is_empty() {
            return Ok(());
        }
        let permissions: Vec<IpPermission> = rules.iter().map(to_ip_permission).collect();
        match self
            .client
            .authorize_security_group_ingress()
            .group_id(group_id)
            .set_ip_permissions(Some(permissions))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                let err = aws_sdk_ec2::Error::from(err);
                if error_code(&err).is_some_and(|code| code.contains("Duplicate")) {
                    debug!(group_id = %group_id, "ingress rules already present");
                    Ok(())
                } else {
                    Err(OrchestratorError::from_ec2(err))
                }
            }
        }
    }

    async fn revoke_all_ingress(&self, group_id: &str) -> Result<()> {
        let response = self
            .client
            .describe_security_groups()
            .group_ids(group_id)
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        let Some(group) = response.security_groups().first() else {
            return Ok(());
        };
        if group.ip_permissions().is_empty() {
            return Ok(());
        }
        self.client
            .revoke_security_group_ingress()
            .group_id(group_id)
            .set_ip_permissions(Some(group.ip_permissions().to_vec()))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;
        info!(group_id = %group_id, "revoked all ingress rules");
        Ok(())
    }

    async fn delete(&self, group_id: &str) -> Result<()> {
        match self
            .client
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
        {
            Ok(_) => {
                info!(group_id = %group_id, "deleted security group");
                Ok(())
            }
            Err(err) => {
                let err = aws_sdk_ec2::Error::from(err);
                if missing_resource(&err) {
                    Ok(())
                } else {
                    Err(OrchestratorError::from_ec2(err))
                }
            }
        }
    }
}

fn error_code(err: &aws_sdk_ec2::Error) -> Option<&str> {
    use aws_sdk_ec2::error::ProvideErrorMetadata;
    err.code()
}

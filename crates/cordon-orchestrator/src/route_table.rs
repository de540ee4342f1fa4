//! Route table access.

use async_trait::async_trait;
use aws_sdk_ec2::types::{ResourceType, RouteState, TagSpecification};
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::gateways::missing_resource;
use crate::retry::{RetryPolicy, retry};
use crate::tags::{self, TagSet};

/// Where a route sends traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// An internet gateway id.
    InternetGateway(String),
    /// A VPC peering connection id.
    Peering(String),
    /// A network interface id.
    Interface(String),
    /// A NAT gateway id.
    NatGateway(String),
}

impl RouteTarget {
    /// The raw id inside the target.
    pub fn id(&self) -> &str {
        match self {
            Self::InternetGateway(id)
            | Self::Peering(id)
            | Self::Interface(id)
            | Self::NatGateway(id) => id,
        }
    }
}

/// One route inside a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRecord {
    /// Destination CIDR.
    pub destination: String,
    /// Next hop, `None` for the VPC-local route.
    pub target: Option<RouteTarget>,
    /// Whether the provider marks the route as dead because its target
    /// no longer exists.
    pub blackhole: bool,
}

/// A subnet association of a route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTableAssociation {
    /// Provider-assigned association id.
    pub id: String,
    /// Associated subnet, `None` for the VPC main association.
    pub subnet_id: Option<String>,
    /// Whether this is the VPC main association.
    pub is_main: bool,
}

/// A route table as the orchestrator sees it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteTableRecord {
    /// Provider-assigned id.
    pub id: String,
    /// Owning VPC.
    pub vpc_id: String,
    /// Display name tag, when present.
    pub name: Option<String>,
    /// Routes currently in the table.
    pub routes: Vec<RouteRecord>,
    /// Subnet associations, including the main association.
    pub associations: Vec<RouteTableAssociation>,
}

impl RouteTableRecord {
    /// Whether this is the VPC's main route table.
    pub fn is_main(&self) -> bool {
        self.associations.iter().any(|a| a.is_main)
    }

    /// The explicit association covering `subnet_id`, if any.
    pub fn association_for_subnet(&self, subnet_id: &str) -> Option<&RouteTableAssociation> {
        self.associations
            .iter()
            .find(|a| a.subnet_id.as_deref() == Some(subnet_id))
    }

    /// The route whose destination is exactly `destination`, if any.
    pub fn route_to(&self, destination: &str) -> Option<&RouteRecord> {
        self.routes.iter().find(|r| r.destination == destination)
    }

    /// Whether any route in the table already points at `target`.
    pub fn has_route_target(&self, target: &RouteTarget) -> bool {
        self.routes
            .iter()
            .any(|r| r.target.as_ref() == Some(target))
    }
}

/// Route table lookup and lifecycle calls.
#[async_trait]
pub trait RouteTablePort: Send + Sync {
    /// A single table by id, or `None` when it does not exist.
    async fn get(&self, route_table_id: &str) -> Result<Option<RouteTableRecord>>;

    /// The VPC's main route table.
    async fn main_for_vpc(&self, vpc_id: &str) -> Result<Option<RouteTableRecord>>;

    /// All route tables of a VPC.
    async fn list_by_vpc(&self, vpc_id: &str) -> Result<Vec<RouteTableRecord>>;

    /// The table carrying the given display name tag inside a VPC.
    async fn find_by_name(&self, vpc_id: &str, name: &str) -> Result<Option<RouteTableRecord>>;

    /// Create a table, tagged at creation.
    async fn create(&self, vpc_id: &str, tags: &TagSet) -> Result<RouteTableRecord>;

    /// Write tags onto an existing table.
    async fn tag(&self, route_table_id: &str, tags: &TagSet) -> Result<()>;

    /// Add a route.
    async fn create_route(
        &self,
        route_table_id: &str,
        destination: &str,
        target: &RouteTarget,
    ) -> Result<()>;

    /// Replace the route for `destination` with a new target.
    async fn replace_route(
        &self,
        route_table_id: &str,
        destination: &str,
        target: &RouteTarget,
    ) -> Result<()>;

    /// Remove the route for `destination`. Already-removed is tolerated.
    async fn delete_route(&self, route_table_id: &str, destination: &str) -> Result<()>;

    /// Associate a subnet with the table. Returns the association id.
    async fn associate(&self, route_table_id: &str, subnet_id: &str) -> Result<String>;

    /// Move an existing association to another table. Returns the
    /// replacement association id.
    async fn replace_association(
        &self,
        association_id: &str,
        route_table_id: &str,
    ) -> Result<String>;

    /// Remove an explicit association, returning the subnet to the main
    /// table.
    async fn disassociate(&self, association_id: &str) -> Result<()>;

    /// Delete a table. Already-deleted is tolerated.
    async fn delete(&self, route_table_id: &str) -> Result<()>;
}

/// Outcome of [`ensure_route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteUpsert {
    /// No route for the destination existed, one was created.
    Created,
    /// A route existed but pointed elsewhere, it was replaced.
    Replaced,
    /// The desired route was already in place, nothing was written.
    Unchanged,
}

/// Converge the route for `destination` onto `target`.
///
/// Looks at the table first and only writes when the current state
/// disagrees, so repeated provisioning of the same topology makes no
/// provider writes. Writes are retried under `policy` to ride out the
/// visibility window of freshly created tables.
pub async fn ensure_route(
    tables: &dyn RouteTablePort,
    route_table_id: &str,
    destination: &str,
    target: &RouteTarget,
    policy: RetryPolicy,
) -> Result<RouteUpsert> {
    let table = tables.get(route_table_id).await?.ok_or_else(|| {
        OrchestratorError::not_found(format!("route table {} does not exist", route_table_id))
    })?;

    match table.route_to(destination) {
        Some(route) if route.target.as_ref() == Some(target) => {
            debug!(
                route_table_id = %route_table_id,
                destination = %destination,
                "route already converged"
            );
            Ok(RouteUpsert::Unchanged)
        }
        Some(_) => {
            retry(policy, "replace_route", || {
                tables.replace_route(route_table_id, destination, target)
            })
            .await?;
            info!(
                route_table_id = %route_table_id,
                destination = %destination,
                target = %target.id(),
                "replaced route"
            );
            Ok(RouteUpsert::Replaced)
        }
        None => {
            retry(policy, "create_route", || {
                tables.create_route(route_table_id, destination, target)
            })
            .await?;
            info!(
                route_table_id = %route_table_id,
                destination = %destination,
                target = %target.id(),
                "created route"
            );
            Ok(RouteUpsert::Created)
        }
    }
}

/// EC2-backed implementation of [`RouteTablePort`].
pub struct AwsRouteTableGateway {
    client: aws_sdk_ec2::Client,
}

impl AwsRouteTableGateway {
    /// Wrap an EC2 client.
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

fn route_target(route: &aws_sdk_ec2::types::Route) -> Option<RouteTarget> {
    if let Some(gateway_id) = route.gateway_id() {
        if gateway_id == "local" {
            return None;
        }
        return Some(RouteTarget::InternetGateway(gateway_id.to_string()));
    }
    if let Some(peering_id) = route.vpc_peering_connection_id() {
        return Some(RouteTarget::Peering(peering_id.to_string()));
    }
    if let Some(interface_id) = route.network_interface_id() {
        return Some(RouteTarget::Interface(interface_id.to_string()));
    }
    route
        .nat_gateway_id()
        .map(|id| RouteTarget::NatGateway(id.to_string()))
}

fn table_record(table: &aws_sdk_ec2::types::RouteTable) -> RouteTableRecord {
    let routes = table
        .routes()
        .iter()
        .map(|route| RouteRecord {
            destination: route.destination_cidr_block().unwrap_or_default().to_string(),
            target: route_target(route),
            blackhole: route.state() == Some(&RouteState::Blackhole),
        })
        .collect();
    let associations = table
        .associations()
        .iter()
        .map(|assoc| RouteTableAssociation {
            id: assoc
                .route_table_association_id()
                .unwrap_or_default()
                .to_string(),
            subnet_id: assoc.subnet_id().map(str::to_string),
            is_main: assoc.main().unwrap_or(false),
        })
        .collect();
    RouteTableRecord {
        id: table.route_table_id().unwrap_or_default().to_string(),
        vpc_id: table.vpc_id().unwrap_or_default().to_string(),
        name: tags::name_of(table.tags()),
        routes,
        associations,
    }
}

#[async_trait]
impl RouteTablePort for AwsRouteTableGateway {
    async fn get(&self, route_table_id: &str) -> Result<Option<RouteTableRecord>> {
        let response = self
            .client
            .describe_route_tables()
            .filters(tags::attribute_filter("route-table-id", route_table_id))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        Ok(response.route_tables().first().map(table_record))
    }

    async fn main_for_vpc(&self, vpc_id: &str) -> Result<Option<RouteTableRecord>> {
        let response = self
            .client
            .describe_route_tables()
            .filters(tags::attribute_filter("vpc-id", vpc_id))
            .filters(tags::attribute_filter("association.main", "true"))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        Ok(response.route_tables().first().map(table_record))
    }

    async fn list_by_vpc(&self, vpc_id: &str) -> Result<Vec<RouteTableRecord>> {
        let response = self
            .client
            .describe_route_tables()
            .filters(tags::attribute_filter("vpc-id", vpc_id))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        Ok(response.route_tables().iter().map(table_record).collect())
    }

    async fn find_by_name(&self, vpc_id: &str, name: &str) -> Result<Option<RouteTableRecord>> {
        let response = self
            .client
            .describe_route_tables()
            .filters(tags::attribute_filter("vpc-id", vpc_id))
            .filters(tags::name_filter(name))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        Ok(response.route_tables().first().map(table_record))
    }

    async fn create(&self, vpc_id: &str, tags: &TagSet) -> Result<RouteTableRecord> {
        let response = self
            .client
            .create_route_table()
            .vpc_id(vpc_id)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::RouteTable)
                    .set_tags(Some(tags.to_ec2_tags()))
                    .build(),
            )
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        let table = response.route_table().ok_or_else(|| {
            OrchestratorError::provider("create_route_table returned no table")
        })?;
        info!(route_table_id = ?table.route_table_id(), vpc_id = %vpc_id, "created route table");
        Ok(table_record(table))
    }

    async fn tag(&self, route_table_id: &str, tags: &TagSet) -> Result<()> {
        self.client
            .create_tags()
            .resources(route_table_id)
            .set_tags(Some(tags.to_ec2_tags()))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;
        Ok(())
    }

    async fn create_route(
        &self,
        route_table_id: &str,
        destination: &str,
        target: &RouteTarget,
    ) -> Result<()> {
        let mut request = self
            .client
            .create_route()
            .route_table_id(route_table_id)
            .destination_cidr_block(destination);
        request = match target {
            RouteTarget::InternetGateway(id) => request.gateway_id(id),
            RouteTarget::Peering(id) => request.vpc_peering_connection_id(id),
            RouteTarget::Interface(id) => request.network_interface_id(id),
            RouteTarget::NatGateway(id) => request.nat_gateway_id(id),
        };
        request.send().await.map_err(OrchestratorError::from_ec2)?;
        Ok(())
    }

    async fn replace_route(
        &self,
        route_table_id: &str,
        destination: &str,
        target: &RouteTarget,
    ) -> Result<()> {
        let mut request = self
            .client
            .replace_route()
            .route_table_id(route_table_id)
            .destination_cidr_block(destination);
        request = match target {
            RouteTarget::InternetGateway(id) => request.gateway_id(id),
            RouteTarget::Peering(id) => request.vpc_peering_connection_id(id),
            RouteTarget::Interface(id) => request.network_interface_id(id),
            RouteTarget::NatGateway(id) => request.nat_gateway_id(id),
        };
        request.send().await.map_err(OrchestratorError::from_ec2)?;
        Ok(())
    }

    async fn delete_route(&self, route_table_id: &str, destination: &str) -> Result<()> {
        match self
            .client
            .delete_route()
            .route_table_id(route_table_id)
            .destination_cidr_block(destination)
            .send()
            .await
        {
            Ok(_) => Ok(()),
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

    async fn associate(&self, route_table_id: &str, subnet_id: &str) -> Result<String> {
        let response = self
            .client
            .associate_route_table()
            .route_table_id(route_table_id)
            .subnet_id(subnet_id)
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        response
            .association_id()
            .map(str::to_string)
            .ok_or_else(|| {
                OrchestratorError::provider("associate_route_table returned no association id")
            })
    }

    async fn replace_association(
        &self,
        association_id: &str,
        route_table_id: &str,
    ) -> Result<String> {
        let response = self
            .client
            .replace_route_table_association()
            .association_id(association_id)
            .route_table_id(route_table_id)
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        response
            .new_association_id()
            .map(str::to_string)
            .ok_or_else(|| {
                OrchestratorError::provider(
                    "replace_route_table_association returned no association id",
                )
            })
    }

    async fn disassociate(&self, association_id: &str) -> Result<()> {
        match self
            .client
            .disassociate_route_table()
            .association_id(association_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
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

    async fn delete(&self, route_table_id: &str) -> Result<()> {
        match self
            .client
            .delete_route_table()
            .route_table_id(route_table_id)
            .send()
            .await
        {
            Ok(_) => {
                info!(route_table_id = %route_table_id, "deleted route table");
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

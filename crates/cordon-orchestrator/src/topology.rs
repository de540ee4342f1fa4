//! Reservation topology reconstruction.
//!
//! Nothing about a reservation is stored anywhere; the deterministic
//! tags written during provisioning are the only index. This module
//! rebuilds the conceptual shape of a reservation's network purely from
//! tag lookups, for status reporting.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::context::ReservationContext;
use crate::error::Result;
use crate::gateways::ResourceGateways;
use crate::network::find_reservation_vpc;
use crate::tags::role;

/// One subnet, with the route table that explicitly claims it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSummary {
    pub subnet_id: String,
    pub cidr: String,
    pub availability_zone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Explicit association; subnets without one ride the main table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_table_id: Option<String>,
}

/// The reservation's groups, classified by their role marker.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroupSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isolated: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub custom: Vec<String>,
}

/// The reservation's route tables by function.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTableSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub custom: Vec<String>,
}

/// Everything known about a reservation's network at one sampling
/// instant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkTopology {
    pub reservation_id: String,
    pub vpc_id: String,
    pub cidr: String,
    pub subnets: Vec<SubnetSummary>,
    pub security_groups: SecurityGroupSummary,
    pub route_tables: RouteTableSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peering_connection_id: Option<String>,
    pub sampled_at: DateTime<Utc>,
}

/// Rebuild the reservation's topology from tag lookups, or `None` when
/// no VPC carries its name.
pub async fn reconstruct(
    gateways: &ResourceGateways,
    ctx: &ReservationContext,
) -> Result<Option<NetworkTopology>> {
    let Some(vpc) = find_reservation_vpc(gateways, ctx).await? else {
        return Ok(None);
    };

    let subnets = gateways.subnets.list_by_vpc(&vpc.id).await?;
    let tables = gateways.route_tables.list_by_vpc(&vpc.id).await?;
    let groups = gateways.security_groups.list_by_vpc(&vpc.id).await?;
    let peering_connection_id = gateways
        .peerings
        .find_by_reservation(&ctx.reservation_id)
        .await?
        .into_iter()
        .find(|p| p.state.is_live())
        .map(|p| p.id);

    let subnet_summaries = subnets
        .iter()
        .map(|subnet| SubnetSummary {
            subnet_id: subnet.id.clone(),
            cidr: subnet.cidr.clone(),
            availability_zone: subnet.availability_zone.clone(),
            name: subnet.name.clone(),
            route_table_id: tables
                .iter()
                .find(|t| t.association_for_subnet(&subnet.id).is_some())
                .map(|t| t.id.clone()),
        })
        .collect();

    let mut security_groups = SecurityGroupSummary::default();
    for group in &groups {
        match group.role.as_deref() {
            Some(role::DEFAULT) => security_groups.default = Some(group.id.clone()),
            Some(role::ISOLATED) => security_groups.isolated = Some(group.id.clone()),
            _ if group.is_builtin() => {}
            _ => security_groups.custom.push(group.id.clone()),
        }
    }

    let private_name = ctx.private_route_table_name();
    let mut route_tables = RouteTableSummary::default();
    for table in &tables {
        if table.is_main() {
            route_tables.main = Some(table.id.clone());
        } else if table.name.as_deref() == Some(private_name.as_str()) {
            route_tables.private = Some(table.id.clone());
        } else {
            route_tables.custom.push(table.id.clone());
        }
    }

    Ok(Some(NetworkTopology {
        reservation_id: ctx.reservation_id.clone(),
        vpc_id: vpc.id,
        cidr: vpc.cidr,
        subnets: subnet_summaries,
        security_groups,
        route_tables,
        peering_connection_id,
        sampled_at: Utc::now(),
    }))
}

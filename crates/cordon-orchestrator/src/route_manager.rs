//! Custom route table construction.
//!
//! Requesters describe a table as an alias, a set of member subnet CIDRs
//! and a set of routes whose next hops are addressed by private IP. The
//! manager resolves each next hop to a provider id, moves the subnets
//! onto the new table while recording their prior associations, and rolls
//! everything back if any later step fails, so a half-built table never
//! survives.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::compensate::{Compensation, CompensationStack};
use crate::config::Settings;
use crate::context::ReservationContext;
use crate::error::{OrchestratorError, Result};
use crate::gateways::ResourceGateways;
use crate::network::find_reservation_vpc;
use crate::peering::{PeeringRecord, PeeringState};
use crate::route_table::{RouteTableRecord, RouteTarget, ensure_route};
use crate::subnet::SubnetRecord;
use crate::tags::{TagSet, role};
use crate::vpc::VpcRecord;

/// How a requested route addresses its next hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextHopType {
    /// A network interface, addressed by private IP.
    Interface,
    /// The VPC's internet gateway.
    InternetGateway,
    /// A NAT gateway in one of the table's subnets, addressed by
    /// private IP.
    NatGateway,
}

/// One requested route, resolved into a concrete route at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Next hop discriminator.
    pub next_hop_type: NextHopType,
    /// Private IP of the next hop. Unused for internet gateway routes.
    #[serde(default)]
    pub next_hop_address: Option<String>,
    /// Destination CIDR the route covers.
    pub address_prefix: String,
}

impl RouteSpec {
    fn address(&self) -> Result<&str> {
        self.next_hop_address.as_deref().ok_or_else(|| {
            OrchestratorError::validation(format!(
                "a next hop address is required for {:?} routes",
                self.next_hop_type
            ))
        })
    }
}

/// One requested custom route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTableRequest {
    /// Caller-chosen id echoed back in the outcome.
    pub action_id: String,
    /// Human-readable alias, seed for the table's deterministic name.
    pub alias: String,
    /// CIDRs of subnets to move onto the table.
    pub subnet_cidrs: Vec<String>,
    /// Routes to populate.
    pub routes: Vec<RouteSpec>,
}

/// Per-request outcome of a build call.
#[derive(Debug)]
pub struct RouteTableOutcome {
    /// Echo of the request's action id.
    pub action_id: String,
    /// Echo of the request's alias.
    pub alias: String,
    /// Table id on success, the captured error otherwise.
    pub result: Result<String>,
}

/// Find-or-create the reservation's private route table.
///
/// Created on demand the first time a non-public subnet shows up. A
/// freshly created table immediately receives the route to the peered
/// management network when an active peering exists, so private subnets
/// are reachable from the management side from the start.
pub async fn ensure_private_route_table(
    gateways: &ResourceGateways,
    settings: &Settings,
    ctx: &ReservationContext,
    vpc_id: &str,
) -> Result<RouteTableRecord> {
    let name = ctx.private_route_table_name();
    if let Some(existing) = gateways.route_tables.find_by_name(vpc_id, &name).await? {
        return Ok(existing);
    }

    let tags = TagSet::for_resource(ctx, &name).with_role(role::PRIVATE);
    let table = gateways.route_tables.create(vpc_id, &tags).await?;
    info!(
        reservation_id = %ctx.reservation_id,
        route_table_id = %table.id,
        "created private route table"
    );
    attach_peering_route(gateways, settings, ctx, &table.id).await?;
    Ok(table)
}

/// The reservation's active peering connection, if it has one.
async fn active_reservation_peering(
    gateways: &ResourceGateways,
    ctx: &ReservationContext,
) -> Result<Option<PeeringRecord>> {
    let connections = gateways
        .peerings
        .find_by_reservation(&ctx.reservation_id)
        .await?;
    Ok(connections
        .into_iter()
        .find(|p| p.state == PeeringState::Active))
}

/// Route the management CIDR through the reservation's peering, when
/// both the peering and the management VPC are known.
async fn attach_peering_route(
    gateways: &ResourceGateways,
    settings: &Settings,
    ctx: &ReservationContext,
    route_table_id: &str,
) -> Result<()> {
    let Some(peering) = active_reservation_peering(gateways, ctx).await? else {
        return Ok(());
    };
    let Some(management_vpc_id) = settings.management_vpc_id.as_deref() else {
        return Ok(());
    };
    let Some(management_vpc) = gateways.vpcs.get(management_vpc_id).await? else {
        return Ok(());
    };

    ensure_route(
        &*gateways.route_tables,
        route_table_id,
        &management_vpc.cidr,
        &RouteTarget::Peering(peering.id),
        settings.consistency_retry(),
    )
    .await?;
    Ok(())
}

/// Builds requester-defined route tables, one at a time, isolating each
/// request's failure from the others.
pub struct RouteTableManager {
    gateways: ResourceGateways,
    settings: Settings,
}

impl RouteTableManager {
    /// Wire a manager over resource gateways.
    pub fn new(gateways: ResourceGateways, settings: Settings) -> Self {
        Self { gateways, settings }
    }

    /// Build every requested table, reporting one outcome per request.
    ///
    /// Fails as a whole only when the reservation has no VPC or the
    /// lookup itself errors. Cancellation observed between requests marks
    /// the remaining requests as failed without touching the provider.
    pub async fn execute(
        &self,
        ctx: &ReservationContext,
        requests: &[RouteTableRequest],
        token: &CancellationToken,
    ) -> Result<Vec<RouteTableOutcome>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let vpc = find_reservation_vpc(&self.gateways, ctx)
            .await?
            .ok_or_else(|| {
                OrchestratorError::not_found(format!(
                    "no VPC exists for reservation {}",
                    ctx.reservation_id
                ))
            })?;

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let result = match token.checkpoint() {
                Ok(()) => self.build_table(ctx, &vpc, request).await,
                Err(cancelled) => Err(cancelled),
            };
            if let Err(err) = &result {
                warn!(
                    alias = %request.alias,
                    error = %err,
                    "route table construction failed"
                );
            }
            outcomes.push(RouteTableOutcome {
                action_id: request.action_id.clone(),
                alias: request.alias.clone(),
                result,
            });
        }
        Ok(outcomes)
    }

    /// Build every requested table, returning their ids or an aggregate
    /// error carrying each failed request's fault.
    pub async fn create_route_tables(
        &self,
        ctx: &ReservationContext,
        requests: &[RouteTableRequest],
        token: &CancellationToken,
    ) -> Result<Vec<String>> {
        let outcomes = self.execute(ctx, requests, token).await?;
        let mut ids = Vec::new();
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(id) => ids.push(id),
                Err(err) => errors.push(err),
            }
        }
        if errors.is_empty() {
            Ok(ids)
        } else {
            Err(OrchestratorError::Aggregate(errors))
        }
    }

    async fn build_table(
        &self,
        ctx: &ReservationContext,
        vpc: &VpcRecord,
        request: &RouteTableRequest,
    ) -> Result<String> {
        let name = ctx.custom_route_table_name(&request.alias);
        let (table, created) = match self
            .gateways
            .route_tables
            .find_by_name(&vpc.id, &name)
            .await?
        {
            Some(existing) => {
                debug!(route_table_id = %existing.id, alias = %request.alias, "adopting route table");
                (existing, false)
            }
            None => {
                let tags = TagSet::for_resource(ctx, &name).with_role(role::CUSTOM);
                let table = self.gateways.route_tables.create(&vpc.id, &tags).await?;
                (table, true)
            }
        };

        let mut stack = CompensationStack::new();
        match self.populate_table(ctx, vpc, &table, request, &mut stack).await {
            Ok(()) => {
                info!(
                    route_table_id = %table.id,
                    alias = %request.alias,
                    "route table ready"
                );
                Ok(table.id)
            }
            Err(err) => {
                error!(
                    route_table_id = %table.id,
                    alias = %request.alias,
                    error = %err,
                    "rolling back route table construction"
                );
                let failed_undos = stack.unwind(&*self.gateways.route_tables).await;
                if failed_undos > 0 {
                    error!(
                        route_table_id = %table.id,
                        failed_undos,
                        "rollback left associations behind"
                    );
                }
                if created {
                    if let Err(delete_err) =
                        self.gateways.route_tables.delete(&table.id).await
                    {
                        error!(
                            route_table_id = %table.id,
                            error = %delete_err,
                            "could not delete partially built route table"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn populate_table(
        &self,
        ctx: &ReservationContext,
        vpc: &VpcRecord,
        table: &RouteTableRecord,
        request: &RouteTableRequest,
        stack: &mut CompensationStack,
    ) -> Result<()> {
        let mut member_subnets = Vec::with_capacity(request.subnet_cidrs.len());
        for cidr in &request.subnet_cidrs {
            let subnet = self
                .gateways
                .subnets
                .find_by_cidr(&vpc.id, cidr)
                .await?
                .ok_or_else(|| {
                    OrchestratorError::not_found(format!(
                        "no subnet with CIDR {} in VPC {}",
                        cidr, vpc.id
                    ))
                })?;
            self.assign_subnet(table, &subnet, stack).await?;
            member_subnets.push(subnet);
        }

        for spec in &request.routes {
            let target = self.resolve_next_hop(&vpc.id, &member_subnets, spec).await?;
            ensure_route(
                &*self.gateways.route_tables,
                &table.id,
                &spec.address_prefix,
                &target,
                self.settings.consistency_retry(),
            )
            .await?;
        }

        attach_peering_route(&self.gateways, &self.settings, ctx, &table.id).await
    }

    async fn assign_subnet(
        &self,
        table: &RouteTableRecord,
        subnet: &SubnetRecord,
        stack: &mut CompensationStack,
    ) -> Result<()> {
        let tables = self.gateways.route_tables.list_by_vpc(&subnet.vpc_id).await?;
        let current = tables
            .iter()
            .find_map(|t| t.association_for_subnet(&subnet.id).map(|a| (t, a)));

        match current {
            Some((owner, _)) if owner.id == table.id => {
                debug!(
                    subnet_id = %subnet.id,
                    route_table_id = %table.id,
                    "subnet already on the requested table"
                );
                Ok(())
            }
            Some((owner, association)) => {
                let moved = self
                    .gateways
                    .route_tables
                    .replace_association(&association.id, &table.id)
                    .await?;
                stack.push(Compensation::RestoreAssociation {
                    association_id: moved,
                    route_table_id: owner.id.clone(),
                });
                Ok(())
            }
            None => {
                let association = self
                    .gateways
                    .route_tables
                    .associate(&table.id, &subnet.id)
                    .await?;
                stack.push(Compensation::Disassociate {
                    association_id: association,
                });
                Ok(())
            }
        }
    }

    async fn resolve_next_hop(
        &self,
        vpc_id: &str,
        member_subnets: &[SubnetRecord],
        spec: &RouteSpec,
    ) -> Result<RouteTarget> {
        match spec.next_hop_type {
            NextHopType::InternetGateway => {
                let attached = self.gateways.internet_gateways.find_attached(vpc_id).await?;
                attached
                    .into_iter()
                    .next()
                    .map(RouteTarget::InternetGateway)
                    .ok_or_else(|| {
                        OrchestratorError::not_found(format!(
                            "VPC {} has no internet gateway",
                            vpc_id
                        ))
                    })
            }
            NextHopType::Interface => {
                let address = spec.address()?;
                self.gateways
                    .interfaces
                    .find_by_private_ip(vpc_id, address)
                    .await?
                    .map(RouteTarget::Interface)
                    .ok_or_else(|| {
                        OrchestratorError::not_found(format!(
                            "no network interface with private IP {} in VPC {}",
                            address, vpc_id
                        ))
                    })
            }
            NextHopType::NatGateway => {
                let address = spec.address()?;
                for subnet in member_subnets {
                    if let Some(nat_id) = self
                        .gateways
                        .nat_gateways
                        .find_by_private_ip(&subnet.id, address)
                        .await?
                    {
                        return Ok(RouteTarget::NatGateway(nat_id));
                    }
                }
                Err(OrchestratorError::not_found(format!(
                    "no NAT gateway with private IP {} in the table's subnets",
                    address
                )))
            }
        }
    }
}

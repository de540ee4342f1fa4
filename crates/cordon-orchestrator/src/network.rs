//! Sandbox network provisioning.
//!
//! [`NetworkProvisioner`] drives the sequential stages that turn a bare
//! reservation into a usable sandbox network:
//!
//! ```text
//! resolve CIDR
//!       |
//! find-or-create VPC (wait until available)
//!       |
//! enable DNS hostnames          (consistency retry)
//!       |
//! find-or-create + attach IGW   (consistency retry)
//!       |
//! default route + main table tag
//!       |
//! peering to management network (skipped in static mode)
//!       |
//! isolated + default security groups
//! ```
//!
//! Cancellation is checked before each stage. A stage failure aborts the
//! whole call and leaves completed stages in place; a repeated call
//! converges on the same resources through tag rediscovery, and cleanup
//! is the only path that removes them.

use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::context::ReservationContext;
use crate::error::{OrchestratorError, Result};
use crate::gateways::ResourceGateways;
use crate::peering::{self, PeeringRecord};
use crate::retry::retry;
use crate::route_table::{RouteTarget, ensure_route};
use crate::security_group::IngressRule;
use crate::tags::{TagSet, role};
use crate::vpc::{self, VpcRecord};

/// What a successful provisioning run hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedNetwork {
    /// The sandbox VPC.
    pub vpc_id: String,
    /// The reservation's security groups, default group first.
    pub security_group_ids: Vec<String>,
}

/// Find the reservation's VPC by its deterministic name tag.
///
/// Returns `None` when no VPC carries the tag and a conflict error when
/// more than one does, since the tag is the only uniqueness mechanism
/// the orchestrator has.
pub async fn find_reservation_vpc(
    gateways: &ResourceGateways,
    ctx: &ReservationContext,
) -> Result<Option<VpcRecord>> {
    let name = ctx.vpc_name();
    let mut matches = gateways.vpcs.find_by_name(&name).await?;
    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(matches.remove(0))),
        n => Err(OrchestratorError::conflict(format!(
            "{} VPCs carry the name {:?}; reservation {} must own exactly one",
            n, name, ctx.reservation_id
        ))),
    }
}

/// Orchestrates VPC, gateway, peering and security group provisioning
/// for one reservation.
pub struct NetworkProvisioner {
    gateways: ResourceGateways,
    settings: Settings,
}

impl NetworkProvisioner {
    /// Wire a provisioner over resource gateways.
    pub fn new(gateways: ResourceGateways, settings: Settings) -> Self {
        Self { gateways, settings }
    }

    /// Provision (or rediscover) the sandbox network.
    ///
    /// `single_subnet_request` reflects whether the surrounding call asks
    /// for exactly one subnet; static-mode deployments derive the VPC
    /// CIDR from configuration in that case.
    pub async fn prepare_network(
        &self,
        ctx: &ReservationContext,
        requested_cidr: Option<&str>,
        single_subnet_request: bool,
        token: &CancellationToken,
    ) -> Result<PreparedNetwork> {
        info!(reservation_id = %ctx.reservation_id, "preparing sandbox network");

        token.checkpoint()?;
        let cidr = self.resolve_cidr(requested_cidr, single_subnet_request)?;

        token.checkpoint()?;
        let vpc = self.find_or_create_vpc(ctx, &cidr).await?;

        token.checkpoint()?;
        retry(self.settings.consistency_retry(), "enable_dns_hostnames", || {
            self.gateways.vpcs.enable_dns_hostnames(&vpc.id)
        })
        .await?;

        token.checkpoint()?;
        let gateway_id = self.ensure_internet_gateway(ctx, &vpc.id).await?;

        token.checkpoint()?;
        self.ensure_default_route(ctx, &vpc.id, &gateway_id).await?;

        token.checkpoint()?;
        if self.settings.static_vpc_mode {
            debug!(reservation_id = %ctx.reservation_id, "static mode, skipping peering");
        } else {
            self.ensure_management_peering(ctx, &vpc).await?;
        }

        token.checkpoint()?;
        let security_group_ids = self.ensure_security_groups(ctx, &vpc.id).await?;

        info!(
            reservation_id = %ctx.reservation_id,
            vpc_id = %vpc.id,
            "sandbox network ready"
        );
        Ok(PreparedNetwork {
            vpc_id: vpc.id,
            security_group_ids,
        })
    }

    fn resolve_cidr(
        &self,
        requested_cidr: Option<&str>,
        single_subnet_request: bool,
    ) -> Result<String> {
        if self.settings.static_vpc_mode && single_subnet_request {
            return self
                .settings
                .static_vpc_cidr
                .clone()
                .ok_or_else(|| {
                    OrchestratorError::validation(
                        "static_vpc_cidr is not configured but static VPC mode is on",
                    )
                });
        }
        requested_cidr
            .map(str::to_string)
            .ok_or_else(|| OrchestratorError::validation("a VPC CIDR is required"))
    }

    async fn find_or_create_vpc(
        &self,
        ctx: &ReservationContext,
        cidr: &str,
    ) -> Result<VpcRecord> {
        if let Some(existing) = find_reservation_vpc(&self.gateways, ctx).await? {
            info!(
                reservation_id = %ctx.reservation_id,
                vpc_id = %existing.id,
                "adopting existing VPC"
            );
            return Ok(existing);
        }

        let name = ctx.vpc_name();
        let tags = TagSet::for_resource(ctx, &name);
        let vpc = self.gateways.vpcs.create(cidr, &tags).await?;
        vpc::wait_available(
            &*self.gateways.vpcs,
            &vpc.id,
            self.settings.poll_interval(),
            self.settings.wait_timeout(),
        )
        .await?;
        Ok(vpc)
    }

    async fn ensure_internet_gateway(
        &self,
        ctx: &ReservationContext,
        vpc_id: &str,
    ) -> Result<String> {
        let tags = TagSet::for_resource(ctx, &ctx.internet_gateway_name())
            .with_role(role::INTERNET_GATEWAY);

        let attached = self.gateways.internet_gateways.find_attached(vpc_id).await?;
        if let Some(gateway_id) = attached.into_iter().next() {
            debug!(gateway_id = %gateway_id, "adopting attached internet gateway");
            retry(self.settings.idempotent_retry(), "tag_internet_gateway", || {
                self.gateways.internet_gateways.tag(&gateway_id, &tags)
            })
            .await?;
            return Ok(gateway_id);
        }

        let gateway_id = retry(
            self.settings.consistency_retry(),
            "create_internet_gateway",
            || self.gateways.internet_gateways.create(&tags),
        )
        .await?;
        retry(
            self.settings.consistency_retry(),
            "attach_internet_gateway",
            || self.gateways.internet_gateways.attach(&gateway_id, vpc_id),
        )
        .await?;
        Ok(gateway_id)
    }

    async fn ensure_default_route(
        &self,
        ctx: &ReservationContext,
        vpc_id: &str,
        gateway_id: &str,
    ) -> Result<()> {
        let main = self
            .gateways
            .route_tables
            .main_for_vpc(vpc_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::not_found(format!("VPC {} has no main route table", vpc_id))
            })?;

        let target = RouteTarget::InternetGateway(gateway_id.to_string());
        if main.has_route_target(&target) {
            debug!(route_table_id = %main.id, "default route already present");
        } else {
            ensure_route(
                &*self.gateways.route_tables,
                &main.id,
                "0.0.0.0/0",
                &target,
                self.settings.consistency_retry(),
            )
            .await?;
        }

        let tags = TagSet::for_resource(ctx, &ctx.main_route_table_name());
        retry(self.settings.idempotent_retry(), "tag_route_table", || {
            self.gateways.route_tables.tag(&main.id, &tags)
        })
        .await
    }

    async fn ensure_management_peering(
        &self,
        ctx: &ReservationContext,
        vpc: &VpcRecord,
    ) -> Result<()> {
        let management_vpc_id = self.settings.management_vpc()?;
        let management_vpc = self
            .gateways
            .vpcs
            .get(management_vpc_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::not_found(format!(
                    "management VPC {} does not exist",
                    management_vpc_id
                ))
            })?;

        let connection = self.find_or_create_peering(ctx, &vpc.id, management_vpc_id).await?;
        peering::wait_active(
            &*self.gateways.peerings,
            &connection.id,
            self.settings.poll_interval(),
            self.settings.wait_timeout(),
        )
        .await?;

        let target = RouteTarget::Peering(connection.id.clone());
        let policy = self.settings.consistency_retry();

        // Sandbox side: main table, plus the private table when one has
        // already been created for non-public subnets.
        let main = self
            .gateways
            .route_tables
            .main_for_vpc(&vpc.id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::not_found(format!("VPC {} has no main route table", vpc.id))
            })?;
        ensure_route(
            &*self.gateways.route_tables,
            &main.id,
            &management_vpc.cidr,
            &target,
            policy,
        )
        .await?;
        if let Some(private) = self
            .gateways
            .route_tables
            .find_by_name(&vpc.id, &ctx.private_route_table_name())
            .await?
        {
            ensure_route(
                &*self.gateways.route_tables,
                &private.id,
                &management_vpc.cidr,
                &target,
                policy,
            )
            .await?;
        }

        // Management side: every table routes the sandbox CIDR back
        // through the peering.
        for table in self
            .gateways
            .route_tables
            .list_by_vpc(management_vpc_id)
            .await?
        {
            ensure_route(
                &*self.gateways.route_tables,
                &table.id,
                &vpc.cidr,
                &target,
                policy,
            )
            .await?;
        }

        Ok(())
    }

    async fn find_or_create_peering(
        &self,
        ctx: &ReservationContext,
        vpc_id: &str,
        management_vpc_id: &str,
    ) -> Result<PeeringRecord> {
        let existing = self
            .gateways
            .peerings
            .find_by_reservation(&ctx.reservation_id)
            .await?
            .into_iter()
            .find(|p| !p.state.is_terminal_failure());
        if let Some(connection) = existing {
            debug!(peering_id = %connection.id, state = %connection.state, "adopting peering connection");
            return Ok(connection);
        }

        let tags = TagSet::for_resource(ctx, &ctx.peering_name()).with_role(role::PEERING);
        self.gateways
            .peerings
            .create(vpc_id, management_vpc_id, &tags)
            .await
    }

    async fn ensure_security_groups(
        &self,
        ctx: &ReservationContext,
        vpc_id: &str,
    ) -> Result<Vec<String>> {
        let management_rule = if self.settings.management_access_required {
            match &self.settings.management_security_group_id {
                Some(group_id) => Some(IngressRule::all_from_group(group_id)),
                None => {
                    warn!("management access required but no management security group configured");
                    None
                }
            }
        } else {
            None
        };

        let isolated_id = self
            .find_or_create_group(
                ctx,
                vpc_id,
                role::ISOLATED,
                &ctx.isolated_security_group_name(),
                "Restricted group for isolated sandbox instances",
            )
            .await?;
        let isolated_rules: Vec<IngressRule> =
            management_rule.clone().into_iter().collect();
        self.gateways
            .security_groups
            .authorize_ingress(&isolated_id, &isolated_rules)
            .await?;

        let default_id = self
            .find_or_create_group(
                ctx,
                vpc_id,
                role::DEFAULT,
                &ctx.default_security_group_name(),
                "Shared group for sandbox instances",
            )
            .await?;
        let mut default_rules = vec![
            IngressRule::all_from_group(&default_id),
            IngressRule::all_from_group(&isolated_id),
        ];
        default_rules.extend(management_rule);
        self.gateways
            .security_groups
            .authorize_ingress(&default_id, &default_rules)
            .await?;

        Ok(vec![default_id, isolated_id])
    }

    async fn find_or_create_group(
        &self,
        ctx: &ReservationContext,
        vpc_id: &str,
        role_marker: &str,
        name: &str,
        description: &str,
    ) -> Result<String> {
        if let Some(existing) = self
            .gateways
            .security_groups
            .find_by_role(&ctx.reservation_id, role_marker)
            .await?
        {
            debug!(group_id = %existing.id, role = %role_marker, "adopting security group");
            return Ok(existing.id);
        }

        let tags = TagSet::for_resource(ctx, name).with_role(role_marker);
        self.gateways
            .security_groups
            .create(vpc_id, name, description, &tags)
            .await
    }
}

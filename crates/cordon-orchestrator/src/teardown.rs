//! Reservation teardown.
//!
//! Removal runs as a strict sequence and stops at the first failure;
//! partially cleaned reservations are retried by running `cleanup`
//! again, never by compensating forward. Ordering follows the provider's
//! dependency rules: instances release their interfaces before subnets
//! go, groups are deleted referencers-first, and the VPC falls last.
//!
//! ```text
//! key pair -> find VPC -> instances -> internet gateways
//!   -> security groups -> subnets -> peerings -> stale peer routes
//!   -> route tables -> mirror sessions -> VPC
//! ```

use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::context::ReservationContext;
use crate::error::{OrchestratorError, Result};
use crate::gateways::ResourceGateways;
use crate::instances::wait_all_terminated;
use crate::network::find_reservation_vpc;
use crate::retry::retry;
use crate::route_table::RouteTarget;
use crate::security_group::deletion_order;
use crate::vpc::VpcRecord;

/// Removes everything provisioning may have created for one reservation.
pub struct TeardownOrchestrator {
    gateways: ResourceGateways,
    settings: Settings,
}

impl TeardownOrchestrator {
    /// Wire an orchestrator over resource gateways.
    pub fn new(gateways: ResourceGateways, settings: Settings) -> Self {
        Self { gateways, settings }
    }

    /// Remove the reservation's network and its stored key pair.
    ///
    /// The key pair goes first: its removal has no VPC dependency and
    /// should succeed even when network discovery fails afterwards. A
    /// reservation with no VPC is an error, since there is nothing else
    /// to clean and the caller should know the id never provisioned.
    pub async fn cleanup(&self, ctx: &ReservationContext, token: &CancellationToken) -> Result<()> {
        info!(reservation_id = %ctx.reservation_id, "tearing down reservation network");

        token.checkpoint()?;
        self.remove_key_pair(ctx).await?;

        token.checkpoint()?;
        let vpc = find_reservation_vpc(&self.gateways, ctx)
            .await?
            .ok_or_else(|| {
                OrchestratorError::not_found(format!(
                    "No VPC was created for this reservation: {}",
                    ctx.reservation_id
                ))
            })?;

        token.checkpoint()?;
        self.terminate_instances(&vpc).await?;

        token.checkpoint()?;
        self.remove_internet_gateways(&vpc).await?;

        token.checkpoint()?;
        self.remove_security_groups(&vpc).await?;

        token.checkpoint()?;
        self.remove_subnets(&vpc).await?;

        token.checkpoint()?;
        let peering_ids = self.remove_peerings(ctx).await?;

        token.checkpoint()?;
        self.purge_stale_peer_routes(&peering_ids).await?;

        token.checkpoint()?;
        self.remove_route_tables(&vpc).await?;

        token.checkpoint()?;
        self.gateways
            .mirrors
            .delete_for_reservation(&ctx.reservation_id)
            .await?;

        token.checkpoint()?;
        self.remove_vpc(&vpc).await?;

        info!(reservation_id = %ctx.reservation_id, vpc_id = %vpc.id, "reservation network removed");
        Ok(())
    }

    async fn remove_key_pair(&self, ctx: &ReservationContext) -> Result<()> {
        self.gateways
            .key_pairs
            .remove(&ctx.key_pair_name(), &ctx.key_pair_object_key())
            .await
    }

    async fn terminate_instances(&self, vpc: &VpcRecord) -> Result<()> {
        let instances = self.gateways.instances.list_by_vpc(&vpc.id).await?;
        let active: Vec<String> = instances
            .iter()
            .filter(|i| !i.is_terminated())
            .map(|i| i.id.clone())
            .collect();
        if active.is_empty() {
            debug!(vpc_id = %vpc.id, "no instances to terminate");
            return Ok(());
        }

        for instance_id in &active {
            self.gateways.instances.release_addresses(instance_id).await?;
        }
        self.gateways.instances.terminate(&active).await?;
        wait_all_terminated(
            &*self.gateways.instances,
            &vpc.id,
            self.settings.poll_interval(),
            self.settings.wait_timeout(),
        )
        .await
    }

    async fn remove_internet_gateways(&self, vpc: &VpcRecord) -> Result<()> {
        let policy = self.settings.idempotent_retry();
        for gateway_id in self.gateways.internet_gateways.find_attached(&vpc.id).await? {
            retry(policy, "detach_internet_gateway", || {
                self.gateways.internet_gateways.detach(&gateway_id, &vpc.id)
            })
            .await?;
            retry(policy, "delete_internet_gateway", || {
                self.gateways.internet_gateways.delete(&gateway_id)
            })
            .await?;
            info!(vpc_id = %vpc.id, internet_gateway_id = %gateway_id, "removed internet gateway");
        }
        Ok(())
    }

    /// Delete the VPC's groups, referencing groups before their targets
    /// so no delete trips over a live reference. Groups caught in a
    /// reference cycle are stripped of their ingress rules first, which
    /// breaks the cycle and makes them deletable in any order.
    async fn remove_security_groups(&self, vpc: &VpcRecord) -> Result<()> {
        let groups = self.gateways.security_groups.list_by_vpc(&vpc.id).await?;
        let deletable: Vec<_> = groups.into_iter().filter(|g| !g.is_builtin()).collect();
        if deletable.is_empty() {
            return Ok(());
        }

        let plan = deletion_order(&deletable);
        let policy = self.settings.idempotent_retry();
        for group_id in &plan.ordered {
            retry(policy, "delete_security_group", || {
                self.gateways.security_groups.delete(group_id)
            })
            .await?;
        }

        if !plan.cyclic.is_empty() {
            warn!(
                vpc_id = %vpc.id,
                groups = plan.cyclic.len(),
                "breaking security group reference cycle"
            );
            for group_id in &plan.cyclic {
                self.gateways.security_groups.revoke_all_ingress(group_id).await?;
            }
            for group_id in &plan.cyclic {
                retry(policy, "delete_security_group", || {
                    self.gateways.security_groups.delete(group_id)
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn remove_subnets(&self, vpc: &VpcRecord) -> Result<()> {
        let policy = self.settings.idempotent_retry();
        for subnet in self.gateways.subnets.list_by_vpc(&vpc.id).await? {
            retry(policy, "delete_subnet", || {
                self.gateways.subnets.delete(&subnet.id)
            })
            .await?;
        }
        Ok(())
    }

    /// Delete the reservation's peering connections, returning every id
    /// seen so stale routes through them can be purged afterwards.
    /// Connections already in a terminal failure state are left for the
    /// provider to expire.
    async fn remove_peerings(&self, ctx: &ReservationContext) -> Result<Vec<String>> {
        let peerings = self
            .gateways
            .peerings
            .find_by_reservation(&ctx.reservation_id)
            .await?;
        let ids: Vec<String> = peerings.iter().map(|p| p.id.clone()).collect();

        let policy = self.settings.idempotent_retry();
        for peering in &peerings {
            if peering.state.is_live() {
                retry(policy, "delete_peering", || {
                    self.gateways.peerings.delete(&peering.id)
                })
                .await?;
                info!(peering_id = %peering.id, "deleted peering connection");
            } else {
                debug!(
                    peering_id = %peering.id,
                    state = %peering.state,
                    "skipping peering already out of service"
                );
            }
        }
        Ok(ids)
    }

    /// Drop blackholed routes in the management network that still point
    /// at this reservation's peerings. They stop routing the moment the
    /// peering dies but keep their destination reserved until removed.
    async fn purge_stale_peer_routes(&self, peering_ids: &[String]) -> Result<()> {
        let Some(management_vpc_id) = self.settings.management_vpc_id.as_deref() else {
            debug!("no management VPC configured, skipping stale route purge");
            return Ok(());
        };
        if peering_ids.is_empty() {
            return Ok(());
        }

        for table in self.gateways.route_tables.list_by_vpc(management_vpc_id).await? {
            for route in &table.routes {
                let stale = route.blackhole
                    && route.target.as_ref().is_some_and(|target| {
                        matches!(target, RouteTarget::Peering(id) if peering_ids.contains(id))
                    });
                if stale {
                    self.gateways
                        .route_tables
                        .delete_route(&table.id, &route.destination)
                        .await?;
                    info!(
                        route_table_id = %table.id,
                        destination = %route.destination,
                        "purged stale peering route"
                    );
                }
            }
        }
        Ok(())
    }

    async fn remove_route_tables(&self, vpc: &VpcRecord) -> Result<()> {
        let policy = self.settings.idempotent_retry();
        for table in self.gateways.route_tables.list_by_vpc(&vpc.id).await? {
            if table.is_main() {
                continue;
            }
            retry(policy, "delete_route_table", || {
                self.gateways.route_tables.delete(&table.id)
            })
            .await?;
        }
        Ok(())
    }

    async fn remove_vpc(&self, vpc: &VpcRecord) -> Result<()> {
        let policy = self.settings.idempotent_retry();
        retry(policy, "delete_vpc", || self.gateways.vpcs.delete(&vpc.id)).await?;
        info!(vpc_id = %vpc.id, "deleted VPC");
        Ok(())
    }
}

//! Batched subnet provisioning.
//!
//! A batch runs stage by stage: every item finishes discovery before any
//! item is created, every creation lands before any item waits, and so
//! on. Each item carries its own error slot, so one bad request never
//! blocks its neighbours, and a cancelled batch stops issuing provider
//! calls at the next stage boundary.
//!
//! ```text
//! discover -> create -> wait -> tag -> attach
//! ```

use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::context::ReservationContext;
use crate::error::{OrchestratorError, Result};
use crate::gateways::ResourceGateways;
use crate::network::find_reservation_vpc;
use crate::route_manager::ensure_private_route_table;
use crate::subnet::{SubnetRecord, wait_available};
use crate::tags::{TagSet, role};
use crate::vpc::VpcRecord;

/// One requested subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetRequest {
    /// Caller-chosen id echoed back in the outcome.
    pub action_id: String,
    /// IPv4 CIDR the subnet must cover.
    pub cidr: String,
    /// Human-readable alias, seed for the subnet's deterministic name.
    pub alias: String,
    /// Public subnets keep the VPC's main route table; everything else
    /// is moved onto the reservation's private table.
    pub public: bool,
}

/// Per-request outcome of a batch run.
#[derive(Debug)]
pub struct SubnetOutcome {
    /// Echo of the request's action id.
    pub action_id: String,
    /// Echo of the request's CIDR.
    pub cidr: String,
    /// Subnet id on success, the captured error otherwise.
    pub result: Result<String>,
}

struct WorkItem<'a> {
    request: &'a SubnetRequest,
    subnet: Option<SubnetRecord>,
    created: bool,
    error: Option<OrchestratorError>,
}

impl WorkItem<'_> {
    fn pending(&self) -> bool {
        self.error.is_none()
    }

    fn fail(&mut self, err: OrchestratorError) {
        warn!(
            cidr = %self.request.cidr,
            alias = %self.request.alias,
            error = %err,
            "subnet request failed"
        );
        self.error = Some(err);
    }
}

/// Mark every error-free item as cancelled. Returns whether the batch
/// should stop issuing provider calls.
fn cancel_pending(items: &mut [WorkItem<'_>], token: &CancellationToken) -> bool {
    if !token.is_cancelled() {
        return false;
    }
    for item in items.iter_mut().filter(|item| item.pending()) {
        item.error = Some(OrchestratorError::Cancelled);
    }
    true
}

/// Resolves a batch of subnet requests against one reservation.
pub struct SubnetBatchExecutor {
    gateways: ResourceGateways,
    settings: Settings,
}

impl SubnetBatchExecutor {
    /// Wire an executor over resource gateways.
    pub fn new(gateways: ResourceGateways, settings: Settings) -> Self {
        Self { gateways, settings }
    }

    /// Run the pipeline for every request, reporting one outcome per
    /// request in input order.
    ///
    /// Fails as a whole only when the reservation's VPC is missing; the
    /// error then carries the region's VPC count, since a hit quota is
    /// the usual reason the VPC never appeared.
    pub async fn execute(
        &self,
        ctx: &ReservationContext,
        requests: &[SubnetRequest],
        token: &CancellationToken,
    ) -> Result<Vec<SubnetOutcome>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let vpc = self.reservation_vpc(ctx).await?;
        let mut items: Vec<WorkItem<'_>> = requests
            .iter()
            .map(|request| WorkItem {
                request,
                subnet: None,
                created: false,
                error: None,
            })
            .collect();

        if !cancel_pending(&mut items, token) {
            self.discover(&vpc, &mut items).await;
        }
        if !cancel_pending(&mut items, token) {
            self.create_missing(&vpc, &mut items).await;
        }
        if !cancel_pending(&mut items, token) {
            self.wait_for_created(&mut items).await;
        }
        if !cancel_pending(&mut items, token) {
            self.tag(ctx, &mut items).await;
        }
        if !cancel_pending(&mut items, token) {
            self.attach(ctx, &vpc, &mut items).await;
        }

        Ok(items
            .into_iter()
            .map(|item| {
                let result = match item.error {
                    Some(err) => Err(err),
                    None => match item.subnet {
                        Some(subnet) => Ok(subnet.id),
                        None => Err(OrchestratorError::provider(
                            "subnet pipeline finished without a subnet id",
                        )),
                    },
                };
                SubnetOutcome {
                    action_id: item.request.action_id.clone(),
                    cidr: item.request.cidr.clone(),
                    result,
                }
            })
            .collect())
    }

    async fn reservation_vpc(&self, ctx: &ReservationContext) -> Result<VpcRecord> {
        if let Some(vpc) = find_reservation_vpc(&self.gateways, ctx).await? {
            return Ok(vpc);
        }
        let quota_hint = match self.gateways.vpcs.count_in_region().await {
            Ok(count) => format!("; the region currently holds {count} VPCs"),
            Err(_) => String::new(),
        };
        Err(OrchestratorError::not_found(format!(
            "no VPC exists for reservation {}{}",
            ctx.reservation_id, quota_hint
        )))
    }

    async fn discover(&self, vpc: &VpcRecord, items: &mut [WorkItem<'_>]) {
        for item in items.iter_mut().filter(|item| item.pending()) {
            match self
                .gateways
                .subnets
                .find_by_cidr(&vpc.id, &item.request.cidr)
                .await
            {
                Ok(Some(subnet)) => {
                    debug!(
                        subnet_id = %subnet.id,
                        cidr = %item.request.cidr,
                        "adopting subnet"
                    );
                    item.subnet = Some(subnet);
                }
                Ok(None) => {}
                Err(err) => item.fail(err),
            }
        }
    }

    async fn create_missing(&self, vpc: &VpcRecord, items: &mut [WorkItem<'_>]) {
        let mut zone_cache: Option<String> = None;
        for item in items
            .iter_mut()
            .filter(|item| item.pending() && item.subnet.is_none())
        {
            let zone = match self.placement_zone(&vpc.id, &mut zone_cache).await {
                Ok(zone) => zone,
                Err(err) => {
                    item.fail(err);
                    continue;
                }
            };
            match self
                .gateways
                .subnets
                .create(&vpc.id, &item.request.cidr, &zone)
                .await
            {
                Ok(subnet) => {
                    item.subnet = Some(subnet);
                    item.created = true;
                }
                Err(err) => item.fail(err),
            }
        }
    }

    /// Zone for new subnets: colocate with whatever the VPC already
    /// holds, otherwise the region's first zone. Resolved once per
    /// batch.
    async fn placement_zone(
        &self,
        vpc_id: &str,
        cache: &mut Option<String>,
    ) -> Result<String> {
        if let Some(zone) = cache {
            return Ok(zone.clone());
        }
        let existing = self.gateways.subnets.list_by_vpc(vpc_id).await?;
        let zone = match existing.iter().find(|s| !s.availability_zone.is_empty()) {
            Some(subnet) => subnet.availability_zone.clone(),
            None => self.gateways.subnets.first_availability_zone().await?,
        };
        *cache = Some(zone.clone());
        Ok(zone)
    }

    async fn wait_for_created(&self, items: &mut [WorkItem<'_>]) {
        let poll = self.settings.poll_interval();
        let timeout = self.settings.wait_timeout();
        for item in items
            .iter_mut()
            .filter(|item| item.pending() && item.created)
        {
            let subnet_id = item.subnet.as_ref().map(|s| s.id.clone());
            if let Some(subnet_id) = subnet_id {
                if let Err(err) =
                    wait_available(&*self.gateways.subnets, &subnet_id, poll, timeout).await
                {
                    item.fail(err);
                }
            }
        }
    }

    async fn tag(&self, ctx: &ReservationContext, items: &mut [WorkItem<'_>]) {
        for item in items.iter_mut().filter(|item| item.pending()) {
            let Some(subnet) = item.subnet.as_ref() else {
                continue;
            };
            let marker = if item.request.public {
                role::PUBLIC
            } else {
                role::PRIVATE
            };
            let tags = TagSet::for_resource(ctx, &ctx.subnet_name(&item.request.alias))
                .with_role(marker);
            if let Err(err) = self.gateways.subnets.tag(&subnet.id, &tags).await {
                item.fail(err);
            }
        }
    }

    async fn attach(
        &self,
        ctx: &ReservationContext,
        vpc: &VpcRecord,
        items: &mut [WorkItem<'_>],
    ) {
        if !items
            .iter()
            .any(|item| item.pending() && !item.request.public)
        {
            return;
        }

        let private_table = match ensure_private_route_table(
            &self.gateways,
            &self.settings,
            ctx,
            &vpc.id,
        )
        .await
        {
            Ok(table) => table,
            Err(err) => {
                // Without the private table no non-public item can attach.
                let message = format!("private route table unavailable: {err}");
                for item in items
                    .iter_mut()
                    .filter(|item| item.pending() && !item.request.public)
                {
                    item.fail(OrchestratorError::provider(message.clone()));
                }
                return;
            }
        };

        for item in items
            .iter_mut()
            .filter(|item| item.pending() && !item.request.public)
        {
            let Some(subnet) = item.subnet.as_ref() else {
                continue;
            };
            match self.associate_private(&private_table.id, subnet).await {
                Ok(()) => {}
                Err(err) => item.fail(err),
            }
        }
    }

    /// Associate a subnet with the private table unless some table
    /// already claims it explicitly. A subnet that a custom route table
    /// has adopted stays where it is.
    async fn associate_private(&self, table_id: &str, subnet: &SubnetRecord) -> Result<()> {
        let tables = self.gateways.route_tables.list_by_vpc(&subnet.vpc_id).await?;
        if let Some(owner) = tables
            .iter()
            .find(|t| t.association_for_subnet(&subnet.id).is_some())
        {
            debug!(
                subnet_id = %subnet.id,
                route_table_id = %owner.id,
                "subnet already explicitly associated"
            );
            return Ok(());
        }
        self.gateways
            .route_tables
            .associate(table_id, &subnet.id)
            .await?;
        info!(
            subnet_id = %subnet.id,
            route_table_id = %table_id,
            "attached subnet to the private route table"
        );
        Ok(())
    }
}

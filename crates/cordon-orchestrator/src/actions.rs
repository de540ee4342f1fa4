//! Caller-facing action contract.
//!
//! A request is a reservation context plus a typed list of actions; the
//! response is one [`ActionResult`] per action, in input order. The
//! dispatcher runs network provisioning first, then the subnet batch,
//! then route tables, so dependent actions are skipped (not attempted)
//! when the network itself could not be provisioned. `Cleanup` never
//! mixes with provisioning actions in one call.

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::context::ReservationContext;
use crate::gateways::ResourceGateways;
use crate::network::NetworkProvisioner;
use crate::route_manager::{RouteSpec, RouteTableManager, RouteTableRequest};
use crate::subnet_batch::{SubnetBatchExecutor, SubnetRequest};
use crate::teardown::TeardownOrchestrator;

fn new_action_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One requested operation. Callers may omit `actionId`; a fresh UUID is
/// assigned so the result can still be correlated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ActionRequest {
    /// Provision the reservation's VPC, gateway, peering and groups.
    PrepareNetwork {
        #[serde(default = "new_action_id")]
        action_id: String,
        /// CIDR for the VPC. Optional in static VPC mode.
        #[serde(default)]
        cidr: Option<String>,
    },
    /// Provision one subnet inside the reservation's VPC.
    PrepareSubnet {
        #[serde(default = "new_action_id")]
        action_id: String,
        cidr: String,
        alias: String,
        #[serde(default)]
        is_public: bool,
    },
    /// Build a custom route table and move subnets onto it.
    CreateRouteTable {
        #[serde(default = "new_action_id")]
        action_id: String,
        alias: String,
        #[serde(default)]
        subnet_cidrs: Vec<String>,
        #[serde(default)]
        routes: Vec<RouteSpec>,
    },
    /// Remove everything the reservation ever created.
    Cleanup {
        #[serde(default = "new_action_id")]
        action_id: String,
    },
}

impl ActionRequest {
    /// The caller-visible correlation id.
    pub fn action_id(&self) -> &str {
        match self {
            ActionRequest::PrepareNetwork { action_id, .. }
            | ActionRequest::PrepareSubnet { action_id, .. }
            | ActionRequest::CreateRouteTable { action_id, .. }
            | ActionRequest::Cleanup { action_id } => action_id,
        }
    }
}

/// Ids of the resources an action produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActionResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_group_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_table_id: Option<String>,
}

impl ActionResources {
    fn is_empty(&self) -> bool {
        self.vpc_id.is_none()
            && self.security_group_ids.is_empty()
            && self.subnet_id.is_none()
            && self.route_table_id.is_none()
    }
}

/// Outcome of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub action_id: String,
    pub success: bool,
    /// Error description on failure, informational note otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "ActionResources::is_empty")]
    pub resources: ActionResources,
}

impl ActionResult {
    /// A successful result with no message or resources yet.
    pub fn succeeded(action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            success: true,
            message: None,
            resources: ActionResources::default(),
        }
    }

    /// A failed result carrying the error description.
    pub fn failed(action_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            success: false,
            message: Some(message.into()),
            resources: ActionResources::default(),
        }
    }

    /// Attach an informational message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach produced resource ids.
    pub fn with_resources(mut self, resources: ActionResources) -> Self {
        self.resources = resources;
        self
    }
}

/// Routes action batches to the provisioning and teardown components.
pub struct Dispatcher {
    gateways: ResourceGateways,
    settings: Settings,
    token: CancellationToken,
}

impl Dispatcher {
    /// Wire a dispatcher over resource gateways.
    pub fn new(gateways: ResourceGateways, settings: Settings, token: CancellationToken) -> Self {
        Self {
            gateways,
            settings,
            token,
        }
    }

    /// Run a batch of actions for one reservation.
    ///
    /// Always returns one result per request, in input order; batch-level
    /// faults surface as failed results rather than a call-level error.
    pub async fn execute(
        &self,
        ctx: &ReservationContext,
        requests: &[ActionRequest],
    ) -> Vec<ActionResult> {
        if requests.is_empty() {
            return Vec::new();
        }
        info!(
            reservation_id = %ctx.reservation_id,
            actions = requests.len(),
            "dispatching action batch"
        );

        let cleanups = requests
            .iter()
            .filter(|r| matches!(r, ActionRequest::Cleanup { .. }))
            .count();
        if cleanups > 0 && cleanups != requests.len() {
            return self.fail_all(
                requests,
                "cleanup cannot be combined with provisioning actions in one call",
            );
        }
        let networks = requests
            .iter()
            .filter(|r| matches!(r, ActionRequest::PrepareNetwork { .. }))
            .count();
        if networks > 1 {
            return self.fail_all(requests, "a call may carry at most one PrepareNetwork action");
        }

        if cleanups > 0 {
            self.run_cleanup(ctx, requests).await
        } else {
            self.run_provisioning(ctx, requests).await
        }
    }

    fn fail_all(&self, requests: &[ActionRequest], message: &str) -> Vec<ActionResult> {
        requests
            .iter()
            .map(|request| ActionResult::failed(request.action_id(), message))
            .collect()
    }

    async fn run_cleanup(
        &self,
        ctx: &ReservationContext,
        requests: &[ActionRequest],
    ) -> Vec<ActionResult> {
        let outcome = TeardownOrchestrator::new(self.gateways.clone(), self.settings.clone())
            .cleanup(ctx, &self.token)
            .await;
        let failure = outcome.err().map(|err| {
            error!(reservation_id = %ctx.reservation_id, error = %err, "cleanup failed");
            err.to_string()
        });

        requests
            .iter()
            .map(|request| match &failure {
                None => ActionResult::succeeded(request.action_id())
                    .with_message("reservation network removed"),
                Some(message) => ActionResult::failed(request.action_id(), message.clone()),
            })
            .collect()
    }

    async fn run_provisioning(
        &self,
        ctx: &ReservationContext,
        requests: &[ActionRequest],
    ) -> Vec<ActionResult> {
        let mut results: Vec<Option<ActionResult>> = vec![None; requests.len()];

        let mut network_slot = None;
        let mut subnet_slots = Vec::new();
        let mut subnet_requests = Vec::new();
        let mut table_slots = Vec::new();
        let mut table_requests = Vec::new();
        for (idx, request) in requests.iter().enumerate() {
            match request {
                ActionRequest::PrepareNetwork { action_id, cidr } => {
                    network_slot = Some((idx, action_id.clone(), cidr.clone()));
                }
                ActionRequest::PrepareSubnet {
                    action_id,
                    cidr,
                    alias,
                    is_public,
                } => {
                    subnet_slots.push(idx);
                    subnet_requests.push(SubnetRequest {
                        action_id: action_id.clone(),
                        cidr: cidr.clone(),
                        alias: alias.clone(),
                        public: *is_public,
                    });
                }
                ActionRequest::CreateRouteTable {
                    action_id,
                    alias,
                    subnet_cidrs,
                    routes,
                } => {
                    table_slots.push(idx);
                    table_requests.push(RouteTableRequest {
                        action_id: action_id.clone(),
                        alias: alias.clone(),
                        subnet_cidrs: subnet_cidrs.clone(),
                        routes: routes.clone(),
                    });
                }
                ActionRequest::Cleanup { .. } => {}
            }
        }

        let mut network_failure = None;
        if let Some((idx, action_id, cidr)) = network_slot {
            let provisioner =
                NetworkProvisioner::new(self.gateways.clone(), self.settings.clone());
            let single_subnet = subnet_requests.len() == 1;
            match provisioner
                .prepare_network(ctx, cidr.as_deref(), single_subnet, &self.token)
                .await
            {
                Ok(network) => {
                    results[idx] = Some(ActionResult::succeeded(&action_id).with_resources(
                        ActionResources {
                            vpc_id: Some(network.vpc_id),
                            security_group_ids: network.security_group_ids,
                            ..ActionResources::default()
                        },
                    ));
                }
                Err(err) => {
                    error!(
                        reservation_id = %ctx.reservation_id,
                        error = %err,
                        "network provisioning failed"
                    );
                    network_failure = Some(err.to_string());
                    results[idx] = Some(ActionResult::failed(&action_id, err.to_string()));
                }
            }
        }

        if let Some(reason) = &network_failure {
            let message = format!("skipped: network provisioning failed: {reason}");
            for (slot, request) in subnet_slots.iter().zip(&subnet_requests) {
                results[*slot] = Some(ActionResult::failed(&request.action_id, message.clone()));
            }
            for (slot, request) in table_slots.iter().zip(&table_requests) {
                results[*slot] = Some(ActionResult::failed(&request.action_id, message.clone()));
            }
        } else {
            if !subnet_requests.is_empty() {
                let executor =
                    SubnetBatchExecutor::new(self.gateways.clone(), self.settings.clone());
                match executor.execute(ctx, &subnet_requests, &self.token).await {
                    Ok(outcomes) => {
                        for (slot, outcome) in subnet_slots.iter().zip(outcomes) {
                            results[*slot] = Some(match outcome.result {
                                Ok(subnet_id) => ActionResult::succeeded(&outcome.action_id)
                                    .with_resources(ActionResources {
                                        subnet_id: Some(subnet_id),
                                        ..ActionResources::default()
                                    }),
                                Err(err) => {
                                    ActionResult::failed(&outcome.action_id, err.to_string())
                                }
                            });
                        }
                    }
                    Err(err) => {
                        let message = err.to_string();
                        for (slot, request) in subnet_slots.iter().zip(&subnet_requests) {
                            results[*slot] =
                                Some(ActionResult::failed(&request.action_id, message.clone()));
                        }
                    }
                }
            }

            if !table_requests.is_empty() {
                let manager =
                    RouteTableManager::new(self.gateways.clone(), self.settings.clone());
                match manager.execute(ctx, &table_requests, &self.token).await {
                    Ok(outcomes) => {
                        for (slot, outcome) in table_slots.iter().zip(outcomes) {
                            results[*slot] = Some(match outcome.result {
                                Ok(table_id) => ActionResult::succeeded(&outcome.action_id)
                                    .with_resources(ActionResources {
                                        route_table_id: Some(table_id),
                                        ..ActionResources::default()
                                    }),
                                Err(err) => {
                                    ActionResult::failed(&outcome.action_id, err.to_string())
                                }
                            });
                        }
                    }
                    Err(err) => {
                        let message = err.to_string();
                        for (slot, request) in table_slots.iter().zip(&table_requests) {
                            results[*slot] =
                                Some(ActionResult::failed(&request.action_id, message.clone()));
                        }
                    }
                }
            }
        }

        requests
            .iter()
            .zip(results)
            .map(|(request, result)| {
                result.unwrap_or_else(|| {
                    ActionResult::failed(request.action_id(), "action was not processed")
                })
            })
            .collect()
    }
}

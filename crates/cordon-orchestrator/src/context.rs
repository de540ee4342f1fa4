//! Reservation identity and deterministic resource naming.
//!
//! Every resource the orchestrator creates is named from the reservation id
//! by a fixed scheme. The names, together with the tag vocabulary in
//! [`crate::tags`], are the only index into the cloud account: rediscovery
//! on a repeated request recomputes the same names and looks them up, so no
//! state is persisted between invocations.

use serde::{Deserialize, Serialize};

/// Identity of the reservation an invocation acts on behalf of.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReservationContext {
    /// Unique reservation identifier. Seed for every derived name.
    pub reservation_id: String,
    /// Requesting user, recorded on resources for attribution.
    #[serde(default)]
    pub owner: String,
    /// Blueprint the reservation was created from, recorded for attribution.
    #[serde(default)]
    pub blueprint: String,
    /// Logical domain or environment the reservation belongs to.
    #[serde(default)]
    pub domain: String,
}

impl ReservationContext {
    /// Build a context for the given reservation id with empty attribution.
    pub fn new(reservation_id: impl Into<String>) -> Self {
        Self {
            reservation_id: reservation_id.into(),
            owner: String::new(),
            blueprint: String::new(),
            domain: String::new(),
        }
    }

    /// Set the owner recorded on created resources.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Set the blueprint recorded on created resources.
    pub fn with_blueprint(mut self, blueprint: impl Into<String>) -> Self {
        self.blueprint = blueprint.into();
        self
    }

    /// Set the logical domain of the reservation.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Name of the sandbox VPC.
    pub fn vpc_name(&self) -> String {
        format!("VPC Reservation: {}", self.reservation_id)
    }

    /// Name of the sandbox internet gateway.
    pub fn internet_gateway_name(&self) -> String {
        format!("IGW Reservation: {}", self.reservation_id)
    }

    /// Name of the peering connection to the management network.
    pub fn peering_name(&self) -> String {
        format!("Peering Reservation: {}", self.reservation_id)
    }

    /// Name of the reservation's default security group.
    pub fn default_security_group_name(&self) -> String {
        format!("Default Security Group Reservation: {}", self.reservation_id)
    }

    /// Name of the reservation's isolated security group.
    pub fn isolated_security_group_name(&self) -> String {
        format!(
            "Isolated Security Group Reservation: {}",
            self.reservation_id
        )
    }

    /// Name tagged onto the VPC's provider-designated main route table.
    pub fn main_route_table_name(&self) -> String {
        format!("Main RouteTable Reservation: {}", self.reservation_id)
    }

    /// Name of the reservation's private route table.
    pub fn private_route_table_name(&self) -> String {
        format!("Private RouteTable Reservation: {}", self.reservation_id)
    }

    /// Name of a subnet, derived from its alias or CIDR.
    pub fn subnet_name(&self, alias: &str) -> String {
        format!("{} Reservation: {}", alias, self.reservation_id)
    }

    /// Name of a requester-defined custom route table.
    pub fn custom_route_table_name(&self, alias: &str) -> String {
        format!("{} Reservation: {}", alias, self.reservation_id)
    }

    /// Name of the SSH key pair registered for the reservation.
    pub fn key_pair_name(&self) -> String {
        format!("Reservation: {}", self.reservation_id)
    }

    /// Object key under which the key pair's private key is stored.
    pub fn key_pair_object_key(&self) -> String {
        format!("reservations/{}/keypair.pem", self.reservation_id)
    }
}

//! # Cordon
//!
//! Reservation-scoped sandbox network lifecycle orchestration on AWS.
//!
//! Each reservation gets an isolated VPC with subnets, security groups,
//! route tables and a peering connection to a shared management network,
//! provisioned on demand and fully removed when the reservation ends.
//! The provider offers no multi-resource transaction, so the orchestrator
//! emulates one with deterministic tags, find-or-create discovery,
//! dependency-aware deletion ordering and compensating rollback.
//!
//! ## Architecture
//!
//! ```text
//! Dispatcher (actions)
//! ├── NetworkProvisioner     VPC + IGW + peering + security groups
//! ├── SubnetBatchExecutor    discover → create → wait → tag → attach
//! ├── RouteTableManager      next-hop resolution + saga rollback
//! └── TeardownOrchestrator   fail-fast, dependency-ordered removal
//!         │
//!   ResourceGateways (ports) ── RetryPolicy ── AWS EC2/S3
//! ```
//!
//! Nothing is persisted locally: the tags written at creation time
//! ([`tags`], [`context`]) are the only index, and every call
//! reconstructs what it needs by tag lookup. Cancellation is a
//! cooperative token checked at stage boundaries ([`cancel`]); retries
//! are two named fixed-delay policies ([`retry`]) that absorb the
//! provider's read-after-write consistency lag.

pub mod actions;
pub mod cancel;
pub mod compensate;
pub mod config;
pub mod context;
pub mod error;
pub mod gateways;
pub mod instances;
pub mod keypair;
pub mod mirror;
pub mod netif;
pub mod network;
pub mod peering;
pub mod retry;
pub mod route_manager;
pub mod route_table;
pub mod security_group;
pub mod subnet;
pub mod subnet_batch;
pub mod tags;
pub mod teardown;
pub mod topology;
pub mod vpc;

#[cfg(test)]
mod fakes;

// Caller-facing contract
pub use actions::{ActionRequest, ActionResources, ActionResult, Dispatcher};

// Lifecycle components
pub use network::{NetworkProvisioner, PreparedNetwork};
pub use route_manager::{NextHopType, RouteSpec, RouteTableManager, RouteTableRequest};
pub use subnet_batch::{SubnetBatchExecutor, SubnetOutcome, SubnetRequest};
pub use teardown::TeardownOrchestrator;
pub use topology::{NetworkTopology, reconstruct};

// Cross-cutting primitives
pub use cancel::CancellationToken;
pub use config::Settings;
pub use context::ReservationContext;
pub use error::{OrchestratorError, Result};
pub use gateways::ResourceGateways;
pub use retry::RetryPolicy;

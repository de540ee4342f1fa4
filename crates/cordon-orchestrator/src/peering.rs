//! VPC peering connection access.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ec2::types::{ResourceType, TagSpecification};
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::gateways::missing_resource;
use crate::tags::{self, TagSet};

/// Lifecycle state of a peering connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeeringState {
    /// Request sent, provider still setting it up.
    InitiatingRequest,
    /// Waiting for the accepter side.
    PendingAcceptance,
    /// Accepted, provider still wiring it.
    Provisioning,
    /// Usable.
    Active,
    /// Being torn down.
    Deleting,
    /// Gone.
    Deleted,
    /// Rejected by the accepter.
    Rejected,
    /// Provider gave up on it.
    Failed,
    /// Request expired before acceptance.
    Expired,
    /// A state this crate does not model.
    Other(String),
}

impl PeeringState {
    /// Parse the provider's status code.
    pub fn from_code(code: &str) -> Self {
        match code {
            "initiating-request" => Self::InitiatingRequest,
            "pending-acceptance" => Self::PendingAcceptance,
            "provisioning" => Self::Provisioning,
            "active" => Self::Active,
            "deleting" => Self::Deleting,
            "deleted" => Self::Deleted,
            "rejected" => Self::Rejected,
            "failed" => Self::Failed,
            "expired" => Self::Expired,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the connection still occupies resources worth deleting.
    pub fn is_live(&self) -> bool {
        !matches!(
            self,
            Self::Deleted | Self::Failed | Self::Rejected | Self::Expired
        )
    }

    /// Whether the connection can never become active.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            Self::Deleted | Self::Deleting | Self::Failed | Self::Rejected | Self::Expired
        )
    }
}

impl std::fmt::Display for PeeringState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            Self::InitiatingRequest => "initiating-request",
            Self::PendingAcceptance => "pending-acceptance",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Other(code) => code,
        };
        f.write_str(code)
    }
}

/// A peering connection as the orchestrator sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeeringRecord {
    /// Provider-assigned id.
    pub id: String,
    /// Current lifecycle state.
    pub state: PeeringState,
    /// VPC that requested the connection.
    pub requester_vpc_id: String,
    /// VPC that accepts the connection.
    pub accepter_vpc_id: String,
}

/// Peering lookup and lifecycle calls.
#[async_trait]
pub trait PeeringPort: Send + Sync {
    /// All peering connections tagged with the reservation id.
    async fn find_by_reservation(&self, reservation_id: &str) -> Result<Vec<PeeringRecord>>;

    /// A single connection by id, or `None` when it does not exist.
    async fn get(&self, peering_id: &str) -> Result<Option<PeeringRecord>>;

    /// Request a connection between two VPCs, tagged at creation.
    async fn create(
        &self,
        requester_vpc_id: &str,
        accepter_vpc_id: &str,
        tags: &TagSet,
    ) -> Result<PeeringRecord>;

    /// Accept a pending connection.
    async fn accept(&self, peering_id: &str) -> Result<()>;

    /// Delete a connection. Already-deleted is tolerated.
    async fn delete(&self, peering_id: &str) -> Result<()>;
}

/// Poll until the connection is active, accepting it when it parks in
/// pending-acceptance. Bounded by `timeout`.
pub async fn wait_active(
    peerings: &dyn PeeringPort,
    peering_id: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let start = std::time::Instant::now();
    loop {
        let record = peerings.get(peering_id).await?.ok_or_else(|| {
            OrchestratorError::not_found(format!(
                "peering connection {} does not exist",
                peering_id
            ))
        })?;

        match record.state {
            PeeringState::Active => {
                debug!(peering_id = %peering_id, "peering connection is active");
                return Ok(());
            }
            PeeringState::PendingAcceptance => {
                info!(peering_id = %peering_id, "accepting peering connection");
                peerings.accept(peering_id).await?;
            }
            ref state if state.is_terminal_failure() => {
                return Err(OrchestratorError::provider(format!(
                    "peering connection {} entered state {}",
                    peering_id, state
                )));
            }
            ref state => {
                debug!(peering_id = %peering_id, state = %state, "peering connection not ready");
            }
        }

        if start.elapsed() > timeout {
            return Err(OrchestratorError::Timeout(timeout));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// EC2-backed implementation of [`PeeringPort`].
pub struct AwsPeeringGateway {
    client: aws_sdk_ec2::Client,
}

impl AwsPeeringGateway {
    /// Wrap an EC2 client.
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

fn peering_record(conn: &aws_sdk_ec2::types::VpcPeeringConnection) -> PeeringRecord {
    PeeringRecord {
        id: conn
            .vpc_peering_connection_id()
            .unwrap_or_default()
            .to_string(),
        state: conn
            .status()
            .and_then(|s| s.code())
            .map(|c| PeeringState::from_code(c.as_str()))
            .unwrap_or(PeeringState::Other(String::new())),
        requester_vpc_id: conn
            .requester_vpc_info()
            .and_then(|info| info.vpc_id())
            .unwrap_or_default()
            .to_string(),
        accepter_vpc_id: conn
            .accepter_vpc_info()
            .and_then(|info| info.vpc_id())
            .unwrap_or_default()
            .to_string(),
    }
}

#[async_trait]
impl PeeringPort for AwsPeeringGateway {
    async fn find_by_reservation(&self, reservation_id: &str) -> Result<Vec<PeeringRecord>> {
        let response = self
            .client
            .describe_vpc_peering_connections()
            .filters(tags::reservation_filter(reservation_id))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        Ok(response
            .vpc_peering_connections()
            .iter()
            .map(peering_record)
            .collect())
    }

    async fn get(&self, peering_id: &str) -> Result<Option<PeeringRecord>> {
        let response = self
            .client
            .describe_vpc_peering_connections()
            .filters(tags::attribute_filter(
                "vpc-peering-connection-id",
                peering_id,
            ))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        Ok(response
            .vpc_peering_connections()
            .first()
            .map(peering_record))
    }

    async fn create(
        &self,
        requester_vpc_id: &str,
        accepter_vpc_id: &str,
        tags: &TagSet,
    ) -> Result<PeeringRecord> {
        let response = self
            .client
            .create_vpc_peering_connection()
            .vpc_id(requester_vpc_id)
            .peer_vpc_id(accepter_vpc_id)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::VpcPeeringConnection)
                    .set_tags(Some(tags.to_ec2_tags()))
                    .build(),
            )
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        let conn = response.vpc_peering_connection().ok_or_else(|| {
            OrchestratorError::provider("create_vpc_peering_connection returned no connection")
        })?;
        info!(
            peering_id = ?conn.vpc_peering_connection_id(),
            requester = %requester_vpc_id,
            accepter = %accepter_vpc_id,
            "created peering connection"
        );
        Ok(peering_record(conn))
    }

    async fn accept(&self, peering_id: &str) -> Result<()> {
        self.client
            .accept_vpc_peering_connection()
            .vpc_peering_connection_id(peering_id)
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;
        Ok(())
    }

    async fn delete(&self, peering_id: &str) -> Result<()> {
        match self
            .client
            .delete_vpc_peering_connection()
            .vpc_peering_connection_id(peering_id)
            .send()
            .await
        {
            Ok(_) => {
                info!(peering_id = %peering_id, "deleted peering connection");
                Ok(())
            }
            Err(err) => {
                let err = aws_sdk_ec2::Error::from(err);
                if missing_resource(&err) {
                    Ok(())
                } else {
                    warn!(peering_id = %peering_id, "failed to delete peering connection");
                    Err(OrchestratorError::from_ec2(err))
                }
            }
        }
    }
}

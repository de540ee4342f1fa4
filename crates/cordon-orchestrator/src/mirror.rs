//! Traffic mirroring cleanup.
//!
//! Reservations may have mirror sessions recording instance traffic for
//! inspection. Teardown deletes sessions before the filters and targets
//! they reference.

use async_trait::async_trait;
use tracing::info;

use crate::error::{OrchestratorError, Result};
use crate::tags;

/// Traffic mirroring removal calls.
#[async_trait]
pub trait MirrorPort: Send + Sync {
    /// Delete every mirror session, filter and target tagged with the
    /// reservation id, in reference order.
    async fn delete_for_reservation(&self, reservation_id: &str) -> Result<()>;
}

/// EC2-backed implementation of [`MirrorPort`].
pub struct AwsMirrorGateway {
    client: aws_sdk_ec2::Client,
}

impl AwsMirrorGateway {
    /// Wrap an EC2 client.
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MirrorPort for AwsMirrorGateway {
    async fn delete_for_reservation(&self, reservation_id: &str) -> Result<()> {
        let sessions = self
            .client
            .describe_traffic_mirror_sessions()
            .filters(tags::reservation_filter(reservation_id))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;
        for session in sessions.traffic_mirror_sessions() {
            if let Some(session_id) = session.traffic_mirror_session_id() {
                self.client
                    .delete_traffic_mirror_session()
                    .traffic_mirror_session_id(session_id)
                    .send()
                    .await
                    .map_err(OrchestratorError::from_ec2)?;
                info!(session_id = %session_id, "deleted traffic mirror session");
            }
        }

        let filters = self
            .client
            .describe_traffic_mirror_filters()
            .filters(tags::reservation_filter(reservation_id))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;
        for filter in filters.traffic_mirror_filters() {
            if let Some(filter_id) = filter.traffic_mirror_filter_id() {
                self.client
                    .delete_traffic_mirror_filter()
                    .traffic_mirror_filter_id(filter_id)
                    .send()
                    .await
                    .map_err(OrchestratorError::from_ec2)?;
                info!(filter_id = %filter_id, "deleted traffic mirror filter");
            }
        }

        let targets = self
            .client
            .describe_traffic_mirror_targets()
            .filters(tags::reservation_filter(reservation_id))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;
        for target in targets.traffic_mirror_targets() {
            if let Some(target_id) = target.traffic_mirror_target_id() {
                self.client
                    .delete_traffic_mirror_target()
                    .traffic_mirror_target_id(target_id)
                    .send()
                    .await
                    .map_err(OrchestratorError::from_ec2)?;
                info!(target_id = %target_id, "deleted traffic mirror target");
            }
        }

        Ok(())
    }
}

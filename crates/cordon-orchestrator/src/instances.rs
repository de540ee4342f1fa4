//! Instance termination support for teardown.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::gateways::missing_resource;
use crate::tags;

/// An instance as teardown sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    /// Provider-assigned id.
    pub id: String,
    /// Provider lifecycle state name, `running`, `terminated` and so on.
    pub state: String,
}

impl InstanceRecord {
    /// Whether the instance has fully released its network interfaces.
    pub fn is_terminated(&self) -> bool {
        self.state == "terminated"
    }
}

/// Instance lookup and termination calls.
#[async_trait]
pub trait InstancePort: Send + Sync {
    /// All instances inside a VPC, whatever their state.
    async fn list_by_vpc(&self, vpc_id: &str) -> Result<Vec<InstanceRecord>>;

    /// Disassociate and release any elastic addresses bound to the
    /// instance, so the account does not leak allocations after the
    /// instance is gone.
    async fn release_addresses(&self, instance_id: &str) -> Result<()>;

    /// Terminate instances. Ids that no longer exist are tolerated.
    async fn terminate(&self, instance_ids: &[String]) -> Result<()>;
}

/// Poll until every instance in the VPC reports `terminated`, bounded by
/// `timeout`. Subnet deletion fails while instance interfaces linger, so
/// teardown waits here before touching subnets.
pub async fn wait_all_terminated(
    instances: &dyn InstancePort,
    vpc_id: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let start = std::time::Instant::now();
    loop {
        let remaining: Vec<String> = instances
            .list_by_vpc(vpc_id)
            .await?
            .into_iter()
            .filter(|i| !i.is_terminated())
            .map(|i| i.id)
            .collect();
        if remaining.is_empty() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            return Err(OrchestratorError::Timeout(timeout));
        }
        debug!(vpc_id = %vpc_id, remaining = remaining.len(), "waiting for instance termination");
        tokio::time::sleep(poll_interval).await;
    }
}

/// EC2-backed implementation of [`InstancePort`].
pub struct AwsInstanceGateway {
    client: aws_sdk_ec2::Client,
}

impl AwsInstanceGateway {
    /// Wrap an EC2 client.
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InstancePort for AwsInstanceGateway {
    async fn list_by_vpc(&self, vpc_id: &str) -> Result<Vec<InstanceRecord>> {
        let response = self
            .client
            .describe_instances()
            .filters(tags::attribute_filter("vpc-id", vpc_id))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        let records = response
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .map(|instance| InstanceRecord {
                id: instance.instance_id().unwrap_or_default().to_string(),
                state: instance
                    .state()
                    .and_then(|s| s.name())
                    .map(|n| n.as_str().to_string())
                    .unwrap_or_default(),
            })
            .collect();
        Ok(records)
    }

    async fn release_addresses(&self, instance_id: &str) -> Result<()> {
        let response = self
            .client
            .describe_addresses()
            .filters(tags::attribute_filter("instance-id", instance_id))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        for address in response.addresses() {
            if let Some(association_id) = address.association_id() {
                self.client
                    .disassociate_address()
                    .association_id(association_id)
                    .send()
                    .await
                    .map_err(OrchestratorError::from_ec2)?;
            }
            if let Some(allocation_id) = address.allocation_id() {
                self.client
                    .release_address()
                    .allocation_id(allocation_id)
                    .send()
                    .await
                    .map_err(OrchestratorError::from_ec2)?;
                info!(
                    instance_id = %instance_id,
                    allocation_id = %allocation_id,
                    "released elastic address"
                );
            }
        }
        Ok(())
    }

    async fn terminate(&self, instance_ids: &[String]) -> Result<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        match self
            .client
            .terminate_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
        {
            Ok(_) => {
                info!(count = instance_ids.len(), "terminated instances");
                Ok(())
            }
            Err(err) => {
                let err = aws_sdk_ec2::Error::from(err);
                if missing_resource(&err) {
                    Ok(())
                } else {
                    Err(OrchestratorError::from_ec2(err))
                }
            }
        }
    }
}

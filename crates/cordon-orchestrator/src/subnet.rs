//! Subnet access.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::gateways::missing_resource;
use crate::tags::{self, TagSet};

/// A subnet as the orchestrator sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetRecord {
    /// Provider-assigned id.
    pub id: String,
    /// IPv4 CIDR block.
    pub cidr: String,
    /// Availability zone the subnet lives in.
    pub availability_zone: String,
    /// Provider lifecycle state, `pending` or `available`.
    pub state: String,
    /// Owning VPC.
    pub vpc_id: String,
    /// Display name tag, when present.
    pub name: Option<String>,
}

impl SubnetRecord {
    /// Whether the subnet has finished provisioning.
    pub fn is_available(&self) -> bool {
        self.state == "available"
    }
}

/// Subnet lookup and lifecycle calls.
#[async_trait]
pub trait SubnetPort: Send + Sync {
    /// The subnet with the given CIDR inside a VPC, if any.
    async fn find_by_cidr(&self, vpc_id: &str, cidr: &str) -> Result<Option<SubnetRecord>>;

    /// All subnets of a VPC.
    async fn list_by_vpc(&self, vpc_id: &str) -> Result<Vec<SubnetRecord>>;

    /// A single subnet by id, or `None` when it does not exist.
    async fn get(&self, subnet_id: &str) -> Result<Option<SubnetRecord>>;

    /// Create a subnet. Tags are written later, once the subnet is
    /// available, so creation stays a cheap fire-and-forget call.
    async fn create(
        &self,
        vpc_id: &str,
        cidr: &str,
        availability_zone: &str,
    ) -> Result<SubnetRecord>;

    /// Write tags onto an existing subnet.
    async fn tag(&self, subnet_id: &str, tags: &TagSet) -> Result<()>;

    /// Delete a subnet. Already-deleted is tolerated.
    async fn delete(&self, subnet_id: &str) -> Result<()>;

    /// Name of the region's first availability zone, the deterministic
    /// placement for every sandbox subnet.
    async fn first_availability_zone(&self) -> Result<String>;
}

/// Poll until the subnet reports `available`, bounded by `timeout`.
pub async fn wait_available(
    subnets: &dyn SubnetPort,
    subnet_id: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let start = std::time::Instant::now();
    loop {
        if let Some(subnet) = subnets.get(subnet_id).await? {
            if subnet.is_available() {
                debug!(subnet_id = %subnet_id, "subnet is available");
                return Ok(());
            }
        }
        if start.elapsed() > timeout {
            return Err(OrchestratorError::Timeout(timeout));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// EC2-backed implementation of [`SubnetPort`].
pub struct AwsSubnetGateway {
    client: aws_sdk_ec2::Client,
}

impl AwsSubnetGateway {
    /// Wrap an EC2 client.
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

fn subnet_record(subnet: &aws_sdk_ec2::types::Subnet) -> SubnetRecord {
    SubnetRecord {
        id: subnet.subnet_id().unwrap_or_default().to_string(),
        cidr: subnet.cidr_block().unwrap_or_default().to_string(),
        availability_zone: subnet
            .availability_zone()
            .unwrap_or_default()
            .to_string(),
        state: subnet
            .state()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        vpc_id: subnet.vpc_id().unwrap_or_default().to_string(),
        name: tags::name_of(subnet.tags()),
    }
}

#[async_trait]
impl SubnetPort for AwsSubnetGateway {
    async fn find_by_cidr(&self, vpc_id: &str, cidr: &str) -> Result<Option<SubnetRecord>> {
        let response = self
            .client
            .describe_subnets()
            .filters(tags::attribute_filter("vpc-id", vpc_id))
            .filters(tags::attribute_filter("cidr-block", cidr))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        Ok(response.subnets().first().map(subnet_record))
    }

    async fn list_by_vpc(&self, vpc_id: &str) -> Result<Vec<SubnetRecord>> {
        let response = self
            .client
            .describe_subnets()
            .filters(tags::attribute_filter("vpc-id", vpc_id))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        Ok(response.subnets().iter().map(subnet_record).collect())
    }

    async fn get(&self, subnet_id: &str) -> Result<Option<SubnetRecord>> {
        let response = self
            .client
            .describe_subnets()
            .filters(tags::attribute_filter("subnet-id", subnet_id))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        Ok(response.subnets().first().map(subnet_record))
    }

    async fn create(
        &self,
        vpc_id: &str,
        cidr: &str,
        availability_zone: &str,
    ) -> Result<SubnetRecord> {
        let response = self
            .client
            .create_subnet()
            .vpc_id(vpc_id)
            .cidr_block(cidr)
            .availability_zone(availability_zone)
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        let subnet = response
            .subnet()
            .ok_or_else(|| OrchestratorError::provider("create_subnet returned no subnet"))?;
        info!(
            subnet_id = ?subnet.subnet_id(),
            cidr = %cidr,
            availability_zone = %availability_zone,
            "created subnet"
        );
        Ok(subnet_record(subnet))
    }

    async fn tag(&self, subnet_id: &str, tags: &TagSet) -> Result<()> {
        self.client
            .create_tags()
            .resources(subnet_id)
            .set_tags(Some(tags.to_ec2_tags()))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;
        Ok(())
    }

    async fn delete(&self, subnet_id: &str) -> Result<()> {
        match self.client.delete_subnet().subnet_id(subnet_id).send().await {
            Ok(_) => {
                info!(subnet_id = %subnet_id, "deleted subnet");
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

    async fn first_availability_zone(&self) -> Result<String> {
        let response = self
            .client
            .describe_availability_zones()
            .filters(tags::attribute_filter("state", "available"))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        let mut names: Vec<String> = response
            .availability_zones()
            .iter()
            .filter_map(|zone| zone.zone_name().map(str::to_string))
            .collect();
        names.sort();
        names.into_iter().next().ok_or_else(|| {
            OrchestratorError::provider("region reports no available availability zones")
        })
    }
}

//! VPC and internet gateway access.
//!
//! The traits here are the seams the lifecycle components talk through.
//! Production wires them to the EC2 API; tests substitute an in-memory
//! implementation.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ec2::types::{AttributeBooleanValue, ResourceType, TagSpecification};
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::gateways::missing_resource;
use crate::tags::{self, TagSet};

/// A VPC as the orchestrator sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpcRecord {
    /// Provider-assigned id.
    pub id: String,
    /// Primary IPv4 CIDR block.
    pub cidr: String,
    /// Provider lifecycle state, `pending` or `available`.
    pub state: String,
}

impl VpcRecord {
    /// Whether the VPC has finished provisioning.
    pub fn is_available(&self) -> bool {
        self.state == "available"
    }
}

/// VPC lookup and lifecycle calls.
#[async_trait]
pub trait VpcPort: Send + Sync {
    /// All VPCs carrying the given display name tag.
    async fn find_by_name(&self, name: &str) -> Result<Vec<VpcRecord>>;

    /// A single VPC by id, or `None` when it does not exist.
    async fn get(&self, vpc_id: &str) -> Result<Option<VpcRecord>>;

    /// Create a VPC with the given CIDR, tagged at creation.
    async fn create(&self, cidr: &str, tags: &TagSet) -> Result<VpcRecord>;

    /// Number of VPCs currently in the region, reservation-owned or not.
    /// Surfaced in diagnostics when discovery comes up empty, since the
    /// usual culprit is an exhausted VPC quota.
    async fn count_in_region(&self) -> Result<usize>;

    /// Turn on DNS hostname assignment for instances in the VPC.
    async fn enable_dns_hostnames(&self, vpc_id: &str) -> Result<()>;

    /// Delete the VPC. A VPC that is already gone counts as deleted.
    async fn delete(&self, vpc_id: &str) -> Result<()>;
}

/// Internet gateway lookup and lifecycle calls.
#[async_trait]
pub trait InternetGatewayPort: Send + Sync {
    /// Ids of gateways attached to the given VPC.
    async fn find_attached(&self, vpc_id: &str) -> Result<Vec<String>>;

    /// Create a gateway, tagged at creation. Returns its id.
    async fn create(&self, tags: &TagSet) -> Result<String>;

    /// Attach a gateway to a VPC.
    async fn attach(&self, gateway_id: &str, vpc_id: &str) -> Result<()>;

    /// Detach a gateway from a VPC. Already-detached is tolerated.
    async fn detach(&self, gateway_id: &str, vpc_id: &str) -> Result<()>;

    /// Delete a gateway. Already-deleted is tolerated.
    async fn delete(&self, gateway_id: &str) -> Result<()>;

    /// Re-tag an existing gateway.
    async fn tag(&self, gateway_id: &str, tags: &TagSet) -> Result<()>;
}

/// Poll until the VPC reports `available`, bounded by `timeout`.
pub async fn wait_available(
    vpcs: &dyn VpcPort,
    vpc_id: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let start = std::time::Instant::now();
    loop {
        if let Some(vpc) = vpcs.get(vpc_id).await? {
            if vpc.is_available() {
                debug!(vpc_id = %vpc_id, "VPC is available");
                return Ok(());
            }
        }
        if start.elapsed() > timeout {
            return Err(OrchestratorError::Timeout(timeout));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// EC2-backed implementation of [`VpcPort`].
pub struct AwsVpcGateway {
    client: aws_sdk_ec2::Client,
}

impl AwsVpcGateway {
    /// Wrap an EC2 client.
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

fn vpc_record(vpc: &aws_sdk_ec2::types::Vpc) -> VpcRecord {
    VpcRecord {
        id: vpc.vpc_id().unwrap_or_default().to_string(),
        cidr: vpc.cidr_block().unwrap_or_default().to_string(),
        state: vpc
            .state()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
    }
}

#[async_trait]
impl VpcPort for AwsVpcGateway {
    async fn find_by_name(&self, name: &str) -> Result<Vec<VpcRecord>> {
        let response = self
            .client
            .describe_vpcs()
            .filters(tags::name_filter(name))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        Ok(response.vpcs().iter().map(vpc_record).collect())
    }

    async fn get(&self, vpc_id: &str) -> Result<Option<VpcRecord>> {
        let response = self
            .client
            .describe_vpcs()
            .filters(tags::attribute_filter("vpc-id", vpc_id))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        Ok(response.vpcs().first().map(vpc_record))
    }

    async fn create(&self, cidr: &str, tags: &TagSet) -> Result<VpcRecord> {
        let response = self
            .client
            .create_vpc()
            .cidr_block(cidr)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Vpc)
                    .set_tags(Some(tags.to_ec2_tags()))
                    .build(),
            )
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        let vpc = response
            .vpc()
            .ok_or_else(|| OrchestratorError::provider("create_vpc returned no VPC"))?;
        info!(vpc_id = ?vpc.vpc_id(), cidr = %cidr, "created VPC");
        Ok(vpc_record(vpc))
    }

    async fn count_in_region(&self) -> Result<usize> {
        let response = self
            .client
            .describe_vpcs()
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;
        Ok(response.vpcs().len())
    }

    async fn enable_dns_hostnames(&self, vpc_id: &str) -> Result<()> {
        self.client
            .modify_vpc_attribute()
            .vpc_id(vpc_id)
            .enable_dns_hostnames(AttributeBooleanValue::builder().value(true).build())
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;
        Ok(())
    }

    async fn delete(&self, vpc_id: &str) -> Result<()> {
        match self.client.delete_vpc().vpc_id(vpc_id).send().await {
            Ok(_) => {
                info!(vpc_id = %vpc_id, "deleted VPC");
                Ok(())
            }
            Err(err) => {
                let err = aws_sdk_ec2::Error::from(err);
                if missing_resource(&err) {
                    debug!(vpc_id = %vpc_id, "VPC already deleted");
                    Ok(())
                } else {
                    Err(OrchestratorError::from_ec2(err))
                }
            }
        }
    }
}

/// EC2-backed implementation of [`InternetGatewayPort`].
pub struct AwsInternetGatewayGateway {
    client: aws_sdk_ec2::Client,
}

impl AwsInternetGatewayGateway {
    /// Wrap an EC2 client.
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InternetGatewayPort for AwsInternetGatewayGateway {
    async fn find_attached(&self, vpc_id: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .describe_internet_gateways()
            .filters(tags::attribute_filter("attachment.vpc-id", vpc_id))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        Ok(response
            .internet_gateways()
            .iter()
            .filter_map(|igw| igw.internet_gateway_id().map(str::to_string))
            .collect())
    }

    async fn create(&self, tags: &TagSet) -> Result<String> {
        let response = self
            .client
            .create_internet_gateway()
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::InternetGateway)
                    .set_tags(Some(tags.to_ec2_tags()))
                    .build(),
            )
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        let gateway_id = response
            .internet_gateway()
            .and_then(|igw| igw.internet_gateway_id())
            .ok_or_else(|| {
                OrchestratorError::provider("create_internet_gateway returned no gateway")
            })?
            .to_string();
        info!(gateway_id = %gateway_id, "created internet gateway");
        Ok(gateway_id)
    }

    async fn attach(&self, gateway_id: &str, vpc_id: &str) -> Result<()> {
        self.client
            .attach_internet_gateway()
            .internet_gateway_id(gateway_id)
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;
        info!(gateway_id = %gateway_id, vpc_id = %vpc_id, "attached internet gateway");
        Ok(())
    }

    async fn detach(&self, gateway_id: &str, vpc_id: &str) -> Result<()> {
        match self
            .client
            .detach_internet_gateway()
            .internet_gateway_id(gateway_id)
            .vpc_id(vpc_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
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

    async fn delete(&self, gateway_id: &str) -> Result<()> {
        match self
            .client
            .delete_internet_gateway()
            .internet_gateway_id(gateway_id)
            .send()
            .await
        {
            Ok(_) => {
                info!(gateway_id = %gateway_id, "deleted internet gateway");
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

    async fn tag(&self, gateway_id: &str, tags: &TagSet) -> Result<()> {
        self.client
            .create_tags()
            .resources(gateway_id)
            .set_tags(Some(tags.to_ec2_tags()))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;
        Ok(())
    }
}

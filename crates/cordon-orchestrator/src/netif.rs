//! Next-hop lookups for requester-defined routes.
//!
//! Custom route tables address their next hops by private IP. These ports
//! resolve an IP to the provider id of the interface or NAT gateway that
//! owns it.

use async_trait::async_trait;

use crate::error::{OrchestratorError, Result};
use crate::tags;

/// Network interface lookup.
#[async_trait]
pub trait NetworkInterfacePort: Send + Sync {
    /// Id of the interface holding `private_ip` inside a VPC, if any.
    async fn find_by_private_ip(&self, vpc_id: &str, private_ip: &str)
    -> Result<Option<String>>;
}

/// NAT gateway lookup.
#[async_trait]
pub trait NatGatewayPort: Send + Sync {
    /// Id of the NAT gateway in `subnet_id` holding `private_ip`, if any.
    async fn find_by_private_ip(
        &self,
        subnet_id: &str,
        private_ip: &str,
    ) -> Result<Option<String>>;
}

/// EC2-backed implementation of [`NetworkInterfacePort`].
pub struct AwsNetworkInterfaceGateway {
    client: aws_sdk_ec2::Client,
}

impl AwsNetworkInterfaceGateway {
    /// Wrap an EC2 client.
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NetworkInterfacePort for AwsNetworkInterfaceGateway {
    async fn find_by_private_ip(
        &self,
        vpc_id: &str,
        private_ip: &str,
    ) -> Result<Option<String>> {
        let response = self
            .client
            .describe_network_interfaces()
            .filters(tags::attribute_filter("vpc-id", vpc_id))
            .filters(tags::attribute_filter(
                "addresses.private-ip-address",
                private_ip,
            ))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        Ok(response
            .network_interfaces()
            .first()
            .and_then(|eni| eni.network_interface_id().map(str::to_string)))
    }
}

/// EC2-backed implementation of [`NatGatewayPort`].
pub struct AwsNatGatewayGateway {
    client: aws_sdk_ec2::Client,
}

impl AwsNatGatewayGateway {
    /// Wrap an EC2 client.
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NatGatewayPort for AwsNatGatewayGateway {
    async fn find_by_private_ip(
        &self,
        subnet_id: &str,
        private_ip: &str,
    ) -> Result<Option<String>> {
        let response = self
            .client
            .describe_nat_gateways()
            .filter(tags::attribute_filter("subnet-id", subnet_id))
            .filter(tags::attribute_filter("state", "available"))
            .send()
            .await
            .map_err(OrchestratorError::from_ec2)?;

        let id = response.nat_gateways().iter().find_map(|nat| {
            let owns_ip = nat
                .nat_gateway_addresses()
                .iter()
                .any(|addr| addr.private_ip() == Some(private_ip));
            if owns_ip {
                nat.nat_gateway_id().map(str::to_string)
            } else {
                None
            }
        });
        Ok(id)
    }
}

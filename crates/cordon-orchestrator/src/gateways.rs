//! Resource gateway wiring.
//!
//! [`ResourceGateways`] carries one handle per resource type the
//! lifecycle components operate on. Production code builds it from an
//! AWS configuration; tests build it over an in-memory cloud.

use std::sync::Arc;

use aws_sdk_ec2::error::ProvideErrorMetadata;

use crate::config::Settings;
use crate::instances::{AwsInstanceGateway, InstancePort};
use crate::keypair::{AwsKeyPairStore, KeyPairPort};
use crate::mirror::{AwsMirrorGateway, MirrorPort};
use crate::netif::{
    AwsNatGatewayGateway, AwsNetworkInterfaceGateway, NatGatewayPort, NetworkInterfacePort,
};
use crate::peering::{AwsPeeringGateway, PeeringPort};
use crate::route_table::{AwsRouteTableGateway, RouteTablePort};
use crate::security_group::{AwsSecurityGroupGateway, SecurityGroupPort};
use crate::subnet::{AwsSubnetGateway, SubnetPort};
use crate::vpc::{AwsInternetGatewayGateway, AwsVpcGateway, InternetGatewayPort, VpcPort};

/// One handle per resource type.
#[derive(Clone)]
pub struct ResourceGateways {
    /// VPC lifecycle.
    pub vpcs: Arc<dyn VpcPort>,
    /// Internet gateway lifecycle.
    pub internet_gateways: Arc<dyn InternetGatewayPort>,
    /// Subnet lifecycle.
    pub subnets: Arc<dyn SubnetPort>,
    /// Security group lifecycle.
    pub security_groups: Arc<dyn SecurityGroupPort>,
    /// Route table lifecycle.
    pub route_tables: Arc<dyn RouteTablePort>,
    /// Peering connection lifecycle.
    pub peerings: Arc<dyn PeeringPort>,
    /// Network interface lookups.
    pub interfaces: Arc<dyn NetworkInterfacePort>,
    /// NAT gateway lookups.
    pub nat_gateways: Arc<dyn NatGatewayPort>,
    /// Instance termination.
    pub instances: Arc<dyn InstancePort>,
    /// Key pair removal.
    pub key_pairs: Arc<dyn KeyPairPort>,
    /// Traffic mirroring removal.
    pub mirrors: Arc<dyn MirrorPort>,
}

impl ResourceGateways {
    /// Wire every gateway to the AWS APIs.
    pub fn aws(config: &aws_config::SdkConfig, settings: &Settings) -> Self {
        let ec2 = aws_sdk_ec2::Client::new(config);
        let s3 = aws_sdk_s3::Client::new(config);
        Self {
            vpcs: Arc::new(AwsVpcGateway::new(ec2.clone())),
            internet_gateways: Arc::new(AwsInternetGatewayGateway::new(ec2.clone())),
            subnets: Arc::new(AwsSubnetGateway::new(ec2.clone())),
            security_groups: Arc::new(AwsSecurityGroupGateway::new(ec2.clone())),
            route_tables: Arc::new(AwsRouteTableGateway::new(ec2.clone())),
            peerings: Arc::new(AwsPeeringGateway::new(ec2.clone())),
            interfaces: Arc::new(AwsNetworkInterfaceGateway::new(ec2.clone())),
            nat_gateways: Arc::new(AwsNatGatewayGateway::new(ec2.clone())),
            instances: Arc::new(AwsInstanceGateway::new(ec2.clone())),
            key_pairs: Arc::new(AwsKeyPairStore::new(
                ec2.clone(),
                s3,
                settings.key_pair_bucket.clone(),
            )),
            mirrors: Arc::new(AwsMirrorGateway::new(ec2)),
        }
    }
}

/// Whether an EC2 error says the resource is already gone or detached.
/// Deletion paths treat those as success so repeated teardown converges.
pub(crate) fn missing_resource(err: &aws_sdk_ec2::Error) -> bool {
    err.code()
        .is_some_and(|code| code.contains("NotFound") || code.ends_with(".NotAttached"))
}

//! In-memory cloud for orchestration tests.
//!
//! [`FakeCloud`] implements every resource port over plain vectors behind
//! one mutex, so the lifecycle components can be exercised end to end
//! without credentials or network access. It mimics the provider
//! behaviors the orchestrator leans on: every VPC is born with a main
//! route table and a built-in `default` security group, peering
//! connections park in `pending-acceptance` until accepted, and deleting
//! a peering turns the routes through it into blackholes.
//!
//! Mutating calls are recorded in a write log (`writes`) so tests can
//! assert that a path made no provider writes, and any named operation
//! can be armed to fail (`fail_always`, `fail_times`) with a retryable
//! provider error.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{OrchestratorError, Result};
use crate::gateways::ResourceGateways;
use crate::instances::{InstancePort, InstanceRecord};
use crate::keypair::KeyPairPort;
use crate::mirror::MirrorPort;
use crate::netif::{NatGatewayPort, NetworkInterfacePort};
use crate::peering::{PeeringPort, PeeringRecord, PeeringState};
use crate::route_table::{
    RouteRecord, RouteTableAssociation, RouteTablePort, RouteTableRecord, RouteTarget,
};
use crate::security_group::{IngressRule, RuleSource, SecurityGroupPort, SecurityGroupRecord};
use crate::subnet::{SubnetPort, SubnetRecord};
use crate::tags::{NAME_TAG_KEY, RESERVATION_TAG_KEY, TYPE_TAG_KEY, TagSet};
use crate::vpc::{InternetGatewayPort, VpcPort, VpcRecord};

type Tags = Vec<(String, String)>;

fn tag_of<'a>(tags: &'a Tags, key: &str) -> Option<&'a str> {
    tags.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn merge_tags(existing: &mut Tags, incoming: &TagSet) {
    for (key, value) in incoming.pairs() {
        match existing.iter_mut().find(|(k, _)| k == key) {
            Some(pair) => pair.1 = value.clone(),
            None => existing.push((key.clone(), value.clone())),
        }
    }
}

/// Shallow shape check, enough to reject garbage like `500.0.0.0/99`.
fn valid_cidr(cidr: &str) -> bool {
    let Some((address, prefix)) = cidr.split_once('/') else {
        return false;
    };
    if !prefix.parse::<u8>().is_ok_and(|p| p <= 32) {
        return false;
    }
    let octets: Vec<&str> = address.split('.').collect();
    octets.len() == 4 && octets.iter().all(|o| o.parse::<u8>().is_ok())
}

struct FakeVpc {
    id: String,
    cidr: String,
    tags: Tags,
}

struct FakeInternetGateway {
    id: String,
    attached_vpc: Option<String>,
    tags: Tags,
}

struct FakeSubnet {
    id: String,
    vpc_id: String,
    cidr: String,
    availability_zone: String,
    tags: Tags,
}

struct FakeSecurityGroup {
    id: String,
    vpc_id: String,
    group_name: String,
    rules: Vec<IngressRule>,
    tags: Tags,
}

struct FakeRouteTable {
    id: String,
    vpc_id: String,
    routes: Vec<RouteRecord>,
    associations: Vec<RouteTableAssociation>,
    tags: Tags,
}

struct FakePeering {
    id: String,
    requester_vpc_id: String,
    accepter_vpc_id: String,
    state: PeeringState,
    tags: Tags,
}

struct FakeNetworkInterface {
    id: String,
    vpc_id: String,
    private_ip: String,
}

struct FakeNatGateway {
    id: String,
    subnet_id: String,
    private_ip: String,
}

struct FakeInstance {
    id: String,
    vpc_id: String,
    state: String,
}

#[derive(Default)]
struct State {
    next_id: u64,
    vpcs: Vec<FakeVpc>,
    internet_gateways: Vec<FakeInternetGateway>,
    subnets: Vec<FakeSubnet>,
    security_groups: Vec<FakeSecurityGroup>,
    route_tables: Vec<FakeRouteTable>,
    peerings: Vec<FakePeering>,
    interfaces: Vec<FakeNetworkInterface>,
    nat_gateways: Vec<FakeNatGateway>,
    instances: Vec<FakeInstance>,
    key_pairs: BTreeSet<String>,
    key_objects: BTreeSet<String>,
    mirrors: Vec<String>,
    writes: Vec<String>,
    failures: HashMap<String, u32>,
}

impl State {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:04x}", prefix, self.next_id)
    }

    fn record(&mut self, operation: &str, detail: &str) {
        self.writes.push(format!("{operation} {detail}"));
    }

    /// Every VPC arrives with its main route table (holding the local
    /// route) and the provider's built-in `default` group, like the real
    /// provider creates them.
    fn insert_vpc(&mut self, cidr: &str, tags: Tags) -> String {
        let vpc_id = self.next("vpc");
        let table_id = self.next("rtb");
        let association_id = self.next("rtbassoc");
        self.route_tables.push(FakeRouteTable {
            id: table_id,
            vpc_id: vpc_id.clone(),
            routes: vec![RouteRecord {
                destination: cidr.to_string(),
                target: None,
                blackhole: false,
            }],
            associations: vec![RouteTableAssociation {
                id: association_id,
                subnet_id: None,
                is_main: true,
            }],
            tags: Vec::new(),
        });
        let group_id = self.next("sg");
        self.security_groups.push(FakeSecurityGroup {
            id: group_id,
            vpc_id: vpc_id.clone(),
            group_name: "default".to_string(),
            rules: Vec::new(),
            tags: Vec::new(),
        });
        self.vpcs.push(FakeVpc {
            id: vpc_id.clone(),
            cidr: cidr.to_string(),
            tags,
        });
        vpc_id
    }

    fn insert_subnet(&mut self, vpc_id: &str, cidr: &str, zone: &str, tags: Tags) -> String {
        let subnet_id = self.next("subnet");
        self.subnets.push(FakeSubnet {
            id: subnet_id.clone(),
            vpc_id: vpc_id.to_string(),
            cidr: cidr.to_string(),
            availability_zone: zone.to_string(),
            tags,
        });
        subnet_id
    }

    fn vpc_record(vpc: &FakeVpc) -> VpcRecord {
        VpcRecord {
            id: vpc.id.clone(),
            cidr: vpc.cidr.clone(),
            state: "available".to_string(),
        }
    }

    fn subnet_record(subnet: &FakeSubnet) -> SubnetRecord {
        SubnetRecord {
            id: subnet.id.clone(),
            cidr: subnet.cidr.clone(),
            availability_zone: subnet.availability_zone.clone(),
            state: "available".to_string(),
            vpc_id: subnet.vpc_id.clone(),
            name: tag_of(&subnet.tags, NAME_TAG_KEY).map(str::to_string),
        }
    }

    fn group_record(group: &FakeSecurityGroup) -> SecurityGroupRecord {
        let referenced = group
            .rules
            .iter()
            .filter_map(|rule| match &rule.source {
                RuleSource::Group(id) => Some(id.clone()),
                RuleSource::Cidr(_) => None,
            })
            .collect();
        SecurityGroupRecord {
            id: group.id.clone(),
            group_name: group.group_name.clone(),
            vpc_id: group.vpc_id.clone(),
            referenced_group_ids: referenced,
            role: tag_of(&group.tags, TYPE_TAG_KEY).map(str::to_string),
        }
    }

    fn table_record(table: &FakeRouteTable) -> RouteTableRecord {
        RouteTableRecord {
            id: table.id.clone(),
            vpc_id: table.vpc_id.clone(),
            name: tag_of(&table.tags, NAME_TAG_KEY).map(str::to_string),
            routes: table.routes.clone(),
            associations: table.associations.clone(),
        }
    }

    fn peering_record(peering: &FakePeering) -> PeeringRecord {
        PeeringRecord {
            id: peering.id.clone(),
            state: peering.state.clone(),
            requester_vpc_id: peering.requester_vpc_id.clone(),
            accepter_vpc_id: peering.accepter_vpc_id.clone(),
        }
    }
}

/// An in-memory cloud account implementing every resource port.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<State>,
}

impl FakeCloud {
    /// An empty account.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake cloud state poisoned")
    }

    /// Fail the next attempt at `operation` and consume one armed
    /// failure; subsequent attempts succeed.
    fn gate(&self, operation: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(remaining) = state.failures.get_mut(operation) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(OrchestratorError::provider(format!(
                    "injected {operation} failure"
                )));
            }
        }
        Ok(())
    }

    /// Wire every gateway slot to this account.
    pub fn gateways(self: &Arc<Self>) -> ResourceGateways {
        ResourceGateways {
            vpcs: self.clone(),
            internet_gateways: self.clone(),
            subnets: self.clone(),
            security_groups: self.clone(),
            route_tables: self.clone(),
            peerings: self.clone(),
            interfaces: self.clone(),
            nat_gateways: self.clone(),
            instances: self.clone(),
            key_pairs: self.clone(),
            mirrors: self.clone(),
        }
    }

    // ---- failure injection ------------------------------------------

    /// Make every future call to `operation` fail.
    pub fn fail_always(&self, operation: &str) {
        self.lock().failures.insert(operation.to_string(), u32::MAX);
    }

    /// Make the next `times` calls to `operation` fail.
    pub fn fail_times(&self, operation: &str, times: u32) {
        self.lock().failures.insert(operation.to_string(), times);
    }

    // ---- seeding (bypasses the write log) ---------------------------

    /// An untagged VPC, like a pre-existing management network.
    pub fn seed_vpc(&self, cidr: &str) -> String {
        self.lock().insert_vpc(cidr, Vec::new())
    }

    /// A VPC carrying the given tags, like one a previous provisioning
    /// run created.
    pub fn seed_tagged_vpc(&self, tags: &TagSet, cidr: &str) -> String {
        self.lock().insert_vpc(cidr, tags.pairs().to_vec())
    }

    /// A subnet in the region's first availability zone.
    pub fn seed_subnet(&self, vpc_id: &str, cidr: &str) -> String {
        self.seed_subnet_in_zone(vpc_id, cidr, "us-east-1a")
    }

    /// A subnet pinned to a specific availability zone.
    pub fn seed_subnet_in_zone(&self, vpc_id: &str, cidr: &str, zone: &str) -> String {
        self.lock().insert_subnet(vpc_id, cidr, zone, Vec::new())
    }

    /// An extra route table, optionally carrying the main association.
    pub fn seed_route_table(&self, vpc_id: &str, main: bool) -> String {
        let mut state = self.lock();
        let table_id = state.next("rtb");
        let associations = if main {
            let association_id = state.next("rtbassoc");
            vec![RouteTableAssociation {
                id: association_id,
                subnet_id: None,
                is_main: true,
            }]
        } else {
            Vec::new()
        };
        state.route_tables.push(FakeRouteTable {
            id: table_id.clone(),
            vpc_id: vpc_id.to_string(),
            routes: Vec::new(),
            associations,
            tags: Vec::new(),
        });
        table_id
    }

    /// An internet gateway already attached to the VPC.
    pub fn seed_internet_gateway(&self, vpc_id: &str) -> String {
        let mut state = self.lock();
        let gateway_id = state.next("igw");
        state.internet_gateways.push(FakeInternetGateway {
            id: gateway_id.clone(),
            attached_vpc: Some(vpc_id.to_string()),
            tags: Vec::new(),
        });
        gateway_id
    }

    /// A network interface holding a private IP.
    pub fn seed_network_interface(&self, vpc_id: &str, private_ip: &str) -> String {
        let mut state = self.lock();
        let interface_id = state.next("eni");
        state.interfaces.push(FakeNetworkInterface {
            id: interface_id.clone(),
            vpc_id: vpc_id.to_string(),
            private_ip: private_ip.to_string(),
        });
        interface_id
    }

    /// A NAT gateway in a subnet holding a private IP.
    pub fn seed_nat_gateway(&self, subnet_id: &str, private_ip: &str) -> String {
        let mut state = self.lock();
        let nat_id = state.next("nat");
        state.nat_gateways.push(FakeNatGateway {
            id: nat_id.clone(),
            subnet_id: subnet_id.to_string(),
            private_ip: private_ip.to_string(),
        });
        nat_id
    }

    /// A peering connection tagged with the reservation id, in the
    /// given state.
    pub fn seed_peering(
        &self,
        reservation_id: &str,
        requester_vpc_id: &str,
        accepter_vpc_id: &str,
        state: PeeringState,
    ) -> String {
        let mut guard = self.lock();
        let peering_id = guard.next("pcx");
        guard.peerings.push(FakePeering {
            id: peering_id.clone(),
            requester_vpc_id: requester_vpc_id.to_string(),
            accepter_vpc_id: accepter_vpc_id.to_string(),
            state,
            tags: vec![(RESERVATION_TAG_KEY.to_string(), reservation_id.to_string())],
        });
        peering_id
    }

    /// An instance in the given lifecycle state.
    pub fn seed_instance(&self, vpc_id: &str, state: &str) -> String {
        let mut guard = self.lock();
        let instance_id = guard.next("i");
        guard.instances.push(FakeInstance {
            id: instance_id.clone(),
            vpc_id: vpc_id.to_string(),
            state: state.to_string(),
        });
        instance_id
    }

    /// A registered key pair.
    pub fn seed_key_pair(&self, name: &str) {
        self.lock().key_pairs.insert(name.to_string());
    }

    /// A stored private-key object.
    pub fn seed_key_object(&self, object_key: &str) {
        self.lock().key_objects.insert(object_key.to_string());
    }

    /// A traffic mirror session tagged with the reservation id.
    pub fn seed_mirror(&self, reservation_id: &str) {
        self.lock().mirrors.push(reservation_id.to_string());
    }

    // ---- inspection -------------------------------------------------

    /// Every mutating provider call made so far, in order. Seeds are
    /// not writes.
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    /// Number of VPCs in the account.
    pub fn vpc_count(&self) -> usize {
        self.lock().vpcs.len()
    }

    /// Whether the VPC still exists.
    pub fn vpc_exists(&self, vpc_id: &str) -> bool {
        self.lock().vpcs.iter().any(|v| v.id == vpc_id)
    }

    /// The VPC's CIDR, when it exists.
    pub fn vpc_cidr(&self, vpc_id: &str) -> Option<String> {
        self.lock()
            .vpcs
            .iter()
            .find(|v| v.id == vpc_id)
            .map(|v| v.cidr.clone())
    }

    /// Whether the subnet still exists.
    pub fn subnet_exists(&self, subnet_id: &str) -> bool {
        self.lock().subnets.iter().any(|s| s.id == subnet_id)
    }

    /// All subnets of a VPC.
    pub fn subnets_for_vpc(&self, vpc_id: &str) -> Vec<SubnetRecord> {
        self.lock()
            .subnets
            .iter()
            .filter(|s| s.vpc_id == vpc_id)
            .map(State::subnet_record)
            .collect()
    }

    /// Whether the security group still exists.
    pub fn group_exists(&self, group_id: &str) -> bool {
        self.lock().security_groups.iter().any(|g| g.id == group_id)
    }

    /// Security groups tagged with the reservation id.
    pub fn security_groups_for_reservation(
        &self,
        reservation_id: &str,
    ) -> Vec<SecurityGroupRecord> {
        self.lock()
            .security_groups
            .iter()
            .filter(|g| tag_of(&g.tags, RESERVATION_TAG_KEY) == Some(reservation_id))
            .map(State::group_record)
            .collect()
    }

    /// A route table snapshot by id.
    pub fn route_table(&self, route_table_id: &str) -> Option<RouteTableRecord> {
        self.lock()
            .route_tables
            .iter()
            .find(|t| t.id == route_table_id)
            .map(State::table_record)
    }

    /// All route table snapshots of a VPC.
    pub fn route_tables_for_vpc(&self, vpc_id: &str) -> Vec<RouteTableRecord> {
        self.lock()
            .route_tables
            .iter()
            .filter(|t| t.vpc_id == vpc_id)
            .map(State::table_record)
            .collect()
    }

    /// The VPC's route table carrying a display name, if any.
    pub fn route_table_named(&self, vpc_id: &str, name: &str) -> Option<RouteTableRecord> {
        self.lock()
            .route_tables
            .iter()
            .find(|t| t.vpc_id == vpc_id && tag_of(&t.tags, NAME_TAG_KEY) == Some(name))
            .map(State::table_record)
    }

    /// Peering connections tagged with the reservation id, whatever
    /// their state.
    pub fn peering_count(&self, reservation_id: &str) -> usize {
        self.lock()
            .peerings
            .iter()
            .filter(|p| tag_of(&p.tags, RESERVATION_TAG_KEY) == Some(reservation_id))
            .count()
    }

    /// Whether the key pair is still registered.
    pub fn key_pair_exists(&self, name: &str) -> bool {
        self.lock().key_pairs.contains(name)
    }

    /// Whether the stored private-key object still exists.
    pub fn key_object_exists(&self, object_key: &str) -> bool {
        self.lock().key_objects.contains(object_key)
    }

    /// Traffic mirror sessions remaining in the account.
    pub fn mirror_count(&self) -> usize {
        self.lock().mirrors.len()
    }
}

#[async_trait]
impl VpcPort for FakeCloud {
    async fn find_by_name(&self, name: &str) -> Result<Vec<VpcRecord>> {
        Ok(self
            .lock()
            .vpcs
            .iter()
            .filter(|v| tag_of(&v.tags, NAME_TAG_KEY) == Some(name))
            .map(State::vpc_record)
            .collect())
    }

    async fn get(&self, vpc_id: &str) -> Result<Option<VpcRecord>> {
        Ok(self
            .lock()
            .vpcs
            .iter()
            .find(|v| v.id == vpc_id)
            .map(State::vpc_record))
    }

    async fn create(&self, cidr: &str, tags: &TagSet) -> Result<VpcRecord> {
        self.gate("create_vpc")?;
        if !valid_cidr(cidr) {
            return Err(OrchestratorError::provider(format!(
                "malformed CIDR block {cidr}"
            )));
        }
        let mut state = self.lock();
        let vpc_id = state.insert_vpc(cidr, tags.pairs().to_vec());
        state.record("create_vpc", &vpc_id);
        Ok(VpcRecord {
            id: vpc_id,
            cidr: cidr.to_string(),
            state: "available".to_string(),
        })
    }

    async fn count_in_region(&self) -> Result<usize> {
        Ok(self.lock().vpcs.len())
    }

    async fn enable_dns_hostnames(&self, vpc_id: &str) -> Result<()> {
        self.gate("enable_dns_hostnames")?;
        let mut state = self.lock();
        if !state.vpcs.iter().any(|v| v.id == vpc_id) {
            return Err(OrchestratorError::provider(format!(
                "VPC {vpc_id} does not exist"
            )));
        }
        state.record("enable_dns_hostnames", vpc_id);
        Ok(())
    }

    async fn delete(&self, vpc_id: &str) -> Result<()> {
        self.gate("delete_vpc")?;
        let mut state = self.lock();
        state.vpcs.retain(|v| v.id != vpc_id);
        // Dependent resources fall with the VPC.
        state.route_tables.retain(|t| t.vpc_id != vpc_id);
        state.subnets.retain(|s| s.vpc_id != vpc_id);
        state.security_groups.retain(|g| g.vpc_id != vpc_id);
        for gateway in &mut state.internet_gateways {
            if gateway.attached_vpc.as_deref() == Some(vpc_id) {
                gateway.attached_vpc = None;
            }
        }
        state.record("delete_vpc", vpc_id);
        Ok(())
    }
}

#[async_trait]
impl InternetGatewayPort for FakeCloud {
    async fn find_attached(&self, vpc_id: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .internet_gateways
            .iter()
            .filter(|g| g.attached_vpc.as_deref() == Some(vpc_id))
            .map(|g| g.id.clone())
            .collect())
    }

    async fn create(&self, tags: &TagSet) -> Result<String> {
        self.gate("create_internet_gateway")?;
        let mut state = self.lock();
        let gateway_id = state.next("igw");
        state.internet_gateways.push(FakeInternetGateway {
            id: gateway_id.clone(),
            attached_vpc: None,
            tags: tags.pairs().to_vec(),
        });
        state.record("create_internet_gateway", &gateway_id);
        Ok(gateway_id)
    }

    async fn attach(&self, gateway_id: &str, vpc_id: &str) -> Result<()> {
        self.gate("attach_internet_gateway")?;
        let mut state = self.lock();
        let gateway = state
            .internet_gateways
            .iter_mut()
            .find(|g| g.id == gateway_id)
            .ok_or_else(|| {
                OrchestratorError::provider(format!("internet gateway {gateway_id} does not exist"))
            })?;
        gateway.attached_vpc = Some(vpc_id.to_string());
        state.record("attach_internet_gateway", gateway_id);
        Ok(())
    }

    async fn detach(&self, gateway_id: &str, _vpc_id: &str) -> Result<()> {
        self.gate("detach_internet_gateway")?;
        let mut state = self.lock();
        if let Some(gateway) = state
            .internet_gateways
            .iter_mut()
            .find(|g| g.id == gateway_id)
        {
            gateway.attached_vpc = None;
        }
        state.record("detach_internet_gateway", gateway_id);
        Ok(())
    }

    async fn delete(&self, gateway_id: &str) -> Result<()> {
        self.gate("delete_internet_gateway")?;
        let mut state = self.lock();
        state.internet_gateways.retain(|g| g.id != gateway_id);
        state.record("delete_internet_gateway", gateway_id);
        Ok(())
    }

    async fn tag(&self, gateway_id: &str, tags: &TagSet) -> Result<()> {
        self.gate("tag_internet_gateway")?;
        let mut state = self.lock();
        if let Some(gateway) = state
            .internet_gateways
            .iter_mut()
            .find(|g| g.id == gateway_id)
        {
            merge_tags(&mut gateway.tags, tags);
        }
        state.record("tag_internet_gateway", gateway_id);
        Ok(())
    }
}

#[async_trait]
impl SubnetPort for FakeCloud {
    async fn find_by_cidr(&self, vpc_id: &str, cidr: &str) -> Result<Option<SubnetRecord>> {
        Ok(self
            .lock()
            .subnets
            .iter()
            .find(|s| s.vpc_id == vpc_id && s.cidr == cidr)
            .map(State::subnet_record))
    }

    async fn list_by_vpc(&self, vpc_id: &str) -> Result<Vec<SubnetRecord>> {
        Ok(self.subnets_for_vpc(vpc_id))
    }

    async fn get(&self, subnet_id: &str) -> Result<Option<SubnetRecord>> {
        Ok(self
            .lock()
            .subnets
            .iter()
            .find(|s| s.id == subnet_id)
            .map(State::subnet_record))
    }

    async fn create(
        &self,
        vpc_id: &str,
        cidr: &str,
        availability_zone: &str,
    ) -> Result<SubnetRecord> {
        self.gate("create_subnet")?;
        if !valid_cidr(cidr) {
            return Err(OrchestratorError::provider(format!(
                "malformed CIDR block {cidr}"
            )));
        }
        let mut state = self.lock();
        if !state.vpcs.iter().any(|v| v.id == vpc_id) {
            return Err(OrchestratorError::provider(format!(
                "VPC {vpc_id} does not exist"
            )));
        }
        let subnet_id = state.insert_subnet(vpc_id, cidr, availability_zone, Vec::new());
        state.record("create_subnet", &subnet_id);
        Ok(SubnetRecord {
            id: subnet_id,
            cidr: cidr.to_string(),
            availability_zone: availability_zone.to_string(),
            state: "available".to_string(),
            vpc_id: vpc_id.to_string(),
            name: None,
        })
    }

    async fn tag(&self, subnet_id: &str, tags: &TagSet) -> Result<()> {
        self.gate("tag_subnet")?;
        let mut state = self.lock();
        if let Some(subnet) = state.subnets.iter_mut().find(|s| s.id == subnet_id) {
            merge_tags(&mut subnet.tags, tags);
        }
        state.record("tag_subnet", subnet_id);
        Ok(())
    }

    async fn delete(&self, subnet_id: &str) -> Result<()> {
        self.gate("delete_subnet")?;
        let mut state = self.lock();
        state.subnets.retain(|s| s.id != subnet_id);
        // The provider drops the subnet's explicit associations with it.
        for table in &mut state.route_tables {
            table
                .associations
                .retain(|a| a.subnet_id.as_deref() != Some(subnet_id));
        }
        state.record("delete_subnet", subnet_id);
        Ok(())
    }

    async fn first_availability_zone(&self) -> Result<String> {
        Ok("us-east-1a".to_string())
    }
}

#[async_trait]
impl SecurityGroupPort for FakeCloud {
    async fn find_by_role(
        &self,
        reservation_id: &str,
        role_marker: &str,
    ) -> Result<Option<SecurityGroupRecord>> {
        Ok(self
            .lock()
            .security_groups
            .iter()
            .find(|g| {
                tag_of(&g.tags, RESERVATION_TAG_KEY) == Some(reservation_id)
                    && tag_of(&g.tags, TYPE_TAG_KEY) == Some(role_marker)
            })
            .map(State::group_record))
    }

    async fn list_by_vpc(&self, vpc_id: &str) -> Result<Vec<SecurityGroupRecord>> {
        Ok(self
            .lock()
            .security_groups
            .iter()
            .filter(|g| g.vpc_id == vpc_id)
            .map(State::group_record)
            .collect())
    }

    async fn create(
        &self,
        vpc_id: &str,
        name: &str,
        _description: &str,
        tags: &TagSet,
    ) -> Result<String> {
        self.gate("create_security_group")?;
        let mut state = self.lock();
        let group_id = state.next("sg");
        state.security_groups.push(FakeSecurityGroup {
            id: group_id.clone(),
            vpc_id: vpc_id.to_string(),
            group_name: name.to_string(),
            rules: Vec::new(),
            tags: tags.pairs().to_vec(),
        });
        state.record("create_security_group", &group_id);
        Ok(group_id)
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<()> {
        if rules.is_empty() {
            return Ok(());
        }
        self.gate("authorize_ingress")?;
        let mut state = self.lock();
        let group = state
            .security_groups
            .iter_mut()
            .find(|g| g.id == group_id)
            .ok_or_else(|| {
                OrchestratorError::provider(format!("security group {group_id} does not exist"))
            })?;
        // Duplicate rules converge silently, like the provider.
        for rule in rules {
            if !group.rules.contains(rule) {
                group.rules.push(rule.clone());
            }
        }
        state.record("authorize_ingress", group_id);
        Ok(())
    }

    async fn revoke_all_ingress(&self, group_id: &str) -> Result<()> {
        self.gate("revoke_all_ingress")?;
        let mut state = self.lock();
        if let Some(group) = state.security_groups.iter_mut().find(|g| g.id == group_id) {
            group.rules.clear();
        }
        state.record("revoke_all_ingress", group_id);
        Ok(())
    }

    async fn delete(&self, group_id: &str) -> Result<()> {
        self.gate("delete_security_group")?;
        let mut state = self.lock();
        state.security_groups.retain(|g| g.id != group_id);
        state.record("delete_security_group", group_id);
        Ok(())
    }
}

#[async_trait]
impl RouteTablePort for FakeCloud {
    async fn get(&self, route_table_id: &str) -> Result<Option<RouteTableRecord>> {
        Ok(self.route_table(route_table_id))
    }

    async fn main_for_vpc(&self, vpc_id: &str) -> Result<Option<RouteTableRecord>> {
        Ok(self
            .lock()
            .route_tables
            .iter()
            .find(|t| t.vpc_id == vpc_id && t.associations.iter().any(|a| a.is_main))
            .map(State::table_record))
    }

    async fn list_by_vpc(&self, vpc_id: &str) -> Result<Vec<RouteTableRecord>> {
        Ok(self.route_tables_for_vpc(vpc_id))
    }

    async fn find_by_name(&self, vpc_id: &str, name: &str) -> Result<Option<RouteTableRecord>> {
        Ok(self.route_table_named(vpc_id, name))
    }

    async fn create(&self, vpc_id: &str, tags: &TagSet) -> Result<RouteTableRecord> {
        self.gate("create_route_table")?;
        let mut state = self.lock();
        let table_id = state.next("rtb");
        state.route_tables.push(FakeRouteTable {
            id: table_id.clone(),
            vpc_id: vpc_id.to_string(),
            routes: Vec::new(),
            associations: Vec::new(),
            tags: tags.pairs().to_vec(),
        });
        state.record("create_route_table", &table_id);
        Ok(RouteTableRecord {
            id: table_id,
            vpc_id: vpc_id.to_string(),
            name: tags.name().map(str::to_string),
            routes: Vec::new(),
            associations: Vec::new(),
        })
    }

    async fn tag(&self, route_table_id: &str, tags: &TagSet) -> Result<()> {
        self.gate("tag_route_table")?;
        let mut state = self.lock();
        if let Some(table) = state
            .route_tables
            .iter_mut()
            .find(|t| t.id == route_table_id)
        {
            merge_tags(&mut table.tags, tags);
        }
        state.record("tag_route_table", route_table_id);
        Ok(())
    }

    async fn create_route(
        &self,
        route_table_id: &str,
        destination: &str,
        target: &RouteTarget,
    ) -> Result<()> {
        self.gate("create_route")?;
        let mut state = self.lock();
        let table = state
            .route_tables
            .iter_mut()
            .find(|t| t.id == route_table_id)
            .ok_or_else(|| {
                OrchestratorError::provider(format!("route table {route_table_id} does not exist"))
            })?;
        table.routes.push(RouteRecord {
            destination: destination.to_string(),
            target: Some(target.clone()),
            blackhole: false,
        });
        state.record("create_route", route_table_id);
        Ok(())
    }

    async fn replace_route(
        &self,
        route_table_id: &str,
        destination: &str,
        target: &RouteTarget,
    ) -> Result<()> {
        self.gate("replace_route")?;
        let mut state = self.lock();
        let route = state
            .route_tables
            .iter_mut()
            .find(|t| t.id == route_table_id)
            .and_then(|t| t.routes.iter_mut().find(|r| r.destination == destination))
            .ok_or_else(|| {
                OrchestratorError::provider(format!(
                    "route table {route_table_id} has no route to {destination}"
                ))
            })?;
        route.target = Some(target.clone());
        route.blackhole = false;
        state.record("replace_route", route_table_id);
        Ok(())
    }

    async fn delete_route(&self, route_table_id: &str, destination: &str) -> Result<()> {
        self.gate("delete_route")?;
        let mut state = self.lock();
        if let Some(table) = state
            .route_tables
            .iter_mut()
            .find(|t| t.id == route_table_id)
        {
            table.routes.retain(|r| r.destination != destination);
        }
        state.record("delete_route", route_table_id);
        Ok(())
    }

    async fn associate(&self, route_table_id: &str, subnet_id: &str) -> Result<String> {
        self.gate("associate_route_table")?;
        let mut state = self.lock();
        if !state.subnets.iter().any(|s| s.id == subnet_id) {
            return Err(OrchestratorError::provider(format!(
                "subnet {subnet_id} does not exist"
            )));
        }
        let association_id = state.next("rtbassoc");
        let table = state
            .route_tables
            .iter_mut()
            .find(|t| t.id == route_table_id)
            .ok_or_else(|| {
                OrchestratorError::provider(format!("route table {route_table_id} does not exist"))
            })?;
        table.associations.push(RouteTableAssociation {
            id: association_id.clone(),
            subnet_id: Some(subnet_id.to_string()),
            is_main: false,
        });
        state.record("associate_route_table", route_table_id);
        Ok(association_id)
    }

    async fn replace_association(
        &self,
        association_id: &str,
        route_table_id: &str,
    ) -> Result<String> {
        self.gate("replace_route_table_association")?;
        let mut state = self.lock();
        let mut moved_subnet = None;
        for table in &mut state.route_tables {
            if let Some(position) = table
                .associations
                .iter()
                .position(|a| a.id == association_id)
            {
                moved_subnet = table.associations.remove(position).subnet_id;
                break;
            }
        }
        let subnet_id = moved_subnet.ok_or_else(|| {
            OrchestratorError::provider(format!("association {association_id} does not exist"))
        })?;
        let replacement_id = state.next("rtbassoc");
        let table = state
            .route_tables
            .iter_mut()
            .find(|t| t.id == route_table_id)
            .ok_or_else(|| {
                OrchestratorError::provider(format!("route table {route_table_id} does not exist"))
            })?;
        table.associations.push(RouteTableAssociation {
            id: replacement_id.clone(),
            subnet_id: Some(subnet_id),
            is_main: false,
        });
        state.record("replace_route_table_association", route_table_id);
        Ok(replacement_id)
    }

    async fn disassociate(&self, association_id: &str) -> Result<()> {
        self.gate("disassociate_route_table")?;
        let mut state = self.lock();
        for table in &mut state.route_tables {
            table.associations.retain(|a| a.id != association_id);
        }
        state.record("disassociate_route_table", association_id);
        Ok(())
    }

    async fn delete(&self, route_table_id: &str) -> Result<()> {
        self.gate("delete_route_table")?;
        let mut state = self.lock();
        state.route_tables.retain(|t| t.id != route_table_id);
        state.record("delete_route_table", route_table_id);
        Ok(())
    }
}

#[async_trait]
impl PeeringPort for FakeCloud {
    async fn find_by_reservation(&self, reservation_id: &str) -> Result<Vec<PeeringRecord>> {
        Ok(self
            .lock()
            .peerings
            .iter()
            .filter(|p| tag_of(&p.tags, RESERVATION_TAG_KEY) == Some(reservation_id))
            .map(State::peering_record)
            .collect())
    }

    async fn get(&self, peering_id: &str) -> Result<Option<PeeringRecord>> {
        Ok(self
            .lock()
            .peerings
            .iter()
            .find(|p| p.id == peering_id)
            .map(State::peering_record))
    }

    async fn create(
        &self,
        requester_vpc_id: &str,
        accepter_vpc_id: &str,
        tags: &TagSet,
    ) -> Result<PeeringRecord> {
        self.gate("create_peering")?;
        let mut state = self.lock();
        let peering_id = state.next("pcx");
        state.peerings.push(FakePeering {
            id: peering_id.clone(),
            requester_vpc_id: requester_vpc_id.to_string(),
            accepter_vpc_id: accepter_vpc_id.to_string(),
            state: PeeringState::PendingAcceptance,
            tags: tags.pairs().to_vec(),
        });
        state.record("create_peering", &peering_id);
        Ok(PeeringRecord {
            id: peering_id,
            state: PeeringState::PendingAcceptance,
            requester_vpc_id: requester_vpc_id.to_string(),
            accepter_vpc_id: accepter_vpc_id.to_string(),
        })
    }

    async fn accept(&self, peering_id: &str) -> Result<()> {
        self.gate("accept_peering")?;
        let mut state = self.lock();
        let peering = state
            .peerings
            .iter_mut()
            .find(|p| p.id == peering_id)
            .ok_or_else(|| {
                OrchestratorError::provider(format!(
                    "peering connection {peering_id} does not exist"
                ))
            })?;
        peering.state = PeeringState::Active;
        state.record("accept_peering", peering_id);
        Ok(())
    }

    async fn delete(&self, peering_id: &str) -> Result<()> {
        self.gate("delete_peering")?;
        let mut state = self.lock();
        state.peerings.retain(|p| p.id != peering_id);
        // Routes through a dead peering turn into blackholes.
        for table in &mut state.route_tables {
            for route in &mut table.routes {
                if route.target == Some(RouteTarget::Peering(peering_id.to_string())) {
                    route.blackhole = true;
                }
            }
        }
        state.record("delete_peering", peering_id);
        Ok(())
    }
}

#[async_trait]
impl NetworkInterfacePort for FakeCloud {
    async fn find_by_private_ip(
        &self,
        vpc_id: &str,
        private_ip: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .lock()
            .interfaces
            .iter()
            .find(|i| i.vpc_id == vpc_id && i.private_ip == private_ip)
            .map(|i| i.id.clone()))
    }
}

#[async_trait]
impl NatGatewayPort for FakeCloud {
    async fn find_by_private_ip(
        &self,
        subnet_id: &str,
        private_ip: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .lock()
            .nat_gateways
            .iter()
            .find(|n| n.subnet_id == subnet_id && n.private_ip == private_ip)
            .map(|n| n.id.clone()))
    }
}

#[async_trait]
impl InstancePort for FakeCloud {
    async fn list_by_vpc(&self, vpc_id: &str) -> Result<Vec<InstanceRecord>> {
        Ok(self
            .lock()
            .instances
            .iter()
            .filter(|i| i.vpc_id == vpc_id)
            .map(|i| InstanceRecord {
                id: i.id.clone(),
                state: i.state.clone(),
            })
            .collect())
    }

    async fn release_addresses(&self, instance_id: &str) -> Result<()> {
        self.gate("release_addresses")?;
        self.lock().record("release_addresses", instance_id);
        Ok(())
    }

    async fn terminate(&self, instance_ids: &[String]) -> Result<()> {
        self.gate("terminate_instances")?;
        let mut state = self.lock();
        for instance in &mut state.instances {
            if instance_ids.contains(&instance.id) {
                instance.state = "terminated".to_string();
            }
        }
        state.record("terminate_instances", &instance_ids.join(","));
        Ok(())
    }
}

#[async_trait]
impl KeyPairPort for FakeCloud {
    async fn remove(&self, key_pair_name: &str, object_key: &str) -> Result<()> {
        self.gate("remove_key_pair")?;
        let mut state = self.lock();
        state.key_objects.remove(object_key);
        state.key_pairs.remove(key_pair_name);
        state.record("remove_key_pair", key_pair_name);
        Ok(())
    }
}

#[async_trait]
impl MirrorPort for FakeCloud {
    async fn delete_for_reservation(&self, reservation_id: &str) -> Result<()> {
        self.gate("delete_mirror_sessions")?;
        let mut state = self.lock();
        state.mirrors.retain(|rid| rid != reservation_id);
        state.record("delete_mirror_sessions", reservation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_shape_check() {
        assert!(valid_cidr("10.0.1.0/24"));
        assert!(valid_cidr("0.0.0.0/0"));
        assert!(!valid_cidr("500.0.0.0/99"));
        assert!(!valid_cidr("10.0.1.0"));
        assert!(!valid_cidr("10.0.1/24"));
    }

    #[tokio::test]
    async fn seeds_do_not_count_as_writes() {
        let cloud = FakeCloud::new();
        let vpc = cloud.seed_vpc("10.0.0.0/16");
        cloud.seed_subnet(&vpc, "10.0.1.0/24");
        assert!(cloud.writes().is_empty());

        SubnetPort::create(&cloud, &vpc, "10.0.2.0/24", "us-east-1a")
            .await
            .unwrap();
        assert_eq!(cloud.writes().len(), 1);
    }

    #[tokio::test]
    async fn nat_gateways_resolve_by_subnet_and_ip() {
        let cloud = FakeCloud::new();
        let vpc = cloud.seed_vpc("10.0.0.0/16");
        let subnet = cloud.seed_subnet(&vpc, "10.0.1.0/24");
        let nat = cloud.seed_nat_gateway(&subnet, "10.0.1.5");

        let found = NatGatewayPort::find_by_private_ip(&cloud, &subnet, "10.0.1.5")
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some(nat.as_str()));
        let missing = NatGatewayPort::find_by_private_ip(&cloud, &subnet, "10.0.1.99")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn armed_failures_expire_after_their_count() {
        let cloud = FakeCloud::new();
        let vpc = cloud.seed_vpc("10.0.0.0/16");
        let subnet = cloud.seed_subnet(&vpc, "10.0.1.0/24");

        cloud.fail_times("delete_subnet", 1);
        assert!(SubnetPort::delete(&cloud, &subnet).await.is_err());
        assert!(SubnetPort::delete(&cloud, &subnet).await.is_ok());
        assert!(!cloud.subnet_exists(&subnet));
    }
}

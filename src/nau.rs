//! Network Address Usage accounting.
//!
//! Computes the NAU units consumed by each VPC in a region from an
//! inventory of its networking resources. The weights follow the
//! provider's published table; the inventory itself comes through the
//! [`VpcInventory`] capability so collection stays swappable per backend
//! or test fake.

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

/// Resource kinds that consume NAU units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Ipv4Ipv6Address,
    Eni,
    PrefixAssignedToEni,
    NetworkLoadBalancerPerAz,
    GatewayLoadBalancerPerAz,
    VpcEndpointPerAz,
    TransitGatewayAttachment,
    LambdaFunction,
    NatGateway,
    EfsMountTarget,
    EfaInterface,
    EksPod,
}

impl ResourceKey {
    /// NAU units one instance of this resource consumes.
    pub fn weight(&self) -> i64 {
        match self {
            Self::Ipv4Ipv6Address => 1,
            Self::Eni => 1,
            Self::PrefixAssignedToEni => 1,
            Self::NetworkLoadBalancerPerAz => 6,
            Self::GatewayLoadBalancerPerAz => 6,
            Self::VpcEndpointPerAz => 6,
            Self::TransitGatewayAttachment => 6,
            Self::LambdaFunction => 6,
            Self::NatGateway => 6,
            Self::EfsMountTarget => 6,
            Self::EfaInterface => 1,
            Self::EksPod => 1,
        }
    }
}

/// Interface flavor of a network interface, driving its base weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterfaceKind {
    #[default]
    Standard,
    Lambda,
    Efa,
    Branch,
}

/// One private address attached to an interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrivateIp {
    pub has_public_association: bool,
}

/// Inventory view of one network interface.
#[derive(Debug, Clone, Default)]
pub struct NetworkInterface {
    pub kind: InterfaceKind,
    pub private_ips: Vec<PrivateIp>,
    pub ipv6_address_count: usize,
    pub ipv4_prefix_count: usize,
    pub ipv6_prefix_count: usize,
}

/// Inventory view of one VPC endpoint.
#[derive(Debug, Clone, Default)]
pub struct VpcEndpoint {
    /// Interface endpoints attach one subnet per AZ.
    pub subnet_count: usize,
    /// Gateway endpoints register one route table per AZ.
    pub route_table_count: usize,
}

/// Load balancer flavor, driving the per-AZ weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancerKind {
    #[default]
    Network,
    Gateway,
}

/// Inventory view of one load balancer.
#[derive(Debug, Clone, Default)]
pub struct LoadBalancer {
    pub vpc_id: String,
    pub kind: LoadBalancerKind,
    pub az_count: usize,
}

/// Regional inventory the calculator consumes. Implementations page
/// through the backing APIs; the calculator only sees complete lists.
#[async_trait]
pub trait VpcInventory: Send + Sync {
    /// The region this inventory is bound to.
    fn region(&self) -> &str;

    /// Every VPC id in the region.
    async fn vpc_ids(&self) -> Result<Vec<String>>;

    /// Network interfaces attached inside one VPC.
    async fn network_interfaces(&self, vpc_id: &str) -> Result<Vec<NetworkInterface>>;

    /// Number of NAT gateways in one VPC.
    async fn nat_gateway_count(&self, vpc_id: &str) -> Result<usize>;

    /// Endpoints in one VPC.
    async fn vpc_endpoints(&self, vpc_id: &str) -> Result<Vec<VpcEndpoint>>;

    /// Every load balancer in the region; the calculator filters by VPC.
    async fn load_balancers(&self) -> Result<Vec<LoadBalancer>>;

    /// Number of transit gateway attachments bound to one VPC.
    async fn transit_gateway_attachment_count(&self, vpc_id: &str) -> Result<usize>;

    /// Subnet ids belonging to one VPC.
    async fn subnet_ids(&self, vpc_id: &str) -> Result<Vec<String>>;

    /// Subnet id of every file system mount target in the region.
    async fn mount_target_subnet_ids(&self) -> Result<Vec<String>>;
}

/// Units consumed by one network interface: a base weight per interface
/// kind, one unit per private address (doubled for a public association),
/// per IPv6 address, and per assigned prefix. Lambda-managed interfaces
/// carry a flat weight with no per-address charge.
pub fn interface_units(eni: &NetworkInterface) -> i64 {
    let mut units = match eni.kind {
        InterfaceKind::Lambda => return ResourceKey::LambdaFunction.weight(),
        InterfaceKind::Efa => ResourceKey::EfaInterface.weight(),
        InterfaceKind::Branch => ResourceKey::EksPod.weight(),
        InterfaceKind::Standard => ResourceKey::Eni.weight(),
    };

    for ip in &eni.private_ips {
        units += ResourceKey::Ipv4Ipv6Address.weight();
        if ip.has_public_association {
            units += ResourceKey::Ipv4Ipv6Address.weight();
        }
    }

    units += eni.ipv6_address_count as i64 * ResourceKey::Ipv4Ipv6Address.weight();
    units += (eni.ipv4_prefix_count + eni.ipv6_prefix_count) as i64
        * ResourceKey::PrefixAssignedToEni.weight();

    units
}

/// Units consumed by one endpoint: the per-AZ weight times the AZ count,
/// inferred from subnets (interface endpoints) or route tables (gateway
/// endpoints), defaulting to one AZ when neither is reported.
pub fn endpoint_units(endpoint: &VpcEndpoint) -> i64 {
    let az_count = if endpoint.subnet_count > 0 {
        endpoint.subnet_count
    } else if endpoint.route_table_count > 0 {
        endpoint.route_table_count
    } else {
        1
    };

    az_count as i64 * ResourceKey::VpcEndpointPerAz.weight()
}

/// Units consumed by one load balancer: the kind's per-AZ weight times
/// its AZ count.
pub fn load_balancer_units(lb: &LoadBalancer) -> i64 {
    let weight = match lb.kind {
        LoadBalancerKind::Network => ResourceKey::NetworkLoadBalancerPerAz.weight(),
        LoadBalancerKind::Gateway => ResourceKey::GatewayLoadBalancerPerAz.weight(),
    };
    lb.az_count as i64 * weight
}

/// Computes total NAU units for every VPC in the inventory's region.
pub async fn calculate_vpc_nau(inventory: &dyn VpcInventory) -> Result<BTreeMap<String, i64>> {
    let mut totals = BTreeMap::new();

    info!(region = inventory.region(), "starting VPC NAU discovery");

    let mount_target_subnets: Vec<String> = inventory.mount_target_subnet_ids().await?;

    for vpc_id in inventory.vpc_ids().await? {
        let mut total = 0i64;

        for eni in inventory.network_interfaces(&vpc_id).await? {
            total += interface_units(&eni);
        }

        total += inventory.nat_gateway_count(&vpc_id).await? as i64
            * ResourceKey::NatGateway.weight();

        for endpoint in inventory.vpc_endpoints(&vpc_id).await? {
            total += endpoint_units(&endpoint);
        }

        for lb in inventory.load_balancers().await? {
            if lb.vpc_id == vpc_id {
                total += load_balancer_units(&lb);
            }
        }

        total += inventory.transit_gateway_attachment_count(&vpc_id).await? as i64
            * ResourceKey::TransitGatewayAttachment.weight();

        // Mount targets count only when they land in this VPC's subnets.
        let subnets: HashSet<String> = inventory.subnet_ids(&vpc_id).await?.into_iter().collect();
        total += mount_target_subnets
            .iter()
            .filter(|subnet| subnets.contains(subnet.as_str()))
            .count() as i64
            * ResourceKey::EfsMountTarget.weight();

        debug!(region = inventory.region(), vpc = %vpc_id, total, "VPC NAU computed");
        totals.insert(vpc_id, total);
    }

    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeInventory {
        vpcs: Vec<String>,
        interfaces: Vec<(String, NetworkInterface)>,
        nat_gateways: usize,
        endpoints: Vec<(String, VpcEndpoint)>,
        load_balancers: Vec<LoadBalancer>,
        tgw_attachments: usize,
        subnets: Vec<(String, String)>,
        mount_target_subnets: Vec<String>,
    }

    #[async_trait]
    impl VpcInventory for FakeInventory {
        fn region(&self) -> &str {
            "us-east-1"
        }

        async fn vpc_ids(&self) -> Result<Vec<String>> {
            Ok(self.vpcs.clone())
        }

        async fn network_interfaces(&self, vpc_id: &str) -> Result<Vec<NetworkInterface>> {
            Ok(self
                .interfaces
                .iter()
                .filter(|(vpc, _)| vpc == vpc_id)
                .map(|(_, eni)| eni.clone())
                .collect())
        }

        async fn nat_gateway_count(&self, _vpc_id: &str) -> Result<usize> {
            Ok(self.nat_gateways)
        }

        async fn vpc_endpoints(&self, vpc_id: &str) -> Result<Vec<VpcEndpoint>> {
            Ok(self
                .endpoints
                .iter()
                .filter(|(vpc, _)| vpc == vpc_id)
                .map(|(_, ep)| ep.clone())
                .collect())
        }

        async fn load_balancers(&self) -> Result<Vec<LoadBalancer>> {
            Ok(self.load_balancers.clone())
        }

        async fn transit_gateway_attachment_count(&self, _vpc_id: &str) -> Result<usize> {
            Ok(self.tgw_attachments)
        }

        async fn subnet_ids(&self, vpc_id: &str) -> Result<Vec<String>> {
            Ok(self
                .subnets
                .iter()
                .filter(|(vpc, _)| vpc == vpc_id)
                .map(|(_, subnet)| subnet.clone())
                .collect())
        }

        async fn mount_target_subnet_ids(&self) -> Result<Vec<String>> {
            Ok(self.mount_target_subnets.clone())
        }
    }

    #[test]
    fn test_standard_interface_units() {
        // Base 1 + private IP 1 + public association 1 + IPv6 1 + two prefixes 2 = 6.
        let eni = NetworkInterface {
            kind: InterfaceKind::Standard,
            private_ips: vec![PrivateIp {
                has_public_association: true,
            }],
            ipv6_address_count: 1,
            ipv4_prefix_count: 1,
            ipv6_prefix_count: 1,
        };
        assert_eq!(interface_units(&eni), 6);
    }

    #[test]
    fn test_lambda_interface_is_flat_weight() {
        let eni = NetworkInterface {
            kind: InterfaceKind::Lambda,
            private_ips: vec![PrivateIp::default(); 3],
            ..Default::default()
        };
        assert_eq!(interface_units(&eni), 6);
    }

    #[test]
    fn test_efa_and_branch_interfaces() {
        let efa = NetworkInterface {
            kind: InterfaceKind::Efa,
            private_ips: vec![PrivateIp::default()],
            ..Default::default()
        };
        assert_eq!(interface_units(&efa), 2);

        let branch = NetworkInterface {
            kind: InterfaceKind::Branch,
            ..Default::default()
        };
        assert_eq!(interface_units(&branch), 1);
    }

    #[test]
    fn test_endpoint_az_inference() {
        // Interface endpoint: subnets drive the AZ count.
        assert_eq!(
            endpoint_units(&VpcEndpoint {
                subnet_count: 3,
                route_table_count: 0,
            }),
            18
        );
        // Gateway endpoint: route tables drive the AZ count.
        assert_eq!(
            endpoint_units(&VpcEndpoint {
                subnet_count: 0,
                route_table_count: 2,
            }),
            12
        );
        // Neither reported: assume one AZ.
        assert_eq!(endpoint_units(&VpcEndpoint::default()), 6);
    }

    #[test]
    fn test_gateway_load_balancer_weight() {
        let lb = LoadBalancer {
            vpc_id: "vpc-1".to_string(),
            kind: LoadBalancerKind::Gateway,
            az_count: 2,
        };
        assert_eq!(load_balancer_units(&lb), 12);

        let nlb = LoadBalancer {
            vpc_id: "vpc-1".to_string(),
            kind: LoadBalancerKind::Network,
            az_count: 2,
        };
        assert_eq!(load_balancer_units(&nlb), 12);
    }

    #[tokio::test]
    async fn test_calculate_sums_per_vpc() {
        let inventory = FakeInventory {
            vpcs: vec!["vpc-1".to_string(), "vpc-2".to_string()],
            interfaces: vec![(
                "vpc-1".to_string(),
                NetworkInterface {
                    kind: InterfaceKind::Standard,
                    private_ips: vec![PrivateIp::default()],
                    ..Default::default()
                },
            )],
            nat_gateways: 1,
            endpoints: vec![(
                "vpc-2".to_string(),
                VpcEndpoint {
                    subnet_count: 2,
                    route_table_count: 0,
                },
            )],
            load_balancers: vec![LoadBalancer {
                vpc_id: "vpc-1".to_string(),
                kind: LoadBalancerKind::Network,
                az_count: 3,
            }],
            tgw_attachments: 0,
            subnets: vec![("vpc-1".to_string(), "subnet-a".to_string())],
            mount_target_subnets: vec!["subnet-a".to_string(), "subnet-z".to_string()],
        };

        let totals = calculate_vpc_nau(&inventory).await.expect("calculate");

        // vpc-1: ENI (1+1) + NAT 6 + NLB 3*6 + EFS mount target 6 = 32.
        assert_eq!(totals["vpc-1"], 32);
        // vpc-2: NAT 6 + endpoint 2*6 = 18.
        assert_eq!(totals["vpc-2"], 18);
    }

    #[tokio::test]
    async fn test_calculate_empty_region() {
        let inventory = FakeInventory::default();
        let totals = calculate_vpc_nau(&inventory).await.expect("calculate");
        assert!(totals.is_empty());
    }
}

//! Network: VPC, public/private subnets in two zones, gateways, routes and
//! the four security groups the applications sit behind.

use crate::core::error::{InfraError, Result};
use crate::core::graph::{Context, ResourceRef};
use crate::core::output::{IntoInput, Output};
use crate::core::parser::{parse_cidr, Cidr};
use crate::core::types::{ResourceKind, Urn};
use serde_json::{json, Value};

pub const NETWORK_TOKEN: &str = "air-tek:infra:network";

/// Port every application container listens on.
pub const SERVICE_PORT: u16 = 5000;

const ANYWHERE: &str = "0.0.0.0/0";

/// Placement of one subnet inside the VPC range.
#[derive(Debug, Clone, Copy)]
pub struct SubnetSlot {
    pub suffix: &'static str,
    /// Index of the /24 block within the VPC range
    pub block: u8,
    /// Index into the region's availability zones
    pub zone: usize,
    pub public: bool,
}

pub const PUBLIC_A: SubnetSlot = SubnetSlot {
    suffix: "public-subnet-1a",
    block: 1,
    zone: 0,
    public: true,
};
pub const PUBLIC_B: SubnetSlot = SubnetSlot {
    suffix: "public-subnet-1b",
    block: 2,
    zone: 1,
    public: true,
};
pub const PRIVATE_A: SubnetSlot = SubnetSlot {
    suffix: "private-subnet-1a",
    block: 11,
    zone: 0,
    public: false,
};
pub const PRIVATE_B: SubnetSlot = SubnetSlot {
    suffix: "private-subnet-1b",
    block: 12,
    zone: 1,
    public: false,
};

pub const SUBNET_LAYOUT: [SubnetSlot; 4] = [PUBLIC_A, PUBLIC_B, PRIVATE_A, PRIVATE_B];

/// Identifiers published by the network for downstream modules.
#[derive(Debug, Clone)]
pub struct Network {
    pub urn: Urn,
    pub name: String,
    pub vpc_id: Output<String>,
    pub public_subnet_a_id: Output<String>,
    pub public_subnet_b_id: Output<String>,
    pub private_subnet_a_id: Output<String>,
    pub private_subnet_b_id: Output<String>,
    pub web_ui_lb_sg_id: Output<String>,
    pub web_ui_ec2_sg_id: Output<String>,
    pub web_api_lb_sg_id: Output<String>,
    pub web_api_ec2_sg_id: Output<String>,
}

impl Network {
    pub fn public_subnets(&self) -> Vec<Output<String>> {
        vec![self.public_subnet_a_id.clone(), self.public_subnet_b_id.clone()]
    }

    pub fn private_subnets(&self) -> Vec<Output<String>> {
        vec![self.private_subnet_a_id.clone(), self.private_subnet_b_id.clone()]
    }
}

fn allow_all_egress() -> Value {
    json!([{
        "protocol": "-1",
        "fromPort": 0,
        "toPort": 0,
        "cidrBlocks": [ANYWHERE],
    }])
}

fn tcp_from_anywhere(description: &str, port: u16) -> Output<Value> {
    Output::known(json!({
        "description": description,
        "protocol": "tcp",
        "fromPort": port,
        "toPort": port,
        "cidrBlocks": [ANYWHERE],
    }))
}

fn tcp_from_group(description: &str, port: u16, group: &Output<String>) -> Output<Value> {
    Output::object(vec![
        ("description", description.into_input()),
        ("protocol", "tcp".into_input()),
        ("fromPort", port.into_input()),
        ("toPort", port.into_input()),
        ("securityGroups", vec![group.clone()].into_input()),
    ])
}

/// Subnet CIDRs for a VPC range, in layout order.
pub fn subnet_ranges(vpc: &Cidr) -> Result<Vec<Cidr>> {
    SUBNET_LAYOUT.iter().map(|s| vpc.block24(s.block)).collect()
}

struct Scope<'n> {
    root: &'n Urn,
    network: &'n str,
    tags: &'n Value,
}

fn declare_subnet(
    ctx: &mut Context<'_>,
    scope: &Scope<'_>,
    vpc: &ResourceRef,
    slot: SubnetSlot,
    cidr: Cidr,
    zones: &[String],
) -> Result<ResourceRef> {
    let zone = zones.get(slot.zone).cloned().ok_or_else(|| {
        InfraError::InvalidConfig(format!("no availability zone for {}", slot.suffix))
    })?;
    ctx.resource(ResourceKind::Subnet, format!("{}-{}", scope.network, slot.suffix))
        .parent(scope.root)
        .input("vpcId", vpc.id())
        .input("cidrBlock", cidr.to_string())
        .input("mapPublicIpOnLaunch", slot.public)
        .input("availabilityZone", zone)
        .tags(scope.tags.clone())
        .register()
}

fn declare_route_table(
    ctx: &mut Context<'_>,
    scope: &Scope<'_>,
    name: &str,
    vpc: &ResourceRef,
    target: (&str, Output<String>),
    subnets: [(&str, &ResourceRef); 2],
) -> Result<ResourceRef> {
    let (target_key, target_id) = target;
    let route = Output::object(vec![
        ("cidrBlock", ANYWHERE.into_input()),
        (target_key, target_id.into_input()),
    ]);
    let table = ctx
        .resource(ResourceKind::RouteTable, format!("{}-{}", scope.network, name))
        .parent(scope.root)
        .input("vpcId", vpc.id())
        .input("routes", Output::array(vec![route]))
        .tags(scope.tags.clone())
        .register()?;
    for (suffix, subnet) in subnets {
        ctx.resource(
            ResourceKind::RouteTableAssociation,
            format!("{}-{}-route-table-association", scope.network, suffix),
        )
        .parent(scope.root)
        .input("subnetId", subnet.id())
        .input("routeTableId", table.id())
        .register()?;
    }
    Ok(table)
}

fn declare_security_group(
    ctx: &mut Context<'_>,
    scope: &Scope<'_>,
    suffix: &str,
    label: &str,
    vpc: &ResourceRef,
    ingress: Vec<Output<Value>>,
) -> Result<ResourceRef> {
    let standard = ctx.config().tagging.standard_tags;
    let tags = ctx.tags(standard, &[("Name", label)]);
    ctx.resource(
        ResourceKind::SecurityGroup,
        format!("{}-{}-security-group", scope.network, suffix),
    )
    .parent(scope.root)
    .input("vpcId", vpc.id())
    .input("ingress", Output::array(ingress))
    .input("egress", allow_all_egress())
    .tags(tags)
    .register()
}

/// Declare the network. Configuration is checked before anything is registered.
pub fn new_network(ctx: &mut Context<'_>) -> Result<Network> {
    let config = ctx.config_set("network");
    let name = config.require("name")?;
    let range = parse_cidr(&config.require("vpcRange")?)?;
    let ranges = subnet_ranges(&range)?;
    let zones = ctx.provider().availability_zones()?;
    if zones.len() < 2 {
        return Err(InfraError::InvalidConfig(format!(
            "region {} has {} availability zone(s), two are required",
            ctx.config().region,
            zones.len()
        )));
    }

    tracing::info!(network = %name, vpc_range = %range, zones = ?&zones[..2], "declaring network");
    let tags = ctx.tags(ctx.config().tagging.standard_tags, &[]);
    let root = ctx.component(NETWORK_TOKEN, &name, None)?;
    let scope = Scope {
        root: &root,
        network: &name,
        tags: &tags,
    };

    let vpc = ctx
        .resource(ResourceKind::Vpc, format!("{}-vpc", name))
        .parent(&root)
        .input("cidrBlock", range.to_string())
        .input("enableDnsSupport", true)
        .input("enableDnsHostnames", true)
        .input("instanceTenancy", "default")
        .tags(tags.clone())
        .register()?;

    let mut subnets = Vec::with_capacity(SUBNET_LAYOUT.len());
    for (slot, cidr) in SUBNET_LAYOUT.iter().zip(ranges) {
        subnets.push(declare_subnet(ctx, &scope, &vpc, *slot, cidr, &zones)?);
    }
    let [public_a, public_b, private_a, private_b] = <[ResourceRef; 4]>::try_from(subnets)
        .map_err(|_| InfraError::State("subnet layout must have four entries".to_string()))?;

    let igw = ctx
        .resource(ResourceKind::InternetGateway, format!("{}-igw", name))
        .parent(&root)
        .input("vpcId", vpc.id())
        .tags(tags.clone())
        .register()?;
    declare_route_table(
        ctx,
        &scope,
        "public-route-table",
        &vpc,
        ("gatewayId", igw.id()),
        [(PUBLIC_A.suffix, &public_a), (PUBLIC_B.suffix, &public_b)],
    )?;

    let eip = ctx
        .resource(ResourceKind::Eip, format!("{}-nat-gw-eip", name))
        .parent(&root)
        .input("vpc", true)
        .tags(tags.clone())
        .register()?;
    let nat = ctx
        .resource(ResourceKind::NatGateway, format!("{}-nat-gw", name))
        .parent(&root)
        .input("allocationId", eip.id())
        .input("subnetId", public_a.id())
        .tags(tags.clone())
        .register()?;
    declare_route_table(
        ctx,
        &scope,
        "nat-gateway-route-table",
        &vpc,
        ("natGatewayId", nat.id()),
        [(PRIVATE_A.suffix, &private_a), (PRIVATE_B.suffix, &private_b)],
    )?;

    let web_ui_lb = declare_security_group(
        ctx,
        &scope,
        "web-ui-loadbalancer",
        "elb allow http,https,egress",
        &vpc,
        vec![tcp_from_anywhere("HTTPS", 443), tcp_from_anywhere("HTTP", 80)],
    )?;
    let web_ui_ec2 = declare_security_group(
        ctx,
        &scope,
        "web-ui-ec2-instance",
        "allow web ui elb",
        &vpc,
        vec![tcp_from_group("http", SERVICE_PORT, &web_ui_lb.id())],
    )?;
    let web_api_lb = declare_security_group(
        ctx,
        &scope,
        "web-api-loadbalancer",
        "elb web ui ec2",
        &vpc,
        vec![
            tcp_from_group("HTTP", SERVICE_PORT, &web_ui_ec2.id()),
            tcp_from_anywhere("tcp", SERVICE_PORT),
        ],
    )?;
    let web_api_ec2 = declare_security_group(
        ctx,
        &scope,
        "web-api-ec2-instance",
        "allow web api elb",
        &vpc,
        vec![tcp_from_group("http", SERVICE_PORT, &web_api_lb.id())],
    )?;

    let network = Network {
        urn: root.clone(),
        name: name.clone(),
        vpc_id: vpc.id(),
        public_subnet_a_id: public_a.id(),
        public_subnet_b_id: public_b.id(),
        private_subnet_a_id: private_a.id(),
        private_subnet_b_id: private_b.id(),
        web_ui_lb_sg_id: web_ui_lb.id(),
        web_ui_ec2_sg_id: web_ui_ec2.id(),
        web_api_lb_sg_id: web_api_lb.id(),
        web_api_ec2_sg_id: web_api_ec2.id(),
    };
    ctx.register_outputs(
        &root,
        vec![
            ("VpcId", network.vpc_id.clone().into_input()),
            ("PublicSubnet1aId", network.public_subnet_a_id.clone().into_input()),
            ("PublicSubnet1bId", network.public_subnet_b_id.clone().into_input()),
            ("PrivateSubnet1aId", network.private_subnet_a_id.clone().into_input()),
            ("PrivateSubnet1bId", network.private_subnet_b_id.clone().into_input()),
            ("WebUiLoadBalancerSecurityGroupId", network.web_ui_lb_sg_id.clone().into_input()),
            ("WebUiEc2InstanceSecurityGroupId", network.web_ui_ec2_sg_id.clone().into_input()),
            ("WebApiLoadBalancerSecurityGroupId", network.web_api_lb_sg_id.clone().into_input()),
            ("WebApiEc2InstanceSecurityGroupId", network.web_api_ec2_sg_id.clone().into_input()),
        ],
    )?;
    Ok(network)
}

//! Attribute computation per resource kind and the id index.

use super::validate::{
    array_field, collect_strings, container_definitions, field, parse_range, port_of, str_field,
    str_of,
};
use super::{identifiers_of, label, registry_password, short_hash, Inner, Stored, ACCOUNT_ID};
use crate::core::error::{InfraError, Result};
use crate::core::types::{Properties, ResourceKind};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

impl Inner {
    fn arn(&self, service: &str, resource: &str) -> String {
        format!("arn:aws:{}:{}:{}:{}", service, self.region, ACCOUNT_ID, resource)
    }

    fn new_id(&self, prefix: &str, kind: ResourceKind, name: &str, previous: Option<&Stored>) -> String {
        previous
            .and_then(|p| p.attributes.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!("{}-{}", prefix, short_hash(&[&self.region, kind.token(), name], 17))
            })
    }

    pub(super) fn references_in<'a>(&self, values: impl Iterator<Item = &'a Value>) -> BTreeSet<String> {
        let mut strings = Vec::new();
        for v in values {
            collect_strings(v, &mut strings);
        }
        strings
            .into_iter()
            .filter(|s| self.by_id.contains_key(*s))
            .map(str::to_string)
            .collect()
    }

    pub(super) fn store(&mut self, kind: ResourceKind, name: &str, attributes: Properties, refs: BTreeSet<String>) {
        let key = (kind, name.to_string());
        if let Some(old) = self.resources.get(&key) {
            for id in old.identifiers() {
                self.by_id.remove(&id);
            }
        }
        for id in identifiers_of(&attributes) {
            self.by_id.insert(id, key.clone());
        }
        self.resources.insert(
            key,
            Stored {
                kind,
                attributes,
                refs,
            },
        );
    }

    pub(super) fn check_injected(&self, kind: ResourceKind, label: &str) -> Result<()> {
        if self.fail_on.contains(&kind) {
            return Err(InfraError::provider(label, "injected failure"));
        }
        Ok(())
    }

    /// Validate inputs and compute the attributes the control plane reports.
    pub(super) fn materialize(
        &self,
        kind: ResourceKind,
        name: &str,
        inputs: &Properties,
        previous: Option<&Stored>,
    ) -> Result<Properties> {
        let label = label(kind, name);
        let label = label.as_str();
        let mut attrs = inputs.clone();
        match kind {
            ResourceKind::Component | ResourceKind::RegistryCredentials => {
                return Err(InfraError::provider(label, "not a managed resource kind"));
            }
            ResourceKind::Vpc => {
                let cidr = str_field(inputs, "cidrBlock", label)?;
                parse_range(cidr).ok_or_else(|| {
                    InfraError::provider(label, format!("invalid cidrBlock '{}'", cidr))
                })?;
                let id = self.new_id("vpc", kind, name, previous);
                attrs.insert("arn".into(), self.arn("ec2", &format!("vpc/{}", id)).into());
                attrs.insert("id".into(), id.into());
            }
            ResourceKind::Subnet => {
                let vpc_id = str_field(inputs, "vpcId", label)?;
                let vpc = self.require(vpc_id, ResourceKind::Vpc, label, "vpcId")?;
                let cidr = str_field(inputs, "cidrBlock", label)?;
                let own_id = previous.and_then(|p| p.attributes.get("id")).and_then(Value::as_str);
                self.check_subnet_range(vpc, vpc_id, cidr, own_id, label)?;
                self.check_zone(str_field(inputs, "availabilityZone", label)?, label)?;
                let id = self.new_id("subnet", kind, name, previous);
                attrs.insert("arn".into(), self.arn("ec2", &format!("subnet/{}", id)).into());
                attrs.insert("id".into(), id.into());
                attrs
                    .entry("mapPublicIpOnLaunch".to_string())
                    .or_insert(Value::Bool(false));
            }
            ResourceKind::InternetGateway => {
                let vpc_id = str_field(inputs, "vpcId", label)?;
                self.require(vpc_id, ResourceKind::Vpc, label, "vpcId")?;
                attrs.insert("id".into(), self.new_id("igw", kind, name, previous).into());
            }
            ResourceKind::RouteTable => {
                let vpc_id = str_field(inputs, "vpcId", label)?;
                self.require(vpc_id, ResourceKind::Vpc, label, "vpcId")?;
                for route in array_field(inputs, "routes", label)? {
                    str_of(&route["cidrBlock"], "route cidrBlock", label)?;
                    if let Some(gw) = route.get("gatewayId").and_then(Value::as_str) {
                        self.require(gw, ResourceKind::InternetGateway, label, "gatewayId")?;
                    } else if let Some(nat) = route.get("natGatewayId").and_then(Value::as_str) {
                        self.require(nat, ResourceKind::NatGateway, label, "natGatewayId")?;
                    } else {
                        return Err(InfraError::provider(label, "route has no target"));
                    }
                }
                attrs.insert("id".into(), self.new_id("rtb", kind, name, previous).into());
            }
            ResourceKind::RouteTableAssociation => {
                let subnet = str_field(inputs, "subnetId", label)?;
                self.require(subnet, ResourceKind::Subnet, label, "subnetId")?;
                let table = str_field(inputs, "routeTableId", label)?;
                self.require(table, ResourceKind::RouteTable, label, "routeTableId")?;
                attrs.insert("id".into(), self.new_id("rtbassoc", kind, name, previous).into());
            }
            ResourceKind::Eip => {
                let id = self.new_id("eipalloc", kind, name, previous);
                let hash = blake3::hash(id.as_bytes());
                let b = hash.as_bytes();
                attrs.insert(
                    "publicIp".into(),
                    format!("54.{}.{}.{}", b[0], b[1], b[2].max(1)).into(),
                );
                attrs.insert("allocationId".into(), id.clone().into());
                attrs.insert("id".into(), id.into());
            }
            ResourceKind::NatGateway => {
                let alloc = str_field(inputs, "allocationId", label)?;
                self.require(alloc, ResourceKind::Eip, label, "allocationId")?;
                let subnet = str_field(inputs, "subnetId", label)?;
                self.require(subnet, ResourceKind::Subnet, label, "subnetId")?;
                attrs.insert("id".into(), self.new_id("nat", kind, name, previous).into());
            }
            ResourceKind::SecurityGroup => {
                let vpc_id = str_field(inputs, "vpcId", label)?;
                self.require(vpc_id, ResourceKind::Vpc, label, "vpcId")?;
                for direction in ["ingress", "egress"] {
                    let Some(rules) = inputs.get(direction).and_then(Value::as_array) else {
                        continue;
                    };
                    for rule in rules {
                        str_of(&rule["protocol"], "rule protocol", label)?;
                        let cidrs = rule.get("cidrBlocks").and_then(Value::as_array);
                        let groups = rule.get("securityGroups").and_then(Value::as_array);
                        if cidrs.is_none_or(|c| c.is_empty()) && groups.is_none_or(|g| g.is_empty()) {
                            return Err(InfraError::provider(
                                label,
                                format!("{} rule has no source", direction),
                            ));
                        }
                        for group in groups.into_iter().flatten() {
                            let group = str_of(group, "rule security group", label)?;
                            let sg = self.require(group, ResourceKind::SecurityGroup, label, "securityGroups")?;
                            if sg.attributes.get("vpcId").and_then(Value::as_str) != Some(vpc_id) {
                                return Err(InfraError::provider(
                                    label,
                                    format!("security group '{}' belongs to another VPC", group),
                                ));
                            }
                        }
                    }
                }
                let id = self.new_id("sg", kind, name, previous);
                attrs.insert("arn".into(), self.arn("ec2", &format!("security-group/{}", id)).into());
                attrs.insert("id".into(), id.into());
            }
            ResourceKind::LoadBalancer => {
                let mut zones = BTreeSet::new();
                for subnet in array_field(inputs, "subnets", label)? {
                    let subnet = str_of(subnet, "subnet", label)?;
                    let stored = self.require(subnet, ResourceKind::Subnet, label, "subnets")?;
                    if let Some(zone) = stored.attributes.get("availabilityZone").and_then(Value::as_str) {
                        zones.insert(zone.to_string());
                    }
                }
                if zones.len() < 2 {
                    return Err(InfraError::provider(
                        label,
                        "a load balancer needs subnets in at least two availability zones",
                    ));
                }
                for group in array_field(inputs, "securityGroups", label)? {
                    let group = str_of(group, "security group", label)?;
                    self.require(group, ResourceKind::SecurityGroup, label, "securityGroups")?;
                }
                let internal = inputs.get("internal").and_then(Value::as_bool).unwrap_or(false);
                let suffix = short_hash(&[&self.region, kind.token(), name], 16);
                let arn = self.arn("elasticloadbalancing", &format!("loadbalancer/app/{}/{}", name, suffix));
                let dns = format!(
                    "{}{}-{}.{}.elb.amazonaws.com",
                    if internal { "internal-" } else { "" },
                    name,
                    &suffix[..10],
                    self.region
                );
                attrs.insert("internal".into(), internal.into());
                attrs.insert("dnsName".into(), dns.into());
                attrs.insert("id".into(), arn.clone().into());
                attrs.insert("arn".into(), arn.into());
            }
            ResourceKind::TargetGroup => {
                let vpc_id = str_field(inputs, "vpcId", label)?;
                self.require(vpc_id, ResourceKind::Vpc, label, "vpcId")?;
                port_of(field(inputs, "port", label)?, "port", label)?;
                str_field(inputs, "protocol", label)?;
                let suffix = short_hash(&[&self.region, kind.token(), name], 16);
                let arn = self.arn("elasticloadbalancing", &format!("targetgroup/{}/{}", name, suffix));
                attrs
                    .entry("targetType".to_string())
                    .or_insert_with(|| "instance".into());
                attrs.insert("id".into(), arn.clone().into());
                attrs.insert("arn".into(), arn.into());
            }
            ResourceKind::Listener => {
                let lb = str_field(inputs, "loadBalancerArn", label)?;
                self.require(lb, ResourceKind::LoadBalancer, label, "loadBalancerArn")?;
                port_of(field(inputs, "port", label)?, "port", label)?;
                let actions = array_field(inputs, "defaultActions", label)?;
                if actions.is_empty() {
                    return Err(InfraError::provider(label, "listener has no default action"));
                }
                for action in actions {
                    if action.get("type").and_then(Value::as_str) != Some("forward") {
                        return Err(InfraError::provider(label, "only forward actions are supported"));
                    }
                    let tg = str_of(&action["targetGroupArn"], "targetGroupArn", label)?;
                    self.require(tg, ResourceKind::TargetGroup, label, "targetGroupArn")?;
                }
                let suffix = short_hash(&[&self.region, kind.token(), name], 16);
                let arn = self.arn("elasticloadbalancing", &format!("listener/app/{}/{}", name, suffix));
                attrs.insert("id".into(), arn.clone().into());
                attrs.insert("arn".into(), arn.into());
            }
            ResourceKind::Repository => {
                let url = format!("{}.dkr.ecr.{}.amazonaws.com/{}", ACCOUNT_ID, self.region, name);
                attrs
                    .entry("forceDelete".to_string())
                    .or_insert(Value::Bool(false));
                attrs.insert("name".into(), name.into());
                attrs.insert("registryId".into(), ACCOUNT_ID.into());
                attrs.insert("repositoryUrl".into(), url.into());
                attrs.insert("arn".into(), self.arn("ecr", &format!("repository/{}", name)).into());
                attrs.insert("id".into(), name.into());
            }
            ResourceKind::Image => {
                let image_name = str_field(inputs, "imageName", label)?;
                let repo_url = image_name.rsplit_once(':').filter(|(_, tag)| !tag.contains('/'));
                let (repo_url, tag) = repo_url.unwrap_or((image_name, "latest"));
                let repo = self.require(repo_url, ResourceKind::Repository, label, "imageName")?;
                let registry_id = repo
                    .attributes
                    .get("registryId")
                    .and_then(Value::as_str)
                    .unwrap_or(ACCOUNT_ID);

                let registry = field(inputs, "registry", label)?;
                let server = str_of(&registry["server"], "registry server", label)?;
                let username = str_of(&registry["username"], "registry username", label)?;
                let password = str_of(&registry["password"], "registry password", label)?;
                if server.split('/').next() != repo_url.split('/').next() {
                    return Err(InfraError::provider(
                        label,
                        format!("registry server '{}' does not host {}", server, repo_url),
                    ));
                }
                if username != "AWS" || password != registry_password(registry_id) {
                    return Err(InfraError::provider(
                        label,
                        format!("authentication to {} failed", server),
                    ));
                }

                let build = field(inputs, "build", label)?;
                let context = str_of(&build["context"], "build context", label)?;
                let dockerfile = str_of(&build["dockerfile"], "build dockerfile", label)?;
                let platform = build.get("platform").and_then(Value::as_str).unwrap_or("linux/amd64");
                let digest = Sha256::digest(
                    format!("{}|{}|{}|{}", repo_url, context, dockerfile, platform).as_bytes(),
                );
                let repo_digest = format!("{}@sha256:{:x}", repo_url, digest);

                attrs.shift_remove("registry");
                attrs.insert("baseImageName".into(), repo_url.into());
                attrs.insert("imageName".into(), format!("{}:{}", repo_url, tag).into());
                attrs.insert("repoDigest".into(), repo_digest.clone().into());
                attrs.insert("id".into(), repo_digest.into());
            }
            ResourceKind::Role => {
                let policy = str_field(inputs, "assumeRolePolicy", label)?;
                let doc: Value = serde_json::from_str(policy).map_err(|e| {
                    InfraError::provider(label, format!("assumeRolePolicy is not valid JSON: {}", e))
                })?;
                if doc["Statement"].as_array().is_none_or(|s| s.is_empty()) {
                    return Err(InfraError::provider(label, "assumeRolePolicy has no statements"));
                }
                attrs.insert("name".into(), name.into());
                attrs.insert("arn".into(), format!("arn:aws:iam::{}:role/{}", ACCOUNT_ID, name).into());
                attrs.insert("id".into(), name.into());
            }
            ResourceKind::RolePolicyAttachment => {
                let role = str_field(inputs, "role", label)?;
                self.require(role, ResourceKind::Role, label, "role")?;
                let policy = str_field(inputs, "policyArn", label)?;
                if !policy.starts_with("arn:aws:iam::") {
                    return Err(InfraError::provider(
                        label,
                        format!("'{}' is not a policy ARN", policy),
                    ));
                }
                let id = format!("{}-{}", role, short_hash(&[role, policy], 8));
                attrs.insert("id".into(), id.into());
            }
            ResourceKind::Cluster => {
                let arn = self.arn("ecs", &format!("cluster/{}", name));
                attrs.insert("name".into(), name.into());
                attrs.insert("id".into(), arn.clone().into());
                attrs.insert("arn".into(), arn.into());
            }
            ResourceKind::TaskDefinition => {
                let family = str_field(inputs, "family", label)?;
                let role = str_field(inputs, "executionRoleArn", label)?;
                self.require(role, ResourceKind::Role, label, "executionRoleArn")?;
                str_field(inputs, "cpu", label)?;
                str_field(inputs, "memory", label)?;
                let containers =
                    container_definitions(field(inputs, "containerDefinitions", label)?, label)?;
                let revision = previous
                    .and_then(|p| p.attributes.get("revision"))
                    .and_then(Value::as_u64)
                    .map_or(1, |r| r + 1);
                let arn = self.arn("ecs", &format!("task-definition/{}:{}", family, revision));
                attrs.insert("containerDefinitions".into(), Value::Array(containers));
                attrs.insert("revision".into(), revision.into());
                attrs.insert("id".into(), arn.clone().into());
                attrs.insert("arn".into(), arn.into());
            }
            ResourceKind::Service => {
                let cluster = str_field(inputs, "cluster", label)?;
                let cluster = self.require(cluster, ResourceKind::Cluster, label, "cluster")?;
                let td_arn = str_field(inputs, "taskDefinition", label)?;
                let td = self.require(td_arn, ResourceKind::TaskDefinition, label, "taskDefinition")?;

                if inputs.get("launchType").and_then(Value::as_str) == Some("FARGATE") {
                    let mode = td.attributes.get("networkMode").and_then(Value::as_str);
                    let fargate = td
                        .attributes
                        .get("requiresCompatibilities")
                        .and_then(Value::as_array)
                        .is_some_and(|c| c.iter().any(|v| v == "FARGATE"));
                    if mode != Some("awsvpc") || !fargate {
                        return Err(InfraError::provider(
                            label,
                            "task definition is not FARGATE compatible",
                        ));
                    }
                }

                let network = field(inputs, "networkConfiguration", label)?;
                for subnet in network["subnets"].as_array().into_iter().flatten() {
                    let subnet = str_of(subnet, "subnet", label)?;
                    self.require(subnet, ResourceKind::Subnet, label, "subnets")?;
                }
                for group in network["securityGroups"].as_array().into_iter().flatten() {
                    let group = str_of(group, "security group", label)?;
                    self.require(group, ResourceKind::SecurityGroup, label, "securityGroups")?;
                }

                let containers = td
                    .attributes
                    .get("containerDefinitions")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for binding in inputs.get("loadBalancers").and_then(Value::as_array).into_iter().flatten() {
                    let tg_arn = str_of(&binding["targetGroupArn"], "targetGroupArn", label)?;
                    let tg = self.require(tg_arn, ResourceKind::TargetGroup, label, "targetGroupArn")?;
                    if tg.attributes.get("targetType").and_then(Value::as_str) != Some("ip") {
                        return Err(InfraError::provider(
                            label,
                            "awsvpc services need a target group of type ip",
                        ));
                    }
                    self.check_target_group_attached(tg_arn, label)?;
                    let container = str_of(&binding["containerName"], "containerName", label)?;
                    let port = port_of(&binding["containerPort"], "containerPort", label)?;
                    let def = containers
                        .iter()
                        .find(|c| c["name"] == container)
                        .ok_or_else(|| {
                            InfraError::provider(
                                label,
                                format!("container '{}' is not in the task definition", container),
                            )
                        })?;
                    let exposed = def["portMappings"]
                        .as_array()
                        .is_some_and(|m| m.iter().any(|pm| pm["containerPort"] == port));
                    if !exposed {
                        return Err(InfraError::provider(
                            label,
                            format!("container '{}' does not expose port {}", container, port),
                        ));
                    }
                }

                let cluster_name = cluster
                    .attributes
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let arn = self.arn("ecs", &format!("service/{}/{}", cluster_name, name));
                attrs.insert("name".into(), name.into());
                attrs.insert("id".into(), arn.clone().into());
                attrs.insert("arn".into(), arn.into());
            }
        }
        Ok(attrs)
    }
}

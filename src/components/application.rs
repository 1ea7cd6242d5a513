//! One containerized service: load balancer, registry, image, execution role,
//! task definition and a FARGATE service on the shared cluster.
//!
//! The Web API and the Web UI are two call sites of [`deploy`]. They differ in
//! listener port, balancer visibility, build file and how the task definition
//! is expressed ([`TaskDefinitionStyle`]).

use super::loadbalancer::{new_load_balancer, LoadBalancer, LoadBalancerArgs};
use super::network::SERVICE_PORT;
use super::registry::{new_registry, ContainerRegistry, RegistryArgs};
use crate::core::error::Result;
use crate::core::graph::{Context, ResourceRef};
use crate::core::output::{IntoInput, Output};
use crate::core::types::{ResourceKind, Urn};
use serde_json::{json, Value};

pub const APPLICATION_TOKEN: &str = "air-tek:infra:application";

pub const EXECUTION_POLICY_ARN: &str =
    "arn:aws:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy";

pub const TASK_CPU: &str = "256";
pub const TASK_MEMORY: &str = "512";

const BUILD_CONTEXT: &str = "..";
const BUILD_PLATFORM: &str = "linux/amd64";

/// Trust policy letting the container runtime assume the execution role.
pub fn assume_role_policy() -> String {
    json!({
        "Version": "2008-10-17",
        "Statement": [{
            "Sid": "",
            "Effect": "Allow",
            "Principal": { "Service": "ecs-tasks.amazonaws.com" },
            "Action": "sts:AssumeRole",
        }],
    })
    .to_string()
}

/// How the container list reaches the task definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDefinitionStyle {
    /// A rendered JSON document
    ContainerJson,
    /// Typed container, port and environment fields
    Structured,
}

/// The single container of a task definition.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: Output<String>,
    pub port: u16,
    pub environment: Vec<(String, Output<String>)>,
}

impl ContainerSpec {
    fn port_mappings(&self) -> Value {
        json!([{
            "containerPort": self.port,
            "hostPort": self.port,
            "protocol": "tcp",
        }])
    }

    fn environment_entries(&self) -> Output<Value> {
        Output::array(
            self.environment
                .iter()
                .map(|(name, value)| {
                    Output::object(vec![
                        ("name", name.clone().into_input()),
                        ("value", value.clone().into_input()),
                    ])
                })
                .collect(),
        )
    }

    /// Container definitions as a JSON document string.
    pub fn to_json_document(&self) -> Output<String> {
        let name = self.name.clone();
        let mappings = self.port_mappings();
        self.image
            .zip(&self.environment_entries())
            .map(move |(image, environment)| {
                let mut container = json!({
                    "name": name,
                    "image": image,
                    "portMappings": mappings,
                });
                if environment.as_array().is_some_and(|e| !e.is_empty()) {
                    container["environment"] = environment;
                }
                Value::Array(vec![container]).to_string()
            })
    }

    /// Container definitions as a structured list.
    pub fn to_structured(&self) -> Output<Value> {
        let mut fields = vec![
            ("name", self.name.clone().into_input()),
            ("image", self.image.clone().into_input()),
            ("portMappings", self.port_mappings().into_input()),
        ];
        if !self.environment.is_empty() {
            fields.push(("environment", self.environment_entries()));
        }
        Output::array(vec![Output::object(fields)])
    }
}

/// What is deployed.
#[derive(Debug, Clone)]
pub struct AppSpec {
    /// Service name, also the container and image name (`web-api`)
    pub service: String,
    pub dockerfile: String,
    pub internal: bool,
    pub listener_port: u16,
    pub health_check_path: Option<String>,
    pub style: TaskDefinitionStyle,
    pub environment: Vec<(String, Output<String>)>,
}

/// Where it is deployed.
#[derive(Debug, Clone)]
pub struct Placement {
    pub network_name: String,
    pub vpc_id: Output<String>,
    pub load_balancer_subnets: Vec<Output<String>>,
    pub load_balancer_security_groups: Vec<Output<String>>,
    pub service_subnets: Vec<Output<String>>,
    pub service_security_groups: Vec<Output<String>>,
    pub cluster_arn: Output<String>,
}

#[derive(Debug, Clone)]
pub struct Application {
    pub urn: Urn,
    pub load_balancer: LoadBalancer,
    pub registry: ContainerRegistry,
    pub image_name: Output<String>,
    pub task_definition: ResourceRef,
    pub service: ResourceRef,
    /// `http://<dns>[:port]` from [`LoadBalancer::url`], not the raw DNS name
    pub url: Output<String>,
}

/// Declare one application. Outputs are registered by the caller.
pub fn deploy(ctx: &mut Context<'_>, spec: &AppSpec, placement: &Placement) -> Result<Application> {
    let prefix = format!("{}-{}", placement.network_name, spec.service);
    let standard_tags = ctx.config().tagging.standard_tags;
    let root = ctx.component(APPLICATION_TOKEN, &prefix, None)?;
    tracing::info!(application = %prefix, style = ?spec.style, "declaring application");

    let load_balancer = new_load_balancer(
        ctx,
        &LoadBalancerArgs {
            name: format!("{}-lb", prefix),
            vpc_id: placement.vpc_id.clone(),
            subnets: placement.load_balancer_subnets.clone(),
            security_groups: placement.load_balancer_security_groups.clone(),
            internal: spec.internal,
            listener_port: spec.listener_port,
            target_port: SERVICE_PORT,
            health_check_path: spec.health_check_path.clone(),
            health_check_port: spec.health_check_path.as_ref().map(|_| SERVICE_PORT),
            standard_tags,
        },
        Some(&root),
    )?;

    let registry = new_registry(
        ctx,
        &RegistryArgs {
            name: format!("{}-ecr", prefix),
            standard_tags,
        },
        Some(&root),
    )?;

    let image = ctx
        .resource(ResourceKind::Image, &spec.service)
        .parent(&root)
        .input(
            "build",
            json!({
                "context": BUILD_CONTEXT,
                "dockerfile": spec.dockerfile,
                "platform": BUILD_PLATFORM,
            }),
        )
        .input("imageName", &registry.repository_url)
        .secret_input("registry", registry.login())
        .register()?;
    let image_name: Output<String> = image.output("imageName");

    let role = ctx
        .resource(ResourceKind::Role, format!("{}-task-exec-role", prefix))
        .parent(&root)
        .input("assumeRolePolicy", assume_role_policy())
        .register()?;
    ctx.resource(
        ResourceKind::RolePolicyAttachment,
        format!("{}-task-exec-policy", prefix),
    )
    .parent(&root)
    .input("role", role.output::<String>("name"))
    .input("policyArn", EXECUTION_POLICY_ARN)
    .register()?;

    let container = ContainerSpec {
        name: spec.service.clone(),
        image: image_name.clone(),
        port: SERVICE_PORT,
        environment: spec.environment.clone(),
    };
    let container_definitions = match spec.style {
        TaskDefinitionStyle::ContainerJson => container.to_json_document().into_input(),
        TaskDefinitionStyle::Structured => container.to_structured(),
    };
    let tags = ctx.tags(standard_tags, &[]);
    let task_definition = ctx
        .resource(ResourceKind::TaskDefinition, format!("{}-ecs-task-def", prefix))
        .parent(&root)
        .input("family", format!("{}-ecs-task-definition", spec.service))
        .input("cpu", TASK_CPU)
        .input("memory", TASK_MEMORY)
        .input("networkMode", "awsvpc")
        .input("requiresCompatibilities", json!(["FARGATE"]))
        .input("executionRoleArn", role.arn())
        .input("containerDefinitions", container_definitions)
        .tags(tags.clone())
        .register()?;

    let network_configuration = Output::object(vec![
        ("assignPublicIp", true.into_input()),
        ("subnets", placement.service_subnets.as_slice().into_input()),
        (
            "securityGroups",
            placement.service_security_groups.as_slice().into_input(),
        ),
    ]);
    let binding = Output::object(vec![
        ("targetGroupArn", load_balancer.target_group_arn.clone().into_input()),
        ("containerName", spec.service.as_str().into_input()),
        ("containerPort", SERVICE_PORT.into_input()),
    ]);
    let service = ctx
        .resource(ResourceKind::Service, format!("{}-ecs-service", prefix))
        .parent(&root)
        .input("cluster", &placement.cluster_arn)
        .input("desiredCount", 1u32)
        .input("launchType", "FARGATE")
        .input("taskDefinition", task_definition.arn())
        .input("networkConfiguration", network_configuration)
        .input("loadBalancers", Output::array(vec![binding]))
        .depends_on(&load_balancer.listener)
        .tags(tags)
        .register()?;

    Ok(Application {
        urn: root,
        url: load_balancer.url(),
        load_balancer,
        registry,
        image_name,
        task_definition,
        service,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::output::Resolution;
    use crate::core::types::{Properties, StackConfig};
    use crate::provider::memory::MemoryProvider;

    fn container(environment: Vec<(String, Output<String>)>) -> ContainerSpec {
        ContainerSpec {
            name: "web-ui".to_string(),
            image: Output::known("repo:latest".to_string()),
            port: 5000,
            environment,
        }
    }

    #[test]
    fn test_trust_policy() {
        let doc: Value = serde_json::from_str(&assume_role_policy()).unwrap();
        assert_eq!(doc["Version"], "2008-10-17");
        assert_eq!(
            doc["Statement"][0]["Principal"]["Service"],
            "ecs-tasks.amazonaws.com"
        );
        assert_eq!(doc["Statement"][0]["Action"], "sts:AssumeRole");
    }

    #[test]
    fn test_container_json_document() {
        let doc = container(vec![]).to_json_document();
        let parsed: Value = serde_json::from_str(&doc.resolve(&Resolution::new()).unwrap()).unwrap();
        assert_eq!(
            parsed,
            json!([{
                "name": "web-ui",
                "image": "repo:latest",
                "portMappings": [{"containerPort": 5000, "hostPort": 5000, "protocol": "tcp"}],
            }])
        );
    }

    #[test]
    fn test_structured_container_with_environment() {
        let lb = Urn::new(ResourceKind::LoadBalancer, "api");
        let endpoint: Output<String> = Output::attribute(&lb, "dnsName");
        let spec = container(vec![("ApiAddress".to_string(), endpoint)]);
        let structured = spec.to_structured();
        assert!(structured.dependencies().contains(&lb));

        let mut resolution = Resolution::new();
        let mut attrs = Properties::new();
        attrs.insert("dnsName".to_string(), json!("http://api:5000/WeatherForecast"));
        resolution.record(&lb, attrs).unwrap();
        let value = structured.resolve(&resolution).unwrap();
        assert_eq!(
            value[0]["environment"],
            json!([{"name": "ApiAddress", "value": "http://api:5000/WeatherForecast"}])
        );
        assert_eq!(value[0]["portMappings"][0]["containerPort"], 5000);
    }

    fn placement() -> Placement {
        let known = |s: &str| Output::known(s.to_string());
        Placement {
            network_name: "dev".to_string(),
            vpc_id: known("vpc-1"),
            load_balancer_subnets: vec![known("subnet-a"), known("subnet-b")],
            load_balancer_security_groups: vec![known("sg-lb")],
            service_subnets: vec![known("subnet-c"), known("subnet-d")],
            service_security_groups: vec![known("sg-ec2")],
            cluster_arn: known("arn:cluster"),
        }
    }

    fn app_spec(service: &str, listener_port: u16, style: TaskDefinitionStyle) -> AppSpec {
        AppSpec {
            service: service.to_string(),
            dockerfile: "../infra-web/Dockerfile".to_string(),
            internal: listener_port != 80,
            listener_port,
            health_check_path: None,
            style,
            environment: vec![],
        }
    }

    fn record(resolution: &mut Resolution, urn: &Urn, attrs: Value) {
        let attrs: Properties = serde_json::from_value(attrs).unwrap();
        resolution.record(urn, attrs).unwrap();
    }

    /// Listener, target group, container mapping and service binding agree.
    fn assert_ports_agree(spec: &AppSpec) {
        let cfg: StackConfig =
            serde_yaml_ng::from_str("project: air-tek\nstack: dev\n").unwrap();
        let provider = MemoryProvider::new("us-east-1");
        let mut ctx = Context::new(&cfg, &provider);
        let app = deploy(&mut ctx, spec, &placement()).unwrap();
        let graph = ctx.into_graph();

        let lb_name = format!("dev-{}-lb", spec.service);
        let tg_urn = Urn::new(ResourceKind::TargetGroup, &format!("{}-tg", lb_name));
        let mut resolution = Resolution::new();
        record(
            &mut resolution,
            &Urn::new(ResourceKind::Image, &spec.service),
            json!({"imageName": "repo:latest"}),
        );
        record(&mut resolution, &tg_urn, json!({"arn": "arn:tg"}));

        let listener = graph.get(&app.load_balancer.listener).unwrap();
        assert_eq!(
            listener.inputs["port"].resolve(&resolution).unwrap(),
            spec.listener_port
        );

        let target_port = graph.get(&tg_urn).unwrap().inputs["port"]
            .resolve(&resolution)
            .unwrap();
        assert_eq!(target_port, SERVICE_PORT);

        let definitions = graph.get(&app.task_definition.urn).unwrap().inputs
            ["containerDefinitions"]
            .resolve(&resolution)
            .unwrap();
        let definitions: Value = match definitions {
            Value::String(doc) => serde_json::from_str(&doc).unwrap(),
            list => list,
        };
        let containers = definitions.as_array().unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0]["portMappings"][0]["containerPort"], target_port);
        assert_eq!(containers[0]["portMappings"][0]["hostPort"], target_port);

        let service = graph.get(&app.service.urn).unwrap();
        let bindings = service.inputs["loadBalancers"].resolve(&resolution).unwrap();
        assert_eq!(bindings[0]["containerPort"], target_port);
        assert_eq!(bindings[0]["containerName"], containers[0]["name"]);
        assert_eq!(bindings[0]["targetGroupArn"], "arn:tg");

        assert!(service.dependencies().contains(&app.task_definition.urn));
        assert!(service.depends_on.contains(&app.load_balancer.listener));
    }

    #[test]
    fn test_deploy_ports_agree_on_port_80_listener() {
        assert_ports_agree(&app_spec("web-ui", 80, TaskDefinitionStyle::Structured));
    }

    #[test]
    fn test_deploy_ports_agree_on_service_port_listener() {
        assert_ports_agree(&app_spec(
            "web-api",
            SERVICE_PORT,
            TaskDefinitionStyle::ContainerJson,
        ));
    }

    #[test]
    fn test_deploy_owns_every_resource() {
        let cfg: StackConfig =
            serde_yaml_ng::from_str("project: air-tek\nstack: dev\n").unwrap();
        let provider = MemoryProvider::new("us-east-1");
        let mut ctx = Context::new(&cfg, &provider);
        let spec = app_spec("web-ui", 80, TaskDefinitionStyle::Structured);
        let app = deploy(&mut ctx, &spec, &placement()).unwrap();
        assert_eq!(app.load_balancer.listener_port, 80);
        assert_eq!(app.load_balancer.target_port, SERVICE_PORT);

        let graph = ctx.into_graph();
        let image = graph
            .get(&Urn::new(ResourceKind::Image, "web-ui"))
            .unwrap();
        assert!(image.secrets.contains("registry"));
        for decl in graph.iter().filter(|d| d.urn != app.urn) {
            assert!(graph.is_descendant(&decl.urn, &app.urn), "{}", decl.urn);
        }

        // The service waits for the listener even though no input reads it.
        let order = crate::core::resolver::build_execution_order(&graph).unwrap();
        let at = |urn: &Urn| order.iter().position(|u| u == urn).unwrap();
        assert!(at(&app.load_balancer.listener) < at(&app.service.urn));
    }
}

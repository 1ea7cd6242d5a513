//! Application load balancer with one target group and one forwarding listener.

use crate::core::error::Result;
use crate::core::graph::Context;
use crate::core::output::{IntoInput, Output};
use crate::core::types::{ResourceKind, Urn};
use serde_json::json;

pub const LOAD_BALANCER_TOKEN: &str = "air-tek:infra:loadbalancer";

#[derive(Debug, Clone)]
pub struct LoadBalancerArgs {
    pub name: String,
    pub vpc_id: Output<String>,
    pub subnets: Vec<Output<String>>,
    pub security_groups: Vec<Output<String>>,
    pub internal: bool,
    pub listener_port: u16,
    pub target_port: u16,
    pub health_check_path: Option<String>,
    pub health_check_port: Option<u16>,
    pub standard_tags: bool,
}

#[derive(Debug, Clone)]
pub struct LoadBalancer {
    pub urn: Urn,
    /// The forwarding listener; services registering targets wait for it
    pub listener: Urn,
    pub dns_name: Output<String>,
    pub target_group_arn: Output<String>,
    pub listener_port: u16,
    pub target_port: u16,
}

impl LoadBalancer {
    /// Externally routable URL of the listener, scheme and port included.
    ///
    /// The component's own `Url` output stays the bare DNS name; the stack
    /// exports and the Web UI output carry this form instead.
    pub fn url(&self) -> Output<String> {
        let port = self.listener_port;
        self.dns_name.map(move |dns| url_for(&dns, port))
    }
}

/// `http://<dns>` on port 80, `http://<dns>:<port>` otherwise.
///
/// A bare DNS name only reaches a listener on port 80, so stack URLs are
/// always built with this rather than exported raw.
pub fn url_for(dns: &str, port: u16) -> String {
    if port == 80 {
        format!("http://{}", dns)
    } else {
        format!("http://{}:{}", dns, port)
    }
}

pub fn new_load_balancer(
    ctx: &mut Context<'_>,
    args: &LoadBalancerArgs,
    parent: Option<&Urn>,
) -> Result<LoadBalancer> {
    let root = ctx.component(LOAD_BALANCER_TOKEN, &args.name, parent)?;
    let tags = ctx.tags(args.standard_tags, &[]);

    let alb = ctx
        .resource(ResourceKind::LoadBalancer, &args.name)
        .parent(&root)
        .input("subnets", args.subnets.as_slice())
        .input("securityGroups", args.security_groups.as_slice())
        .input("internal", args.internal)
        .tags(tags.clone())
        .register()?;

    let mut target_group = ctx
        .resource(ResourceKind::TargetGroup, format!("{}-tg", args.name))
        .parent(&root)
        .input("port", args.target_port)
        .input("protocol", "HTTP")
        .input("targetType", "ip")
        .input("vpcId", &args.vpc_id);
    if let Some(path) = &args.health_check_path {
        let mut check = json!({ "path": path });
        if let Some(port) = args.health_check_port {
            check["port"] = json!(port.to_string());
        }
        target_group = target_group.input("healthCheck", check);
    }
    let target_group = target_group.tags(tags.clone()).register()?;

    let action = Output::object(vec![
        ("type", "forward".into_input()),
        ("targetGroupArn", target_group.arn().into_input()),
    ]);
    let listener = ctx
        .resource(ResourceKind::Listener, format!("{}-listener", args.name))
        .parent(&root)
        .input("loadBalancerArn", alb.arn())
        .input("port", args.listener_port)
        .input("defaultActions", Output::array(vec![action]))
        .tags(tags)
        .register()?;

    let lb = LoadBalancer {
        urn: root.clone(),
        listener: listener.urn,
        dns_name: alb.output("dnsName"),
        target_group_arn: target_group.arn(),
        listener_port: args.listener_port,
        target_port: args.target_port,
    };
    ctx.register_outputs(
        &root,
        vec![
            ("Url", lb.dns_name.clone().into_input()),
            ("TargetGroupArn", lb.target_group_arn.clone().into_input()),
        ],
    )?;
    tracing::debug!(load_balancer = %args.name, listener = args.listener_port, target = args.target_port, "declared load balancer");
    Ok(lb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::output::Resolution;
    use crate::core::types::{Properties, StackConfig};
    use crate::provider::memory::MemoryProvider;

    fn args(listener: u16, health: Option<&str>) -> LoadBalancerArgs {
        LoadBalancerArgs {
            name: "dev-web-api-lb".to_string(),
            vpc_id: Output::known("vpc-1".to_string()),
            subnets: vec![
                Output::known("subnet-a".to_string()),
                Output::known("subnet-b".to_string()),
            ],
            security_groups: vec![Output::known("sg-lb".to_string())],
            internal: true,
            listener_port: listener,
            target_port: 5000,
            health_check_path: health.map(str::to_string),
            health_check_port: health.map(|_| 5000),
            standard_tags: false,
        }
    }

    fn config() -> StackConfig {
        serde_yaml_ng::from_str("project: air-tek\nstack: dev\n").unwrap()
    }

    #[test]
    fn test_url_rule() {
        assert_eq!(url_for("lb.example", 80), "http://lb.example");
        assert_eq!(url_for("lb.example", 5000), "http://lb.example:5000");
    }

    #[test]
    fn test_declares_balancer_target_group_listener() {
        let cfg = config();
        let provider = MemoryProvider::new("us-east-1");
        let mut ctx = Context::new(&cfg, &provider);
        let lb = new_load_balancer(&mut ctx, &args(5000, Some("/WeatherForecast")), None).unwrap();
        let graph = ctx.into_graph();
        assert_eq!(graph.len(), 4);

        let r = Resolution::new();
        let tg = graph
            .get(&Urn::new(ResourceKind::TargetGroup, "dev-web-api-lb-tg"))
            .unwrap();
        assert_eq!(tg.inputs["port"].resolve(&r).unwrap(), 5000);
        assert_eq!(tg.inputs["targetType"].resolve(&r).unwrap(), "ip");
        assert_eq!(
            tg.inputs["healthCheck"].resolve(&r).unwrap(),
            json!({"path": "/WeatherForecast", "port": "5000"})
        );
        assert!(!tg.inputs.contains_key("tags"));

        let listener = graph
            .get(&Urn::new(ResourceKind::Listener, "dev-web-api-lb-listener"))
            .unwrap();
        assert_eq!(listener.inputs["port"].resolve(&r).unwrap(), 5000);
        assert!(listener.dependencies().contains(&tg.urn));

        let alb = Urn::new(ResourceKind::LoadBalancer, "dev-web-api-lb");
        let mut resolution = Resolution::new();
        let mut attrs = Properties::new();
        attrs.insert("dnsName".to_string(), json!("internal-api.elb.example"));
        resolution.record(&alb, attrs).unwrap();
        assert_eq!(
            lb.url().resolve(&resolution).unwrap(),
            "http://internal-api.elb.example:5000"
        );
        let component = graph.get(&lb.urn).unwrap();
        assert_eq!(
            component.inputs["Url"].resolve(&resolution).unwrap(),
            "internal-api.elb.example"
        );
    }

    #[test]
    fn test_no_health_check_without_path() {
        let cfg = config();
        let provider = MemoryProvider::new("us-east-1");
        let mut ctx = Context::new(&cfg, &provider);
        new_load_balancer(&mut ctx, &args(80, None), None).unwrap();
        let tg = ctx
            .graph()
            .get(&Urn::new(ResourceKind::TargetGroup, "dev-web-api-lb-tg"))
            .unwrap();
        assert!(!tg.inputs.contains_key("healthCheck"));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Port 80 never appears in the URL; any other port always does.
            #[test]
            fn url_carries_non_default_port(dns in "[a-z0-9.-]{1,40}", port in 1u16..) {
                let url = url_for(&dns, port);
                prop_assert!(url.starts_with("http://"));
                if port == 80 {
                    prop_assert_eq!(url, format!("http://{}", dns));
                } else {
                    let suffix = format!(":{}", port);
                    prop_assert!(url.ends_with(&suffix));
                }
            }
        }
    }
}

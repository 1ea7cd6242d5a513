//! Top-level composition of the stack.

use super::application::Placement;
use super::network::{new_network, Network};
use super::web_api::new_web_api;
use super::web_ui::new_web_ui;
use crate::core::error::Result;
use crate::core::graph::{Context, ResourceGraph};
use crate::core::output::Output;
use crate::core::types::{ResourceKind, StackConfig};
use crate::provider::Provider;

fn placement(
    network: &Network,
    cluster_arn: &Output<String>,
    load_balancer_subnets: Vec<Output<String>>,
    load_balancer_sg: &Output<String>,
    service_sg: &Output<String>,
) -> Placement {
    Placement {
        network_name: network.name.clone(),
        vpc_id: network.vpc_id.clone(),
        load_balancer_subnets,
        load_balancer_security_groups: vec![load_balancer_sg.clone()],
        service_subnets: network.private_subnets(),
        service_security_groups: vec![service_sg.clone()],
        cluster_arn: cluster_arn.clone(),
    }
}

/// Network, shared cluster, Web API, then Web UI; exports the stack outputs.
pub fn build(ctx: &mut Context<'_>) -> Result<()> {
    let network = new_network(ctx)?;

    let tags = ctx.tags(ctx.config().tagging.standard_tags, &[]);
    let cluster = ctx
        .resource(ResourceKind::Cluster, format!("{}-ecs-cluster", network.name))
        .tags(tags)
        .register()?;
    let cluster_arn = cluster.arn();

    let web_api = new_web_api(
        ctx,
        &placement(
            &network,
            &cluster_arn,
            network.private_subnets(),
            &network.web_api_lb_sg_id,
            &network.web_api_ec2_sg_id,
        ),
    )?;
    let web_ui = new_web_ui(
        ctx,
        &placement(
            &network,
            &cluster_arn,
            network.public_subnets(),
            &network.web_ui_lb_sg_id,
            &network.web_ui_ec2_sg_id,
        ),
        &web_api.api_endpoint,
    )?;

    ctx.export("vpcId", &network.vpc_id);
    ctx.export("web-api-url", &web_api.url);
    ctx.export("web-ui-url", &web_ui.url);
    Ok(())
}

/// Build the resource graph of a stack.
pub fn compose(config: &StackConfig, provider: &dyn Provider) -> Result<ResourceGraph> {
    let mut ctx = Context::new(config, provider);
    build(&mut ctx)?;
    let graph = ctx.into_graph();
    tracing::debug!(stack = %config.stack, resources = graph.len(), "composed");
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::application::APPLICATION_TOKEN;
    use crate::core::error::InfraError;
    use crate::core::executor::{self, UpConfig};
    use crate::core::state;
    use crate::core::types::{ResourceStatus, Urn};
    use crate::provider::memory::MemoryProvider;
    use serde_json::Value;

    fn config() -> StackConfig {
        crate::core::parser::parse_config(
            r#"
project: air-tek
stack: dev
config:
  network:name: dev
  network:vpcRange: 10.1.0.0/16
"#,
        )
        .unwrap()
    }

    fn up_cfg<'a>(
        cfg: &'a StackConfig,
        dir: &'a std::path::Path,
        provider: &'a MemoryProvider,
    ) -> UpConfig<'a> {
        UpConfig {
            config: cfg,
            state_dir: dir,
            provider,
            force: false,
        }
    }

    #[test]
    fn test_compose_registers_web_api_before_web_ui() {
        let cfg = config();
        let provider = MemoryProvider::new("us-east-1");
        let graph = compose(&cfg, &provider).unwrap();

        let apps: Vec<_> = graph
            .iter()
            .filter(|d| d.type_token.as_deref() == Some(APPLICATION_TOKEN))
            .map(|d| d.urn.clone())
            .collect();
        assert_eq!(apps.len(), 2);
        let positions = |app: &Urn| -> Vec<usize> {
            graph
                .iter()
                .filter(|d| &d.urn == app || graph.is_descendant(&d.urn, app))
                .filter_map(|d| graph.position(&d.urn))
                .collect()
        };
        let api = positions(&Urn::new(ResourceKind::Component, "dev-web-api"));
        let ui = positions(&Urn::new(ResourceKind::Component, "dev-web-ui"));
        assert!(api.iter().max().unwrap() < ui.iter().min().unwrap());

        let ui_td = graph
            .get(&Urn::new(ResourceKind::TaskDefinition, "dev-web-ui-ecs-task-def"))
            .unwrap();
        assert!(ui_td
            .dependencies()
            .contains(&Urn::new(ResourceKind::LoadBalancer, "dev-web-api-lb")));
        assert_eq!(graph.outputs().len(), 3);
    }

    #[test]
    fn test_missing_config_fails_before_registration() {
        let mut cfg = config();
        cfg.config.remove("network:name");
        let provider = MemoryProvider::new("us-east-1");
        let mut ctx = Context::new(&cfg, &provider);
        assert!(matches!(build(&mut ctx), Err(InfraError::MissingConfig(_))));
        assert!(ctx.graph().is_empty());
    }

    #[test]
    fn test_end_to_end_up() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config();
        let provider = MemoryProvider::new("us-east-1");
        let graph = compose(&cfg, &provider).unwrap();
        let result = executor::up(&up_cfg(&cfg, dir.path(), &provider), &graph).unwrap();

        for key in ["vpcId", "web-api-url", "web-ui-url"] {
            let value = result.outputs[key].as_str().unwrap();
            assert!(!value.is_empty(), "{} is empty", key);
        }
        let api_url = result.outputs["web-api-url"].as_str().unwrap();
        assert!(api_url.starts_with("http://internal-dev-web-api-lb-"));
        assert!(api_url.ends_with(":5000"));
        let ui_url = result.outputs["web-ui-url"].as_str().unwrap();
        assert!(ui_url.starts_with("http://dev-web-ui-lb-"));
        assert!(!ui_url.ends_with(":80"));

        let lock = state::load_lock(dir.path(), "dev").unwrap().unwrap();
        assert!(lock
            .resources
            .values()
            .all(|r| r.status == ResourceStatus::Converged));
        assert!(!lock
            .resources
            .values()
            .any(|r| r.kind == ResourceKind::RegistryCredentials));

        let endpoint = &lock.resources[&Urn::new(ResourceKind::Component, "dev-web-api")]
            .attributes["ApiEndpoint"];
        let ui_td = provider
            .attributes(ResourceKind::TaskDefinition, "dev-web-ui-ecs-task-def")
            .unwrap();
        let environment = ui_td["containerDefinitions"][0]["environment"]
            .as_array()
            .unwrap();
        let api_address: Vec<&Value> = environment
            .iter()
            .filter(|e| e["name"] == "ApiAddress")
            .collect();
        assert_eq!(api_address.len(), 1);
        assert_eq!(&api_address[0]["value"], endpoint);
        assert!(endpoint.as_str().unwrap().ends_with(":5000/WeatherForecast"));

        let api_td = provider
            .attributes(ResourceKind::TaskDefinition, "dev-web-api-ecs-task-def")
            .unwrap();
        assert_eq!(
            api_td["containerDefinitions"][0]["portMappings"][0]["containerPort"],
            5000
        );

        let yaml = std::fs::read_to_string(state::lock_file_path(dir.path(), "dev")).unwrap();
        assert!(!yaml.contains("password"));
        assert!(!yaml.contains("authorizationToken"));
    }

    #[test]
    fn test_second_up_is_noop_and_destroy_empties() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config();
        let provider = MemoryProvider::new("us-east-1");
        let graph = compose(&cfg, &provider).unwrap();
        let first = executor::up(&up_cfg(&cfg, dir.path(), &provider), &graph).unwrap();
        assert!(first.resources_created > 0);

        let second = executor::up(&up_cfg(&cfg, dir.path(), &provider), &graph).unwrap();
        assert_eq!(second.resources_created, 0);
        assert_eq!(second.resources_updated, 0);
        assert_eq!(second.resources_deleted, 0);
        assert_eq!(second.outputs, first.outputs);

        let destroyed = executor::destroy(&up_cfg(&cfg, dir.path(), &provider)).unwrap();
        assert_eq!(destroyed.resources_deleted, first.resources_created);
        assert!(provider.is_empty());
    }

    #[test]
    fn test_up_resumes_against_rehydrated_provider() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config();
        let provider = MemoryProvider::new("us-east-1");
        let graph = compose(&cfg, &provider).unwrap();
        executor::up(&up_cfg(&cfg, dir.path(), &provider), &graph).unwrap();

        let lock = state::load_lock(dir.path(), "dev").unwrap().unwrap();
        let restored = MemoryProvider::from_lock("us-east-1", &lock);
        let again = executor::up(&up_cfg(&cfg, dir.path(), &restored), &graph).unwrap();
        assert_eq!(again.resources_created + again.resources_updated, 0);
    }

    #[test]
    fn test_malformed_registry_token_fails_up() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config();
        let provider = MemoryProvider::new("us-east-1");
        provider.issue_token("%%%not-base64");
        let graph = compose(&cfg, &provider).unwrap();

        let err = executor::up(&up_cfg(&cfg, dir.path(), &provider), &graph).unwrap_err();
        assert!(matches!(err, InfraError::CredentialDecode(_)));
        for repo in ["dev-web-api-ecr", "dev-web-ui-ecr"] {
            let url = format!(
                "{}.dkr.ecr.us-east-1.amazonaws.com/{}",
                crate::provider::memory::ACCOUNT_ID,
                repo
            );
            assert!(provider.images(&url).is_empty());
        }
        let lock = state::load_lock(dir.path(), "dev").unwrap().unwrap();
        let failed: Vec<_> = lock
            .resources
            .values()
            .filter(|r| r.status == ResourceStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].kind, ResourceKind::Image);
        assert!(lock.outputs.is_empty());
    }

    #[test]
    fn test_preview_marks_dependents_known_after_apply() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config();
        let provider = MemoryProvider::new("us-east-1");
        let graph = compose(&cfg, &provider).unwrap();
        let plan = executor::preview(&up_cfg(&cfg, dir.path(), &provider), &graph).unwrap();
        assert_eq!(plan.to_read, 2);
        assert_eq!(plan.to_create as usize, graph.len() - 2);
        assert!(provider.calls().is_empty());
    }
}

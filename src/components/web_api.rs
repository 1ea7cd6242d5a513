//! Web API: internal balancer on the service port, container-JSON task definition.

use super::application::{deploy, AppSpec, Application, Placement, TaskDefinitionStyle};
use super::network::SERVICE_PORT;
use crate::core::error::Result;
use crate::core::graph::Context;
use crate::core::output::{IntoInput, Output};

pub const HEALTH_CHECK_PATH: &str = "/WeatherForecast";

#[derive(Debug, Clone)]
pub struct WebApi {
    pub app: Application,
    pub url: Output<String>,
    /// Health-check endpoint handed to the Web UI
    pub api_endpoint: Output<String>,
}

pub fn health_endpoint(dns: &str) -> String {
    format!("http://{}:{}{}", dns, SERVICE_PORT, HEALTH_CHECK_PATH)
}

pub fn new_web_api(ctx: &mut Context<'_>, placement: &Placement) -> Result<WebApi> {
    let spec = AppSpec {
        service: "web-api".to_string(),
        dockerfile: "../infra-api/Dockerfile".to_string(),
        internal: true,
        listener_port: SERVICE_PORT,
        health_check_path: Some(HEALTH_CHECK_PATH.to_string()),
        style: TaskDefinitionStyle::ContainerJson,
        environment: Vec::new(),
    };
    let app = deploy(ctx, &spec, placement)?;
    let api_endpoint = app.load_balancer.dns_name.map(|dns| health_endpoint(&dns));
    ctx.register_outputs(
        &app.urn,
        vec![
            ("Url", app.url.clone().into_input()),
            ("ApiEndpoint", api_endpoint.clone().into_input()),
        ],
    )?;
    Ok(WebApi {
        url: app.url.clone(),
        api_endpoint,
        app,
    })
}

//! Web UI: internet-facing balancer on port 80, structured task definition
//! carrying the Web API endpoint as `ApiAddress`.

use super::application::{deploy, AppSpec, Application, Placement, TaskDefinitionStyle};
use crate::core::error::Result;
use crate::core::graph::Context;
use crate::core::output::{IntoInput, Output};

pub const API_ADDRESS_VAR: &str = "ApiAddress";

#[derive(Debug, Clone)]
pub struct WebUi {
    pub app: Application,
    pub url: Output<String>,
}

/// Declare the Web UI. The API endpoint comes from an already declared Web API.
pub fn new_web_ui(
    ctx: &mut Context<'_>,
    placement: &Placement,
    api_endpoint: &Output<String>,
) -> Result<WebUi> {
    let spec = AppSpec {
        service: "web-ui".to_string(),
        dockerfile: "../infra-web/Dockerfile".to_string(),
        internal: false,
        listener_port: 80,
        health_check_path: None,
        style: TaskDefinitionStyle::Structured,
        environment: vec![(API_ADDRESS_VAR.to_string(), api_endpoint.clone())],
    };
    let app = deploy(ctx, &spec, placement)?;
    ctx.register_outputs(&app.urn, vec![("Url", app.url.clone().into_input())])?;
    Ok(WebUi {
        url: app.url.clone(),
        app,
    })
}

//! Container registry with short-lived push credentials.

use crate::core::error::{InfraError, Result};
use crate::core::graph::Context;
use crate::core::output::{IntoInput, Output};
use crate::core::types::{ResourceKind, Urn};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

pub const REGISTRY_TOKEN: &str = "air-tek:infra:ecr";

#[derive(Debug, Clone)]
pub struct RegistryArgs {
    pub name: String,
    pub standard_tags: bool,
}

#[derive(Debug, Clone)]
pub struct ContainerRegistry {
    pub urn: Urn,
    pub repository_url: Output<String>,
    pub registry_id: Output<String>,
    pub username: Output<String>,
    pub password: Output<String>,
}

impl ContainerRegistry {
    /// Registry login for an image push. Always passed as a secret input.
    pub fn login(&self) -> Output<serde_json::Value> {
        Output::object(vec![
            ("server", self.repository_url.clone().into_input()),
            ("username", self.username.clone().into_input()),
            ("password", self.password.clone().into_input()),
        ])
    }
}

fn decode_failure(reason: String) -> InfraError {
    tracing::error!(%reason, "registry credentials could not be decoded");
    InfraError::CredentialDecode(reason)
}

/// Split a base64 `user:password` token at the first colon.
pub fn decode_credentials(token: &str) -> Result<(String, String)> {
    let bytes = BASE64
        .decode(token.trim())
        .map_err(|e| decode_failure(format!("token is not valid base64: {}", e)))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| decode_failure("token is not valid UTF-8".to_string()))?;
    let (user, password) = text
        .split_once(':')
        .ok_or_else(|| decode_failure("token has no ':' separator".to_string()))?;
    Ok((user.to_string(), password.to_string()))
}

/// Declare a repository and its credentials lookup.
pub fn new_registry(
    ctx: &mut Context<'_>,
    args: &RegistryArgs,
    parent: Option<&Urn>,
) -> Result<ContainerRegistry> {
    let root = ctx.component(REGISTRY_TOKEN, &args.name, parent)?;
    let tags = ctx.tags(args.standard_tags, &[]);
    let repo = ctx
        .resource(ResourceKind::Repository, &args.name)
        .parent(&root)
        .input("forceDelete", true)
        .tags(tags)
        .register()?;

    let credentials = ctx
        .resource(ResourceKind::RegistryCredentials, format!("{}-credentials", args.name))
        .parent(&root)
        .input("registryId", repo.output::<String>("registryId"))
        .register()?;
    let decoded = credentials
        .output::<String>("authorizationToken")
        .try_map(|token| decode_credentials(&token));

    let registry = ContainerRegistry {
        urn: root.clone(),
        repository_url: repo.output("repositoryUrl"),
        registry_id: repo.output("registryId"),
        username: decoded.map(|(user, _)| user),
        password: decoded.map(|(_, password)| password),
    };
    ctx.register_outputs(
        &root,
        vec![
            ("RepositoryUrl", registry.repository_url.clone().into_input()),
            ("RegistryId", registry.registry_id.clone().into_input()),
        ],
    )?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::output::Resolution;
    use crate::core::types::{Properties, StackConfig};
    use crate::provider::memory::MemoryProvider;
    use serde_json::json;

    #[test]
    fn test_decode_credentials() {
        let token = BASE64.encode("alice:secret123");
        let (user, pass) = decode_credentials(&token).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "secret123");
    }

    #[test]
    fn test_decode_splits_at_first_colon() {
        let token = BASE64.encode("AWS:pa:ss:word");
        assert_eq!(
            decode_credentials(&token).unwrap(),
            ("AWS".to_string(), "pa:ss:word".to_string())
        );
    }

    #[test]
    fn test_decode_rejects_malformed_tokens() {
        assert!(matches!(
            decode_credentials("%%%not-base64"),
            Err(InfraError::CredentialDecode(_))
        ));
        assert!(matches!(
            decode_credentials(&BASE64.encode("no-separator")),
            Err(InfraError::CredentialDecode(_))
        ));
        assert!(matches!(
            decode_credentials(&BASE64.encode([0xff, 0xfe, b':'])),
            Err(InfraError::CredentialDecode(_))
        ));
    }

    #[test]
    fn test_registry_declaration() {
        let cfg: StackConfig = serde_yaml_ng::from_str(
            "project: air-tek\nstack: dev\nconfig:\n  network:name: dev\n",
        )
        .unwrap();
        let provider = MemoryProvider::new("us-east-1");
        let mut ctx = Context::new(&cfg, &provider);
        let args = RegistryArgs {
            name: "dev-web-api-ecr".to_string(),
            standard_tags: true,
        };
        let registry = new_registry(&mut ctx, &args, None).unwrap();
        let graph = ctx.into_graph();
        assert_eq!(graph.len(), 3);

        let creds = Urn::new(ResourceKind::RegistryCredentials, "dev-web-api-ecr-credentials");
        assert!(registry.password.dependencies().contains(&creds));
        let repo = graph
            .get(&Urn::new(ResourceKind::Repository, "dev-web-api-ecr"))
            .unwrap();
        let r = Resolution::new();
        assert_eq!(repo.inputs["forceDelete"].resolve(&r).unwrap(), true);
        assert_eq!(
            repo.inputs["tags"].resolve(&r).unwrap()["air-tek:stack"],
            "dev"
        );

        let mut resolution = Resolution::new();
        let mut attrs = Properties::new();
        attrs.insert(
            "authorizationToken".to_string(),
            json!(BASE64.encode("AWS:hunter2")),
        );
        resolution.record(&creds, attrs).unwrap();
        assert_eq!(registry.username.resolve(&resolution).unwrap(), "AWS");
        assert_eq!(registry.password.resolve(&resolution).unwrap(), "hunter2");
    }
}

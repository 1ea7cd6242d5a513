//! Resource declarations and the composition context.
//!
//! Modules register resources through a [`Context`]. Registration is strictly
//! bottom-up: every input may only reference resources that are already in the
//! graph, so the ownership tree and the dependency DAG are built together.

use super::error::{InfraError, Result};
use super::output::{IntoInput, Output, Resolution};
use super::parser::ConfigSet;
use super::types::{Properties, ResourceKind, StackConfig, Urn};
use crate::provider::Provider;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;

/// One declared resource.
#[derive(Debug, Clone)]
pub struct ResourceDecl {
    pub urn: Urn,
    pub kind: ResourceKind,
    pub name: String,
    /// Component type token (e.g. `air-tek:infra:network`)
    pub type_token: Option<String>,
    pub parent: Option<Urn>,
    pub inputs: IndexMap<String, Output<serde_json::Value>>,
    /// Input keys that never reach the lock file or the input hash
    pub secrets: BTreeSet<String>,
    pub depends_on: Vec<Urn>,
}

impl ResourceDecl {
    /// Every URN this resource must wait for.
    pub fn dependencies(&self) -> BTreeSet<Urn> {
        let mut deps: BTreeSet<Urn> = self
            .inputs
            .values()
            .flat_map(|o| o.dependencies().iter().cloned())
            .collect();
        deps.extend(self.depends_on.iter().cloned());
        deps
    }

    /// Resolve all inputs, secrets included.
    pub fn resolve_inputs(&self, resolution: &Resolution) -> Result<Properties> {
        self.inputs
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.resolve(resolution)?)))
            .collect()
    }

    /// Resolve inputs that participate in the desired-state hash.
    pub fn resolve_public_inputs(&self, resolution: &Resolution) -> Result<Properties> {
        self.inputs
            .iter()
            .filter(|(k, _)| !self.secrets.contains(*k))
            .map(|(k, v)| Ok((k.clone(), v.resolve(resolution)?)))
            .collect()
    }
}

/// Handle to a registered resource.
#[derive(Debug, Clone)]
pub struct ResourceRef {
    pub urn: Urn,
    pub kind: ResourceKind,
}

impl ResourceRef {
    /// A provider-reported attribute of this resource.
    pub fn output<T: DeserializeOwned + Clone + Send + Sync + 'static>(
        &self,
        key: &str,
    ) -> Output<T> {
        Output::attribute(&self.urn, key)
    }

    pub fn id(&self) -> Output<String> {
        self.output("id")
    }

    pub fn arn(&self) -> Output<String> {
        self.output("arn")
    }
}

/// The declared resources of one stack plus its exported outputs.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    resources: IndexMap<Urn, ResourceDecl>,
    outputs: IndexMap<String, Output<serde_json::Value>>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a declaration. Duplicates and dangling references are rejected.
    pub fn insert(&mut self, decl: ResourceDecl) -> Result<()> {
        if self.resources.contains_key(&decl.urn) {
            return Err(InfraError::DuplicateResource(decl.urn));
        }
        for dep in decl.dependencies().iter().chain(decl.parent.iter()) {
            if !self.resources.contains_key(dep) {
                return Err(InfraError::UnknownDependency {
                    resource: decl.urn.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        self.resources.insert(decl.urn.clone(), decl);
        Ok(())
    }

    /// Add a declaration without reference checks.
    #[cfg(test)]
    pub(crate) fn insert_unchecked(&mut self, decl: ResourceDecl) {
        self.resources.insert(decl.urn.clone(), decl);
    }

    pub fn get(&self, urn: &Urn) -> Option<&ResourceDecl> {
        self.resources.get(urn)
    }

    pub fn contains(&self, urn: &Urn) -> bool {
        self.resources.contains_key(urn)
    }

    /// Declarations in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceDecl> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Registration index of a resource.
    pub fn position(&self, urn: &Urn) -> Option<usize> {
        self.resources.get_index_of(urn)
    }

    /// Direct children of a component (or roots, for `None`).
    pub fn children(&self, parent: Option<&Urn>) -> Vec<&ResourceDecl> {
        self.resources
            .values()
            .filter(|d| d.parent.as_ref() == parent)
            .collect()
    }

    /// All declarations of one kind.
    pub fn of_kind(&self, kind: ResourceKind) -> Vec<&ResourceDecl> {
        self.resources.values().filter(|d| d.kind == kind).collect()
    }

    /// True when `urn` sits anywhere below `ancestor` in the ownership tree.
    pub fn is_descendant(&self, urn: &Urn, ancestor: &Urn) -> bool {
        let mut current = self.get(urn).and_then(|d| d.parent.clone());
        while let Some(p) = current {
            if &p == ancestor {
                return true;
            }
            current = self.get(&p).and_then(|d| d.parent.clone());
        }
        false
    }

    pub fn export(&mut self, name: &str, value: Output<serde_json::Value>) {
        self.outputs.insert(name.to_string(), value);
    }

    pub fn outputs(&self) -> &IndexMap<String, Output<serde_json::Value>> {
        &self.outputs
    }

    fn set_component_outputs(
        &mut self,
        component: &Urn,
        outputs: IndexMap<String, Output<serde_json::Value>>,
    ) -> Result<()> {
        for output in outputs.values() {
            for dep in output.dependencies() {
                if !self.resources.contains_key(dep) {
                    return Err(InfraError::UnknownDependency {
                        resource: component.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        let decl = self
            .resources
            .get_mut(component)
            .filter(|d| d.kind.is_component())
            .ok_or_else(|| InfraError::State(format!("'{}' is not a component", component)))?;
        decl.inputs = outputs;
        Ok(())
    }
}

/// Explicit composition context handed to every module constructor.
pub struct Context<'a> {
    config: &'a StackConfig,
    provider: &'a dyn Provider,
    graph: ResourceGraph,
}

impl<'a> Context<'a> {
    pub fn new(config: &'a StackConfig, provider: &'a dyn Provider) -> Self {
        Self {
            config,
            provider,
            graph: ResourceGraph::new(),
        }
    }

    pub fn config(&self) -> &'a StackConfig {
        self.config
    }

    /// Namespaced view of the stack configuration.
    pub fn config_set(&self, namespace: &'a str) -> ConfigSet<'a> {
        ConfigSet::new(self.config, namespace)
    }

    pub fn provider(&self) -> &'a dyn Provider {
        self.provider
    }

    pub fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    pub fn into_graph(self) -> ResourceGraph {
        self.graph
    }

    /// Start declaring a provider resource.
    pub fn resource(&mut self, kind: ResourceKind, name: impl Into<String>) -> ResourceBuilder<'_, 'a> {
        let name = name.into();
        ResourceBuilder {
            decl: ResourceDecl {
                urn: Urn::new(kind, &name),
                kind,
                name,
                type_token: None,
                parent: None,
                inputs: IndexMap::new(),
                secrets: BTreeSet::new(),
                depends_on: Vec::new(),
            },
            ctx: self,
        }
    }

    /// Register a component node that owns the resources declared under it.
    pub fn component(&mut self, type_token: &str, name: &str, parent: Option<&Urn>) -> Result<Urn> {
        let mut builder = self.resource(ResourceKind::Component, name);
        builder.decl.type_token = Some(type_token.to_string());
        if let Some(p) = parent {
            builder = builder.parent(p);
        }
        Ok(builder.register()?.urn)
    }

    /// Publish a component's outputs; the component completes after them.
    pub fn register_outputs(
        &mut self,
        component: &Urn,
        outputs: Vec<(&str, Output<serde_json::Value>)>,
    ) -> Result<()> {
        let map = outputs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        self.graph.set_component_outputs(component, map)
    }

    /// Publish a stack output.
    pub fn export(&mut self, name: &str, value: impl IntoInput) {
        self.graph.export(name, value.into_input());
    }

    /// Tags for a taggable resource. Standard tags are added when `standard` is set.
    pub fn tags(&self, standard: bool, extra: &[(&str, &str)]) -> serde_json::Value {
        let mut tags = serde_json::Map::new();
        for (k, v) in extra {
            tags.insert(k.to_string(), serde_json::Value::String(v.to_string()));
        }
        if standard {
            let prefix = &self.config.tagging.prefix;
            let network = self.config_set("network").get("name").unwrap_or_default();
            tags.insert(format!("{}:project", prefix), self.config.project.clone().into());
            tags.insert(format!("{}:stack", prefix), self.config.stack.clone().into());
            tags.insert(format!("{}:network", prefix), network.into());
        }
        serde_json::Value::Object(tags)
    }
}

/// Builder for one resource declaration.
pub struct ResourceBuilder<'c, 'a> {
    ctx: &'c mut Context<'a>,
    decl: ResourceDecl,
}

impl ResourceBuilder<'_, '_> {
    pub fn parent(mut self, parent: &Urn) -> Self {
        self.decl.parent = Some(parent.clone());
        self
    }

    pub fn input(mut self, key: &str, value: impl IntoInput) -> Self {
        self.decl.inputs.insert(key.to_string(), value.into_input());
        self
    }

    /// An input that is sent to the provider but never persisted or hashed.
    pub fn secret_input(mut self, key: &str, value: impl IntoInput) -> Self {
        self.decl.secrets.insert(key.to_string());
        self.input(key, value)
    }

    /// Attach tags; an empty tag set is omitted.
    pub fn tags(self, tags: serde_json::Value) -> Self {
        if tags.as_object().is_some_and(|t| t.is_empty()) {
            return self;
        }
        self.input("tags", tags)
    }

    pub fn depends_on(mut self, dependency: &Urn) -> Self {
        self.decl.depends_on.push(dependency.clone());
        self
    }

    pub fn register(self) -> Result<ResourceRef> {
        let urn = self.decl.urn.clone();
        let kind = self.decl.kind;
        tracing::debug!(resource = %urn, parent = ?self.decl.parent, "registered");
        self.ctx.graph.insert(self.decl)?;
        Ok(ResourceRef { urn, kind })
    }
}

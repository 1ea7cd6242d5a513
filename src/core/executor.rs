//! Executor: orchestration loop for `up`, `preview` and `destroy`.
//!
//! `up` walks the resource graph in topological order:
//! DAG → decide (hash vs lock) → provider call → record attributes → lock → events.
//! The first failure stops the run. Resources converged before it stay in the
//! lock, the failing one is recorded as failed, and the error is returned.

use super::error::{InfraError, Result};
use super::graph::{ResourceDecl, ResourceGraph};
use super::output::Resolution;
use super::planner::{self, Decision};
use super::resolver;
use super::state;
use super::types::*;
use crate::provider::Provider;
use crate::tripwire::eventlog;
use std::path::Path;
use std::time::Instant;

/// Configuration for an engine run.
pub struct UpConfig<'a> {
    pub config: &'a StackConfig,
    pub state_dir: &'a Path,
    pub provider: &'a dyn Provider,
    pub force: bool,
}

impl UpConfig<'_> {
    fn log_event(&self, event: ProvenanceEvent) {
        if !self.config.policy.event_log {
            return;
        }
        if let Err(e) = eventlog::append_event(self.state_dir, &self.config.stack, event) {
            tracing::warn!(error = %e, "cannot append provenance event");
        }
    }

    fn stack(&self) -> String {
        self.config.stack.clone()
    }
}

/// Compute the plan without touching the provider.
pub fn preview(cfg: &UpConfig, graph: &ResourceGraph) -> Result<ExecutionPlan> {
    let order = resolver::build_execution_order(graph)?;
    let lock = state::load_lock(cfg.state_dir, &cfg.config.stack)?;
    planner::plan(graph, &cfg.config.stack, &order, lock.as_ref(), cfg.force)
}

/// Outcome of applying one declaration.
enum Outcome {
    Created,
    Updated,
    Unchanged,
    Read,
}

/// Converge the stack to the declared graph.
pub fn up(cfg: &UpConfig, graph: &ResourceGraph) -> Result<UpResult> {
    let start = Instant::now();
    let stack = cfg.config.stack.as_str();
    let order = resolver::build_execution_order(graph)?;
    let previous = state::load_lock(cfg.state_dir, stack)?;
    let mut lock = previous
        .clone()
        .unwrap_or_else(|| state::new_lock(&cfg.config.project, stack));
    let run_id = eventlog::generate_run_id();

    tracing::info!(stack, run_id = %run_id, resources = graph.len(), provider = cfg.provider.name(), "up started");
    cfg.log_event(ProvenanceEvent::UpStarted {
        stack: cfg.stack(),
        run_id: run_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    });

    let mut resolution = Resolution::new();
    let mut created = 0u32;
    let mut updated = 0u32;
    let mut unchanged = 0u32;

    for urn in &order {
        let Some(decl) = graph.get(urn) else {
            continue;
        };
        let outcome = apply_one(cfg, decl, previous.as_ref(), &mut lock, &mut resolution);
        match outcome {
            Ok(Outcome::Created) => created += 1,
            Ok(Outcome::Updated) => updated += 1,
            Ok(Outcome::Unchanged) | Ok(Outcome::Read) => unchanged += 1,
            Err(e) => {
                tracing::error!(resource = %urn, error = %e, "up failed");
                cfg.log_event(ProvenanceEvent::ResourceFailed {
                    stack: cfg.stack(),
                    resource: urn.to_string(),
                    error: e.to_string(),
                });
                lock.generated_at = eventlog::now_iso8601();
                state::save_lock(cfg.state_dir, &lock)?;
                return Err(e);
            }
        }
    }

    let mut deleted = 0u32;
    let orphans: Vec<(Urn, ResourceLock)> =
        resolver::teardown_order(&planner::orphans(graph, previous.as_ref()))
            .into_iter()
            .map(|(u, r)| (u.clone(), r.clone()))
            .collect();
    for (urn, rl) in orphans {
        if let Err(e) = delete_one(cfg, &urn, &rl) {
            lock.generated_at = eventlog::now_iso8601();
            state::save_lock(cfg.state_dir, &lock)?;
            return Err(e);
        }
        lock.resources.shift_remove(&urn);
        deleted += 1;
    }

    lock.outputs.clear();
    for (name, output) in graph.outputs() {
        lock.outputs.insert(name.clone(), output.resolve(&resolution)?);
    }
    lock.generated_at = eventlog::now_iso8601();
    state::save_lock(cfg.state_dir, &lock)?;

    let total_duration = start.elapsed();
    cfg.log_event(ProvenanceEvent::UpCompleted {
        stack: cfg.stack(),
        run_id,
        resources_created: created,
        resources_updated: updated,
        resources_unchanged: unchanged,
        resources_deleted: deleted,
        total_seconds: total_duration.as_secs_f64(),
    });
    tracing::info!(stack, created, updated, unchanged, deleted, "up completed");

    Ok(UpResult {
        stack: cfg.stack(),
        resources_created: created,
        resources_updated: updated,
        resources_unchanged: unchanged,
        resources_deleted: deleted,
        outputs: lock.outputs.clone(),
        total_duration,
    })
}

/// Apply a single declaration, recording its attributes.
fn apply_one(
    cfg: &UpConfig,
    decl: &ResourceDecl,
    previous: Option<&StateLock>,
    lock: &mut StateLock,
    resolution: &mut Resolution,
) -> Result<Outcome> {
    let Decision { action, hash, .. } =
        planner::determine_action(decl, resolution, previous, cfg.force)?;
    let recorded = previous.and_then(|l| l.resources.get(&decl.urn));

    match action {
        PlanAction::Read => {
            let inputs = decl.resolve_inputs(resolution)?;
            let attributes = cfg.provider.invoke(decl.kind, &inputs)?;
            tracing::debug!(resource = %decl.urn, "read");
            resolution.record(&decl.urn, attributes)?;
            return Ok(Outcome::Read);
        }
        PlanAction::NoOp => {
            if let Some(entry) = lock.resources.get_mut(&decl.urn) {
                entry.depends_on = decl.dependencies().into_iter().collect();
            }
            let attributes = recorded.map(|r| r.attributes.clone()).unwrap_or_default();
            resolution.record(&decl.urn, attributes)?;
            return Ok(Outcome::Unchanged);
        }
        PlanAction::Create | PlanAction::Update | PlanAction::Destroy => {}
    }

    cfg.log_event(ProvenanceEvent::ResourceStarted {
        stack: cfg.stack(),
        resource: decl.urn.to_string(),
        action: action.to_string(),
    });
    let started = Instant::now();
    // A failed create leaves an entry without attributes; it is created again.
    let existing = recorded.filter(|r| !r.attributes.is_empty());

    let result = converge(cfg, decl, existing, resolution);
    let duration = started.elapsed().as_secs_f64();

    let mut attributes = match result {
        Ok(attributes) => attributes,
        Err(e) => {
            lock.resources.insert(
                decl.urn.clone(),
                ResourceLock {
                    kind: decl.kind,
                    name: decl.name.clone(),
                    parent: decl.parent.clone(),
                    depends_on: decl.dependencies().into_iter().collect(),
                    status: ResourceStatus::Failed,
                    applied_at: Some(eventlog::now_iso8601()),
                    duration_seconds: Some(duration),
                    hash: recorded.map(|r| r.hash.clone()).unwrap_or_default(),
                    attributes: existing.map(|r| r.attributes.clone()).unwrap_or_default(),
                },
            );
            return Err(e);
        }
    };
    attributes.retain(|k, _| !decl.secrets.contains(k));

    let hash = match hash {
        Some(h) => h,
        None => planner::hash_desired_state(decl.kind, &decl.resolve_public_inputs(resolution)?),
    };
    lock.resources.insert(
        decl.urn.clone(),
        ResourceLock {
            kind: decl.kind,
            name: decl.name.clone(),
            parent: decl.parent.clone(),
            depends_on: decl.dependencies().into_iter().collect(),
            status: ResourceStatus::Converged,
            applied_at: Some(eventlog::now_iso8601()),
            duration_seconds: Some(duration),
            hash: hash.clone(),
            attributes: attributes.clone(),
        },
    );
    resolution.record(&decl.urn, attributes)?;

    cfg.log_event(ProvenanceEvent::ResourceConverged {
        stack: cfg.stack(),
        resource: decl.urn.to_string(),
        duration_seconds: duration,
        hash,
    });
    tracing::info!(resource = %decl.urn, action = %action, "converged");

    Ok(if existing.is_some() {
        Outcome::Updated
    } else {
        Outcome::Created
    })
}

/// Resolve inputs and drive the provider. Components only publish outputs.
fn converge(
    cfg: &UpConfig,
    decl: &ResourceDecl,
    existing: Option<&ResourceLock>,
    resolution: &Resolution,
) -> Result<Properties> {
    let inputs = decl.resolve_inputs(resolution)?;
    if decl.kind.is_component() {
        return Ok(inputs);
    }
    match existing {
        Some(current) => cfg
            .provider
            .update(decl.kind, &decl.name, &current.attributes, &inputs),
        None => cfg.provider.create(decl.kind, &decl.name, &inputs),
    }
}

fn delete_one(cfg: &UpConfig, urn: &Urn, rl: &ResourceLock) -> Result<()> {
    if !rl.kind.is_component() && !rl.kind.is_data_source() && !rl.attributes.is_empty() {
        cfg.provider.delete(rl.kind, &rl.name, &rl.attributes).map_err(|e| {
            tracing::error!(resource = %urn, error = %e, "delete failed");
            e
        })?;
    }
    tracing::info!(resource = %urn, "deleted");
    cfg.log_event(ProvenanceEvent::ResourceDeleted {
        stack: cfg.stack(),
        resource: urn.to_string(),
    });
    Ok(())
}

/// Delete every recorded resource, dependents before their dependencies.
pub fn destroy(cfg: &UpConfig) -> Result<DestroyResult> {
    let start = Instant::now();
    let stack = cfg.config.stack.as_str();
    let Some(mut lock) = state::load_lock(cfg.state_dir, stack)? else {
        return Ok(DestroyResult {
            stack: cfg.stack(),
            resources_deleted: 0,
            total_duration: start.elapsed(),
        });
    };

    tracing::info!(stack, resources = lock.resources.len(), "destroy started");
    let entries: Vec<(&Urn, &ResourceLock)> = lock.resources.iter().collect();
    let recorded: Vec<(Urn, ResourceLock)> = resolver::teardown_order(&entries)
        .into_iter()
        .map(|(u, r)| (u.clone(), r.clone()))
        .collect();

    let mut deleted = 0u32;
    for (urn, rl) in recorded {
        if let Err(e) = delete_one(cfg, &urn, &rl) {
            lock.generated_at = eventlog::now_iso8601();
            state::save_lock(cfg.state_dir, &lock)?;
            return Err(e);
        }
        lock.resources.shift_remove(&urn);
        deleted += 1;
    }

    lock.outputs.clear();
    lock.generated_at = eventlog::now_iso8601();
    state::save_lock(cfg.state_dir, &lock)?;
    tracing::info!(stack, deleted, "destroy completed");

    Ok(DestroyResult {
        stack: cfg.stack(),
        resources_deleted: deleted,
        total_duration: start.elapsed(),
    })
}

/// Resolved stack outputs recorded by the last `up`.
pub fn outputs(state_dir: &Path, stack: &str) -> Result<indexmap::IndexMap<String, serde_json::Value>> {
    let lock = state::load_lock(state_dir, stack)?.ok_or_else(|| {
        InfraError::State(format!("stack '{}' has not been deployed", stack))
    })?;
    Ok(lock.outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::Context;
    use crate::core::output::{IntoInput, Output};
    use crate::provider::memory::MemoryProvider;
    use serde_json::json;

    fn config(event_log: bool) -> StackConfig {
        let mut cfg: StackConfig = serde_yaml_ng::from_str(
            r#"
project: air-tek
stack: dev
config:
  network:name: dev
  network:vpcRange: 10.1.0.0/16
"#,
        )
        .unwrap();
        cfg.policy.event_log = event_log;
        cfg
    }

    /// A small network: component, vpc, two subnets, cluster and two exports.
    fn small_graph(cfg: &StackConfig, provider: &MemoryProvider, with_cluster: bool, second: &str) -> ResourceGraph {
        let mut ctx = Context::new(cfg, provider);
        let root = ctx.component("air-tek:infra:network", "dev", None).unwrap();
        let vpc = ctx
            .resource(ResourceKind::Vpc, "dev-vpc")
            .parent(&root)
            .input("cidrBlock", "10.1.0.0/16")
            .register()
            .unwrap();
        let a = ctx
            .resource(ResourceKind::Subnet, "dev-a")
            .parent(&root)
            .input("vpcId", vpc.id())
            .input("cidrBlock", "10.1.1.0/24")
            .input("availabilityZone", "us-east-1a")
            .register()
            .unwrap();
        ctx.resource(ResourceKind::Subnet, "dev-b")
            .parent(&root)
            .input("vpcId", vpc.id())
            .input("cidrBlock", second)
            .input("availabilityZone", "us-east-1b")
            .register()
            .unwrap();
        ctx.register_outputs(&root, vec![("VpcId", vpc.id().into_input())])
            .unwrap();
        if with_cluster {
            ctx.resource(ResourceKind::Cluster, "dev-ecs-cluster")
                .register()
                .unwrap();
        }
        ctx.export("vpcId", vpc.id());
        ctx.export("subnet", a.id().map(|id| format!("subnet:{}", id)));
        ctx.into_graph()
    }

    fn up_cfg<'a>(cfg: &'a StackConfig, dir: &'a Path, provider: &'a MemoryProvider) -> UpConfig<'a> {
        UpConfig {
            config: cfg,
            state_dir: dir,
            provider,
            force: false,
        }
    }

    #[test]
    fn test_up_creates_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(true);
        let provider = MemoryProvider::new("us-east-1");
        let graph = small_graph(&cfg, &provider, true, "10.1.2.0/24");

        let result = up(&up_cfg(&cfg, dir.path(), &provider), &graph).unwrap();
        assert_eq!(result.resources_created, 5);
        assert_eq!(provider.len(), 4);
        assert!(result.outputs["vpcId"].as_str().unwrap().starts_with("vpc-"));
        assert!(result.outputs["subnet"].as_str().unwrap().starts_with("subnet:subnet-"));

        let lock = state::load_lock(dir.path(), "dev").unwrap().unwrap();
        assert_eq!(lock.resources.len(), 5);
        assert!(lock
            .resources
            .values()
            .all(|r| r.status == ResourceStatus::Converged && r.hash.starts_with("blake3:")));
        let component = &lock.resources[&Urn::new(ResourceKind::Component, "dev")];
        assert_eq!(component.attributes["VpcId"], result.outputs["vpcId"]);

        let events = eventlog::read_events(dir.path(), "dev").unwrap();
        assert!(matches!(events.first().unwrap().event, ProvenanceEvent::UpStarted { .. }));
        assert!(matches!(events.last().unwrap().event, ProvenanceEvent::UpCompleted { .. }));
    }

    #[test]
    fn test_second_up_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(false);
        let provider = MemoryProvider::new("us-east-1");
        let graph = small_graph(&cfg, &provider, true, "10.1.2.0/24");
        up(&up_cfg(&cfg, dir.path(), &provider), &graph).unwrap();
        let calls = provider.calls().len();

        let again = up(&up_cfg(&cfg, dir.path(), &provider), &graph).unwrap();
        assert_eq!(again.resources_created + again.resources_updated, 0);
        assert_eq!(again.resources_unchanged, 5);
        assert_eq!(provider.calls().len(), calls);
        assert!(!eventlog::event_log_path(dir.path(), "dev").exists());
    }

    #[test]
    fn test_preview_does_not_call_provider() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(true);
        let provider = MemoryProvider::new("us-east-1");
        let graph = small_graph(&cfg, &provider, true, "10.1.2.0/24");
        let plan = preview(&up_cfg(&cfg, dir.path(), &provider), &graph).unwrap();
        assert_eq!(plan.to_create, 5);
        assert!(provider.calls().is_empty());
        assert!(!state::lock_file_path(dir.path(), "dev").exists());
    }

    #[test]
    fn test_changed_input_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(false);
        let provider = MemoryProvider::new("us-east-1");
        up(
            &up_cfg(&cfg, dir.path(), &provider),
            &small_graph(&cfg, &provider, true, "10.1.2.0/24"),
        )
        .unwrap();
        let before = provider.attributes(ResourceKind::Subnet, "dev-b").unwrap();

        let changed = small_graph(&cfg, &provider, true, "10.1.3.0/24");
        let result = up(&up_cfg(&cfg, dir.path(), &provider), &changed).unwrap();
        assert_eq!(result.resources_updated, 1);
        assert_eq!(result.resources_unchanged, 4);
        let after = provider.attributes(ResourceKind::Subnet, "dev-b").unwrap();
        assert_eq!(before["id"], after["id"]);
        assert_eq!(after["cidrBlock"], "10.1.3.0/24");
    }

    #[test]
    fn test_removed_resource_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(false);
        let provider = MemoryProvider::new("us-east-1");
        up(
            &up_cfg(&cfg, dir.path(), &provider),
            &small_graph(&cfg, &provider, true, "10.1.2.0/24"),
        )
        .unwrap();

        let without = small_graph(&cfg, &provider, false, "10.1.2.0/24");
        let result = up(&up_cfg(&cfg, dir.path(), &provider), &without).unwrap();
        assert_eq!(result.resources_deleted, 1);
        assert!(provider.attributes(ResourceKind::Cluster, "dev-ecs-cluster").is_none());
        let lock = state::load_lock(dir.path(), "dev").unwrap().unwrap();
        assert_eq!(lock.resources.len(), 4);
    }

    #[test]
    fn test_failure_keeps_converged_and_records_failed() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(true);
        let provider = MemoryProvider::new("us-east-1");
        provider.fail_on(ResourceKind::Subnet);
        let graph = small_graph(&cfg, &provider, false, "10.1.2.0/24");

        let err = up(&up_cfg(&cfg, dir.path(), &provider), &graph).unwrap_err();
        assert!(err.to_string().contains("injected failure"));

        let lock = state::load_lock(dir.path(), "dev").unwrap().unwrap();
        let vpc = &lock.resources[&Urn::new(ResourceKind::Vpc, "dev-vpc")];
        assert_eq!(vpc.status, ResourceStatus::Converged);
        let failed: Vec<_> = lock
            .resources
            .values()
            .filter(|r| r.status == ResourceStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].attributes.is_empty());
        assert!(lock.outputs.is_empty());

        let events = eventlog::read_events(dir.path(), "dev").unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e.event, ProvenanceEvent::ResourceFailed { .. })));
    }

    #[test]
    fn test_failed_create_is_retried_as_create() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(false);
        let provider = MemoryProvider::new("us-east-1");
        let graph = small_graph(&cfg, &provider, false, "10.1.2.0/24");
        let failing = MemoryProvider::new("us-east-1");
        failing.fail_on(ResourceKind::Subnet);
        assert!(up(&up_cfg(&cfg, dir.path(), &failing), &graph).is_err());

        let lock = state::load_lock(dir.path(), "dev").unwrap().unwrap();
        let healthy = MemoryProvider::from_lock("us-east-1", &lock);
        let result = up(&up_cfg(&cfg, dir.path(), &healthy), &graph).unwrap();
        assert_eq!(result.resources_created, 3);
        assert_eq!(result.resources_unchanged, 1);
    }

    #[test]
    fn test_secret_inputs_never_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(false);
        let provider = MemoryProvider::new("us-east-1");
        let mut ctx = Context::new(&cfg, &provider);
        let role = ctx
            .resource(ResourceKind::Role, "exec")
            .input(
                "assumeRolePolicy",
                json!({"Statement": [{"Effect": "Allow"}]}).to_string(),
            )
            .secret_input("sessionToken", Output::known(json!("hunter2")))
            .register()
            .unwrap();
        let graph = ctx.into_graph();
        up(&up_cfg(&cfg, dir.path(), &provider), &graph).unwrap();

        let yaml = std::fs::read_to_string(state::lock_file_path(dir.path(), "dev")).unwrap();
        assert!(!yaml.contains("hunter2"));
        let lock = state::load_lock(dir.path(), "dev").unwrap().unwrap();
        assert!(!lock.resources[&role.urn].attributes.contains_key("sessionToken"));
    }

    #[test]
    fn test_destroy_empties_state() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(true);
        let provider = MemoryProvider::new("us-east-1");
        let graph = small_graph(&cfg, &provider, true, "10.1.2.0/24");
        up(&up_cfg(&cfg, dir.path(), &provider), &graph).unwrap();

        let result = destroy(&up_cfg(&cfg, dir.path(), &provider)).unwrap();
        assert_eq!(result.resources_deleted, 5);
        assert!(provider.is_empty());
        let lock = state::load_lock(dir.path(), "dev").unwrap().unwrap();
        assert!(lock.resources.is_empty());
        assert!(lock.outputs.is_empty());

        let again = destroy(&up_cfg(&cfg, dir.path(), &provider)).unwrap();
        assert_eq!(again.resources_deleted, 0);
    }

    #[test]
    fn test_destroy_follows_dependencies_recorded_by_updates() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(false);
        let provider = MemoryProvider::new("us-east-1");
        let declare = |moved: bool| {
            let mut ctx = Context::new(&cfg, &provider);
            let first = ctx
                .resource(ResourceKind::Vpc, "first")
                .input("cidrBlock", "10.1.0.0/16")
                .register()
                .unwrap();
            let mut home = first.id();
            if moved {
                let second = ctx
                    .resource(ResourceKind::Vpc, "second")
                    .input("cidrBlock", "10.2.0.0/16")
                    .register()
                    .unwrap();
                home = second.id();
            }
            ctx.resource(ResourceKind::Subnet, "subnet")
                .input("vpcId", home)
                .input("cidrBlock", if moved { "10.2.1.0/24" } else { "10.1.1.0/24" })
                .input("availabilityZone", "us-east-1a")
                .register()
                .unwrap();
            ctx.into_graph()
        };

        up(&up_cfg(&cfg, dir.path(), &provider), &declare(false)).unwrap();
        let moved = up(&up_cfg(&cfg, dir.path(), &provider), &declare(true)).unwrap();
        assert_eq!(moved.resources_updated, 1);

        // The subnet is recorded before the VPC it now lives in.
        let lock = state::load_lock(dir.path(), "dev").unwrap().unwrap();
        let names: Vec<&str> = lock.resources.keys().map(|u| u.name()).collect();
        assert_eq!(names, vec!["first", "subnet", "second"]);
        assert_eq!(
            lock.resources[&Urn::new(ResourceKind::Subnet, "subnet")].depends_on,
            vec![Urn::new(ResourceKind::Vpc, "second")]
        );

        let result = destroy(&up_cfg(&cfg, dir.path(), &provider)).unwrap();
        assert_eq!(result.resources_deleted, 3);
        assert!(provider.is_empty());
    }

    #[test]
    fn test_destroy_without_state() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(false);
        let provider = MemoryProvider::new("us-east-1");
        let result = destroy(&up_cfg(&cfg, dir.path(), &provider)).unwrap();
        assert_eq!(result.resources_deleted, 0);
    }

    #[test]
    fn test_outputs_requires_deployment() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            outputs(dir.path(), "dev"),
            Err(InfraError::State(_))
        ));
    }
}

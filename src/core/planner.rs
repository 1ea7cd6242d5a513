//! Plan generation: diff desired inputs against the state lock.
//!
//! The planner walks the execution order with its own [`Resolution`]. A
//! resource whose inputs hash to the recorded value is unchanged and its
//! recorded attributes become visible to the resources after it. Anything
//! created or updated is "known after apply", so its dependents are planned
//! from what can be resolved at that point.

use super::error::Result;
use super::graph::{ResourceDecl, ResourceGraph};
use super::output::Resolution;
use super::resolver;
use super::types::*;
use crate::tripwire::hasher;

/// Outcome of comparing one declaration with its lock entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: PlanAction,
    /// Desired-state hash, when every hashed input is known
    pub hash: Option<String>,
    /// True when the inputs depend on values not known before apply
    pub pending: bool,
}

/// Hash of the non-secret resolved inputs of a resource.
pub fn hash_desired_state(kind: ResourceKind, inputs: &Properties) -> String {
    hasher::composite_hash(&[kind.token(), &hasher::hash_properties(inputs)])
}

/// Decide what to do with a declaration given what is resolved so far.
pub fn determine_action(
    decl: &ResourceDecl,
    resolution: &Resolution,
    lock: Option<&StateLock>,
    force: bool,
) -> Result<Decision> {
    if decl.kind.is_data_source() {
        return Ok(Decision {
            action: PlanAction::Read,
            hash: None,
            pending: false,
        });
    }

    let recorded = lock.and_then(|l| l.resources.get(&decl.urn));
    let hash = match decl.resolve_public_inputs(resolution) {
        Ok(inputs) => Some(hash_desired_state(decl.kind, &inputs)),
        Err(e) if e.is_unresolved() => None,
        Err(e) => return Err(e),
    };

    let action = match (recorded, &hash) {
        (None, _) => PlanAction::Create,
        (Some(rl), Some(h)) if rl.status == ResourceStatus::Converged && &rl.hash == h => {
            if force && !decl.kind.is_component() {
                PlanAction::Update
            } else {
                PlanAction::NoOp
            }
        }
        (Some(_), _) => PlanAction::Update,
    };

    Ok(Decision {
        action,
        pending: hash.is_none(),
        hash,
    })
}

/// Generate an execution plan by comparing the graph to the lock.
pub fn plan(
    graph: &ResourceGraph,
    stack: &str,
    execution_order: &[Urn],
    lock: Option<&StateLock>,
    force: bool,
) -> Result<ExecutionPlan> {
    let mut changes = Vec::new();
    let mut to_create = 0u32;
    let mut to_update = 0u32;
    let mut to_destroy = 0u32;
    let mut to_read = 0u32;
    let mut unchanged = 0u32;
    let mut resolution = Resolution::new();

    for urn in execution_order {
        let Some(decl) = graph.get(urn) else {
            continue;
        };
        let decision = determine_action(decl, &resolution, lock, force)?;

        if decision.action == PlanAction::NoOp {
            if let Some(rl) = lock.and_then(|l| l.resources.get(urn)) {
                resolution.record(urn, rl.attributes.clone())?;
            }
        }

        match decision.action {
            PlanAction::Create => to_create += 1,
            PlanAction::Update => to_update += 1,
            PlanAction::Destroy => to_destroy += 1,
            PlanAction::Read => to_read += 1,
            PlanAction::NoOp => unchanged += 1,
        }

        changes.push(PlannedChange {
            urn: urn.clone(),
            kind: decl.kind,
            parent: decl.parent.clone(),
            description: describe_action(decl, &decision),
            action: decision.action,
        });
    }

    for (urn, rl) in resolver::teardown_order(&orphans(graph, lock)) {
        to_destroy += 1;
        changes.push(PlannedChange {
            urn: urn.clone(),
            kind: rl.kind,
            parent: rl.parent.clone(),
            action: PlanAction::Destroy,
            description: format!("{}: destroy (no longer declared)", rl.name),
        });
    }

    Ok(ExecutionPlan {
        stack: stack.to_string(),
        changes,
        execution_order: execution_order.to_vec(),
        to_create,
        to_update,
        to_destroy,
        to_read,
        unchanged,
    })
}

/// Lock entries with no declaration, in recorded order.
/// Callers delete them in [`resolver::teardown_order`].
pub fn orphans<'a>(
    graph: &ResourceGraph,
    lock: Option<&'a StateLock>,
) -> Vec<(&'a Urn, &'a ResourceLock)> {
    lock.map(|l| {
        l.resources
            .iter()
            .filter(|(urn, _)| !graph.contains(urn))
            .collect()
    })
    .unwrap_or_default()
}

/// Generate a human-readable description of a planned action.
fn describe_action(decl: &ResourceDecl, decision: &Decision) -> String {
    match decision.action {
        PlanAction::Create => match &decl.type_token {
            Some(token) => format!("{}: create component {}", decl.name, token),
            None => format!("{}: create {}", decl.name, decl.kind),
        },
        PlanAction::Update if decision.pending => {
            format!("{}: update (inputs known after apply)", decl.name)
        }
        PlanAction::Update => format!("{}: update (inputs changed)", decl.name),
        PlanAction::Read => format!("{}: read {}", decl.name, decl.kind),
        PlanAction::Destroy => format!("{}: destroy", decl.name),
        PlanAction::NoOp => format!("{}: no changes", decl.name),
    }
}

//! Dependency DAG construction and topological ordering.
//!
//! Edges come from the URNs each deferred input reads and explicit `depends_on`
//! entries. Ownership adds no edges. A component's inputs are its registered
//! outputs, so it is ordered after the children it publishes. The order is
//! computed with Kahn's algorithm over a FIFO queue; the initial ready set and
//! every batch released by one node are sorted, so the order is deterministic.
//!
//! Teardown runs the other way over the dependencies recorded in the lock.

use super::error::{InfraError, Result};
use super::graph::ResourceGraph;
use super::types::{ResourceLock, Urn};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BinaryHeap, VecDeque};

/// Build a topological execution order from resource dependencies.
pub fn build_execution_order(graph: &ResourceGraph) -> Result<Vec<Urn>> {
    let mut in_degree: FxHashMap<&Urn, usize> = FxHashMap::default();
    let mut adjacency: FxHashMap<&Urn, Vec<&Urn>> = FxHashMap::default();

    for decl in graph.iter() {
        in_degree.entry(&decl.urn).or_insert(0);
        adjacency.entry(&decl.urn).or_default();
    }

    for decl in graph.iter() {
        for dep in decl.dependencies() {
            let Some((dep_urn, _)) = in_degree.get_key_value(&dep) else {
                return Err(InfraError::UnknownDependency {
                    resource: decl.urn.clone(),
                    dependency: dep,
                });
            };
            let dep_urn: &Urn = *dep_urn;
            adjacency.entry(dep_urn).or_default().push(&decl.urn);
            *in_degree.entry(&decl.urn).or_insert(0) += 1;
        }
    }

    let mut zero_degree: Vec<&Urn> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(urn, _)| *urn)
        .collect();
    zero_degree.sort();
    let mut queue: VecDeque<&Urn> = zero_degree.into_iter().collect();

    let mut order = Vec::with_capacity(graph.len());
    while let Some(current) = queue.pop_front() {
        order.push(current.clone());

        let mut next_ready: Vec<&Urn> = Vec::new();
        if let Some(neighbors) = adjacency.get(current) {
            for neighbor in neighbors {
                if let Some(degree) = in_degree.get_mut(neighbor) {
                    *degree -= 1;
                    if *degree == 0 {
                        next_ready.push(*neighbor);
                    }
                }
            }
        }
        next_ready.sort();
        queue.extend(next_ready);
    }

    if order.len() != graph.len() {
        let ordered: FxHashSet<&Urn> = order.iter().collect();
        let mut cycle_members: Vec<&str> = graph
            .iter()
            .map(|d| &d.urn)
            .filter(|urn| !ordered.contains(urn))
            .map(|urn| urn.as_str())
            .collect();
        cycle_members.sort_unstable();
        return Err(InfraError::Cycle(cycle_members.join(", ")));
    }

    Ok(order)
}

/// Order recorded entries for deletion: every resource goes before the
/// resources it depends on. `entries` are in lock order; independent entries
/// keep reverse lock order, which is also the fallback for entries recorded
/// without dependencies.
pub fn teardown_order<'a>(
    entries: &[(&'a Urn, &'a ResourceLock)],
) -> Vec<(&'a Urn, &'a ResourceLock)> {
    let position: FxHashMap<&Urn, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, (urn, _))| (*urn, i))
        .collect();

    let mut dependents = vec![0usize; entries.len()];
    let mut needs: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    for (i, (_, rl)) in entries.iter().enumerate() {
        for dep in &rl.depends_on {
            if let Some(&j) = position.get(dep) {
                if j != i {
                    needs[i].push(j);
                    dependents[j] += 1;
                }
            }
        }
    }

    // Max-heap on lock position: the latest recorded ready entry goes first.
    let mut ready: BinaryHeap<usize> = (0..entries.len()).filter(|&i| dependents[i] == 0).collect();
    let mut done = vec![false; entries.len()];
    let mut order = Vec::with_capacity(entries.len());
    while let Some(i) = ready.pop() {
        done[i] = true;
        order.push(entries[i]);
        for &j in &needs[i] {
            dependents[j] -= 1;
            if dependents[j] == 0 {
                ready.push(j);
            }
        }
    }

    // A recorded cycle cannot be ordered; what is left goes in reverse lock order.
    order.extend((0..entries.len()).rev().filter(|&i| !done[i]).map(|i| entries[i]));
    order
}

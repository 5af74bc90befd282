//! Dependency resolver: layers a graph into batches with Kahn's algorithm.

use crate::builder::ResourceGraph;
use serde::Serialize;
use stackclaw_core::{DeploymentContext, Error, NodeId, Result};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Ordered batches of node ids. No node depends on another node of its own
/// batch or of a later batch.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct ExecutionPlan {
    batches: Vec<Vec<NodeId>>,
    #[serde(skip)]
    position: HashMap<NodeId, usize>,
}

impl ExecutionPlan {
    pub fn new(batches: Vec<Vec<NodeId>>) -> Self {
        let batches: Vec<Vec<NodeId>> = batches.into_iter().filter(|b| !b.is_empty()).collect();
        let position = batches
            .iter()
            .enumerate()
            .flat_map(|(i, batch)| batch.iter().map(move |id| (id.clone(), i)))
            .collect();
        Self { batches, position }
    }

    pub fn batches(&self) -> &[Vec<NodeId>] {
        &self.batches
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.position.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position.contains_key(id)
    }

    /// Index of the batch holding `id`.
    pub fn batch_of(&self, id: &str) -> Option<usize> {
        self.position.get(id).copied()
    }

    /// All node ids, batch by batch.
    pub fn order(&self) -> impl Iterator<Item = &NodeId> {
        self.batches.iter().flatten()
    }

    /// Delete order: batches reversed, each batch reversed so the
    /// last-declared node goes first.
    pub fn reversed(&self) -> ExecutionPlan {
        ExecutionPlan::new(
            self.batches
                .iter()
                .rev()
                .map(|b| b.iter().rev().cloned().collect())
                .collect(),
        )
    }
}

/// Resolve a built graph into an execution plan.
pub fn resolve(ctx: &DeploymentContext, graph: &ResourceGraph) -> Result<ExecutionPlan> {
    let plan = layer(&graph.ids(), |id| graph.dependencies(id.as_str()).to_vec())?;
    debug!(
        stack = %ctx.stack,
        batches = plan.len(),
        nodes = plan.node_count(),
        "execution plan resolved"
    );
    Ok(plan)
}

/// Kahn's algorithm over `nodes` (given in declaration order). Dependencies
/// outside `nodes` are ignored. Each batch lists its members in declaration
/// order so plans are identical across runs.
pub fn layer<F>(nodes: &[NodeId], dependencies: F) -> Result<ExecutionPlan>
where
    F: Fn(&NodeId) -> Vec<NodeId>,
{
    let members: HashSet<&NodeId> = nodes.iter().collect();
    let deps: HashMap<&NodeId, Vec<NodeId>> = nodes
        .iter()
        .map(|id| {
            let mut d: Vec<NodeId> = dependencies(id)
                .into_iter()
                .filter(|dep| members.contains(dep))
                .collect();
            d.dedup();
            (id, d)
        })
        .collect();

    let mut in_degree: HashMap<&NodeId, usize> = deps
        .iter()
        .map(|(id, d)| (*id, d.iter().collect::<HashSet<_>>().len()))
        .collect();
    let mut dependents: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    for (id, d) in &deps {
        for dep in d.iter().collect::<HashSet<_>>() {
            if let Some(key) = members.get(dep) {
                dependents.entry(*key).or_default().push(*id);
            }
        }
    }

    let mut remaining: Vec<&NodeId> = nodes.iter().collect();
    let mut batches: Vec<Vec<NodeId>> = Vec::new();

    loop {
        let ready: Vec<&NodeId> = remaining
            .iter()
            .copied()
            .filter(|id| in_degree.get(id).copied() == Some(0))
            .collect();
        if ready.is_empty() {
            break;
        }
        remaining.retain(|id| in_degree.get(id).copied() != Some(0));
        for id in &ready {
            // Mark as placed so it is not picked again
            in_degree.remove(id);
            for dependent in dependents.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(n) = in_degree.get_mut(dependent) {
                    *n = n.saturating_sub(1);
                }
            }
        }
        batches.push(ready.into_iter().cloned().collect());
    }

    if !remaining.is_empty() {
        let cycle = find_cycle(&remaining, &deps).unwrap_or_else(|| {
            remaining.iter().map(|id| (*id).clone()).collect()
        });
        return Err(Error::CycleDetected { cycle });
    }

    Ok(ExecutionPlan::new(batches))
}

/// DFS over the unplaced nodes; returns the first cycle found, with its
/// starting node repeated at the end.
fn find_cycle(remaining: &[&NodeId], deps: &HashMap<&NodeId, Vec<NodeId>>) -> Option<Vec<NodeId>> {
    let candidates: HashSet<&NodeId> = remaining.iter().copied().collect();
    let mut visited: HashSet<NodeId> = HashSet::new();

    for start in remaining {
        if visited.contains(*start) {
            continue;
        }
        let mut path: Vec<NodeId> = Vec::new();
        let mut on_path: HashSet<NodeId> = HashSet::new();
        if let Some(cycle) = dfs(start, deps, &candidates, &mut visited, &mut on_path, &mut path) {
            return Some(cycle);
        }
    }
    None
}

fn dfs(
    node: &NodeId,
    deps: &HashMap<&NodeId, Vec<NodeId>>,
    candidates: &HashSet<&NodeId>,
    visited: &mut HashSet<NodeId>,
    on_path: &mut HashSet<NodeId>,
    path: &mut Vec<NodeId>,
) -> Option<Vec<NodeId>> {
    visited.insert(node.clone());
    on_path.insert(node.clone());
    path.push(node.clone());

    for dep in deps.get(node).map(Vec::as_slice).unwrap_or(&[]) {
        if !candidates.contains(dep) {
            continue;
        }
        if on_path.contains(dep) {
            let start = path.iter().position(|p| p == dep).unwrap_or(0);
            let mut cycle: Vec<NodeId> = path[start..].to_vec();
            cycle.push(dep.clone());
            return Some(cycle);
        }
        if !visited.contains(dep) {
            if let Some(cycle) = dfs(dep, deps, candidates, visited, on_path, path) {
                return Some(cycle);
            }
        }
    }

    path.pop();
    on_path.remove(node);
    None
}

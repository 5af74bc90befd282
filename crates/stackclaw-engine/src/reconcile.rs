//! State reconciler: desired graph vs last-applied state.
//!
//! Decides one action per node and lays out two schedules: the forward plan
//! (reads, creates, updates, no-ops in dependency order) and the delete plan
//! (resources no longer declared, dependents first).

use crate::state::{ResourceState, StackState};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use stackclaw_core::{
    resolve_properties, DeploymentContext, NodeId, OutputRef, Outputs, ResourceKind, Result,
};
use stackclaw_graph::{layer, ExecutionPlan, ResourceGraph, ResourceNode};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    #[serde(rename = "noop")]
    NoOp,
    Delete,
    Read,
}

impl Action {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::Read => "=",
            Self::NoOp => " ",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::NoOp => write!(f, "noop"),
            Self::Delete => write!(f, "delete"),
            Self::Read => write!(f, "read"),
        }
    }
}

/// One node's planned action.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedStep {
    pub node: NodeId,
    pub action: Action,
    pub resource_type: String,
    pub kind: ResourceKind,
    /// Top-level properties that differ from state. Empty for creates,
    /// deletes and no-ops.
    pub changed: Vec<String>,
    /// False when inputs reference outputs that only exist after upstream
    /// changes are applied; the action may still turn into a no-op.
    pub known: bool,
    /// Nodes whose failure or skip prevents this step: dependencies for
    /// forward steps, recorded dependents for deletes.
    pub blockers: Vec<NodeId>,
    /// A data source declared where a managed resource is recorded: that
    /// resource is deleted before the read.
    pub retires: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub noop: usize,
    pub delete: usize,
    pub read: usize,
}

impl PlanSummary {
    pub fn changes(&self) -> usize {
        self.create + self.update + self.delete
    }
}

#[derive(Clone, Debug, Default)]
pub struct DeployPlan {
    pub forward: ExecutionPlan,
    pub deletes: ExecutionPlan,
    steps: HashMap<NodeId, PlannedStep>,
}

impl DeployPlan {
    pub fn step(&self, id: &str) -> Option<&PlannedStep> {
        self.steps.get(id)
    }

    pub fn action(&self, id: &str) -> Option<Action> {
        self.step(id).map(|s| s.action)
    }

    /// Steps in execution order: forward batches, then delete batches.
    pub fn steps(&self) -> Vec<&PlannedStep> {
        self.forward
            .order()
            .chain(self.deletes.order())
            .filter_map(|id| self.steps.get(id.as_str()))
            .collect()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut s = PlanSummary::default();
        for step in self.steps.values() {
            match step.action {
                Action::Create => s.create += 1,
                Action::Update => s.update += 1,
                Action::NoOp => s.noop += 1,
                Action::Delete => s.delete += 1,
                Action::Read => s.read += 1,
            }
            if step.retires {
                s.delete += 1;
            }
        }
        s
    }

    /// True when applying would not call any provider mutation.
    pub fn is_noop(&self) -> bool {
        self.summary().changes() == 0
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Decide a node's action from its last-applied record and its resolved
/// properties (`None` while inputs are still unknown). A record of the other
/// kind counts as no record.
pub fn decide(
    kind: ResourceKind,
    resource_type: &str,
    prior: Option<&ResourceState>,
    resolved: Option<&JsonValue>,
) -> Action {
    if kind == ResourceKind::Data {
        return Action::Read;
    }
    match (prior.filter(|p| p.kind == kind), resolved) {
        (None, _) => Action::Create,
        (Some(_), None) => Action::Update,
        (Some(p), Some(r)) if p.resource_type == resource_type && &p.properties == r => {
            Action::NoOp
        }
        (Some(_), Some(_)) => Action::Update,
    }
}

/// Whether a node declared as `kind` turns the recorded resource into
/// something to delete: a managed resource replaced by a data source.
pub fn retires(kind: ResourceKind, prior: Option<&ResourceState>) -> bool {
    kind == ResourceKind::Data
        && prior.is_some_and(|p| p.kind == ResourceKind::Managed && p.provider_id.is_some())
}

/// Top-level keys whose values differ between two property objects.
pub fn changed_keys(prior: &JsonValue, desired: &JsonValue) -> Vec<String> {
    let empty = serde_json::Map::new();
    let before = prior.as_object().unwrap_or(&empty);
    let after = desired.as_object().unwrap_or(&empty);
    let mut keys: Vec<String> = before
        .keys()
        .chain(after.keys())
        .filter(|k| before.get(*k) != after.get(*k))
        .cloned()
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Plan an apply of `graph` (already resolved into `forward`) on top of
/// `prior` state.
pub fn plan_apply(
    ctx: &DeploymentContext,
    graph: &ResourceGraph,
    forward: &ExecutionPlan,
    prior: &StackState,
) -> Result<DeployPlan> {
    let mut steps = HashMap::new();
    // Outputs that can be predicted before apply: no-op resources and
    // data sources whose lookup arguments did not change.
    let mut known: HashMap<NodeId, Outputs> = HashMap::new();

    for id in forward.order() {
        let Some(node) = graph.node(id.as_str()) else {
            continue;
        };
        let retiring = retires(node.kind, prior.get(id.as_str()));
        let record = prior.get(id.as_str()).filter(|r| r.kind == node.kind);
        let resolved = {
            let lookup = |r: &OutputRef| {
                known
                    .get(r.node.as_str())
                    .and_then(|o| r.lookup(o))
                    .cloned()
            };
            resolve_properties(&node.properties, &lookup).ok()
        };

        let mut action = decide(node.kind, &node.resource_type, record, resolved.as_ref());
        // A moved resource is not a no-op even if its properties match
        if action == Action::NoOp && record.and_then(|r| r.parent.as_ref()) != node.parent.as_ref() {
            action = Action::Update;
        }

        let changed = match (action, record, &resolved) {
            (Action::Update, Some(r), Some(desired)) => changed_keys(&r.properties, desired),
            // Inputs not known yet: report the properties that carry references
            (Action::Update, Some(_), None) => node
                .properties
                .iter()
                .filter(|(_, v)| !v.references().is_empty())
                .map(|(k, _)| k.clone())
                .collect(),
            _ => Vec::new(),
        };

        let predictable = match (action, record, &resolved) {
            (Action::NoOp, Some(r), _) => Some(r.outputs.clone()),
            (Action::Read, Some(r), Some(args)) if &r.properties == args => {
                Some(r.outputs.clone())
            }
            _ => None,
        };
        if let Some(outputs) = predictable {
            known.insert(id.clone(), outputs);
        }

        let mut step = forward_step(node, action, changed, resolved.is_some());
        step.retires = retiring;
        steps.insert(id.clone(), step);
    }

    let stale: Vec<NodeId> = prior
        .resources
        .keys()
        .filter(|id| !graph.contains(id.as_str()))
        .cloned()
        .collect();
    let deletes = delete_plan(&stale, prior)?;
    for id in deletes.order() {
        if let Some(record) = prior.get(id.as_str()) {
            steps.insert(id.clone(), delete_step(id, record, prior));
        }
    }

    let plan = DeployPlan {
        forward: forward.clone(),
        deletes,
        steps,
    };
    let summary = plan.summary();
    info!(
        stack = %ctx.stack,
        create = summary.create,
        update = summary.update,
        delete = summary.delete,
        read = summary.read,
        noop = summary.noop,
        "apply planned"
    );
    Ok(plan)
}

/// Plan the deletion of everything recorded in `prior`.
pub fn plan_destroy(ctx: &DeploymentContext, prior: &StackState) -> Result<DeployPlan> {
    let ids: Vec<NodeId> = prior.resources.keys().cloned().collect();
    let deletes = delete_plan(&ids, prior)?;
    let steps = deletes
        .order()
        .filter_map(|id| {
            prior
                .get(id.as_str())
                .map(|record| (id.clone(), delete_step(id, record, prior)))
        })
        .collect();
    info!(stack = %ctx.stack, delete = ids.len(), "destroy planned");
    Ok(DeployPlan {
        forward: ExecutionPlan::default(),
        deletes,
        steps,
    })
}

/// Delete order for `ids`: layer by recorded dependencies, then reverse so
/// dependents (and children) go before what they depend on.
fn delete_plan(ids: &[NodeId], prior: &StackState) -> Result<ExecutionPlan> {
    let deps: BTreeMap<&NodeId, Vec<NodeId>> = ids
        .iter()
        .map(|id| {
            let record = prior.get(id.as_str());
            let mut d: Vec<NodeId> = record.map(|r| r.dependencies.clone()).unwrap_or_default();
            if let Some(parent) = record.and_then(|r| r.parent.clone()) {
                if !d.contains(&parent) {
                    d.insert(0, parent);
                }
            }
            (id, d)
        })
        .collect();
    let plan = layer(ids, |id| deps.get(id).cloned().unwrap_or_default())?.reversed();
    debug!(batches = plan.len(), nodes = plan.node_count(), "delete order resolved");
    Ok(plan)
}

fn forward_step(
    node: &ResourceNode,
    action: Action,
    changed: Vec<String>,
    known: bool,
) -> PlannedStep {
    PlannedStep {
        node: node.id.clone(),
        action,
        resource_type: node.resource_type.clone(),
        kind: node.kind,
        changed,
        known,
        blockers: node.dependencies().to_vec(),
        retires: false,
    }
}

fn delete_step(id: &NodeId, record: &ResourceState, prior: &StackState) -> PlannedStep {
    PlannedStep {
        node: id.clone(),
        action: Action::Delete,
        resource_type: record.resource_type.clone(),
        kind: record.kind,
        changed: Vec::new(),
        known: true,
        blockers: prior.dependents(id.as_str()),
        retires: false,
    }
}

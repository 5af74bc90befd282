//! Apply executor.
//!
//! Runs a `DeployPlan` batch by batch. Every node in a batch gets its own
//! task and a semaphore bounds how many provider calls are in flight. A node
//! whose blockers failed or were skipped is skipped too; unrelated branches
//! keep going.

use crate::manifest::{NodeState, NodeStatus, RunManifest, SkipReason};
use crate::outputs::OutputBoard;
use crate::provider::ProviderRegistry;
use crate::reconcile::{decide, retires, Action, DeployPlan, PlannedStep};
use crate::state::{ResourceState, StackState};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value as JsonValue};
use stackclaw_core::{DeploymentContext, Error, NodeId, Outputs, ResourceKind, Result};
use stackclaw_graph::{ResourceGraph, ResourceNode};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PARALLELISM: usize = 10;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct ApplyOptions {
    /// Upper bound on provider operations in flight at once.
    pub parallelism: usize,
    /// Deadline for a single provider operation.
    pub timeout: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub struct Failure {
    pub node: NodeId,
    pub error: Error,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct ApplyReport {
    pub manifest: RunManifest,
    /// State to persist: prior state with this run's changes folded in.
    pub state: StackState,
    /// Outputs of every node that completed.
    pub outputs: BTreeMap<NodeId, Outputs>,
    pub failures: Vec<Failure>,
    /// True when cancellation left some node unstarted.
    pub cancelled: bool,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    pub fn status(&self, id: &str) -> Option<NodeState> {
        self.manifest.nodes.get(id).map(|n| n.status)
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.manifest.count(state)
    }

    pub fn failure(&self, id: &str) -> Option<&Error> {
        self.failures
            .iter()
            .find(|f| f.node.as_str() == id)
            .map(|f| &f.error)
    }
}

/// Per-node status for the run, shared by all node tasks.
#[derive(Default)]
struct NodeTable {
    nodes: DashMap<NodeId, NodeStatus>,
}

impl NodeTable {
    fn insert(&self, id: NodeId, status: NodeStatus) {
        self.nodes.insert(id, status);
    }

    fn update(&self, id: &NodeId, f: impl FnOnce(&mut NodeStatus)) {
        if let Some(mut entry) = self.nodes.get_mut(id) {
            f(entry.value_mut());
        }
    }

    fn state(&self, id: &str) -> Option<NodeState> {
        self.nodes.get(id).map(|n| n.status)
    }

    /// First blocker that failed or was skipped. Blockers outside the run
    /// never block.
    fn blocked_by(&self, blockers: &[NodeId]) -> Option<NodeId> {
        blockers
            .iter()
            .find(|b| {
                matches!(
                    self.state(b.as_str()),
                    Some(NodeState::Failed | NodeState::Skipped)
                )
            })
            .cloned()
    }

    fn snapshot(&self) -> BTreeMap<String, NodeStatus> {
        self.nodes
            .iter()
            .map(|e| (e.key().to_string(), e.value().clone()))
            .collect()
    }
}

/// What a finished node task does to stack state.
enum Change {
    Upsert(ResourceState),
    Remove,
    Keep,
    Failed(Error),
    /// The recorded resource is gone but the node still failed.
    RemovedThenFailed(Error),
}

pub struct Executor {
    providers: Arc<ProviderRegistry>,
    options: ApplyOptions,
}

impl Executor {
    pub fn new(providers: Arc<ProviderRegistry>, options: ApplyOptions) -> Self {
        Self { providers, options }
    }

    /// Carry out an apply plan: forward batches, then deletes of resources
    /// that are no longer declared.
    pub async fn apply(
        &self,
        ctx: &DeploymentContext,
        graph: &ResourceGraph,
        plan: &DeployPlan,
        prior: &StackState,
    ) -> ApplyReport {
        self.run(ctx, graph, plan, prior, "apply").await
    }

    /// Carry out a destroy plan.
    pub async fn destroy(
        &self,
        ctx: &DeploymentContext,
        plan: &DeployPlan,
        prior: &StackState,
    ) -> ApplyReport {
        self.run(ctx, &ResourceGraph::default(), plan, prior, "destroy")
            .await
    }

    async fn run(
        &self,
        ctx: &DeploymentContext,
        graph: &ResourceGraph,
        plan: &DeployPlan,
        prior: &StackState,
        command: &str,
    ) -> ApplyReport {
        let mut manifest = RunManifest::new(&ctx.run_id, &ctx.stack, command);
        let table = Arc::new(NodeTable::default());
        for step in plan.steps() {
            table.insert(
                step.node.clone(),
                NodeStatus::new(step.action, &step.resource_type),
            );
        }
        let board = Arc::new(OutputBoard::new(plan.forward.order().cloned()));
        let sem = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
        let cancel = ctx.cancellation_token();

        let mut state = prior.clone();
        state.stack = ctx.stack.clone();
        let mut failures = Vec::new();

        info!(
            run_id = %ctx.run_id,
            stack = %ctx.stack,
            command,
            forward = plan.forward.node_count(),
            deletes = plan.deletes.node_count(),
            parallelism = self.options.parallelism,
            "run started"
        );

        let phases = [
            ("forward", plan.forward.batches()),
            ("delete", plan.deletes.batches()),
        ];
        for (phase, batches) in phases {
            for (index, batch) in batches.iter().enumerate() {
                if cancel.is_cancelled() {
                    for id in batch {
                        table.update(id, |s| s.skip(SkipReason::Cancelled));
                        let _ = board.fail(id);
                    }
                    continue;
                }
                debug!(phase, batch = index, nodes = batch.len(), "batch started");

                let mut set = JoinSet::new();
                for id in batch {
                    let Some(step) = plan.step(id.as_str()) else {
                        continue;
                    };
                    let task = NodeTask {
                        id: id.clone(),
                        step: step.clone(),
                        node: graph.node(id.as_str()).cloned(),
                        prior: prior.get(id.as_str()).cloned(),
                        providers: self.providers.clone(),
                        board: board.clone(),
                        table: table.clone(),
                        sem: sem.clone(),
                        cancel: cancel.clone(),
                        timeout: self.options.timeout,
                    };
                    set.spawn(task.run());
                }

                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok((id, change)) => match change {
                            Change::Upsert(record) => {
                                state.resources.insert(id, record);
                            }
                            Change::Remove => {
                                state.resources.remove(&id);
                            }
                            Change::Keep => {}
                            Change::Failed(error) => failures.push(Failure { node: id, error }),
                            Change::RemovedThenFailed(error) => {
                                state.resources.remove(&id);
                                failures.push(Failure { node: id, error });
                            }
                        },
                        Err(e) => error!("node task aborted: {}", e),
                    }
                }

                // A task that panicked never reached a terminal state
                for id in batch {
                    let stuck = table
                        .state(id.as_str())
                        .is_some_and(|s| !s.is_terminal());
                    if stuck {
                        table.update(id, |s| s.fail("task panicked"));
                        let _ = board.fail(id);
                        failures.push(Failure {
                            node: id.clone(),
                            error: Error::provider(id, "task panicked"),
                        });
                    }
                }
            }
        }

        failures.sort_by(|a, b| a.node.cmp(&b.node));
        manifest.nodes = table.snapshot();
        let cancelled = manifest
            .nodes
            .values()
            .any(|n| n.skip_reason == Some(SkipReason::Cancelled));
        manifest.finalize(cancelled);

        info!(
            run_id = %ctx.run_id,
            outcome = %manifest.outcome,
            succeeded = manifest.count(NodeState::Succeeded),
            failed = manifest.count(NodeState::Failed),
            skipped = manifest.count(NodeState::Skipped),
            wall_ms = manifest.total_wall_ms,
            "run finished"
        );

        ApplyReport {
            manifest,
            state,
            outputs: board.ready_outputs(),
            failures,
            cancelled,
        }
    }
}

/// One node's unit of work within a batch.
struct NodeTask {
    id: NodeId,
    step: PlannedStep,
    node: Option<ResourceNode>,
    prior: Option<ResourceState>,
    providers: Arc<ProviderRegistry>,
    board: Arc<OutputBoard>,
    table: Arc<NodeTable>,
    sem: Arc<Semaphore>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl NodeTask {
    async fn run(self) -> (NodeId, Change) {
        let change = self.execute().await;
        (self.id, change)
    }

    async fn execute(&self) -> Change {
        if self.cancel.is_cancelled() {
            return self.skip(SkipReason::Cancelled);
        }
        if let Some(blocker) = self.table.blocked_by(&self.step.blockers) {
            return self.skip(SkipReason::Dependency(blocker));
        }
        match (self.step.action, &self.node) {
            (Action::Delete, _) => self.delete().await,
            (_, Some(node)) => self.forward(node).await,
            (_, None) => self.fail(Error::Declaration(format!(
                "{} is planned but not declared",
                self.id
            ))),
        }
    }

    async fn forward(&self, node: &ResourceNode) -> Change {
        let resolved = match self.board.resolve(&self.id, &node.properties).await {
            Ok(v) => v,
            Err(e) => return self.fail(e),
        };

        // Decide again with real inputs; a planned update can turn out to
        // be a no-op once upstream outputs are known.
        let prior = self.prior.as_ref();
        let mut action = decide(node.kind, &node.resource_type, prior, Some(&resolved));
        if action == Action::NoOp && prior.and_then(|p| p.parent.as_ref()) != node.parent.as_ref()
        {
            action = Action::Update;
        }
        if action == Action::Update && prior.and_then(|p| p.provider_id.as_ref()).is_none() {
            action = Action::Create;
        }

        if action == Action::NoOp {
            let Some(prior) = prior else {
                return self.fail(Error::State(format!("{} has no recorded state", self.id)));
            };
            self.table.update(&self.id, |s| {
                s.action = action;
                s.start();
            });
            debug!(node = %self.id, "unchanged");
            let mut record = prior.clone();
            record.parent = node.parent.clone();
            record.dependencies = node.dependencies().to_vec();
            return self.succeed(record.outputs.clone(), Change::Upsert(record));
        }

        let _permit = match self.sem.acquire().await {
            Ok(p) => p,
            Err(_) => return self.fail(Error::State("executor shut down".into())),
        };
        if self.cancel.is_cancelled() {
            return self.skip(SkipReason::Cancelled);
        }
        self.table.update(&self.id, |s| {
            s.action = action;
            s.start();
        });
        info!(node = %self.id, action = %action, resource_type = %node.resource_type, "applying");

        let retired = match self.retire(node).await {
            Ok(retired) => retired,
            Err(e) => return self.fail(e),
        };
        let applied = self
            .with_deadline(self.call(action, node, &resolved))
            .await;
        match applied {
            Ok((provider_id, outputs)) => {
                let record = ResourceState {
                    resource_type: node.resource_type.clone(),
                    kind: node.kind,
                    provider_id,
                    properties: resolved,
                    outputs: outputs.clone(),
                    parent: node.parent.clone(),
                    dependencies: node.dependencies().to_vec(),
                    updated: Utc::now(),
                };
                self.succeed(outputs, Change::Upsert(record))
            }
            Err(e) if retired => match self.fail(e) {
                Change::Failed(e) => Change::RemovedThenFailed(e),
                other => other,
            },
            Err(e) => self.fail(e),
        }
    }

    /// Delete the managed resource recorded under a node that is now a data
    /// source. Returns whether anything was deleted.
    async fn retire(&self, node: &ResourceNode) -> Result<bool> {
        let Some(record) = self.prior.as_ref().filter(|r| retires(node.kind, Some(*r))) else {
            return Ok(false);
        };
        let Some(provider_id) = record.provider_id.as_deref() else {
            return Ok(false);
        };
        let provider = self.providers.get(&record.resource_type)?;
        info!(node = %self.id, resource_type = %record.resource_type, "deleting managed resource now declared as data");
        self.with_deadline(async {
            provider
                .delete(&record.resource_type, provider_id)
                .await
                .map_err(|e| Error::provider(&self.id, format!("{:#}", e)))
        })
        .await?;
        Ok(true)
    }

    async fn call(
        &self,
        action: Action,
        node: &ResourceNode,
        resolved: &JsonValue,
    ) -> Result<(Option<String>, Outputs)> {
        let provider = self.providers.get(&node.resource_type)?;
        let resource_type = node.resource_type.as_str();
        let outcome = match action {
            Action::Read => provider
                .read(resource_type, resolved)
                .await
                .map(|outputs| (None, outputs)),
            Action::Create => provider.create(resource_type, resolved).await.map(|c| {
                let mut outputs = c.outputs;
                outputs
                    .entry("id".into())
                    .or_insert_with(|| json!(c.id));
                (Some(c.id), outputs)
            }),
            Action::Update => {
                let id = self
                    .prior
                    .as_ref()
                    .and_then(|p| p.provider_id.clone())
                    .unwrap_or_default();
                provider
                    .update(resource_type, &id, resolved)
                    .await
                    .map(|outputs| (Some(id), outputs))
            }
            Action::NoOp | Action::Delete => {
                return Err(Error::State(format!(
                    "{} cannot {} through the forward path",
                    self.id, action
                )))
            }
        };
        outcome.map_err(|e| Error::provider(&self.id, format!("{:#}", e)))
    }

    async fn delete(&self) -> Change {
        let Some(record) = self.prior.as_ref() else {
            self.table.update(&self.id, |s| s.start());
            return self.succeed_delete();
        };

        let _permit = match self.sem.acquire().await {
            Ok(p) => p,
            Err(_) => return self.fail(Error::State("executor shut down".into())),
        };
        if self.cancel.is_cancelled() {
            return self.skip(SkipReason::Cancelled);
        }
        self.table.update(&self.id, |s| s.start());

        // Data sources and records without a provider id only live in state
        let Some(provider_id) = record
            .provider_id
            .as_deref()
            .filter(|_| record.kind == ResourceKind::Managed)
        else {
            debug!(node = %self.id, "forgetting unmanaged record");
            return self.succeed_delete();
        };

        let provider = match self.providers.get(&record.resource_type) {
            Ok(p) => p,
            Err(e) => return self.fail(e),
        };
        info!(node = %self.id, resource_type = %record.resource_type, "deleting");
        let deleted = self
            .with_deadline(async {
                provider
                    .delete(&record.resource_type, provider_id)
                    .await
                    .map_err(|e| Error::provider(&self.id, format!("{:#}", e)))
            })
            .await;
        match deleted {
            Ok(()) => self.succeed_delete(),
            Err(e) => self.fail(e),
        }
    }

    async fn with_deadline<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                node: self.id.clone(),
                after: self.timeout,
            }),
        }
    }

    fn succeed(&self, outputs: Outputs, change: Change) -> Change {
        if let Err(e) = self.board.publish(&self.id, outputs) {
            warn!(node = %self.id, "{}", e);
        }
        self.table
            .update(&self.id, |s| s.finish(NodeState::Succeeded));
        change
    }

    fn succeed_delete(&self) -> Change {
        self.table
            .update(&self.id, |s| s.finish(NodeState::Succeeded));
        debug!(node = %self.id, "deleted");
        Change::Remove
    }

    fn skip(&self, reason: SkipReason) -> Change {
        info!(node = %self.id, reason = %reason, "skipped");
        self.table.update(&self.id, |s| s.skip(reason));
        let _ = self.board.fail(&self.id);
        Change::Keep
    }

    fn fail(&self, error: Error) -> Change {
        error!(node = %self.id, "{}", error);
        let message = error.to_string();
        self.table.update(&self.id, |s| s.fail(message));
        let _ = self.board.fail(&self.id);
        Change::Failed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_by_finds_failed_or_skipped() {
        let table = NodeTable::default();
        let mut ok = NodeStatus::new(Action::Create, "t:m:T");
        ok.finish(NodeState::Succeeded);
        let mut bad = NodeStatus::new(Action::Create, "t:m:T");
        bad.fail("boom");
        table.insert("a".into(), ok);
        table.insert("b".into(), bad);

        assert_eq!(table.blocked_by(&["a".into()]), None);
        assert_eq!(table.blocked_by(&["a".into(), "b".into()]), Some("b".into()));
        assert_eq!(table.blocked_by(&["outside".into()]), None);
    }

    #[test]
    fn default_options() {
        let opts = ApplyOptions::default();
        assert_eq!(opts.parallelism, 10);
        assert_eq!(opts.timeout, Duration::from_secs(300));
    }
}

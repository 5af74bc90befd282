//! plan / apply / destroy, wired end to end.
//!
//! Each command opens a `Workspace` (stack file, merged config, derived
//! paths), loads state from the store, and hands the work to the engine.

use crate::config::StackclawConfig;
use crate::declaration::{load_stack, parse_overrides, StackDocument};
use stackclaw_core::{DeploymentContext, Result};
use stackclaw_engine::{
    plan_apply, plan_destroy, ApplyOptions, ApplyReport, DeployPlan, Executor, FileStateStore,
    LocalProvider, ProviderRegistry, RunManifest, StackState, StateStore,
};
use stackclaw_graph::{build_graph, resolve, ResourceGraph};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_INVALID: i32 = 2;

/// Everything one invocation needs, resolved from flags, config file and
/// stack file.
pub struct Workspace {
    pub doc: StackDocument,
    pub ctx: DeploymentContext,
    pub state_path: PathBuf,
    pub provider_root: PathBuf,
    pub options: ApplyOptions,
}

impl Workspace {
    /// Load the stack file and merge `--config` overrides into its config.
    pub fn open(stack_file: &Path, overrides: &[String], config: &StackclawConfig) -> Result<Self> {
        let doc = load_stack(stack_file)?;
        let mut stack_config = doc.config.clone();
        stack_config.merge(parse_overrides(overrides)?);

        let stack_dir = stack_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let ctx = DeploymentContext::new(doc.name.clone(), stack_config);
        Ok(Self {
            state_path: config.state_path(stack_dir, &doc.name),
            provider_root: config.provider_root(stack_dir),
            options: config.apply_options(),
            doc,
            ctx,
        })
    }

    pub fn store(&self) -> FileStateStore {
        FileStateStore::new(&self.state_path)
    }

    /// Providers for this workspace: the local provider serves every type
    /// package.
    pub fn providers(&self) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.set_fallback(Arc::new(LocalProvider::new(&self.provider_root)));
        registry
    }

    pub fn graph(&self) -> Result<ResourceGraph> {
        build_graph(&self.ctx, self.doc.declarations.clone())
    }
}

/// A plan together with what it was computed from.
pub struct Planned {
    pub graph: ResourceGraph,
    pub plan: DeployPlan,
    pub prior: StackState,
}

/// Build, resolve and diff against stored state. No provider is called.
pub async fn plan(ws: &Workspace, store: &dyn StateStore) -> Result<Planned> {
    let graph = ws.graph()?;
    let forward = resolve(&ws.ctx, &graph)?;
    let prior = store.load().await?;
    let plan = plan_apply(&ws.ctx, &graph, &forward, &prior)?;
    Ok(Planned { graph, plan, prior })
}

/// Execute a plan, then persist state whatever the outcome.
pub async fn apply(
    ws: &Workspace,
    store: &dyn StateStore,
    providers: Arc<ProviderRegistry>,
    planned: &Planned,
) -> Result<ApplyReport> {
    let executor = Executor::new(providers, ws.options.clone());
    let report = executor
        .apply(&ws.ctx, &planned.graph, &planned.plan, &planned.prior)
        .await;
    store.save(&report.state).await?;
    info!(location = %store.location(), resources = report.state.len(), "state saved");
    Ok(report)
}

/// Delete everything recorded in state, dependents first.
pub async fn destroy(
    ws: &Workspace,
    store: &dyn StateStore,
    providers: Arc<ProviderRegistry>,
) -> Result<ApplyReport> {
    let prior = store.load().await?;
    let plan = plan_destroy(&ws.ctx, &prior)?;
    let executor = Executor::new(providers, ws.options.clone());
    let report = executor.destroy(&ws.ctx, &plan, &prior).await;
    store.save(&report.state).await?;
    info!(location = %store.location(), resources = report.state.len(), "state saved");
    Ok(report)
}

pub fn exit_code(report: &ApplyReport) -> i32 {
    if report.is_success() {
        EXIT_OK
    } else {
        EXIT_FAILED
    }
}

/// Write the run manifest as `runs/<run id>.yaml` next to the state file
/// and append one line to `runs/runs.log`.
pub async fn record_run(state_path: &Path, manifest: &RunManifest) -> Result<PathBuf> {
    let dir = state_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("runs");
    tokio::fs::create_dir_all(&dir).await?;

    let path = dir.join(format!("{}.yaml", manifest.run_id));
    tokio::fs::write(&path, manifest.to_yaml()).await?;

    let mut log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("runs.log"))
        .await?;
    if let Err(e) = log
        .write_all(format!("{}\n", manifest.run_log_line()).as_bytes())
        .await
    {
        warn!("failed to append run log: {}", e);
    }
    Ok(path)
}

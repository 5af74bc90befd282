//! stackclaw-engine: plan and apply resource graphs
//!
//! The reconciler decides what each node needs; the executor carries it out
//! through pluggable providers, threading outputs from upstream resources
//! into downstream inputs as they complete.

pub mod executor;
pub mod local;
pub mod manifest;
pub mod outputs;
pub mod provider;
pub mod reconcile;
pub mod state;

pub use executor::{ApplyOptions, ApplyReport, Executor, Failure};
pub use local::LocalProvider;
pub use manifest::{NodeState, NodeStatus, Outcome, RunManifest, SkipReason};
pub use outputs::{OutputBoard, Slot};
pub use provider::{Created, Provider, ProviderRegistry};
pub use reconcile::{decide, plan_apply, plan_destroy, Action, DeployPlan, PlanSummary, PlannedStep};
pub use state::{FileStateStore, MemoryStateStore, ResourceState, StackState, StateStore};

//! stackclaw-graph: resource graph construction and dependency resolution
//!
//! Declarations become a `ResourceGraph`; the resolver layers it into an
//! `ExecutionPlan` of batches that are safe to run concurrently.

pub mod builder;
pub mod resolver;

pub use builder::{build_graph, Edge, EdgeKind, GraphBuilder, ResourceGraph, ResourceNode};
pub use resolver::{layer, resolve, ExecutionPlan};

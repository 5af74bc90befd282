//! Error types for stackclaw

use crate::types::NodeId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("duplicate resource id: {0}")]
    DuplicateId(NodeId),

    #[error("{node}: {via} refers to undeclared resource '{target}'")]
    DanglingReference {
        node: NodeId,
        target: NodeId,
        via: String,
    },

    #[error("dependency cycle detected: {}", join_cycle(.cycle))]
    CycleDetected { cycle: Vec<NodeId> },

    #[error("missing required config value: {0}")]
    MissingConfig(String),

    #[error("invalid declaration: {0}")]
    Declaration(String),

    #[error("provider error: {node} - {message}")]
    Provider { node: NodeId, message: String },

    #[error("timeout: {node} did not complete within {after:?}")]
    Timeout { node: NodeId, after: Duration },

    #[error("no provider registered for type {0}")]
    UnknownProvider(String),

    #[error("unresolved input: {node} - {message}")]
    Unresolved { node: NodeId, message: String },

    #[error("outputs already published for {0}")]
    AlreadyPublished(NodeId),

    #[error("state error: {0}")]
    State(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn join_cycle(cycle: &[NodeId]) -> String {
    cycle
        .iter()
        .map(NodeId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl Error {
    pub fn dangling(node: &NodeId, target: &NodeId, via: impl Into<String>) -> Self {
        Self::DanglingReference {
            node: node.clone(),
            target: target.clone(),
            via: via.into(),
        }
    }

    pub fn provider(node: &NodeId, message: impl Into<String>) -> Self {
        Self::Provider {
            node: node.clone(),
            message: message.into(),
        }
    }

    pub fn unresolved(node: &NodeId, message: impl Into<String>) -> Self {
        Self::Unresolved {
            node: node.clone(),
            message: message.into(),
        }
    }

    /// Errors raised while building or resolving the graph. These abort
    /// before any provider call is made.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateId(_)
                | Self::DanglingReference { .. }
                | Self::CycleDetected { .. }
                | Self::MissingConfig(_)
                | Self::Declaration(_)
        )
    }

    /// The node this error is attributed to, if any.
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            Self::DanglingReference { node, .. }
            | Self::Provider { node, .. }
            | Self::Timeout { node, .. }
            | Self::Unresolved { node, .. } => Some(node),
            Self::DuplicateId(node) | Self::AlreadyPublished(node) => Some(node),
            _ => None,
        }
    }
}

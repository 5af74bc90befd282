//! Run manifest: structured record of every apply/destroy run.

use crate::reconcile::Action;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stackclaw_core::NodeId;
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunManifest {
    pub run_id: String,
    pub stack: String,
    pub command: String,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub outcome: Outcome,
    pub total_wall_ms: u64,
    pub nodes: BTreeMap<String, NodeStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pending,
    Success,
    Partial,
    Failure,
    Cancelled,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Partial => write!(f, "partial"),
            Self::Failure => write!(f, "failure"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NodeStatus {
    pub status: NodeState,
    pub action: Action,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub wall_ms: u64,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SkipReason {
    /// A node this one waits on failed or was itself skipped.
    Dependency(NodeId),
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dependency(id) => write!(f, "dependency {} did not complete", id),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl NodeStatus {
    pub fn new(action: Action, resource_type: &str) -> Self {
        Self {
            status: NodeState::Pending,
            action,
            resource_type: resource_type.into(),
            skip_reason: None,
            error: None,
            wall_ms: 0,
            started: None,
            ended: None,
        }
    }

    pub fn start(&mut self) {
        self.status = NodeState::Running;
        self.started = Some(Utc::now());
    }

    pub fn finish(&mut self, state: NodeState) {
        self.status = state;
        self.ended = Some(Utc::now());
        if let (Some(start), Some(end)) = (self.started, self.ended) {
            self.wall_ms = (end - start).num_milliseconds().max(0) as u64;
        }
    }

    pub fn skip(&mut self, reason: SkipReason) {
        self.skip_reason = Some(reason);
        self.finish(NodeState::Skipped);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.finish(NodeState::Failed);
    }
}

impl RunManifest {
    pub fn new(run_id: &str, stack: &str, command: &str) -> Self {
        Self {
            run_id: run_id.into(),
            stack: stack.into(),
            command: command.into(),
            started: Utc::now(),
            ended: None,
            outcome: Outcome::Pending,
            total_wall_ms: 0,
            nodes: BTreeMap::new(),
        }
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.values().filter(|n| n.status == state).count()
    }

    /// Close the run. The outcome follows from the node states: any failure
    /// with some success is partial, failure without success is failure.
    pub fn finalize(&mut self, cancelled: bool) {
        let failed = self.count(NodeState::Failed);
        let succeeded = self.count(NodeState::Succeeded);
        self.outcome = match (failed, cancelled) {
            (0, false) => Outcome::Success,
            (0, true) => Outcome::Cancelled,
            (_, _) if succeeded > 0 => Outcome::Partial,
            _ => Outcome::Failure,
        };
        let ended = Utc::now();
        self.total_wall_ms = (ended - self.started).num_milliseconds().max(0) as u64;
        self.ended = Some(ended);
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }

    pub fn run_log_line(&self) -> String {
        format!(
            "| {} | {} | {} | {} | {} | {}/{} |",
            self.run_id,
            self.stack,
            self.command,
            self.started.format("%Y-%m-%dT%H:%M:%S"),
            self.outcome,
            self.count(NodeState::Succeeded),
            self.nodes.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_lifecycle() {
        let mut m = RunManifest::new("kv-1234", "keyvault", "apply");
        let mut rg = NodeStatus::new(Action::Read, "azure-native:resources:getResourceGroup");
        rg.start();
        assert_eq!(rg.status, NodeState::Running);
        rg.finish(NodeState::Succeeded);
        m.nodes.insert("current-rg".into(), rg);

        let mut kv = NodeStatus::new(Action::Create, "azure-native:keyvault:Vault");
        kv.start();
        kv.fail("quota exceeded");
        m.nodes.insert("kv-contoso".into(), kv);

        let mut pwd = NodeStatus::new(Action::Create, "azure-native:keyvault:Secret");
        pwd.skip(SkipReason::Dependency("kv-contoso".into()));
        m.nodes.insert("admin-password".into(), pwd);

        m.finalize(false);
        assert_eq!(m.outcome, Outcome::Partial);
        assert_eq!(m.count(NodeState::Skipped), 1);
        assert!(m.ended.is_some());
    }

    #[test]
    fn manifest_yaml_contains_states() {
        let mut m = RunManifest::new("kv-1", "keyvault", "destroy");
        m.nodes
            .insert("a".into(), NodeStatus::new(Action::Delete, "local:file:File"));
        m.finalize(true);
        let yaml = m.to_yaml();
        assert!(yaml.contains("kv-1"));
        assert!(yaml.contains("pending"));
        assert!(yaml.contains("cancelled"));
    }

    #[test]
    fn run_log_line_format() {
        let m = RunManifest::new("kv-1", "keyvault", "apply");
        let line = m.run_log_line();
        assert!(line.contains("kv-1"));
        assert!(line.contains("keyvault"));
        assert!(line.contains("| 0/0 |"));
    }
}

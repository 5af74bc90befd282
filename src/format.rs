use serde_json::Value as JsonValue;
use stackclaw_core::{DeploymentContext, NodeId, OutputRef, Outputs, REDACTED};
use stackclaw_engine::{Action, ApplyReport, DeployPlan, NodeState, PlannedStep};
use stackclaw_graph::{ResourceGraph, ResourceNode};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub struct FormatOptions {
    /// Print every property of creates and updates, not just changed keys.
    pub verbose: bool,
    /// Print node outputs after apply.
    pub show_outputs: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            show_outputs: true,
        }
    }
}

const MAX_VALUE_CHARS: usize = 80;

pub fn format_plan(
    ctx: &DeploymentContext,
    graph: &ResourceGraph,
    plan: &DeployPlan,
    opts: &FormatOptions,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("═══ Stack {} ═══\n", ctx.stack));

    for (i, batch) in plan.forward.batches().iter().enumerate() {
        out.push_str(&format!("─── batch {} ───\n", i + 1));
        for id in batch {
            if let Some(step) = plan.step(id.as_str()) {
                format_step(&mut out, step, graph.node(id.as_str()), opts);
            }
        }
    }
    if !plan.deletes.is_empty() {
        out.push_str("─── deletes ───\n");
        for id in plan.deletes.order() {
            if let Some(step) = plan.step(id.as_str()) {
                format_step(&mut out, step, None, opts);
            }
        }
    }
    if plan.is_empty() {
        out.push_str("  (no resources)\n");
    }

    let s = plan.summary();
    out.push('\n');
    out.push_str(&format!(
        "Plan: {} to create, {} to update, {} to delete, {} to read, {} unchanged.\n",
        s.create, s.update, s.delete, s.read, s.noop
    ));
    out
}

fn format_step(
    out: &mut String,
    step: &PlannedStep,
    node: Option<&ResourceNode>,
    opts: &FormatOptions,
) {
    out.push_str(&format!(
        "  {} {}  {}",
        step.action.symbol(),
        step.node,
        step.resource_type
    ));
    if step.action == Action::Update && !step.known {
        out.push_str("  (inputs known after apply)");
    }
    if step.retires {
        out.push_str("  (deletes the recorded managed resource)");
    }
    out.push('\n');

    // Delete steps have no declaration; recorded properties may hold
    // secrets in plain form, so they are never printed.
    let Some(node) = node else {
        return;
    };
    let keys: Vec<&String> = match step.action {
        Action::Create => node.properties.keys().collect(),
        Action::Update if !opts.verbose => step.changed.iter().collect(),
        Action::Update => node.properties.keys().collect(),
        _ if opts.verbose => node.properties.keys().collect(),
        _ => Vec::new(),
    };
    for key in keys {
        let shown = node
            .properties
            .get(key)
            .map(|v| v.redacted())
            .unwrap_or(JsonValue::Null);
        out.push_str(&format!("      {} = {}\n", key, short_json(&shown)));
    }
}

pub fn format_report(report: &ApplyReport, graph: &ResourceGraph, opts: &FormatOptions) -> String {
    let m = &report.manifest;
    let mut out = String::new();
    out.push('\n');
    out.push_str(&format!(
        "{} {}: {} ({} succeeded, {} failed, {} skipped) in {}\n",
        m.command,
        m.run_id,
        m.outcome,
        m.count(NodeState::Succeeded),
        m.count(NodeState::Failed),
        m.count(NodeState::Skipped),
        format_wall(m.total_wall_ms)
    ));

    if !report.failures.is_empty() {
        out.push_str("\nFailures:\n");
        for f in &report.failures {
            out.push_str(&format!("  ✗ {}: {}\n", f.node, f.error));
        }
    }

    let skipped: Vec<(&String, String)> = m
        .nodes
        .iter()
        .filter(|(_, n)| n.status == NodeState::Skipped)
        .map(|(id, n)| {
            let reason = n
                .skip_reason
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            (id, reason)
        })
        .collect();
    if !skipped.is_empty() {
        out.push_str("\nSkipped:\n");
        for (id, reason) in skipped {
            out.push_str(&format!("  - {}: {}\n", id, reason));
        }
    }

    if opts.show_outputs && !report.outputs.is_empty() {
        let secrets = SecretOutputs::new(graph);
        out.push_str("\nOutputs:\n");
        for (id, outputs) in &report.outputs {
            out.push_str(&format!("  {}\n", id));
            for (key, value) in redact_outputs(&secrets, id.as_str(), outputs) {
                out.push_str(&format!("      {} = {}\n", key, short_json(&value)));
            }
        }
    }
    out
}

/// Output keys that echo secret data: a property holding a secret, or
/// referencing another secret output, however many hops away.
#[derive(Debug, Default)]
pub struct SecretOutputs {
    keys: HashMap<NodeId, BTreeSet<String>>,
}

impl SecretOutputs {
    pub fn new(graph: &ResourceGraph) -> Self {
        let mut secrets = Self::default();
        loop {
            let mut found = Vec::new();
            for node in graph.nodes() {
                for (key, value) in &node.properties {
                    if secrets.is_secret(node.id.as_str(), key) {
                        continue;
                    }
                    if value.contains_secret_with(&|r: &OutputRef| secrets.is_secret_ref(r)) {
                        found.push((node.id.clone(), key.clone()));
                    }
                }
            }
            if found.is_empty() {
                return secrets;
            }
            for (id, key) in found {
                secrets.keys.entry(id).or_default().insert(key);
            }
        }
    }

    pub fn is_secret(&self, id: &str, key: &str) -> bool {
        self.keys.get(id).is_some_and(|keys| keys.contains(key))
    }

    fn is_secret_ref(&self, r: &OutputRef) -> bool {
        let output = r.output.split('.').next().unwrap_or(&r.output);
        self.is_secret(r.node.as_str(), output)
    }
}

/// Mask outputs that echo secret data.
pub fn redact_outputs(
    secrets: &SecretOutputs,
    id: &str,
    outputs: &Outputs,
) -> BTreeMap<String, JsonValue> {
    outputs
        .iter()
        .map(|(key, value)| {
            let secret = secrets.is_secret(id, key);
            let shown = if secret {
                JsonValue::String(REDACTED.into())
            } else {
                value.clone()
            };
            (key.clone(), shown)
        })
        .collect()
}

fn short_json(value: &JsonValue) -> String {
    let text = value.to_string();
    if text.chars().count() <= MAX_VALUE_CHARS {
        return text;
    }
    let cut: String = text.chars().take(MAX_VALUE_CHARS).collect();
    format!("{}…", cut)
}

fn format_wall(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

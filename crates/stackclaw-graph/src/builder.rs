//! Resource graph builder.
//!
//! Turns an ordered list of declarations into nodes and dependency edges.
//! Edges come from three places: the `parent` link, explicit `dependsOn`
//! entries, and every output reference found by walking the property tree.

use serde::Serialize;
use stackclaw_core::{
    validate_id, Declaration, DeploymentContext, Error, NodeId, Properties, ResourceKind, Result,
};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A single declared resource, immutable once the graph is built.
#[derive(Clone, Debug)]
pub struct ResourceNode {
    pub id: NodeId,
    pub resource_type: String,
    pub kind: ResourceKind,
    pub properties: Properties,
    pub parent: Option<NodeId>,
    pub depends_on: Vec<NodeId>,
    /// Position in the declaration list; the resolver's tie-break.
    pub index: usize,
    dependencies: Vec<NodeId>,
}

impl ResourceNode {
    /// Every node this one depends on: parent first, then explicit
    /// dependencies, then referenced nodes. No duplicates.
    pub fn dependencies(&self) -> &[NodeId] {
        &self.dependencies
    }

    pub fn is_data(&self) -> bool {
        self.kind == ResourceKind::Data
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Parent,
    Explicit,
    Reference,
}

/// `dependent` cannot run before `dependency` has completed.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Edge {
    pub dependent: NodeId,
    pub dependency: NodeId,
    pub kind: EdgeKind,
}

#[derive(Clone, Debug, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    index: HashMap<NodeId, usize>,
    dependents: HashMap<NodeId, Vec<NodeId>>,
    edges: Vec<Edge>,
}

impl ResourceGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    pub fn node(&self, id: &str) -> Option<&ResourceNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn dependencies(&self, id: &str) -> &[NodeId] {
        self.node(id).map(ResourceNode::dependencies).unwrap_or(&[])
    }

    /// Nodes that depend directly on `id`, in declaration order.
    pub fn dependents(&self, id: &str) -> &[NodeId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn children(&self, id: &str) -> Vec<&ResourceNode> {
        self.nodes
            .iter()
            .filter(|n| n.parent.as_ref().map(NodeId::as_str) == Some(id))
            .collect()
    }

    /// Everything that depends on `id`, directly or through other nodes.
    pub fn transitive_dependents(&self, id: &str) -> Vec<NodeId> {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut stack: Vec<NodeId> = self.dependents(id).to_vec();
        let mut out = Vec::new();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents(next.as_str()).iter().cloned());
                out.push(next);
            }
        }
        out.sort_by_key(|n| self.index.get(n.as_str()).copied().unwrap_or(usize::MAX));
        out
    }
}

/// Collects declarations for one deployment and builds the graph.
pub struct GraphBuilder<'a> {
    ctx: &'a DeploymentContext,
    declarations: Vec<Declaration>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(ctx: &'a DeploymentContext) -> Self {
        Self {
            ctx,
            declarations: Vec::new(),
        }
    }

    pub fn add(&mut self, declaration: Declaration) -> &mut Self {
        self.declarations.push(declaration);
        self
    }

    pub fn extend(&mut self, declarations: impl IntoIterator<Item = Declaration>) -> &mut Self {
        self.declarations.extend(declarations);
        self
    }

    pub fn build(self) -> Result<ResourceGraph> {
        // First pass: ids, duplicates, config substitution
        let mut index: HashMap<NodeId, usize> = HashMap::new();
        let mut nodes: Vec<ResourceNode> = Vec::with_capacity(self.declarations.len());
        for (i, decl) in self.declarations.into_iter().enumerate() {
            validate_id(&decl.id)?;
            if index.contains_key(decl.id.as_str()) {
                return Err(Error::DuplicateId(decl.id));
            }
            index.insert(decl.id.clone(), i);

            let properties = decl
                .properties
                .into_iter()
                .map(|(k, v)| Ok((k, v.substitute_config(&self.ctx.config)?)))
                .collect::<Result<Properties>>()?;

            nodes.push(ResourceNode {
                id: decl.id,
                resource_type: decl.resource_type,
                kind: decl.kind,
                properties,
                parent: decl.parent,
                depends_on: decl.depends_on,
                index: i,
                dependencies: Vec::new(),
            });
        }

        // Second pass: edges
        let mut edges = Vec::new();
        let mut dependents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in &mut nodes {
            let mut deps: Vec<(NodeId, EdgeKind)> = Vec::new();
            if let Some(parent) = &node.parent {
                check_target(&index, &node.id, parent, "parent")?;
                deps.push((parent.clone(), EdgeKind::Parent));
            }
            for dep in &node.depends_on {
                check_target(&index, &node.id, dep, "dependsOn")?;
                deps.push((dep.clone(), EdgeKind::Explicit));
            }
            for (name, value) in &node.properties {
                for reference in value.references() {
                    check_target(
                        &index,
                        &node.id,
                        &reference.node,
                        &format!("property '{}'", name),
                    )?;
                    deps.push((reference.node.clone(), EdgeKind::Reference));
                }
            }

            let mut seen = HashSet::new();
            for (dep, kind) in deps {
                if !seen.insert(dep.clone()) {
                    continue;
                }
                dependents.entry(dep.clone()).or_default().push(node.id.clone());
                edges.push(Edge {
                    dependent: node.id.clone(),
                    dependency: dep.clone(),
                    kind,
                });
                node.dependencies.push(dep);
            }
        }

        debug!(
            stack = %self.ctx.stack,
            nodes = nodes.len(),
            edges = edges.len(),
            "resource graph built"
        );

        Ok(ResourceGraph {
            nodes,
            index,
            dependents,
            edges,
        })
    }
}

fn check_target(
    index: &HashMap<NodeId, usize>,
    node: &NodeId,
    target: &NodeId,
    via: &str,
) -> Result<()> {
    if target == node {
        return Err(Error::CycleDetected {
            cycle: vec![node.clone(), node.clone()],
        });
    }
    if !index.contains_key(target.as_str()) {
        return Err(Error::dangling(node, target, via));
    }
    Ok(())
}

/// Build a graph from declarations in one call.
pub fn build_graph(
    ctx: &DeploymentContext,
    declarations: impl IntoIterator<Item = Declaration>,
) -> Result<ResourceGraph> {
    let mut builder = GraphBuilder::new(ctx);
    builder.extend(declarations);
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackclaw_core::{StackConfig, Value};

    fn ctx() -> DeploymentContext {
        let mut config = StackConfig::new();
        config.set("rgName", "rg-demo");
        DeploymentContext::new("test", config)
    }

    #[test]
    fn edges_from_parent_explicit_and_references() {
        let graph = build_graph(
            &ctx(),
            vec![
                Declaration::data("rg", "azure-native:resources:getResourceGroup")
                    .property("resourceGroupName", Value::Config("rgName".into())),
                Declaration::managed("kv", "azure-native:keyvault:Vault")
                    .property("resourceGroupName", Value::reference("rg", "name")),
                Declaration::managed("pwd", "azure-native:keyvault:Secret")
                    .parent("kv")
                    .depends_on("rg")
                    .property("resourceGroupName", Value::reference("rg", "name"))
                    .property("vault", Value::reference("kv", "id")),
            ],
        )
        .unwrap();

        assert_eq!(graph.dependencies("pwd"), &[NodeId::new("kv"), NodeId::new("rg")]);
        assert_eq!(graph.dependents("rg"), &[NodeId::new("kv"), NodeId::new("pwd")]);
        assert_eq!(graph.edges().len(), 3);
        assert_eq!(graph.edges()[1].kind, EdgeKind::Parent);
        assert_eq!(
            graph.node("rg").unwrap().properties["resourceGroupName"],
            Value::literal("rg-demo")
        );
        assert_eq!(graph.children("kv").len(), 1);
        assert_eq!(
            graph.transitive_dependents("rg"),
            vec![NodeId::new("kv"), NodeId::new("pwd")]
        );
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let err = build_graph(
            &ctx(),
            vec![Declaration::managed("a", "t:m:A").property("x", Value::reference("a", "id"))],
        )
        .unwrap_err();
        match err {
            Error::CycleDetected { cycle } => assert_eq!(cycle, vec![NodeId::new("a"); 2]),
            other => panic!("expected cycle, got {other}"),
        }
    }
}

//! Output propagation: one-shot output cells per node.
//!
//! Every node in a run gets a cell that moves exactly once from `Pending` to
//! `Ready` or `Failed`. Dependents wait on the cells they reference; any
//! number of waiters can share one cell without touching the producer.

use futures::future::join_all;
use serde_json::Value as JsonValue;
use stackclaw_core::{
    resolve_properties, Error, NodeId, OutputRef, Outputs, Properties, Result, Unresolved,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Debug, PartialEq)]
pub enum Slot {
    Pending,
    Ready(Arc<Outputs>),
    /// The producer failed or was skipped; its outputs will never exist.
    Failed,
}

impl Slot {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

pub struct OutputBoard {
    cells: HashMap<NodeId, watch::Sender<Slot>>,
}

impl OutputBoard {
    pub fn new(ids: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            cells: ids
                .into_iter()
                .map(|id| (id, watch::channel(Slot::Pending).0))
                .collect(),
        }
    }

    fn cell(&self, id: &NodeId) -> Result<&watch::Sender<Slot>> {
        self.cells
            .get(id)
            .ok_or_else(|| Error::unresolved(id, "not part of this run"))
    }

    fn settle(&self, id: &NodeId, slot: Slot) -> Result<()> {
        let changed = self.cell(id)?.send_if_modified(|current| {
            if current.is_pending() {
                *current = slot;
                true
            } else {
                false
            }
        });
        if changed {
            Ok(())
        } else {
            Err(Error::AlreadyPublished(id.clone()))
        }
    }

    /// Mark `id` ready. Fails if the cell was already settled.
    pub fn publish(&self, id: &NodeId, outputs: Outputs) -> Result<()> {
        self.settle(id, Slot::Ready(Arc::new(outputs)))
    }

    /// Mark `id` as never going to produce outputs.
    pub fn fail(&self, id: &NodeId) -> Result<()> {
        self.settle(id, Slot::Failed)
    }

    /// Current value without waiting.
    pub fn peek(&self, id: &str) -> Option<Slot> {
        self.cells.get(id).map(|tx| tx.borrow().clone())
    }

    /// Wait until `id` settles.
    pub async fn wait(&self, id: &NodeId) -> Result<Slot> {
        let mut rx = self.cell(id)?.subscribe();
        let settled = rx
            .wait_for(|slot| !slot.is_pending())
            .await
            .map_err(|_| Error::unresolved(id, "output cell closed"))?;
        Ok(settled.clone())
    }

    /// Resolve `node`'s properties, waiting for every referenced producer.
    pub async fn resolve(&self, node: &NodeId, properties: &Properties) -> Result<JsonValue> {
        let producers: BTreeSet<NodeId> = properties
            .values()
            .flat_map(|v| v.references())
            .map(|r| r.node.clone())
            .collect();

        let settled = join_all(producers.iter().map(|p| self.wait(p))).await;
        let mut ready: BTreeMap<NodeId, Arc<Outputs>> = BTreeMap::new();
        for (producer, slot) in producers.iter().zip(settled) {
            match slot? {
                Slot::Ready(outputs) => {
                    ready.insert(producer.clone(), outputs);
                }
                _ => {
                    return Err(Error::unresolved(
                        node,
                        format!("dependency {} produced no outputs", producer),
                    ))
                }
            }
        }

        let lookup = |r: &OutputRef| {
            ready
                .get(r.node.as_str())
                .and_then(|outputs| r.lookup(outputs))
                .cloned()
        };
        resolve_properties(properties, &lookup).map_err(|missing| match missing {
            Unresolved::Output(r) => Error::unresolved(
                node,
                format!("{} has no output '{}'", r.node, r.output),
            ),
            other => Error::unresolved(node, other.to_string()),
        })
    }

    /// Outputs of every node that reached `Ready`.
    pub fn ready_outputs(&self) -> BTreeMap<NodeId, Outputs> {
        self.cells
            .iter()
            .filter_map(|(id, tx)| match &*tx.borrow() {
                Slot::Ready(outputs) => Some((id.clone(), outputs.as_ref().clone())),
                _ => None,
            })
            .collect()
    }
}

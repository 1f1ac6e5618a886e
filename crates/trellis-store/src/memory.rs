use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use trellis_core::error::{Result, TrellisError};
use trellis_core::filter::NodeFilter;
use trellis_core::traits::NodeStore;
use trellis_core::types::NodeExecution;

/// Process-local node store. Each primitive runs under one short lock.
#[derive(Default)]
pub struct MemoryStore {
    nodes: Mutex<Nodes>,
}

/// Records keyed by id, each tagged with its insertion sequence.
#[derive(Default)]
struct Nodes {
    by_id: HashMap<String, (u64, NodeExecution)>,
    next_seq: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().map(|n| n.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Another live attempt of the same plan node in the same plan execution.
fn has_live_rival(nodes: &Nodes, node: &NodeExecution) -> bool {
    nodes.by_id.values().any(|(_, n)| {
        !n.old_retry
            && n.id != node.id
            && n.plan_execution_id == node.plan_execution_id
            && n.plan_node.id == node.plan_node.id
    })
}

impl NodeStore for MemoryStore {
    fn insert(&self, node: NodeExecution) -> BoxFuture<'_, Result<NodeExecution>> {
        Box::pin(async move {
            let mut nodes = self
                .nodes
                .lock()
                .map_err(|e| TrellisError::Database(e.to_string()))?;

            if nodes.by_id.contains_key(&node.id) {
                return Err(TrellisError::Conflict(format!(
                    "Node execution already exists: {}",
                    node.id
                )));
            }
            if !node.old_retry && has_live_rival(&nodes, &node) {
                return Err(TrellisError::Conflict(format!(
                    "Live attempt already exists for plan node {} in plan execution {}",
                    node.plan_node.id, node.plan_execution_id
                )));
            }

            let seq = nodes.next_seq;
            nodes.next_seq += 1;
            nodes.by_id.insert(node.id.clone(), (seq, node.clone()));
            Ok(node)
        })
    }

    fn fetch(&self, id: &str) -> BoxFuture<'_, Result<Option<NodeExecution>>> {
        let id = id.to_string();

        Box::pin(async move {
            let nodes = self
                .nodes
                .lock()
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            Ok(nodes.by_id.get(&id).map(|(_, n)| n.clone()))
        })
    }

    fn find(&self, filter: &NodeFilter) -> BoxFuture<'_, Result<Vec<NodeExecution>>> {
        let filter = filter.clone();

        Box::pin(async move {
            let nodes = self
                .nodes
                .lock()
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            let mut found: Vec<&(u64, NodeExecution)> = nodes
                .by_id
                .values()
                .filter(|(_, n)| filter.matches(n))
                .collect();
            // Insertion order, like rowid order in the sqlite backend
            found.sort_by_key(|(seq, _)| *seq);
            Ok(found.into_iter().map(|(_, n)| n.clone()).collect())
        })
    }

    fn compare_and_swap(
        &self,
        candidate: NodeExecution,
    ) -> BoxFuture<'_, Result<Option<NodeExecution>>> {
        Box::pin(async move {
            let mut nodes = self
                .nodes
                .lock()
                .map_err(|e| TrellisError::Database(e.to_string()))?;

            let stored = nodes
                .by_id
                .get(&candidate.id)
                .map(|(_, n)| n)
                .ok_or_else(|| TrellisError::NotFound(candidate.id.clone()))?;
            if stored.version != candidate.version {
                return Ok(None);
            }
            if stored.old_retry && !candidate.old_retry && has_live_rival(&nodes, &candidate) {
                return Err(TrellisError::Conflict(format!(
                    "Live attempt already exists for plan node {} in plan execution {}",
                    candidate.plan_node.id, candidate.plan_execution_id
                )));
            }

            let mut next = candidate;
            next.version += 1;
            if let Some((_, stored)) = nodes.by_id.get_mut(&next.id) {
                *stored = next.clone();
            }
            Ok(Some(next))
        })
    }
}

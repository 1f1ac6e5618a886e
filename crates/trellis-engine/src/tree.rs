use std::collections::HashMap;

use trellis_core::status::Status;
use trellis_core::types::NodeExecution;

/// In-memory snapshot of one plan execution's node tree.
///
/// Nodes live in a flat arena; parent/child links are arena indices. Built
/// once from a bulk fetch so deep trees cost a single store round trip.
#[derive(Debug, Default)]
pub struct ExecutionTree {
    nodes: Vec<NodeExecution>,
    index: HashMap<String, usize>,
    children: Vec<Vec<usize>>,
    roots: Vec<usize>,
}

impl ExecutionTree {
    /// Build from live records. Children keep the order of `nodes`; a node
    /// whose parent is absent from the snapshot is treated as a root.
    pub fn build(nodes: Vec<NodeExecution>) -> Self {
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let mut children = vec![Vec::new(); nodes.len()];
        let mut roots = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            match node.parent_id.as_ref().and_then(|p| index.get(p)) {
                Some(&parent) => children[parent].push(i),
                None => roots.push(i),
            }
        }

        Self {
            nodes,
            index,
            children,
            roots,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&NodeExecution> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn roots(&self) -> impl Iterator<Item = &NodeExecution> {
        self.roots.iter().map(move |&i| &self.nodes[i])
    }

    pub fn children(&self, id: &str) -> impl Iterator<Item = &NodeExecution> {
        let kids = self
            .index
            .get(id)
            .map(|&i| self.children[i].as_slice())
            .unwrap_or(&[]);
        kids.iter().map(move |&i| &self.nodes[i])
    }

    /// Every node under `root_id` whose status is in `statuses` (empty
    /// matches all), in pre-order. Non-matching nodes are still walked
    /// through. Returns `None` if `root_id` is not in the snapshot.
    pub fn descendants(
        &self,
        root_id: &str,
        statuses: &[Status],
        include_root: bool,
    ) -> Option<Vec<&NodeExecution>> {
        let root = *self.index.get(root_id)?;
        let wanted = |n: &NodeExecution| statuses.is_empty() || statuses.contains(&n.status);

        let mut found = Vec::new();
        if include_root && wanted(&self.nodes[root]) {
            found.push(&self.nodes[root]);
        }

        let mut stack: Vec<usize> = self.children[root].iter().rev().copied().collect();
        while let Some(i) = stack.pop() {
            let node = &self.nodes[i];
            if wanted(node) {
                found.push(node);
            }
            stack.extend(self.children[i].iter().rev().copied());
        }
        Some(found)
    }

    /// Nodes in `eligible` with no non-terminal descendant: the current
    /// leaves of the active subtree. An empty `eligible` means any
    /// non-terminal status.
    pub fn active_leaves(&self, eligible: &[Status]) -> Vec<&NodeExecution> {
        let eligible: &[Status] = if eligible.is_empty() {
            &Status::NON_TERMINAL
        } else {
            eligible
        };

        // Post-order: a node's flag is computed after all of its children
        let mut active_below = vec![false; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(usize, bool)> = self.roots.iter().map(|&r| (r, false)).collect();
        while let Some((i, expanded)) = stack.pop() {
            if expanded {
                order.push(i);
                continue;
            }
            stack.push((i, true));
            stack.extend(self.children[i].iter().map(|&c| (c, false)));
        }
        for &i in &order {
            active_below[i] = self.children[i]
                .iter()
                .any(|&c| !self.nodes[c].status.is_terminal() || active_below[c]);
        }

        let mut leaves: Vec<usize> = order
            .into_iter()
            .filter(|&i| eligible.contains(&self.nodes[i].status) && !active_below[i])
            .collect();
        leaves.sort_unstable();
        leaves.into_iter().map(|i| &self.nodes[i]).collect()
    }

    pub fn into_nodes(self) -> Vec<NodeExecution> {
        self.nodes
    }
}

use trellis_core::error::{Result, TrellisError};
use trellis_core::filter::NodeFilter;
use trellis_core::status::Status;
use trellis_core::types::{NodeExecution, StepCategory};
use trellis_store::NodeExecutionStore;

use crate::tree::ExecutionTree;

/// Structural queries over the node executions of a plan execution.
///
/// Every query except [`TreeNavigator::fetch_all`] sees live attempts only.
#[derive(Clone)]
pub struct TreeNavigator {
    store: NodeExecutionStore,
}

impl TreeNavigator {
    pub fn new(store: NodeExecutionStore) -> Self {
        Self { store }
    }

    /// Snapshot of the live tree, from a single bulk fetch.
    pub async fn snapshot(&self, plan_execution_id: &str) -> Result<ExecutionTree> {
        let nodes = self.store.find(&NodeFilter::plan(plan_execution_id)).await?;
        Ok(ExecutionTree::build(nodes))
    }

    /// The live attempt of a plan node.
    pub async fn get_by_plan_node(
        &self,
        plan_execution_id: &str,
        plan_node_id: &str,
    ) -> Result<NodeExecution> {
        self.store
            .find(&NodeFilter::plan(plan_execution_id).plan_node(plan_node_id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TrellisError::NoLiveExecution {
                plan_node_id: plan_node_id.to_string(),
            })
    }

    pub async fn get_by_identifier(
        &self,
        plan_execution_id: &str,
        identifier: &str,
    ) -> Result<Option<NodeExecution>> {
        Ok(self
            .store
            .find(&NodeFilter::plan(plan_execution_id).identifier(identifier))
            .await?
            .into_iter()
            .next())
    }

    /// Immediate live children, newest first.
    pub async fn fetch_direct_children(
        &self,
        plan_execution_id: &str,
        parent_id: &str,
    ) -> Result<Vec<NodeExecution>> {
        let mut children = self
            .store
            .find(&NodeFilter::plan(plan_execution_id).parent(parent_id))
            .await?;
        children.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(children)
    }

    /// Live direct children of `parent_id` in one of `statuses`.
    pub async fn find_children_with_status(
        &self,
        plan_execution_id: &str,
        parent_id: &str,
        statuses: &[Status],
    ) -> Result<Vec<NodeExecution>> {
        self.store
            .find(
                &NodeFilter::plan(plan_execution_id)
                    .parent(parent_id)
                    .statuses(statuses.iter().copied()),
            )
            .await
    }

    /// Every live node in the subtree of `root_id` whose status is in
    /// `statuses` (empty matches all). Intermediate nodes that don't match
    /// are walked through, not pruned.
    pub async fn find_all_descendants(
        &self,
        plan_execution_id: &str,
        root_id: &str,
        statuses: &[Status],
        include_root: bool,
    ) -> Result<Vec<NodeExecution>> {
        let tree = self.snapshot(plan_execution_id).await?;
        let found = tree
            .descendants(root_id, statuses, include_root)
            .ok_or_else(|| TrellisError::NotFound(root_id.to_string()))?;
        Ok(found.into_iter().cloned().collect())
    }

    pub async fn fetch_by_status(
        &self,
        plan_execution_id: &str,
        status: Status,
    ) -> Result<Vec<NodeExecution>> {
        self.store
            .find(&NodeFilter::plan(plan_execution_id).statuses([status]))
            .await
    }

    /// Every record of the plan execution, superseded attempts included.
    pub async fn fetch_all(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        self.store
            .find(&NodeFilter::plan(plan_execution_id).with_old_retries())
            .await
    }

    /// Live stage nodes, oldest first.
    pub async fn fetch_stage_executions(
        &self,
        plan_execution_id: &str,
    ) -> Result<Vec<NodeExecution>> {
        let mut stages = self
            .store
            .find(&NodeFilter::plan(plan_execution_id).category(StepCategory::Stage))
            .await?;
        stages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(stages)
    }

    pub async fn get_pipeline_node(&self, plan_execution_id: &str) -> Result<NodeExecution> {
        self.store
            .find(&NodeFilter::plan(plan_execution_id).category(StepCategory::Pipeline))
            .await?
            .into_iter()
            .min_by(|a, b| a.created_at.cmp(&b.created_at))
            .ok_or_else(|| {
                TrellisError::NotFound(format!(
                    "pipeline node of plan execution {}",
                    plan_execution_id
                ))
            })
    }

    /// Live nodes in `eligible` with no non-terminal descendant.
    pub async fn find_active_leaves(
        &self,
        plan_execution_id: &str,
        eligible: &[Status],
    ) -> Result<Vec<NodeExecution>> {
        let tree = self.snapshot(plan_execution_id).await?;
        Ok(tree.active_leaves(eligible).into_iter().cloned().collect())
    }

    /// True when nothing under `node_id` is still non-terminal.
    pub async fn is_subtree_complete(&self, plan_execution_id: &str, node_id: &str) -> Result<bool> {
        let active = self
            .find_all_descendants(plan_execution_id, node_id, &Status::NON_TERMINAL, false)
            .await?;
        Ok(active.is_empty())
    }
}

use std::sync::Arc;

use tokio::sync::broadcast;

use trellis_core::config::EngineConfig;
use trellis_core::error::Result;
use trellis_core::event::{EventBus, NodeEvent};
use trellis_core::filter::NodeFilter;
use trellis_core::status::Status;
use trellis_core::types::NodeExecution;
use trellis_store::{open_store, BulkOutcome, Change, NodeExecutionStore, UpdateOutcome};

use crate::navigator::TreeNavigator;
use crate::retry::{RetryManager, RetryOutcome};
use crate::timeout::TimeoutTracker;
use crate::transition::StatusEngine;
use crate::tree::ExecutionTree;

/// Entry point for everything that reads or writes node executions.
///
/// Every successful write is published on the event bus.
#[derive(Clone)]
pub struct NodeExecutionService {
    store: NodeExecutionStore,
    navigator: TreeNavigator,
    transitions: StatusEngine,
    timeouts: TimeoutTracker,
    retries: RetryManager,
    events: Arc<EventBus>,
}

impl NodeExecutionService {
    pub fn new(store: NodeExecutionStore, events: Arc<EventBus>) -> Self {
        let navigator = TreeNavigator::new(store.clone());
        Self {
            transitions: StatusEngine::new(store.clone(), navigator.clone()),
            timeouts: TimeoutTracker::new(store.clone()),
            retries: RetryManager::new(store.clone()),
            navigator,
            store,
            events,
        }
    }

    /// Open the configured store and a fresh event bus.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let store = open_store(config)?;
        Ok(Self::new(store, Arc::new(EventBus::from_config(&config.events))))
    }

    pub fn store(&self) -> &NodeExecutionStore {
        &self.store
    }

    pub fn navigator(&self) -> &TreeNavigator {
        &self.navigator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    // -- Writes --

    pub async fn save(&self, node: NodeExecution) -> Result<NodeExecution> {
        let saved = self.store.save(node).await?;
        self.events.publish(NodeEvent::Started { node: saved.clone() });
        Ok(saved)
    }

    pub async fn transition(&self, id: &str, from: &[Status], to: Status) -> Result<UpdateOutcome> {
        let outcome = self.transitions.transition(id, from, to).await?;
        self.publish_outcome(&outcome);
        Ok(outcome)
    }

    pub async fn transition_with<F>(
        &self,
        id: &str,
        from: &[Status],
        to: Status,
        extra: F,
    ) -> Result<UpdateOutcome>
    where
        F: Fn(&mut NodeExecution) + Send + Sync,
    {
        let outcome = self.transitions.transition_with(id, from, to, extra).await?;
        self.publish_outcome(&outcome);
        Ok(outcome)
    }

    /// Error out every active node; returns how many changed.
    pub async fn error_out_active_nodes(&self, plan_execution_id: &str) -> Result<usize> {
        let outcome = self.transitions.error_out_active_nodes(plan_execution_id).await?;
        Ok(self.publish_bulk(outcome))
    }

    pub async fn mark_leaves_discontinuing(
        &self,
        plan_execution_id: &str,
        node_ids: &[String],
    ) -> Result<usize> {
        let outcome = self
            .transitions
            .mark_leaves_discontinuing(plan_execution_id, node_ids)
            .await?;
        Ok(self.publish_bulk(outcome))
    }

    pub async fn mark_all_leaves_discontinuing(
        &self,
        plan_execution_id: &str,
        eligible: &[Status],
    ) -> Result<usize> {
        let outcome = self
            .transitions
            .mark_all_leaves_discontinuing(plan_execution_id, eligible)
            .await?;
        Ok(self.publish_bulk(outcome))
    }

    pub async fn attach_timeout_instance(&self, id: &str, timeout_instance_id: &str) -> Result<NodeExecution> {
        let outcome = self.timeouts.attach_timeout_instance(id, timeout_instance_id).await?;
        self.publish_outcome(&outcome);
        Ok(outcome.into_node())
    }

    /// Always `true` on success, including when nothing was attached.
    pub async fn remove_timeout_instances(&self, id: &str) -> Result<bool> {
        let outcome = self.timeouts.remove_timeout_instances(id).await?;
        self.publish_outcome(&outcome);
        Ok(true)
    }

    /// `true` if the flag changed, `false` if the node was already superseded.
    pub async fn mark_retried(&self, id: &str) -> Result<bool> {
        let outcome = self.retries.mark_retried(id).await?;
        self.publish_outcome(&outcome);
        Ok(outcome.is_updated())
    }

    pub async fn update_relationships_for_retry(&self, old_id: &str, new_id: &str) -> Result<usize> {
        let outcome = self.retries.update_relationships_for_retry(old_id, new_id).await?;
        Ok(self.publish_bulk(outcome))
    }

    pub async fn retry_node(&self, old_id: &str, attempt: NodeExecution) -> Result<RetryOutcome> {
        let outcome = self.retries.retry_node(old_id, attempt).await?;
        self.publish_change(&outcome.superseded);
        for change in &outcome.superseded_descendants.changes {
            self.publish_change(change);
        }
        self.events.publish(NodeEvent::Started {
            node: outcome.attempt.clone(),
        });
        for change in &outcome.rewired.changes {
            self.publish_change(change);
        }
        Ok(outcome)
    }

    // -- Reads --

    pub async fn get(&self, id: &str) -> Result<NodeExecution> {
        self.store.get(id).await
    }

    pub async fn find(&self, filter: &NodeFilter) -> Result<Vec<NodeExecution>> {
        self.store.find(filter).await
    }

    pub async fn snapshot(&self, plan_execution_id: &str) -> Result<ExecutionTree> {
        self.navigator.snapshot(plan_execution_id).await
    }

    pub async fn get_by_plan_node(&self, plan_execution_id: &str, plan_node_id: &str) -> Result<NodeExecution> {
        self.navigator.get_by_plan_node(plan_execution_id, plan_node_id).await
    }

    pub async fn get_by_identifier(
        &self,
        plan_execution_id: &str,
        identifier: &str,
    ) -> Result<Option<NodeExecution>> {
        self.navigator.get_by_identifier(plan_execution_id, identifier).await
    }

    pub async fn fetch_direct_children(
        &self,
        plan_execution_id: &str,
        parent_id: &str,
    ) -> Result<Vec<NodeExecution>> {
        self.navigator.fetch_direct_children(plan_execution_id, parent_id).await
    }

    pub async fn find_children_with_status(
        &self,
        plan_execution_id: &str,
        parent_id: &str,
        statuses: &[Status],
    ) -> Result<Vec<NodeExecution>> {
        self.navigator
            .find_children_with_status(plan_execution_id, parent_id, statuses)
            .await
    }

    pub async fn find_all_descendants(
        &self,
        plan_execution_id: &str,
        root_id: &str,
        statuses: &[Status],
        include_root: bool,
    ) -> Result<Vec<NodeExecution>> {
        self.navigator
            .find_all_descendants(plan_execution_id, root_id, statuses, include_root)
            .await
    }

    pub async fn fetch_by_status(&self, plan_execution_id: &str, status: Status) -> Result<Vec<NodeExecution>> {
        self.navigator.fetch_by_status(plan_execution_id, status).await
    }

    pub async fn fetch_all(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        self.navigator.fetch_all(plan_execution_id).await
    }

    pub async fn fetch_stage_executions(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        self.navigator.fetch_stage_executions(plan_execution_id).await
    }

    pub async fn get_pipeline_node(&self, plan_execution_id: &str) -> Result<NodeExecution> {
        self.navigator.get_pipeline_node(plan_execution_id).await
    }

    pub async fn find_active_leaves(
        &self,
        plan_execution_id: &str,
        eligible: &[Status],
    ) -> Result<Vec<NodeExecution>> {
        self.navigator.find_active_leaves(plan_execution_id, eligible).await
    }

    pub async fn is_subtree_complete(&self, plan_execution_id: &str, node_id: &str) -> Result<bool> {
        self.navigator.is_subtree_complete(plan_execution_id, node_id).await
    }

    pub async fn timeout_instances(&self, id: &str) -> Result<Vec<String>> {
        self.timeouts.timeout_instances(id).await
    }

    fn publish_outcome(&self, outcome: &UpdateOutcome) {
        if let UpdateOutcome::Updated(change) = outcome {
            self.publish_change(change);
        }
    }

    fn publish_bulk(&self, outcome: BulkOutcome) -> usize {
        for change in &outcome.changes {
            self.publish_change(change);
        }
        outcome.count()
    }

    fn publish_change(&self, change: &Change) {
        let event = if change.status_changed() {
            NodeEvent::StatusUpdated {
                node: change.current.clone(),
                previous: change.previous.status,
            }
        } else {
            NodeEvent::Updated {
                node: change.current.clone(),
            }
        };
        self.events.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::types::StepCategory;
    use trellis_test_utils::{child_of, execution, group, retry_of, PLAN_EXECUTION_ID};

    fn service() -> NodeExecutionService {
        NodeExecutionService::new(NodeExecutionStore::in_memory(), Arc::new(EventBus::default()))
    }

    fn drain(rx: &mut broadcast::Receiver<NodeEvent>) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn test_save_and_transition_publish_events() {
        let svc = service();
        let mut rx = svc.subscribe();

        let node = svc
            .save(execution(PLAN_EXECUTION_ID, "build", Status::Queued))
            .await
            .unwrap();
        svc.transition(&node.id, &[], Status::Running).await.unwrap();
        // No-op: already RUNNING
        svc.transition(&node.id, &[Status::Queued], Status::Running).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], NodeEvent::Started { .. }));
        match &events[1] {
            NodeEvent::StatusUpdated { node: n, previous } => {
                assert_eq!(n.id, node.id);
                assert_eq!(n.status, Status::Running);
                assert_eq!(*previous, Status::Queued);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_changes_publish_updated() {
        let svc = service();
        let node = svc
            .save(execution(PLAN_EXECUTION_ID, "wait", Status::Running))
            .await
            .unwrap();
        let mut rx = svc.subscribe();

        let attached = svc.attach_timeout_instance(&node.id, "t1").await.unwrap();
        assert_eq!(attached.timeout_instance_ids, vec!["t1"]);
        assert!(svc.remove_timeout_instances(&node.id).await.unwrap());
        assert!(svc.remove_timeout_instances(&node.id).await.unwrap());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(e, NodeEvent::Updated { .. })));
        assert!(svc.timeout_instances(&node.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_operations_return_counts() {
        let svc = service();
        let stage = svc
            .save(group(PLAN_EXECUTION_ID, "stage", StepCategory::Stage, Status::Running))
            .await
            .unwrap();
        let a = svc.save(child_of(&stage, "a", Status::Running)).await.unwrap();
        svc.save(child_of(&stage, "b", Status::Queued)).await.unwrap();
        let mut rx = svc.subscribe();

        let discontinued = svc
            .mark_leaves_discontinuing(PLAN_EXECUTION_ID, &[a.id.clone()])
            .await
            .unwrap();
        assert_eq!(discontinued, 1);

        // stage and b are active; a is DISCONTINUING and not eligible
        let errored = svc.error_out_active_nodes(PLAN_EXECUTION_ID).await.unwrap();
        assert_eq!(errored, 2);
        assert_eq!(svc.error_out_active_nodes(PLAN_EXECUTION_ID).await.unwrap(), 0);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .all(|e| matches!(e, NodeEvent::StatusUpdated { .. })));
        assert!(!svc.is_subtree_complete(PLAN_EXECUTION_ID, &stage.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_node_events() {
        let svc = service();
        let node = svc
            .save(execution(PLAN_EXECUTION_ID, "flaky", Status::Failed))
            .await
            .unwrap();
        let mut rx = svc.subscribe();

        let outcome = svc.retry_node(&node.id, retry_of(&node)).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], NodeEvent::Updated { node: n } if n.id == node.id && n.old_retry));
        assert!(matches!(&events[1], NodeEvent::Started { node: n } if n.id == outcome.attempt.id));

        let live = svc
            .get_by_plan_node(PLAN_EXECUTION_ID, &node.plan_node.id)
            .await
            .unwrap();
        assert_eq!(live.id, outcome.attempt.id);
        assert!(!svc.mark_retried(&node.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_group_retry_publishes_superseded_children() {
        let svc = service();
        let fork = svc
            .save(group(PLAN_EXECUTION_ID, "fork", StepCategory::Fork, Status::Failed))
            .await
            .unwrap();
        let branch = svc.save(child_of(&fork, "branch", Status::Failed)).await.unwrap();
        let mut rx = svc.subscribe();

        let outcome = svc.retry_node(&fork.id, retry_of(&fork)).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], NodeEvent::Updated { node: n } if n.id == fork.id && n.old_retry));
        assert!(matches!(&events[1], NodeEvent::Updated { node: n } if n.id == branch.id && n.old_retry));
        assert!(matches!(&events[2], NodeEvent::Started { node: n } if n.id == outcome.attempt.id));
        assert!(svc
            .fetch_direct_children(PLAN_EXECUTION_ID, &fork.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_from_memory_config() {
        let config = EngineConfig::from_toml("[store]\nbackend = \"memory\"\n").unwrap();
        let svc = NodeExecutionService::from_config(&config).unwrap();
        let node = svc
            .save(execution(PLAN_EXECUTION_ID, "build", Status::Queued))
            .await
            .unwrap();
        assert_eq!(svc.get(&node.id).await.unwrap().version, 1);
        assert_eq!(svc.fetch_all(PLAN_EXECUTION_ID).await.unwrap().len(), 1);
    }
}

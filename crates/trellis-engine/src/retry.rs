use tracing::{info, warn};

use trellis_core::error::{Result, TrellisError};
use trellis_core::filter::NodeFilter;
use trellis_core::types::NodeExecution;
use trellis_store::{BulkOutcome, Change, NodeExecutionStore, UpdateOutcome};

use crate::tree::ExecutionTree;

/// What a completed retry touched.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    /// The new live attempt, as saved.
    pub attempt: NodeExecution,
    /// The previous attempt, now flagged `old_retry`.
    pub superseded: Change,
    /// Live records that sat under the previous attempt, flagged with it.
    pub superseded_descendants: BulkOutcome,
    /// Siblings whose `previous_id` moved to the new attempt.
    pub rewired: BulkOutcome,
}

/// Attempt bookkeeping: superseding a finished attempt with a new one.
#[derive(Clone)]
pub struct RetryManager {
    store: NodeExecutionStore,
}

impl RetryManager {
    pub fn new(store: NodeExecutionStore) -> Self {
        Self { store }
    }

    /// Flag `id` as superseded. Unchanged if it already was.
    pub async fn mark_retried(&self, id: &str) -> Result<UpdateOutcome> {
        self.store
            .update(id, |n| {
                if n.old_retry {
                    return false;
                }
                n.old_retry = true;
                true
            })
            .await
    }

    /// Point every live record whose `previous_id` is `old_id` at `new_id`.
    pub async fn update_relationships_for_retry(
        &self,
        old_id: &str,
        new_id: &str,
    ) -> Result<BulkOutcome> {
        let old = self.store.get(old_id).await?;
        let filter = NodeFilter::plan(old.plan_execution_id).previous(old_id);
        self.store
            .update_many(&filter, |n| {
                if n.previous_id.as_deref() != Some(old_id) {
                    return false;
                }
                n.previous_id = Some(new_id.to_string());
                true
            })
            .await
    }

    /// Replace the finished attempt `old_id` with `attempt`.
    ///
    /// The attempt must belong to the same plan execution and plan node.
    /// Parent and predecessor links are inherited when the attempt leaves
    /// them unset. Everything live below the old attempt (the children of a
    /// retried fork or stage) is superseded along with it. If saving the
    /// attempt fails the old subtree is restored as the live one.
    pub async fn retry_node(&self, old_id: &str, mut attempt: NodeExecution) -> Result<RetryOutcome> {
        let old = self.store.get(old_id).await?;
        check_attempt(&old, &attempt)?;

        let live = self
            .store
            .find(&NodeFilter::plan(old.plan_execution_id.clone()))
            .await?;
        let below: Vec<String> = ExecutionTree::build(live)
            .descendants(old_id, &[], false)
            .map(|nodes| nodes.into_iter().map(|n| n.id.clone()).collect())
            .unwrap_or_default();

        let superseded = match self.mark_retried(old_id).await? {
            UpdateOutcome::Updated(change) => change,
            // Lost a race with another retry of the same attempt
            UpdateOutcome::Unchanged(_) => {
                return Err(TrellisError::Conflict(format!(
                    "Node execution {} was already retried",
                    old_id
                )));
            }
        };
        let superseded_descendants = self.set_retried(&old.plan_execution_id, &below, true).await?;

        if attempt.parent_id.is_none() {
            attempt.parent_id = old.parent_id.clone();
        }
        if attempt.previous_id.is_none() {
            attempt.previous_id = old.previous_id.clone();
        }
        attempt.retry_ids = old.retry_ids.clone();
        attempt.retry_ids.push(old.id.clone());

        let attempt = match self.store.save(attempt).await {
            Ok(saved) => saved,
            Err(e) => {
                warn!(node_id = %old_id, error = %e, "Saving retry attempt failed, restoring previous attempt");
                self.set_retried(&old.plan_execution_id, &below, false).await?;
                self.unmark_retried(old_id).await?;
                return Err(e);
            }
        };

        let rewired = self.update_relationships_for_retry(old_id, &attempt.id).await?;
        info!(
            node_id = %attempt.id,
            previous_attempt = %old_id,
            attempts = attempt.retry_ids.len() + 1,
            superseded_descendants = superseded_descendants.count(),
            rewired = rewired.count(),
            "Node execution retried"
        );

        Ok(RetryOutcome {
            attempt,
            superseded,
            superseded_descendants,
            rewired,
        })
    }

    async fn set_retried(&self, plan_execution_id: &str, ids: &[String], flag: bool) -> Result<BulkOutcome> {
        if ids.is_empty() {
            return Ok(BulkOutcome::default());
        }
        let filter = NodeFilter::plan(plan_execution_id)
            .ids(ids.iter().cloned())
            .with_old_retries();
        self.store
            .update_many(&filter, |n| {
                if n.old_retry == flag {
                    return false;
                }
                n.old_retry = flag;
                true
            })
            .await
    }

    async fn unmark_retried(&self, id: &str) -> Result<UpdateOutcome> {
        self.store
            .update(id, |n| {
                if !n.old_retry {
                    return false;
                }
                n.old_retry = false;
                true
            })
            .await
    }
}

fn check_attempt(old: &NodeExecution, attempt: &NodeExecution) -> Result<()> {
    if attempt.plan_execution_id != old.plan_execution_id {
        return Err(TrellisError::IllegalTransition(format!(
            "Retry attempt {} belongs to plan execution {}, not {}",
            attempt.id, attempt.plan_execution_id, old.plan_execution_id
        )));
    }
    if attempt.plan_node.id != old.plan_node.id {
        return Err(TrellisError::IllegalTransition(format!(
            "Retry attempt {} is for plan node {}, not {}",
            attempt.id, attempt.plan_node.id, old.plan_node.id
        )));
    }
    if old.old_retry {
        return Err(TrellisError::Conflict(format!(
            "Node execution {} was already retried",
            old.id
        )));
    }
    if !old.status.is_terminal() {
        return Err(TrellisError::IllegalTransition(format!(
            "Node execution {} is {} and cannot be retried",
            old.id, old.status
        )));
    }
    Ok(())
}

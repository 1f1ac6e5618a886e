use chrono::Utc;
use tracing::{info, warn};

use trellis_core::error::{Result, TrellisError};
use trellis_core::filter::NodeFilter;
use trellis_core::status::Status;
use trellis_core::types::NodeExecution;
use trellis_store::{BulkOutcome, NodeExecutionStore, UpdateOutcome};

use crate::navigator::TreeNavigator;

/// Single-node and bulk status changes.
///
/// Transitions are check-then-set inside the store's compare-and-swap
/// loop: a node that is no longer in an expected source status is left
/// alone and the call succeeds as a no-op.
#[derive(Clone)]
pub struct StatusEngine {
    store: NodeExecutionStore,
    navigator: TreeNavigator,
}

impl StatusEngine {
    pub fn new(store: NodeExecutionStore, navigator: TreeNavigator) -> Self {
        Self { store, navigator }
    }

    /// Move `id` to `to` if its current status is in `from` (empty `from`
    /// means every legal source of `to`).
    pub async fn transition(&self, id: &str, from: &[Status], to: Status) -> Result<UpdateOutcome> {
        self.transition_with(id, from, to, |_| {}).await
    }

    /// Like [`StatusEngine::transition`], applying `extra` in the same write.
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
        let allowed = allowed_sources(from, to)?;

        let outcome = self
            .store
            .update(id, |n| {
                if !allowed.contains(&n.status) || !n.status.can_transition_to(to) {
                    return false;
                }
                apply_status(n, to);
                extra(n);
                true
            })
            .await?;

        if let UpdateOutcome::Unchanged(ref current) = outcome {
            warn!(
                node_id = %id,
                current = %current.status,
                target = %to,
                "Cannot update execution status, node is not in an allowed source status"
            );
        }
        Ok(outcome)
    }

    /// Force every QUEUED or RUNNING node of the plan execution to ERRORED.
    pub async fn error_out_active_nodes(&self, plan_execution_id: &str) -> Result<BulkOutcome> {
        let filter = NodeFilter::plan(plan_execution_id)
            .statuses(Status::ACTIVE)
            .with_old_retries();
        let outcome = self
            .store
            .update_many(&filter, |n| {
                if !Status::ACTIVE.contains(&n.status) {
                    return false;
                }
                apply_status(n, Status::Errored);
                true
            })
            .await?;

        if outcome.count() == 0 {
            warn!(%plan_execution_id, "No node executions could be marked as ERRORED");
        } else {
            info!(%plan_execution_id, changed = outcome.count(), "Active node executions errored out");
        }
        Ok(outcome)
    }

    /// Discontinue exactly `node_ids` (those still QUEUED or RUNNING).
    pub async fn mark_leaves_discontinuing(
        &self,
        plan_execution_id: &str,
        node_ids: &[String],
    ) -> Result<BulkOutcome> {
        if node_ids.is_empty() {
            return Ok(BulkOutcome::default());
        }
        let filter = NodeFilter::plan(plan_execution_id)
            .ids(node_ids.iter().cloned())
            .with_old_retries();
        let outcome = self.discontinue(&filter, &Status::NON_TERMINAL).await?;

        info!(
            %plan_execution_id,
            requested = node_ids.len(),
            changed = outcome.count(),
            "Leaves marked DISCONTINUING"
        );
        Ok(outcome)
    }

    /// Find the current active leaves in `eligible` and discontinue them in one batch.
    pub async fn mark_all_leaves_discontinuing(
        &self,
        plan_execution_id: &str,
        eligible: &[Status],
    ) -> Result<BulkOutcome> {
        let leaves = self
            .navigator
            .find_active_leaves(plan_execution_id, eligible)
            .await?;
        if leaves.is_empty() {
            info!(%plan_execution_id, "No active leaves to discontinue");
            return Ok(BulkOutcome::default());
        }

        let filter = NodeFilter::plan(plan_execution_id).ids(leaves.into_iter().map(|n| n.id));
        let eligible: &[Status] = if eligible.is_empty() {
            &Status::NON_TERMINAL
        } else {
            eligible
        };
        let outcome = self.discontinue(&filter, eligible).await?;

        info!(%plan_execution_id, changed = outcome.count(), "All active leaves marked DISCONTINUING");
        Ok(outcome)
    }

    async fn discontinue(&self, filter: &NodeFilter, eligible: &[Status]) -> Result<BulkOutcome> {
        self.store
            .update_many(filter, |n| {
                if !eligible.contains(&n.status) || !n.status.can_transition_to(Status::Discontinuing) {
                    return false;
                }
                apply_status(n, Status::Discontinuing);
                true
            })
            .await
    }
}

/// Resolve the source set for a transition request. Terminal members are
/// dropped; a request left with no possible source is rejected.
fn allowed_sources(from: &[Status], to: Status) -> Result<Vec<Status>> {
    if to == Status::Queued {
        return Err(TrellisError::IllegalTransition(
            "QUEUED is only assigned at creation".into(),
        ));
    }
    if from.is_empty() {
        return Ok(to.legal_predecessors().to_vec());
    }

    let live: Vec<Status> = from.iter().copied().filter(|s| !s.is_terminal()).collect();
    if live.is_empty() {
        return Err(TrellisError::IllegalTransition(format!(
            "no non-terminal source status in {:?} for {}",
            from, to
        )));
    }
    Ok(live)
}

fn apply_status(node: &mut NodeExecution, to: Status) {
    let now = Utc::now();
    node.status = to;
    if to == Status::Running && node.start_ts.is_none() {
        node.start_ts = Some(now);
    }
    if to.is_terminal() {
        node.end_ts = Some(now);
    }
}

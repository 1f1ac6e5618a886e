use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use trellis_core::config::ConcurrencyConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::filter::NodeFilter;
use trellis_core::traits::NodeStore;
use trellis_core::types::NodeExecution;

use crate::memory::MemoryStore;

/// A record before and after one successful write.
#[derive(Debug, Clone)]
pub struct Change {
    pub previous: NodeExecution,
    pub current: NodeExecution,
}

impl Change {
    pub fn status_changed(&self) -> bool {
        self.previous.status != self.current.status
    }
}

/// Result of a single-record update.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Updated(Change),
    /// The mutator declined; nothing was written.
    Unchanged(NodeExecution),
}

impl UpdateOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }

    /// The record as it is now stored.
    pub fn node(&self) -> &NodeExecution {
        match self {
            UpdateOutcome::Updated(change) => &change.current,
            UpdateOutcome::Unchanged(node) => node,
        }
    }

    pub fn into_node(self) -> NodeExecution {
        match self {
            UpdateOutcome::Updated(change) => change.current,
            UpdateOutcome::Unchanged(node) => node,
        }
    }
}

/// Result of an `update_many` batch. Only records actually written appear.
#[derive(Debug, Clone, Default)]
pub struct BulkOutcome {
    pub changes: Vec<Change>,
}

impl BulkOutcome {
    pub fn count(&self) -> usize {
        self.changes.len()
    }
}

/// Versioned access to node executions.
///
/// Every mutation goes through [`NodeExecutionStore::update`], a
/// read-mutate-compare-and-swap loop with a bounded retry budget.
#[derive(Clone)]
pub struct NodeExecutionStore {
    backend: Arc<dyn NodeStore>,
    config: ConcurrencyConfig,
}

impl NodeExecutionStore {
    pub fn new(backend: Arc<dyn NodeStore>, config: ConcurrencyConfig) -> Self {
        Self { backend, config }
    }

    /// Versioned store over a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), ConcurrencyConfig::default())
    }

    pub fn backend(&self) -> &Arc<dyn NodeStore> {
        &self.backend
    }

    /// Insert a new node execution at version 1, otherwise exactly as given.
    ///
    /// The parent, when set, must already exist in the same plan execution.
    pub async fn save(&self, mut node: NodeExecution) -> Result<NodeExecution> {
        if let Some(ref parent_id) = node.parent_id {
            let parent = self.backend.fetch(parent_id).await?;
            match parent {
                Some(p) if p.plan_execution_id == node.plan_execution_id => {}
                _ => {
                    return Err(TrellisError::IllegalTransition(format!(
                        "Parent {} of node execution {} does not exist in plan execution {}",
                        parent_id, node.id, node.plan_execution_id
                    )));
                }
            }
        }

        node.version = 1;
        let saved = self.backend.insert(node).await?;
        debug!(node_id = %saved.id, plan_execution_id = %saved.plan_execution_id, "Node execution saved");
        Ok(saved)
    }

    pub async fn get(&self, id: &str) -> Result<NodeExecution> {
        self.backend
            .fetch(id)
            .await?
            .ok_or_else(|| TrellisError::NotFound(id.to_string()))
    }

    pub async fn find(&self, filter: &NodeFilter) -> Result<Vec<NodeExecution>> {
        self.backend.find(filter).await
    }

    /// Apply `mutator` to the record under optimistic concurrency.
    ///
    /// The mutator returns `false` to decline (no write). A candidate whose
    /// status move is not a legal lifecycle edge is declined the same way,
    /// so a terminal record never changes status. On a version conflict the
    /// record is re-read and the mutator re-applied, up to `max_cas_retries`
    /// more times.
    pub async fn update<F>(&self, id: &str, mutator: F) -> Result<UpdateOutcome>
    where
        F: Fn(&mut NodeExecution) -> bool + Send + Sync,
    {
        let max_retries = self.config.max_cas_retries;

        for attempt in 0..=max_retries {
            let current = self.get(id).await?;
            let mut candidate = current.clone();
            if !mutator(&mut candidate) {
                return Ok(UpdateOutcome::Unchanged(current));
            }
            restore_immutable(&mut candidate, &current);
            if !status_move_allowed(&current, &candidate) {
                debug!(
                    node_id = %id,
                    current = %current.status,
                    requested = %candidate.status,
                    "Update declined, status move is not a lifecycle edge"
                );
                return Ok(UpdateOutcome::Unchanged(current));
            }
            candidate.last_updated_at = Utc::now();

            match self.backend.compare_and_swap(candidate).await? {
                Some(stored) => {
                    return Ok(UpdateOutcome::Updated(Change {
                        previous: current,
                        current: stored,
                    }))
                }
                None if attempt < max_retries => {
                    let backoff = calculate_backoff(attempt, &self.config);
                    debug!(
                        node_id = %id,
                        attempt = attempt + 1,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Version conflict, retrying update"
                    );
                    tokio::time::sleep(backoff).await;
                }
                None => {}
            }
        }

        warn!(node_id = %id, attempts = max_retries + 1, "Update retry budget exhausted");
        Err(TrellisError::ConcurrentModification {
            id: id.to_string(),
            attempts: max_retries + 1,
        })
    }

    /// Apply `mutator` to every record matching `filter`.
    ///
    /// Records already terminal or otherwise ineligible (the mutator
    /// declines, or the status move is illegal) are skipped, as are records
    /// that vanish mid-batch.
    pub async fn update_many<F>(&self, filter: &NodeFilter, mutator: F) -> Result<BulkOutcome>
    where
        F: Fn(&mut NodeExecution) -> bool + Send + Sync,
    {
        let matched = self.backend.find(filter).await?;
        let mut outcome = BulkOutcome::default();

        for node in matched {
            match self.update(&node.id, &mutator).await {
                Ok(UpdateOutcome::Updated(change)) => outcome.changes.push(change),
                Ok(UpdateOutcome::Unchanged(_)) => {}
                Err(e) if e.is_not_found() => {
                    debug!(node_id = %node.id, "Node execution vanished during batch update");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(outcome)
    }
}

/// Fields no mutator may change.
fn restore_immutable(candidate: &mut NodeExecution, current: &NodeExecution) {
    candidate.id = current.id.clone();
    candidate.plan_execution_id = current.plan_execution_id.clone();
    candidate.plan_node = current.plan_node.clone();
    candidate.parent_id = current.parent_id.clone();
    candidate.created_at = current.created_at;
    candidate.version = current.version;
}

/// Unchanged status, or a legal edge out of the current one.
fn status_move_allowed(current: &NodeExecution, candidate: &NodeExecution) -> bool {
    candidate.status == current.status || current.status.can_transition_to(candidate.status)
}

fn calculate_backoff(attempt: u32, config: &ConcurrencyConfig) -> Duration {
    let ms = (config.initial_backoff_ms.saturating_mul(2u64.saturating_pow(attempt)))
        .min(config.max_backoff_ms);
    // Add jitter: 0.5x to 1.5x so racing writers spread out
    let jitter = 0.5 + rand::random::<f64>();
    Duration::from_millis((ms as f64 * jitter) as u64)
}

use tracing::debug;

use trellis_core::error::Result;
use trellis_store::{NodeExecutionStore, UpdateOutcome};

/// Bookkeeping for the timeout registrations attached to a node execution.
///
/// Independent of status: a terminal node may still carry registrations
/// until the scheduler clears them.
#[derive(Clone)]
pub struct TimeoutTracker {
    store: NodeExecutionStore,
}

impl TimeoutTracker {
    pub fn new(store: NodeExecutionStore) -> Self {
        Self { store }
    }

    /// Append `timeout_instance_id`; already-attached ids are ignored.
    pub async fn attach_timeout_instance(
        &self,
        id: &str,
        timeout_instance_id: &str,
    ) -> Result<UpdateOutcome> {
        let outcome = self
            .store
            .update(id, |n| {
                if n.timeout_instance_ids.iter().any(|t| t == timeout_instance_id) {
                    return false;
                }
                n.timeout_instance_ids.push(timeout_instance_id.to_string());
                true
            })
            .await?;
        debug!(node_id = %id, %timeout_instance_id, attached = outcome.is_updated(), "Timeout instance attached");
        Ok(outcome)
    }

    /// Drop every registration. Clearing an empty list succeeds.
    pub async fn remove_timeout_instances(&self, id: &str) -> Result<UpdateOutcome> {
        self.store
            .update(id, |n| {
                if n.timeout_instance_ids.is_empty() {
                    return false;
                }
                n.timeout_instance_ids.clear();
                true
            })
            .await
    }

    pub async fn timeout_instances(&self, id: &str) -> Result<Vec<String>> {
        Ok(self.store.get(id).await?.timeout_instance_ids)
    }
}

use futures::future::BoxFuture;

use crate::error::Result;
use crate::filter::NodeFilter;
use crate::types::NodeExecution;

/// Node-execution backend: the persistence primitives.
///
/// Higher-level mutation (read-mutate-write with retries) is built on
/// `compare_and_swap` and never needs a lock held across calls.
pub trait NodeStore: Send + Sync + 'static {
    /// Insert a new record as given (version included).
    ///
    /// Fails with `Conflict` on a duplicate id, or when another live attempt
    /// already exists for the same `(plan_execution_id, plan_node.id)`.
    fn insert(&self, node: NodeExecution) -> BoxFuture<'_, Result<NodeExecution>>;

    /// Load a record by id.
    fn fetch(&self, id: &str) -> BoxFuture<'_, Result<Option<NodeExecution>>>;

    /// Load every record matching a filter.
    fn find(&self, filter: &NodeFilter) -> BoxFuture<'_, Result<Vec<NodeExecution>>>;

    /// Replace the stored record iff its version equals `candidate.version`.
    ///
    /// On success the stored version becomes `candidate.version + 1` and the
    /// stored record is returned. A version mismatch returns `None`; a
    /// missing record is `NotFound`.
    fn compare_and_swap(
        &self,
        candidate: NodeExecution,
    ) -> BoxFuture<'_, Result<Option<NodeExecution>>>;
}

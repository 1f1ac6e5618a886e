//! Fixtures shared by the Trellis test suites.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use trellis_core::error::Result;
use trellis_core::filter::NodeFilter;
use trellis_core::status::Status;
use trellis_core::traits::NodeStore;
use trellis_core::types::{ExecutionMode, NodeExecution, PlanNodeRef, StepCategory};

pub const PLAN_EXECUTION_ID: &str = "plan-execution-test";

/// A plan node with a fresh id.
pub fn plan_node(identifier: &str, category: StepCategory) -> PlanNodeRef {
    let type_name = match category {
        StepCategory::Step => "SHELL",
        StepCategory::StepGroup => "STEP_GROUP",
        StepCategory::Fork => "FORK",
        StepCategory::Strategy => "MATRIX",
        StepCategory::Stage => "DEPLOYMENT_STAGE",
        StepCategory::Pipeline => "PIPELINE",
    };
    PlanNodeRef::new(identifier, type_name, category)
}

/// An unsaved root-level step execution.
pub fn execution(plan_execution_id: &str, identifier: &str, status: Status) -> NodeExecution {
    NodeExecution::new(plan_execution_id, plan_node(identifier, StepCategory::Step)).with_status(status)
}

/// An unsaved grouping execution of the given category.
pub fn group(plan_execution_id: &str, identifier: &str, category: StepCategory, status: Status) -> NodeExecution {
    NodeExecution::new(plan_execution_id, plan_node(identifier, category))
        .with_status(status)
        .with_mode(ExecutionMode::Children)
}

/// An unsaved step execution under `parent`.
pub fn child_of(parent: &NodeExecution, identifier: &str, status: Status) -> NodeExecution {
    execution(&parent.plan_execution_id, identifier, status).with_parent(parent.id.clone())
}

/// An unsaved retry attempt of `previous` (same plan node, same parent).
pub fn retry_of(previous: &NodeExecution) -> NodeExecution {
    let mut attempt = NodeExecution::new(previous.plan_execution_id.clone(), previous.plan_node.clone())
        .with_mode(previous.mode);
    attempt.parent_id = previous.parent_id.clone();
    attempt.previous_id = previous.previous_id.clone();
    attempt
}

/// Store wrapper that reports a version conflict for the first `conflicts`
/// compare-and-swap calls, then delegates.
pub struct ContendedStore {
    inner: Arc<dyn NodeStore>,
    remaining: AtomicU32,
    calls: AtomicU32,
}

impl ContendedStore {
    pub fn new(inner: Arc<dyn NodeStore>, conflicts: u32) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(conflicts),
            calls: AtomicU32::new(0),
        }
    }

    pub fn cas_calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NodeStore for ContendedStore {
    fn insert(&self, node: NodeExecution) -> BoxFuture<'_, Result<NodeExecution>> {
        self.inner.insert(node)
    }

    fn fetch(&self, id: &str) -> BoxFuture<'_, Result<Option<NodeExecution>>> {
        self.inner.fetch(id)
    }

    fn find(&self, filter: &NodeFilter) -> BoxFuture<'_, Result<Vec<NodeExecution>>> {
        self.inner.find(filter)
    }

    fn compare_and_swap(
        &self,
        candidate: NodeExecution,
    ) -> BoxFuture<'_, Result<Option<NodeExecution>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let conflicted = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicted {
            return Box::pin(async { Ok(None) });
        }
        self.inner.compare_and_swap(candidate)
    }
}

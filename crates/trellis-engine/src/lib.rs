//! Execution graph engine.
//!
//! Tracks node executions of a running plan as a versioned tree. The
//! `NodeExecutionService` is the entry point for plan executors, step
//! runtimes, timeout schedulers, and abort/recovery callers; it delegates to
//! the `TreeNavigator` for structural queries, the `StatusEngine` for
//! lifecycle changes, the `TimeoutTracker` for timeout registrations, and the
//! `RetryManager` for attempt bookkeeping, and publishes a `NodeEvent` for
//! every successful write.
//!
//! Completion of grouping nodes is never pushed upward: callers ask
//! `TreeNavigator::is_subtree_complete` and advance the parent themselves.

pub mod navigator;
pub mod retry;
pub mod service;
pub mod timeout;
pub mod transition;
pub mod tree;

pub use navigator::TreeNavigator;
pub use retry::{RetryManager, RetryOutcome};
pub use service::NodeExecutionService;
pub use timeout::TimeoutTracker;
pub use transition::StatusEngine;
pub use tree::ExecutionTree;

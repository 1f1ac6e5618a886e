use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::Status;

/// Category of a plan node. Everything but `Step` groups other nodes.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepCategory {
    Step,
    StepGroup,
    Fork,
    Strategy,
    Stage,
    Pipeline,
}

impl StepCategory {
    pub fn is_grouping(self) -> bool {
        !matches!(self, StepCategory::Step)
    }
}

/// How the step runtime is invoked for a node.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
    Task,
    Child,
    Children,
    ChildChain,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct StepType {
    /// Dispatch tag for the step runtime (e.g. "HTTP", "SHELL", "FORK").
    pub type_name: String,
    pub category: StepCategory,
}

/// Immutable description of the plan node a [`NodeExecution`] instantiates.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlanNodeRef {
    /// Generated id of the plan node.
    pub id: String,
    /// Stable name of the node within the plan.
    pub identifier: String,
    pub name: String,
    pub step_type: StepType,
}

impl PlanNodeRef {
    pub fn new(
        identifier: impl Into<String>,
        type_name: impl Into<String>,
        category: StepCategory,
    ) -> Self {
        let identifier = identifier.into();
        Self {
            id: Uuid::new_v4().to_string(),
            name: identifier.clone(),
            identifier,
            step_type: StepType {
                type_name: type_name.into(),
                category,
            },
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn category(&self) -> StepCategory {
        self.step_type.category
    }
}

/// One attempt to execute one plan node within one plan execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: String,
    pub plan_execution_id: String,
    pub plan_node: PlanNodeRef,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Sequential predecessor sibling, if any.
    #[serde(default)]
    pub previous_id: Option<String>,
    pub status: Status,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout_instance_ids: Vec<String>,
    /// Superseded by a newer attempt of the same plan node.
    #[serde(default)]
    pub old_retry: bool,
    /// Attempts this record superseded, oldest first.
    #[serde(default)]
    pub retry_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Optimistic-concurrency token. 0 until saved.
    #[serde(default)]
    pub version: u64,
}

impl NodeExecution {
    /// A fresh, unsaved `QUEUED` attempt.
    pub fn new(plan_execution_id: impl Into<String>, plan_node: PlanNodeRef) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            plan_execution_id: plan_execution_id.into(),
            plan_node,
            parent_id: None,
            previous_id: None,
            status: Status::Queued,
            mode: ExecutionMode::Sync,
            start_ts: None,
            end_ts: None,
            timeout_instance_ids: vec![],
            old_retry: false,
            retry_ids: vec![],
            created_at: now,
            last_updated_at: now,
            version: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_previous(mut self, previous_id: impl Into<String>) -> Self {
        self.previous_id = Some(previous_id.into());
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        if status != Status::Queued && self.start_ts.is_none() {
            self.start_ts = Some(self.created_at);
        }
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn identifier(&self) -> &str {
        &self.plan_node.identifier
    }

    pub fn category(&self) -> StepCategory {
        self.plan_node.category()
    }
}

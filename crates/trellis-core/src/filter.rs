use crate::status::Status;
use crate::types::{NodeExecution, StepCategory};

/// Selection criteria for node-execution queries.
///
/// Every populated field must match. Old retries are excluded unless
/// `include_old_retries` is set.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub plan_execution_id: Option<String>,
    pub ids: Option<Vec<String>>,
    pub parent_id: Option<String>,
    pub previous_id: Option<String>,
    pub plan_node_id: Option<String>,
    pub identifier: Option<String>,
    pub statuses: Option<Vec<Status>>,
    pub category: Option<StepCategory>,
    pub include_old_retries: bool,
}

impl NodeFilter {
    /// Live records of one plan execution.
    pub fn plan(plan_execution_id: impl Into<String>) -> Self {
        Self {
            plan_execution_id: Some(plan_execution_id.into()),
            ..Self::default()
        }
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn previous(mut self, previous_id: impl Into<String>) -> Self {
        self.previous_id = Some(previous_id.into());
        self
    }

    pub fn plan_node(mut self, plan_node_id: impl Into<String>) -> Self {
        self.plan_node_id = Some(plan_node_id.into());
        self
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// An empty status list matches any status.
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = Status>) -> Self {
        let statuses: Vec<Status> = statuses.into_iter().collect();
        self.statuses = if statuses.is_empty() { None } else { Some(statuses) };
        self
    }

    pub fn category(mut self, category: StepCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_old_retries(mut self) -> Self {
        self.include_old_retries = true;
        self
    }

    pub fn matches(&self, node: &NodeExecution) -> bool {
        if !self.include_old_retries && node.old_retry {
            return false;
        }
        if let Some(ref pe) = self.plan_execution_id {
            if &node.plan_execution_id != pe {
                return false;
            }
        }
        if let Some(ref ids) = self.ids {
            if !ids.contains(&node.id) {
                return false;
            }
        }
        if let Some(ref parent) = self.parent_id {
            if node.parent_id.as_ref() != Some(parent) {
                return false;
            }
        }
        if let Some(ref previous) = self.previous_id {
            if node.previous_id.as_ref() != Some(previous) {
                return false;
            }
        }
        if let Some(ref plan_node_id) = self.plan_node_id {
            if &node.plan_node.id != plan_node_id {
                return false;
            }
        }
        if let Some(ref identifier) = self.identifier {
            if &node.plan_node.identifier != identifier {
                return false;
            }
        }
        if let Some(ref statuses) = self.statuses {
            if !statuses.contains(&node.status) {
                return false;
            }
        }
        if let Some(category) = self.category {
            if node.category() != category {
                return false;
            }
        }
        true
    }
}

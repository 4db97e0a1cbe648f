//! Progress report tree

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl ReportStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReportStatus::Success | ReportStatus::Failed)
    }

    /// Parent status for a set of child statuses.
    ///
    /// FAILED if any child failed, SUCCESS only if every child succeeded,
    /// IN_PROGRESS once anything has started, PENDING otherwise. A node with
    /// no children is SUCCESS.
    pub fn rollup<I>(children: I) -> ReportStatus
    where
        I: IntoIterator<Item = ReportStatus>,
    {
        let mut all_success = true;
        let mut any_started = false;
        for status in children {
            match status {
                ReportStatus::Failed => return ReportStatus::Failed,
                ReportStatus::Success => any_started = true,
                ReportStatus::InProgress => {
                    any_started = true;
                    all_success = false;
                }
                ReportStatus::Pending => all_success = false,
            }
        }
        if all_success {
            ReportStatus::Success
        } else if any_started {
            ReportStatus::InProgress
        } else {
            ReportStatus::Pending
        }
    }
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportStatus::Pending => write!(f, "PENDING"),
            ReportStatus::InProgress => write!(f, "IN_PROGRESS"),
            ReportStatus::Success => write!(f, "SUCCESS"),
            ReportStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Reference to a resource a report node touched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportResource {
    pub kind: String,
    pub name: String,
    pub remote_id: Option<String>,
}

/// One node of the report tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportNode {
    pub status: ReportStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub steps: BTreeMap<String, ReportNode>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ReportResource>,
}

impl ReportNode {
    pub fn leaf(status: ReportStatus) -> Self {
        Self {
            status,
            message: None,
            steps: BTreeMap::new(),
            resources: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Parent node whose status is rolled up from `steps`
    pub fn parent(steps: BTreeMap<String, ReportNode>) -> Self {
        let status = ReportStatus::rollup(steps.values().map(|s| s.status));
        Self {
            status,
            message: None,
            steps,
            resources: Vec::new(),
        }
    }

    /// Fold a newer observation into this node.
    ///
    /// Steps are merged additively. A node that already reached a terminal
    /// status keeps it; parents are re-rolled from their merged children.
    pub fn merge(&mut self, newer: ReportNode) {
        let was_terminal = self.status.is_terminal();
        let has_steps = !self.steps.is_empty() || !newer.steps.is_empty();

        for (name, step) in newer.steps {
            match self.steps.get_mut(&name) {
                Some(existing) => existing.merge(step),
                None => {
                    self.steps.insert(name, step);
                }
            }
        }
        for resource in newer.resources {
            if !self.resources.contains(&resource) {
                self.resources.push(resource);
            }
        }

        if has_steps {
            let rolled = ReportStatus::rollup(self.steps.values().map(|s| s.status));
            if !was_terminal {
                self.status = rolled;
            }
        } else if !was_terminal {
            self.status = newer.status;
        }
        if !was_terminal || self.message.is_none() {
            if let Some(message) = newer.message {
                self.message = Some(message);
            }
        }
    }
}

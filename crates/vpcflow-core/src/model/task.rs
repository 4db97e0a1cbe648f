//! Task and workflow records

use super::report::{ReportNode, ReportStatus};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vpcflow_cloud::{ResourceKind, Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    InProgress,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        self == next
            || matches!(
                (self, next),
                (Created, InProgress)
                    | (Created, Failed)
                    | (InProgress, Success)
                    | (InProgress, Failed)
            )
    }

    pub fn as_report(self) -> ReportStatus {
        match self {
            TaskStatus::Created => ReportStatus::Pending,
            TaskStatus::InProgress => ReportStatus::InProgress,
            TaskStatus::Success => ReportStatus::Success,
            TaskStatus::Failed => ReportStatus::Failed,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Created => write!(f, "CREATED"),
            TaskStatus::InProgress => write!(f, "IN_PROGRESS"),
            TaskStatus::Success => write!(f, "SUCCESS"),
            TaskStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskAction {
    Add,
    Update,
    Delete,
    Sync,
}

impl std::fmt::Display for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskAction::Add => write!(f, "ADD"),
            TaskAction::Update => write!(f, "UPDATE"),
            TaskAction::Delete => write!(f, "DELETE"),
            TaskAction::Sync => write!(f, "SYNC"),
        }
    }
}

/// Which half of a workflow a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Validation,
    Provisioning,
}

/// Durable record of one resource's task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub phase: TaskPhase,
    /// Name of the stage the task runs in
    pub stage: String,
    pub kind: ResourceKind,
    pub name: String,
    pub action: TaskAction,
    pub status: TaskStatus,
    pub resource_id: Option<Uuid>,
    pub report: ReportNode,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflow_id: Uuid,
        phase: TaskPhase,
        stage: impl Into<String>,
        kind: ResourceKind,
        name: impl Into<String>,
        action: TaskAction,
        resource_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            phase,
            stage: stage.into(),
            kind,
            name: name.into(),
            action,
            status: TaskStatus::Created,
            resource_id,
            report: ReportNode::leaf(ReportStatus::Pending),
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move the task forward. Re-applying the current status is a no-op.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                record: format!("task {}", self.id),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        if self.status != next {
            self.status = next;
            self.report.status = next.as_report();
            self.updated_at = Utc::now();
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(TaskStatus::InProgress)
    }

    pub fn succeed(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Success)?;
        self.set_message(message);
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.set_message(message);
        Ok(())
    }

    fn set_message(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.report.message = Some(message.clone());
        self.message = Some(message);
    }
}

/// Overall record of one compiled request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub scope: Scope,
    pub status: TaskStatus,
    /// Stage names in execution order
    pub stages: Vec<String>,
    /// Number of barrier-joined stages that have finished
    pub stages_finished: usize,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    pub fn new(scope: Scope, stages: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            scope,
            status: TaskStatus::Created,
            stages,
            stages_finished: 0,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                record: format!("workflow {}", self.id),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

//! Storage façade for engine records.
//!
//! Implementations must make the following operations atomic:
//! - `insert_resources` inserts the whole batch or nothing, and rejects any
//!   record whose (kind, scope, name) collides with a live record.
//! - `try_claim` checks phase, status and lease and takes the lease in one
//!   step. Check-then-set from the caller side is not allowed.
//! - `complete` writes a migration record back only while the caller still
//!   holds its lease, and releases the lease in the same step.

use crate::error::Result;
use crate::model::{
    ConversionRecord, MigrationStepRecord, Phase, ResourceRecord, TaskRecord, WorkflowRecord,
};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;
use vpcflow_cloud::{ResourceKind, Scope};

pub trait ResourceRepository: Send + Sync {
    /// Live record with this name in the scope (see [`ResourceRecord::is_live`])
    fn find_by(&self, kind: ResourceKind, scope: &Scope, name: &str)
    -> Result<Option<ResourceRecord>>;

    fn get_resource(&self, id: Uuid) -> Result<ResourceRecord>;

    fn insert_resource(&self, record: ResourceRecord) -> Result<()> {
        self.insert_resources(vec![record])
    }

    /// All-or-nothing insert with uniqueness check
    fn insert_resources(&self, records: Vec<ResourceRecord>) -> Result<()>;

    fn update_resource(&self, record: &ResourceRecord) -> Result<()>;
}

pub trait TaskRepository: Send + Sync {
    fn insert_workflow(&self, workflow: &WorkflowRecord) -> Result<()>;

    fn get_workflow(&self, id: Uuid) -> Result<WorkflowRecord>;

    fn update_workflow(&self, workflow: &WorkflowRecord) -> Result<()>;

    /// Persist the "stage finished" marker
    fn checkpoint(&self, workflow_id: Uuid, stages_finished: usize) -> Result<()>;

    fn insert_tasks(&self, tasks: &[TaskRecord]) -> Result<()>;

    fn get_task(&self, id: Uuid) -> Result<TaskRecord>;

    /// Rejects moving a terminal task to a different status
    fn update_task(&self, task: &TaskRecord) -> Result<()>;

    /// Tasks of a workflow in creation order
    fn tasks_for_workflow(&self, workflow_id: Uuid) -> Result<Vec<TaskRecord>>;
}

pub trait MigrationRepository: Send + Sync {
    fn insert_step(&self, step: &MigrationStepRecord) -> Result<()>;

    fn get_step(&self, id: Uuid) -> Result<MigrationStepRecord>;

    fn step_for_task(&self, task_id: Uuid) -> Result<Option<MigrationStepRecord>>;

    /// Take ownership of `id` for `phase` if the record is in that phase and
    /// nobody holds a live lease. Returns the claimed record.
    fn try_claim(
        &self,
        id: Uuid,
        phase: Phase,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<MigrationStepRecord>>;

    /// Write the record and release the lease. Returns false, without
    /// writing, when `owner` no longer holds the lease.
    fn complete(&self, step: &MigrationStepRecord, owner: &str) -> Result<bool>;

    /// In-progress records nobody holds a live lease on
    fn claimable_steps(&self, now: DateTime<Utc>) -> Result<Vec<MigrationStepRecord>>;

    fn insert_conversion(&self, record: &ConversionRecord) -> Result<()>;

    fn get_conversion(&self, id: Uuid) -> Result<ConversionRecord>;

    fn update_conversion(&self, record: &ConversionRecord) -> Result<()>;
}

//! In-memory repository implementation
//!
//! Every trait method runs under one mutex, which gives the atomicity the
//! repository contracts ask for. The whole store can be snapshotted into a
//! [`StoreSnapshot`] and written out by [`crate::state::StateFile`].

use crate::error::{CoreError, Result};
use crate::model::{
    ConversionRecord, Lease, MigrationStepRecord, Phase, ResourceRecord, TaskRecord,
    WorkflowRecord,
};
use crate::repository::{MigrationRepository, ResourceRepository, TaskRepository};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;
use vpcflow_cloud::{ResourceKind, Scope};

/// Serializable content of a [`MemoryStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub resources: HashMap<Uuid, ResourceRecord>,
    pub workflows: HashMap<Uuid, WorkflowRecord>,
    /// Kept in insertion order
    pub tasks: Vec<TaskRecord>,
    pub steps: HashMap<Uuid, MigrationStepRecord>,
    pub conversions: HashMap<Uuid, ConversionRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<StoreSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            data: Mutex::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.data().clone()
    }

    /// Ids of every workflow, oldest first
    pub fn workflow_ids(&self) -> Vec<Uuid> {
        let data = self.data();
        let mut workflows: Vec<_> = data.workflows.values().collect();
        workflows.sort_by_key(|w| w.created_at);
        workflows.iter().map(|w| w.id).collect()
    }

    /// Migration records owned by the given tasks
    pub fn steps_for_tasks(&self, task_ids: &[Uuid]) -> Vec<MigrationStepRecord> {
        self.data()
            .steps
            .values()
            .filter(|s| task_ids.contains(&s.task_id))
            .cloned()
            .collect()
    }

    fn data(&self) -> MutexGuard<'_, StoreSnapshot> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn same_identity(a: &ResourceRecord, kind: ResourceKind, scope: &Scope, name: &str) -> bool {
    a.is_live() && a.kind == kind && a.scope == *scope && a.name == name
}

impl ResourceRepository for MemoryStore {
    fn find_by(
        &self,
        kind: ResourceKind,
        scope: &Scope,
        name: &str,
    ) -> Result<Option<ResourceRecord>> {
        Ok(self
            .data()
            .resources
            .values()
            .find(|r| same_identity(r, kind, scope, name))
            .cloned())
    }

    fn get_resource(&self, id: Uuid) -> Result<ResourceRecord> {
        self.data()
            .resources
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("resource {id}")))
    }

    fn insert_resources(&self, records: Vec<ResourceRecord>) -> Result<()> {
        let mut data = self.data();
        for (i, record) in records.iter().enumerate() {
            let clashes_stored = data
                .resources
                .values()
                .any(|r| same_identity(r, record.kind, &record.scope, &record.name));
            let clashes_batch = records[..i]
                .iter()
                .any(|r| same_identity(r, record.kind, &record.scope, &record.name));
            if clashes_stored || clashes_batch {
                return Err(CoreError::Conflict {
                    kind: record.kind,
                    scope: record.scope.clone(),
                    name: record.name.clone(),
                });
            }
        }
        for record in records {
            data.resources.insert(record.id, record);
        }
        Ok(())
    }

    fn update_resource(&self, record: &ResourceRecord) -> Result<()> {
        let mut data = self.data();
        match data.resources.get_mut(&record.id) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("resource {}", record.id))),
        }
    }
}

impl TaskRepository for MemoryStore {
    fn insert_workflow(&self, workflow: &WorkflowRecord) -> Result<()> {
        self.data()
            .workflows
            .insert(workflow.id, workflow.clone());
        Ok(())
    }

    fn get_workflow(&self, id: Uuid) -> Result<WorkflowRecord> {
        self.data()
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("workflow {id}")))
    }

    fn update_workflow(&self, workflow: &WorkflowRecord) -> Result<()> {
        let mut data = self.data();
        match data.workflows.get_mut(&workflow.id) {
            Some(stored) => {
                *stored = workflow.clone();
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("workflow {}", workflow.id))),
        }
    }

    fn checkpoint(&self, workflow_id: Uuid, stages_finished: usize) -> Result<()> {
        let mut data = self.data();
        let workflow = data
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| CoreError::NotFound(format!("workflow {workflow_id}")))?;
        workflow.stages_finished = workflow.stages_finished.max(stages_finished);
        workflow.updated_at = Utc::now();
        Ok(())
    }

    fn insert_tasks(&self, tasks: &[TaskRecord]) -> Result<()> {
        self.data().tasks.extend(tasks.iter().cloned());
        Ok(())
    }

    fn get_task(&self, id: Uuid) -> Result<TaskRecord> {
        self.data()
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("task {id}")))
    }

    fn update_task(&self, task: &TaskRecord) -> Result<()> {
        let mut data = self.data();
        let stored = data
            .tasks
            .iter_mut()
            .find(|t| t.id == task.id)
            .ok_or_else(|| CoreError::NotFound(format!("task {}", task.id)))?;
        if !stored.status.can_transition_to(task.status) {
            return Err(CoreError::InvalidTransition {
                record: format!("task {}", task.id),
                from: stored.status.to_string(),
                to: task.status.to_string(),
            });
        }
        *stored = task.clone();
        Ok(())
    }

    fn tasks_for_workflow(&self, workflow_id: Uuid) -> Result<Vec<TaskRecord>> {
        Ok(self
            .data()
            .tasks
            .iter()
            .filter(|t| t.workflow_id == workflow_id)
            .cloned()
            .collect())
    }
}

impl MigrationRepository for MemoryStore {
    fn insert_step(&self, step: &MigrationStepRecord) -> Result<()> {
        self.data().steps.insert(step.id, step.clone());
        Ok(())
    }

    fn get_step(&self, id: Uuid) -> Result<MigrationStepRecord> {
        self.data()
            .steps
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("migration step {id}")))
    }

    fn step_for_task(&self, task_id: Uuid) -> Result<Option<MigrationStepRecord>> {
        Ok(self
            .data()
            .steps
            .values()
            .find(|s| s.task_id == task_id)
            .cloned())
    }

    fn try_claim(
        &self,
        id: Uuid,
        phase: Phase,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<MigrationStepRecord>> {
        let mut data = self.data();
        let step = data
            .steps
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("migration step {id}")))?;

        if step.phase() != phase || !step.is_claimable(now) {
            return Ok(None);
        }
        step.lease = Some(Lease::new(owner, now, ttl));
        Ok(Some(step.clone()))
    }

    fn complete(&self, step: &MigrationStepRecord, owner: &str) -> Result<bool> {
        let mut data = self.data();
        let stored = data
            .steps
            .get_mut(&step.id)
            .ok_or_else(|| CoreError::NotFound(format!("migration step {}", step.id)))?;

        if !stored.held_by(owner) {
            return Ok(false);
        }
        *stored = step.clone();
        stored.lease = None;
        Ok(true)
    }

    fn claimable_steps(&self, now: DateTime<Utc>) -> Result<Vec<MigrationStepRecord>> {
        let mut steps: Vec<_> = self
            .data()
            .steps
            .values()
            .filter(|s| s.is_claimable(now))
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.updated_at);
        Ok(steps)
    }

    fn insert_conversion(&self, record: &ConversionRecord) -> Result<()> {
        self.data().conversions.insert(record.id, record.clone());
        Ok(())
    }

    fn get_conversion(&self, id: Uuid) -> Result<ConversionRecord> {
        self.data()
            .conversions
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("conversion {id}")))
    }

    fn update_conversion(&self, record: &ConversionRecord) -> Result<()> {
        let mut data = self.data();
        match data.conversions.get_mut(&record.id) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("conversion {}", record.id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MigrationStatus, ResourceStatus, TaskAction, TaskPhase};
    use std::sync::Arc;

    fn scope() -> Scope {
        Scope::new("acct", "us-south")
    }

    fn network(name: &str) -> ResourceRecord {
        ResourceRecord::builder(ResourceKind::Network, scope(), name).build()
    }

    #[test]
    fn test_insert_rejects_live_duplicate() {
        let store = MemoryStore::new();
        store.insert_resource(network("vpc-a")).unwrap();

        let err = store.insert_resource(network("vpc-a")).unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));

        // other scope is fine
        let other =
            ResourceRecord::builder(ResourceKind::Network, Scope::new("acct", "eu-de"), "vpc-a")
                .build();
        store.insert_resource(other).unwrap();
    }

    #[test]
    fn test_deleted_record_frees_the_name() {
        let store = MemoryStore::new();
        let mut record = network("vpc-a");
        store.insert_resource(record.clone()).unwrap();

        for status in [
            ResourceStatus::Creating,
            ResourceStatus::Created,
            ResourceStatus::Deleting,
            ResourceStatus::Deleted,
        ] {
            record.transition(status).unwrap();
        }
        store.update_resource(&record).unwrap();

        assert!(store.find_by(ResourceKind::Network, &scope(), "vpc-a").unwrap().is_none());
        store.insert_resource(network("vpc-a")).unwrap();
    }

    #[test]
    fn test_failed_create_frees_the_name() {
        let store = MemoryStore::new();
        let mut failed = network("vpc-a");
        store.insert_resource(failed.clone()).unwrap();
        failed.transition(ResourceStatus::Creating).unwrap();
        failed.transition(ResourceStatus::ErrorCreating).unwrap();
        store.update_resource(&failed).unwrap();

        let retry = network("vpc-a");
        let retry_id = retry.id;
        store.insert_resource(retry).unwrap();

        let found = store
            .find_by(ResourceKind::Network, &scope(), "vpc-a")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, retry_id);
        // the failed record stays for the report
        assert_eq!(
            store.get_resource(failed.id).unwrap().status,
            ResourceStatus::ErrorCreating
        );
    }

    #[test]
    fn test_batch_insert_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.insert_resource(network("taken")).unwrap();

        let err = store
            .insert_resources(vec![network("fresh"), network("taken")])
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
        assert!(store.find_by(ResourceKind::Network, &scope(), "fresh").unwrap().is_none());

        let err = store
            .insert_resources(vec![network("twice"), network("twice")])
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
    }

    #[test]
    fn test_update_task_rejects_regression() {
        let store = MemoryStore::new();
        let mut task = TaskRecord::new(
            Uuid::new_v4(),
            TaskPhase::Provisioning,
            "network",
            ResourceKind::Network,
            "vpc-a",
            TaskAction::Add,
            None,
        );
        store.insert_tasks(std::slice::from_ref(&task)).unwrap();
        task.start().unwrap();
        task.succeed("ok").unwrap();
        store.update_task(&task).unwrap();

        let mut stale = task.clone();
        stale.status = crate::model::TaskStatus::InProgress;
        assert!(store.update_task(&stale).is_err());
        assert_eq!(
            store.get_task(task.id).unwrap().status,
            crate::model::TaskStatus::Success
        );
    }

    #[test]
    fn test_claim_requires_matching_phase() {
        let store = MemoryStore::new();
        let step = MigrationStepRecord::new(Uuid::new_v4(), Uuid::new_v4(), "acct", "staging");
        store.insert_step(&step).unwrap();
        let now = Utc::now();

        assert!(store
            .try_claim(step.id, Phase::Poll, "w1", now, Duration::seconds(30))
            .unwrap()
            .is_none());
        assert!(store
            .try_claim(step.id, Phase::Dispatch, "w1", now, Duration::seconds(30))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let step = MigrationStepRecord::new(Uuid::new_v4(), Uuid::new_v4(), "acct", "staging");
        store.insert_step(&step).unwrap();
        let now = Utc::now();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                let id = step.id;
                std::thread::spawn(move || {
                    let owner = format!("w{i}");
                    store
                        .try_claim(id, Phase::Dispatch, &owner, now, Duration::seconds(30))
                        .unwrap()
                        .is_some()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_complete_requires_lease() {
        let store = MemoryStore::new();
        let step = MigrationStepRecord::new(Uuid::new_v4(), Uuid::new_v4(), "acct", "staging");
        store.insert_step(&step).unwrap();
        let now = Utc::now();
        let ttl = Duration::seconds(30);

        let mut claimed = store
            .try_claim(step.id, Phase::Dispatch, "w1", now, ttl)
            .unwrap()
            .unwrap();
        claimed.await_completion();

        // an intruder without the lease cannot write
        assert!(!store.complete(&claimed, "w2").unwrap());
        assert!(store.get_step(step.id).unwrap().in_focus);

        assert!(store.complete(&claimed, "w1").unwrap());
        let stored = store.get_step(step.id).unwrap();
        assert!(!stored.in_focus);
        assert!(stored.lease.is_none());
        assert_eq!(stored.status, MigrationStatus::InProgress);
    }

    #[test]
    fn test_expired_lease_can_be_reclaimed() {
        let store = MemoryStore::new();
        let step = MigrationStepRecord::new(Uuid::new_v4(), Uuid::new_v4(), "acct", "staging");
        store.insert_step(&step).unwrap();
        let now = Utc::now();
        let ttl = Duration::seconds(30);

        store.try_claim(step.id, Phase::Dispatch, "w1", now, ttl).unwrap().unwrap();
        assert!(store.claimable_steps(now).unwrap().is_empty());

        let later = now + Duration::seconds(60);
        assert_eq!(store.claimable_steps(later).unwrap().len(), 1);
        let reclaimed = store.try_claim(step.id, Phase::Dispatch, "w2", later, ttl).unwrap();
        assert!(reclaimed.is_some());
        // the original owner lost the record
        let stale = store.get_step(step.id).unwrap();
        assert!(!store.complete(&stale, "w1").unwrap());
    }
}

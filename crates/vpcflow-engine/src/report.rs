//! Progress report aggregation
//!
//! Folds task and migration records into a two-section status tree:
//!
//! ```text
//! provisioning
//!   └─ <stage>
//!        └─ <kind>/<name>
//!             └─ <migration stage>   (migrating instances only)
//! validation
//!   └─ validation
//!        └─ <kind>/<name>
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;
use vpcflow_core::{
    BackupState, MigrationStage, MigrationStatus, MigrationStepRecord, ReportNode, ReportStatus,
    TaskPhase, TaskRecord,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub provisioning: ReportNode,
    pub validation: ReportNode,
}

impl ProgressReport {
    /// Combined status of both sections
    pub fn overall(&self) -> ReportStatus {
        ReportStatus::rollup([self.validation.status, self.provisioning.status])
    }

    /// Fold a newer report in; terminal nodes never regress
    pub fn merge(&mut self, newer: ProgressReport) {
        self.provisioning.merge(newer.provisioning);
        self.validation.merge(newer.validation);
    }
}

/// Report node key for a task
pub fn node_key(task: &TaskRecord) -> String {
    format!("{}/{}", task.kind, task.name)
}

/// Build the report for a set of tasks and the migration records they own
pub fn aggregate(tasks: &[TaskRecord], steps: &[MigrationStepRecord]) -> ProgressReport {
    let steps: HashMap<Uuid, &MigrationStepRecord> = steps.iter().map(|s| (s.task_id, s)).collect();

    let mut provisioning: BTreeMap<String, BTreeMap<String, ReportNode>> = BTreeMap::new();
    let mut validation: BTreeMap<String, BTreeMap<String, ReportNode>> = BTreeMap::new();

    for task in tasks {
        let node = match steps.get(&task.id) {
            Some(step) => migration_node(task, step),
            None => task_node(task),
        };
        let section = match task.phase {
            TaskPhase::Validation => &mut validation,
            TaskPhase::Provisioning => &mut provisioning,
        };
        section
            .entry(task.stage.clone())
            .or_default()
            .insert(node_key(task), node);
    }

    ProgressReport {
        provisioning: section_node(provisioning),
        validation: section_node(validation),
    }
}

fn section_node(stages: BTreeMap<String, BTreeMap<String, ReportNode>>) -> ReportNode {
    ReportNode::parent(
        stages
            .into_iter()
            .map(|(name, nodes)| (name, ReportNode::parent(nodes)))
            .collect(),
    )
}

fn task_node(task: &TaskRecord) -> ReportNode {
    let mut node = task.report.clone();
    node.status = task.status.as_report();
    if node.message.is_none() {
        node.message = task.message.clone();
    }
    node
}

fn migration_node(task: &TaskRecord, step: &MigrationStepRecord) -> ReportNode {
    let mut children = BTreeMap::new();
    if let Some(backup) = &step.backup {
        children.insert("BACKUP".to_string(), backup_node(backup, step.status));
    }
    for stage in MigrationStage::ALL {
        // classic image sources start at the upload
        if stage == MigrationStage::TakeSnapshot
            && step.classic_instance_id.is_none()
            && step.backup.is_none()
        {
            continue;
        }
        children.insert(stage.to_string(), stage_node(stage, step));
    }

    let mut node = ReportNode::parent(children);
    node.message = task.message.clone().or_else(|| step.message.clone());
    node.resources = task.report.resources.clone();
    node
}

fn stage_node(stage: MigrationStage, step: &MigrationStepRecord) -> ReportNode {
    let status = if stage < step.stage {
        ReportStatus::Success
    } else if stage > step.stage {
        ReportStatus::Pending
    } else {
        match step.status {
            MigrationStatus::Success => ReportStatus::Success,
            MigrationStatus::Failed => ReportStatus::Failed,
            MigrationStatus::InProgress if backup_running(step) => ReportStatus::Pending,
            MigrationStatus::InProgress => ReportStatus::InProgress,
        }
    };
    let node = ReportNode::leaf(status);
    match (&step.message, stage == step.stage, status) {
        (Some(message), true, ReportStatus::Failed) => node.with_message(message.clone()),
        _ => node,
    }
}

fn backup_running(step: &MigrationStepRecord) -> bool {
    step.backup.as_ref().is_some_and(|b| !b.complete)
}

fn backup_node(backup: &BackupState, status: MigrationStatus) -> ReportNode {
    let node_status = if backup.complete {
        ReportStatus::Success
    } else {
        match status {
            MigrationStatus::Failed => ReportStatus::Failed,
            _ if backup.requested_at.is_some() => ReportStatus::InProgress,
            _ => ReportStatus::Pending,
        }
    };
    ReportNode::leaf(node_status).with_message(backup.step.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpcflow_cloud::ResourceKind;
    use vpcflow_core::{ReportResource, TaskAction};

    fn task(phase: TaskPhase, stage: &str, kind: ResourceKind, name: &str) -> TaskRecord {
        TaskRecord::new(Uuid::new_v4(), phase, stage, kind, name, TaskAction::Add, None)
    }

    fn network_task() -> TaskRecord {
        task(TaskPhase::Provisioning, "network", ResourceKind::Network, "vpc-a")
    }

    fn instance_task() -> TaskRecord {
        task(TaskPhase::Provisioning, "workload", ResourceKind::Instance, "web-1")
    }

    fn migration(task: &TaskRecord) -> MigrationStepRecord {
        MigrationStepRecord::new(Uuid::new_v4(), task.id, "classic-1", "staging")
    }

    fn finished(mut task: TaskRecord, ok: bool) -> TaskRecord {
        task.start().unwrap();
        if ok {
            task.succeed("done").unwrap();
        } else {
            task.fail("boom").unwrap();
        }
        task
    }

    #[test]
    fn test_sections_and_keys() {
        let tasks = vec![
            finished(
                task(TaskPhase::Validation, "validation", ResourceKind::Network, "vpc-a"),
                true,
            ),
            finished(network_task(), true),
        ];
        let report = aggregate(&tasks, &[]);

        assert_eq!(report.validation.status, ReportStatus::Success);
        assert_eq!(report.provisioning.status, ReportStatus::Success);
        let stage = &report.provisioning.steps["network"];
        assert_eq!(stage.steps["network/vpc-a"].message.as_deref(), Some("done"));
        assert_eq!(report.overall(), ReportStatus::Success);
    }

    #[test]
    fn test_undispatched_tasks_are_pending() {
        let tasks = vec![
            finished(network_task(), false),
            task(TaskPhase::Provisioning, "dependent", ResourceKind::Subnet, "sn-a"),
        ];
        let report = aggregate(&tasks, &[]);

        assert_eq!(report.provisioning.status, ReportStatus::Failed);
        assert_eq!(
            report.provisioning.steps["dependent"].steps["subnet/sn-a"].status,
            ReportStatus::Pending
        );
        assert_eq!(report.overall(), ReportStatus::Failed);
    }

    #[test]
    fn test_migration_nests_stages() {
        let mut instance = instance_task();
        instance.start().unwrap();
        let mut step = migration(&instance);
        step.classic_instance_id = Some("cci-1".to_string());
        step.stage = MigrationStage::ImageConversion;

        let report = aggregate(std::slice::from_ref(&instance), std::slice::from_ref(&step));
        let node = &report.provisioning.steps["workload"].steps["instance/web-1"];
        assert_eq!(node.status, ReportStatus::InProgress);
        assert_eq!(node.steps["TAKE_SNAPSHOT"].status, ReportStatus::Success);
        assert_eq!(node.steps["IMAGE_CONVERSION"].status, ReportStatus::InProgress);
        assert_eq!(node.steps["CREATE_VSI"].status, ReportStatus::Pending);
    }

    #[test]
    fn test_failed_migration_carries_message() {
        let mut instance = instance_task();
        instance.start().unwrap();
        instance.fail("TAKE_SNAPSHOT failed: capture rejected").unwrap();
        let mut step = migration(&instance);
        step.classic_instance_id = Some("cci-1".to_string());
        step.fail("capture rejected");

        let report = aggregate(std::slice::from_ref(&instance), std::slice::from_ref(&step));
        let node = &report.provisioning.steps["workload"].steps["instance/web-1"];
        assert_eq!(node.status, ReportStatus::Failed);
        assert_eq!(node.steps["TAKE_SNAPSHOT"].message.as_deref(), Some("capture rejected"));
        assert_eq!(node.steps["UPLOAD_TO_COS"].status, ReportStatus::Pending);
    }

    #[test]
    fn test_image_source_skips_snapshot_node() {
        let instance = instance_task();
        let mut step = migration(&instance);
        step.classic_image_id = Some("img-1".to_string());
        step.stage = MigrationStage::UploadToCos;

        let report = aggregate(std::slice::from_ref(&instance), std::slice::from_ref(&step));
        let node = &report.provisioning.steps["workload"].steps["instance/web-1"];
        assert!(!node.steps.contains_key("TAKE_SNAPSHOT"));
        assert_eq!(node.steps.len(), 4);
    }

    #[test]
    fn test_merge_never_regresses() {
        let done = finished(network_task(), true);
        let mut report = aggregate(std::slice::from_ref(&done), &[]);

        let mut stale = done.clone();
        stale.status = vpcflow_core::TaskStatus::InProgress;
        stale.report.resources.push(ReportResource {
            kind: "network".to_string(),
            name: "vpc-a".to_string(),
            remote_id: Some("r-1".to_string()),
        });
        report.merge(aggregate(&[stale], &[]));

        let node = &report.provisioning.steps["network"].steps["network/vpc-a"];
        assert_eq!(node.status, ReportStatus::Success);
        assert_eq!(node.resources.len(), 1);
        assert_eq!(report.provisioning.status, ReportStatus::Success);
    }
}

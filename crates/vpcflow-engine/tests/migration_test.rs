mod common;

use common::{Harness, classic_instance, config, migrate_node, node_at, scope, task};
use chrono::Utc;
use vpcflow_cloud::ResourceKind;
use vpcflow_config::EngineConfig;
use vpcflow_core::{
    MigrationRepository, MigrationStage, MigrationStatus, Phase, ProvisionRequest, ReportStatus,
    ResourceRepository, ResourceStatus, TaskRepository, TaskStatus,
};
use vpcflow_engine::{CompiledWorkflow, StepProgress};

/// Request with a single migrating instance and no network dependencies
fn instance_only(windows_backup: bool) -> ProvisionRequest {
    let mut request = ProvisionRequest::new(scope());
    request
        .instances
        .push(classic_instance("web-1", None, windows_backup));
    request
}

/// Compile and pass validation, then hand the instance task to the driver
/// without running the executor
fn begin_migration(h: &Harness) -> (CompiledWorkflow, uuid::Uuid) {
    let workflow = h.engine.compile(&instance_only(false)).unwrap();
    let (task_id, plan) = migrate_node(&workflow);
    let mut task = h.store.get_task(task_id).unwrap();
    task.start().unwrap();
    h.store.update_task(&task).unwrap();
    let step = h.engine.driver().begin(&task, &plan).unwrap();
    (workflow, step.id)
}

#[tokio::test]
async fn test_windows_backup_becomes_snapshot_source() {
    let h = Harness::new(1);
    let workflow = h.engine.compile(&instance_only(true)).unwrap();

    assert_eq!(h.engine.run(&workflow).await.unwrap(), TaskStatus::Success);

    let tasks = h.tasks(&workflow);
    let instance = task(&tasks, "workload", "web-1");
    let step = h.store.step_for_task(instance.id).unwrap().unwrap();
    let backup = step.backup.clone().unwrap();
    assert!(backup.complete);
    assert!(backup.cleaned_up);

    let temp = backup.instance_id.unwrap();
    assert_eq!(step.classic_instance_id.as_deref(), Some(temp.as_str()));
    assert!(!h.cloud.has_classic_instance(&temp));
    assert!(h.cloud.has_classic_instance("cci-1"));

    let report = h.engine.report(workflow.workflow_id).unwrap();
    let node = node_at(&report.provisioning, &["workload", "instance/web-1"]).unwrap();
    assert_eq!(node.steps["BACKUP"].status, ReportStatus::Success);
    assert_eq!(node.status, ReportStatus::Success);
}

#[tokio::test]
async fn test_unreachable_backup_fails_the_instance() {
    let h = Harness::with_config(
        0,
        EngineConfig {
            max_reachability_attempts: 3,
            ..config()
        },
    );
    h.cloud.set_unreachable(true);
    let workflow = h.engine.compile(&instance_only(true)).unwrap();

    assert_eq!(h.engine.run(&workflow).await.unwrap(), TaskStatus::Failed);

    let tasks = h.tasks(&workflow);
    let instance = task(&tasks, "workload", "web-1");
    assert_eq!(instance.status, TaskStatus::Failed);
    let step = h.store.step_for_task(instance.id).unwrap().unwrap();
    assert_eq!(step.status, MigrationStatus::Failed);
    let backup = step.backup.unwrap();
    assert_eq!(backup.reachability_attempts, 3);
    assert!(backup.cleaned_up);
    assert!(!h.cloud.has_classic_instance(&backup.instance_id.unwrap()));
    assert!(h.cloud.has_classic_instance("cci-1"));
    assert!(h.cloud.remote_names(ResourceKind::Instance).is_empty());

    let record = h.store.get_resource(instance.resource_id.unwrap()).unwrap();
    assert_eq!(record.status, ResourceStatus::ErrorCreating);
}

#[tokio::test]
async fn test_conversion_failure_fails_at_conversion() {
    let h = Harness::new(0);
    h.cloud.fail_conversions();
    let workflow = h.engine.compile(&instance_only(false)).unwrap();

    assert_eq!(h.engine.run(&workflow).await.unwrap(), TaskStatus::Failed);

    let tasks = h.tasks(&workflow);
    let step = h
        .store
        .step_for_task(task(&tasks, "workload", "web-1").id)
        .unwrap()
        .unwrap();
    assert_eq!(step.stage, MigrationStage::ImageConversion);
    let conversion = h.store.get_conversion(step.conversion_id.unwrap()).unwrap();
    assert_eq!(conversion.status, MigrationStatus::Failed);
}

#[tokio::test]
async fn test_repeated_poll_without_progress_is_a_no_op() {
    let h = Harness::new(5);
    let (_, step_id) = begin_migration(&h);
    let driver = h.engine.driver();

    driver.step(step_id, Phase::Dispatch, "worker-a").await.unwrap();
    driver.step(step_id, Phase::Poll, "worker-a").await.unwrap();
    let first = h.store.get_step(step_id).unwrap();

    driver.step(step_id, Phase::Poll, "worker-b").await.unwrap();
    let second = h.store.get_step(step_id).unwrap();

    assert_eq!(first.stage, second.stage);
    assert_eq!(first.in_focus, second.in_focus);
    assert_eq!(first.status, second.status);
    assert_eq!(first.classic_image_id, second.classic_image_id);
    assert_eq!(first.snapshot_requested_at, second.snapshot_requested_at);
    assert!(second.lease.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_worker_wins_each_claim() {
    let h = Harness::new(2);
    let (_, step_id) = begin_migration(&h);

    let mut handles = Vec::new();
    for worker in 0..8 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .driver()
                .step(step_id, Phase::Dispatch, &format!("worker-{worker}"))
                .await
                .unwrap()
        }));
    }

    let mut ran = 0;
    for handle in handles {
        if let StepProgress::Ran { .. } = handle.await.unwrap() {
            ran += 1;
        }
    }
    assert_eq!(ran, 1);

    let step = h.store.get_step(step_id).unwrap();
    assert!(!step.in_focus);
    assert!(step.lease.is_none());
    assert!(step.snapshot_requested_at.is_some());
}

#[tokio::test]
async fn test_sweeper_finishes_abandoned_migration() {
    let h = Harness::new(1);
    let (workflow, step_id) = begin_migration(&h);
    // the worker dispatched the snapshot and went away
    h.engine
        .driver()
        .step(step_id, Phase::Dispatch, "worker-a")
        .await
        .unwrap();

    let sweeper = h.engine.sweeper();
    for _ in 0..20 {
        sweeper.sweep_once(Utc::now()).await.unwrap();
        if h.store.get_step(step_id).unwrap().status.is_terminal() {
            break;
        }
    }

    let step = h.store.get_step(step_id).unwrap();
    assert_eq!(step.status, MigrationStatus::Success);
    assert_eq!(step.stage, MigrationStage::CreateVsi);

    let tasks = h.tasks(&workflow);
    let instance = task(&tasks, "workload", "web-1");
    assert_eq!(instance.status, TaskStatus::Success);
    let record = h.store.get_resource(instance.resource_id.unwrap()).unwrap();
    assert_eq!(record.status, ResourceStatus::Created);
    assert!(record.remote_id.is_some());
    assert_eq!(h.cloud.remote_names(ResourceKind::Instance), vec!["web-1"]);
}

#[tokio::test]
async fn test_background_sweeper_runs_alongside_executor() {
    let h = Harness::new(2);
    let workflow = h.engine.compile(&instance_only(false)).unwrap();

    let sweeper = h.engine.sweeper().start();
    let status = h.engine.run(&workflow).await.unwrap();
    sweeper.shutdown().await;

    assert_eq!(status, TaskStatus::Success);
    // one VPC instance, one custom image, no matter who drove which half
    assert_eq!(h.cloud.remote_names(ResourceKind::Instance), vec!["web-1"]);
    assert_eq!(h.cloud.remote_names(ResourceKind::Image).len(), 1);
}

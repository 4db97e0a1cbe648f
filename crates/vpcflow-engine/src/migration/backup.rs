//! Windows pre-migration backup
//!
//! Before the outer snapshot, the source is captured and a temporary classic
//! instance is started from that capture with the backup script as
//! user-data. Once it answers on the network it becomes the snapshot source.

use super::registry::{StageHandler, StepOutcome};
use super::stages::{instance_record, locate_image, missing_instance, observed, short_id};
use crate::context::EngineContext;
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use vpcflow_cloud::{CloudError, RemoteStatus};
use vpcflow_core::{BackupState, BackupStep, MigrationStatus, MigrationStepRecord};

fn no_backup() -> StepOutcome {
    StepOutcome::Failed("backup state is missing".to_string())
}

fn backup_mut(step: &mut MigrationStepRecord) -> Option<&mut BackupState> {
    step.backup.as_mut()
}

fn backup_user_data(source_instance_id: &str) -> String {
    serde_json::json!({
        "script": "pre-migration-backup",
        "source": source_instance_id,
    })
    .to_string()
}

pub struct BackupCaptureDispatch;

#[async_trait]
impl StageHandler for BackupCaptureDispatch {
    async fn run(
        &self,
        ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        let Some(instance) = instance_record(ctx, step)? else {
            return Ok(missing_instance(step));
        };
        let account = step.classic_account.clone();
        let image_name = format!("{}-backup-{}", instance.name, short_id(step.id));
        let Some(backup) = backup_mut(step) else {
            return Ok(no_backup());
        };
        let source = backup.source_instance_id.clone();

        backup.image_name = Some(image_name.clone());
        backup.requested_at = Some(Utc::now());
        ctx.classic
            .capture_image(&account, &source, &image_name)
            .await
            .map_err(observed(ctx, &account))?;

        info!(
            step_id = %step.id,
            source = %source,
            image = %image_name,
            "Requested backup capture"
        );
        Ok(StepOutcome::Dispatched)
    }
}

pub struct BackupCapturePoll;

#[async_trait]
impl StageHandler for BackupCapturePoll {
    async fn run(
        &self,
        ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        let account = step.classic_account.clone();
        let Some(backup) = backup_mut(step) else {
            return Ok(no_backup());
        };
        let Some(image_name) = backup.image_name.clone() else {
            return Ok(StepOutcome::Failed("backup capture was never requested".to_string()));
        };

        if ctx
            .classic
            .instance_transaction(&account, &backup.source_instance_id)
            .await
            .map_err(observed(ctx, &account))?
            .is_some()
        {
            return Ok(StepOutcome::Waiting);
        }

        let Some(image) =
            locate_image(ctx, &account, &image_name, backup.requested_at).await?
        else {
            return Ok(StepOutcome::Failed(format!(
                "backup image {image_name} not found after capture"
            )));
        };
        debug!(image_id = %image.id, "Backup image located");
        backup.image_id = Some(image.id);
        backup.step = BackupStep::SpinUp;
        Ok(StepOutcome::Advanced)
    }
}

pub struct SpinUpDispatch;

#[async_trait]
impl StageHandler for SpinUpDispatch {
    async fn run(
        &self,
        ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        let Some(instance) = instance_record(ctx, step)? else {
            return Ok(missing_instance(step));
        };
        let account = step.classic_account.clone();
        let name = format!("{}-backup-{}", instance.name, short_id(step.id));
        let Some(backup) = backup_mut(step) else {
            return Ok(no_backup());
        };
        let Some(image_id) = backup.image_id.clone() else {
            return Ok(StepOutcome::Failed("backup image was never located".to_string()));
        };

        if backup.instance_id.is_none() {
            let created = ctx
                .classic
                .create_instance(
                    &account,
                    &image_id,
                    &name,
                    &backup_user_data(&backup.source_instance_id),
                )
                .await
                .map_err(observed(ctx, &account))?;
            info!(instance_id = %created.id, "Started backup instance");
            backup.instance_id = Some(created.id);
        }
        Ok(StepOutcome::Dispatched)
    }
}

pub struct SpinUpPoll;

#[async_trait]
impl StageHandler for SpinUpPoll {
    async fn run(
        &self,
        ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        let account = step.classic_account.clone();
        let Some(backup) = backup_mut(step) else {
            return Ok(no_backup());
        };
        let Some(instance_id) = backup.instance_id.clone() else {
            return Ok(StepOutcome::Failed("backup instance was never started".to_string()));
        };

        let instance = ctx
            .classic
            .get_instance(&account, &instance_id)
            .await
            .map_err(observed(ctx, &account))?;
        Ok(match instance.status {
            status if status.is_transient() => StepOutcome::Waiting,
            RemoteStatus::Running | RemoteStatus::Available => {
                backup.step = BackupStep::AwaitReachable;
                backup.reachability_attempts = 0;
                StepOutcome::Advanced
            }
            other => StepOutcome::Failed(format!("backup instance {instance_id} is {other}")),
        })
    }
}

pub struct AwaitReachableDispatch;

#[async_trait]
impl StageHandler for AwaitReachableDispatch {
    async fn run(
        &self,
        _ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        match backup_mut(step) {
            Some(backup) => {
                backup.reachability_attempts = 0;
                Ok(StepOutcome::Dispatched)
            }
            None => Ok(no_backup()),
        }
    }
}

pub struct AwaitReachablePoll;

#[async_trait]
impl StageHandler for AwaitReachablePoll {
    async fn run(
        &self,
        ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        let account = step.classic_account.clone();
        let max_attempts = ctx.config.max_reachability_attempts;
        let Some(backup) = backup_mut(step) else {
            return Ok(no_backup());
        };
        let Some(instance_id) = backup.instance_id.clone() else {
            return Ok(StepOutcome::Failed("backup instance was never started".to_string()));
        };

        let reachable = ctx
            .classic
            .is_reachable(&account, &instance_id)
            .await
            .map_err(observed(ctx, &account))?;
        backup.reachability_attempts += 1;

        if reachable {
            backup.complete = true;
            info!(instance_id = %instance_id, "Backup instance reachable");
            step.classic_instance_id = Some(instance_id);
            return Ok(StepOutcome::Advanced);
        }
        if backup.reachability_attempts >= max_attempts {
            return Ok(StepOutcome::Failed(format!(
                "backup instance {instance_id} unreachable after {} checks",
                backup.reachability_attempts
            )));
        }
        debug!(
            instance_id = %instance_id,
            attempts = backup.reachability_attempts,
            "Backup instance not reachable yet"
        );
        Ok(StepOutcome::Waiting)
    }
}

/// Delete the temporary backup instance once the outer snapshot of it exists
/// or the migration has failed
pub(crate) async fn release_backup_instance(
    ctx: &EngineContext,
    step: &mut MigrationStepRecord,
) -> Result<()> {
    let account = step.classic_account.clone();
    let failed = step.status == MigrationStatus::Failed;
    let Some(backup) = backup_mut(step) else {
        return Ok(());
    };
    if backup.cleaned_up || !(backup.complete || failed) {
        return Ok(());
    }
    if let Some(instance_id) = backup.instance_id.clone() {
        match ctx.classic.delete_instance(&account, &instance_id).await {
            Ok(()) => info!(instance_id = %instance_id, "Deleted backup instance"),
            Err(CloudError::NotFound(_)) => {
                warn!(instance_id = %instance_id, "Backup instance already gone");
            }
            Err(e) => return Err(observed(ctx, &account)(e)),
        }
    }
    backup.cleaned_up = true;
    Ok(())
}

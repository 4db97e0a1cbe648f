//! Image pipeline stage handlers
//!
//! TAKE_SNAPSHOT → UPLOAD_TO_COS → IMAGE_CONVERSION → CREATE_CUSTOM_IMAGE →
//! CREATE_VSI. Each stage has a dispatch half that issues the long-running
//! operation and a poll half that checks on it. Poll halves only read
//! external state and may be repeated freely.

use super::registry::{StageHandler, StepOutcome};
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::reconciler::build_spec;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;
use vpcflow_cloud::{
    ClassicImage, CloudError, ConversionRequest, ConversionState, RemoteStatus, ResourceKind,
    ResourceSpec,
};
use vpcflow_core::{
    ConversionRecord, CoreError, MigrationStatus, MigrationStepRecord, ResourceRecord,
    ResourceStatus,
};

/// Extension of the per-volume files an export writes
pub const EXPORT_EXTENSION: &str = "vhd";

/// Format the converter produces for VPC custom images
pub const TARGET_FORMAT: &str = "qcow2";

pub(crate) fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// `<prefix>-<n>.vhd` for every exported volume, boot volume first
pub fn export_objects(prefix: &str, volume_count: usize) -> Vec<String> {
    (0..volume_count)
        .map(|n| format!("{prefix}-{n}.{EXPORT_EXTENSION}"))
        .collect()
}

/// Map a cloud error, invalidating `account` on authentication failures
pub(crate) fn observed<'a>(
    ctx: &'a EngineContext,
    account: &'a str,
) -> impl FnOnce(CloudError) -> EngineError + 'a {
    move |error| {
        ctx.accounts.observe(account, &error);
        EngineError::Cloud(error)
    }
}

/// Instance record being migrated; `None` when it has disappeared
pub(crate) fn instance_record(
    ctx: &EngineContext,
    step: &MigrationStepRecord,
) -> Result<Option<ResourceRecord>> {
    match ctx.resources.get_resource(step.resource_id) {
        Ok(record) => Ok(Some(record)),
        Err(CoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn missing_instance(step: &MigrationStepRecord) -> StepOutcome {
    StepOutcome::Failed(format!("instance record {} no longer exists", step.resource_id))
}

fn missing(what: &str) -> StepOutcome {
    StepOutcome::Failed(format!("{what} was never recorded"))
}

/// Newest image with this name created at or after `requested_at`.
// TODO: look the image up by the capture transaction once the classic API reports it
pub(crate) async fn locate_image(
    ctx: &EngineContext,
    account: &str,
    name: &str,
    requested_at: Option<DateTime<Utc>>,
) -> Result<Option<ClassicImage>> {
    let images = ctx
        .classic
        .find_images(account, name)
        .await
        .map_err(observed(ctx, account))?;
    Ok(images
        .into_iter()
        .filter(|image| requested_at.is_none_or(|at| image.created_at >= at))
        .max_by_key(|image| image.created_at))
}

pub struct TakeSnapshotDispatch;

#[async_trait]
impl StageHandler for TakeSnapshotDispatch {
    async fn run(
        &self,
        ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        let Some(source) = step.classic_instance_id.clone() else {
            return Ok(missing("classic source instance"));
        };
        let Some(instance) = instance_record(ctx, step)? else {
            return Ok(missing_instance(step));
        };
        let account = step.classic_account.clone();
        let image_name = format!("{}-{}", instance.name, short_id(step.id));

        step.classic_image_name = Some(image_name.clone());
        step.snapshot_requested_at = Some(Utc::now());
        ctx.classic
            .capture_image(&account, &source, &image_name)
            .await
            .map_err(observed(ctx, &account))?;

        info!(step_id = %step.id, source = %source, image = %image_name, "Requested image capture");
        Ok(StepOutcome::Dispatched)
    }
}

pub struct TakeSnapshotPoll;

#[async_trait]
impl StageHandler for TakeSnapshotPoll {
    async fn run(
        &self,
        ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        let account = step.classic_account.clone();
        let (Some(source), Some(image_name)) =
            (step.classic_instance_id.clone(), step.classic_image_name.clone())
        else {
            return Ok(missing("snapshot request"));
        };

        if let Some(transaction) = ctx
            .classic
            .instance_transaction(&account, &source)
            .await
            .map_err(observed(ctx, &account))?
        {
            debug!(step_id = %step.id, transaction = %transaction, "Capture still running");
            return Ok(StepOutcome::Waiting);
        }

        let Some(image) =
            locate_image(ctx, &account, &image_name, step.snapshot_requested_at).await?
        else {
            return Ok(StepOutcome::Failed(format!(
                "image {image_name} not found after capture of {source}"
            )));
        };

        info!(
            step_id = %step.id,
            image_id = %image.id,
            volumes = image.volume_count,
            "Snapshot located"
        );
        step.classic_image_id = Some(image.id);
        step.volume_count = Some(image.volume_count);
        super::backup::release_backup_instance(ctx, step).await?;
        Ok(StepOutcome::Advanced)
    }
}

pub struct UploadDispatch;

#[async_trait]
impl StageHandler for UploadDispatch {
    async fn run(
        &self,
        ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        let Some(image_id) = step.classic_image_id.clone() else {
            return Ok(missing("classic image"));
        };
        let account = step.classic_account.clone();

        // Images migrated directly carry no capture metadata yet
        if step.volume_count.is_none() || step.classic_image_name.is_none() {
            let image = ctx
                .classic
                .get_image(&account, &image_id)
                .await
                .map_err(observed(ctx, &account))?;
            step.volume_count = Some(image.volume_count);
            step.classic_image_name.get_or_insert(image.name);
        }

        let prefix = format!("migration-{}", step.id.simple());
        step.object_prefix = Some(prefix.clone());
        ctx.classic
            .export_image(&account, &image_id, &step.bucket, &prefix)
            .await
            .map_err(observed(ctx, &account))?;

        info!(
            step_id = %step.id,
            bucket = %step.bucket,
            prefix = %prefix,
            "Requested image export"
        );
        Ok(StepOutcome::Dispatched)
    }
}

pub struct UploadPoll;

#[async_trait]
impl StageHandler for UploadPoll {
    async fn run(
        &self,
        ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        let account = step.classic_account.clone();
        let (Some(image_id), Some(prefix), Some(volume_count)) = (
            step.classic_image_id.clone(),
            step.object_prefix.clone(),
            step.volume_count,
        ) else {
            return Ok(missing("export request"));
        };

        if ctx
            .classic
            .image_transaction(&account, &image_id)
            .await
            .map_err(observed(ctx, &account))?
            .is_some()
        {
            return Ok(StepOutcome::Waiting);
        }

        let stored: HashSet<String> = ctx
            .objects
            .list_objects(&step.bucket, &prefix)
            .await?
            .into_iter()
            .map(|object| object.name)
            .collect();
        let expected = export_objects(&prefix, volume_count);
        let present = expected.iter().filter(|name| stored.contains(*name)).count();

        if present < expected.len() {
            debug!(step_id = %step.id, present, expected = expected.len(), "Export incomplete");
            return Ok(StepOutcome::Waiting);
        }
        info!(step_id = %step.id, objects = present, "Export complete");
        Ok(StepOutcome::Advanced)
    }
}

pub struct ConversionDispatch;

#[async_trait]
impl StageHandler for ConversionDispatch {
    async fn run(
        &self,
        ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        let Some(prefix) = step.object_prefix.clone() else {
            return Ok(missing("staging prefix"));
        };
        let boot = export_objects(&prefix, 1);

        let job_id = ctx
            .converter
            .submit(&ConversionRequest {
                bucket: step.bucket.clone(),
                objects: boot.clone(),
                target_format: TARGET_FORMAT.to_string(),
            })
            .await?;

        let record = ConversionRecord::new(step.id, &job_id, &step.bucket, boot);
        ctx.migrations.insert_conversion(&record)?;
        step.conversion_id = Some(record.id);

        info!(step_id = %step.id, job_id = %job_id, "Submitted image conversion");
        Ok(StepOutcome::Dispatched)
    }
}

pub struct ConversionPoll;

#[async_trait]
impl StageHandler for ConversionPoll {
    async fn run(
        &self,
        ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        let Some(conversion_id) = step.conversion_id else {
            return Ok(missing("conversion"));
        };
        let mut record = match ctx.migrations.get_conversion(conversion_id) {
            Ok(record) => record,
            Err(CoreError::NotFound(_)) => {
                return Ok(StepOutcome::Failed(format!(
                    "conversion record {conversion_id} no longer exists"
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if record.status == MigrationStatus::InProgress {
            match ctx.converter.status(&record.job_id).await? {
                ConversionState::Running => return Ok(StepOutcome::Waiting),
                ConversionState::Succeeded { object } => {
                    record.status = MigrationStatus::Success;
                    record.converted_object = Some(object);
                }
                ConversionState::Failed { reason } => {
                    record.status = MigrationStatus::Failed;
                    record.message = Some(reason);
                }
            }
            record.updated_at = Utc::now();
            ctx.migrations.update_conversion(&record)?;
        }

        match record.status {
            MigrationStatus::Success => {
                step.converted_object = record.converted_object;
                Ok(StepOutcome::Advanced)
            }
            MigrationStatus::Failed => Ok(StepOutcome::Failed(format!(
                "image conversion failed: {}",
                record.message.unwrap_or_default()
            ))),
            MigrationStatus::InProgress => Ok(StepOutcome::Waiting),
        }
    }
}

pub struct CustomImageDispatch;

#[async_trait]
impl StageHandler for CustomImageDispatch {
    async fn run(
        &self,
        ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        let Some(instance) = instance_record(ctx, step)? else {
            return Ok(missing_instance(step));
        };
        let Some(object) = step.converted_object.clone() else {
            return Ok(missing("converted object"));
        };
        let scope = &instance.scope;
        ctx.accounts.ensure_valid(&scope.account)?;

        if step.custom_image_id.is_none() {
            let name = format!("{}-{}", instance.name, short_id(step.id));
            // A re-dispatch after a lost lease finds its own image
            let existing = ctx
                .provider
                .find(scope, ResourceKind::Image, &name)
                .await
                .map_err(observed(ctx, &scope.account))?;
            let image_id = match existing {
                Some(image) => image.id,
                None => {
                    let spec = ResourceSpec::new(
                        ResourceKind::Image,
                        &name,
                        serde_json::json!({
                            "file": format!("cos://{}/{}", step.bucket, object),
                            "operating_system": instance.config.get("operating_system"),
                        }),
                    );
                    ctx.provider
                        .create(scope, &spec)
                        .await
                        .map_err(observed(ctx, &scope.account))?
                        .id
                }
            };
            info!(step_id = %step.id, image_id = %image_id, "Registered custom image");
            step.custom_image_id = Some(image_id);
        }
        Ok(StepOutcome::Dispatched)
    }
}

pub struct CustomImagePoll;

#[async_trait]
impl StageHandler for CustomImagePoll {
    async fn run(
        &self,
        ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        let Some(instance) = instance_record(ctx, step)? else {
            return Ok(missing_instance(step));
        };
        let Some(image_id) = step.custom_image_id.clone() else {
            return Ok(missing("custom image"));
        };
        let scope = &instance.scope;

        let image = ctx
            .provider
            .get(scope, ResourceKind::Image, &image_id)
            .await
            .map_err(observed(ctx, &scope.account))?;
        Ok(match image.status {
            status if status.is_ready() => StepOutcome::Advanced,
            RemoteStatus::Failed => {
                StepOutcome::Failed(format!("custom image {image_id} failed to register"))
            }
            _ => StepOutcome::Waiting,
        })
    }
}

/// Opaque payload the guest agent reads on first boot
fn guest_user_data(step: &MigrationStepRecord, instance_name: &str) -> String {
    serde_json::json!({
        "bucket": step.bucket,
        "token": step.id.simple().to_string(),
        "instance": instance_name,
    })
    .to_string()
}

pub struct CreateVsiDispatch;

#[async_trait]
impl StageHandler for CreateVsiDispatch {
    async fn run(
        &self,
        ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        let Some(instance) = instance_record(ctx, step)? else {
            return Ok(missing_instance(step));
        };
        let Some(image_id) = step.custom_image_id.clone() else {
            return Ok(missing("custom image"));
        };
        let scope = &instance.scope;
        ctx.accounts.ensure_valid(&scope.account)?;

        if step.vpc_instance_id.is_none() {
            let existing = ctx
                .provider
                .find(scope, ResourceKind::Instance, &instance.name)
                .await
                .map_err(observed(ctx, &scope.account))?;
            let instance_id = match existing {
                Some(remote) => remote.id,
                None => {
                    let mut spec = build_spec(ctx, &instance)?.with_reference("image", image_id);
                    let user_data = guest_user_data(step, &instance.name);
                    match spec.config.as_object_mut() {
                        Some(config) => {
                            config.insert("user_data".to_string(), user_data.into());
                        }
                        None => spec.config = serde_json::json!({ "user_data": user_data }),
                    }
                    ctx.provider
                        .create(scope, &spec)
                        .await
                        .map_err(observed(ctx, &scope.account))?
                        .id
                }
            };
            info!(step_id = %step.id, instance_id = %instance_id, "Requested VPC instance");
            step.vpc_instance_id = Some(instance_id);
        }
        Ok(StepOutcome::Dispatched)
    }
}

pub struct CreateVsiPoll;

#[async_trait]
impl StageHandler for CreateVsiPoll {
    async fn run(
        &self,
        ctx: &EngineContext,
        step: &mut MigrationStepRecord,
    ) -> Result<StepOutcome> {
        let Some(mut instance) = instance_record(ctx, step)? else {
            return Ok(missing_instance(step));
        };
        let Some(instance_id) = step.vpc_instance_id.clone() else {
            return Ok(missing("VPC instance"));
        };
        let scope = instance.scope.clone();

        let remote = ctx
            .provider
            .get(&scope, ResourceKind::Instance, &instance_id)
            .await
            .map_err(observed(ctx, &scope.account))?;
        if remote.status.is_transient() {
            return Ok(StepOutcome::Waiting);
        }
        if !remote.status.is_ready() {
            return Ok(StepOutcome::Failed(format!(
                "instance {instance_id} ended up {}",
                remote.status
            )));
        }

        instance.remote_id = Some(remote.id.clone());
        for (key, value) in &remote.attributes {
            instance.set_attribute(key.clone(), value.clone());
        }
        instance.set_attribute("remote_status", serde_json::json!(remote.status.to_string()));
        if instance.status == ResourceStatus::CreationPending {
            instance.transition(ResourceStatus::Creating)?;
        }
        if instance.status != ResourceStatus::Created {
            instance.transition(ResourceStatus::Created)?;
        }
        ctx.resources.update_resource(&instance)?;

        clean_staging(ctx, step).await?;
        info!(step_id = %step.id, instance_id = %instance_id, "Migrated instance is running");
        Ok(StepOutcome::Succeeded)
    }
}

/// Delete the exported and converted objects of a finished migration
async fn clean_staging(ctx: &EngineContext, step: &MigrationStepRecord) -> Result<()> {
    let Some(prefix) = &step.object_prefix else {
        return Ok(());
    };
    let mut names: Vec<String> = ctx
        .objects
        .list_objects(&step.bucket, prefix)
        .await?
        .into_iter()
        .map(|object| object.name)
        .collect();
    if let Some(converted) = &step.converted_object {
        if !names.contains(converted) {
            names.push(converted.clone());
        }
    }
    if !names.is_empty() {
        ctx.objects.delete_objects(&step.bucket, &names).await?;
        debug!(step_id = %step.id, objects = names.len(), "Cleaned staging objects");
    }
    Ok(())
}

//! Migration step state machine
//!
//! One [`MigrationStepRecord`] walks a classic workload through the image
//! pipeline. Every invocation claims the record for one half of the current
//! stage, runs the registered handler, and writes the result back while the
//! lease is still held:
//!
//! ```text
//!   dispatch (in_focus = true) ──Dispatched──▶ poll (in_focus = false)
//!        ▲                                        │
//!        └──────────────Advanced──────────────────┘ (next stage)
//! ```

pub mod backup;
pub mod registry;
pub mod stages;

pub use registry::{HandlerRegistry, StageHandler, StepOutcome};

use crate::compiler::{ClassicSource, MigrationPlan};
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vpcflow_core::{
    BackupState, MigrationStage, MigrationStatus, MigrationStepRecord, Phase, ReportResource,
    ResourceStatus, StepKind, TaskRecord,
};

/// Result of one claim-and-run attempt
#[derive(Debug, Clone)]
pub enum StepProgress {
    /// Wrong phase, terminal, or someone else holds the lease
    NotClaimed,
    /// The lease expired and was taken over before the write-back
    LeaseLost,
    Ran {
        outcome: StepOutcome,
        step: MigrationStepRecord,
    },
}

/// Fresh lease owner token
pub fn claim_token(role: &str) -> String {
    format!("{role}-{}", Uuid::new_v4().simple())
}

pub struct MigrationDriver {
    ctx: Arc<EngineContext>,
    registry: HandlerRegistry,
}

impl MigrationDriver {
    pub fn new(ctx: Arc<EngineContext>, registry: HandlerRegistry) -> Self {
        Self { ctx, registry }
    }

    pub fn standard(ctx: Arc<EngineContext>) -> Self {
        Self::new(ctx, HandlerRegistry::standard())
    }

    /// Create the migration record for an instance task, or return the
    /// existing one when the task is being resumed
    pub fn begin(&self, task: &TaskRecord, plan: &MigrationPlan) -> Result<MigrationStepRecord> {
        if let Some(existing) = self.ctx.migrations.step_for_task(task.id)? {
            debug!(step_id = %existing.id, "Resuming existing migration");
            return Ok(existing);
        }
        let resource_id = task.resource_id.ok_or_else(|| {
            EngineError::Validation(format!("task {} has no instance record", task.id))
        })?;

        let mut resource = self.ctx.resources.get_resource(resource_id)?;
        if resource.status == ResourceStatus::CreationPending {
            resource.transition(ResourceStatus::Creating)?;
            self.ctx.resources.update_resource(&resource)?;
        }

        let mut step = MigrationStepRecord::new(
            resource_id,
            task.id,
            &plan.account,
            &self.ctx.config.staging_bucket,
        );
        match &plan.source {
            ClassicSource::Instance { id, windows_backup } => {
                step.classic_instance_id = Some(id.clone());
                if *windows_backup {
                    step.backup = Some(BackupState::new(id));
                }
            }
            ClassicSource::Image { id } => {
                step.classic_image_id = Some(id.clone());
                step.stage = MigrationStage::UploadToCos;
            }
        }
        self.ctx.migrations.insert_step(&step)?;

        info!(
            step_id = %step.id,
            instance = %task.name,
            stage = %step.stage,
            backup = step.backup.is_some(),
            "Migration started"
        );
        Ok(step)
    }

    /// Claim the record for `phase`, run its handler and write the result back
    #[instrument(skip(self, owner), fields(step_id = %id, phase = %phase))]
    pub async fn step(&self, id: Uuid, phase: Phase, owner: &str) -> Result<StepProgress> {
        let now = Utc::now();
        let Some(mut step) =
            self.ctx
                .migrations
                .try_claim(id, phase, owner, now, self.ctx.lease_ttl())?
        else {
            debug!("Record not claimable");
            return Ok(StepProgress::NotClaimed);
        };

        let kind = step.kind();
        let outcome = match self.registry.get(kind, phase) {
            None => StepOutcome::Failed(format!("no handler registered for {kind} {phase}")),
            Some(handler) => match self.ctx.accounts.ensure_valid(&step.classic_account) {
                Err(e) => StepOutcome::Failed(e.to_string()),
                Ok(()) => match handler.run(&self.ctx, &mut step).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "Migration handler failed");
                        StepOutcome::Failed(e.to_string())
                    }
                },
            },
        };

        match &outcome {
            StepOutcome::Dispatched => step.await_completion(),
            StepOutcome::Waiting => {}
            StepOutcome::Advanced => match kind {
                StepKind::Stage(_) => step.advance(),
                StepKind::Backup(_) => step.refocus(),
            },
            StepOutcome::Succeeded => step.succeed(),
            StepOutcome::Failed(message) => step.fail(message.clone()),
        }
        if step.status == MigrationStatus::Failed {
            if let Err(e) = backup::release_backup_instance(&self.ctx, &mut step).await {
                warn!(error = %e, "Backup instance left behind");
            }
        }

        if !self.ctx.migrations.complete(&step, owner)? {
            warn!(kind = %kind, "Lease lost before write-back");
            return Ok(StepProgress::LeaseLost);
        }
        debug!(
            kind = %kind,
            outcome = ?outcome,
            stage = %step.stage,
            in_focus = step.in_focus,
            "Step written back"
        );

        if step.status.is_terminal() {
            self.finalize(&step)?;
        }
        Ok(StepProgress::Ran { outcome, step })
    }

    /// Run the current half, then keep going while the record lands on a
    /// dispatch half (a finished poll chains straight into the next stage)
    pub async fn resume(&self, id: Uuid, phase: Phase, role: &str) -> Result<StepProgress> {
        let mut progress = self.step(id, phase, &claim_token(role)).await?;
        loop {
            let chain = matches!(
                &progress,
                StepProgress::Ran { step, .. }
                    if !step.status.is_terminal() && step.phase() == Phase::Dispatch
            );
            if !chain {
                return Ok(progress);
            }
            progress = self.step(id, Phase::Dispatch, &claim_token(role)).await?;
        }
    }

    /// Drive the record until it is terminal, polling every `poll_interval`
    pub async fn run_to_completion(&self, id: Uuid) -> Result<MigrationStatus> {
        let poll_interval = self.ctx.config.poll_interval();
        loop {
            let current = self.ctx.migrations.get_step(id)?;
            if current.status.is_terminal() {
                return Ok(current.status);
            }

            match self.step(id, current.phase(), &claim_token("executor")).await? {
                StepProgress::Ran { step, .. } if step.status.is_terminal() => {
                    return Ok(step.status);
                }
                StepProgress::Ran { step, .. } if step.phase() == Phase::Dispatch => continue,
                // Waiting on the provider, or another owner is working on it
                _ => tokio::time::sleep(poll_interval).await,
            }
        }
    }

    /// Reflect a terminal record in its task and instance records
    fn finalize(&self, step: &MigrationStepRecord) -> Result<()> {
        let mut task = self.ctx.tasks.get_task(step.task_id)?;
        if !task.status.is_terminal() {
            task.start()?;
            match step.status {
                MigrationStatus::Success => {
                    task.report.resources.push(ReportResource {
                        kind: task.kind.to_string(),
                        name: task.name.clone(),
                        remote_id: step.vpc_instance_id.clone(),
                    });
                    task.succeed(format!(
                        "migrated to {}",
                        step.vpc_instance_id.as_deref().unwrap_or_default()
                    ))?;
                }
                MigrationStatus::Failed => {
                    let message = step.message.clone().unwrap_or_default();
                    task.fail(format!("{} failed: {message}", step.stage))?;
                }
                MigrationStatus::InProgress => return Ok(()),
            }
            self.ctx.tasks.update_task(&task)?;
        }

        if step.status == MigrationStatus::Failed {
            if let Ok(mut resource) = self.ctx.resources.get_resource(step.resource_id) {
                if resource.status.can_transition_to(ResourceStatus::ErrorCreating) {
                    resource.transition(ResourceStatus::ErrorCreating)?;
                    self.ctx.resources.update_resource(&resource)?;
                }
            }
        }

        info!(step_id = %step.id, status = %step.status, stage = %step.stage, "Migration finished");
        Ok(())
    }
}

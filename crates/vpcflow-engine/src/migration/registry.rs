//! Handler lookup for migration steps
//!
//! Handlers are keyed by what the record is working on and which half of the
//! stage runs next. The executor chain and the sweeper resolve handlers here.

use crate::context::EngineContext;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use vpcflow_core::{BackupStep, MigrationStage, MigrationStepRecord, Phase, StepKind};

/// What one handler invocation did to the record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// External operation issued; poll next
    Dispatched,
    /// External operation still running
    Waiting,
    /// Poll finished; move on
    Advanced,
    /// Final stage finished
    Succeeded,
    Failed(String),
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(&self, ctx: &EngineContext, step: &mut MigrationStepRecord) -> Result<StepOutcome>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(StepKind, Phase), Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stage and backup step, both halves
    pub fn standard() -> Self {
        use super::backup::*;
        use super::stages::*;

        let mut registry = Self::new();
        let stage = StepKind::Stage;
        let backup = StepKind::Backup;
        let (dispatch, poll) = (Phase::Dispatch, Phase::Poll);

        registry.register(stage(MigrationStage::TakeSnapshot), dispatch, TakeSnapshotDispatch);
        registry.register(stage(MigrationStage::TakeSnapshot), poll, TakeSnapshotPoll);
        registry.register(stage(MigrationStage::UploadToCos), dispatch, UploadDispatch);
        registry.register(stage(MigrationStage::UploadToCos), poll, UploadPoll);
        registry.register(stage(MigrationStage::ImageConversion), dispatch, ConversionDispatch);
        registry.register(stage(MigrationStage::ImageConversion), poll, ConversionPoll);
        registry.register(stage(MigrationStage::CreateCustomImage), dispatch, CustomImageDispatch);
        registry.register(stage(MigrationStage::CreateCustomImage), poll, CustomImagePoll);
        registry.register(stage(MigrationStage::CreateVsi), dispatch, CreateVsiDispatch);
        registry.register(stage(MigrationStage::CreateVsi), poll, CreateVsiPoll);

        registry.register(backup(BackupStep::Capture), dispatch, BackupCaptureDispatch);
        registry.register(backup(BackupStep::Capture), poll, BackupCapturePoll);
        registry.register(backup(BackupStep::SpinUp), dispatch, SpinUpDispatch);
        registry.register(backup(BackupStep::SpinUp), poll, SpinUpPoll);
        registry.register(backup(BackupStep::AwaitReachable), dispatch, AwaitReachableDispatch);
        registry.register(backup(BackupStep::AwaitReachable), poll, AwaitReachablePoll);

        registry
    }

    pub fn register<H>(&mut self, kind: StepKind, phase: Phase, handler: H)
    where
        H: StageHandler + 'static,
    {
        self.handlers.insert((kind, phase), Arc::new(handler));
    }

    pub fn get(&self, kind: StepKind, phase: Phase) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&(kind, phase)).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_every_half() {
        let registry = HandlerRegistry::standard();
        for stage in MigrationStage::ALL {
            for phase in [Phase::Dispatch, Phase::Poll] {
                assert!(registry.get(StepKind::Stage(stage), phase).is_some(), "{stage} {phase}");
            }
        }
        for step in [BackupStep::Capture, BackupStep::SpinUp, BackupStep::AwaitReachable] {
            assert!(registry.get(StepKind::Backup(step), Phase::Poll).is_some());
        }
        assert_eq!(registry.len(), 16);
    }

    #[test]
    fn test_empty_registry_has_no_handlers() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry
            .get(StepKind::Stage(MigrationStage::TakeSnapshot), Phase::Dispatch)
            .is_none());
    }
}

//! vpcflow Engine
//!
//! Compiles provisioning requests into staged workflows and runs them:
//! plain resources go through the [`reconciler::Reconciler`], instances
//! moving over from classic infrastructure go through the migration state
//! machine in [`migration`]. The [`sweeper::Sweeper`] resumes migrations no
//! worker owns, and [`report::aggregate`] turns the records into a
//! progress tree.

pub mod accounts;
pub mod compiler;
pub mod context;
pub mod error;
pub mod executor;
pub mod migration;
pub mod reconciler;
pub mod report;
pub mod sweeper;

// Re-exports
pub use accounts::AccountGuard;
pub use compiler::{
    ClassicSource, CompiledWorkflow, Compiler, MigrationPlan, NodeOp, Stage, TaskNode,
    VALIDATION_STAGE,
};
pub use context::EngineContext;
pub use error::{EngineError, Result};
pub use executor::Executor;
pub use migration::{HandlerRegistry, MigrationDriver, StageHandler, StepOutcome, StepProgress};
pub use reconciler::{Reconciler, Validation};
pub use report::{ProgressReport, aggregate};
pub use sweeper::{SweepSummary, Sweeper, SweeperHandle};

use std::sync::Arc;
use uuid::Uuid;
use vpcflow_cloud::{MemoryCloud, Scope};
use vpcflow_config::EngineConfig;
use vpcflow_core::{MemoryStore, ProvisionRequest, TaskStatus};

/// Entry point wiring the compiler, executor and sweeper to one context
pub struct Engine {
    ctx: Arc<EngineContext>,
    compiler: Compiler,
    executor: Executor,
    driver: Arc<MigrationDriver>,
}

impl Engine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self::with_registry(ctx, HandlerRegistry::standard())
    }

    pub fn with_registry(ctx: Arc<EngineContext>, registry: HandlerRegistry) -> Self {
        let driver = Arc::new(MigrationDriver::new(ctx.clone(), registry));
        Self {
            compiler: Compiler::new(ctx.clone()),
            executor: Executor::new(ctx.clone(), driver.clone()),
            driver,
            ctx,
        }
    }

    pub fn in_memory(
        cloud: Arc<MemoryCloud>,
        store: Arc<MemoryStore>,
        config: EngineConfig,
    ) -> Self {
        Self::new(Arc::new(EngineContext::in_memory(cloud, store, config)))
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn driver(&self) -> &Arc<MigrationDriver> {
        &self.driver
    }

    pub fn compile(&self, request: &ProvisionRequest) -> Result<CompiledWorkflow> {
        self.compiler.compile(request)
    }

    pub fn compile_teardown(
        &self,
        scope: &Scope,
        resource_ids: &[Uuid],
    ) -> Result<CompiledWorkflow> {
        self.compiler.compile_teardown(scope, resource_ids)
    }

    pub async fn run(&self, workflow: &CompiledWorkflow) -> Result<TaskStatus> {
        self.executor.run(workflow).await
    }

    /// Current progress tree of one workflow
    pub fn report(&self, workflow_id: Uuid) -> Result<ProgressReport> {
        let tasks = self.ctx.tasks.tasks_for_workflow(workflow_id)?;
        let mut steps = Vec::new();
        for task in &tasks {
            if let Some(step) = self.ctx.migrations.step_for_task(task.id)? {
                steps.push(step);
            }
        }
        Ok(aggregate(&tasks, &steps))
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(self.ctx.clone(), self.driver.clone())
    }
}

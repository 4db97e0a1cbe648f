//! Task executor
//!
//! Runs a compiled workflow stage by stage. The nodes of one stage fan out
//! on a `JoinSet`, bounded by a semaphore sized from `workers`, and the
//! stage ends at a barrier once every node is terminal. A failed node lets
//! its siblings finish but stops the workflow at that barrier; resources of
//! the stages that never ran are released so a new request can reuse their
//! names. The number of finished stages is checkpointed after each barrier
//! so a re-run picks up where the last one stopped.

use crate::compiler::{CompiledWorkflow, MigrationPlan, NodeOp, Stage, TaskNode};
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::migration::MigrationDriver;
use crate::reconciler::{Reconciler, Validation};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use vpcflow_cloud::Scope;
use vpcflow_core::{ReportResource, TaskRecord, TaskStatus};

pub struct Executor {
    ctx: Arc<EngineContext>,
    runner: Arc<NodeRunner>,
}

impl Executor {
    pub fn new(ctx: Arc<EngineContext>, driver: Arc<MigrationDriver>) -> Self {
        let runner = Arc::new(NodeRunner {
            ctx: ctx.clone(),
            reconciler: Reconciler::new(ctx.clone()),
            driver,
        });
        Self { ctx, runner }
    }

    /// Run every remaining stage of `workflow`; returns the final workflow status
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.workflow_id))]
    pub async fn run(&self, workflow: &CompiledWorkflow) -> Result<TaskStatus> {
        let mut record = self.ctx.tasks.get_workflow(workflow.workflow_id)?;
        if record.status.is_terminal() {
            debug!(status = %record.status, "Workflow already finished");
            return Ok(record.status);
        }
        record.transition(TaskStatus::InProgress)?;
        self.ctx.tasks.update_workflow(&record)?;

        let semaphore = Arc::new(Semaphore::new(self.ctx.config.workers.max(1)));
        let resume_from = record.stages_finished;
        if resume_from > 0 {
            info!(stages_finished = resume_from, "Resuming workflow");
        }

        for (index, stage) in workflow.stages.iter().enumerate().skip(resume_from) {
            info!(stage = %stage.name, nodes = stage.nodes.len(), "Stage started");

            let mut set = JoinSet::new();
            for node in &stage.nodes {
                let runner = self.runner.clone();
                let semaphore = semaphore.clone();
                let scope = workflow.scope.clone();
                let node = node.clone();
                set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    runner.run_node(&scope, &node).await
                });
            }

            // barrier
            let mut failed = 0usize;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(true)) => {}
                    Ok(Ok(false)) => failed += 1,
                    Ok(Err(e)) => {
                        error!(stage = %stage.name, error = %e, "Task could not be recorded");
                        failed += 1;
                    }
                    Err(e) => {
                        error!(stage = %stage.name, error = %e, "Task panicked");
                        failed += 1;
                    }
                }
            }

            if failed > 0 {
                let mut record = self.ctx.tasks.get_workflow(workflow.workflow_id)?;
                record.message = Some(format!("{failed} task(s) failed in stage {}", stage.name));
                record.transition(TaskStatus::Failed)?;
                self.ctx.tasks.update_workflow(&record)?;
                warn!(stage = %stage.name, failed, "Workflow failed");
                self.release_undispatched(&workflow.stages[index + 1..])?;
                return Ok(TaskStatus::Failed);
            }

            self.ctx.tasks.checkpoint(workflow.workflow_id, index + 1)?;
            info!(stage = %stage.name, "Stage finished");
        }

        let mut record = self.ctx.tasks.get_workflow(workflow.workflow_id)?;
        record.transition(TaskStatus::Success)?;
        self.ctx.tasks.update_workflow(&record)?;
        info!("Workflow finished");
        Ok(TaskStatus::Success)
    }

    /// Give up the pending records of stages that will not run. Their tasks
    /// stay CREATED.
    fn release_undispatched(&self, stages: &[Stage]) -> Result<()> {
        for node in stages.iter().flat_map(|s| &s.nodes) {
            if matches!(node.op, NodeOp::Provision | NodeOp::Migrate(_)) {
                self.runner.reconciler.abandon(node.resource_id)?;
            }
        }
        Ok(())
    }
}

/// Everything a spawned node needs
struct NodeRunner {
    ctx: Arc<EngineContext>,
    reconciler: Reconciler,
    driver: Arc<MigrationDriver>,
}

impl NodeRunner {
    /// Run one node to a terminal task status. `Ok(false)` is a failed task;
    /// `Err` means the task record itself could not be read or written.
    async fn run_node(&self, scope: &Scope, node: &TaskNode) -> Result<bool> {
        let mut task = self.ctx.tasks.get_task(node.task_id)?;
        if task.status.is_terminal() {
            return Ok(task.status == TaskStatus::Success);
        }
        task.start()?;
        self.ctx.tasks.update_task(&task)?;
        debug!(kind = %node.kind, name = %node.name, op = ?node.op, "Task started");

        let result = match self.ctx.accounts.ensure_valid(&scope.account) {
            Err(e) => Err(e),
            Ok(()) => match &node.op {
                NodeOp::Validate => self.validate(scope, node).await,
                NodeOp::Provision => self.provision(node, &mut task).await,
                NodeOp::Update { config } => self
                    .reconciler
                    .update(node.resource_id, config)
                    .await
                    .map(|()| "updated".to_string()),
                NodeOp::Delete => self
                    .reconciler
                    .delete(node.resource_id)
                    .await
                    .map(|()| "deleted".to_string()),
                NodeOp::Migrate(plan) => match self.migrate(&task, plan).await {
                    Ok(status) => return Ok(status == TaskStatus::Success),
                    Err(e) => Err(e),
                },
            },
        };

        match result {
            Ok(message) => {
                task.succeed(message)?;
                info!(kind = %node.kind, name = %node.name, "Task succeeded");
            }
            Err(e) => {
                warn!(kind = %node.kind, name = %node.name, error = %e, "Task failed");
                if matches!(node.op, NodeOp::Validate | NodeOp::Migrate(_)) {
                    self.reconciler.abandon(node.resource_id)?;
                }
                task.fail(e.to_string())?;
            }
        }
        self.ctx.tasks.update_task(&task)?;
        Ok(task.status == TaskStatus::Success)
    }

    async fn validate(&self, scope: &Scope, node: &TaskNode) -> Result<String> {
        match self.reconciler.validate(node.kind, scope, &node.name).await? {
            Validation::Absent => Ok("name available".to_string()),
            Validation::Conflict(remote_id) => Err(EngineError::Conflict {
                kind: node.kind,
                name: node.name.clone(),
                remote_id,
            }),
        }
    }

    async fn provision(&self, node: &TaskNode, task: &mut TaskRecord) -> Result<String> {
        let remote = self.reconciler.create(node.resource_id).await?;
        task.report.resources.push(ReportResource {
            kind: node.kind.to_string(),
            name: node.name.clone(),
            remote_id: Some(remote.id.clone()),
        });
        Ok(format!("created {}", remote.id))
    }

    /// The driver finalizes the task record itself
    async fn migrate(&self, task: &TaskRecord, plan: &MigrationPlan) -> Result<TaskStatus> {
        let step = self.driver.begin(task, plan)?;
        let status = self.driver.run_to_completion(step.id).await?;
        debug!(step_id = %step.id, status = %status, "Migration returned");
        Ok(self.ctx.tasks.get_task(task.id)?.status)
    }
}

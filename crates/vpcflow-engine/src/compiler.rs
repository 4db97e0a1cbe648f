//! Workflow compiler
//!
//! Turns a [`ProvisionRequest`] into barrier-separated stages of task nodes.
//! Every cross-reference is resolved before anything is written, and all
//! resource records of a request land in one atomic batch insert, so a
//! failed compile leaves the repository untouched.

use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use vpcflow_cloud::{ResourceKind, Scope};
use vpcflow_core::{
    ImageSource, ProvisionRequest, RequestItem, ResourceRecord, ResourceStatus, TaskAction,
    TaskPhase, TaskRecord, WorkflowRecord,
};

pub const VALIDATION_STAGE: &str = "validation";

/// Provisioning stages in execution order
const STAGES: [(&str, &[ResourceKind]); 5] = [
    (
        "network",
        &[
            ResourceKind::Network,
            ResourceKind::SshKey,
            ResourceKind::DedicatedHost,
            ResourceKind::IkePolicy,
            ResourceKind::IpsecPolicy,
        ],
    ),
    (
        "subnet",
        &[
            ResourceKind::AddressPrefix,
            ResourceKind::PublicGateway,
            ResourceKind::Acl,
            ResourceKind::SecurityGroup,
        ],
    ),
    (
        "dependent",
        &[
            ResourceKind::Subnet,
            ResourceKind::Volume,
            ResourceKind::VpnGateway,
        ],
    ),
    (
        "workload",
        &[ResourceKind::Instance, ResourceKind::KubernetesCluster],
    ),
    (
        "connection",
        &[
            ResourceKind::LoadBalancer,
            ResourceKind::VpnConnection,
            ResourceKind::Route,
        ],
    ),
];

fn stage_index(kind: ResourceKind) -> Option<usize> {
    STAGES.iter().position(|(_, kinds)| kinds.contains(&kind))
}

/// Where a migrating instance's image comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ClassicSource {
    Instance { id: String, windows_backup: bool },
    Image { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationPlan {
    pub account: String,
    pub source: ClassicSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NodeOp {
    Validate,
    Provision,
    Migrate(MigrationPlan),
    /// Push a changed configuration to an existing resource
    Update {
        config: serde_json::Value,
    },
    Delete,
}

impl NodeOp {
    pub fn action(&self) -> TaskAction {
        match self {
            NodeOp::Validate | NodeOp::Provision | NodeOp::Migrate(_) => TaskAction::Add,
            NodeOp::Update { .. } => TaskAction::Update,
            NodeOp::Delete => TaskAction::Delete,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskNode {
    pub task_id: Uuid,
    pub resource_id: Uuid,
    pub kind: ResourceKind,
    pub name: String,
    pub op: NodeOp,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stage {
    pub name: String,
    pub phase: TaskPhase,
    pub nodes: Vec<TaskNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompiledWorkflow {
    pub workflow_id: Uuid,
    pub scope: Scope,
    pub stages: Vec<Stage>,
}

impl CompiledWorkflow {
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    pub fn node_count(&self) -> usize {
        self.stages.iter().map(|s| s.nodes.len()).sum()
    }
}

/// Resource the compiler is about to create
struct Pending<'a> {
    id: Uuid,
    item: RequestItem<'a>,
}

pub struct Compiler {
    ctx: Arc<EngineContext>,
}

impl Compiler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    #[instrument(skip_all, fields(scope = %request.scope))]
    pub fn compile(&self, request: &ProvisionRequest) -> Result<CompiledWorkflow> {
        let scope = &request.scope;
        let items = request.items();

        // Existing records stand in for provisioned items
        let mut batch: HashMap<(ResourceKind, String), Uuid> = HashMap::new();
        let mut pending = Vec::new();
        let mut updates = Vec::new();
        for item in items {
            if item.base.provisioned {
                let existing = self
                    .ready_record(item.kind, scope, item.name())?
                    .ok_or_else(|| EngineError::MissingReference {
                        kind: item.kind,
                        name: item.name().to_string(),
                        role: "provisioned item".to_string(),
                    })?;
                debug!(kind = %item.kind, name = %item.name(), "Using provisioned resource");
                batch.insert((item.kind, item.name().to_string()), existing.id);
                if !item.base.config.is_null() && item.base.config != existing.config {
                    updates.push((existing, item.base.config.clone()));
                }
                continue;
            }
            let key = (item.kind, item.name().to_string());
            if batch.contains_key(&key) {
                return Err(EngineError::Validation(format!(
                    "{} '{}' appears twice in the request",
                    item.kind,
                    item.name()
                )));
            }
            let id = Uuid::new_v4();
            batch.insert(key, id);
            pending.push(Pending { id, item });
        }

        // Resolve everything before materializing anything
        let mut records = Vec::with_capacity(pending.len());
        for Pending { id, item } in &pending {
            let mut builder = ResourceRecord::builder(item.kind, scope.clone(), item.name())
                .config(item.base.config.clone());
            for reference in &item.references {
                let target =
                    self.resolve(scope, &batch, reference.kind, &reference.name, &reference.role)?;
                builder = builder.reference(reference.role.clone(), target);
            }
            let mut record = builder.build();
            record.id = *id;
            records.push(record);
        }

        let mut provisioning: Vec<Stage> = STAGES
            .iter()
            .map(|(name, _)| Stage {
                name: name.to_string(),
                phase: TaskPhase::Provisioning,
                nodes: Vec::new(),
            })
            .collect();
        let mut validation = Stage {
            name: VALIDATION_STAGE.to_string(),
            phase: TaskPhase::Validation,
            nodes: Vec::new(),
        };

        for Pending { id, item } in &pending {
            let Some(index) = stage_index(item.kind) else {
                return Err(EngineError::Validation(format!(
                    "{} cannot be requested directly",
                    item.kind
                )));
            };
            let op = match item.image.and_then(migration_plan) {
                Some(plan) => NodeOp::Migrate(plan),
                None => NodeOp::Provision,
            };
            validation.nodes.push(TaskNode {
                task_id: Uuid::new_v4(),
                resource_id: *id,
                kind: item.kind,
                name: item.name().to_string(),
                op: NodeOp::Validate,
            });
            provisioning[index].nodes.push(TaskNode {
                task_id: Uuid::new_v4(),
                resource_id: *id,
                kind: item.kind,
                name: item.name().to_string(),
                op,
            });
        }
        for (record, config) in updates {
            let Some(index) = stage_index(record.kind) else {
                return Err(EngineError::Validation(format!(
                    "{} cannot be updated directly",
                    record.kind
                )));
            };
            provisioning[index].nodes.push(TaskNode {
                task_id: Uuid::new_v4(),
                resource_id: record.id,
                kind: record.kind,
                name: record.name,
                op: NodeOp::Update { config },
            });
        }

        let mut stages = vec![validation];
        stages.extend(provisioning);
        stages.retain(|stage| !stage.nodes.is_empty());

        self.ctx.resources.insert_resources(records)?;
        let workflow = self.materialize(scope, stages)?;

        info!(
            workflow_id = %workflow.workflow_id,
            stages = ?workflow.stage_names(),
            nodes = workflow.node_count(),
            "Compiled provisioning workflow"
        );
        Ok(workflow)
    }

    /// Delete nodes for existing resources, dependents first
    #[instrument(skip_all, fields(scope = %scope, resources = resource_ids.len()))]
    pub fn compile_teardown(
        &self,
        scope: &Scope,
        resource_ids: &[Uuid],
    ) -> Result<CompiledWorkflow> {
        let mut stages: Vec<Stage> = STAGES
            .iter()
            .rev()
            .map(|(name, _)| Stage {
                name: format!("teardown-{name}"),
                phase: TaskPhase::Provisioning,
                nodes: Vec::new(),
            })
            .collect();

        for id in resource_ids {
            let record = self.ctx.resources.get_resource(*id)?;
            if record.scope != *scope {
                return Err(EngineError::Validation(format!(
                    "{} '{}' belongs to {}, not {}",
                    record.kind, record.name, record.scope, scope
                )));
            }
            if record.status != ResourceStatus::Created {
                return Err(EngineError::Validation(format!(
                    "{} '{}' is {} and cannot be deleted",
                    record.kind, record.name, record.status
                )));
            }
            let Some(index) = stage_index(record.kind) else {
                return Err(EngineError::Validation(format!(
                    "{} cannot be torn down directly",
                    record.kind
                )));
            };
            stages[STAGES.len() - 1 - index].nodes.push(TaskNode {
                task_id: Uuid::new_v4(),
                resource_id: record.id,
                kind: record.kind,
                name: record.name,
                op: NodeOp::Delete,
            });
        }
        stages.retain(|stage| !stage.nodes.is_empty());

        let workflow = self.materialize(scope, stages)?;
        info!(
            workflow_id = %workflow.workflow_id,
            stages = ?workflow.stage_names(),
            "Compiled teardown workflow"
        );
        Ok(workflow)
    }

    fn resolve(
        &self,
        scope: &Scope,
        batch: &HashMap<(ResourceKind, String), Uuid>,
        kind: ResourceKind,
        name: &str,
        role: &str,
    ) -> Result<Uuid> {
        let missing = || EngineError::MissingReference {
            kind,
            name: name.to_string(),
            role: role.to_string(),
        };
        if name.is_empty() {
            return Err(missing());
        }
        if let Some(id) = batch.get(&(kind, name.to_string())) {
            return Ok(*id);
        }
        match self.ready_record(kind, scope, name)? {
            Some(record) => Ok(record.id),
            None => Err(missing()),
        }
    }

    /// Existing record another item may depend on: created, with a remote id
    fn ready_record(
        &self,
        kind: ResourceKind,
        scope: &Scope,
        name: &str,
    ) -> Result<Option<ResourceRecord>> {
        let record = self.ctx.resources.find_by(kind, scope, name)?;
        Ok(record.filter(|r| r.status == ResourceStatus::Created && r.remote_id.is_some()))
    }

    /// Persist the workflow record and one task record per node
    fn materialize(&self, scope: &Scope, stages: Vec<Stage>) -> Result<CompiledWorkflow> {
        let names = stages.iter().map(|s| s.name.clone()).collect();
        let workflow = WorkflowRecord::new(scope.clone(), names);

        let mut tasks = Vec::new();
        for stage in &stages {
            for node in &stage.nodes {
                let mut task = TaskRecord::new(
                    workflow.id,
                    stage.phase,
                    stage.name.clone(),
                    node.kind,
                    node.name.clone(),
                    node.op.action(),
                    Some(node.resource_id),
                );
                task.id = node.task_id;
                tasks.push(task);
            }
        }

        self.ctx.tasks.insert_workflow(&workflow)?;
        self.ctx.tasks.insert_tasks(&tasks)?;

        Ok(CompiledWorkflow {
            workflow_id: workflow.id,
            scope: scope.clone(),
            stages,
        })
    }
}

fn migration_plan(image: &ImageSource) -> Option<MigrationPlan> {
    match image {
        ImageSource::Catalog { .. } => None,
        ImageSource::ClassicInstance {
            account,
            instance_id,
            windows_backup,
        } => Some(MigrationPlan {
            account: account.clone(),
            source: ClassicSource::Instance {
                id: instance_id.clone(),
                windows_backup: *windows_backup,
            },
        }),
        ImageSource::ClassicImage { account, image_id } => Some(MigrationPlan {
            account: account.clone(),
            source: ClassicSource::Image {
                id: image_id.clone(),
            },
        }),
    }
}

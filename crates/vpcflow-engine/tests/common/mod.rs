use std::sync::Arc;
use uuid::Uuid;
use vpcflow_cloud::{MemoryCloud, Scope};
use vpcflow_config::EngineConfig;
use vpcflow_core::{
    ImageSource, InstanceSpec, InterfaceSpec, ItemBase, MemoryStore, ProvisionRequest,
    ReportNode, ReportStatus, StandaloneSpec, SubnetSpec, TaskRecord, TaskRepository,
};
use vpcflow_engine::{CompiledWorkflow, Engine, MigrationPlan, NodeOp};

pub const CLASSIC_ACCOUNT: &str = "classic-1";

pub struct Harness {
    pub cloud: Arc<MemoryCloud>,
    pub store: Arc<MemoryStore>,
    pub engine: Arc<Engine>,
}

impl Harness {
    pub fn new(latency: u32) -> Self {
        Self::with_config(latency, config())
    }

    pub fn with_config(latency: u32, config: EngineConfig) -> Self {
        let cloud = Arc::new(MemoryCloud::new(latency));
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(Engine::in_memory(cloud.clone(), store.clone(), config));
        cloud.add_classic_instance("cci-1", "web-1", 2);
        Self {
            cloud,
            store,
            engine,
        }
    }

    pub fn tasks(&self, workflow: &CompiledWorkflow) -> Vec<TaskRecord> {
        self.store.tasks_for_workflow(workflow.workflow_id).unwrap()
    }
}

pub fn config() -> EngineConfig {
    EngineConfig {
        poll_interval_secs: 0,
        sweep_interval_secs: 0,
        ..EngineConfig::default()
    }
}

pub fn scope() -> Scope {
    Scope::new("acct-1", "us-south")
}

pub fn classic_instance(name: &str, subnet: Option<&str>, windows_backup: bool) -> InstanceSpec {
    InstanceSpec {
        base: ItemBase::named(name),
        image: ImageSource::ClassicInstance {
            account: CLASSIC_ACCOUNT.to_string(),
            instance_id: "cci-1".to_string(),
            windows_backup,
        },
        interfaces: subnet
            .map(|subnet| {
                vec![InterfaceSpec {
                    name: "eth0".to_string(),
                    subnet: subnet.to_string(),
                    security_groups: Vec::new(),
                }]
            })
            .unwrap_or_default(),
        volumes: Vec::new(),
        ssh_keys: Vec::new(),
        dedicated_host: None,
    }
}

/// Network N, subnet S in N, instance I migrated from a classic instance
pub fn happy_request() -> ProvisionRequest {
    let mut request = ProvisionRequest::new(scope());
    request.network = Some(StandaloneSpec {
        base: ItemBase::named("vpc-a"),
    });
    request.subnets.push(SubnetSpec {
        base: ItemBase::named("subnet-a"),
        network: Some("vpc-a".to_string()),
        ..Default::default()
    });
    request
        .instances
        .push(classic_instance("web-1", Some("subnet-a"), false));
    request
}

pub fn task<'a>(tasks: &'a [TaskRecord], stage: &str, name: &str) -> &'a TaskRecord {
    tasks
        .iter()
        .find(|t| t.stage == stage && t.name == name)
        .unwrap_or_else(|| panic!("no task {name} in stage {stage}"))
}

/// Migration plan and task id of the first migrate node
#[allow(dead_code)]
pub fn migrate_node(workflow: &CompiledWorkflow) -> (Uuid, MigrationPlan) {
    workflow
        .stages
        .iter()
        .flat_map(|s| &s.nodes)
        .find_map(|n| match &n.op {
            NodeOp::Migrate(plan) => Some((n.task_id, plan.clone())),
            _ => None,
        })
        .unwrap()
}

/// Every terminal node in a report tree, keyed by path
#[allow(dead_code)]
pub fn terminal_nodes(node: &ReportNode, path: &str, out: &mut Vec<(String, ReportStatus)>) {
    if node.status.is_terminal() {
        out.push((path.to_string(), node.status));
    }
    for (name, child) in &node.steps {
        terminal_nodes(child, &format!("{path} > {name}"), out);
    }
}

#[allow(dead_code)]
pub fn node_at<'a>(node: &'a ReportNode, keys: &[&str]) -> Option<&'a ReportNode> {
    keys.iter().try_fold(node, |node, key| node.steps.get(*key))
}

use anyhow::Context;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use vpcflow_cloud::MemoryCloud;
use vpcflow_config::EngineConfig;
use vpcflow_core::MemoryStore;
use vpcflow_engine::{Engine, NodeOp};

/// Compile against an empty store; nothing is persisted
pub fn handle(config: &EngineConfig, request_path: &Path, json: bool) -> anyhow::Result<()> {
    let request = vpcflow_core::load_request(request_path)
        .with_context(|| format!("failed to load request {}", request_path.display()))?;

    let engine = Engine::in_memory(
        Arc::new(MemoryCloud::new(0)),
        Arc::new(MemoryStore::new()),
        config.clone(),
    );
    let workflow = engine.compile(&request).context("compilation failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflow)?);
        return Ok(());
    }

    println!(
        "{} {} ({} tasks)",
        "Plan for".bold(),
        workflow.scope.to_string().cyan(),
        workflow.node_count()
    );
    for (index, stage) in workflow.stages.iter().enumerate() {
        println!();
        println!("{}. {}", index + 1, stage.name.green().bold());
        for node in &stage.nodes {
            let op = match &node.op {
                NodeOp::Validate => "validate".to_string(),
                NodeOp::Provision => "create".to_string(),
                NodeOp::Update { .. } => "update".to_string(),
                NodeOp::Delete => "delete".to_string(),
                NodeOp::Migrate(plan) => format!("migrate from {}", plan.account),
            };
            println!("   {} {}/{}", op.yellow(), node.kind, node.name);
        }
    }
    Ok(())
}

use super::{print_report, seed_classic_sources, state_file};
use anyhow::Context;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use vpcflow_cloud::MemoryCloud;
use vpcflow_config::EngineConfig;
use vpcflow_core::ReportStatus;
use vpcflow_engine::Engine;

pub async fn handle(
    config: EngineConfig,
    request_path: &Path,
    latency: u32,
    fail_capture: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let request = vpcflow_core::load_request(request_path)
        .with_context(|| format!("failed to load request {}", request_path.display()))?;

    let state = state_file(&config);
    let store = Arc::new(state.load_store().await.context("failed to load saved state")?);

    let cloud = Arc::new(MemoryCloud::new(latency));
    seed_classic_sources(&cloud, &request);
    for instance_id in fail_capture {
        cloud.fail_capture(instance_id);
    }

    let engine = Engine::in_memory(cloud, store.clone(), config);
    let workflow = engine.compile(&request).context("compilation failed")?;
    info!(workflow_id = %workflow.workflow_id, stages = ?workflow.stage_names(), "Compiled");

    let sweeper = engine.sweeper().start();
    let outcome = engine.run(&workflow).await;
    sweeper.shutdown().await;

    // save whatever happened before reporting errors
    state.save(&store).await.context("failed to save state")?;
    let status = outcome.context("workflow execution failed")?;

    let report = engine.report(workflow.workflow_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} {} {}",
            "Workflow".bold(),
            workflow.workflow_id.to_string().cyan(),
            status.to_string().bold()
        );
        print_report(&report);
        println!();
        println!("State saved to {}", state.path().display().to_string().dimmed());
    }

    if report.overall() != ReportStatus::Success {
        anyhow::bail!("workflow finished {}", report.overall());
    }
    Ok(())
}

use super::{print_report, state_file, status_label};
use anyhow::Context;
use colored::Colorize;
use uuid::Uuid;
use vpcflow_config::EngineConfig;
use vpcflow_core::{MemoryStore, TaskRepository};
use vpcflow_engine::{ProgressReport, aggregate};

fn workflow_report(store: &MemoryStore, id: Uuid) -> anyhow::Result<ProgressReport> {
    let tasks = store.tasks_for_workflow(id)?;
    let task_ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
    let steps = store.steps_for_tasks(&task_ids);
    Ok(aggregate(&tasks, &steps))
}

pub async fn handle(
    config: &EngineConfig,
    workflow: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let state = state_file(config);
    if !state.exists() {
        println!("{}", "No saved state found.".yellow());
        println!("  {}", state.path().display().to_string().dimmed());
        return Ok(());
    }
    let store = state.load_store().await.context("failed to load saved state")?;

    let ids = match workflow {
        Some(id) => vec![Uuid::parse_str(id).with_context(|| format!("invalid workflow id {id}"))?],
        None => store.workflow_ids(),
    };

    let mut reports = Vec::new();
    for id in ids {
        let record = store
            .get_workflow(id)
            .with_context(|| format!("workflow {id} not found"))?;
        reports.push((record, workflow_report(&store, id)?));
    }

    if json {
        let out: Vec<_> = reports
            .iter()
            .map(|(record, report)| {
                serde_json::json!({
                    "workflow_id": record.id,
                    "status": record.status,
                    "report": report,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for (record, report) in &reports {
        println!(
            "{} {} [{}] {}",
            "Workflow".bold(),
            record.id.to_string().cyan(),
            record.scope,
            status_label(report.overall())
        );
        print_report(report);
        println!();
    }
    Ok(())
}

pub mod plan;
pub mod report;
pub mod simulate;
pub mod sweep;

use anyhow::Context;
use colored::{ColoredString, Colorize};
use std::path::Path;
use vpcflow_cloud::MemoryCloud;
use vpcflow_config::EngineConfig;
use vpcflow_core::{ImageSource, ProvisionRequest, ReportNode, ReportStatus, StateFile};
use vpcflow_engine::ProgressReport;

/// Explicit file if given, otherwise the usual search path with defaults as fallback
pub fn load_engine_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => vpcflow_config::load_config_from(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => vpcflow_config::load_config().context("failed to load config"),
    }
}

pub fn state_file(config: &EngineConfig) -> StateFile {
    StateFile::new(&config.state_dir)
}

/// Register every classic source the request migrates from
pub fn seed_classic_sources(cloud: &MemoryCloud, request: &ProvisionRequest) {
    for instance in &request.instances {
        match &instance.image {
            ImageSource::ClassicInstance { instance_id, .. } => {
                cloud.add_classic_instance(instance_id, &instance.base.name, 1);
            }
            ImageSource::ClassicImage { image_id, .. } => {
                cloud.add_classic_image(image_id, &instance.base.name, 1);
            }
            ImageSource::Catalog { .. } => {}
        }
    }
}

pub fn status_label(status: ReportStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        ReportStatus::Success => label.green(),
        ReportStatus::Failed => label.red(),
        ReportStatus::InProgress => label.yellow(),
        ReportStatus::Pending => label.dimmed(),
    }
}

pub fn print_report(report: &ProgressReport) {
    println!("{} {}", "Overall:".bold(), status_label(report.overall()));
    print_node("validation", &report.validation, 1);
    print_node("provisioning", &report.provisioning, 1);
}

fn print_node(name: &str, node: &ReportNode, depth: usize) {
    let indent = "  ".repeat(depth);
    match &node.message {
        Some(message) => println!(
            "{indent}{} {} {}",
            name.cyan(),
            status_label(node.status),
            message.dimmed()
        ),
        None => println!("{indent}{} {}", name.cyan(), status_label(node.status)),
    }
    for resource in &node.resources {
        println!(
            "{indent}  ↳ {} {} {}",
            resource.kind,
            resource.name,
            resource.remote_id.as_deref().unwrap_or("-").dimmed()
        );
    }
    for (child, step) in &node.steps {
        print_node(child, step, depth + 1);
    }
}

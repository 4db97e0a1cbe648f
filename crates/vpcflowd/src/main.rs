mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "vpcflowd")]
#[command(
    about = "Provision VPC infrastructure and migrate classic workloads into it",
    long_about = None
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: VPCFLOW_CONFIG_PATH, ./vpcflow.yaml, ...)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a request and print its stages without running anything
    Plan {
        /// Request file (YAML or JSON)
        request: PathBuf,
        /// Print the compiled workflow as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compile and run a request against the in-memory cloud
    Simulate {
        /// Request file (YAML or JSON)
        request: PathBuf,
        /// Status checks each simulated operation stays in flight for
        #[arg(short, long, default_value = "1")]
        latency: u32,
        /// Classic instance ids whose image capture should fail
        #[arg(long = "fail-capture")]
        fail_capture: Vec<String>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print progress reports from saved state
    Report {
        /// Workflow id (default: every saved workflow)
        workflow: Option<String>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resume in-flight migrations from saved state
    Sweep {
        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if matches!(cli.command, Commands::Version) {
        println!("vpcflowd {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = commands::load_engine_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Plan { request, json } => commands::plan::handle(&config, &request, json),
        Commands::Simulate {
            request,
            latency,
            fail_capture,
            json,
        } => commands::simulate::handle(config, &request, latency, &fail_capture, json).await,
        Commands::Report { workflow, json } => {
            commands::report::handle(&config, workflow.as_deref(), json).await
        }
        Commands::Sweep { once } => commands::sweep::handle(config, once).await,
        Commands::Version => Ok(()),
    }
}

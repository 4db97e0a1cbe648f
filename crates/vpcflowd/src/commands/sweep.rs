use super::state_file;
use anyhow::Context;
use chrono::Utc;
use colored::Colorize;
use std::sync::Arc;
use tracing::info;
use vpcflow_cloud::MemoryCloud;
use vpcflow_config::EngineConfig;
use vpcflow_engine::Engine;

/// Resume in-flight migrations from saved state. The simulated cloud does not
/// survive between runs, so remote objects an earlier run created are unknown
/// here and their records end up failing.
pub async fn handle(config: EngineConfig, once: bool) -> anyhow::Result<()> {
    let state = state_file(&config);
    let store = Arc::new(state.load_store().await.context("failed to load saved state")?);
    let engine = Engine::in_memory(Arc::new(MemoryCloud::new(0)), store.clone(), config);
    let sweeper = engine.sweeper();

    if once {
        let summary = sweeper.sweep_once(Utc::now()).await?;
        state.save(&store).await.context("failed to save state")?;
        println!(
            "{} examined {}, resumed {}, finished {}",
            "Sweep:".bold(),
            summary.examined,
            summary.resumed.to_string().cyan(),
            summary.finished.to_string().green()
        );
        return Ok(());
    }

    let handle = sweeper.start();
    info!("Sweeper running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    handle.shutdown().await;
    state.save(&store).await.context("failed to save state")?;
    println!("{}", "Sweeper stopped, state saved.".green());
    Ok(())
}

use std::sync::Arc;

use anyhow::{Context, Result};
use copilot_core::{Brain, ChainCatalog, ChainConfig, CopilotRuntime, GatewayConfig};
use copilot_gateway::{router, AppState};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging Setup
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    info!("Copilot Gateway Initializing...");
    let config = GatewayConfig::from_env()?;

    // The Brain: chat model for the runtime, text generator for actions
    let brain = Arc::new(Brain::new(&config.llm));
    match brain.ping().await {
        Ok(msg) => info!("Brain Status: {}", msg),
        Err(e) => warn!("Brain is configured but unresponsive: {}", e),
    }

    // Remote chains, resolved once and shared by every request
    let chains = match &config.chains_path {
        Some(path) => {
            info!("Loading remote chains from {}...", path.display());
            let configs = ChainConfig::load_all(path).await?;
            ChainCatalog::resolve(configs)
                .await
                .context("Failed to resolve remote chains")?
        }
        None => ChainCatalog::default(),
    };
    info!("{} remote chain(s) available.", chains.len());

    let runtime = CopilotRuntime::new(brain.clone()).with_max_rounds(config.max_rounds);
    let state = AppState::new(runtime, brain, chains);
    let app = router(state);

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("Gateway listening on {}...", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

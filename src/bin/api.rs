use fan_vault_orchestrator::{
    api::start_server, chain::ChainAgent, config::AppConfig, orchestrator::ChatOrchestrator,
    store::build_store,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    dotenv::dotenv().ok();

    let config = AppConfig::from_env()?;

    info!("Fan Vault Orchestrator - API Server");
    info!("Port: {}", config.port);

    let store = build_store(config.database_url.as_deref())?;
    let agent = Arc::new(ChainAgent::new(&config.private_key, &config.rpc_url)?);
    info!("Agent wallet: {}", agent.address());

    let orchestrator = Arc::new(ChatOrchestrator::new(
        config.gemini_api_key.clone(),
        agent,
        store,
    ));

    info!("Orchestrator initialized, starting API server");

    start_server(orchestrator, config.port).await?;

    Ok(())
}

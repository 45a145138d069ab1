use financial_event_pipeline::{
    api::{start_server, ApiState},
    classifier::KeywordIntentClassifier,
    config::PipelineConfig,
    gemini::GeminiClient,
    pipeline::PipelineDeps,
    state::{spawn_cleanup, InMemorySessionStore, SessionStore},
    tools::create_default_registry,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PipelineConfig::from_env()?;

    if config.gemini_api_key.is_empty() {
        warn!("GEMINI_API_KEY not set, replies will use templated fallbacks");
    }

    info!("Financial Event Pipeline - API Server");
    info!(
        port = config.api_port,
        queue_capacity = config.queue_capacity,
        aggregation_deadline = ?config.aggregation_deadline,
        "Configuration loaded"
    );

    // Create components
    let deps = PipelineDeps {
        classifier: Arc::new(KeywordIntentClassifier),
        tools: Arc::new(create_default_registry(&config)?),
        completion: Arc::new(GeminiClient::new(config.gemini_api_key.clone())?),
    };
    let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new(config.session_timeout));

    let port = config.api_port;
    let cleanup_interval = config.session_cleanup_interval;
    let state = ApiState::new(config, deps, Arc::clone(&sessions)).await?;
    let bus = Arc::clone(&state.bus);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cleanup = spawn_cleanup(sessions, cleanup_interval, shutdown_rx);

    info!("Pipeline initialized, starting API server");

    start_server(state, port, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for shutdown signal");
        }
        info!("Shutdown signal received");
    })
    .await?;

    shutdown_tx.send_replace(true);
    cleanup.await?;
    bus.stop().await;

    info!("Shutdown complete");
    Ok(())
}

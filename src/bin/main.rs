use financial_event_pipeline::{
    adapters::{AdapterManager, ConsoleAdapter},
    bus::EventBus,
    classifier::KeywordIntentClassifier,
    config::PipelineConfig,
    gemini::GeminiClient,
    models::EventType,
    pipeline::{register_pipeline, PipelineDeps},
    state::{InMemorySessionStore, SessionStore},
    tools::create_default_registry,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_QUERY: &str = "I want a high-risk growth investment";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PipelineConfig::from_env()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let query = if args.is_empty() {
        DEFAULT_QUERY.to_string()
    } else {
        args.join(" ")
    };

    info!("Financial Event Pipeline starting");

    // Create components
    let bus = EventBus::from_config(&config);
    let deps = PipelineDeps {
        classifier: Arc::new(KeywordIntentClassifier),
        tools: Arc::new(create_default_registry(&config)?),
        completion: Arc::new(GeminiClient::new(config.gemini_api_key.clone())?),
    };
    let coordinator = register_pipeline(&bus, deps, &config).await;

    let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new(config.session_timeout));
    let manager = Arc::new(AdapterManager::new(
        sessions,
        bus.publisher(),
        config.conversation_history_limit,
    ));
    let (console, mut replies) = ConsoleAdapter::new();
    manager.register_adapter(Arc::new(console)).await;
    bus.subscribe(EventType::ChatResponse, manager.clone()).await;

    bus.start().await?;

    info!(query = %query, "Running query through the pipeline");
    let session_id = manager
        .process_incoming_message(ConsoleAdapter::PLATFORM, "demo", &query)
        .await?;

    let outcome = tokio::time::timeout(config.response_timeout, replies.recv()).await;

    let pending = coordinator.pending_count().await;
    let stats = bus.stats();
    bus.stop().await;

    match outcome {
        Ok(Some(_)) => {
            info!(session_id = %session_id, ?stats, "Pipeline run complete");
            Ok(())
        }
        _ => {
            eprintln!(
                "No response for {} within {:?} ({} aggregation(s) still pending)",
                session_id, config.response_timeout, pending
            );
            Err("pipeline did not respond in time".into())
        }
    }
}

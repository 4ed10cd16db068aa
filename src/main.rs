//! Chat streaming core: threads, messages, and streaming agent invocations
//! over a small HTTP surface.

mod agents;
mod api;
mod config;
mod coordinator;
mod db;
mod error;
mod registry;

use std::net::SocketAddr;
use std::sync::Arc;

use api::{create_router, AppState};
use config::Config;
use db::Database;
use registry::{DistributedRegistry, LocalRegistry, RedisPubSub, StreamRegistry};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_core=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();

    tracing::info!(path = %config.db_path, "opening database");
    let db = Database::open(&config.db_path)?;

    let registry: Arc<dyn StreamRegistry> = match &config.redis_url {
        Some(url) => {
            tracing::info!("using distributed stream registry (redis)");
            let pubsub = RedisPubSub::new(url, "chat-core:stream-signals")?;
            DistributedRegistry::new(pubsub, config.registry_ttl)
        }
        None => {
            tracing::info!("using in-process stream registry");
            LocalRegistry::new(config.registry_ttl)
        }
    };

    let (llm, embeddings, retrieval): (
        Arc<dyn agents::providers::LlmProvider>,
        Arc<dyn agents::providers::EmbeddingsProvider>,
        Arc<dyn agents::providers::RetrievalProvider>,
    ) = match &config.anthropic_api_key {
        Some(key) => (
            Arc::new(agents::providers::AnthropicStreamingProvider::new(
                key.clone(),
                config.anthropic_model.clone(),
                config.llm_timeout,
            )),
            Arc::new(agents::providers::MockEmbeddingsProvider { dimension: 3072 }),
            Arc::new(agents::providers::MockRetrievalProvider { passages: vec![] }),
        ),
        None => {
            tracing::warn!("ANTHROPIC_API_KEY not configured; falling back to a scripted mock provider");
            (
                Arc::new(agents::providers::MockLlmProvider::scripted([
                    "No LLM provider is configured.",
                ])),
                Arc::new(agents::providers::MockEmbeddingsProvider { dimension: 3072 }),
                Arc::new(agents::providers::MockRetrievalProvider { passages: vec![] }),
            )
        }
    };

    let state = AppState::new(db, registry, llm, embeddings, retrieval, config.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state).layer(cors).layer(compression);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("chat-core listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

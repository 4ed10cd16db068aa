//! HTTP API for the chat streaming core.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;

use crate::agents::providers::{EmbeddingsProvider, LlmProvider, RetrievalProvider};
use crate::coordinator::Coordinator;
use crate::db::Database;
use crate::registry::StreamRegistry;
use std::sync::Arc;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub db: Database,
}

impl AppState {
    pub fn new(
        db: Database,
        registry: Arc<dyn StreamRegistry>,
        llm: Arc<dyn LlmProvider>,
        embeddings: Arc<dyn EmbeddingsProvider>,
        retrieval: Arc<dyn RetrievalProvider>,
        config: crate::config::Config,
    ) -> Self {
        let coordinator = Coordinator::new(db.clone(), registry, llm, embeddings, retrieval, config);
        Self { coordinator, db }
    }
}

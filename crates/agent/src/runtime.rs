//! Wiring: build the orchestrator and ingestor from configuration.
//!
//! The HTTP gateway and the CLI both start from here so a turn behaves the
//! same whichever surface it arrives on.

use crate::context::{ContextAssembler, TokenBudget};
use crate::ingest::DocumentIngestor;
use crate::pipeline::ContextPipeline;
use crate::retrieval::{Retriever, RetrieverConfig};
use crate::turn::{GenerationSettings, TurnOrchestrator};
use std::sync::Arc;
use threadline_config::{AppConfig, ContextConfig};
use threadline_core::provider::Provider;
use threadline_core::store::Store;

impl From<&ContextConfig> for TokenBudget {
    fn from(config: &ContextConfig) -> Self {
        Self {
            total: config.token_budget,
            response_reserve: config.response_reserve,
            window_size: config.window_size,
        }
    }
}

impl From<&ContextConfig> for RetrieverConfig {
    fn from(config: &ContextConfig) -> Self {
        Self {
            max_chunks: config.max_retrieval_chunks,
            fallback_per_document: config.fallback_chunks_per_document,
        }
    }
}

impl From<&AppConfig> for GenerationSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            model: config
                .providers
                .get(&config.default_provider)
                .and_then(|p| p.default_model.clone())
                .unwrap_or_else(|| config.default_model.clone()),
            temperature: config.default_temperature,
            max_tokens: config.default_max_tokens,
            history_window: config.context.window_size,
        }
    }
}

/// The services every surface shares.
#[derive(Clone)]
pub struct Runtime {
    pub store: Arc<dyn Store>,
    pub orchestrator: Arc<TurnOrchestrator>,
    pub ingestor: Arc<DocumentIngestor>,
}

impl Runtime {
    pub fn new(config: &AppConfig, store: Arc<dyn Store>, provider: Arc<dyn Provider>) -> Self {
        let retriever = Arc::new(Retriever::new(
            store.clone(),
            RetrieverConfig::from(&config.context),
        ));
        let pipeline = ContextPipeline::new(
            retriever,
            ContextAssembler::new(TokenBudget::from(&config.context)),
            config.context.utc_offset_minutes,
        );
        let orchestrator = Arc::new(TurnOrchestrator::new(
            store.clone(),
            pipeline,
            provider,
            GenerationSettings::from(config),
        ));
        let ingestor = Arc::new(DocumentIngestor::new(store.clone(), &config.documents));

        Self {
            store,
            orchestrator,
            ingestor,
        }
    }
}

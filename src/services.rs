//! Composition root: builds every capability client once from [`Config`]
//! and wires them into the chat engine and the ingestor.
//!
//! Nothing here is process-global. The server and the CLI each call
//! [`Services::from_config`] and pass the result down.

use std::sync::Arc;

use anyhow::Result;
use patrika_assist_core::embedding::EmbeddingGateway;
use patrika_assist_core::models::MetadataFilter;
use patrika_assist_core::store::memory::InMemoryIndex;
use patrika_assist_core::store::VectorIndex;

use crate::agents::ResponseAssembler;
use crate::config::Config;
use crate::dispatcher::ChatEngine;
use crate::embedding::create_gateway;
use crate::generation::{create_generator, GenerationParams, TextGenerator};
use crate::ingest::Ingestor;
use crate::pinecone::LazyPineconeIndex;
use crate::retriever::Retriever;
use crate::router::{DisabledClassifier, IntentClassifier, IntentRouter, LlmClassifier};

#[derive(Clone)]
pub struct Services {
    pub engine: ChatEngine,
    pub ingestor: Ingestor,
}

impl Services {
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder = create_gateway(&config.embedding)?;
        let index = create_index(config);
        let generator = create_generator(&config.generation)?;
        tracing::info!(
            embedding = %config.embedding.provider,
            index = %config.index.provider,
            generation = %config.generation.provider,
            classifier = %config.classifier.provider,
            "services configured"
        );
        Ok(Self::assemble(config, embedder, index, generator))
    }

    /// Wire already-built capabilities. Tests use this with fakes.
    pub fn assemble(
        config: &Config,
        embedder: Arc<dyn EmbeddingGateway>,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        let params = GenerationParams::from_config(&config.generation);

        let classifier: Arc<dyn IntentClassifier> = match config.classifier.provider.as_str() {
            "llm" => Arc::new(LlmClassifier::new(Arc::clone(&generator), params)),
            _ => Arc::new(DisabledClassifier),
        };

        let mut retriever = Retriever::new(
            Arc::clone(&embedder),
            Arc::clone(&index),
            config.retrieval.top_k,
        );
        if let Some(source_type) = &config.retrieval.source_type {
            retriever =
                retriever.with_default_filter(MetadataFilter::new().eq("source_type", source_type.as_str()));
        }

        let engine = ChatEngine::new(
            IntentRouter::new(classifier),
            retriever,
            ResponseAssembler::new(params),
            generator,
        );
        let ingestor = Ingestor::new(embedder, index, &config.chunking, &config.ingest);
        Self { engine, ingestor }
    }
}

fn create_index(config: &Config) -> Arc<dyn VectorIndex> {
    match config.index.provider.as_str() {
        "pinecone" => Arc::new(LazyPineconeIndex::new(
            config.index.clone(),
            config.embedding.dims,
        )),
        _ => Arc::new(InMemoryIndex::new()),
    }
}

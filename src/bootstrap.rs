//! Wires configuration into a ready [`KnowledgeService`]. Every shared
//! component is built once here and handed out as an `Arc`.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{Catalog, MemoryCatalog, MySqlCatalog};
use crate::chunker::Chunker;
use crate::config::Config;
use crate::external::{BackendKind, Embedder, LanguageModel, OllamaEmbedder, OllamaLlm, QdrantBackend};
use crate::processor::DocumentProcessor;
use crate::rag::RagRetriever;
use crate::service::{KnowledgeService, ServiceSettings};
use crate::store::{LocalBackend, VectorBackend, VectorStore};
use crate::template::TemplateEngine;

#[derive(Debug, Clone, Copy, Default)]
pub struct BootOptions {
    /// Contact Ollama at startup to load the embedding model and verify the LLM.
    pub load_models: bool,
}

pub async fn build_catalog(config: &Config) -> Result<Arc<dyn Catalog>> {
    if let Some(url) = &config.catalog.database_url {
        let catalog = MySqlCatalog::connect(url, config.catalog.max_connections).await?;
        return Ok(Arc::new(catalog));
    }

    match &config.catalog.seed_path {
        Some(path) => Ok(Arc::new(MemoryCatalog::from_file(Path::new(path))?)),
        None => {
            tracing::warn!("No DATABASE_URL or CATALOG_SEED_PATH set, using an empty catalog");
            Ok(Arc::new(MemoryCatalog::new()))
        }
    }
}

fn build_backend(config: &Config, dimension: Option<usize>) -> Result<Arc<dyn VectorBackend>> {
    match config.vector_db.backend {
        BackendKind::Local => {
            let backend = LocalBackend::open(&config.vector_db.path)
                .with_context(|| format!("opening vector store at {}", config.vector_db.path))?;
            Ok(Arc::new(backend))
        }
        BackendKind::Qdrant => {
            let mut qdrant = config.vector_db.clone();
            if let Some(dimension) = dimension {
                if dimension != qdrant.vector_size {
                    tracing::warn!(
                        configured = qdrant.vector_size,
                        model = dimension,
                        "Using the embedding model's dimension for Qdrant collections"
                    );
                }
                qdrant.vector_size = dimension;
            }
            Ok(Arc::new(QdrantBackend::new(qdrant)?))
        }
    }
}

pub async fn build_service(config: &Config, options: BootOptions) -> Result<KnowledgeService> {
    let embedder = OllamaEmbedder::new(config.embedding.clone())?;
    let llm = OllamaLlm::new(config.llm.clone())?;

    if options.load_models {
        embedder.load().await.context("loading embedding model")?;
        llm.load().await.context("loading LLM model")?;
    }

    let backend = build_backend(config, embedder.dimension())?;
    let embedder: Arc<dyn Embedder> = Arc::new(embedder);
    let llm: Arc<dyn LanguageModel> = Arc::new(llm);

    let store = Arc::new(VectorStore::new(
        backend,
        embedder,
        config.vector_db.collection_name.clone(),
        Duration::from_secs(config.vector_db.timeout_secs),
    ));

    let chunker = Chunker::from_tokens(config.processing.chunk_size, config.processing.chunk_overlap);
    let processor = Arc::new(DocumentProcessor::new(
        store.clone(),
        chunker,
        config.processing.min_text_length,
    ));
    let retriever = Arc::new(RagRetriever::new(store));
    let templates = Arc::new(TemplateEngine::new(
        llm.clone(),
        retriever.clone(),
        config.llm.fill_temperature,
        config.processing.top_k,
    ));
    let catalog = build_catalog(config).await?;

    tracing::info!(
        backend = ?config.vector_db.backend,
        collection = %config.vector_db.collection_name,
        "Knowledge service ready"
    );

    Ok(KnowledgeService::new(
        catalog,
        processor,
        retriever,
        templates,
        llm,
        ServiceSettings {
            top_k: config.processing.top_k,
            context_max_chars: config.processing.context_max_chars,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_ollama(dir: &Path) -> Config {
        let mut config = Config::from_env().unwrap();
        config.embedding.host = "127.0.0.1".to_string();
        config.embedding.port = 1;
        config.embedding.timeout_secs = 5;
        config.llm.host = "127.0.0.1".to_string();
        config.llm.port = 1;
        config.llm.timeout_secs = 5;
        config.vector_db.backend = BackendKind::Local;
        config.vector_db.path = dir.join("vectors").display().to_string();
        config.catalog.database_url = None;
        config.catalog.seed_path = None;
        config
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_unreachable_ollama_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let config = unreachable_ollama(dir.path());

        let result = build_service(&config, BootOptions { load_models: true }).await;
        let err = result.err().unwrap();
        assert!(format!("{:#}", err).contains("loading embedding model"));
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_startup_without_loading_models() {
        let dir = tempfile::tempdir().unwrap();
        let config = unreachable_ollama(dir.path());

        assert!(build_service(&config, BootOptions::default()).await.is_ok());
    }
}

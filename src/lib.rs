pub mod api;
pub mod bootstrap;
pub mod catalog;
pub mod chunker;
pub mod config;
pub mod error;
pub mod external;
pub mod extract;
pub mod processor;
pub mod rag;
pub mod service;
pub mod store;
pub mod template;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{Catalog, DocumentStatus, MemoryCatalog, MySqlCatalog, TemplateRecord};
pub use chunker::Chunker;
pub use config::Config;
pub use error::KnowledgeError;
pub use external::{Embedder, ExternalError, LanguageModel, OllamaEmbedder, OllamaLlm};
pub use processor::DocumentProcessor;
pub use rag::RagRetriever;
pub use service::KnowledgeService;
pub use store::{Partition, VectorStore};
pub use template::TemplateEngine;

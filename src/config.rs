use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

use crate::external::{BackendKind, EmbeddingConfig, LLMConfig, VectorDBConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Chunk window, in tokens.
    pub chunk_size: usize,
    /// Overlap between consecutive chunks, in tokens.
    pub chunk_overlap: usize,
    pub min_text_length: usize,
    pub top_k: usize,
    pub context_max_chars: usize,
    pub batch_size: usize,
    pub max_concurrent_requests: usize,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// MySQL connection string; without it an in-memory catalog is used.
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// JSON seed for the in-memory catalog.
    pub seed_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub embedding: EmbeddingConfig,
    pub llm: LLMConfig,
    pub vector_db: VectorDBConfig,
    pub processing: ProcessingConfig,
    pub catalog: CatalogConfig,
    pub server: ServerConfig,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parses `key` when set; a value that does not parse is an error.
fn parsed_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid value '{}' for {}: {}", raw, key, e)),
        None => Ok(default),
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let ollama_host = var_or("OLLAMA_HOST", "localhost");
        let ollama_port: u16 = parsed_or("OLLAMA_PORT", 11434)?;

        let embedding = EmbeddingConfig {
            model: var_or("OLLAMA_EMBEDDING_MODEL", "nomic-embed-text"),
            host: ollama_host.clone(),
            port: ollama_port,
            max_seq_length: parsed_or("EMBEDDING_MAX_SEQ_LENGTH", 512)?,
            batch_size: parsed_or("EMBEDDING_BATCH_SIZE", 32)?,
            timeout_secs: parsed_or("EMBEDDING_TIMEOUT_SECS", 60)?,
        };

        let llm = LLMConfig {
            model: var_or("OLLAMA_LLM_MODEL", "vistral"),
            host: ollama_host,
            port: ollama_port,
            temperature: parsed_or("OLLAMA_TEMPERATURE", 0.7)?,
            top_p: parsed_or("OLLAMA_TOP_P", 0.95)?,
            top_k: parsed_or("OLLAMA_TOP_K", 40)?,
            repeat_penalty: parsed_or("OLLAMA_REPEAT_PENALTY", 1.1)?,
            max_tokens: parsed_or("LLM_MAX_TOKENS", 2048)?,
            context_size: parsed_or("LLM_CONTEXT_SIZE", 4096)?,
            fill_temperature: parsed_or("LLM_FILL_TEMPERATURE", 0.3)?,
            timeout_secs: parsed_or("LLM_TIMEOUT_SECS", 120)?,
            max_concurrent_requests: parsed_or("LLM_MAX_CONCURRENT_REQUESTS", 1)?,
        };

        let vector_db = VectorDBConfig {
            backend: var_or("VECTOR_BACKEND", "local").parse()?,
            collection_name: var_or("VECTOR_COLLECTION", "ta_edu_knowledge"),
            host: var_or("QDRANT_HOST", "localhost"),
            port: parsed_or("QDRANT_PORT", 6334)?,
            vector_size: parsed_or("QDRANT_VECTOR_SIZE", 768)?,
            path: var_or("VECTOR_DB_PATH", "./data/vector_db"),
            timeout_secs: parsed_or("VECTOR_DB_TIMEOUT_SECS", 30)?,
        };

        let processing = ProcessingConfig {
            chunk_size: parsed_or("CHUNK_SIZE", 512)?,
            chunk_overlap: parsed_or("CHUNK_OVERLAP", 50)?,
            min_text_length: parsed_or("MIN_TEXT_LENGTH", 10)?,
            top_k: parsed_or("TOP_K_RESULTS", 5)?,
            context_max_chars: parsed_or("CONTEXT_MAX_CHARS", 2000)?,
            batch_size: parsed_or("BATCH_SIZE", 32)?,
            max_concurrent_requests: parsed_or("MAX_CONCURRENT_REQUESTS", 4)?,
            log_level: var_or("LOG_LEVEL", "info"),
        };

        let catalog = CatalogConfig {
            database_url: optional("DATABASE_URL"),
            max_connections: parsed_or("DATABASE_MAX_CONNECTIONS", 5)?,
            seed_path: optional("CATALOG_SEED_PATH"),
        };

        let server = ServerConfig {
            host: var_or("SERVER_HOST", "0.0.0.0"),
            port: parsed_or("SERVER_PORT", 8001)?,
            cors_origins: var_or("CORS_ORIGINS", "http://localhost:8000,http://localhost:3000")
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
        };

        Ok(Self {
            embedding,
            llm,
            vector_db,
            processing,
            catalog,
            server,
        })
    }

    pub fn uses_qdrant(&self) -> bool {
        self.vector_db.backend == BackendKind::Qdrant
    }
}

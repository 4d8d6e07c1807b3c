#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use mockall::mock;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ta_knowledge::catalog::MemoryCatalog;
use ta_knowledge::chunker::Chunker;
use ta_knowledge::external::embedding::normalize;
use ta_knowledge::external::{ChatMessage, Embedder, GenerationParams, LanguageModel, ModelInfo};
use ta_knowledge::processor::DocumentProcessor;
use ta_knowledge::rag::RagRetriever;
use ta_knowledge::service::{KnowledgeService, ServiceSettings};
use ta_knowledge::store::{LocalBackend, VectorStore};
use ta_knowledge::template::TemplateEngine;

mock! {
    pub Llm {}

    #[async_trait]
    impl LanguageModel for Llm {
        async fn complete(&self, prompt: &str, params: Option<GenerationParams>) -> Result<String>;
        async fn chat(&self, messages: &[ChatMessage], params: Option<GenerationParams>) -> Result<String>;
        fn info(&self) -> ModelInfo;
    }
}

const DIMENSION: usize = 128;

/// Bag-of-words embedder: each lowercase word bumps one hashed bucket.
pub struct HashEmbedder;

pub fn embed_words(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0; DIMENSION];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in word.to_lowercase().bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        vector[(hash % DIMENSION as u64) as usize] += 1.0;
    }
    normalize(vector)
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(embed_words(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| embed_words(t)).collect())
    }

    fn dimension(&self) -> Option<usize> {
        Some(DIMENSION)
    }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            model: "hash".to_string(),
            initialized: true,
            parameters: serde_json::Value::Null,
        }
    }
}

pub fn store(dir: &Path) -> Arc<VectorStore> {
    Arc::new(VectorStore::new(
        Arc::new(LocalBackend::open(dir).unwrap()),
        Arc::new(HashEmbedder),
        "ta_edu_knowledge",
        Duration::from_secs(5),
    ))
}

pub fn processor(store: Arc<VectorStore>, chunk_tokens: usize, overlap_tokens: usize) -> DocumentProcessor {
    DocumentProcessor::new(store, Chunker::from_tokens(chunk_tokens, overlap_tokens), 10)
}

pub fn service(dir: &Path, catalog: Arc<MemoryCatalog>, llm: MockLlm) -> KnowledgeService {
    let store = store(dir);
    let retriever = Arc::new(RagRetriever::new(store.clone()));
    let llm: Arc<dyn LanguageModel> = Arc::new(llm);
    let templates = Arc::new(TemplateEngine::new(llm.clone(), retriever.clone(), 0.3, 5));
    KnowledgeService::new(
        catalog,
        Arc::new(processor(store, 64, 8)),
        retriever,
        templates,
        llm,
        ServiceSettings::default(),
    )
}

/// Writes a zip archive with the given `(part name, content)` entries.
pub fn write_zip(path: &Path, parts: &[(&str, &str)]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    for (name, content) in parts {
        zip.start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

//! Request-level operations over the knowledge pipeline. Both the HTTP API
//! and the CLI go through [`KnowledgeService`].

pub mod schemas;

use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

use crate::catalog::{Catalog, DocumentRecord, DocumentStatus, StatusChange, TemplateRecord};
use crate::error::{KnowledgeError, Result};
use crate::external::{ChatRole, LanguageModel};
use crate::processor::{DocumentMetadata, DocumentProcessor};
use crate::rag::{Answer, ChatAnswer, RagRetriever};
use crate::store::{MetadataFilter, Partition};
use crate::template::{
    self, FillRequest, FilledTemplate, TemplateAnalysis, TemplateEngine, TemplatePreview,
};

pub use schemas::*;

pub const MAX_BATCH_DOCUMENTS: usize = 50;
pub const MAX_BATCH_FILL: usize = 10;
pub const MAX_QUERY_CHARS: usize = 500;
pub const MAX_TOP_K: usize = 20;

const DOCUMENT_LIST_LIMIT: usize = 1000;
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Results retrieved for `ask` when the request does not say.
    pub top_k: usize,
    pub context_max_chars: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            context_max_chars: 2000,
        }
    }
}

/// Accepted extraction: the immediate `processing` result plus the
/// background task that finishes it.
pub struct PendingExtraction {
    pub result: ExtractionResult,
    pub handle: JoinHandle<ExtractionResult>,
}

pub struct PendingBatch {
    pub response: BatchExtractionResponse,
    pub handles: Vec<JoinHandle<ExtractionResult>>,
}

#[derive(Clone)]
pub struct KnowledgeService {
    catalog: Arc<dyn Catalog>,
    processor: Arc<DocumentProcessor>,
    retriever: Arc<RagRetriever>,
    templates: Arc<TemplateEngine>,
    llm: Arc<dyn LanguageModel>,
    settings: ServiceSettings,
}

impl KnowledgeService {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        processor: Arc<DocumentProcessor>,
        retriever: Arc<RagRetriever>,
        templates: Arc<TemplateEngine>,
        llm: Arc<dyn LanguageModel>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            catalog,
            processor,
            retriever,
            templates,
            llm,
            settings,
        }
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn processor(&self) -> &Arc<DocumentProcessor> {
        &self.processor
    }

    pub fn retriever(&self) -> &Arc<RagRetriever> {
        &self.retriever
    }

    async fn require_user(&self, user_id: i64) -> Result<()> {
        if !self.catalog.user_exists(user_id).await? {
            return Err(KnowledgeError::NotFound(format!(
                "User với ID {} không tồn tại",
                user_id
            )));
        }
        Ok(())
    }

    async fn require_document(&self, document_id: i64) -> Result<DocumentRecord> {
        self.catalog.document(document_id).await?.ok_or_else(|| {
            KnowledgeError::NotFound(format!("Document với ID {} không tồn tại", document_id))
        })
    }

    async fn require_template(&self, template_id: i64) -> Result<TemplateRecord> {
        self.catalog.template(template_id).await?.ok_or_else(|| {
            KnowledgeError::NotFound(format!("Template với ID {} không tồn tại", template_id))
        })
    }

    async fn mark_processing(&self, document: &DocumentRecord) -> Result<()> {
        match self
            .catalog
            .transition_document_status(document.id, DocumentStatus::Processing)
            .await?
        {
            StatusChange::Applied { .. } => Ok(()),
            StatusChange::Rejected { current } => Err(KnowledgeError::Validation(format!(
                "Document {} không thể chuyển từ {} sang processing",
                document.id, current
            ))),
        }
    }

    fn spawn_extraction(
        &self,
        request: ExtractionRequest,
        document: DocumentRecord,
    ) -> JoinHandle<ExtractionResult> {
        let service = self.clone();
        tokio::spawn(async move { service.run_extraction(request, document).await })
    }

    /// Validates ownership, marks the document `processing` and finishes the
    /// extraction in a background task.
    pub async fn extract(&self, request: ExtractionRequest) -> Result<PendingExtraction> {
        self.require_user(request.user_id).await?;
        let document = self.require_document(request.document_id).await?;
        if document.owner_id != request.user_id {
            return Err(KnowledgeError::PermissionDenied(
                "Bạn không có quyền truy cập document này".to_string(),
            ));
        }

        self.mark_processing(&document).await?;

        let result = ExtractionResult::processing(document.id);
        let handle = self.spawn_extraction(request, document);
        Ok(PendingExtraction { result, handle })
    }

    /// Runs one extraction to completion and records `ready` or `error` in
    /// the catalog.
    pub async fn run_extraction(
        &self,
        request: ExtractionRequest,
        document: DocumentRecord,
    ) -> ExtractionResult {
        let started = Instant::now();
        let document_id = document.id;

        let mut metadata = DocumentMetadata::new(document_id);
        metadata.source = Some(document.original_name.clone());
        metadata.extra = request.metadata.clone();
        metadata = metadata
            .with("original_name", document.original_name.clone())
            .with("file_type", document.file_type.clone())
            .with("owner_name", document.owner_name.clone().unwrap_or_default())
            .with("owner_email", document.owner_email.clone().unwrap_or_default());

        let path = PathBuf::from(
            request
                .file_path
                .clone()
                .unwrap_or_else(|| document.file_path.clone()),
        );

        let outcome = self
            .processor
            .process_document(&path, request.user_id, metadata)
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        let (status, mut result) = match outcome {
            Ok(chunks) => {
                tracing::info!(document_id, chunks, elapsed, "Extraction finished");
                (
                    DocumentStatus::Ready,
                    ExtractionResult {
                        document_id,
                        status: DocumentStatus::Ready,
                        chunks_extracted: chunks,
                        error_message: None,
                        processing_time: None,
                    },
                )
            }
            Err(e) => {
                let err = KnowledgeError::Extraction {
                    document_id,
                    reason: format!("{:#}", e),
                };
                tracing::error!(error = %err, "Extraction failed");
                (
                    DocumentStatus::Error,
                    ExtractionResult::failed(document_id, err.to_string()),
                )
            }
        };
        result.processing_time = Some(elapsed);

        match self
            .catalog
            .transition_document_status(document_id, status)
            .await
        {
            Ok(StatusChange::Applied { .. }) => {}
            Ok(StatusChange::Rejected { current }) => {
                tracing::warn!(
                    document_id,
                    %current,
                    %status,
                    "Document is no longer processing, extraction status not recorded"
                );
            }
            Err(e) => {
                tracing::error!(document_id, %status, error = %e, "Could not record extraction status");
            }
        }

        result
    }

    /// Queues extraction of several of the user's documents. Missing or
    /// foreign documents are reported per item.
    pub async fn extract_batch(&self, request: BatchExtractionRequest) -> Result<PendingBatch> {
        if request.document_ids.is_empty() || request.document_ids.len() > MAX_BATCH_DOCUMENTS {
            return Err(KnowledgeError::Validation(format!(
                "document_ids phải có từ 1 đến {} phần tử",
                MAX_BATCH_DOCUMENTS
            )));
        }
        let unique: HashSet<i64> = request.document_ids.iter().copied().collect();
        if unique.len() != request.document_ids.len() {
            return Err(KnowledgeError::Validation(
                "Document IDs phải unique".to_string(),
            ));
        }

        self.require_user(request.user_id).await?;

        let mut results = Vec::with_capacity(request.document_ids.len());
        let mut handles = Vec::new();

        for &document_id in &request.document_ids {
            match self.queue_extraction(request.user_id, document_id).await {
                Ok((result, handle)) => {
                    handles.extend(handle);
                    results.push(result);
                }
                Err(e) => {
                    tracing::error!(document_id, error = %e, "Could not queue extraction");
                    results.push(ExtractionResult::failed(document_id, e.to_string()));
                }
            }
        }

        let successful = results
            .iter()
            .filter(|r| r.status != DocumentStatus::Error)
            .count();
        Ok(PendingBatch {
            response: BatchExtractionResponse {
                total: results.len(),
                successful,
                failed: results.len() - successful,
                results,
            },
            handles,
        })
    }

    async fn queue_extraction(
        &self,
        user_id: i64,
        document_id: i64,
    ) -> Result<(ExtractionResult, Option<JoinHandle<ExtractionResult>>)> {
        let Some(document) = self.catalog.document(document_id).await? else {
            return Ok((ExtractionResult::failed(document_id, "Document không tồn tại"), None));
        };
        if document.owner_id != user_id {
            return Ok((ExtractionResult::failed(document_id, "Không có quyền truy cập"), None));
        }

        self.mark_processing(&document).await?;
        let request = ExtractionRequest {
            user_id,
            document_id,
            file_path: None,
            metadata: Default::default(),
        };
        let handle = self.spawn_extraction(request, document);
        Ok((ExtractionResult::processing(document_id), Some(handle)))
    }

    pub async fn extraction_status(&self, document_id: i64) -> Result<ExtractionStatus> {
        let document = self.require_document(document_id).await?;
        let chunks_extracted = if document.status == DocumentStatus::Ready {
            self.retriever
                .document_chunk_count(document_id, document.owner_id)
                .await?
        } else {
            0
        };

        Ok(ExtractionStatus {
            document_id,
            status: document.status,
            chunks_extracted,
            original_name: document.original_name,
            created_at: document.created_at,
        })
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        let query_len = request.query.trim().chars().count();
        if query_len == 0 || request.query.chars().count() > MAX_QUERY_CHARS {
            return Err(KnowledgeError::Validation(format!(
                "query phải có từ 1 đến {} ký tự",
                MAX_QUERY_CHARS
            )));
        }
        if request.top_k == 0 || request.top_k > MAX_TOP_K {
            return Err(KnowledgeError::Validation(format!(
                "top_k phải nằm trong khoảng 1..={}",
                MAX_TOP_K
            )));
        }

        self.require_user(request.user_id).await?;

        let started = Instant::now();
        let user_id = match request.search_scope {
            SearchScope::User => Some(request.user_id),
            SearchScope::Global => None,
        };
        let filters = if request.filters.is_empty() {
            None
        } else {
            Some(MetadataFilter::from_map(&request.filters))
        };

        let results = self
            .retriever
            .search(&request.query, user_id, request.top_k, filters)
            .await?;

        Ok(SearchResponse {
            query: request.query,
            total_results: results.len(),
            results,
            search_time: started.elapsed().as_secs_f64(),
        })
    }

    pub async fn stats(&self, user_id: i64) -> Result<KnowledgeStats> {
        self.require_user(user_id).await?;

        let stats = self.retriever.user_stats(user_id).await?;
        let documents = self
            .catalog
            .user_documents(user_id, DOCUMENT_LIST_LIMIT)
            .await?;

        Ok(KnowledgeStats {
            user_id,
            total_documents: documents.len(),
            total_chunks: stats.total_chunks,
            global_chunks: stats.global_chunks,
            last_updated: Some(stats.last_updated),
            storage_used_mb: stats.storage_used_mb,
        })
    }

    /// Deletes the listed documents' knowledge, or all of it when no ids are
    /// given. Requires `confirm`.
    pub async fn delete_knowledge(
        &self,
        request: DeleteKnowledgeRequest,
    ) -> Result<DeleteKnowledgeResponse> {
        if !request.confirm {
            return Err(KnowledgeError::Validation(
                "Phải set confirm=true để xóa knowledge".to_string(),
            ));
        }

        self.require_user(request.user_id).await?;

        match request.document_ids.filter(|ids| !ids.is_empty()) {
            Some(ids) => {
                let deleted = self
                    .retriever
                    .delete_documents(request.user_id, &ids)
                    .await?;
                Ok(DeleteKnowledgeResponse {
                    message: format!("Đã xóa knowledge của {} documents", deleted),
                    success: true,
                    deleted,
                })
            }
            None => {
                let deleted = self.retriever.clear_user_knowledge(request.user_id).await?;
                Ok(DeleteKnowledgeResponse {
                    message: format!(
                        "Đã xóa toàn bộ knowledge của user {}",
                        request.user_id
                    ),
                    success: true,
                    deleted,
                })
            }
        }
    }

    pub async fn fill_template(&self, request: TemplateFillRequest) -> Result<FilledTemplate> {
        self.require_user(request.user_id).await?;
        let template = self.require_template(request.template_id).await?;
        if template.owner_id != request.user_id {
            return Err(KnowledgeError::PermissionDenied(
                "Bạn không có quyền sử dụng template này".to_string(),
            ));
        }

        let fill = FillRequest {
            user_id: request.user_id,
            question: request.question,
            context: request.context,
            use_rag: request.use_rag,
        };
        self.templates.fill(&template, &fill).await
    }

    /// Fills up to [`MAX_BATCH_FILL`] templates in order; failures are
    /// recorded per item.
    pub async fn batch_fill(&self, requests: Vec<TemplateFillRequest>) -> Result<BatchFillResponse> {
        if requests.len() > MAX_BATCH_FILL {
            return Err(KnowledgeError::Validation(format!(
                "Tối đa {} templates mỗi batch",
                MAX_BATCH_FILL
            )));
        }

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let template_id = request.template_id;
            let item = match self.fill_template(request).await {
                Ok(filled) => BatchFillItem {
                    success: true,
                    template_id,
                    result: Some(filled),
                    error: None,
                },
                Err(e) => {
                    tracing::error!(template_id, error = %e, "Batch fill item failed");
                    BatchFillItem {
                        success: false,
                        template_id,
                        result: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            results.push(item);
        }

        let successful = results.iter().filter(|r| r.success).count();
        Ok(BatchFillResponse {
            total: results.len(),
            successful,
            failed: results.len() - successful,
            results,
        })
    }

    pub fn analyze_template(&self, content: &str) -> TemplateAnalysis {
        template::analyze(content, None)
    }

    pub async fn preview_template(
        &self,
        template_id: i64,
        sample: &crate::store::Payload,
    ) -> Result<TemplatePreview> {
        let template = self.require_template(template_id).await?;
        Ok(template::preview(&template, sample))
    }

    pub fn common_variables(&self) -> CommonVariables {
        let variables = template::common_variables();
        CommonVariables {
            total: variables.len(),
            variables,
        }
    }

    /// Answers a free-form question from the user's knowledge.
    pub async fn ask(&self, request: AskRequest) -> Result<Answer> {
        if request.question.trim().is_empty() {
            return Err(KnowledgeError::Validation(
                "question không được để trống".to_string(),
            ));
        }
        let top_k = request.top_k.unwrap_or(self.settings.top_k);
        if top_k == 0 || top_k > MAX_TOP_K {
            return Err(KnowledgeError::Validation(format!(
                "top_k phải nằm trong khoảng 1..={}",
                MAX_TOP_K
            )));
        }

        self.require_user(request.user_id).await?;
        Ok(self
            .retriever
            .answer(
                self.llm.as_ref(),
                &request.question,
                request.user_id,
                top_k,
                self.settings.context_max_chars,
            )
            .await?)
    }

    /// Chunks of the user's knowledge at least `threshold` similar to `text`.
    pub async fn similar(&self, request: SimilarRequest) -> Result<SimilarResponse> {
        let text_len = request.text.trim().chars().count();
        if text_len == 0 || request.text.chars().count() > MAX_QUERY_CHARS {
            return Err(KnowledgeError::Validation(format!(
                "text phải có từ 1 đến {} ký tự",
                MAX_QUERY_CHARS
            )));
        }
        if request.top_k == 0 || request.top_k > MAX_TOP_K {
            return Err(KnowledgeError::Validation(format!(
                "top_k phải nằm trong khoảng 1..={}",
                MAX_TOP_K
            )));
        }
        if !(0.0..=1.0).contains(&request.threshold) {
            return Err(KnowledgeError::Validation(
                "threshold phải nằm trong khoảng 0..=1".to_string(),
            ));
        }

        self.require_user(request.user_id).await?;
        let results = self
            .retriever
            .find_similar(&request.text, request.user_id, request.top_k, request.threshold)
            .await?;

        Ok(SimilarResponse {
            total_results: results.len(),
            results,
        })
    }

    /// Multi-turn chat grounded in the user's knowledge.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatAnswer> {
        let ends_with_question = request
            .messages
            .last()
            .is_some_and(|m| m.role == ChatRole::User && !m.content.trim().is_empty());
        if !ends_with_question {
            return Err(KnowledgeError::Validation(
                "messages phải kết thúc bằng một câu hỏi của người dùng".to_string(),
            ));
        }
        let top_k = request.top_k.unwrap_or(self.settings.top_k);
        if top_k == 0 || top_k > MAX_TOP_K {
            return Err(KnowledgeError::Validation(format!(
                "top_k phải nằm trong khoảng 1..={}",
                MAX_TOP_K
            )));
        }

        self.require_user(request.user_id).await?;
        Ok(self
            .retriever
            .converse(
                self.llm.as_ref(),
                &request.messages,
                request.user_id,
                top_k,
                self.settings.context_max_chars,
            )
            .await?)
    }

    /// Component status; the service is `healthy` only if every component is.
    pub async fn health(&self) -> ServiceHealth {
        let mut components = BTreeMap::new();

        let llm = self.llm.info();
        components.insert(
            "llm".to_string(),
            if llm.initialized { "healthy" } else { "not initialized" }.to_string(),
        );

        let embeddings = self.retriever.store().embedder().info();
        components.insert(
            "embeddings".to_string(),
            if embeddings.initialized { "healthy" } else { "not initialized" }.to_string(),
        );

        let vector_store = match self.retriever.store().count(&Partition::Global, None).await {
            Ok(_) => "healthy".to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "Vector store health check failed");
                "unavailable".to_string()
            }
        };
        components.insert("vector_store".to_string(), vector_store);

        let catalog = match self.catalog.ping().await {
            Ok(()) => "healthy".to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "Catalog health check failed");
                "connection failed".to_string()
            }
        };
        components.insert("catalog".to_string(), catalog);

        let status = if components.values().all(|s| s == "healthy") {
            "healthy"
        } else {
            "degraded"
        };

        ServiceHealth {
            service: "ta-knowledge".to_string(),
            status: status.to_string(),
            components,
            timestamp: Utc::now(),
            version: SERVICE_VERSION.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::chunker::Chunker;
    use crate::external::llm::MockLanguageModel;
    use crate::external::ModelInfo;
    use crate::testing::{store_in, template};
    use tempfile::TempDir;

    fn document(id: i64, owner_id: i64, path: &str) -> DocumentRecord {
        DocumentRecord {
            id,
            filename: format!("{}.txt", id),
            original_name: format!("tai_lieu_{}.txt", id),
            file_path: path.to_string(),
            file_type: "txt".to_string(),
            status: DocumentStatus::Uploaded,
            owner_id,
            owner_name: Some("Cô Lan".to_string()),
            owner_email: None,
            created_at: None,
        }
    }

    fn service(dir: &TempDir, catalog: Arc<MemoryCatalog>, llm: MockLanguageModel) -> KnowledgeService {
        let store = store_in(&dir.path().join("vectors"));
        let retriever = Arc::new(RagRetriever::new(store.clone()));
        let processor = Arc::new(DocumentProcessor::new(store, Chunker::from_tokens(64, 8), 10));
        let llm: Arc<dyn LanguageModel> = Arc::new(llm);
        let templates = Arc::new(TemplateEngine::new(llm.clone(), retriever.clone(), 0.3, 5));
        KnowledgeService::new(
            catalog,
            processor,
            retriever,
            templates,
            llm,
            ServiceSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_extract_runs_in_background() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lich_thi.txt");
        std::fs::write(&path, "Lịch thi cuối kỳ môn Toán cao cấp vào ngày 20/12 tại phòng B203.").unwrap();

        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_document(document(3, 1, &path.display().to_string()));
        let service = service(&dir, catalog.clone(), MockLanguageModel::new());

        let pending = service
            .extract(ExtractionRequest {
                user_id: 1,
                document_id: 3,
                file_path: None,
                metadata: Default::default(),
            })
            .await
            .unwrap();
        assert_eq!(pending.result.status, DocumentStatus::Processing);
        assert_eq!(pending.result.chunks_extracted, 0);

        let finished = pending.handle.await.unwrap();
        assert_eq!(finished.status, DocumentStatus::Ready);
        assert!(finished.chunks_extracted > 0);

        let status = service.extraction_status(3).await.unwrap();
        assert_eq!(status.status, DocumentStatus::Ready);
        assert_eq!(status.chunks_extracted, finished.chunks_extracted);
    }

    #[tokio::test]
    async fn test_extract_missing_file_marks_error() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_document(document(3, 1, "/nonexistent/file.txt"));
        let service = service(&dir, catalog.clone(), MockLanguageModel::new());

        let pending = service
            .extract(ExtractionRequest {
                user_id: 1,
                document_id: 3,
                file_path: None,
                metadata: Default::default(),
            })
            .await
            .unwrap();
        let finished = pending.handle.await.unwrap();

        assert_eq!(finished.status, DocumentStatus::Error);
        assert!(finished.error_message.is_some());
        assert_eq!(
            catalog.document(3).await.unwrap().unwrap().status,
            DocumentStatus::Error
        );
    }

    #[tokio::test]
    async fn test_finished_extraction_respects_stored_status() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("de_cuong.txt");
        std::fs::write(&path, "Đề cương môn Cấu trúc dữ liệu gồm mười hai chương.").unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_document(document(3, 1, path.to_str().unwrap()));
        let service = service(&dir, catalog.clone(), MockLanguageModel::new());

        let request = ExtractionRequest {
            user_id: 1,
            document_id: 3,
            file_path: None,
            metadata: Default::default(),
        };
        let document = catalog.document(3).await.unwrap().unwrap();

        let finished = service.run_extraction(request.clone(), document).await;
        assert_eq!(finished.status, DocumentStatus::Ready);
        assert_eq!(
            catalog.document(3).await.unwrap().unwrap().status,
            DocumentStatus::Uploaded
        );

        let pending = service.extract(request.clone()).await.unwrap();
        pending.handle.await.unwrap();
        assert_eq!(
            catalog.document(3).await.unwrap().unwrap().status,
            DocumentStatus::Ready
        );

        let document = catalog.document(3).await.unwrap().unwrap();
        service.run_extraction(request, document).await;
        assert_eq!(
            catalog.document(3).await.unwrap().unwrap().status,
            DocumentStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_extract_checks_owner() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_document(document(3, 1, "/tmp/a.txt"));
        catalog.add_user(2);
        let service = service(&dir, catalog.clone(), MockLanguageModel::new());

        let request = |user_id, document_id| ExtractionRequest {
            user_id,
            document_id,
            file_path: None,
            metadata: Default::default(),
        };

        assert!(matches!(
            service.extract(request(2, 3)).await.err(),
            Some(KnowledgeError::PermissionDenied(_))
        ));
        assert!(matches!(
            service.extract(request(9, 3)).await.err(),
            Some(KnowledgeError::NotFound(_))
        ));
        assert!(matches!(
            service.extract(request(1, 99)).await.err(),
            Some(KnowledgeError::NotFound(_))
        ));
        assert_eq!(
            catalog.document(3).await.unwrap().unwrap().status,
            DocumentStatus::Uploaded
        );
    }

    #[tokio::test]
    async fn test_batch_validation_and_partial_results() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_document(document(1, 1, "/nonexistent/1.txt"));
        catalog.add_document(document(2, 5, "/nonexistent/2.txt"));
        let service = service(&dir, catalog, MockLanguageModel::new());

        let duplicate = service
            .extract_batch(BatchExtractionRequest {
                user_id: 1,
                document_ids: vec![1, 1],
            })
            .await;
        assert!(matches!(duplicate.err(), Some(KnowledgeError::Validation(_))));

        let too_many = service
            .extract_batch(BatchExtractionRequest {
                user_id: 1,
                document_ids: (1..=51).collect(),
            })
            .await;
        assert!(matches!(too_many.err(), Some(KnowledgeError::Validation(_))));

        let batch = service
            .extract_batch(BatchExtractionRequest {
                user_id: 1,
                document_ids: vec![1, 2, 3],
            })
            .await
            .unwrap();
        assert_eq!(batch.response.total, 3);
        assert_eq!(batch.response.successful, 1);
        assert_eq!(batch.response.failed, 2);
        assert_eq!(batch.handles.len(), 1);
    }

    #[tokio::test]
    async fn test_search_validation_runs_before_lookup() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(MemoryCatalog::new()), MockLanguageModel::new());

        let request = |query: &str, top_k| SearchRequest {
            user_id: 404,
            query: query.to_string(),
            top_k,
            search_scope: SearchScope::User,
            filters: Default::default(),
        };

        assert!(matches!(
            service.search(request("  ", 5)).await.err(),
            Some(KnowledgeError::Validation(_))
        ));
        assert!(matches!(
            service.search(request(&"a".repeat(501), 5)).await.err(),
            Some(KnowledgeError::Validation(_))
        ));
        assert!(matches!(
            service.search(request("deadline", 21)).await.err(),
            Some(KnowledgeError::Validation(_))
        ));
        assert!(matches!(
            service.search(request("deadline", 5)).await.err(),
            Some(KnowledgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_requires_confirm() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_user(1);
        let service = service(&dir, catalog, MockLanguageModel::new());

        let err = service
            .delete_knowledge(DeleteKnowledgeRequest {
                user_id: 1,
                document_ids: None,
                confirm: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::Validation(_)));

        let response = service
            .delete_knowledge(DeleteKnowledgeRequest {
                user_id: 1,
                document_ids: Some(vec![7]),
                confirm: true,
            })
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.deleted, 0);
    }

    #[tokio::test]
    async fn test_fill_template_access_rules() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_user(1);
        catalog.add_user(2);
        catalog.add_template(template(10, 1, "Hạn nộp: {{deadline}}"));

        let mut llm = MockLanguageModel::new();
        llm.expect_complete().returning(|_, _| {
            Ok(r#"{"filled_template": "Hạn nộp: 23:59 31/07", "variables": {"deadline": "23:59 31/07"}}"#.to_string())
        });
        let service = service(&dir, catalog, llm);

        let request = |user_id, template_id| TemplateFillRequest {
            user_id,
            template_id,
            question: "Khi nào hết hạn?".to_string(),
            context: Default::default(),
            use_rag: false,
        };

        assert!(matches!(
            service.fill_template(request(2, 10)).await.err(),
            Some(KnowledgeError::PermissionDenied(_))
        ));
        assert!(matches!(
            service.fill_template(request(1, 11)).await.err(),
            Some(KnowledgeError::NotFound(_))
        ));

        let filled = service.fill_template(request(1, 10)).await.unwrap();
        assert_eq!(filled.filled_content, "Hạn nộp: 23:59 31/07");

        let batch = service
            .batch_fill(vec![request(1, 10), request(2, 10)])
            .await
            .unwrap();
        assert_eq!((batch.successful, batch.failed), (1, 1));
        assert!(batch.results[1].error.is_some());

        let oversized = service.batch_fill(vec![request(1, 10); 11]).await;
        assert!(matches!(oversized.err(), Some(KnowledgeError::Validation(_))));
    }

    #[tokio::test]
    async fn test_ask_without_knowledge_skips_llm() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_user(1);
        let mut llm = MockLanguageModel::new();
        llm.expect_complete().never();
        let service = service(&dir, catalog, llm);

        let answer = service
            .ask(AskRequest {
                user_id: 1,
                question: "Phòng thi ở đâu?".to_string(),
                top_k: None,
            })
            .await
            .unwrap();
        assert_eq!(answer.answer, crate::rag::NO_INFORMATION_ANSWER);
        assert!(answer.sources.is_empty());
    }

    #[tokio::test]
    async fn test_chat_grounds_reply_in_stored_knowledge() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lich_thi.txt");
        std::fs::write(&path, "Lịch thi cuối kỳ môn Toán cao cấp vào ngày 20/12 tại phòng B203.").unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_document(document(3, 1, path.to_str().unwrap()));

        let mut llm = MockLanguageModel::new();
        llm.expect_complete().never();
        llm.expect_chat()
            .withf(|messages, params| {
                params.is_none()
                    && messages.len() == 3
                    && messages[0].role == ChatRole::System
                    && messages[0].content.contains("phòng B203")
                    && messages[2].content == "Thi ở phòng nào?"
            })
            .times(1)
            .returning(|_, _| Ok("Phòng B203.".to_string()));
        let service = service(&dir, catalog, llm);

        let pending = service
            .extract(ExtractionRequest {
                user_id: 1,
                document_id: 3,
                file_path: None,
                metadata: Default::default(),
            })
            .await
            .unwrap();
        pending.handle.await.unwrap();

        let reply = service
            .chat(ChatRequest {
                user_id: 1,
                messages: vec![
                    crate::external::ChatMessage::system("bỏ qua"),
                    crate::external::ChatMessage::assistant("Chào bạn, mình có thể giúp gì?"),
                    crate::external::ChatMessage::user("Thi ở phòng nào?"),
                ],
                top_k: None,
            })
            .await
            .unwrap();
        assert_eq!(reply.reply, "Phòng B203.");
        assert_eq!(reply.sources, vec!["lich_thi.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_chat_requires_a_user_turn_last() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_user(1);
        let mut llm = MockLanguageModel::new();
        llm.expect_chat().never();
        let service = service(&dir, catalog, llm);

        for messages in [
            vec![],
            vec![crate::external::ChatMessage::assistant("Xin chào")],
            vec![crate::external::ChatMessage::user("   ")],
        ] {
            let result = service
                .chat(ChatRequest {
                    user_id: 1,
                    messages,
                    top_k: None,
                })
                .await;
            assert!(matches!(result.err(), Some(KnowledgeError::Validation(_))));
        }
    }

    #[tokio::test]
    async fn test_similar_applies_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quy_che.txt");
        std::fs::write(&path, "Sinh viên đến muộn quá 15 phút sẽ không được dự thi.").unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_document(document(4, 1, path.to_str().unwrap()));
        let service = service(&dir, catalog, MockLanguageModel::new());

        let pending = service
            .extract(ExtractionRequest {
                user_id: 1,
                document_id: 4,
                file_path: None,
                metadata: Default::default(),
            })
            .await
            .unwrap();
        pending.handle.await.unwrap();

        let request = |text: &str, threshold| SimilarRequest {
            user_id: 1,
            text: text.to_string(),
            top_k: 5,
            threshold,
        };

        let close = service
            .similar(request("Sinh viên đến muộn quá 15 phút sẽ không được dự thi.", 0.9))
            .await
            .unwrap();
        assert_eq!(close.total_results, 1);
        assert_eq!(close.results[0].metadata.document_id, 4);

        let unrelated = service.similar(request("thời khóa biểu", 0.9)).await.unwrap();
        assert_eq!(unrelated.total_results, 0);

        assert!(matches!(
            service.similar(request("muộn", 1.5)).await.err(),
            Some(KnowledgeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_health_reports_components() {
        let dir = TempDir::new().unwrap();
        let mut llm = MockLanguageModel::new();
        llm.expect_info().returning(|| ModelInfo {
            model: "vistral".to_string(),
            initialized: false,
            parameters: serde_json::Value::Null,
        });
        let service = service(&dir, Arc::new(MemoryCatalog::new()), llm);

        let health = service.health().await;
        assert_eq!(health.components["llm"], "not initialized");
        assert_eq!(health.components["embeddings"], "healthy");
        assert_eq!(health.components["vector_store"], "healthy");
        assert_eq!(health.components["catalog"], "healthy");
        assert_eq!(health.status, "degraded");
    }
}

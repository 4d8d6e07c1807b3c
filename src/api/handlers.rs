use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::rag::{Answer, ChatAnswer};
use crate::service::*;
use crate::store::Payload;
use crate::template::{FilledTemplate, TemplateAnalysis, TemplatePreview};

type Shared = State<Arc<KnowledgeService>>;

/// Service banner.
pub async fn root() -> Json<Value> {
    Json(json!({
        "service": "ta-knowledge",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/api/extraction", "/api/template", "/health"],
    }))
}

pub async fn health(State(service): Shared) -> Json<ServiceHealth> {
    Json(service.health().await)
}

pub async fn extract(
    State(service): Shared,
    Json(req): Json<ExtractionRequest>,
) -> Result<Json<ExtractionResult>, ApiError> {
    // The background task keeps running after the handle is dropped.
    let pending = service.extract(req).await?;
    Ok(Json(pending.result))
}

pub async fn extract_batch(
    State(service): Shared,
    Json(req): Json<BatchExtractionRequest>,
) -> Result<Json<BatchExtractionResponse>, ApiError> {
    let pending = service.extract_batch(req).await?;
    Ok(Json(pending.response))
}

pub async fn extraction_status(
    State(service): Shared,
    Path(document_id): Path<i64>,
) -> Result<Json<ExtractionStatus>, ApiError> {
    Ok(Json(service.extraction_status(document_id).await?))
}

pub async fn search(
    State(service): Shared,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    Ok(Json(service.search(req).await?))
}

pub async fn stats(
    State(service): Shared,
    Path(user_id): Path<i64>,
) -> Result<Json<KnowledgeStats>, ApiError> {
    Ok(Json(service.stats(user_id).await?))
}

pub async fn delete_knowledge(
    State(service): Shared,
    Json(req): Json<DeleteKnowledgeRequest>,
) -> Result<Json<DeleteKnowledgeResponse>, ApiError> {
    Ok(Json(service.delete_knowledge(req).await?))
}

pub async fn fill_template(
    State(service): Shared,
    Json(req): Json<TemplateFillRequest>,
) -> Result<Json<FilledTemplate>, ApiError> {
    Ok(Json(service.fill_template(req).await?))
}

pub async fn batch_fill(
    State(service): Shared,
    Json(reqs): Json<Vec<TemplateFillRequest>>,
) -> Result<Json<BatchFillResponse>, ApiError> {
    Ok(Json(service.batch_fill(reqs).await?))
}

pub async fn analyze_template(
    State(service): Shared,
    Json(req): Json<TemplateAnalysisRequest>,
) -> Json<TemplateAnalysis> {
    Json(service.analyze_template(&req.template_content))
}

pub async fn preview_template(
    State(service): Shared,
    Path(template_id): Path<i64>,
    Json(sample): Json<Payload>,
) -> Result<Json<TemplatePreview>, ApiError> {
    Ok(Json(service.preview_template(template_id, &sample).await?))
}

pub async fn common_variables(State(service): Shared) -> Json<CommonVariables> {
    Json(service.common_variables())
}

pub async fn ask(
    State(service): Shared,
    Json(req): Json<AskRequest>,
) -> Result<Json<Answer>, ApiError> {
    Ok(Json(service.ask(req).await?))
}

pub async fn chat(
    State(service): Shared,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatAnswer>, ApiError> {
    Ok(Json(service.chat(req).await?))
}

pub async fn similar(
    State(service): Shared,
    Json(req): Json<SimilarRequest>,
) -> Result<Json<SimilarResponse>, ApiError> {
    Ok(Json(service.similar(req).await?))
}

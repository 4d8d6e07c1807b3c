//! Free-form message templates with `{{variable}}` placeholders, filled by
//! the LLM from retrieved course knowledge.

pub mod response;
pub mod syntax;
pub mod variables;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::catalog::TemplateRecord;
use crate::error::KnowledgeError;
use crate::external::{GenerationParams, LanguageModel};
use crate::rag::{unique_sources, RagRetriever, SearchResult};
use crate::store::Payload;

pub use response::{
    JsonResponseParser, ParsedFill, PatternResponseParser, ResponseParser, TwoStageParser,
};
pub use syntax::{extract_variables, substitute, validate_syntax};
pub use variables::{
    analyze_variable, build_search_query, common_variables, is_standard_variable,
    suggest_standard_name, CommonVariable, VariableInfo, VariableKind,
};

/// Value substituted for any variable the fill could not resolve.
pub const UNRESOLVED: &str = "[Không có thông tin]";

const MAX_SNIPPETS: usize = 5;
const SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilledTemplate {
    pub template_id: i64,
    pub original_template: String,
    pub filled_content: String,
    pub variables_filled: BTreeMap<String, String>,
    pub confidence_score: f64,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateAnalysis {
    pub variables: Vec<String>,
    pub variable_details: Vec<VariableInfo>,
    pub template_valid: bool,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplatePreview {
    pub template_id: i64,
    pub template_name: String,
    pub original: String,
    pub preview: String,
    pub variables: Vec<String>,
    pub unfilled_variables: Vec<String>,
}

/// Inputs of a single fill beyond the template itself.
#[derive(Debug, Clone, Default)]
pub struct FillRequest {
    pub user_id: i64,
    pub question: String,
    pub context: Payload,
    pub use_rag: bool,
}

/// Heuristic confidence in `[0, 1]`: share of the template's variables resolved,
/// +0.1 with retrieval support, x0.8 when more than half are unresolved,
/// rounded to two decimals. Non-decreasing in the number resolved.
pub fn confidence_score(filled: &BTreeMap<String, String>, variables: &[String], has_rag: bool) -> f64 {
    if variables.is_empty() {
        return 1.0;
    }

    let resolved = variables
        .iter()
        .filter(|name| is_resolved(filled.get(*name)))
        .count();
    let unresolved = variables.len() - resolved;

    let mut score = resolved as f64 / variables.len() as f64;
    if has_rag {
        score = (score + 0.1).min(1.0);
    }
    if unresolved * 2 > variables.len() {
        score *= 0.8;
    }

    (score.clamp(0.0, 1.0) * 100.0).round() / 100.0
}

fn is_resolved(value: Option<&String>) -> bool {
    value
        .map(|v| !v.trim().is_empty() && v != UNRESOLVED)
        .unwrap_or(false)
}

/// Structural report on a template: variables, per-variable details,
/// validity and improvement suggestions.
pub fn analyze(content: &str, declared: Option<&[String]>) -> TemplateAnalysis {
    let variables = extract_variables(content);
    let errors = validate_syntax(content);
    let mut suggestions = Vec::new();

    if content.chars().count() < 20 {
        suggestions.push("Template quá ngắn, nên thêm nội dung chi tiết hơn".to_string());
    }
    if content.contains("{{") && !content.contains("}}") {
        suggestions.push("Thiếu dấu đóng '}}' cho biến".to_string());
    }

    let non_standard: Vec<&String> = variables
        .iter()
        .filter(|v| !is_standard_variable(v))
        .collect();
    if !non_standard.is_empty() {
        let names: Vec<&str> = non_standard.iter().map(|v| v.as_str()).collect();
        suggestions.push(format!(
            "Các biến không chuẩn: {}. Nên dùng tên biến chuẩn để dễ quản lý",
            names.join(", ")
        ));
        for name in non_standard {
            if let Some(standard) = suggest_standard_name(name) {
                suggestions.push(format!("Đổi '{}' thành '{}'", name, standard));
            }
        }
    }

    if let Some(declared) = declared {
        let undeclared: Vec<&str> = variables
            .iter()
            .filter(|v| !declared.contains(v))
            .map(String::as_str)
            .collect();
        if !undeclared.is_empty() {
            suggestions.push(format!(
                "Biến chưa được khai báo trong template: {}",
                undeclared.join(", ")
            ));
        }
    }

    suggestions.extend(errors.iter().map(|e| format!("Lỗi: {}", e)));

    TemplateAnalysis {
        variable_details: variables.iter().map(|v| analyze_variable(v)).collect(),
        variables,
        template_valid: errors.is_empty(),
        suggestions,
    }
}

/// Plain substitution of sample values, without retrieval or LLM.
pub fn preview(template: &TemplateRecord, sample: &Payload) -> TemplatePreview {
    let variables = extract_variables(&template.content);
    let mut unfilled = Vec::new();

    let rendered = substitute(&template.content, |name| match sample.get(name) {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Null) | None => {
            if !unfilled.iter().any(|u| u == name) {
                unfilled.push(name.to_string());
            }
            None
        }
        Some(other) => Some(other.to_string()),
    });

    TemplatePreview {
        template_id: template.id,
        template_name: template.name.clone(),
        original: template.content.clone(),
        preview: rendered,
        variables,
        unfilled_variables: unfilled,
    }
}

/// Runs the fill pipeline: validate, extract variables, retrieve, ask the
/// LLM, parse, score.
pub struct TemplateEngine {
    llm: Arc<dyn LanguageModel>,
    retriever: Arc<RagRetriever>,
    parser: Box<dyn ResponseParser>,
    fill_temperature: f32,
    top_k: usize,
}

impl TemplateEngine {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        retriever: Arc<RagRetriever>,
        fill_temperature: f32,
        top_k: usize,
    ) -> Self {
        Self {
            llm,
            retriever,
            parser: Box::new(TwoStageParser::default()),
            fill_temperature,
            top_k,
        }
    }

    pub fn with_parser(mut self, parser: Box<dyn ResponseParser>) -> Self {
        self.parser = parser;
        self
    }

    pub async fn fill(
        &self,
        template: &TemplateRecord,
        request: &FillRequest,
    ) -> Result<FilledTemplate, KnowledgeError> {
        let errors = validate_syntax(&template.content);
        if !errors.is_empty() {
            return Err(KnowledgeError::Validation(format!(
                "template {} is malformed: {}",
                template.id,
                errors.join("; ")
            )));
        }

        let variables = extract_variables(&template.content);
        if variables.is_empty() {
            return Ok(FilledTemplate {
                template_id: template.id,
                original_template: template.content.clone(),
                filled_content: template.content.clone(),
                variables_filled: BTreeMap::new(),
                confidence_score: 1.0,
                sources: Vec::new(),
            });
        }

        let undeclared = template.undeclared_variables();
        if !undeclared.is_empty() {
            tracing::warn!(
                template_id = template.id,
                ?undeclared,
                "Template uses undeclared variables"
            );
        }

        let results = if request.use_rag {
            let query = build_search_query(&request.question, &variables, &request.context);
            self.retriever
                .search(&query, Some(request.user_id), self.top_k, None)
                .await?
        } else {
            Vec::new()
        };

        let prompt = fill_prompt(template, &variables, request, &results);
        let parsed = match self
            .llm
            .complete(
                &prompt,
                Some(GenerationParams::with_temperature(self.fill_temperature)),
            )
            .await
        {
            Ok(response) => self.parser.parse(&response, &variables),
            Err(e) => {
                tracing::error!(template_id = template.id, error = %e, "Template fill failed");
                None
            }
        };
        let parsed = parsed.unwrap_or_default();

        let variables_filled: BTreeMap<String, String> = variables
            .iter()
            .map(|name| {
                let value = parsed
                    .variables
                    .get(name)
                    .filter(|v| is_resolved(Some(*v)))
                    .cloned()
                    .unwrap_or_else(|| UNRESOLVED.to_string());
                (name.clone(), value)
            })
            .collect();

        let base = parsed
            .filled_template
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| template.content.clone());
        let filled_content = substitute(&base, |name| {
            Some(
                variables_filled
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| UNRESOLVED.to_string()),
            )
        });

        let confidence = confidence_score(&variables_filled, &variables, !results.is_empty());

        tracing::info!(
            template_id = template.id,
            variables = variables.len(),
            confidence,
            "Filled template"
        );

        Ok(FilledTemplate {
            template_id: template.id,
            original_template: template.content.clone(),
            filled_content,
            variables_filled,
            confidence_score: confidence,
            sources: unique_sources(&results),
        })
    }
}

fn fill_prompt(
    template: &TemplateRecord,
    variables: &[String],
    request: &FillRequest,
    results: &[SearchResult],
) -> String {
    let mut prompt = String::from(
        "Bạn là trợ lý giảng dạy. Hãy điền các biến trong template dưới đây dựa trên câu hỏi, \
         ngữ cảnh và thông tin tham khảo. Chỉ dùng thông tin có trong dữ liệu được cung cấp.\n\n",
    );

    prompt.push_str(&format!("Câu hỏi: {}\n\n", request.question.trim()));
    prompt.push_str(&format!("Template:\n{}\n\n", template.content));
    prompt.push_str(&format!("Các biến cần điền: {}\n\n", variables.join(", ")));

    if !request.context.is_empty() {
        prompt.push_str("Ngữ cảnh bổ sung:\n");
        for (key, value) in &request.context {
            let value = value
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            prompt.push_str(&format!("- {}: {}\n", key, value));
        }
        prompt.push('\n');
    }

    if !results.is_empty() {
        prompt.push_str("Thông tin tham khảo:\n");
        for (i, result) in results.iter().take(MAX_SNIPPETS).enumerate() {
            let snippet: String = result.text.chars().take(SNIPPET_CHARS).collect();
            prompt.push_str(&format!("{}. {}...\n", i + 1, snippet.trim()));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "Trả về đúng một đối tượng JSON dạng:\n\
         {{\"filled_template\": \"<template đã điền>\", \"variables\": {{\"<tên biến>\": \"<giá trị>\"}}}}\n\
         Nếu không tìm thấy thông tin cho biến nào, dùng giá trị \"{}\".",
        UNRESOLVED
    ));

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::llm::MockLanguageModel;
    use crate::testing::{retriever_in, template};
    use tempfile::TempDir;

    fn filled(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_confidence_bounds_and_penalty() {
        let required = names(&["a", "b", "c", "d"]);
        assert_eq!(confidence_score(&filled(&[]), &[], false), 1.0);
        assert_eq!(confidence_score(&filled(&[]), &required, false), 0.0);
        assert_eq!(
            confidence_score(&filled(&[("a", "x"), ("b", UNRESOLVED)]), &required, true),
            0.28
        );
        assert_eq!(
            confidence_score(
                &filled(&[("a", "x"), ("b", "y"), ("c", "z"), ("d", "w")]),
                &required,
                true
            ),
            1.0
        );
    }

    #[test]
    fn test_confidence_is_monotonic() {
        let required = names(&["a", "b", "c", "d", "e"]);
        for has_rag in [false, true] {
            let mut previous = -1.0;
            for resolved in 0..=required.len() {
                let map: BTreeMap<String, String> = required
                    .iter()
                    .take(resolved)
                    .map(|n| (n.clone(), "v".to_string()))
                    .collect();
                let score = confidence_score(&map, &required, has_rag);
                assert!((0.0..=1.0).contains(&score));
                assert!(score >= previous, "{} < {}", score, previous);
                previous = score;
            }
        }
    }

    #[test]
    fn test_analyze_reports_suggestions() {
        let analysis = analyze("Chào {{tensv}}", Some(&names(&["student_name"])));
        assert_eq!(analysis.variables, vec!["tensv"]);
        assert!(analysis.template_valid);
        assert!(analysis.suggestions.iter().any(|s| s.contains("quá ngắn")));
        assert!(analysis.suggestions.iter().any(|s| s.contains("'student_name'")));
        assert!(analysis.suggestions.iter().any(|s| s.contains("chưa được khai báo")));

        let broken = analyze("Hạn nộp {{deadline là ngày mai, mời các bạn chú ý", None);
        assert!(!broken.template_valid);
        assert!(broken.suggestions.iter().any(|s| s.contains("'}}'")));
    }

    #[test]
    fn test_preview_reports_unfilled() {
        let template = template(1, 1, "Môn {{subject}} hạn {{deadline}}, điểm {{score}}");
        let sample = serde_json::json!({"subject": "Toán", "score": 9})
            .as_object()
            .cloned()
            .unwrap();

        let preview = preview(&template, &sample);
        assert_eq!(preview.preview, "Môn Toán hạn {{deadline}}, điểm 9");
        assert_eq!(preview.unfilled_variables, vec!["deadline"]);
    }

    #[tokio::test]
    async fn test_fill_without_variables_is_identity() {
        let dir = TempDir::new().unwrap();
        let mut llm = MockLanguageModel::new();
        llm.expect_complete().never();

        let engine = TemplateEngine::new(Arc::new(llm), retriever_in(dir.path()), 0.3, 5);
        let record = template(4, 1, "Chúc các bạn thi tốt!");
        let result = engine
            .fill(
                &record,
                &FillRequest {
                    user_id: 1,
                    question: "Nhắn gì?".to_string(),
                    use_rag: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.filled_content, "Chúc các bạn thi tốt!");
        assert_eq!(result.confidence_score, 1.0);
        assert!(result.sources.is_empty());
    }

    #[tokio::test]
    async fn test_fill_rejects_malformed_template() {
        let dir = TempDir::new().unwrap();
        let mut llm = MockLanguageModel::new();
        llm.expect_complete().never();

        let engine = TemplateEngine::new(Arc::new(llm), retriever_in(dir.path()), 0.3, 5);
        let record = template(4, 1, "Hạn {{deadline");
        let err = engine
            .fill(&record, &FillRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unparseable_response_yields_sentinel() {
        let dir = TempDir::new().unwrap();
        let mut llm = MockLanguageModel::new();
        llm.expect_complete()
            .withf(|_, params| {
                params.as_ref().and_then(|p| p.temperature) == Some(0.3)
            })
            .times(1)
            .returning(|_, _| Ok("Xin lỗi, tôi không chắc.".to_string()));

        let engine = TemplateEngine::new(Arc::new(llm), retriever_in(dir.path()), 0.3, 5);
        let record = template(2, 1, "Phòng thi: {{location}}");
        let result = engine
            .fill(
                &record,
                &FillRequest {
                    user_id: 1,
                    question: "Thi ở đâu?".to_string(),
                    use_rag: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.filled_content, format!("Phòng thi: {}", UNRESOLVED));
        assert_eq!(result.variables_filled["location"], UNRESOLVED);
        assert_eq!(result.confidence_score, 0.0);
    }

    #[tokio::test]
    async fn test_llm_failure_degrades_to_sentinel() {
        let dir = TempDir::new().unwrap();
        let mut llm = MockLanguageModel::new();
        llm.expect_complete()
            .returning(|_, _| Err(anyhow::anyhow!("connection refused")));

        let engine = TemplateEngine::new(Arc::new(llm), retriever_in(dir.path()), 0.3, 5);
        let record = template(2, 1, "{{subject}} - {{deadline}}");
        let result = engine
            .fill(&record, &FillRequest::default())
            .await
            .unwrap();

        assert!(!result.filled_content.contains("{{"));
        assert!(result
            .variables_filled
            .values()
            .all(|v| v == UNRESOLVED));
    }

    #[tokio::test]
    async fn test_optional_variables_count_toward_confidence() {
        let dir = TempDir::new().unwrap();
        let mut llm = MockLanguageModel::new();
        llm.expect_complete()
            .returning(|_, _| Err(anyhow::anyhow!("connection refused")));

        let engine = TemplateEngine::new(Arc::new(llm), retriever_in(dir.path()), 0.3, 5);
        let record = template(3, 1, "Ghi chú: {{note}}");
        let result = engine
            .fill(&record, &FillRequest::default())
            .await
            .unwrap();

        assert_eq!(result.filled_content, format!("Ghi chú: {}", UNRESOLVED));
        assert_eq!(result.confidence_score, 0.0);
    }
}

mod common;

use assert_fs::prelude::*;
use std::sync::Arc;

use ta_knowledge::catalog::{Catalog, DocumentRecord, DocumentStatus, MemoryCatalog, TemplateRecord};
use ta_knowledge::service::{
    BatchExtractionRequest, DeleteKnowledgeRequest, SearchRequest, SearchScope,
    TemplateFillRequest,
};
use ta_knowledge::store::Payload;
use ta_knowledge::template::extract_variables;
use ta_knowledge::KnowledgeError;

use common::{service, MockLlm};

fn document(id: i64, owner_id: i64, path: &std::path::Path) -> DocumentRecord {
    let name = path.file_name().unwrap().to_string_lossy().to_string();
    DocumentRecord {
        id,
        filename: format!("{}_{}", id, name),
        original_name: name,
        file_path: path.display().to_string(),
        file_type: path.extension().unwrap().to_string_lossy().to_string(),
        status: DocumentStatus::Uploaded,
        owner_id,
        owner_name: Some("Cô Lan".to_string()),
        owner_email: Some("lan@example.edu.vn".to_string()),
        created_at: Some("2026-09-01 08:00:00".to_string()),
    }
}

fn search(user_id: i64, query: &str, scope: SearchScope) -> SearchRequest {
    SearchRequest {
        user_id,
        query: query.to_string(),
        top_k: 5,
        search_scope: scope,
        filters: Payload::new(),
    }
}

#[tokio::test]
async fn test_batch_extraction_to_search_and_delete() {
    let temp = assert_fs::TempDir::new().unwrap();
    let schedule = temp.child("lich_thi.txt");
    schedule
        .write_str("Lịch thi cuối kỳ môn Cấu trúc dữ liệu: ngày 20/12 tại phòng A203.")
        .unwrap();
    let rules = temp.child("quy_che.md");
    rules
        .write_str("# Quy chế\n\nSinh viên đến muộn quá 15 phút sẽ không được dự thi.")
        .unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_document(document(1, 10, schedule.path()));
    catalog.add_document(document(2, 10, rules.path()));
    catalog.add_document(document(3, 20, rules.path()));

    let service = service(&temp.path().join("db"), catalog.clone(), MockLlm::new());

    let pending = service
        .extract_batch(BatchExtractionRequest {
            user_id: 10,
            document_ids: vec![1, 2, 3, 4],
        })
        .await
        .unwrap();
    assert_eq!(pending.response.total, 4);
    assert_eq!(pending.response.successful, 2);
    assert_eq!(pending.response.failed, 2);
    assert_eq!(
        pending.response.results[2].error_message.as_deref(),
        Some("Không có quyền truy cập")
    );

    for handle in pending.handles {
        assert_eq!(handle.await.unwrap().status, DocumentStatus::Ready);
    }
    assert_eq!(
        catalog.document(3).await.unwrap().unwrap().status,
        DocumentStatus::Uploaded
    );

    let status = service.extraction_status(1).await.unwrap();
    assert_eq!(status.status, DocumentStatus::Ready);
    assert_eq!(status.chunks_extracted, 1);
    assert_eq!(status.original_name, "lich_thi.txt");

    let response = service
        .search(search(10, "lịch thi cuối kỳ", SearchScope::User))
        .await
        .unwrap();
    assert!(response.total_results >= 1);
    assert_eq!(response.results[0].metadata.document_id, 1);
    assert_eq!(
        response.results[0].metadata.extra["owner_email"],
        "lan@example.edu.vn"
    );

    let stats = service.stats(10).await.unwrap();
    assert_eq!(stats.total_documents, 2);
    assert_eq!(stats.total_chunks, 2);

    let deleted = service
        .delete_knowledge(DeleteKnowledgeRequest {
            user_id: 10,
            document_ids: Some(vec![1]),
            confirm: true,
        })
        .await
        .unwrap();
    assert!(deleted.success);
    assert_eq!(deleted.deleted, 1);

    let response = service
        .search(search(10, "lịch thi cuối kỳ", SearchScope::Global))
        .await
        .unwrap();
    assert!(response
        .results
        .iter()
        .all(|r| r.metadata.document_id != 1));
}

#[tokio::test]
async fn test_failed_extraction_is_recorded() {
    let temp = assert_fs::TempDir::new().unwrap();
    let missing = temp.path().join("bai_giang.pdf");

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_document(document(5, 10, &missing));
    let service = service(&temp.path().join("db"), catalog.clone(), MockLlm::new());

    let pending = service
        .extract(ta_knowledge::service::ExtractionRequest {
            user_id: 10,
            document_id: 5,
            file_path: None,
            metadata: Payload::new(),
        })
        .await
        .unwrap();
    assert_eq!(pending.result.status, DocumentStatus::Processing);

    let finished = pending.handle.await.unwrap();
    assert_eq!(finished.status, DocumentStatus::Error);
    assert!(finished.error_message.unwrap().contains("document 5"));
    assert_eq!(
        catalog.document(5).await.unwrap().unwrap().status,
        DocumentStatus::Error
    );
}

#[tokio::test]
async fn test_access_rules() {
    let temp = assert_fs::TempDir::new().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_user(1);
    catalog.add_user(2);
    let content = "Chào {{student_name}}";
    catalog.add_template(TemplateRecord {
        id: 9,
        name: "greeting".to_string(),
        content: content.to_string(),
        category: None,
        variables: extract_variables(content),
        owner_id: 1,
        created_at: None,
    });

    let mut llm = MockLlm::new();
    llm.expect_complete().never();
    let service = service(&temp.path().join("db"), catalog, llm);

    let fill = |user_id, template_id| TemplateFillRequest {
        user_id,
        template_id,
        question: "Xin chào".to_string(),
        context: Payload::new(),
        use_rag: false,
    };

    assert!(matches!(
        service.fill_template(fill(2, 9)).await,
        Err(KnowledgeError::PermissionDenied(_))
    ));
    assert!(matches!(
        service.fill_template(fill(1, 404)).await,
        Err(KnowledgeError::NotFound(_))
    ));
    assert!(matches!(
        service.fill_template(fill(3, 9)).await,
        Err(KnowledgeError::NotFound(_))
    ));
    assert!(matches!(
        service.search(search(1, "   ", SearchScope::User)).await,
        Err(KnowledgeError::Validation(_))
    ));
    assert!(matches!(
        service.search(search(1, &"a".repeat(501), SearchScope::User)).await,
        Err(KnowledgeError::Validation(_))
    ));
    assert!(matches!(
        service
            .delete_knowledge(DeleteKnowledgeRequest {
                user_id: 1,
                document_ids: None,
                confirm: false,
            })
            .await,
        Err(KnowledgeError::Validation(_))
    ));
}

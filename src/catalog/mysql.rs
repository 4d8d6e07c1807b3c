use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;

use super::{Catalog, DocumentRecord, DocumentStatus, StatusChange, TemplateRecord};

const DOCUMENT_COLUMNS: &str = r#"
    CAST(d.id AS SIGNED) AS id, d.filename, d.original_name, d.file_path, d.file_type,
    d.status, CAST(d.owner_id AS SIGNED) AS owner_id,
    u.name AS owner_name, u.email AS owner_email,
    CAST(d.created_at AS CHAR) AS created_at
"#;

/// Catalog backed by the platform's MySQL database.
pub struct MySqlCatalog {
    pool: MySqlPool,
}

impl MySqlCatalog {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("connecting to catalog database")?;
        tracing::info!("Connected to catalog database");
        Ok(Self { pool })
    }
}

fn document_from_row(row: &MySqlRow) -> Result<DocumentRecord> {
    let status: String = row.try_get("status")?;
    Ok(DocumentRecord {
        id: row.try_get("id")?,
        filename: row.try_get("filename")?,
        original_name: row.try_get("original_name")?,
        file_path: row.try_get("file_path")?,
        file_type: row.try_get("file_type")?,
        status: status.parse()?,
        owner_id: row.try_get("owner_id")?,
        owner_name: row.try_get("owner_name")?,
        owner_email: row.try_get("owner_email")?,
        created_at: row.try_get("created_at")?,
    })
}

fn template_from_row(row: &MySqlRow) -> Result<TemplateRecord> {
    let variables: Option<String> = row.try_get("variables")?;
    let variables = match variables {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
            .with_context(|| format!("decoding template variables '{}'", raw))?,
        _ => Vec::new(),
    };

    Ok(TemplateRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        content: row.try_get("content")?,
        category: row.try_get("category")?,
        variables,
        owner_id: row.try_get("owner_id")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Catalog for MySqlCatalog {
    async fn user_exists(&self, user_id: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn document(&self, document_id: i64) -> Result<Option<DocumentRecord>> {
        let sql = format!(
            "SELECT {} FROM documents d JOIN users u ON d.owner_id = u.id \
             WHERE d.id = ? AND d.is_deleted = FALSE",
            DOCUMENT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn user_documents(&self, user_id: i64, limit: usize) -> Result<Vec<DocumentRecord>> {
        let sql = format!(
            "SELECT {} FROM documents d JOIN users u ON d.owner_id = u.id \
             WHERE d.owner_id = ? AND d.is_deleted = FALSE \
             ORDER BY d.created_at DESC LIMIT ?",
            DOCUMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn template(&self, template_id: i64) -> Result<Option<TemplateRecord>> {
        let row = sqlx::query(
            "SELECT CAST(id AS SIGNED) AS id, name, content, category, \
             CAST(variables AS CHAR) AS variables, CAST(owner_id AS SIGNED) AS owner_id, \
             CAST(created_at AS CHAR) AS created_at \
             FROM templates WHERE id = ?",
        )
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(template_from_row).transpose()
    }

    async fn transition_document_status(
        &self,
        document_id: i64,
        next: DocumentStatus,
    ) -> Result<StatusChange> {
        let mut tx = self.pool.begin().await?;

        let stored: Option<String> = sqlx::query_scalar(
            "SELECT status FROM documents WHERE id = ? AND is_deleted = FALSE FOR UPDATE",
        )
        .bind(document_id)
        .fetch_optional(&mut *tx)
        .await?;
        let current: DocumentStatus = stored
            .with_context(|| format!("document {} not found", document_id))?
            .parse()?;

        if !current.can_transition_to(next) {
            tx.rollback().await?;
            return Ok(StatusChange::Rejected { current });
        }

        sqlx::query("UPDATE documents SET status = ?, updated_at = NOW() WHERE id = ?")
            .bind(next.as_str())
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::debug!(document_id, from = %current, to = %next, "Updated document status");
        Ok(StatusChange::Applied { from: current })
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

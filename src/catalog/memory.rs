use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use super::{Catalog, DocumentRecord, DocumentStatus, StatusChange, TemplateRecord};

/// Seed file layout for [`MemoryCatalog::from_file`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub users: Vec<i64>,
    #[serde(default)]
    pub documents: Vec<DocumentRecord>,
    #[serde(default)]
    pub templates: Vec<TemplateRecord>,
}

/// In-process catalog for local runs and tests.
#[derive(Default)]
pub struct MemoryCatalog {
    users: RwLock<BTreeSet<i64>>,
    documents: RwLock<BTreeMap<i64, DocumentRecord>>,
    templates: RwLock<BTreeMap<i64, TemplateRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: CatalogSeed) -> Self {
        let catalog = Self::new();
        for user in seed.users {
            catalog.add_user(user);
        }
        for document in seed.documents {
            catalog.add_document(document);
        }
        for template in seed.templates {
            catalog.add_template(template);
        }
        catalog
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading catalog seed {}", path.display()))?;
        let seed: CatalogSeed = serde_json::from_str(&raw)
            .with_context(|| format!("parsing catalog seed {}", path.display()))?;
        tracing::info!(
            users = seed.users.len(),
            documents = seed.documents.len(),
            templates = seed.templates.len(),
            "Loaded catalog seed"
        );
        Ok(Self::from_seed(seed))
    }

    pub fn add_user(&self, user_id: i64) {
        self.users.write().insert(user_id);
    }

    pub fn add_document(&self, document: DocumentRecord) {
        self.users.write().insert(document.owner_id);
        self.documents.write().insert(document.id, document);
    }

    pub fn add_template(&self, template: TemplateRecord) {
        self.templates.write().insert(template.id, template);
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn user_exists(&self, user_id: i64) -> Result<bool> {
        Ok(self.users.read().contains(&user_id))
    }

    async fn document(&self, document_id: i64) -> Result<Option<DocumentRecord>> {
        Ok(self.documents.read().get(&document_id).cloned())
    }

    async fn user_documents(&self, user_id: i64, limit: usize) -> Result<Vec<DocumentRecord>> {
        Ok(self
            .documents
            .read()
            .values()
            .rev()
            .filter(|d| d.owner_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn template(&self, template_id: i64) -> Result<Option<TemplateRecord>> {
        Ok(self.templates.read().get(&template_id).cloned())
    }

    async fn transition_document_status(
        &self,
        document_id: i64,
        next: DocumentStatus,
    ) -> Result<StatusChange> {
        let mut documents = self.documents.write();
        let document = documents
            .get_mut(&document_id)
            .ok_or_else(|| anyhow!("document {} not found", document_id))?;

        let current = document.status;
        if !current.can_transition_to(next) {
            return Ok(StatusChange::Rejected { current });
        }
        document.status = next;
        Ok(StatusChange::Applied { from: current })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

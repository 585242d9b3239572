//! Knowledge chunk storage and vector search
//!
//! This module provides:
//! - The [`KnowledgeStore`] contract used by ingestion and retrieval
//! - A SQLite backend (vectors stored beside content, brute-force cosine)
//! - A Qdrant backend for larger knowledge bases

mod qdrant;
mod sqlite;

pub use qdrant::QdrantKnowledgeStore;
pub use sqlite::SqliteKnowledgeStore;

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::cmp::Ordering;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{Config, KnowledgeBackend};
use crate::error::{Error, Result};
use crate::models::{KnowledgeChunk, ScoredChunk};

/// Which chunks a search may see
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilter {
    pub org_id: String,
    /// Org-wide chunks are always visible; with a lead set, that lead's own
    /// chunks are visible too. Other leads' chunks never are.
    pub lead_id: Option<Uuid>,
    pub category: Option<String>,
}

impl SearchFilter {
    pub fn org(org_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            lead_id: None,
            category: None,
        }
    }

    pub fn for_lead(mut self, lead_id: Uuid) -> Self {
        self.lead_id = Some(lead_id);
        self
    }

    pub fn in_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Whether a chunk is visible under this filter
    pub fn admits(&self, chunk: &KnowledgeChunk) -> bool {
        chunk.org_id == self.org_id
            && match chunk.lead_id {
                None => true,
                Some(owner) => self.lead_id == Some(owner),
            }
            && self
                .category
                .as_ref()
                .map_or(true, |c| &chunk.category == c)
    }
}

/// Storage of embedded knowledge chunks
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Insert or replace chunks by id. Each chunk is written whole.
    async fn upsert(&self, chunks: &[KnowledgeChunk]) -> Result<()>;

    /// Remove every chunk of an org, returning how many were removed
    async fn delete_by_org(&self, org_id: &str) -> Result<u64>;

    /// Remove one chunk of an org
    async fn delete(&self, org_id: &str, id: Uuid) -> Result<bool>;

    /// Up to `k` chunks by cosine similarity, best first; ties go to the newer chunk
    async fn search(&self, query: &[f32], k: usize, filter: &SearchFilter) -> Result<Vec<ScoredChunk>>;

    /// Number of chunks stored for an org
    async fn count(&self, org_id: &str) -> Result<u64>;

    /// Vector dimension the store accepts
    fn dimension(&self) -> usize;
}

/// Reject vectors of the wrong length before they are written
pub(crate) fn check_dimensions(chunks: &[KnowledgeChunk], dimension: usize) -> Result<()> {
    if let Some(bad) = chunks.iter().find(|c| c.embedding.len() != dimension) {
        return Err(Error::DimensionMismatch {
            expected: dimension,
            actual: bad.embedding.len(),
        });
    }
    Ok(())
}

pub(crate) fn check_k(k: usize) -> Result<()> {
    if k == 0 {
        return Err(Error::InvalidInput("search k must be at least 1".to_string()));
    }
    Ok(())
}

/// Cosine similarity, 0.0 for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

/// Order by score descending, then newest first, and keep the top `k`
pub(crate) fn rank(mut results: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.chunk.created_at.cmp(&a.chunk.created_at))
    });
    results.truncate(k);
    results
}

/// Open the configured backend
pub async fn open_store(config: &Config, pool: &SqlitePool) -> Result<Arc<dyn KnowledgeStore>> {
    let dimension = config.embedding.dimension;
    match config.knowledge.backend {
        KnowledgeBackend::Sqlite => {
            let store = SqliteKnowledgeStore::open(pool.clone(), dimension).await?;
            Ok(Arc::new(store))
        }
        KnowledgeBackend::Qdrant => {
            let store = QdrantKnowledgeStore::connect(
                &config.knowledge.qdrant_url,
                config.knowledge.qdrant_api_key(),
                &config.knowledge.collection_name,
                dimension,
            )?;
            store.ensure_collection().await?;
            Ok(Arc::new(store))
        }
    }
}

//! Knowledge base ingestion and inspection
//!
//! Raw text is chunked, embedded in batches and upserted as whole chunks.
//! Operator replies are also remembered as lead-scoped chunks so later
//! turns for that lead can retrieve what a human already promised.

use chrono::Utc;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk::{chunk_text, ChunkLimits, TextChunk};
use crate::config::KnowledgeConfig;
use crate::embed::EmbeddingGateway;
use crate::error::{Error, Result};
use crate::models::{KnowledgeChunk, OrgContext, ScoredChunk};
use crate::store::{KnowledgeStore, SearchFilter};

/// Category of remembered operator replies
pub const CHAT_HISTORY_CATEGORY: &str = "chat_history";

/// Summary of one ingestion
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub title: String,
    pub category: String,
    pub chunks: usize,
    pub chunk_ids: Vec<Uuid>,
}

#[derive(Clone)]
pub struct KnowledgeBase {
    store: Arc<dyn KnowledgeStore>,
    embedder: EmbeddingGateway,
    limits: ChunkLimits,
}

impl KnowledgeBase {
    pub fn new(store: Arc<dyn KnowledgeStore>, embedder: EmbeddingGateway, config: &KnowledgeConfig) -> Self {
        Self {
            store,
            embedder,
            limits: ChunkLimits {
                max_chars: config.chunk_max_chars,
                min_chars: config.chunk_min_chars,
            },
        }
    }

    pub fn store(&self) -> &Arc<dyn KnowledgeStore> {
        &self.store
    }

    /// Chunk, embed and store a document
    pub async fn ingest_text(
        &self,
        ctx: &OrgContext,
        title: &str,
        text: &str,
        category: &str,
    ) -> Result<IngestReport> {
        self.ingest_scoped(ctx, None, title, text, category).await
    }

    async fn ingest_scoped(
        &self,
        ctx: &OrgContext,
        lead_id: Option<Uuid>,
        title: &str,
        text: &str,
        category: &str,
    ) -> Result<IngestReport> {
        let category = normalize_category(category);
        let pieces = chunk_text(text, self.limits);
        let mut report = IngestReport {
            title: title.to_string(),
            category: category.clone(),
            ..IngestReport::default()
        };
        if pieces.is_empty() {
            warn!("Nothing to index for '{}': text is empty or too short", title);
            return Ok(report);
        }

        let texts: Vec<String> = pieces.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        let multi = pieces.len() > 1;
        let now = Utc::now();
        let chunks: Vec<KnowledgeChunk> = pieces
            .iter()
            .zip(vectors)
            .map(|(piece, embedding)| KnowledgeChunk {
                id: chunk_id(ctx, lead_id, piece),
                org_id: ctx.org_id.clone(),
                lead_id,
                category: category.clone(),
                title: if multi {
                    format!("{} (part {})", title, piece.index + 1)
                } else {
                    title.to_string()
                },
                content: piece.text.clone(),
                content_hash: piece.hash.clone(),
                embedding,
                created_at: now,
            })
            .collect();

        self.store.upsert(&chunks).await?;

        report.chunks = chunks.len();
        report.chunk_ids = chunks.iter().map(|c| c.id).collect();
        info!(
            "Indexed '{}' into {} chunks (category {}, org {})",
            title, report.chunks, category, ctx.org_id
        );
        Ok(report)
    }

    /// Ingest a TXT/MD file, or a PDF when built with the `pdf` feature
    pub async fn ingest_file(&self, ctx: &OrgContext, path: &Path, category: &str) -> Result<IngestReport> {
        let text = extract_file_text(path).await?;
        let title = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        self.ingest_text(ctx, &title, &text, category).await
    }

    /// Ranked chunks for a free-text query, for manual inspection
    pub async fn query(
        &self,
        ctx: &OrgContext,
        query: &str,
        limit: usize,
        category: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        let vector = self.embedder.embed(query).await?;
        let mut filter = SearchFilter::org(&ctx.org_id);
        if let Some(category) = category {
            filter = filter.in_category(category);
        }
        self.store.search(&vector, limit.max(1), &filter).await
    }

    pub async fn delete_chunk(&self, ctx: &OrgContext, id: Uuid) -> Result<bool> {
        self.store.delete(&ctx.org_id, id).await
    }

    /// Remove the whole knowledge base of the org
    pub async fn clear(&self, ctx: &OrgContext) -> Result<u64> {
        let removed = self.store.delete_by_org(&ctx.org_id).await?;
        info!("Cleared {} knowledge chunks for org {}", removed, ctx.org_id);
        Ok(removed)
    }

    pub async fn count(&self, ctx: &OrgContext) -> Result<u64> {
        self.store.count(&ctx.org_id).await
    }

    /// Index an operator reply as memory for one lead. Never fails the caller.
    pub async fn remember_operator_message(&self, ctx: &OrgContext, lead_id: Uuid, text: &str) {
        let title = format!("Operator message to lead {}", lead_id);
        match self
            .ingest_scoped(ctx, Some(lead_id), &title, text, CHAT_HISTORY_CATEGORY)
            .await
        {
            Ok(report) => debug!("Remembered operator reply as {} chunks", report.chunks),
            Err(e) => warn!("Failed to index operator reply for lead {}: {}", lead_id, e),
        }
    }
}

fn normalize_category(category: &str) -> String {
    let trimmed = category.trim();
    if trimmed.is_empty() {
        "general".to_string()
    } else {
        trimmed.to_lowercase()
    }
}

fn chunk_id(ctx: &OrgContext, lead_id: Option<Uuid>, piece: &TextChunk) -> Uuid {
    match lead_id {
        None => piece.stable_id(&ctx.org_id),
        Some(lead) => piece.stable_id(&format!("{}/{}", ctx.org_id, lead)),
    }
}

async fn extract_file_text(path: &Path) -> Result<String> {
    let mime = mime_guess::from_path(path).first_or_text_plain();
    debug!("Extracting {} as {}", path.display(), mime);

    match (mime.type_().as_str(), mime.subtype().as_str()) {
        ("text", _) => {
            let bytes = tokio::fs::read(path).await?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        ("application", "pdf") => extract_pdf(path).await,
        _ => Err(Error::UnsupportedContentType(mime.to_string())),
    }
}

#[cfg(feature = "pdf")]
async fn extract_pdf(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || pdf_extract::extract_text(&path))
        .await
        .map_err(|e| Error::Task(format!("PDF extraction: {}", e)))?
        .map_err(|e| Error::InvalidInput(format!("Failed to read PDF: {}", e)))
}

#[cfg(not(feature = "pdf"))]
async fn extract_pdf(_path: &Path) -> Result<String> {
    Err(Error::UnsupportedContentType(
        "application/pdf (rebuild with --features pdf)".to_string(),
    ))
}

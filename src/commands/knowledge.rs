//! Knowledge base commands

use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};
use uuid::Uuid;

use super::preview;
use crate::error::{Error, Result};
use crate::knowledge::{IngestReport, KnowledgeBase};
use crate::models::{OrgContext, ScoredChunk};
use crate::progress::add_progress_bar;

#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadStats {
    pub files_processed: usize,
    pub chunks_created: usize,
    /// Chunks the org has after the upload
    pub total_chunks: u64,
    pub reports: Vec<IngestReport>,
    /// Files that could not be read, with the reason
    pub failures: Vec<(PathBuf, String)>,
}

pub async fn cmd_knowledge_add(
    knowledge: &KnowledgeBase,
    ctx: &OrgContext,
    title: &str,
    text: &str,
    category: &str,
) -> Result<IngestReport> {
    if text.trim().is_empty() {
        return Err(Error::InvalidInput("document text is empty".to_string()));
    }
    knowledge.ingest_text(ctx, title, text, category).await
}

/// Ingest files one by one. A file that cannot be read is reported and
/// skipped; embedding failures abort the upload.
pub async fn cmd_knowledge_upload(
    knowledge: &KnowledgeBase,
    ctx: &OrgContext,
    paths: &[PathBuf],
    category: &str,
) -> Result<UploadStats> {
    let bar = add_progress_bar(paths.len() as u64, "Uploading");
    let mut stats = UploadStats::default();

    for path in paths {
        bar.set_message(path.display().to_string());
        match knowledge.ingest_file(ctx, path, category).await {
            Ok(report) => {
                stats.files_processed += 1;
                stats.chunks_created += report.chunks;
                stats.reports.push(report);
            }
            Err(e @ (Error::Io(_) | Error::UnsupportedContentType(_) | Error::InvalidInput(_))) => {
                warn!("Skipping {}: {}", path.display(), e);
                stats.failures.push((path.clone(), e.to_string()));
            }
            Err(e) => {
                bar.abandon();
                return Err(e);
            }
        }
        bar.inc(1);
    }

    bar.finish_and_clear();
    stats.total_chunks = knowledge.count(ctx).await?;
    info!(
        "Uploaded {} files as {} chunks",
        stats.files_processed, stats.chunks_created
    );
    Ok(stats)
}

pub async fn cmd_knowledge_query(
    knowledge: &KnowledgeBase,
    ctx: &OrgContext,
    query: &str,
    limit: usize,
    category: Option<&str>,
) -> Result<Vec<ScoredChunk>> {
    knowledge.query(ctx, query, limit, category).await
}

pub async fn cmd_knowledge_delete(knowledge: &KnowledgeBase, ctx: &OrgContext, id: Uuid) -> Result<()> {
    if knowledge.delete_chunk(ctx, id).await? {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("no knowledge chunk {}", id)))
    }
}

pub async fn cmd_knowledge_clear(knowledge: &KnowledgeBase, ctx: &OrgContext) -> Result<u64> {
    knowledge.clear(ctx).await
}

pub fn print_ingest_report(report: &IngestReport) {
    println!(
        "✓ Indexed '{}' [{}] as {} chunks",
        report.title, report.category, report.chunks
    );
}

pub fn print_upload_stats(stats: &UploadStats) {
    println!("\n✓ Upload complete");
    println!("  Files processed: {}", stats.files_processed);
    println!("  Chunks created: {}", stats.chunks_created);
    println!("  Knowledge base size: {} chunks", stats.total_chunks);
    for (path, reason) in &stats.failures {
        println!("  ✗ {}: {}", path.display(), reason);
    }
}

pub fn print_knowledge_hits(query: &str, hits: &[ScoredChunk]) {
    println!("\n🔍 Query: {}\n", query);
    if hits.is_empty() {
        println!("No knowledge above the similarity floor.");
        return;
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [similarity: {:.3}] {} ({})",
            i + 1,
            hit.score,
            hit.chunk.title,
            hit.chunk.category
        );
        println!("   ID: {}", hit.chunk.id);
        println!("   {}\n", preview(&hit.chunk.content, 200));
    }
}

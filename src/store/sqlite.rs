//! SQLite knowledge store: one row per chunk, vector stored as a BLOB next
//! to the text so a chunk is never visible half-written.

use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{check_dimensions, check_k, cosine_similarity, rank, KnowledgeStore, SearchFilter};
use crate::error::{Error, Result};
use crate::models::{format_ts, parse_ts, KnowledgeChunk, ScoredChunk};

const KNOWLEDGE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS knowledge_chunks (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    lead_id TEXT,
    category TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_knowledge_org ON knowledge_chunks(org_id, category);
CREATE INDEX IF NOT EXISTS idx_knowledge_lead ON knowledge_chunks(lead_id);
"#;

#[derive(Debug, FromRow)]
struct ChunkRow {
    id: String,
    org_id: String,
    lead_id: Option<String>,
    category: String,
    title: String,
    content: String,
    content_hash: String,
    dimension: i64,
    embedding: Vec<u8>,
    created_at: String,
}

impl ChunkRow {
    fn into_chunk(self) -> Result<KnowledgeChunk> {
        let id = parse_uuid(&self.id)?;
        let lead_id = self.lead_id.as_deref().map(parse_uuid).transpose()?;
        Ok(KnowledgeChunk {
            id,
            org_id: self.org_id,
            lead_id,
            category: self.category,
            title: self.title,
            content: self.content,
            content_hash: self.content_hash,
            embedding: decode_vector(&self.embedding),
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::InvalidInput(format!("bad id '{}': {}", raw, e)))
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Knowledge store sharing the CRM database
#[derive(Clone)]
pub struct SqliteKnowledgeStore {
    pool: SqlitePool,
    dimension: usize,
}

impl SqliteKnowledgeStore {
    /// Open the store, creating its table if needed
    pub async fn open(pool: SqlitePool, dimension: usize) -> Result<Self> {
        sqlx::query(KNOWLEDGE_SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool, dimension })
    }
}

#[async_trait]
impl KnowledgeStore for SqliteKnowledgeStore {
    async fn upsert(&self, chunks: &[KnowledgeChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        check_dimensions(chunks, self.dimension)?;

        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO knowledge_chunks
                    (id, org_id, lead_id, category, title, content, content_hash, dimension, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    category = excluded.category,
                    title = excluded.title,
                    content = excluded.content,
                    content_hash = excluded.content_hash,
                    dimension = excluded.dimension,
                    embedding = excluded.embedding,
                    created_at = excluded.created_at
                "#,
            )
            .bind(chunk.id.to_string())
            .bind(&chunk.org_id)
            .bind(chunk.lead_id.map(|id| id.to_string()))
            .bind(&chunk.category)
            .bind(&chunk.title)
            .bind(&chunk.content)
            .bind(&chunk.content_hash)
            .bind(chunk.embedding.len() as i64)
            .bind(encode_vector(&chunk.embedding))
            .bind(format_ts(&chunk.created_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!("Upserted {} knowledge chunks", chunks.len());
        Ok(())
    }

    async fn delete_by_org(&self, org_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM knowledge_chunks WHERE org_id = ?")
            .bind(org_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, org_id: &str, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM knowledge_chunks WHERE org_id = ? AND id = ?")
            .bind(org_id)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn search(&self, query: &[f32], k: usize, filter: &SearchFilter) -> Result<Vec<ScoredChunk>> {
        check_k(k)?;
        if query.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"
            SELECT * FROM knowledge_chunks
            WHERE org_id = ?
              AND (lead_id IS NULL OR lead_id = ?)
              AND (? IS NULL OR category = ?)
            "#,
        )
        .bind(&filter.org_id)
        .bind(filter.lead_id.map(|id| id.to_string()))
        .bind(&filter.category)
        .bind(&filter.category)
        .fetch_all(&self.pool)
        .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            if row.dimension as usize != self.dimension {
                warn!(
                    "Skipping knowledge chunk {} with dimension {} (store expects {})",
                    row.id, row.dimension, self.dimension
                );
                continue;
            }
            let chunk = row.into_chunk()?;
            let score = cosine_similarity(query, &chunk.embedding);
            scored.push(ScoredChunk { chunk, score });
        }

        Ok(rank(scored, k))
    }

    async fn count(&self, org_id: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM knowledge_chunks WHERE org_id = ?")
            .bind(org_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

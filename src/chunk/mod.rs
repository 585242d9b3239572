//! Text chunking for the knowledge base
//!
//! Documents are split on paragraph boundaries and packed up to a maximum
//! length. Oversized paragraphs fall back to sentence and then word
//! boundaries. Every chunk carries a blake3 hash of its text so identical
//! content maps to the same chunk id.

mod boundaries;

pub use boundaries::*;

use blake3::Hasher;
use uuid::Uuid;

/// A text chunk with metadata
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub text: String,
    /// Chunk index (0-based)
    pub index: usize,
    /// Blake3 hash of the text
    pub hash: String,
}

impl TextChunk {
    pub fn compute_hash(text: &str) -> String {
        let mut hasher = Hasher::new();
        hasher.update(text.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    /// Stable id per org and content, so re-ingesting upserts
    pub fn stable_id(&self, org_id: &str) -> Uuid {
        let namespace = Uuid::new_v5(&Uuid::NAMESPACE_OID, org_id.as_bytes());
        Uuid::new_v5(&namespace, self.hash.as_bytes())
    }
}

/// Chunking limits, in characters
#[derive(Debug, Clone, Copy)]
pub struct ChunkLimits {
    pub max_chars: usize,
    pub min_chars: usize,
}

/// Chunk a document
pub fn chunk_text(text: &str, limits: ChunkLimits) -> Vec<TextChunk> {
    let max_chars = limits.max_chars.max(1);

    let units: Vec<String> = split_paragraphs(text)
        .into_iter()
        .flat_map(|p| split_oversized(p, max_chars, BreakPriority::Paragraph))
        .collect();

    let mut packed = Vec::new();
    let mut current = String::new();
    for unit in units {
        let joined_len = if current.is_empty() {
            char_len(&unit)
        } else {
            char_len(&current) + 2 + char_len(&unit)
        };
        if joined_len > max_chars && !current.is_empty() {
            packed.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(&unit);
    }
    if !current.is_empty() {
        packed.push(current);
    }

    packed
        .into_iter()
        .filter(|c| char_len(c) >= limits.min_chars)
        .enumerate()
        .map(|(index, text)| TextChunk {
            hash: TextChunk::compute_hash(&text),
            text,
            index,
        })
        .collect()
}

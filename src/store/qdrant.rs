//! Qdrant knowledge store

use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, value::Kind, Condition, CountPointsBuilder, CreateCollectionBuilder,
    DeletePointsBuilder, Distance, Filter, PointId, PointStruct, PointsIdsList,
    SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::{check_dimensions, check_k, rank, KnowledgeStore, SearchFilter};
use crate::error::{Error, Result};
use crate::models::{format_ts, parse_ts, KnowledgeChunk, ScoredChunk};

/// Extra candidates fetched past `k` so equal scores at the cut are
/// ordered newest first by [`rank`] rather than by the server.
const TIE_SLACK: usize = 8;

fn candidate_limit(k: usize) -> u64 {
    k.saturating_add(TIE_SLACK) as u64
}

/// Qdrant store handle. Payload carries everything but the vector, so
/// search results come back with an empty `embedding`.
pub struct QdrantKnowledgeStore {
    client: Qdrant,
    collection: String,
    dimension: usize,
}

impl QdrantKnowledgeStore {
    /// Create a client; no request is made until first use
    pub fn connect(
        url: &str,
        api_key: Option<String>,
        collection: &str,
        dimension: usize,
    ) -> Result<Self> {
        debug!("Connecting to Qdrant at {}", url);

        let client = Qdrant::from_url(url)
            .api_key(api_key)
            .skip_compatibility_check()
            .build()?;

        Ok(Self {
            client,
            collection: collection.to_string(),
            dimension,
        })
    }

    /// Ensure the collection exists with cosine distance
    pub async fn ensure_collection(&self) -> Result<()> {
        if self.client.collection_exists(&self.collection).await? {
            debug!("Collection {} already exists", self.collection);
            return Ok(());
        }

        info!(
            "Creating collection {} with dimension {}",
            self.collection, self.dimension
        );
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection).vectors_config(
                    VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
                ),
            )
            .await?;
        Ok(())
    }

    fn org_filter(&self, org_id: &str) -> Filter {
        Filter::must([Condition::matches("org_id", org_id.to_string())])
    }
}

fn search_filter(filter: &SearchFilter) -> Filter {
    let mut must = vec![Condition::matches("org_id", filter.org_id.clone())];

    match filter.lead_id {
        Some(lead) => must.push(
            Filter::should([
                Condition::is_empty("lead_id"),
                Condition::matches("lead_id", lead.to_string()),
            ])
            .into(),
        ),
        None => must.push(Condition::is_empty("lead_id")),
    }

    if let Some(category) = &filter.category {
        must.push(Condition::matches("category", category.clone()));
    }

    Filter::must(must)
}

fn string_to_qdrant(s: &str) -> QdrantValue {
    QdrantValue {
        kind: Some(Kind::StringValue(s.to_string())),
    }
}

fn chunk_payload(chunk: &KnowledgeChunk) -> HashMap<String, QdrantValue> {
    let mut map = HashMap::new();
    map.insert("org_id".to_string(), string_to_qdrant(&chunk.org_id));
    map.insert("category".to_string(), string_to_qdrant(&chunk.category));
    map.insert("title".to_string(), string_to_qdrant(&chunk.title));
    map.insert("content".to_string(), string_to_qdrant(&chunk.content));
    map.insert("content_hash".to_string(), string_to_qdrant(&chunk.content_hash));
    map.insert("created_at".to_string(), string_to_qdrant(&format_ts(&chunk.created_at)));
    if let Some(lead) = chunk.lead_id {
        map.insert("lead_id".to_string(), string_to_qdrant(&lead.to_string()));
    }
    map
}

fn payload_str(payload: &Map<String, Value>, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn chunk_from_payload(id: Option<PointId>, payload: Map<String, Value>) -> Result<KnowledgeChunk> {
    let id = match id.and_then(|p| p.point_id_options) {
        Some(PointIdOptions::Uuid(raw)) => Uuid::parse_str(&raw)
            .map_err(|e| Error::StoreUnavailable(format!("bad point id {}: {}", raw, e)))?,
        _ => return Err(Error::StoreUnavailable("point without uuid id".to_string())),
    };
    let lead_id = payload
        .get("lead_id")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok());

    Ok(KnowledgeChunk {
        id,
        org_id: payload_str(&payload, "org_id"),
        lead_id,
        category: payload_str(&payload, "category"),
        title: payload_str(&payload, "title"),
        content: payload_str(&payload, "content"),
        content_hash: payload_str(&payload, "content_hash"),
        embedding: Vec::new(),
        created_at: parse_ts(&payload_str(&payload, "created_at"))?,
    })
}

/// Convert Qdrant value to serde_json Value
fn json_from_qdrant_value(v: QdrantValue) -> Value {
    match v.kind {
        Some(Kind::NullValue(_)) | None => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntegerValue(i)) => Value::Number(i.into()),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::ListValue(list)) => {
            Value::Array(list.values.into_iter().map(json_from_qdrant_value).collect())
        }
        Some(Kind::StructValue(s)) => Value::Object(
            s.fields
                .into_iter()
                .map(|(k, v)| (k, json_from_qdrant_value(v)))
                .collect(),
        ),
    }
}

#[async_trait]
impl KnowledgeStore for QdrantKnowledgeStore {
    async fn upsert(&self, chunks: &[KnowledgeChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        check_dimensions(chunks, self.dimension)?;

        let points: Vec<PointStruct> = chunks
            .iter()
            .map(|c| PointStruct::new(c.id.to_string(), c.embedding.clone(), chunk_payload(c)))
            .collect();

        debug!("Upserting {} points to collection {}", points.len(), self.collection);
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await?;
        Ok(())
    }

    async fn delete_by_org(&self, org_id: &str) -> Result<u64> {
        let existing = self.count(org_id).await?;
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(self.org_filter(org_id))
                    .wait(true),
            )
            .await?;
        Ok(existing)
    }

    async fn delete(&self, org_id: &str, id: Uuid) -> Result<bool> {
        let filter = Filter::must([
            Condition::matches("org_id", org_id.to_string()),
            Condition::has_id([PointId::from(id.to_string())]),
        ]);
        let before = self
            .client
            .count(CountPointsBuilder::new(&self.collection).filter(filter).exact(true))
            .await?
            .result
            .map(|r| r.count)
            .unwrap_or(0);
        if before == 0 {
            return Ok(false);
        }

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(PointsIdsList {
                        ids: vec![PointId::from(id.to_string())],
                    })
                    .wait(true),
            )
            .await?;
        Ok(true)
    }

    async fn search(&self, query: &[f32], k: usize, filter: &SearchFilter) -> Result<Vec<ScoredChunk>> {
        check_k(k)?;
        if query.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, query.to_vec(), candidate_limit(k))
                    .filter(search_filter(filter))
                    .with_payload(true),
            )
            .await?;

        let mut scored = Vec::with_capacity(response.result.len());
        for point in response.result {
            let payload: Map<String, Value> = point
                .payload
                .into_iter()
                .map(|(k, v)| (k, json_from_qdrant_value(v)))
                .collect();
            let chunk = chunk_from_payload(point.id, payload)?;
            scored.push(ScoredChunk {
                chunk,
                score: point.score,
            });
        }

        Ok(rank(scored, k))
    }

    async fn count(&self, org_id: &str) -> Result<u64> {
        let response = self
            .client
            .count(
                CountPointsBuilder::new(&self.collection)
                    .filter(self.org_filter(org_id))
                    .exact(true),
            )
            .await?;
        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk(lead: Option<Uuid>) -> KnowledgeChunk {
        KnowledgeChunk {
            id: Uuid::new_v4(),
            org_id: "org".into(),
            lead_id: lead,
            category: "faq".into(),
            title: "Сроки".into(),
            content: "Косметический ремонт занимает от 3 недель".into(),
            content_hash: "abc".into(),
            embedding: vec![0.1, 0.2, 0.3],
            created_at: parse_ts("2026-03-01T10:00:00.123456Z").unwrap(),
        }
    }

    #[test]
    fn test_search_filter_conditions() {
        let filter = SearchFilter::org("org").in_category("faq");
        assert_eq!(search_filter(&filter).must.len(), 3);
        let scoped = SearchFilter::org("org").for_lead(Uuid::new_v4());
        assert_eq!(search_filter(&scoped).must.len(), 2);
    }

    #[test]
    fn test_payload_roundtrip() {
        let lead = Uuid::new_v4();
        let chunk = sample_chunk(Some(lead));
        let payload: Map<String, Value> = chunk_payload(&chunk)
            .into_iter()
            .map(|(k, v)| (k, json_from_qdrant_value(v)))
            .collect();
        let id = Some(PointId::from(chunk.id.to_string()));
        let restored = chunk_from_payload(id, payload).unwrap();
        assert_eq!(restored.id, chunk.id);
        assert_eq!(restored.lead_id, Some(lead));
        assert_eq!(restored.content, chunk.content);
        assert_eq!(restored.created_at, chunk.created_at);
        assert!(restored.embedding.is_empty());
    }

    #[test]
    fn test_overfetched_ties_keep_newest_at_cut() {
        // Server order for an equal score is arbitrary; the newer chunk sits
        // past `k` in the raw response
        let mut older = sample_chunk(None);
        older.created_at = parse_ts("2026-01-01T00:00:00Z").unwrap();
        let newer = sample_chunk(None);
        let top = sample_chunk(None);
        let response = vec![
            ScoredChunk { chunk: top.clone(), score: 0.9 },
            ScoredChunk { chunk: older, score: 0.5 },
            ScoredChunk { chunk: newer.clone(), score: 0.5 },
        ];
        assert!(candidate_limit(2) as usize >= response.len());

        let ranked = rank(response, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].chunk.id, top.id);
        assert_eq!(ranked[1].chunk.id, newer.id);
    }

    #[tokio::test]
    async fn test_upsert_rejects_dimension_mismatch() {
        let store = QdrantKnowledgeStore::connect("http://127.0.0.1:6334", None, "test", 4)
            .expect("client builds without a server");
        let err = store.upsert(&[sample_chunk(None)]).await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 4, actual: 3 }));
    }
}

//! Retrieval of knowledge context for a turn
//!
//! Retrieval never fails the turn: embedding errors, store errors and
//! search timeouts all degrade to an empty context, recorded in the trace.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::embed::EmbeddingGateway;
use crate::error::Error;
use crate::models::{OrgContext, ScoredChunk};
use crate::store::{KnowledgeStore, SearchFilter};

/// Context chunks for one turn
#[derive(Debug, Default)]
pub struct RetrievedContext {
    /// Best first, all at or above the similarity floor
    pub chunks: Vec<ScoredChunk>,
    /// Why retrieval came back empty, when it failed
    pub degraded: Option<String>,
    /// Configuration error an operator must see
    pub config_alert: Option<Error>,
}

impl RetrievedContext {
    fn degraded(error: Error) -> Self {
        let reason = error.to_string();
        Self {
            chunks: Vec::new(),
            degraded: Some(reason),
            config_alert: error.is_config_alert().then_some(error),
        }
    }
}

#[derive(Clone)]
pub struct RetrievalPlanner {
    store: Arc<dyn KnowledgeStore>,
    embedder: EmbeddingGateway,
    default_k: usize,
    max_k: usize,
    min_score: f32,
    search_timeout: Duration,
}

impl RetrievalPlanner {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        embedder: EmbeddingGateway,
        config: &RetrievalConfig,
        search_timeout: Duration,
    ) -> Self {
        let max_k = config.max_k.max(1);
        Self {
            store,
            embedder,
            default_k: config.default_k.clamp(1, max_k),
            max_k,
            min_score: config.min_score,
            search_timeout,
        }
    }

    /// Fetch context for `query`. With a lead, that lead's own remembered
    /// chunks are searched alongside the org-wide knowledge.
    pub async fn retrieve(
        &self,
        ctx: &OrgContext,
        lead_id: Option<Uuid>,
        query: &str,
        k: Option<usize>,
    ) -> RetrievedContext {
        let query = query.trim();
        if query.is_empty() {
            return RetrievedContext::default();
        }
        let k = k.unwrap_or(self.default_k).clamp(1, self.max_k);

        let vector = match self.embedder.embed(query).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!("Retrieval degraded, query embedding failed: {}", e);
                return RetrievedContext::degraded(e);
            }
        };

        let mut filter = SearchFilter::org(&ctx.org_id);
        if let Some(lead) = lead_id {
            filter = filter.for_lead(lead);
        }

        let found = match tokio::time::timeout(self.search_timeout, self.store.search(&vector, k, &filter)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!("Retrieval degraded, knowledge search failed: {}", e);
                return RetrievedContext::degraded(e);
            }
            Err(_) => {
                warn!("Retrieval degraded, knowledge search timed out after {:?}", self.search_timeout);
                return RetrievedContext::degraded(Error::StoreUnavailable(format!(
                    "search timed out after {:?}",
                    self.search_timeout
                )));
            }
        };

        let total = found.len();
        let chunks: Vec<ScoredChunk> = found
            .into_iter()
            .filter(|c| c.score >= self.min_score)
            .collect();
        debug!(
            "Retrieved {} of {} chunks above similarity {:.2}",
            chunks.len(),
            total,
            self.min_score
        );

        RetrievedContext {
            chunks,
            degraded: None,
            config_alert: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::models::KnowledgeChunk;
    use crate::testing::{HashEmbeddingProvider, TestEnv};
    use async_trait::async_trait;

    struct BrokenStore {
        hang: bool,
    }

    #[async_trait]
    impl KnowledgeStore for BrokenStore {
        async fn upsert(&self, _chunks: &[KnowledgeChunk]) -> Result<()> {
            Ok(())
        }

        async fn delete_by_org(&self, _org_id: &str) -> Result<u64> {
            Ok(0)
        }

        async fn delete(&self, _org_id: &str, _id: Uuid) -> Result<bool> {
            Ok(false)
        }

        async fn search(&self, _query: &[f32], _k: usize, _filter: &SearchFilter) -> Result<Vec<ScoredChunk>> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Err(Error::StoreUnavailable("connection refused".to_string()))
        }

        async fn count(&self, _org_id: &str) -> Result<u64> {
            Ok(0)
        }

        fn dimension(&self) -> usize {
            TestEnv::DIMENSION
        }
    }

    #[tokio::test]
    async fn test_relevant_chunks_above_floor() {
        let env = TestEnv::new().await;
        let ctx = env.ctx();
        let faq = "Выезд замерщика по Москве бесплатный.";
        env.knowledge.ingest_text(&ctx, "Замер", faq, "faq").await.unwrap();
        env.knowledge
            .ingest_text(&ctx, "Оплата", "Принимаем оплату картой и переводом на счёт.", "faq")
            .await
            .unwrap();

        let context = env.retrieval().retrieve(&ctx, None, faq, None).await;
        assert!(context.degraded.is_none());
        assert_eq!(context.chunks[0].chunk.title, "Замер");
        assert!(context.chunks.iter().all(|c| c.score >= env.config.retrieval.min_score));
    }

    #[tokio::test]
    async fn test_k_is_clamped() {
        let env = TestEnv::new().await;
        let ctx = env.ctx();
        for i in 0..8 {
            let text = format!("Ремонт ванной комнаты под ключ, вариант номер {}", i);
            env.knowledge.ingest_text(&ctx, "Ванная", &text, "faq").await.unwrap();
        }
        let context = env
            .retrieval()
            .retrieve(&ctx, None, "ремонт ванной комнаты под ключ", Some(50))
            .await;
        assert_eq!(context.chunks.len(), env.config.retrieval.max_k);
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_empty() {
        let env = TestEnv::new().await;
        let planner = RetrievalPlanner::new(
            Arc::new(BrokenStore { hang: false }),
            env.embedder.clone(),
            &env.config.retrieval,
            Duration::from_secs(1),
        );
        let context = planner.retrieve(&env.ctx(), None, "сколько стоит", None).await;
        assert!(context.chunks.is_empty());
        assert!(context.degraded.unwrap().contains("connection refused"));
        assert!(context.config_alert.is_none());
    }

    #[tokio::test]
    async fn test_search_timeout_degrades_to_empty() {
        let env = TestEnv::new().await;
        let planner = RetrievalPlanner::new(
            Arc::new(BrokenStore { hang: true }),
            env.embedder.clone(),
            &env.config.retrieval,
            Duration::from_millis(50),
        );
        let context = planner.retrieve(&env.ctx(), None, "сколько стоит", None).await;
        assert!(context.chunks.is_empty());
        assert!(context.degraded.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_raises_alert() {
        let env = TestEnv::new().await;
        let wrong = EmbeddingGateway::new(Arc::new(HashEmbeddingProvider::new(8)), &env.config.embedding);
        let planner = RetrievalPlanner::new(
            env.store.clone(),
            wrong,
            &env.config.retrieval,
            Duration::from_secs(1),
        );
        let context = planner.retrieve(&env.ctx(), None, "сколько стоит", None).await;
        assert!(context.chunks.is_empty());
        assert!(matches!(
            context.config_alert,
            Some(Error::DimensionMismatch { .. })
        ));
    }
}

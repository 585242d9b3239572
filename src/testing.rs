//! Deterministic providers and an on-disk environment for tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use unicode_segmentation::UnicodeSegmentation;

use crate::complete::{CompletionGateway, CompletionOptions, CompletionProvider, PromptMessage};
use crate::config::Config;
use crate::db::{CrmDb, LeadStore};
use crate::embed::{EmbeddingGateway, EmbeddingProvider};
use crate::engine::QualificationEngine;
use crate::error::CallError;
use crate::knowledge::KnowledgeBase;
use crate::models::OrgContext;
use crate::retrieve::RetrievalPlanner;
use crate::store::{KnowledgeStore, SqliteKnowledgeStore};

/// Bag-of-words embedder: each lowercased word is hashed into a bucket and
/// the counts are L2-normalized. Identical texts embed identically.
pub struct HashEmbeddingProvider {
    dimension: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text.unicode_words() {
            let hash = blake3::hash(word.to_lowercase().as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&hash.as_bytes()[..8]);
            let bucket = (u64::from_le_bytes(bytes) % self.dimension as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CallError> {
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }

    fn model_name(&self) -> &str {
        "hash-bow"
    }
}

type Responder = Box<dyn Fn(&[PromptMessage]) -> Option<String> + Send + Sync>;

/// Completion provider driven by a closure. `None` from the closure is a
/// transient provider failure.
pub struct ScriptedCompletion {
    responder: Responder,
    delay: Option<Duration>,
    calls: AtomicU32,
    models: Mutex<Vec<String>>,
    prompts: Mutex<Vec<Vec<PromptMessage>>>,
}

impl ScriptedCompletion {
    pub fn responding<F>(responder: F) -> Self
    where
        F: Fn(&[PromptMessage]) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: None,
            calls: AtomicU32::new(0),
            models: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always the same reply
    pub fn replying(reply: &str) -> Self {
        let reply = reply.to_string();
        Self::responding(move |_| Some(reply.clone()))
    }

    /// Replies in order, then failures
    pub fn queued(replies: &[&str]) -> Self {
        let queue: Mutex<VecDeque<String>> =
            Mutex::new(replies.iter().map(|r| r.to_string()).collect());
        Self::responding(move |_| queue.lock().unwrap().pop_front())
    }

    pub fn failing() -> Self {
        Self::responding(|_| None)
    }

    /// Never answers within any reasonable timeout
    pub fn hanging() -> Self {
        let mut scripted = Self::replying("{}");
        scripted.delay = Some(Duration::from_secs(3600));
        scripted
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn models_seen(&self) -> Vec<String> {
        self.models.lock().unwrap().clone()
    }

    pub fn last_prompt(&self) -> Option<Vec<PromptMessage>> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedCompletion {
    async fn complete_raw(
        &self,
        messages: &[PromptMessage],
        options: &CompletionOptions,
    ) -> Result<String, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.models.lock().unwrap().push(options.model.clone());
        self.prompts.lock().unwrap().push(messages.to_vec());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(messages).ok_or_else(|| CallError::transient("scripted provider failure"))
    }
}

/// Temporary database, SQLite knowledge store and hash embedder
pub struct TestEnv {
    pub config: Config,
    pub db: CrmDb,
    pub leads: Arc<dyn LeadStore>,
    pub store: Arc<dyn KnowledgeStore>,
    pub embedder: EmbeddingGateway,
    pub knowledge: KnowledgeBase,
    _tmp: TempDir,
}

impl TestEnv {
    pub const DIMENSION: usize = 64;
    pub const ORG: &'static str = "test-org";

    pub async fn new() -> Self {
        Self::build(Config::default()).await
    }

    pub async fn with_chunk_limits(max_chars: usize, min_chars: usize) -> Self {
        let mut config = Config::default();
        config.knowledge.chunk_max_chars = max_chars;
        config.knowledge.chunk_min_chars = min_chars;
        Self::build(config).await
    }

    async fn build(mut config: Config) -> Self {
        let tmp = TempDir::new().unwrap();
        config.paths.db_file = tmp.path().join("crm.db");
        config.embedding.dimension = Self::DIMENSION;
        config.embedding.backoff_ms = 1;
        config.completion.backoff_ms = 1;

        let db = CrmDb::connect(&config).await.unwrap();
        db.init_schema().await.unwrap();
        let store: Arc<dyn KnowledgeStore> = Arc::new(
            SqliteKnowledgeStore::open(db.pool().clone(), Self::DIMENSION)
                .await
                .unwrap(),
        );
        let embedder = EmbeddingGateway::new(
            Arc::new(HashEmbeddingProvider::new(Self::DIMENSION)),
            &config.embedding,
        );
        let knowledge = KnowledgeBase::new(store.clone(), embedder.clone(), &config.knowledge);

        Self {
            leads: Arc::new(db.clone()),
            config,
            db,
            store,
            embedder,
            knowledge,
            _tmp: tmp,
        }
    }

    pub fn ctx(&self) -> OrgContext {
        OrgContext::system(Self::ORG)
    }

    pub fn operator(&self) -> OrgContext {
        OrgContext::operator(Self::ORG, "anna")
    }

    pub fn retrieval(&self) -> RetrievalPlanner {
        RetrievalPlanner::new(
            self.store.clone(),
            self.embedder.clone(),
            &self.config.retrieval,
            self.config.knowledge.search_timeout(),
        )
    }

    pub fn completion(&self, provider: Arc<ScriptedCompletion>) -> CompletionGateway {
        CompletionGateway::new(provider, &self.config.completion)
    }

    pub fn engine(&self, provider: Arc<ScriptedCompletion>) -> QualificationEngine {
        self.engine_with(self.completion(provider))
    }

    pub fn engine_with(&self, completion: CompletionGateway) -> QualificationEngine {
        QualificationEngine::new(self.leads.clone(), self.retrieval(), completion, &self.config)
    }
}

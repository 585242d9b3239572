//! Embedding generation
//!
//! This module provides:
//! - A trait for embedding providers
//! - An OpenAI-compatible HTTP provider
//! - The gateway that truncates inputs, retries transient failures, and
//!   checks every vector against the configured dimension

mod http_backend;

pub use http_backend::*;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::EmbeddingConfig;
use crate::error::{CallError, Error, Result};
use crate::provider::RetryPolicy;

/// Trait for embedding providers
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, one vector per input in input order
    async fn embed_texts(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, CallError>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Validating, retrying front of an [`EmbeddingProvider`]
#[derive(Clone)]
pub struct EmbeddingGateway {
    provider: Arc<dyn EmbeddingProvider>,
    dimension: usize,
    max_input_chars: usize,
    batch_size: usize,
    retry: RetryPolicy,
}

impl EmbeddingGateway {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            dimension: config.dimension,
            max_input_chars: config.max_input_chars,
            batch_size: config.batch_size.max(1),
            retry: RetryPolicy::new(
                config.max_attempts,
                Duration::from_millis(config.backoff_ms),
                config.timeout(),
            ),
        }
    }

    /// Build the gateway for the configured HTTP provider
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let provider = HttpEmbeddingProvider::new(config)?;
        Ok(Self::new(Arc::new(provider), config))
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Embed one text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::EmbeddingUnavailable("provider returned no vector".to_string()))
    }

    /// Embed many texts, preserving order
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let prepared = texts
            .iter()
            .map(|t| self.prepare(t))
            .collect::<Result<Vec<_>>>()?;

        let mut all_embeddings = Vec::with_capacity(prepared.len());
        for batch in prepared.chunks(self.batch_size) {
            let vectors = self
                .retry
                .run("embedding request", || self.provider.embed_texts(batch))
                .await
                .map_err(|e| {
                    error!("Embedding failed after retries: {}", e);
                    Error::EmbeddingUnavailable(e.message)
                })?;

            if vectors.len() != batch.len() {
                return Err(Error::EmbeddingUnavailable(format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            self.validate_dimensions(&vectors)?;
            all_embeddings.extend(vectors);
        }

        debug!("Embedded {} texts with {}", texts.len(), self.model_name());
        Ok(all_embeddings)
    }

    fn prepare(&self, text: &str) -> Result<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("cannot embed empty text".to_string()));
        }
        if trimmed.chars().count() > self.max_input_chars {
            debug!("Truncating embedding input to {} chars", self.max_input_chars);
            return Ok(trimmed.chars().take(self.max_input_chars).collect());
        }
        Ok(trimmed.to_string())
    }

    fn validate_dimensions(&self, embeddings: &[Vec<f32>]) -> Result<()> {
        if let Some(mismatch) = embeddings.iter().find(|v| v.len() != self.dimension) {
            error!(
                "Embedding dimension mismatch for model '{}': expected {}, got {}",
                self.model_name(),
                self.dimension,
                mismatch.len()
            );
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: mismatch.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HashEmbeddingProvider;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(dimension: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            dimension,
            max_input_chars: 10,
            batch_size: 2,
            backoff_ms: 1,
            ..EmbeddingConfig::default()
        }
    }

    struct FlakyProvider {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        async fn embed_texts(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, CallError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(CallError::transient("503 Service Unavailable"));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }

        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_count() {
        let gateway = EmbeddingGateway::new(Arc::new(HashEmbeddingProvider::new(16)), &config(16));
        let texts: Vec<String> = ["кухня", "ванная", "кухня", "санузел", "пол"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let vectors = gateway.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 5);
        assert_eq!(vectors[0], vectors[2]);
        assert_ne!(vectors[0], vectors[1]);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_loud() {
        let gateway = EmbeddingGateway::new(Arc::new(HashEmbeddingProvider::new(8)), &config(16));
        let err = gateway.embed("ремонт").await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 16, actual: 8 }));
    }

    #[tokio::test]
    async fn test_transient_failures_retried_then_exhausted() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            failures: 2,
        });
        let gateway = EmbeddingGateway::new(provider.clone(), &config(3));
        assert!(gateway.embed("hello").await.is_ok());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

        let always_down = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            failures: u32::MAX,
        });
        let gateway = EmbeddingGateway::new(always_down.clone(), &config(3));
        let err = gateway.embed("hello").await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingUnavailable(_)));
        assert_eq!(always_down.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let gateway = EmbeddingGateway::new(Arc::new(HashEmbeddingProvider::new(4)), &config(4));
        assert!(matches!(gateway.embed("   ").await, Err(Error::InvalidInput(_))));
    }
}

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use super::EmbeddingProvider;
use crate::config::EmbeddingConfig;
use crate::error::{CallError, Result};
use crate::provider::{endpoint, http_client, post_json};

/// OpenAI-compatible `/embeddings` client
pub struct HttpEmbeddingProvider {
    client: Client,
    url: Url,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    Data { data: Vec<EmbeddingData> },
    Embeddings { embeddings: Vec<Vec<f32>> },
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl EmbeddingResponse {
    fn into_embeddings(self) -> Vec<Vec<f32>> {
        match self {
            EmbeddingResponse::Embeddings { embeddings } => embeddings,
            EmbeddingResponse::Data { mut data } => {
                if data.iter().all(|d| d.index.is_some()) {
                    data.sort_by_key(|d| d.index);
                }
                data.into_iter().map(|d| d.embedding).collect()
            }
        }
    }
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            url: endpoint(&config.base_url, "embeddings")?,
            model: config.model.clone(),
            api_key: config.api_key(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, CallError> {
        let request = EmbedRequest {
            model: &self.model,
            input: texts,
        };
        let response: EmbeddingResponse =
            post_json(&self.client, self.url.clone(), self.api_key.as_deref(), &request).await?;
        Ok(response.into_embeddings())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

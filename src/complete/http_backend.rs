use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{CompletionOptions, CompletionProvider, PromptMessage};
use crate::config::CompletionConfig;
use crate::error::{CallError, Result};
use crate::provider::{endpoint, http_client, post_json};

/// OpenAI-compatible `/chat/completions` client (OpenRouter, vLLM, Ollama, ...)
pub struct OpenAiCompatibleProvider {
    client: Client,
    url: Url,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            url: endpoint(&config.base_url, "chat/completions")?,
            api_key: config.api_key(),
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleProvider {
    async fn complete_raw(
        &self,
        messages: &[PromptMessage],
        options: &CompletionOptions,
    ) -> std::result::Result<String, CallError> {
        let request = ChatRequest {
            model: &options.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            response_format: options.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response: ChatResponse =
            post_json(&self.client, self.url.clone(), self.api_key.as_deref(), &request).await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| CallError::fatal("provider returned an empty completion"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::complete::{CompletionGateway, ResponseSchema};
    use crate::error::Error;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> CompletionConfig {
        CompletionConfig {
            base_url: format!("{}/api/v1", server.uri()),
            model: "test/model".to_string(),
            api_key_env: "LEADQ_TEST_UNSET_KEY".to_string(),
            max_attempts: 1,
            backoff_ms: 1,
            ..CompletionConfig::default()
        }
    }

    fn chat_body(content: &str) -> serde_json::Value {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
    }

    #[tokio::test]
    async fn test_requests_json_object_and_parses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .and(body_partial_json(json!({
                "model": "test/model",
                "response_format": {"type": "json_object"},
                "messages": [{"role": "user", "content": "Привет"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(
                r#"{"reply_text": "Здравствуйте!", "extracted_fields": {"budget": 300000}}"#,
            )))
            .mount(&server)
            .await;

        let gateway = CompletionGateway::from_config(&config_for(&server)).unwrap();
        let reply = gateway
            .complete(
                &[PromptMessage::user("Привет")],
                &ResponseSchema::new(vec!["budget".into()], vec![]),
                None,
            )
            .await
            .unwrap();
        assert_eq!(reply.reply_text, "Здравствуйте!");
        assert_eq!(reply.extracted_fields["budget"], json!(300000));
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(chat_body(r#"{"reply_text": "late"}"#))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let config = config_for(&server);
        let provider = OpenAiCompatibleProvider::new(&config).unwrap();
        let gateway = CompletionGateway::new(std::sync::Arc::new(provider), &config)
            .with_timeout(Duration::from_millis(100));

        let err = gateway
            .complete(&[PromptMessage::user("hi")], &ResponseSchema::new(vec![], vec![]), None)
            .await
            .unwrap_err();
        match err {
            Error::CompletionFailed(message) => assert!(message.contains("timed out")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_choices_fail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let gateway = CompletionGateway::from_config(&config_for(&server)).unwrap();
        let result = gateway
            .complete(&[PromptMessage::user("hi")], &ResponseSchema::new(vec![], vec![]), None)
            .await;
        assert!(matches!(result, Err(Error::CompletionFailed(_))));
    }
}

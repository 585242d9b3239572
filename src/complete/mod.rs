//! Chat completion
//!
//! The gateway turns an ordered prompt into a [`StructuredReply`]: it calls
//! the provider with retries and a per-attempt timeout, then recovers the
//! JSON payload. Any failure surfaces as `CompletionFailed`.

mod http_backend;
pub mod parse;

pub use http_backend::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::CompletionConfig;
use crate::error::{CallError, Error, Result};
use crate::provider::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of the assembled prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Shape of the JSON object the model must return
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSchema {
    pub field_keys: Vec<String>,
    pub statuses: Vec<String>,
}

impl ResponseSchema {
    pub fn new(field_keys: Vec<String>, statuses: Vec<String>) -> Self {
        Self {
            field_keys,
            statuses,
        }
    }

    /// Output-format instructions appended to the system prompt
    pub fn instructions(&self) -> String {
        let fields = self
            .field_keys
            .iter()
            .map(|k| format!("    \"{}\": value or null", k))
            .collect::<Vec<_>>()
            .join(",\n");
        format!(
            "Respond with a single JSON object and nothing else:\n\
             {{\n  \"reply_text\": \"message to send to the client\",\n  \
             \"extracted_fields\": {{\n{}\n  }},\n  \
             \"status_suggestion\": one of [{}] or null,\n  \
             \"qualification_flag\": \"handoff_required\" or null,\n  \
             \"summary\": \"short synopsis of the lead\",\n  \
             \"is_hot_lead\": true or false,\n  \
             \"confidence\": 0-100,\n  \
             \"client_name\": string or null,\n  \
             \"phone\": string or null\n}}\n\
             Only use the keys listed in extracted_fields. Use null when the client has not said.",
            fields,
            self.statuses.join(", ")
        )
    }
}

/// Parsed model output for one turn
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StructuredReply {
    pub reply_text: String,
    /// Raw proposed values, validated later against the field schema
    pub extracted_fields: Map<String, Value>,
    pub status_suggestion: Option<String>,
    pub qualification_flag: Option<String>,
    pub summary: Option<String>,
    pub is_hot_lead: bool,
    pub confidence: Option<u8>,
    pub client_name: Option<String>,
    pub phone: Option<String>,
}

/// Per-call options
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub json_mode: bool,
}

/// Trait for completion providers. Returns the raw assistant text.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete_raw(
        &self,
        messages: &[PromptMessage],
        options: &CompletionOptions,
    ) -> std::result::Result<String, CallError>;
}

#[derive(Clone)]
pub struct CompletionGateway {
    provider: Arc<dyn CompletionProvider>,
    defaults: CompletionOptions,
    retry: RetryPolicy,
}

impl CompletionGateway {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: &CompletionConfig) -> Self {
        Self {
            provider,
            defaults: CompletionOptions {
                model: config.model.clone(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                json_mode: config.json_mode,
            },
            retry: RetryPolicy::new(
                config.max_attempts,
                Duration::from_millis(config.backoff_ms),
                config.timeout(),
            ),
        }
    }

    /// Build the gateway for the configured HTTP provider
    pub fn from_config(config: &CompletionConfig) -> Result<Self> {
        let provider = OpenAiCompatibleProvider::new(config)?;
        Ok(Self::new(Arc::new(provider), config))
    }

    /// Override the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.retry.attempt_timeout = timeout;
        self
    }

    pub fn default_model(&self) -> &str {
        &self.defaults.model
    }

    /// Run one completion. `model` overrides the configured model.
    pub async fn complete(
        &self,
        messages: &[PromptMessage],
        schema: &ResponseSchema,
        model: Option<&str>,
    ) -> Result<StructuredReply> {
        if messages.is_empty() {
            return Err(Error::InvalidInput("prompt has no messages".to_string()));
        }

        let mut options = self.defaults.clone();
        if let Some(model) = model.filter(|m| !m.trim().is_empty()) {
            options.model = model.to_string();
        }

        let raw = self
            .retry
            .run("completion request", || {
                self.provider.complete_raw(messages, &options)
            })
            .await
            .map_err(|e| {
                error!("Completion failed with model {}: {}", options.model, e);
                Error::CompletionFailed(e.message)
            })?;

        let reply = parse::parse_reply(&raw)?;
        debug!(
            "Completion parsed: {} fields proposed, status suggestion {:?}, {} expected keys",
            reply.extracted_fields.len(),
            reply.status_suggestion,
            schema.field_keys.len()
        );
        Ok(reply)
    }
}

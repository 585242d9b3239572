//! Default values for configuration

/// Organization used by the CLI request context
pub fn default_org_id() -> String {
    std::env::var("LEADQ_ORG_ID").unwrap_or_else(|_| "default".to_string())
}

/// Default knowledge store backend
pub fn default_knowledge_backend() -> String {
    "sqlite".to_string()
}

/// Default Qdrant gRPC URL for local development (port 6334, not 6333 REST)
pub fn default_qdrant_url() -> String {
    std::env::var("QDRANT_URL").unwrap_or_else(|_| "http://127.0.0.1:6334".to_string())
}

/// Default environment variable name for Qdrant API key
pub fn default_qdrant_api_key_env() -> String {
    "".to_string()
}

/// Default collection name
pub fn default_collection_name() -> String {
    "leadq_knowledge".to_string()
}

/// Default maximum characters per chunk
pub fn default_chunk_max_chars() -> usize {
    500
}

/// Default minimum characters per chunk
pub fn default_chunk_min_chars() -> usize {
    20
}

/// Knowledge search timeout in seconds
pub fn default_search_timeout() -> u64 {
    5
}

/// OpenAI-compatible API base shared by embeddings and completions
pub fn default_provider_base_url() -> String {
    std::env::var("LEADQ_PROVIDER_URL").unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string())
}

/// Environment variable holding the provider API key
pub fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

/// Default embedding model
pub fn default_embedding_model() -> String {
    "openai/text-embedding-3-small".to_string()
}

/// Dimension of text-embedding-3-small
pub fn default_embedding_dimension() -> usize {
    1536
}

/// Characters sent to the embedding provider per input
pub fn default_embedding_max_input_chars() -> usize {
    8000
}

/// Default batch size for embedding
pub fn default_embedding_batch_size() -> usize {
    32
}

/// Embedding request timeout in seconds
pub fn default_embedding_timeout() -> u64 {
    10
}

/// Default completion model
pub fn default_completion_model() -> String {
    "anthropic/claude-3.5-sonnet".to_string()
}

pub fn default_temperature() -> f32 {
    0.7
}

pub fn default_max_tokens() -> u32 {
    1000
}

/// Completion request timeout in seconds
pub fn default_completion_timeout() -> u64 {
    30
}

/// Ask the provider for `response_format: json_object`
pub fn default_json_mode() -> bool {
    true
}

/// Attempts per remote call, including the first
pub fn default_max_attempts() -> u32 {
    3
}

/// Base backoff between attempts in milliseconds (doubles each retry)
pub fn default_backoff_ms() -> u64 {
    500
}

/// Default number of context chunks per turn
pub fn default_retrieval_k() -> usize {
    3
}

/// Upper bound on context chunks per turn
pub fn default_retrieval_max_k() -> usize {
    5
}

/// Chunks below this cosine similarity never reach the prompt
pub fn default_min_score() -> f32 {
    0.3
}

/// Most recent messages included in the prompt
pub fn default_history_window() -> usize {
    20
}

/// Prompt input budget in characters
pub fn default_max_input_chars() -> usize {
    24_000
}

/// Per-lead lock acquisition timeout in milliseconds
pub fn default_lock_timeout_ms() -> u64 {
    2000
}

pub fn default_lock_attempts() -> u32 {
    3
}

/// Confidence at which a hot lead is handed to a human
pub fn default_hot_lead_confidence() -> u8 {
    70
}

/// Confidence at which a lead with a known phone is handed to a human
pub fn default_phone_handoff_confidence() -> u8 {
    85
}

pub fn default_followup_enabled() -> bool {
    true
}

/// Silence before follow-up N (hours), indexed by follow-ups already sent
pub fn default_followup_thresholds() -> Vec<u64> {
    vec![4, 24, 72]
}

pub fn default_max_followups() -> u32 {
    3
}

pub fn default_sends_per_minute() -> u32 {
    20
}

/// Inbound messages younger than this are left to the live path (seconds)
pub fn default_pending_min_age() -> u64 {
    60
}

/// Seconds between sweep passes
pub fn default_sweep_interval() -> u64 {
    300
}

pub fn default_sweep_concurrency() -> usize {
    4
}

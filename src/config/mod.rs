//! Configuration management for leadq
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Organization the CLI acts on behalf of
    #[serde(default = "default_org_id")]
    pub default_org_id: String,

    /// Knowledge store configuration
    #[serde(default)]
    pub knowledge: KnowledgeConfig,

    /// Embedding provider configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Completion provider configuration
    #[serde(default)]
    pub completion: CompletionConfig,

    /// Retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Prompt assembly configuration
    #[serde(default)]
    pub prompt: PromptConfig,

    /// Qualification engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Background sweep and follow-up configuration
    #[serde(default)]
    pub followup: FollowupConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Which index holds knowledge chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeBackend {
    Sqlite,
    Qdrant,
}

/// Knowledge store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(default = "default_knowledge_backend_kind")]
    pub backend: KnowledgeBackend,

    /// Qdrant connection URL
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,

    /// Environment variable name for Qdrant API key
    #[serde(default = "default_qdrant_api_key_env")]
    pub qdrant_api_key_env: String,

    /// Qdrant collection name
    #[serde(default = "default_collection_name")]
    pub collection_name: String,

    /// Maximum characters per chunk
    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,

    /// Minimum chunk size (shorter chunks are dropped)
    #[serde(default = "default_chunk_min_chars")]
    pub chunk_min_chars: usize,

    #[serde(default = "default_search_timeout")]
    pub search_timeout_secs: u64,
}

fn default_knowledge_backend_kind() -> KnowledgeBackend {
    match default_knowledge_backend().as_str() {
        "qdrant" => KnowledgeBackend::Qdrant,
        _ => KnowledgeBackend::Sqlite,
    }
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// OpenAI-compatible API base URL
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,

    /// Model name/identifier
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension (must match model output)
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Inputs longer than this are truncated before sending
    #[serde(default = "default_embedding_max_input_chars")]
    pub max_input_chars: usize,

    /// Batch size for embedding
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

/// Completion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,

    /// Model used when the org has no prompt-level override
    #[serde(default = "default_completion_model")]
    pub model: String,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_completion_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Request a JSON object response from the provider
    #[serde(default = "default_json_mode")]
    pub json_mode: bool,
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Default number of context chunks
    #[serde(default = "default_retrieval_k")]
    pub default_k: usize,

    /// Maximum chunks allowed per request
    #[serde(default = "default_retrieval_max_k")]
    pub max_k: usize,

    /// Minimum similarity score (0.0 - 1.0)
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

/// Prompt assembly configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Total characters the assembled prompt may use
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,

    #[serde(default = "default_hot_lead_confidence")]
    pub hot_lead_confidence: u8,

    #[serde(default = "default_phone_handoff_confidence")]
    pub phone_handoff_confidence: u8,
}

/// Follow-up and sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowupConfig {
    #[serde(default = "default_followup_enabled")]
    pub enabled: bool,

    /// Hours of silence before each follow-up
    #[serde(default = "default_followup_thresholds")]
    pub thresholds_hours: Vec<u64>,

    #[serde(default = "default_max_followups")]
    pub max_followups: u32,

    #[serde(default = "default_sends_per_minute")]
    pub sends_per_minute: u32,

    #[serde(default = "default_pending_min_age")]
    pub pending_min_age_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_sweep_concurrency")]
    pub sweep_concurrency: usize,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for leadq data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to SQLite database
    pub db_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_org_id: default_org_id(),
            knowledge: KnowledgeConfig::default(),
            embedding: EmbeddingConfig::default(),
            completion: CompletionConfig::default(),
            retrieval: RetrievalConfig::default(),
            prompt: PromptConfig::default(),
            engine: EngineConfig::default(),
            followup: FollowupConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            backend: default_knowledge_backend_kind(),
            qdrant_url: default_qdrant_url(),
            qdrant_api_key_env: default_qdrant_api_key_env(),
            collection_name: default_collection_name(),
            chunk_max_chars: default_chunk_max_chars(),
            chunk_min_chars: default_chunk_min_chars(),
            search_timeout_secs: default_search_timeout(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            api_key_env: default_api_key_env(),
            max_input_chars: default_embedding_max_input_chars(),
            batch_size: default_embedding_batch_size(),
            timeout_secs: default_embedding_timeout(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            model: default_completion_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_completion_timeout(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            json_mode: default_json_mode(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_retrieval_k(),
            max_k: default_retrieval_max_k(),
            min_score: default_min_score(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_attempts: default_lock_attempts(),
            hot_lead_confidence: default_hot_lead_confidence(),
            phone_handoff_confidence: default_phone_handoff_confidence(),
        }
    }
}

impl Default for FollowupConfig {
    fn default() -> Self {
        Self {
            enabled: default_followup_enabled(),
            thresholds_hours: default_followup_thresholds(),
            max_followups: default_max_followups(),
            sends_per_minute: default_sends_per_minute(),
            pending_min_age_secs: default_pending_min_age(),
            sweep_interval_secs: default_sweep_interval(),
            sweep_concurrency: default_sweep_concurrency(),
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get the API key from environment
    pub fn api_key(&self) -> Option<String> {
        read_env(&self.api_key_env)
    }
}

impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get the API key from environment
    pub fn api_key(&self) -> Option<String> {
        read_env(&self.api_key_env)
    }
}

impl KnowledgeConfig {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    /// Get the Qdrant API key from environment
    pub fn qdrant_api_key(&self) -> Option<String> {
        read_env(&self.qdrant_api_key_env)
    }
}

impl FollowupConfig {
    /// Silence required before the next follow-up, or None once the limit is reached
    pub fn threshold_for(&self, sent: u32) -> Option<Duration> {
        if sent >= self.max_followups {
            return None;
        }
        self.thresholds_hours
            .get(sent as usize)
            .map(|hours| Duration::from_secs(hours * 3600))
    }
}

fn read_env(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Get the default base directory for leadq (~/.leadq)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".leadq")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    pub(crate) fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig {
            config_file: base.join("config.toml"),
            db_file: base.join("crm.db"),
            base_dir: base,
        };
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig {
            config_file: config_path.to_path_buf(),
            db_file: base.join("crm.db"),
            base_dir: base,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific base directory
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
            config.validate()?;
        } else {
            debug!("No config file found, using defaults");
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Check if leadq is initialized (config and DB exist)
    pub fn is_initialized(&self) -> bool {
        self.paths.config_file.exists() && self.paths.db_file.exists()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.default_org_id.trim().is_empty() {
            return Err(Error::Config("default_org_id must not be empty".to_string()));
        }

        if self.knowledge.chunk_max_chars < self.knowledge.chunk_min_chars {
            return Err(Error::Config(
                "knowledge.chunk_max_chars must be >= knowledge.chunk_min_chars".to_string(),
            ));
        }

        if self.embedding.dimension == 0 {
            return Err(Error::Config(
                "embedding.dimension must be positive".to_string(),
            ));
        }

        if self.embedding.batch_size == 0 || self.embedding.max_input_chars == 0 {
            return Err(Error::Config(
                "embedding.batch_size and embedding.max_input_chars must be positive".to_string(),
            ));
        }

        if self.retrieval.min_score < 0.0 || self.retrieval.min_score > 1.0 {
            return Err(Error::Config(
                "retrieval.min_score must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.retrieval.default_k == 0 || self.retrieval.default_k > self.retrieval.max_k {
            return Err(Error::Config(
                "retrieval.default_k must be between 1 and retrieval.max_k".to_string(),
            ));
        }

        if self.embedding.timeout_secs == 0
            || self.completion.timeout_secs == 0
            || self.knowledge.search_timeout_secs == 0
            || self.engine.lock_timeout_ms == 0
        {
            return Err(Error::Config("timeouts must be positive".to_string()));
        }

        if self.embedding.max_attempts == 0
            || self.completion.max_attempts == 0
            || self.engine.lock_attempts == 0
        {
            return Err(Error::Config("attempt counts must be at least 1".to_string()));
        }

        if self.engine.hot_lead_confidence > 100 || self.engine.phone_handoff_confidence > 100 {
            return Err(Error::Config(
                "engine confidence thresholds must be between 0 and 100".to_string(),
            ));
        }

        if self.followup.sends_per_minute == 0 || self.followup.sweep_concurrency == 0 {
            return Err(Error::Config(
                "followup.sends_per_minute and followup.sweep_concurrency must be positive"
                    .to_string(),
            ));
        }

        for (name, raw) in [
            ("embedding.base_url", &self.embedding.base_url),
            ("completion.base_url", &self.completion.base_url),
        ] {
            url::Url::parse(raw)
                .map_err(|e| Error::Config(format!("{} is not a valid URL: {}", name, e)))?;
        }

        Ok(())
    }
}

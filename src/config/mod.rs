//! Configuration management for ragfuse
//!
//! One immutable [`Config`] is loaded at process start and handed by reference
//! to every component constructor. Nothing reads configuration from globals.

use crate::error::{RagError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

pub const SCHEMA_VERSION: &str = "1.0.0";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub keyword: KeywordConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.ragfuse"),
        }
    }
}

/// Local index backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Index searched when a query names none
    pub default_index: Option<String>,
    pub vector_dim: usize,
    pub hnsw_m: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_ef_search: usize,
    pub max_elements: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            default_index: Some("default".to_string()),
            vector_dim: 384,
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 64,
            max_elements: 100_000,
        }
    }
}

/// Embedding service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// "local" (FastEmbed) or "remote" (HTTP service)
    pub provider: String,
    pub model: String,
    pub url: Option<String>,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: "all-MiniLM-L6-v2".to_string(),
            url: None,
            batch_size: 32,
        }
    }
}

/// Rerank service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankerConfig {
    pub enabled: bool,
    /// "local" (FastEmbed cross-encoder) or "remote" (HTTP service)
    pub provider: String,
    pub model: String,
    pub url: Option<String>,
    /// Number of fused candidates (M) sent to the reranker
    pub candidates: usize,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "local".to_string(),
            model: "BAAI/bge-reranker-base".to_string(),
            url: None,
            candidates: 10,
        }
    }
}

/// LLM configuration used for query rewriting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key_env: String,
    pub model: String,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
        }
    }
}

/// Query variant generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Conversation turns considered for coreference resolution
    pub history_turns: usize,
    pub decomposition: bool,
    pub multi_query: bool,
    pub paraphrase_count: usize,
    pub max_subquestions: usize,
    /// Minimum complexity score before decomposition is attempted
    pub complexity_threshold: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            history_turns: 3,
            decomposition: false,
            multi_query: false,
            paraphrase_count: 2,
            max_subquestions: 4,
            complexity_threshold: 1,
        }
    }
}

/// Fusion and fan-out parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// RRF constant k
    pub rrf_k: f64,
    pub vector_weight: f64,
    pub keyword_weight: f64,
    /// Hits requested from each backend per variant
    pub top_n: usize,
    /// Final results returned when the caller does not ask for a count
    pub top_k: usize,
    pub concurrency_per_variant: usize,
    pub max_concurrency: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            vector_weight: 1.0,
            keyword_weight: 1.0,
            top_n: 10,
            top_k: 5,
            concurrency_per_variant: 2,
            max_concurrency: 16,
        }
    }
}

/// Keyword search tuning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordConfig {
    pub fuzzy: bool,
    pub extra_stop_words: Vec<String>,
}

/// Timeouts in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Embedding and index search calls
    pub call_ms: u64,
    pub llm_ms: u64,
    pub rerank_ms: u64,
    /// Budget for the LLM query preprocessing steps together; capped at half
    /// the request deadline so retrieval always keeps the rest
    pub preprocess_ms: u64,
    /// Overall request deadline
    pub deadline_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call_ms: 5_000,
            llm_ms: 15_000,
            rerank_ms: 10_000,
            preprocess_ms: 10_000,
            deadline_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn call(&self) -> Duration {
        Duration::from_millis(self.call_ms)
    }

    pub fn llm(&self) -> Duration {
        Duration::from_millis(self.llm_ms)
    }

    pub fn rerank(&self) -> Duration {
        Duration::from_millis(self.rerank_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Preprocessing budget, never more than half the request deadline
    pub fn preprocess(&self) -> Duration {
        Duration::from_millis(self.preprocess_ms).min(self.deadline() / 2)
    }
}

/// Retry policy for transient service failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            multiplier: 2.0,
        }
    }
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multi_query: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decomposition: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reranker_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RagError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| RagError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| RagError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| RagError::Config(format!("Unknown profile: {}", profile)))?;

        if let Some(multi_query) = overrides.multi_query {
            self.query.multi_query = multi_query;
        }
        if let Some(decomposition) = overrides.decomposition {
            self.query.decomposition = decomposition;
        }
        if let Some(enabled) = overrides.reranker_enabled {
            self.reranker.enabled = enabled;
        }
        if let Some(enabled) = overrides.llm_enabled {
            self.llm.enabled = enabled;
        }
        if let Some(top_k) = overrides.top_k {
            self.retrieval.top_k = top_k;
        }
        if let Some(deadline_ms) = overrides.deadline_ms {
            self.timeouts.deadline_ms = deadline_ms;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: RAGFUSE_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("RAGFUSE_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "LLM__ENABLED" => self.llm.enabled = parse_env(path, value)?,
            "LLM__MODEL" => self.llm.model = value.to_string(),
            "LLM__BASE_URL" => self.llm.base_url = value.to_string(),
            "EMBEDDING__PROVIDER" => self.embedding.provider = value.to_string(),
            "EMBEDDING__URL" => self.embedding.url = Some(value.to_string()),
            "RERANKER__ENABLED" => self.reranker.enabled = parse_env(path, value)?,
            "RERANKER__URL" => self.reranker.url = Some(value.to_string()),
            "INDEX__DEFAULT_INDEX" => self.index.default_index = Some(value.to_string()),
            "RETRIEVAL__TOP_K" => self.retrieval.top_k = parse_env(path, value)?,
            "TIMEOUTS__DEADLINE_MS" => self.timeouts.deadline_ms = parse_env(path, value)?,
            "TIMEOUTS__PREPROCESS_MS" => self.timeouts.preprocess_ms = parse_env(path, value)?,
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| RagError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("ragfuse").join("config.toml"))
    }

    /// Data directory with a leading `~/` expanded
    pub fn data_dir(&self) -> Result<PathBuf> {
        expand_home(&self.storage.data_dir)
    }
}

fn parse_env<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| RagError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}'", value),
    })
}

/// Expand a leading `~/` to the user's home directory
pub fn expand_home(path: &Path) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| RagError::Config("Invalid path encoding".to_string()))?;

    if let Some(stripped) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| RagError::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(stripped))
    } else {
        Ok(path.to_path_buf())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta: MetaConfig {
                schema_version: SCHEMA_VERSION.to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            storage: StorageConfig::default(),
            index: IndexConfig::default(),
            embedding: EmbeddingConfig::default(),
            reranker: RerankerConfig::default(),
            llm: LlmConfig::default(),
            query: QueryConfig::default(),
            retrieval: RetrievalConfig::default(),
            keyword: KeywordConfig {
                fuzzy: true,
                extra_stop_words: Vec::new(),
            },
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            profiles: HashMap::new(),
        }
    }
}

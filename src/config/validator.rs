use crate::config::{Config, SCHEMA_VERSION};
use crate::error::{RagError, Result, ValidationError};
use crate::retrieval::validate_index_id;

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_index(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_reranker(config, &mut errors);
        Self::validate_llm(config, &mut errors);
        Self::validate_query(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_timeouts(config, &mut errors);
        Self::validate_retry(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RagError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_index(config: &Config, errors: &mut Vec<ValidationError>) {
        if let Some(index_id) = &config.index.default_index {
            if let Err(reason) = validate_index_id(index_id) {
                errors.push(ValidationError::new("index.default_index", reason));
            }
        }

        if config.index.vector_dim == 0 {
            errors.push(ValidationError::new(
                "index.vector_dim",
                "Vector dimension must be greater than 0",
            ));
        }

        if config.index.hnsw_m == 0 {
            errors.push(ValidationError::new(
                "index.hnsw_m",
                "HNSW M must be greater than 0",
            ));
        }

        if config.index.hnsw_ef_construction == 0 || config.index.hnsw_ef_search == 0 {
            errors.push(ValidationError::new(
                "index.hnsw_ef_search",
                "HNSW ef parameters must be greater than 0",
            ));
        }

        if config.index.max_elements == 0 {
            errors.push(ValidationError::new(
                "index.max_elements",
                "Max elements must be greater than 0",
            ));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        let provider = &config.embedding.provider;
        match provider.as_str() {
            "local" => {
                if config.embedding.model.is_empty() {
                    errors.push(ValidationError::new(
                        "embedding.model",
                        "Model name cannot be empty",
                    ));
                }
            }
            "remote" => {
                if config.embedding.url.as_deref().unwrap_or("").is_empty() {
                    errors.push(ValidationError::new(
                        "embedding.url",
                        "Remote embedding provider requires a URL",
                    ));
                }
            }
            other => errors.push(ValidationError::new(
                "embedding.provider",
                format!("Provider must be 'local' or 'remote', got '{}'", other),
            )),
        }

        if config.embedding.batch_size == 0 {
            errors.push(ValidationError::new(
                "embedding.batch_size",
                "Batch size must be greater than 0",
            ));
        }
    }

    fn validate_reranker(config: &Config, errors: &mut Vec<ValidationError>) {
        if !config.reranker.enabled {
            return;
        }

        match config.reranker.provider.as_str() {
            "local" => {}
            "remote" => {
                if config.reranker.url.as_deref().unwrap_or("").is_empty() {
                    errors.push(ValidationError::new(
                        "reranker.url",
                        "Remote reranker requires a URL",
                    ));
                }
            }
            other => errors.push(ValidationError::new(
                "reranker.provider",
                format!("Provider must be 'local' or 'remote', got '{}'", other),
            )),
        }

        if config.reranker.candidates < config.retrieval.top_k {
            errors.push(ValidationError::new(
                "reranker.candidates",
                format!(
                    "Rerank candidates ({}) must be at least retrieval.top_k ({})",
                    config.reranker.candidates, config.retrieval.top_k
                ),
            ));
        }
    }

    fn validate_llm(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.llm.enabled {
            let env_var = &config.llm.api_key_env;
            match std::env::var(env_var) {
                Ok(key) if key.is_empty() => errors.push(ValidationError::new(
                    "llm.api_key_env",
                    format!("Environment variable {} is empty", env_var),
                )),
                Ok(_) => {}
                Err(_) => errors.push(ValidationError::new(
                    "llm.api_key_env",
                    format!("Environment variable {} is not set", env_var),
                )),
            }

            if config.llm.base_url.is_empty() {
                errors.push(ValidationError::new(
                    "llm.base_url",
                    "Base URL cannot be empty",
                ));
            }
        }

        let temp = config.llm.temperature;
        if !(0.0..=2.0).contains(&temp) {
            errors.push(ValidationError::new(
                "llm.temperature",
                format!("Temperature must be between 0.0 and 2.0, got {}", temp),
            ));
        }
    }

    fn validate_query(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.query.multi_query && config.query.paraphrase_count == 0 {
            errors.push(ValidationError::new(
                "query.paraphrase_count",
                "Paraphrase count must be greater than 0 when multi_query is enabled",
            ));
        }

        if config.query.decomposition && config.query.max_subquestions == 0 {
            errors.push(ValidationError::new(
                "query.max_subquestions",
                "Max sub-questions must be greater than 0 when decomposition is enabled",
            ));
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        let retrieval = &config.retrieval;

        if !(retrieval.rrf_k.is_finite() && retrieval.rrf_k > 0.0) {
            errors.push(ValidationError::new(
                "retrieval.rrf_k",
                format!("RRF k must be a positive number, got {}", retrieval.rrf_k),
            ));
        }

        for (path, weight) in [
            ("retrieval.vector_weight", retrieval.vector_weight),
            ("retrieval.keyword_weight", retrieval.keyword_weight),
        ] {
            if !(weight.is_finite() && weight > 0.0) {
                errors.push(ValidationError::new(
                    path,
                    format!("Fusion weight must be a positive number, got {}", weight),
                ));
            }
        }

        if retrieval.top_n == 0 {
            errors.push(ValidationError::new(
                "retrieval.top_n",
                "top_n must be greater than 0",
            ));
        }

        if retrieval.top_k == 0 {
            errors.push(ValidationError::new(
                "retrieval.top_k",
                "top_k must be greater than 0",
            ));
        }

        if retrieval.concurrency_per_variant == 0 || retrieval.max_concurrency == 0 {
            errors.push(ValidationError::new(
                "retrieval.max_concurrency",
                "Concurrency limits must be greater than 0",
            ));
        }
    }

    fn validate_timeouts(config: &Config, errors: &mut Vec<ValidationError>) {
        let t = &config.timeouts;

        if t.call_ms == 0
            || t.llm_ms == 0
            || t.rerank_ms == 0
            || t.preprocess_ms == 0
            || t.deadline_ms == 0
        {
            errors.push(ValidationError::new(
                "timeouts",
                "All timeouts must be greater than 0",
            ));
        }

        if t.call_ms > t.deadline_ms {
            errors.push(ValidationError::new(
                "timeouts.call_ms",
                format!(
                    "Call timeout ({}ms) exceeds the request deadline ({}ms)",
                    t.call_ms, t.deadline_ms
                ),
            ));
        }

        if t.preprocess_ms >= t.deadline_ms {
            errors.push(ValidationError::new(
                "timeouts.preprocess_ms",
                format!(
                    "Preprocessing budget ({}ms) must leave time for retrieval within the deadline ({}ms)",
                    t.preprocess_ms, t.deadline_ms
                ),
            ));
        }
    }

    fn validate_retry(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.retry.multiplier < 1.0 {
            errors.push(ValidationError::new(
                "retry.multiplier",
                "Backoff multiplier must be at least 1.0",
            ));
        }

        if config.retry.base_delay_ms > config.retry.max_delay_ms {
            errors.push(ValidationError::new(
                "retry.base_delay_ms",
                "Base delay cannot exceed max delay",
            ));
        }
    }
}

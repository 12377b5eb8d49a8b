//! Local embedding generation with FastEmbed
use crate::error::{RagError, Result};
use crate::services::{EmbeddingService, ServiceError};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::Arc;

/// FastEmbed provider for local embedding generation
///
/// Inference runs on the blocking pool so an in-flight embedding never
/// stalls the async workers serving other retrieval paths.
pub struct FastEmbedProvider {
    model: Arc<TextEmbedding>,
    model_name: String,
    dimension: usize,
}

impl FastEmbedProvider {
    /// Create a provider for a supported model
    ///
    /// Models are downloaded on first use to `~/.cache/huggingface/`:
    /// - all-MiniLM-L6-v2: 90MB (384 dims)
    /// - bge-small-en-v1.5: 130MB (384 dims)
    /// - bge-base-en-v1.5: 440MB (768 dims)
    /// - multilingual-e5-small: 470MB (384 dims), for mixed CJK corpora
    pub fn new(model_name: &str) -> Result<Self> {
        let (embedding_model, dimension, model_size_mb) = match model_name {
            "all-MiniLM-L6-v2" | "all-minilm-l6-v2" => (EmbeddingModel::AllMiniLML6V2, 384, 90),
            "bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384, 130),
            "bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768, 440),
            "multilingual-e5-small" => (EmbeddingModel::MultilingualE5Small, 384, 470),
            _ => {
                return Err(RagError::InvalidConfigValue {
                    path: "embedding.model".to_string(),
                    message: format!(
                        "Unsupported model: {}. Supported: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, multilingual-e5-small",
                        model_name
                    ),
                });
            }
        };

        tracing::info!(
            "Initializing embedding model: {} ({}D, ~{}MB download if not cached)",
            model_name,
            dimension,
            model_size_mb
        );

        let init_options = InitOptions::new(embedding_model).with_show_download_progress(true);
        let model = TextEmbedding::try_new(init_options)
            .map_err(|e| RagError::Config(format!("Embedding model init failed: {}", e)))?;

        Ok(Self {
            model: Arc::new(model),
            model_name: model_name.to_string(),
            dimension,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[async_trait]
impl EmbeddingService for FastEmbedProvider {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ServiceError> {
        let mut embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| ServiceError::invalid_response("embedding", "No embeddings generated"))
    }

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, ServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(ServiceError::invalid_request("embedding", "Empty text"));
        }

        let model = self.model.clone();
        let batch = texts.to_vec();
        let embeddings = tokio::task::spawn_blocking(move || model.embed(batch, None))
            .await
            .map_err(|e| ServiceError::Transport {
                service: "embedding".to_string(),
                message: format!("embedding task failed: {}", e),
            })?
            .map_err(|e| ServiceError::invalid_response("embedding", e.to_string()))?;

        for embedding in &embeddings {
            if embedding.len() != self.dimension {
                return Err(ServiceError::invalid_response(
                    "embedding",
                    format!(
                        "Dimension mismatch: expected {}, got {}",
                        self.dimension,
                        embedding.len()
                    ),
                ));
            }
        }

        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

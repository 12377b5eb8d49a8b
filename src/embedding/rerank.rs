//! Cross-encoder reranking using FastEmbed

use crate::error::{RagError, Result};
use crate::services::{RerankService, ServiceError};
use async_trait::async_trait;
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use std::sync::Arc;

/// Local cross-encoder
pub struct FastEmbedReranker {
    model: Arc<TextRerank>,
    model_name: String,
}

impl FastEmbedReranker {
    /// # Arguments
    /// * `model_name` - "BAAI/bge-reranker-base" or "jinaai/jina-reranker-v1-turbo-en"
    pub fn new(model_name: &str) -> Result<Self> {
        let reranker_model = match model_name {
            "BAAI/bge-reranker-base" | "bge-reranker-base" => RerankerModel::BGERerankerBase,
            "jinaai/jina-reranker-v1-turbo-en" | "jina-reranker-v1-turbo-en" => {
                RerankerModel::JINARerankerV1TurboEn
            }
            _ => {
                return Err(RagError::InvalidConfigValue {
                    path: "reranker.model".to_string(),
                    message: format!("Unsupported reranker model: {}", model_name),
                });
            }
        };

        tracing::info!("Initializing reranker model: {}", model_name);

        let init_options = RerankInitOptions::new(reranker_model).with_show_download_progress(true);
        let model = TextRerank::try_new(init_options)
            .map_err(|e| RagError::Config(format!("Reranker init failed: {}", e)))?;

        Ok(Self {
            model: Arc::new(model),
            model_name: model_name.to_string(),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[async_trait]
impl RerankService for FastEmbedReranker {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[String],
    ) -> std::result::Result<Vec<f32>, ServiceError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        if query.is_empty() {
            return Err(ServiceError::invalid_request("rerank", "Query cannot be empty"));
        }

        let model = self.model.clone();
        let query = query.to_string();
        let documents = candidates.to_vec();
        let count = documents.len();

        let results = tokio::task::spawn_blocking(move || {
            let docs: Vec<&str> = documents.iter().map(String::as_str).collect();
            model.rerank(query.as_str(), docs, false, None)
        })
        .await
        .map_err(|e| ServiceError::Transport {
            service: "rerank".to_string(),
            message: format!("rerank task failed: {}", e),
        })?
        .map_err(|e| ServiceError::invalid_response("rerank", e.to_string()))?;

        // FastEmbed returns results sorted by score; restore input order
        let mut scores = vec![f32::NAN; count];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }
        Ok(scores)
    }
}

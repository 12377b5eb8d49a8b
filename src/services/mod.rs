//! Contracts for the external collaborators of the retrieval core
//!
//! Embedding, index search, reranking and LLM completion are black boxes. The
//! core only depends on the traits here; concrete local backends live in
//! `embedding` and `index`, remote HTTP clients in [`http`].

mod http;
mod retry;

pub use http::{HttpEmbedding, HttpReranker, OpenAiCompletion};
pub use retry::{CallContext, RetryPolicy};

use crate::config::Config;
use crate::embedding::{FastEmbedProvider, FastEmbedReranker};
use crate::error::{RagError, Result};
use crate::index::LocalIndexStore;
use crate::retrieval::ContentType;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Failure of a single external call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("{service} timed out after {after_ms}ms")]
    Timeout { service: String, after_ms: u64 },

    #[error("{service} transport failure: {message}")]
    Transport { service: String, message: String },

    #[error("{service} returned HTTP {status}: {message}")]
    Status {
        service: String,
        status: u16,
        message: String,
    },

    #[error("{service} rejected the request: {message}")]
    InvalidRequest { service: String, message: String },

    #[error("{service} returned a malformed response: {message}")]
    InvalidResponse { service: String, message: String },

    #[error("Index not found: {index_id}")]
    UnknownIndex { index_id: String },

    #[error("Call cancelled")]
    Cancelled,
}

impl ServiceError {
    /// Network failures, timeouts, throttling and server errors
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Timeout { .. } | ServiceError::Transport { .. } => true,
            ServiceError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn invalid_request(service: &str, message: impl Into<String>) -> Self {
        ServiceError::InvalidRequest {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_response(service: &str, message: impl Into<String>) -> Self {
        ServiceError::InvalidResponse {
            service: service.to_string(),
            message: message.into(),
        }
    }
}

/// One row returned by an index search, best first
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub doc_id: String,
    pub chunk_id: String,
    pub content_type: ContentType,
    pub text: String,
    /// Similarity (vector) or BM25 (keyword) score
    pub score: f32,
}

/// `embed(text) -> vector<float, D>`
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ServiceError>;

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, ServiceError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize;
}

/// `search(index_id, vector, top_n) -> [(doc_id, chunk_id, similarity)]`
#[async_trait]
pub trait VectorIndexService: Send + Sync {
    async fn search(
        &self,
        index_id: &str,
        vector: &[f32],
        top_n: usize,
    ) -> std::result::Result<Vec<IndexHit>, ServiceError>;
}

/// `search(index_id, tokens, top_n) -> [(doc_id, chunk_id, bm25)]`
#[async_trait]
pub trait KeywordIndexService: Send + Sync {
    async fn search(
        &self,
        index_id: &str,
        terms: &[String],
        top_n: usize,
    ) -> std::result::Result<Vec<IndexHit>, ServiceError>;
}

/// `rerank(query, [candidate]) -> [score]`, aligned with input order
#[async_trait]
pub trait RerankService: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[String],
    ) -> std::result::Result<Vec<f32>, ServiceError>;
}

/// `complete(prompt) -> text`
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &str) -> std::result::Result<String, ServiceError>;
}

/// Every collaborator the orchestrator needs for one process
#[derive(Clone)]
pub struct Services {
    pub embedder: Arc<dyn EmbeddingService>,
    pub vector_index: Arc<dyn VectorIndexService>,
    pub keyword_index: Arc<dyn KeywordIndexService>,
    pub reranker: Option<Arc<dyn RerankService>>,
    pub completer: Option<Arc<dyn CompletionService>>,
}

impl Services {
    /// Wire providers selected by configuration around a local index store
    pub fn from_config(config: &Config, store: Arc<LocalIndexStore>) -> Result<Self> {
        let embedder = embedder_from_config(config)?;

        let reranker: Option<Arc<dyn RerankService>> = if config.reranker.enabled {
            match config.reranker.provider.as_str() {
                "remote" => {
                    let url = config.reranker.url.clone().ok_or_else(|| {
                        RagError::MissingParameter("reranker.url".to_string())
                    })?;
                    Some(Arc::new(HttpReranker::new(url)?))
                }
                _ => Some(Arc::new(FastEmbedReranker::new(&config.reranker.model)?)),
            }
        } else {
            None
        };

        let completer: Option<Arc<dyn CompletionService>> = if config.llm.enabled {
            Some(Arc::new(OpenAiCompletion::from_config(&config.llm)?))
        } else {
            None
        };

        Ok(Self {
            embedder,
            vector_index: store.clone(),
            keyword_index: store,
            reranker,
            completer,
        })
    }
}

/// Embedding provider selected by `embedding.provider`
pub fn embedder_from_config(config: &Config) -> Result<Arc<dyn EmbeddingService>> {
    match config.embedding.provider.as_str() {
        "remote" => {
            let url = config
                .embedding
                .url
                .clone()
                .ok_or_else(|| RagError::MissingParameter("embedding.url".to_string()))?;
            Ok(Arc::new(HttpEmbedding::new(url, config.index.vector_dim)?))
        }
        _ => {
            let provider = FastEmbedProvider::new(&config.embedding.model)?;
            if provider.dimension() != config.index.vector_dim {
                return Err(RagError::InvalidConfigValue {
                    path: "index.vector_dim".to_string(),
                    message: format!(
                        "Model {} produces {}D vectors but index.vector_dim is {}",
                        config.embedding.model,
                        provider.dimension(),
                        config.index.vector_dim
                    ),
                });
            }
            Ok(Arc::new(provider))
        }
    }
}

//! Hybrid retrieval and fusion ranking
//!
//! One question (plus conversation history) becomes one deterministically
//! ordered list of chunks:
//!
//! 1. [`QueryVariantGenerator`] derives query variants (the original text is always kept)
//! 2. [`VectorSearchClient`] and [`KeywordSearchClient`] run every variant concurrently
//! 3. [`FusionRanker`] merges all ranked lists with Reciprocal Rank Fusion
//! 4. [`Reranker`] reorders the top slice against the original question
//!
//! [`RetrievalOrchestrator`] sequences the steps under one deadline and
//! degrades gracefully when individual backends fail.

mod fusion;
mod orchestrator;
mod provenance;
mod reranker;
mod search;
mod variants;

pub use fusion::{strip_timestamps, Contribution, FusedResult, FusionRanker};
pub use orchestrator::RetrievalOrchestrator;
pub use provenance::{
    Coverage, ListFailure, PipelineState, RetrievalResult, RetrievedChunk, SourceRef, StateTrail,
};
pub use reranker::{RerankOutcome, RerankStatus, RerankedResult, Reranker};
pub use search::{
    ContentType, KeywordSearchClient, ListId, RankedList, SearchClient, SearchHit, SearchMode,
    VectorSearchClient,
};
pub use variants::{
    Complexity, ComplexityClassifier, QueryVariant, QueryVariantGenerator, VariantOrigin,
};

use serde::{Deserialize, Serialize};

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One prior conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
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
}

/// A user question; immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    text: String,
    history: Vec<Turn>,
    index_id: Option<String>,
    top_k: Option<usize>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            history: Vec::new(),
            index_id: None,
            top_k: None,
        }
    }

    /// Prior turns, oldest first
    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_index(mut self, index_id: impl Into<String>) -> Self {
        self.index_id = Some(index_id.into());
        self
    }

    /// Number of chunks the caller wants back
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn index_id(&self) -> Option<&str> {
        self.index_id.as_deref()
    }

    pub fn top_k(&self) -> Option<usize> {
        self.top_k
    }
}

/// Characters never allowed in an index identifier
const FORBIDDEN_INDEX_CHARS: &[char] = &['\\', '/', '*', '?', '"', '<', '>', '|', ',', '#', ':'];

/// Index identifiers follow Elasticsearch naming rules
pub fn validate_index_id(index_id: &str) -> std::result::Result<(), String> {
    if index_id.is_empty() {
        return Err("must not be empty".to_string());
    }
    if index_id.len() > 255 {
        return Err("must be at most 255 bytes".to_string());
    }
    if index_id == "." || index_id == ".." {
        return Err("must not be '.' or '..'".to_string());
    }
    if index_id.starts_with(['-', '_', '+']) {
        return Err("must not start with '-', '_' or '+'".to_string());
    }
    if index_id.chars().any(char::is_uppercase) {
        return Err("must be lowercase".to_string());
    }
    if let Some(bad) = index_id
        .chars()
        .find(|c| c.is_whitespace() || FORBIDDEN_INDEX_CHARS.contains(c))
    {
        return Err(format!("must not contain '{}'", bad));
    }
    Ok(())
}

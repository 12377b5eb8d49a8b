//! Vector and keyword search clients behind one shared contract

use super::QueryVariant;
use crate::services::{
    CallContext, EmbeddingService, IndexHit, KeywordIndexService, RetryPolicy, ServiceError,
    VectorIndexService,
};
use crate::text::Segmenter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Kind of content a chunk was extracted from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Text,
    ImageDescription,
    TableDescription,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::ImageDescription => "image_description",
            ContentType::TableDescription => "table_description",
        }
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ContentType::Text),
            "image_description" | "image-description" => Ok(ContentType::ImageDescription),
            "table_description" | "table-description" => Ok(ContentType::TableDescription),
            other => Err(format!("unknown content type '{}'", other)),
        }
    }
}

/// Retrieval mode; vector lists are traversed before keyword lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Vector,
    Keyword,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Vector => "vector",
            SearchMode::Keyword => "keyword",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one ranked list: (variant index, mode)
///
/// Ordering is the fusion traversal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListId {
    pub variant: usize,
    pub mode: SearchMode,
}

impl ListId {
    pub fn new(variant: usize, mode: SearchMode) -> Self {
        Self { variant, mode }
    }
}

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}:{}", self.variant, self.mode)
    }
}

/// One hit in a ranked list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub doc_id: String,
    pub chunk_id: String,
    pub content_type: ContentType,
    pub text: String,
    /// Similarity or BM25 score as reported by the backend
    pub score: f32,
    pub mode: SearchMode,
    /// 1-indexed position within its own list
    pub rank: usize,
}

/// Successful output of one (variant, mode) search
#[derive(Debug, Clone, PartialEq)]
pub struct RankedList {
    pub list: ListId,
    pub hits: Vec<SearchHit>,
}

impl RankedList {
    pub fn new(list: ListId, hits: Vec<SearchHit>) -> Self {
        Self { list, hits }
    }
}

/// `search(variant) -> hit list`, shared by both retrieval modes
#[async_trait]
pub trait SearchClient: Send + Sync {
    fn mode(&self) -> SearchMode;

    async fn search(
        &self,
        variant: &QueryVariant,
        index_id: &str,
        ctx: &CallContext,
    ) -> Result<Vec<SearchHit>, ServiceError>;
}

/// Backend rows in order, capped at `top_n`, ranked from 1
fn rank_hits(hits: Vec<IndexHit>, mode: SearchMode, top_n: usize) -> Vec<SearchHit> {
    hits.into_iter()
        .take(top_n)
        .enumerate()
        .map(|(i, hit)| SearchHit {
            doc_id: hit.doc_id,
            chunk_id: hit.chunk_id,
            content_type: hit.content_type,
            text: hit.text,
            score: hit.score,
            mode,
            rank: i + 1,
        })
        .collect()
}

/// Embeds the variant, then asks the vector index for nearest neighbours
pub struct VectorSearchClient {
    embedder: Arc<dyn EmbeddingService>,
    index: Arc<dyn VectorIndexService>,
    policy: RetryPolicy,
    top_n: usize,
}

impl VectorSearchClient {
    pub fn new(
        embedder: Arc<dyn EmbeddingService>,
        index: Arc<dyn VectorIndexService>,
        policy: RetryPolicy,
        top_n: usize,
    ) -> Self {
        Self {
            embedder,
            index,
            policy,
            top_n,
        }
    }
}

#[async_trait]
impl SearchClient for VectorSearchClient {
    fn mode(&self) -> SearchMode {
        SearchMode::Vector
    }

    async fn search(
        &self,
        variant: &QueryVariant,
        index_id: &str,
        ctx: &CallContext,
    ) -> Result<Vec<SearchHit>, ServiceError> {
        let embedder = &self.embedder;
        let text = variant.text.as_str();
        let vector = self
            .policy
            .run("embedding", ctx, move || embedder.embed(text))
            .await?;

        let index = &self.index;
        let query = vector.as_slice();
        let top_n = self.top_n;
        let hits = self
            .policy
            .run("vector_index", ctx, move || index.search(index_id, query, top_n))
            .await?;

        Ok(rank_hits(hits, SearchMode::Vector, self.top_n))
    }
}

/// Segments the variant and issues a BM25 query with fuzzy expansion
pub struct KeywordSearchClient {
    segmenter: Segmenter,
    index: Arc<dyn KeywordIndexService>,
    policy: RetryPolicy,
    top_n: usize,
}

impl KeywordSearchClient {
    pub fn new(
        segmenter: Segmenter,
        index: Arc<dyn KeywordIndexService>,
        policy: RetryPolicy,
        top_n: usize,
    ) -> Self {
        Self {
            segmenter,
            index,
            policy,
            top_n,
        }
    }
}

#[async_trait]
impl SearchClient for KeywordSearchClient {
    fn mode(&self) -> SearchMode {
        SearchMode::Keyword
    }

    async fn search(
        &self,
        variant: &QueryVariant,
        index_id: &str,
        ctx: &CallContext,
    ) -> Result<Vec<SearchHit>, ServiceError> {
        let terms = self.segmenter.keywords(&variant.text);
        if terms.is_empty() {
            tracing::debug!(variant = %variant.text, "No keyword terms after stop-word removal");
            return Ok(Vec::new());
        }

        let index = &self.index;
        let terms = terms.as_slice();
        let top_n = self.top_n;
        let hits = self
            .policy
            .run("keyword_index", ctx, move || index.search(index_id, terms, top_n))
            .await?;

        Ok(rank_hits(hits, SearchMode::Keyword, self.top_n))
    }
}

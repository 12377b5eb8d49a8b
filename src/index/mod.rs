//! Local index backend
//!
//! Each index lives in its own directory under `<data_dir>/indexes/<id>/`:
//! - `catalog.db`: SQLite chunk catalog (text, metadata, embeddings)
//! - `keyword/`: tantivy BM25 index over segmented terms
//!
//! The HNSW graph is held in memory and rebuilt from the catalog on first
//! open. The store implements both index service traits, so the retrieval
//! core sees it exactly like a remote search cluster.

mod catalog;
mod keyword;
mod vector;

pub use catalog::{Catalog, StoredChunk, UpsertOutcome};
pub use keyword::KeywordIndex;
pub use vector::{Neighbour, VectorIndex};

use crate::config::{Config, IndexConfig, KeywordConfig};
use crate::error::{RagError, Result};
use crate::retrieval::{validate_index_id, ContentType};
use crate::services::{
    EmbeddingService, IndexHit, KeywordIndexService, ServiceError, VectorIndexService,
};
use crate::text::Segmenter;
use ahash::{HashMap, HashMapExt};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// One line of an ingest file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub doc_id: String,
    /// Derived from `doc_id` and `text` when absent
    #[serde(default)]
    pub chunk_id: Option<String>,
    #[serde(default)]
    pub content_type: ContentType,
    pub text: String,
}

impl ChunkRecord {
    pub fn new(doc_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            chunk_id: None,
            content_type: ContentType::Text,
            text: text.into(),
        }
    }

    pub fn with_chunk_id(mut self, chunk_id: impl Into<String>) -> Self {
        self.chunk_id = Some(chunk_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn resolved_chunk_id(&self) -> String {
        self.chunk_id
            .clone()
            .unwrap_or_else(|| derive_chunk_id(&self.doc_id, &self.text))
    }
}

/// Stable chunk id: first 16 hex chars of blake3(doc_id NUL text)
pub fn derive_chunk_id(doc_id: &str, text: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(doc_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(text.as_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}

pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Ingest counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub skipped_empty: usize,
}

#[derive(Debug, Clone)]
struct IndexSettings {
    vector_dim: usize,
    hnsw_m: usize,
    ef_construction: usize,
    ef_search: usize,
    max_elements: usize,
    fuzzy: bool,
}

/// One opened index
pub struct LocalIndex {
    id: String,
    catalog: Catalog,
    vectors: VectorIndex,
    keywords: KeywordIndex,
}

impl LocalIndex {
    fn open(id: &str, dir: &Path, settings: &IndexSettings) -> Result<Self> {
        let catalog = Catalog::open(&dir.join("catalog.db"))?;
        let dimension = match catalog.dimension()? {
            Some(dimension) => dimension,
            None => {
                catalog.set_dimension(settings.vector_dim)?;
                settings.vector_dim
            }
        };

        let vectors = VectorIndex::new(
            dimension,
            settings.hnsw_m,
            settings.ef_construction,
            settings.ef_search,
            settings.max_elements,
        );
        let rows = catalog.all()?;
        for row in &rows {
            vectors.insert(row.row_id, &row.embedding)?;
        }

        let keywords = KeywordIndex::open(&dir.join("keyword"), settings.fuzzy)?;

        tracing::info!(index = id, chunks = rows.len(), dimension, "Opened index");

        Ok(Self {
            id: id.to_string(),
            catalog,
            vectors,
            keywords,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dimension(&self) -> usize {
        self.vectors.dimension()
    }

    pub fn len(&self) -> Result<usize> {
        self.catalog.count()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Nearest chunks by cosine similarity, best first
    pub fn vector_search(&self, query: &[f32], top_n: usize) -> Result<Vec<IndexHit>> {
        let neighbours = self.vectors.search(query, top_n)?;
        let row_ids: Vec<i64> = neighbours.iter().map(|n| n.row_id).collect();

        let mut rows: HashMap<i64, StoredChunk> = HashMap::with_capacity(row_ids.len());
        for row in self.catalog.get_many(&row_ids)? {
            rows.insert(row.row_id, row);
        }

        Ok(neighbours
            .into_iter()
            .filter_map(|n| {
                rows.remove(&n.row_id).map(|row| IndexHit {
                    doc_id: row.doc_id,
                    chunk_id: row.chunk_id,
                    content_type: row.content_type,
                    text: row.text,
                    score: n.score,
                })
            })
            .take(top_n)
            .collect())
    }

    /// BM25 over segmented terms, best first
    pub fn keyword_search(&self, terms: &[String], top_n: usize) -> Result<Vec<IndexHit>> {
        self.keywords.search(terms, top_n)
    }

    fn write(
        &self,
        pending: &PendingChunk,
        embedding: &[f32],
        terms: &[String],
    ) -> Result<UpsertOutcome> {
        let record = &pending.record;
        let outcome = self.catalog.upsert(
            &pending.chunk_id,
            &record.doc_id,
            record.content_type,
            &record.text,
            &pending.hash,
            embedding,
        )?;

        match outcome {
            UpsertOutcome::Unchanged => return Ok(outcome),
            UpsertOutcome::Inserted(row_id) => self.vectors.insert(row_id, embedding)?,
            UpsertOutcome::Replaced { new, .. } => {
                self.vectors.retire();
                self.vectors.insert(new, embedding)?;
            }
        }

        self.keywords.upsert(
            &pending.chunk_id,
            &record.doc_id,
            record.content_type,
            &record.text,
            terms,
        )?;

        Ok(outcome)
    }
}

struct PendingChunk {
    record: ChunkRecord,
    chunk_id: String,
    hash: String,
}

struct StoreInner {
    root: PathBuf,
    settings: IndexSettings,
    segmenter: Segmenter,
    opened: Mutex<HashMap<String, Arc<LocalIndex>>>,
}

/// Directory of named local indexes
#[derive(Clone)]
pub struct LocalIndexStore {
    inner: Arc<StoreInner>,
}

impl LocalIndexStore {
    pub fn new(root: PathBuf, index: &IndexConfig, keyword: &KeywordConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                root,
                settings: IndexSettings {
                    vector_dim: index.vector_dim,
                    hnsw_m: index.hnsw_m,
                    ef_construction: index.hnsw_ef_construction,
                    ef_search: index.hnsw_ef_search,
                    max_elements: index.max_elements,
                    fuzzy: keyword.fuzzy,
                },
                segmenter: Segmenter::from_config(keyword),
                opened: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Store rooted at `<data_dir>/indexes`
    pub fn from_config(config: &Config) -> Result<Self> {
        let root = config.data_dir()?.join("indexes");
        Ok(Self::new(root, &config.index, &config.keyword))
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn exists(&self, index_id: &str) -> bool {
        self.inner.root.join(index_id).is_dir()
    }

    /// Names of all indexes on disk, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.inner.root.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.inner.root).map_err(|e| RagError::Io {
            source: e,
            context: format!("Failed to list indexes in {:?}", self.inner.root),
        })?;

        let mut names = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_index_id(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Open an existing index; fails with `UnknownIndex` when it was never created
    pub fn open(&self, index_id: &str) -> Result<Arc<LocalIndex>> {
        self.open_inner(index_id, false)
    }

    /// Open an index, creating its directory first when needed
    pub fn create(&self, index_id: &str) -> Result<Arc<LocalIndex>> {
        self.open_inner(index_id, true)
    }

    fn open_inner(&self, index_id: &str, create: bool) -> Result<Arc<LocalIndex>> {
        validate_index_id(index_id).map_err(|reason| RagError::InvalidIndexId {
            index_id: index_id.to_string(),
            reason,
        })?;

        let mut opened = self
            .inner
            .opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = opened.get(index_id) {
            return Ok(index.clone());
        }

        let dir = self.inner.root.join(index_id);
        if !dir.is_dir() {
            if !create {
                return Err(RagError::UnknownIndex {
                    index_id: index_id.to_string(),
                });
            }
            std::fs::create_dir_all(&dir).map_err(|e| RagError::Io {
                source: e,
                context: format!("Failed to create index directory: {:?}", dir),
            })?;
            tracing::info!(index = index_id, path = ?dir, "Created index");
        }

        let index = Arc::new(LocalIndex::open(index_id, &dir, &self.inner.settings)?);
        opened.insert(index_id.to_string(), index.clone());
        Ok(index)
    }

    /// Embed and index `records`, skipping chunks whose content is unchanged
    pub async fn ingest(
        &self,
        index_id: &str,
        records: Vec<ChunkRecord>,
        embedder: &dyn EmbeddingService,
        batch_size: usize,
    ) -> Result<IngestStats> {
        let store = self.clone();
        let id = index_id.to_string();
        let index = blocking(move || store.create(&id)).await?;

        if embedder.dimension() != index.dimension() {
            return Err(RagError::InvalidConfigValue {
                path: "index.vector_dim".to_string(),
                message: format!(
                    "Index '{}' stores {}D vectors but the embedder produces {}D",
                    index_id,
                    index.dimension(),
                    embedder.dimension()
                ),
            });
        }

        let mut stats = IngestStats::default();
        let mut pending = Vec::with_capacity(records.len());
        for record in records {
            if record.text.trim().is_empty() {
                stats.skipped_empty += 1;
                continue;
            }
            let chunk_id = record.resolved_chunk_id();
            let hash = content_hash(&record.text);
            if index.catalog.content_hash(&chunk_id)?.as_deref() == Some(hash.as_str()) {
                stats.unchanged += 1;
                continue;
            }
            pending.push(PendingChunk {
                record,
                chunk_id,
                hash,
            });
        }

        let batch_size = batch_size.max(1);
        while !pending.is_empty() {
            let rest = pending.split_off(batch_size.min(pending.len()));
            let batch = std::mem::replace(&mut pending, rest);

            let texts: Vec<String> = batch.iter().map(|p| p.record.text.clone()).collect();
            let embeddings = embedder.embed_batch(&texts).await?;
            if embeddings.len() != batch.len() {
                return Err(ServiceError::invalid_response(
                    "embedding",
                    format!("expected {} vectors, got {}", batch.len(), embeddings.len()),
                )
                .into());
            }

            let writer = index.clone();
            let segmenter = self.inner.segmenter.clone();
            let outcomes = blocking(move || {
                batch
                    .iter()
                    .zip(&embeddings)
                    .map(|(chunk, embedding)| {
                        let terms = segmenter.segment(&chunk.record.text);
                        writer.write(chunk, embedding, &terms)
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .await?;

            for outcome in outcomes {
                match outcome {
                    UpsertOutcome::Inserted(_) => stats.inserted += 1,
                    UpsertOutcome::Replaced { .. } => stats.replaced += 1,
                    UpsertOutcome::Unchanged => stats.unchanged += 1,
                }
            }
        }

        let committer = index.clone();
        blocking(move || committer.keywords.commit()).await?;

        tracing::info!(
            index = index_id,
            inserted = stats.inserted,
            replaced = stats.replaced,
            unchanged = stats.unchanged,
            skipped_empty = stats.skipped_empty,
            "Ingest complete"
        );

        Ok(stats)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RagError::Index(format!("Index task failed: {}", e)))?
}

fn to_service_error(service: &str, err: RagError) -> ServiceError {
    match err {
        RagError::UnknownIndex { index_id } => ServiceError::UnknownIndex { index_id },
        RagError::InvalidIndexId { .. } => ServiceError::invalid_request(service, err.to_string()),
        RagError::Service(inner) => inner,
        other => ServiceError::invalid_response(service, other.to_string()),
    }
}

#[async_trait]
impl VectorIndexService for LocalIndexStore {
    async fn search(
        &self,
        index_id: &str,
        vector: &[f32],
        top_n: usize,
    ) -> std::result::Result<Vec<IndexHit>, ServiceError> {
        let store = self.clone();
        let id = index_id.to_string();
        let vector = vector.to_vec();
        blocking(move || store.open(&id)?.vector_search(&vector, top_n))
            .await
            .map_err(|e| to_service_error("vector_index", e))
    }
}

#[async_trait]
impl KeywordIndexService for LocalIndexStore {
    async fn search(
        &self,
        index_id: &str,
        terms: &[String],
        top_n: usize,
    ) -> std::result::Result<Vec<IndexHit>, ServiceError> {
        let store = self.clone();
        let id = index_id.to_string();
        let terms = terms.to_vec();
        blocking(move || store.open(&id)?.keyword_search(&terms, top_n))
            .await
            .map_err(|e| to_service_error("keyword_index", e))
    }
}

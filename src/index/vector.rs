/// HNSW vector index for similarity search
use crate::error::{RagError, Result};
use hnsw_rs::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

/// HNSW graph layers; hnsw_rs caps this at 16
const MAX_LAYERS: usize = 16;

/// Nearest neighbour with cosine similarity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbour {
    /// Catalog row id
    pub row_id: i64,
    /// Cosine similarity (higher is more similar)
    pub score: f32,
}

/// In-memory HNSW graph over catalog rows
///
/// Points cannot be removed from the graph. Replaced rows are counted as
/// retired and the search widens by that amount so stale points never
/// shrink the result list.
pub struct VectorIndex {
    graph: RwLock<Hnsw<'static, f32, DistCosine>>,
    dimension: usize,
    ef_search: usize,
    count: AtomicUsize,
    retired: AtomicUsize,
}

impl VectorIndex {
    /// # Arguments
    /// * `dimension` - Vector dimension (must match embedding dimension)
    /// * `m` - HNSW M parameter (connections per node)
    /// * `ef_construction` - Build-time candidate list size
    /// * `ef_search` - Query-time candidate list size
    /// * `max_elements` - Capacity hint
    pub fn new(
        dimension: usize,
        m: usize,
        ef_construction: usize,
        ef_search: usize,
        max_elements: usize,
    ) -> Self {
        let graph = Hnsw::<f32, DistCosine>::new(
            m,
            max_elements,
            MAX_LAYERS,
            ef_construction,
            DistCosine,
        );

        Self {
            graph: RwLock::new(graph),
            dimension,
            ef_search,
            count: AtomicUsize::new(0),
            retired: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, row_id: i64, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(RagError::Index(format!(
                "Invalid dimension: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        let id = usize::try_from(row_id)
            .map_err(|_| RagError::Index(format!("Invalid row id {}", row_id)))?;

        let data = vector.to_vec();
        let graph = self.graph.write().unwrap_or_else(PoisonError::into_inner);
        graph.insert((&data, id));
        self.count.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Mark one graph point as belonging to a replaced row
    pub fn retire(&self) {
        self.retired.fetch_add(1, Ordering::Relaxed);
    }

    /// Up to `k + retired` neighbours, best first
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbour>> {
        if query.len() != self.dimension {
            return Err(RagError::Index(format!(
                "Invalid dimension: expected {}, got {}",
                self.dimension,
                query.len()
            )));
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let wanted = k + self.retired.load(Ordering::Relaxed);
        let ef = self.ef_search.max(wanted);

        let graph = self.graph.read().unwrap_or_else(PoisonError::into_inner);
        let neighbours = graph
            .search(query, wanted, ef)
            .into_iter()
            .map(|n| Neighbour {
                row_id: n.d_id as i64,
                score: 1.0 - n.distance,
            })
            .collect();

        Ok(neighbours)
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

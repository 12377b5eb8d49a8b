//! Final result structures with per-chunk provenance and coverage

use super::{ContentType, ListId, QueryVariant, RerankStatus, SearchMode, VariantOrigin};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One (variant, mode, rank) sighting that contributed to a chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Variant position
    pub variant: usize,
    pub origin: VariantOrigin,
    pub mode: SearchMode,
    /// Rank within that list
    pub rank: usize,
}

/// A chunk in the final answer with full provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub content_type: ContentType,

    /// Text with subtitle timestamps removed
    pub text: String,

    /// Rerank score when the chunk was reranked, fused score otherwise
    pub score: f64,

    /// Cumulative RRF score
    pub fused_score: f64,

    /// 1-based position in the fused list
    pub fused_rank: usize,

    pub rerank_score: Option<f32>,

    /// 1-based position in this result
    pub final_rank: usize,

    pub sources: Vec<SourceRef>,
}

impl RetrievedChunk {
    /// Short preview of the text, cut on a character boundary
    pub fn preview(&self, max_chars: usize) -> String {
        match self.text.char_indices().nth(max_chars) {
            Some((cut, _)) => format!("{}...", &self.text[..cut]),
            None => self.text.clone(),
        }
    }

    /// Retrieval modes that found this chunk, vector first
    pub fn modes(&self) -> Vec<SearchMode> {
        let mut modes: Vec<SearchMode> = self.sources.iter().map(|s| s.mode).collect();
        modes.sort();
        modes.dedup();
        modes
    }
}

/// A (variant, mode) list that contributed nothing because it failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListFailure {
    pub list: ListId,
    pub reason: String,
}

/// Which retrieval paths actually contributed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    /// Lists dispatched
    pub attempted: usize,
    pub succeeded: Vec<ListId>,
    pub failed: Vec<ListFailure>,
    /// Some lists failed while at least one succeeded
    pub degraded: bool,
}

impl Coverage {
    pub fn new(attempted: usize, mut succeeded: Vec<ListId>, mut failed: Vec<ListFailure>) -> Self {
        succeeded.sort();
        failed.sort_by_key(|f| f.list);
        let degraded = !failed.is_empty() && !succeeded.is_empty();
        Self {
            attempted,
            succeeded,
            failed,
            degraded,
        }
    }

    /// True when every list of the given mode failed
    pub fn mode_failed(&self, mode: SearchMode) -> bool {
        let tried = self.failed.iter().any(|f| f.list.mode == mode);
        tried && !self.succeeded.iter().any(|l| l.mode == mode)
    }
}

/// Per-request pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Preprocessing,
    Retrieving,
    Fusing,
    Reranking,
    Done,
    Errored,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Preprocessing, Retrieving)
                | (Retrieving, Fusing)
                | (Retrieving, Errored)
                | (Fusing, Reranking)
                | (Fusing, Done)
                | (Reranking, Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Errored)
    }
}

/// Ordered record of the states one request passed through
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTrail {
    states: Vec<PipelineState>,
}

impl StateTrail {
    pub fn new() -> Self {
        Self {
            states: vec![PipelineState::Preprocessing],
        }
    }

    /// Move to `next`; an illegal transition is logged and ignored
    pub fn advance(&mut self, next: PipelineState) -> bool {
        let current = self.current();
        if !current.can_transition_to(next) {
            tracing::warn!(from = ?current, to = ?next, "Ignoring illegal pipeline transition");
            return false;
        }
        tracing::debug!(from = ?current, to = ?next, "Pipeline transition");
        self.states.push(next);
        true
    }

    pub fn current(&self) -> PipelineState {
        self.states
            .last()
            .copied()
            .unwrap_or(PipelineState::Preprocessing)
    }

    pub fn states(&self) -> &[PipelineState] {
        &self.states
    }
}

impl Default for StateTrail {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the caller gets back from one retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub request_id: Uuid,
    pub query: String,
    pub index_id: String,
    pub variants: Vec<QueryVariant>,
    /// Best first, at most K entries
    pub chunks: Vec<RetrievedChunk>,
    pub coverage: Coverage,
    pub rerank: RerankStatus,
    pub states: StateTrail,
    /// The overall deadline cut retrieval short
    pub deadline_exceeded: bool,
    pub elapsed_ms: u64,
}

impl RetrievalResult {
    /// No matching chunks; a valid outcome, not a failure
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_ids(&self) -> Vec<&str> {
        self.chunks.iter().map(|c| c.chunk_id.as_str()).collect()
    }

    pub fn final_state(&self) -> PipelineState {
        self.states.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut trail = StateTrail::new();
        for next in [
            PipelineState::Retrieving,
            PipelineState::Fusing,
            PipelineState::Reranking,
            PipelineState::Done,
        ] {
            assert!(trail.advance(next));
        }
        assert_eq!(trail.current(), PipelineState::Done);
        assert!(trail.current().is_terminal());
        assert_eq!(trail.states().len(), 5);
    }

    #[test]
    fn test_errored_only_from_retrieving() {
        assert!(PipelineState::Retrieving.can_transition_to(PipelineState::Errored));
        assert!(!PipelineState::Fusing.can_transition_to(PipelineState::Errored));
        assert!(!PipelineState::Reranking.can_transition_to(PipelineState::Errored));

        let mut trail = StateTrail::new();
        assert!(!trail.advance(PipelineState::Done));
        assert_eq!(trail.current(), PipelineState::Preprocessing);
    }

    #[test]
    fn test_empty_fusion_skips_rerank() {
        assert!(PipelineState::Fusing.can_transition_to(PipelineState::Done));
    }

    #[test]
    fn test_coverage_degraded() {
        let failure = ListFailure {
            list: ListId::new(0, SearchMode::Vector),
            reason: "timeout".to_string(),
        };
        let coverage = Coverage::new(2, vec![ListId::new(0, SearchMode::Keyword)], vec![failure.clone()]);
        assert!(coverage.degraded);
        assert!(coverage.mode_failed(SearchMode::Vector));
        assert!(!coverage.mode_failed(SearchMode::Keyword));

        let total = Coverage::new(1, Vec::new(), vec![failure]);
        assert!(!total.degraded);

        let clean = Coverage::new(1, vec![ListId::new(0, SearchMode::Vector)], Vec::new());
        assert!(!clean.degraded);
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let chunk = RetrievedChunk {
            chunk_id: "c".to_string(),
            doc_id: "d".to_string(),
            content_type: ContentType::Text,
            text: "检索增强生成".to_string(),
            score: 0.0,
            fused_score: 0.0,
            fused_rank: 1,
            rerank_score: None,
            final_rank: 1,
            sources: vec![
                SourceRef {
                    variant: 0,
                    origin: VariantOrigin::Original,
                    mode: SearchMode::Keyword,
                    rank: 2,
                },
                SourceRef {
                    variant: 1,
                    origin: VariantOrigin::MultiQuery,
                    mode: SearchMode::Vector,
                    rank: 1,
                },
            ],
        };
        assert_eq!(chunk.preview(2), "检索...");
        assert_eq!(chunk.preview(10), "检索增强生成");
        assert_eq!(chunk.modes(), vec![SearchMode::Vector, SearchMode::Keyword]);
    }
}

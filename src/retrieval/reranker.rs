//! Second-pass relevance ordering of the fused top slice

use super::FusedResult;
use crate::config::Config;
use crate::services::{CallContext, RerankService, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What happened to the rerank step of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RerankStatus {
    /// Scores were applied to the first `candidates` fused results
    Applied { candidates: usize },
    /// No rerank service configured, or the caller switched it off
    Disabled,
    /// The call failed; fused order was kept
    Failed { reason: String },
    /// Nothing to rerank
    NotRun,
}

/// A fused candidate that went through the rerank call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankedResult {
    pub chunk_id: String,
    pub score: f32,
    /// 1-based position in the fused list
    pub fused_rank: usize,
    /// 1-based position after reranking
    pub final_rank: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RerankOutcome {
    /// Indices into the fused list, final order, at most K entries
    pub order: Vec<usize>,
    /// Empty unless the status is `Applied`
    pub reranked: Vec<RerankedResult>,
    pub status: RerankStatus,
}

impl RerankOutcome {
    fn fused_order(len: usize, top_k: usize, status: RerankStatus) -> Self {
        Self {
            order: (0..len.min(top_k)).collect(),
            reranked: Vec::new(),
            status,
        }
    }

    /// Rerank score for a fused index, if it was scored
    pub fn score_for(&self, fused_index: usize) -> Option<f32> {
        self.reranked
            .iter()
            .find(|r| r.fused_rank == fused_index + 1)
            .map(|r| r.score)
    }
}

/// Reorders the first `max(M, K)` fused candidates against the original question
///
/// Anything beyond the slice keeps its fused order and follows it. Any failure
/// of the external call falls back to the fused order unchanged.
pub struct Reranker {
    service: Option<Arc<dyn RerankService>>,
    candidates: usize,
    policy: RetryPolicy,
}

impl Reranker {
    pub fn new(
        service: Option<Arc<dyn RerankService>>,
        candidates: usize,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            service,
            candidates,
            policy,
        }
    }

    pub fn from_config(config: &Config, service: Option<Arc<dyn RerankService>>) -> Self {
        let service = if config.reranker.enabled {
            service
        } else {
            None
        };
        Self::new(
            service,
            config.reranker.candidates,
            RetryPolicy::from_config(&config.retry, config.timeouts.rerank()),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.service.is_some()
    }

    /// Effective slice size for a request asking for `top_k` chunks
    pub fn slice_len(&self, fused_len: usize, top_k: usize) -> usize {
        self.candidates.max(top_k).min(fused_len)
    }

    pub async fn rerank(
        &self,
        query: &str,
        fused: &[FusedResult],
        top_k: usize,
        ctx: &CallContext,
    ) -> RerankOutcome {
        if fused.is_empty() || top_k == 0 {
            return RerankOutcome::fused_order(fused.len(), top_k, RerankStatus::NotRun);
        }
        let Some(service) = &self.service else {
            return RerankOutcome::fused_order(fused.len(), top_k, RerankStatus::Disabled);
        };

        let slice = self.slice_len(fused.len(), top_k);
        let batch: Vec<String> = fused[..slice].iter().map(|f| f.text.clone()).collect();
        let batch = batch.as_slice();

        let scores = match self
            .policy
            .run("rerank", ctx, move || service.rerank(query, batch))
            .await
        {
            Ok(scores) => scores,
            Err(e) => {
                tracing::warn!(error = %e, candidates = slice, "Rerank failed, keeping fused order");
                return RerankOutcome::fused_order(
                    fused.len(),
                    top_k,
                    RerankStatus::Failed {
                        reason: e.to_string(),
                    },
                );
            }
        };

        if scores.len() != slice {
            let reason = format!("expected {} scores, got {}", slice, scores.len());
            tracing::warn!(%reason, "Rerank response misaligned, keeping fused order");
            return RerankOutcome::fused_order(fused.len(), top_k, RerankStatus::Failed { reason });
        }
        if let Some(bad) = scores.iter().position(|s| !s.is_finite()) {
            let reason = format!("non-finite score for candidate {}", bad + 1);
            tracing::warn!(%reason, "Rerank response unusable, keeping fused order");
            return RerankOutcome::fused_order(fused.len(), top_k, RerankStatus::Failed { reason });
        }

        let mut ranked: Vec<usize> = (0..slice).collect();
        ranked.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then_with(|| a.cmp(&b)));

        let reranked = ranked
            .iter()
            .enumerate()
            .map(|(position, &index)| RerankedResult {
                chunk_id: fused[index].chunk_id.clone(),
                score: scores[index],
                fused_rank: index + 1,
                final_rank: position + 1,
            })
            .collect();

        let mut order = ranked;
        order.extend(slice..fused.len());
        order.truncate(top_k);

        tracing::debug!(candidates = slice, returned = order.len(), "Rerank applied");

        RerankOutcome {
            order,
            reranked,
            status: RerankStatus::Applied { candidates: slice },
        }
    }
}

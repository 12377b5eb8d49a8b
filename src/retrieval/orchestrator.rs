//! Per-request pipeline: variants, concurrent search, fusion, rerank

use super::{
    Coverage, FusedResult, FusionRanker, KeywordSearchClient, ListFailure, ListId, PipelineState,
    Query, QueryVariant, RankedList, RerankOutcome, RerankStatus, Reranker, RetrievalResult,
    RetrievedChunk, SearchClient, SourceRef, StateTrail, VariantOrigin, VectorSearchClient,
};
use crate::config::Config;
use crate::error::{RagError, Result};
use crate::retrieval::{validate_index_id, QueryVariantGenerator};
use crate::services::{CallContext, RetryPolicy, ServiceError, Services};
use crate::text::Segmenter;
use ahash::{HashSet, HashSetExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Ranked lists collected before the fusion barrier
struct Collected {
    attempted: usize,
    lists: Vec<RankedList>,
    failures: Vec<ListFailure>,
    deadline_hit: bool,
}

/// Sequences one retrieval request end to end
///
/// All (variant, mode) searches run concurrently on a bounded pool. Failed
/// paths are dropped from fusion and recorded in the coverage report; the
/// request only fails when every path failed, the index is unknown, or the
/// caller cancels.
pub struct RetrievalOrchestrator {
    generator: QueryVariantGenerator,
    clients: Vec<Arc<dyn SearchClient>>,
    fusion: FusionRanker,
    reranker: Reranker,
    default_index: Option<String>,
    top_k: usize,
    deadline: Duration,
    preprocess: Duration,
    concurrency_per_variant: usize,
    max_concurrency: usize,
}

impl RetrievalOrchestrator {
    pub fn new(config: &Config, services: Services) -> Result<Self> {
        let policy = RetryPolicy::for_calls(&config.retry, &config.timeouts);
        let top_n = config.retrieval.top_n;

        let clients: Vec<Arc<dyn SearchClient>> = vec![
            Arc::new(VectorSearchClient::new(
                services.embedder,
                services.vector_index,
                policy.clone(),
                top_n,
            )),
            Arc::new(KeywordSearchClient::new(
                Segmenter::from_config(&config.keyword),
                services.keyword_index,
                policy,
                top_n,
            )),
        ];

        Ok(Self {
            generator: QueryVariantGenerator::new(
                &config.query,
                &config.retry,
                &config.timeouts,
                services.completer,
            )?,
            clients,
            fusion: FusionRanker::from_config(&config.retrieval)?,
            reranker: Reranker::from_config(config, services.reranker),
            default_index: config.index.default_index.clone(),
            top_k: config.retrieval.top_k,
            deadline: config.timeouts.deadline(),
            preprocess: config.timeouts.preprocess(),
            concurrency_per_variant: config.retrieval.concurrency_per_variant,
            max_concurrency: config.retrieval.max_concurrency,
        })
    }

    pub fn reranker(&self) -> &Reranker {
        &self.reranker
    }

    pub async fn retrieve(&self, query: &Query) -> Result<RetrievalResult> {
        self.retrieve_with_cancel(query, CancellationToken::new())
            .await
    }

    /// Retrieve, aborting every in-flight call as soon as `cancel` fires
    pub async fn retrieve_with_cancel(
        &self,
        query: &Query,
        cancel: CancellationToken,
    ) -> Result<RetrievalResult> {
        if query.text().trim().is_empty() {
            return Err(RagError::MissingParameter("query text".to_string()));
        }

        let index_id = query
            .index_id()
            .map(str::to_string)
            .or_else(|| self.default_index.clone())
            .ok_or_else(|| RagError::MissingParameter("index id".to_string()))?;
        validate_index_id(&index_id).map_err(|reason| RagError::InvalidIndexId {
            index_id: index_id.clone(),
            reason,
        })?;

        let top_k = query.top_k().filter(|k| *k > 0).unwrap_or(self.top_k);
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("retrieve", %request_id, index = %index_id);

        self.run(request_id, query, index_id, top_k, cancel)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        request_id: Uuid,
        query: &Query,
        index_id: String,
        top_k: usize,
        cancel: CancellationToken,
    ) -> Result<RetrievalResult> {
        let started = Instant::now();
        let ctx = CallContext::new(started + self.deadline, cancel);
        let mut states = StateTrail::new();

        // LLM steps share their own budget; retrieval keeps the remainder
        let prep = CallContext::new(started + self.preprocess, ctx.cancel.clone());
        let variants = self.generator.generate(query, &prep).await;
        if ctx.cancel.is_cancelled() {
            return Err(RagError::Cancelled);
        }
        tracing::debug!(variants = variants.len(), "Query variants ready");

        states.advance(PipelineState::Retrieving);
        let collected = self.collect(&variants, &index_id, &ctx).await?;

        if collected.lists.is_empty() {
            states.advance(PipelineState::Errored);
            tracing::error!(attempted = collected.attempted, "Every retrieval path failed");
            return Err(RagError::TotalFailure {
                attempted: collected.attempted,
                failures: collected
                    .failures
                    .iter()
                    .map(|f| format!("{}: {}", f.list, f.reason))
                    .collect(),
            });
        }

        let coverage = Coverage::new(
            collected.attempted,
            collected.lists.iter().map(|l| l.list).collect(),
            collected.failures,
        );
        if coverage.degraded {
            tracing::warn!(
                failed = coverage.failed.len(),
                succeeded = coverage.succeeded.len(),
                "Retrieval degraded, fusing partial results"
            );
        }

        states.advance(PipelineState::Fusing);
        let fused = self.fusion.fuse(&collected.lists);

        let outcome = if fused.is_empty() {
            RerankOutcome {
                order: Vec::new(),
                reranked: Vec::new(),
                status: RerankStatus::NotRun,
            }
        } else {
            states.advance(PipelineState::Reranking);
            let outcome = self
                .reranker
                .rerank(query.text().trim(), &fused, top_k, &ctx)
                .await;
            if ctx.cancel.is_cancelled() {
                return Err(RagError::Cancelled);
            }
            outcome
        };
        states.advance(PipelineState::Done);

        let chunks = assemble(&fused, &outcome, &variants);
        let deadline_exceeded = collected.deadline_hit || ctx.is_expired();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            chunks = chunks.len(),
            fused = fused.len(),
            degraded = coverage.degraded,
            deadline_exceeded,
            elapsed_ms,
            "Retrieval complete"
        );

        Ok(RetrievalResult {
            request_id,
            query: query.text().to_string(),
            index_id,
            variants,
            chunks,
            coverage,
            rerank: outcome.status,
            states,
            deadline_exceeded,
            elapsed_ms,
        })
    }

    /// Fan out every (variant, mode) search and wait for all of them, the
    /// deadline, or cancellation
    async fn collect(
        &self,
        variants: &[QueryVariant],
        index_id: &str,
        ctx: &CallContext,
    ) -> Result<Collected> {
        let permits = (self.concurrency_per_variant * variants.len())
            .clamp(1, self.max_concurrency.max(1));
        let semaphore = Arc::new(Semaphore::new(permits));

        let mut tasks = JoinSet::new();
        let mut pending: HashSet<ListId> = HashSet::new();

        for variant in variants {
            for client in &self.clients {
                let list = ListId::new(variant.position, client.mode());
                pending.insert(list);

                let client = Arc::clone(client);
                let variant = variant.clone();
                let index_id = index_id.to_string();
                let ctx = ctx.clone();
                let semaphore = Arc::clone(&semaphore);

                tasks.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return (list, Err(ServiceError::Cancelled)),
                    };
                    let result = client.search(&variant, &index_id, &ctx).await;
                    (list, result)
                });
            }
        }

        let attempted = pending.len();
        tracing::debug!(lists = attempted, permits, "Dispatched searches");

        let mut lists = Vec::with_capacity(attempted);
        let mut failures = Vec::new();
        let mut deadline_hit = false;

        let deadline = tokio::time::sleep_until(ctx.deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    tasks.abort_all();
                    tracing::info!("Retrieval cancelled");
                    return Err(RagError::Cancelled);
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((list, Ok(hits))) => {
                            pending.remove(&list);
                            tracing::debug!(%list, hits = hits.len(), "Search finished");
                            lists.push(RankedList::new(list, hits));
                        }
                        Ok((_, Err(ServiceError::UnknownIndex { index_id }))) => {
                            tasks.abort_all();
                            return Err(RagError::UnknownIndex { index_id });
                        }
                        Ok((list, Err(e))) => {
                            pending.remove(&list);
                            tracing::warn!(%list, error = %e, "Retrieval path failed, continuing without it");
                            failures.push(ListFailure {
                                list,
                                reason: e.to_string(),
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Search task did not complete");
                        }
                    }
                }
                _ = &mut deadline => {
                    deadline_hit = true;
                    tasks.abort_all();
                    tracing::warn!(pending = pending.len(), "Deadline reached, abandoning pending searches");
                    break;
                }
            }
        }

        let reason = if deadline_hit {
            "deadline exceeded"
        } else {
            "search task did not complete"
        };
        failures.extend(pending.into_iter().map(|list| ListFailure {
            list,
            reason: reason.to_string(),
        }));

        Ok(Collected {
            attempted,
            lists,
            failures,
            deadline_hit,
        })
    }
}

/// Final chunks in rerank order with provenance
fn assemble(
    fused: &[FusedResult],
    outcome: &RerankOutcome,
    variants: &[QueryVariant],
) -> Vec<RetrievedChunk> {
    outcome
        .order
        .iter()
        .enumerate()
        .filter_map(|(position, &index)| {
            let result = fused.get(index)?;
            let rerank_score = outcome.score_for(index);
            let sources = result
                .contributions
                .iter()
                .map(|c| SourceRef {
                    variant: c.list.variant,
                    origin: variants
                        .get(c.list.variant)
                        .map(|v| v.origin)
                        .unwrap_or(VariantOrigin::Original),
                    mode: c.list.mode,
                    rank: c.rank,
                })
                .collect();

            Some(RetrievedChunk {
                chunk_id: result.chunk_id.clone(),
                doc_id: result.doc_id.clone(),
                content_type: result.content_type,
                text: result.text.clone(),
                score: rerank_score.map(f64::from).unwrap_or(result.score),
                fused_score: result.score,
                fused_rank: index + 1,
                rerank_score,
                final_rank: position + 1,
                sources,
            })
        })
        .collect()
}

// Integration tests for the retrieval orchestrator over fake services

mod common;

use common::*;
use ragfuse::retrieval::{
    PipelineState, Query, RerankStatus, RetrievalOrchestrator, SearchMode, Turn, VariantOrigin,
};
use ragfuse::services::{CompletionService, ServiceError};
use ragfuse::RagError;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const QUESTION: &str = "hybrid retrieval fusion";

fn no_rerank() -> ragfuse::config::Config {
    let mut config = test_config();
    config.reranker.enabled = false;
    config
}

#[tokio::test]
async fn test_worked_example_end_to_end() {
    let harness = Harness::new(
        Script::Hits(hits(&["A", "B", "C"])),
        Script::Hits(hits(&["B", "A", "D"])),
    );
    let result = harness
        .orchestrator(&no_rerank())
        .retrieve(&Query::new(QUESTION))
        .await
        .unwrap();

    assert_eq!(result.chunk_ids(), vec!["A", "B", "C", "D"]);
    assert!((result.chunks[0].score - (1.0 / 61.0 + 1.0 / 62.0)).abs() < 1e-12);
    assert!((result.chunks[2].score - 1.0 / 63.0).abs() < 1e-12);
    assert_eq!(result.chunks[0].final_rank, 1);

    let a = &result.chunks[0];
    assert_eq!(a.sources.len(), 2);
    assert_eq!(a.sources[0].mode, SearchMode::Vector);
    assert_eq!(a.sources[0].rank, 1);
    assert_eq!(a.sources[1].mode, SearchMode::Keyword);
    assert_eq!(a.sources[1].rank, 2);

    assert_eq!(result.index_id, INDEX);
    assert_eq!(result.coverage.attempted, 2);
    assert!(!result.coverage.degraded);
    assert_eq!(result.rerank, RerankStatus::Disabled);
    assert_eq!(result.final_state(), PipelineState::Done);
    assert!(!result.deadline_exceeded);
}

#[tokio::test]
async fn test_fusion_is_deterministic_across_runs() {
    let harness = Harness::new(
        Script::Hits(hits(&["A", "B", "C", "E"])),
        Script::Hits(hits(&["E", "C", "D"])),
    );
    let orchestrator = harness.orchestrator(&no_rerank());

    let first = orchestrator.retrieve(&Query::new(QUESTION)).await.unwrap();
    let second = orchestrator.retrieve(&Query::new(QUESTION)).await.unwrap();

    assert_eq!(first.chunk_ids(), second.chunk_ids());
    let scores = |r: &ragfuse::retrieval::RetrievalResult| {
        r.chunks.iter().map(|c| c.score).collect::<Vec<_>>()
    };
    assert_eq!(scores(&first), scores(&second));
}

#[tokio::test]
async fn test_vector_failure_equals_keyword_only_run() {
    let keyword = hits(&["B", "A", "D"]);

    let failing = Harness::new(Script::Fail(transport("vector_index")), Script::Hits(keyword.clone()));
    let degraded = failing
        .orchestrator(&no_rerank())
        .retrieve(&Query::new(QUESTION))
        .await
        .unwrap();

    let keyword_only = Harness::new(Script::Hits(Vec::new()), Script::Hits(keyword));
    let baseline = keyword_only
        .orchestrator(&no_rerank())
        .retrieve(&Query::new(QUESTION))
        .await
        .unwrap();

    assert_eq!(degraded.chunk_ids(), baseline.chunk_ids());
    for (a, b) in degraded.chunks.iter().zip(&baseline.chunks) {
        assert_eq!(a.score, b.score);
    }

    assert!(degraded.coverage.degraded);
    assert!(degraded.coverage.mode_failed(SearchMode::Vector));
    assert_eq!(degraded.coverage.failed.len(), 1);
    assert_eq!(degraded.final_state(), PipelineState::Done);
}

#[tokio::test]
async fn test_rerank_failure_returns_fused_top_k() {
    let scripts = || {
        (
            Script::Hits(hits(&["A", "B", "C"])),
            Script::Hits(hits(&["B", "A", "D"])),
        )
    };

    let (v, k) = scripts();
    let baseline = Harness::new(v, k)
        .orchestrator(&no_rerank())
        .retrieve(&Query::new(QUESTION).with_top_k(3))
        .await
        .unwrap();

    let (v, k) = scripts();
    let harness = Harness::new(v, k).with_reranker(RerankScript::Fail);
    let result = harness
        .orchestrator(&test_config())
        .retrieve(&Query::new(QUESTION).with_top_k(3))
        .await
        .unwrap();

    assert_eq!(result.chunk_ids(), vec!["A", "B", "C"]);
    assert_eq!(result.chunk_ids(), baseline.chunk_ids());
    assert!(matches!(result.rerank, RerankStatus::Failed { .. }));
    assert!(result.chunks.iter().all(|c| c.rerank_score.is_none()));
    assert_eq!(result.final_state(), PipelineState::Done);
}

#[tokio::test]
async fn test_misaligned_rerank_response_falls_back() {
    let harness = Harness::new(
        Script::Hits(hits(&["A", "B", "C"])),
        Script::Hits(hits(&["B", "A", "D"])),
    )
    .with_reranker(RerankScript::WrongLength);

    let result = harness
        .orchestrator(&test_config())
        .retrieve(&Query::new(QUESTION))
        .await
        .unwrap();

    assert_eq!(result.chunk_ids(), vec!["A", "B", "C", "D"]);
    assert!(matches!(result.rerank, RerankStatus::Failed { .. }));
}

#[tokio::test]
async fn test_rerank_reorders_top_slice() {
    let harness = Harness::new(
        Script::Hits(hits(&["A", "B", "C"])),
        Script::Hits(hits(&["B", "A", "D"])),
    )
    .with_reranker(RerankScript::ByText(vec![
        ("passage C".to_string(), 0.9),
        ("passage B".to_string(), 0.5),
    ]));

    let mut config = test_config();
    config.reranker.candidates = 3;
    let result = harness
        .orchestrator(&config)
        .retrieve(&Query::new(QUESTION).with_top_k(3))
        .await
        .unwrap();

    assert_eq!(result.chunk_ids(), vec!["C", "B", "A"]);
    assert_eq!(result.rerank, RerankStatus::Applied { candidates: 3 });
    assert_eq!(result.chunks[0].rerank_score, Some(0.9));
    assert_eq!(result.chunks[0].fused_rank, 3);
    assert_eq!(result.chunks[2].rerank_score, Some(0.0));
    assert_eq!(
        result.states.states(),
        &[
            PipelineState::Preprocessing,
            PipelineState::Retrieving,
            PipelineState::Fusing,
            PipelineState::Reranking,
            PipelineState::Done,
        ]
    );

    let reranker = harness.reranker.as_ref().unwrap();
    assert_eq!(
        reranker.batches.lock().unwrap()[0],
        vec!["passage A", "passage B", "passage C"]
    );
}

#[tokio::test]
async fn test_reranker_sees_original_question_not_rewrite() {
    let harness = Harness::new(Script::Hits(hits(&["A"])), Script::Hits(hits(&["A"])))
        .with_reranker(RerankScript::ByText(Vec::new()))
        .with_llm(FakeLlm::new().rewrites_to("How does reciprocal rank fusion handle ties?"));

    let query = Query::new("How does it handle ties?").with_history(vec![
        Turn::user("Tell me about reciprocal rank fusion"),
        Turn::assistant("It merges ranked lists by summing 1/(k+rank)."),
    ]);
    let result = harness
        .orchestrator(&test_config())
        .retrieve(&query)
        .await
        .unwrap();

    assert_eq!(result.variants.len(), 1);
    assert_eq!(result.variants[0].origin, VariantOrigin::Rewritten);
    assert_eq!(
        result.variants[0].text,
        "How does reciprocal rank fusion handle ties?"
    );

    let reranker = harness.reranker.as_ref().unwrap();
    assert_eq!(
        reranker.queries.lock().unwrap().as_slice(),
        &["How does it handle ties?".to_string()]
    );
}

#[tokio::test]
async fn test_no_matches_is_empty_and_done() {
    let harness = Harness::new(Script::Hits(Vec::new()), Script::Hits(Vec::new()))
        .with_reranker(RerankScript::ByText(Vec::new()));
    let result = harness
        .orchestrator(&test_config())
        .retrieve(&Query::new(QUESTION))
        .await
        .unwrap();

    assert!(result.is_empty());
    assert_eq!(result.final_state(), PipelineState::Done);
    assert!(!result
        .states
        .states()
        .contains(&PipelineState::Reranking));
    assert_eq!(result.rerank, RerankStatus::NotRun);
    assert!(!result.coverage.degraded);
    assert!(harness
        .reranker
        .as_ref()
        .unwrap()
        .batches
        .lock()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_total_failure_is_the_only_hard_error() {
    let harness = Harness::new(
        Script::Fail(ServiceError::invalid_request("vector_index", "bad vector")),
        Script::Fail(transport("keyword_index")),
    );
    let err = harness
        .orchestrator(&no_rerank())
        .retrieve(&Query::new(QUESTION))
        .await
        .unwrap_err();

    match err {
        RagError::TotalFailure { attempted, failures } => {
            assert_eq!(attempted, 2);
            assert_eq!(failures.len(), 2);
        }
        other => panic!("expected total failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_index_id_fails_before_any_call() {
    let harness = Harness::new(Script::Hits(hits(&["A"])), Script::Hits(hits(&["A"])));
    let orchestrator = harness.orchestrator(&no_rerank());

    let err = orchestrator
        .retrieve(&Query::new(QUESTION).with_index("My Docs"))
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::InvalidIndexId { .. }));
    assert!(err.is_configuration());
    assert_eq!(harness.vector.calls(), 0);
    assert_eq!(harness.keyword.calls(), 0);
}

#[tokio::test]
async fn test_missing_index_and_empty_query() {
    let harness = Harness::new(Script::Hits(hits(&["A"])), Script::Hits(hits(&["A"])));
    let mut config = no_rerank();
    config.index.default_index = None;
    let orchestrator = harness.orchestrator(&config);

    let err = orchestrator.retrieve(&Query::new(QUESTION)).await.unwrap_err();
    assert!(matches!(err, RagError::MissingParameter(_)));

    let err = orchestrator
        .retrieve(&Query::new("   ").with_index(INDEX))
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::MissingParameter(_)));
}

#[tokio::test]
async fn test_unknown_index_is_fatal() {
    let harness = Harness::new(Script::Hits(hits(&["A"])), Script::Hits(hits(&["A"])));
    let err = harness
        .orchestrator(&no_rerank())
        .retrieve(&Query::new(QUESTION).with_index("elsewhere"))
        .await
        .unwrap_err();

    assert!(matches!(err, RagError::UnknownIndex { ref index_id } if index_id == "elsewhere"));
}

#[tokio::test]
async fn test_deadline_returns_partial_results() {
    let harness = Harness::new(
        Script::Slow(Duration::from_secs(5), hits(&["A"])),
        Script::Hits(hits(&["B", "C"])),
    );
    let mut config = no_rerank();
    config.timeouts.deadline_ms = 200;
    config.timeouts.call_ms = 200;

    let started = Instant::now();
    let result = harness
        .orchestrator(&config)
        .retrieve(&Query::new(QUESTION))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(result.chunk_ids(), vec!["B", "C"]);
    assert!(result.deadline_exceeded);
    assert!(result.coverage.degraded);
    assert!(result.coverage.mode_failed(SearchMode::Vector));
    assert_eq!(result.final_state(), PipelineState::Done);
}

#[tokio::test]
async fn test_cancellation_stops_in_flight_calls() {
    let harness = Harness::new(
        Script::Slow(Duration::from_secs(5), hits(&["A"])),
        Script::Slow(Duration::from_secs(5), hits(&["B"])),
    );
    let orchestrator = harness.orchestrator(&no_rerank());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = orchestrator
        .retrieve_with_cancel(&Query::new(QUESTION), cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, RagError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_fallback_floor_without_expansion() {
    let harness = Harness::new(Script::Hits(hits(&["A"])), Script::Hits(hits(&["A"])))
        .with_llm(FakeLlm::new().paraphrases(&["fusion of hybrid retrieval"]));

    let result = harness
        .orchestrator(&no_rerank())
        .retrieve(&Query::new("Compare BM25 and dense retrieval, which is better?"))
        .await
        .unwrap();

    assert_eq!(result.variants.len(), 1);
    assert_eq!(result.variants[0].origin, VariantOrigin::Original);
    assert!(harness.llm.as_ref().unwrap().prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_expansion_keeps_original_variant() {
    let harness = Harness::new(Script::Hits(hits(&["A"])), Script::Hits(hits(&["A"])))
        .with_llm(FakeLlm::new());
    let mut config = no_rerank();
    config.query.multi_query = true;
    config.query.decomposition = true;

    let result = harness
        .orchestrator(&config)
        .retrieve(&Query::new("Compare BM25 and dense retrieval, which is better?"))
        .await
        .unwrap();

    assert_eq!(result.variants.len(), 1);
    assert_eq!(result.chunk_ids(), vec!["A"]);
}

#[tokio::test]
async fn test_every_variant_is_searched_in_both_modes() {
    let harness = Harness::new(Script::Hits(hits(&["A", "B"])), Script::Hits(hits(&["C"])))
        .with_llm(FakeLlm::new().paraphrases(&["dense sparse ranking merge", "rank fusion methods"]));
    let mut config = no_rerank();
    config.query.multi_query = true;

    let result = harness
        .orchestrator(&config)
        .retrieve(&Query::new(QUESTION))
        .await
        .unwrap();

    assert_eq!(result.variants.len(), 3);
    assert_eq!(result.variants[1].origin, VariantOrigin::MultiQuery);
    assert_eq!(result.coverage.attempted, 6);
    assert_eq!(result.coverage.succeeded.len(), 6);
    assert_eq!(harness.vector.calls(), 3);
    assert_eq!(harness.keyword.calls(), 3);

    // A is first in all three vector lists
    let a = &result.chunks[0];
    assert_eq!(a.chunk_id, "A");
    assert_eq!(a.sources.len(), 3);
    assert!((a.score - 3.0 / 61.0).abs() < 1e-12);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let harness = Harness::new(
        Script::Flaky {
            failures: 2,
            hits: hits(&["A"]),
        },
        Script::Hits(hits(&["A"])),
    );
    let result = harness
        .orchestrator(&no_rerank())
        .retrieve(&Query::new(QUESTION))
        .await
        .unwrap();

    assert_eq!(harness.vector.calls(), 3);
    assert!(!result.coverage.degraded);
    assert_eq!(result.chunks[0].sources.len(), 2);
}

#[tokio::test]
async fn test_validation_errors_are_not_retried() {
    let harness = Harness::new(
        Script::Fail(ServiceError::invalid_request("vector_index", "dimension mismatch")),
        Script::Hits(hits(&["A"])),
    );
    let result = harness
        .orchestrator(&no_rerank())
        .retrieve(&Query::new(QUESTION))
        .await
        .unwrap();

    assert_eq!(harness.vector.calls(), 1);
    assert!(result.coverage.degraded);
    assert_eq!(result.chunk_ids(), vec!["A"]);
}

#[tokio::test]
async fn test_hung_llm_leaves_retrieval_its_budget() {
    let harness = Harness::new(Script::Hits(hits(&["A", "B"])), Script::Hits(hits(&["B"])));
    let llm = HangingLlm::new();
    let mut services = harness.services();
    services.completer = Some(llm.clone() as Arc<dyn CompletionService>);

    // one LLM attempt may outlast the whole preprocessing budget
    let mut config = no_rerank();
    config.timeouts.llm_ms = 2_000;
    config.query.multi_query = true;
    config.query.decomposition = true;
    let orchestrator = RetrievalOrchestrator::new(&config, services).unwrap();

    let query = Query::new("How does it rank them?").with_history(vec![
        Turn::user("Tell me about hybrid retrieval"),
        Turn::assistant("It merges vector and keyword results."),
    ]);
    let started = Instant::now();
    let result = orchestrator.retrieve(&query).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(2_500));
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.final_state(), PipelineState::Done);
    assert_eq!(result.variants.len(), 1);
    assert_eq!(result.variants[0].origin, VariantOrigin::Original);
    assert_eq!(result.chunk_ids(), vec!["B", "A"]);
    assert!(!result.coverage.degraded);
    assert!(!result.deadline_exceeded);
}

#[tokio::test]
async fn test_search_pool_bounded_per_variant() {
    let gauge = ConcurrencyGauge::new();
    let harness = Harness::gauged(
        Script::Slow(Duration::from_millis(50), hits(&["A"])),
        gauge.clone(),
    )
    .with_llm(FakeLlm::new().paraphrases(&["dense sparse ranking merge", "rank fusion methods"]));
    let mut config = no_rerank();
    config.query.multi_query = true;
    config.retrieval.concurrency_per_variant = 1;

    let result = harness
        .orchestrator(&config)
        .retrieve(&Query::new(QUESTION))
        .await
        .unwrap();

    assert_eq!(result.variants.len(), 3);
    assert_eq!(result.coverage.succeeded.len(), 6);
    assert!(gauge.peak() <= 3, "peak {} exceeds 3 permits", gauge.peak());
    assert!(gauge.peak() >= 2);
}

#[tokio::test]
async fn test_search_pool_capped_by_max_concurrency() {
    let gauge = ConcurrencyGauge::new();
    let harness = Harness::gauged(
        Script::Slow(Duration::from_millis(50), hits(&["A"])),
        gauge.clone(),
    )
    .with_llm(FakeLlm::new().paraphrases(&["dense sparse ranking merge", "rank fusion methods"]));
    let mut config = no_rerank();
    config.query.multi_query = true;
    config.retrieval.concurrency_per_variant = 4;
    config.retrieval.max_concurrency = 2;

    let result = harness
        .orchestrator(&config)
        .retrieve(&Query::new(QUESTION))
        .await
        .unwrap();

    assert_eq!(result.coverage.succeeded.len(), 6);
    assert!(gauge.peak() <= 2, "peak {} exceeds 2 permits", gauge.peak());
}

#[tokio::test]
async fn test_compound_question_is_decomposed() {
    let harness = Harness::new(Script::Hits(hits(&["A", "B"])), Script::Hits(hits(&["C"])))
        .with_llm(FakeLlm::new().sub_questions(&["What is Rust?", "What is Go?"]));
    let mut config = no_rerank();
    config.query.decomposition = true;

    let result = harness
        .orchestrator(&config)
        .retrieve(&Query::new("Compare Rust and Go"))
        .await
        .unwrap();

    let origins: Vec<VariantOrigin> = result.variants.iter().map(|v| v.origin).collect();
    assert_eq!(
        origins,
        vec![
            VariantOrigin::Original,
            VariantOrigin::DecomposedSubquestion,
            VariantOrigin::DecomposedSubquestion,
        ]
    );
    assert_eq!(result.variants[2].text, "What is Go?");
    assert_eq!(result.coverage.attempted, 6);
    assert_eq!(harness.vector.calls(), 3);
    assert_eq!(harness.keyword.calls(), 3);
    assert_eq!(result.chunks[0].sources.len(), 3);
}

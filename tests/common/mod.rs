//! In-process fake services for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use ragfuse::config::{Config, TimeoutConfig};
use ragfuse::retrieval::{ContentType, RetrievalOrchestrator};
use ragfuse::services::{
    CompletionService, EmbeddingService, IndexHit, KeywordIndexService, RerankService,
    ServiceError, Services, VectorIndexService,
};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const INDEX: &str = "docs";

pub fn hit(chunk_id: &str) -> IndexHit {
    IndexHit {
        doc_id: format!("doc-{}", chunk_id),
        chunk_id: chunk_id.to_string(),
        content_type: ContentType::Text,
        text: format!("passage {}", chunk_id),
        score: 1.0,
    }
}

pub fn hits(ids: &[&str]) -> Vec<IndexHit> {
    ids.iter().map(|id| hit(id)).collect()
}

pub fn transport(service: &str) -> ServiceError {
    ServiceError::Transport {
        service: service.to_string(),
        message: "connection refused".to_string(),
    }
}

/// Configuration with short timeouts and the test index as default
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.index.default_index = Some(INDEX.to_string());
    config.index.vector_dim = 4;
    config.retrieval.top_k = 10;
    config.reranker.candidates = 10;
    config.timeouts = TimeoutConfig {
        call_ms: 500,
        llm_ms: 500,
        rerank_ms: 500,
        preprocess_ms: 1_000,
        deadline_ms: 3_000,
    };
    config.retry.base_delay_ms = 5;
    config.retry.max_delay_ms = 20;
    config
}

/// How a fake index answers every call
#[derive(Clone)]
pub enum Script {
    Hits(Vec<IndexHit>),
    Fail(ServiceError),
    Slow(Duration, Vec<IndexHit>),
    /// Transport failures for the first `failures` calls, then hits
    Flaky { failures: u32, hits: Vec<IndexHit> },
}

/// Peak number of index calls in flight at once, across every index sharing it
#[derive(Default)]
pub struct ConcurrencyGauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ScriptedIndex {
    script: Script,
    calls: AtomicU32,
    gauge: Option<Arc<ConcurrencyGauge>>,
}

impl ScriptedIndex {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicU32::new(0),
            gauge: None,
        })
    }

    pub fn gauged(script: Script, gauge: Arc<ConcurrencyGauge>) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicU32::new(0),
            gauge: Some(gauge),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn respond(&self, index_id: &str, top_n: usize) -> Result<Vec<IndexHit>, ServiceError> {
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        let result = self.answer(index_id, top_n).await;
        if let Some(gauge) = &self.gauge {
            gauge.leave();
        }
        result
    }

    async fn answer(&self, index_id: &str, top_n: usize) -> Result<Vec<IndexHit>, ServiceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if index_id != INDEX {
            return Err(ServiceError::UnknownIndex {
                index_id: index_id.to_string(),
            });
        }

        let mut hits = match &self.script {
            Script::Hits(hits) => hits.clone(),
            Script::Fail(err) => return Err(err.clone()),
            Script::Slow(delay, hits) => {
                tokio::time::sleep(*delay).await;
                hits.clone()
            }
            Script::Flaky { failures, hits } => {
                if call < *failures {
                    return Err(transport("index"));
                }
                hits.clone()
            }
        };
        hits.truncate(top_n);
        Ok(hits)
    }
}

#[async_trait]
impl VectorIndexService for ScriptedIndex {
    async fn search(
        &self,
        index_id: &str,
        _vector: &[f32],
        top_n: usize,
    ) -> Result<Vec<IndexHit>, ServiceError> {
        self.respond(index_id, top_n).await
    }
}

#[async_trait]
impl KeywordIndexService for ScriptedIndex {
    async fn search(
        &self,
        index_id: &str,
        _terms: &[String],
        top_n: usize,
    ) -> Result<Vec<IndexHit>, ServiceError> {
        self.respond(index_id, top_n).await
    }
}

/// Hashed bag-of-words vectors; similar texts land close together
pub struct FakeEmbedder {
    dimension: usize,
}

impl FakeEmbedder {
    pub fn new(dimension: usize) -> Arc<Self> {
        Arc::new(Self { dimension })
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        vector[0] = 0.1;
        for word in text.split_whitespace() {
            let word = word.to_lowercase();
            let bucket = word.bytes().fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
            vector[bucket % self.dimension] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingService for FakeEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        Ok(self.vector(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

pub enum RerankScript {
    /// Score by exact candidate text, 0.0 for anything else
    ByText(Vec<(String, f32)>),
    Fail,
    WrongLength,
}

pub struct FakeReranker {
    script: RerankScript,
    pub queries: Mutex<Vec<String>>,
    pub batches: Mutex<Vec<Vec<String>>>,
}

impl FakeReranker {
    pub fn new(script: RerankScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            queries: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl RerankService for FakeReranker {
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>, ServiceError> {
        self.queries.lock().unwrap().push(query.to_string());
        self.batches.lock().unwrap().push(candidates.to_vec());

        match &self.script {
            RerankScript::ByText(scores) => Ok(candidates
                .iter()
                .map(|c| {
                    scores
                        .iter()
                        .find(|(text, _)| text == c)
                        .map(|(_, score)| *score)
                        .unwrap_or(0.0)
                })
                .collect()),
            RerankScript::Fail => Err(ServiceError::Status {
                service: "rerank".to_string(),
                status: 400,
                message: "bad request".to_string(),
            }),
            RerankScript::WrongLength => Ok(vec![1.0]),
        }
    }
}

/// Answers by prompt kind; `None` makes that kind fail
pub struct FakeLlm {
    pub coreference: Option<String>,
    pub decomposition: Option<String>,
    pub expansion: Option<String>,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeLlm {
    pub fn new() -> Self {
        Self {
            coreference: None,
            decomposition: None,
            expansion: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn rewrites_to(mut self, query: &str) -> Self {
        self.coreference = Some(serde_json::json!({ "query": query }).to_string());
        self
    }

    pub fn paraphrases(mut self, queries: &[&str]) -> Self {
        self.expansion = Some(serde_json::json!({ "queries": queries }).to_string());
        self
    }

    pub fn sub_questions(mut self, questions: &[&str]) -> Self {
        self.decomposition = Some(serde_json::json!({ "sub_questions": questions }).to_string());
        self
    }
}

#[async_trait]
impl CompletionService for FakeLlm {
    async fn complete(&self, prompt: &str) -> Result<String, ServiceError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let reply = if prompt.contains("Rewrite the latest question") {
            &self.coreference
        } else if prompt.contains("sub-questions") {
            &self.decomposition
        } else {
            &self.expansion
        };
        reply.clone().ok_or_else(|| ServiceError::Status {
            service: "llm".to_string(),
            status: 400,
            message: "model refused".to_string(),
        })
    }
}

/// Completion service that never answers
pub struct HangingLlm {
    pub calls: AtomicU32,
}

impl HangingLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl CompletionService for HangingLlm {
    async fn complete(&self, _prompt: &str) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(String::new())
    }
}

/// Fake collaborators wired into an orchestrator
pub struct Harness {
    pub embedder: Arc<FakeEmbedder>,
    pub vector: Arc<ScriptedIndex>,
    pub keyword: Arc<ScriptedIndex>,
    pub reranker: Option<Arc<FakeReranker>>,
    pub llm: Option<Arc<FakeLlm>>,
}

impl Harness {
    pub fn new(vector: Script, keyword: Script) -> Self {
        Self {
            embedder: FakeEmbedder::new(4),
            vector: ScriptedIndex::new(vector),
            keyword: ScriptedIndex::new(keyword),
            reranker: None,
            llm: None,
        }
    }

    /// Both indexes answer with `script` and report into one gauge
    pub fn gauged(script: Script, gauge: Arc<ConcurrencyGauge>) -> Self {
        Self {
            embedder: FakeEmbedder::new(4),
            vector: ScriptedIndex::gauged(script.clone(), gauge.clone()),
            keyword: ScriptedIndex::gauged(script, gauge),
            reranker: None,
            llm: None,
        }
    }

    pub fn with_reranker(mut self, script: RerankScript) -> Self {
        self.reranker = Some(FakeReranker::new(script));
        self
    }

    pub fn with_llm(mut self, llm: FakeLlm) -> Self {
        self.llm = Some(Arc::new(llm));
        self
    }

    pub fn services(&self) -> Services {
        Services {
            embedder: self.embedder.clone(),
            vector_index: self.vector.clone(),
            keyword_index: self.keyword.clone(),
            reranker: self
                .reranker
                .clone()
                .map(|r| r as Arc<dyn RerankService>),
            completer: self.llm.clone().map(|l| l as Arc<dyn CompletionService>),
        }
    }

    pub fn orchestrator(&self, config: &Config) -> RetrievalOrchestrator {
        RetrievalOrchestrator::new(config, self.services()).unwrap()
    }
}

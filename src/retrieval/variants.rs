//! Query variant generation: coreference resolution, decomposition, multi-query expansion
//!
//! Every LLM step is optional and bounded by the request deadline. A failed
//! step is logged and skipped; the (possibly rewritten) query text is always
//! the first variant.

use super::{Query, Role, Turn};
use crate::config::{QueryConfig, RetryConfig, TimeoutConfig};
use crate::error::{RagError, Result};
use crate::services::{CallContext, CompletionService, RetryPolicy, ServiceError};
use ahash::{HashSet, HashSetExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Where a variant came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantOrigin {
    Original,
    Rewritten,
    MultiQuery,
    DecomposedSubquestion,
}

/// One query string to search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryVariant {
    pub text: String,
    pub origin: VariantOrigin,
    /// Sequence position; 0 is always the original or rewritten query
    pub position: usize,
}

impl QueryVariant {
    pub fn new(text: impl Into<String>, origin: VariantOrigin, position: usize) -> Self {
        Self {
            text: text.into(),
            origin,
            position,
        }
    }
}

/// Decomposition decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Simple,
    Compound,
}

/// Scores a question for independent clauses, comparisons and multiple interrogative foci
///
/// Points:
/// - comparison construct: 2
/// - each question mark after the first: 2
/// - each interrogative word after the first: 1
/// - clause conjunction: 1
///
/// A query is compound when its score reaches the threshold.
#[derive(Debug, Clone)]
pub struct ComplexityClassifier {
    threshold: u32,
    comparison: Regex,
    interrogative: Regex,
    conjunction: Regex,
}

impl ComplexityClassifier {
    pub fn new(threshold: u32) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| RagError::Config(format!("Invalid complexity pattern: {}", e)))
        };

        Ok(Self {
            threshold,
            comparison: compile(
                r"(?i)\b(compare|comparison|versus|vs\.?|differences? between|better than|worse than|pros and cons)\b|比较|对比|区别|差异|相比",
            )?,
            interrogative: compile(
                r"(?i)\b(what|how|why|when|where|which|who)\b|什么|如何|为什么|怎么|哪些|哪个|多少",
            )?,
            conjunction: compile(
                r"(?i)\b(as well as|and also|and then|in addition)\b|以及|并且|而且|另外",
            )?,
        })
    }

    pub fn score(&self, text: &str) -> u32 {
        let mut score = 0;

        if self.comparison.is_match(text) {
            score += 2;
        }

        let question_marks = text.chars().filter(|c| *c == '?' || *c == '？').count() as u32;
        score += 2 * question_marks.saturating_sub(1);

        let interrogatives = self.interrogative.find_iter(text).count() as u32;
        score += interrogatives.saturating_sub(1);

        if self.conjunction.is_match(text) {
            score += 1;
        }

        score
    }

    pub fn classify(&self, text: &str) -> Complexity {
        if self.score(text) >= self.threshold {
            Complexity::Compound
        } else {
            Complexity::Simple
        }
    }
}

/// Turns one query and its history into an ordered, non-empty list of variants
pub struct QueryVariantGenerator {
    completer: Option<Arc<dyn CompletionService>>,
    policy: RetryPolicy,
    classifier: ComplexityClassifier,
    history_turns: usize,
    decomposition: bool,
    multi_query: bool,
    paraphrase_count: usize,
    max_subquestions: usize,
}

impl QueryVariantGenerator {
    pub fn new(
        config: &QueryConfig,
        retry: &RetryConfig,
        timeouts: &TimeoutConfig,
        completer: Option<Arc<dyn CompletionService>>,
    ) -> Result<Self> {
        Ok(Self {
            completer,
            policy: RetryPolicy::from_config(retry, timeouts.llm()),
            classifier: ComplexityClassifier::new(config.complexity_threshold)?,
            history_turns: config.history_turns,
            decomposition: config.decomposition,
            multi_query: config.multi_query,
            paraphrase_count: config.paraphrase_count,
            max_subquestions: config.max_subquestions,
        })
    }

    pub fn classifier(&self) -> &ComplexityClassifier {
        &self.classifier
    }

    /// Never fails: every LLM step falls back to the text it was given
    pub async fn generate(&self, query: &Query, ctx: &CallContext) -> Vec<QueryVariant> {
        let original = query.text().trim().to_string();

        let (base, origin) = match self.resolve_coreferences(&original, query.history(), ctx).await
        {
            Some(rewritten) => (rewritten, VariantOrigin::Rewritten),
            None => (original, VariantOrigin::Original),
        };

        let mut candidates = vec![(base.clone(), origin)];

        if self.decomposition && self.classifier.classify(&base) == Complexity::Compound {
            for sub in self.decompose(&base, ctx).await {
                candidates.push((sub, VariantOrigin::DecomposedSubquestion));
            }
        }

        if self.multi_query {
            for paraphrase in self.expand(&base, ctx).await {
                candidates.push((paraphrase, VariantOrigin::MultiQuery));
            }
        }

        let mut seen = HashSet::new();
        let variants: Vec<QueryVariant> = candidates
            .into_iter()
            .filter(|(text, _)| !text.is_empty() && seen.insert(text.to_lowercase()))
            .enumerate()
            .map(|(position, (text, origin))| QueryVariant::new(text, origin, position))
            .collect();

        tracing::debug!(count = variants.len(), "Generated query variants");
        variants
    }

    /// Rewritten text when history changes the meaning of the query
    async fn resolve_coreferences(
        &self,
        query: &str,
        history: &[Turn],
        ctx: &CallContext,
    ) -> Option<String> {
        if history.is_empty() || self.history_turns == 0 {
            return None;
        }
        let completer = self.completer.as_ref()?;

        let recent = &history[history.len().saturating_sub(self.history_turns * 2)..];
        let prompt = coreference_prompt(query, recent);

        let response = match self.complete(completer, &prompt, ctx).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Coreference resolution failed; using the original query");
                return None;
            }
        };

        match parse_object(&response)
            .and_then(|v| v.get("query").and_then(Value::as_str).map(str::trim).map(String::from))
        {
            Some(rewritten) if !rewritten.is_empty() && rewritten != query => {
                tracing::debug!(rewritten = %rewritten, "Resolved coreferences");
                Some(rewritten)
            }
            Some(_) => None,
            None => {
                tracing::warn!("Coreference response had no query field; using the original query");
                None
            }
        }
    }

    async fn decompose(&self, query: &str, ctx: &CallContext) -> Vec<String> {
        let Some(completer) = self.completer.as_ref() else {
            tracing::debug!("Decomposition enabled without a completion service; skipping");
            return Vec::new();
        };

        let prompt = decomposition_prompt(query, self.max_subquestions);
        match self.complete(completer, &prompt, ctx).await {
            Ok(response) => {
                let mut subs = parse_string_list(&response, "sub_questions");
                subs.truncate(self.max_subquestions);
                subs
            }
            Err(e) => {
                tracing::warn!(error = %e, "Query decomposition failed; continuing without sub-questions");
                Vec::new()
            }
        }
    }

    async fn expand(&self, query: &str, ctx: &CallContext) -> Vec<String> {
        let Some(completer) = self.completer.as_ref() else {
            tracing::debug!("Multi-query enabled without a completion service; skipping");
            return Vec::new();
        };

        let prompt = expansion_prompt(query, self.paraphrase_count);
        match self.complete(completer, &prompt, ctx).await {
            Ok(response) => {
                let mut paraphrases = parse_string_list(&response, "queries");
                paraphrases.truncate(self.paraphrase_count);
                paraphrases
            }
            Err(e) => {
                tracing::warn!(error = %e, "Multi-query expansion failed; continuing without paraphrases");
                Vec::new()
            }
        }
    }

    async fn complete(
        &self,
        completer: &Arc<dyn CompletionService>,
        prompt: &str,
        ctx: &CallContext,
    ) -> std::result::Result<String, ServiceError> {
        self.policy
            .run("llm", ctx, move || completer.complete(prompt))
            .await
    }
}

fn format_history(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            format!("{}: {}", speaker, turn.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn coreference_prompt(query: &str, history: &[Turn]) -> String {
    format!(
        "Conversation so far:\n{}\n\n\
         Latest question: {}\n\n\
         Rewrite the latest question so it can be understood without the conversation: \
         replace pronouns and implicit references with the entities they refer to. \
         Keep the language of the question. If nothing needs replacing, return it unchanged.\n\
         Answer as {{\"query\": \"<rewritten question>\"}}.",
        format_history(history),
        query
    )
}

fn decomposition_prompt(query: &str, max: usize) -> String {
    format!(
        "Question: {}\n\n\
         Split the question into at most {} independent sub-questions that can each be \
         answered by searching documents on their own. Keep the language of the question. \
         If the question is already atomic, return an empty list.\n\
         Answer as {{\"sub_questions\": [\"...\"]}}.",
        query, max
    )
}

fn expansion_prompt(query: &str, count: usize) -> String {
    format!(
        "Question: {}\n\n\
         Write {} alternative phrasings of the question that use different wording but ask \
         for the same information. Keep the language of the question.\n\
         Answer as {{\"queries\": [\"...\"]}}.",
        query, count
    )
}

/// First JSON object in a completion, tolerating code fences and prose around it
fn parse_object(response: &str) -> Option<Value> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str::<Value>(&response[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// Non-empty strings under `key`; falls back to the first array-valued field
fn parse_string_list(response: &str, key: &str) -> Vec<String> {
    let Some(object) = parse_object(response) else {
        tracing::warn!(key, "Completion was not a JSON object");
        return Vec::new();
    };

    let list = object.get(key).and_then(Value::as_array).or_else(|| {
        object
            .as_object()
            .and_then(|map| map.values().find_map(Value::as_array))
    });

    list.map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers prompts by keyword; records every prompt it sees
    struct ScriptedLlm {
        coreference: std::result::Result<String, ServiceError>,
        decomposition: String,
        expansion: String,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new() -> Self {
            Self {
                coreference: Ok(r#"{"query": "How is Rust memory safe?"}"#.to_string()),
                decomposition: r#"{"sub_questions": ["What is Rust?", "What is Go?"]}"#.to_string(),
                expansion: r#"```json
{"queries": ["Rust memory safety explained", "why is rust memory safe"]}
```"#
                    .to_string(),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionService for ScriptedLlm {
        async fn complete(&self, prompt: &str) -> std::result::Result<String, ServiceError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if prompt.contains("Rewrite the latest question") {
                self.coreference.clone()
            } else if prompt.contains("sub-questions") {
                Ok(self.decomposition.clone())
            } else {
                Ok(self.expansion.clone())
            }
        }
    }

    fn config(decomposition: bool, multi_query: bool) -> QueryConfig {
        QueryConfig {
            decomposition,
            multi_query,
            ..QueryConfig::default()
        }
    }

    fn generator(
        config: QueryConfig,
        completer: Option<Arc<dyn CompletionService>>,
    ) -> QueryVariantGenerator {
        QueryVariantGenerator::new(
            &config,
            &RetryConfig::default(),
            &TimeoutConfig::default(),
            completer,
        )
        .unwrap()
    }

    fn ctx() -> CallContext {
        CallContext::with_budget(Duration::from_secs(5))
    }

    #[test]
    fn test_classifier() {
        let classifier = ComplexityClassifier::new(1).unwrap();
        assert_eq!(classifier.classify("What is machine learning?"), Complexity::Simple);
        assert_eq!(classifier.classify("Compare Rust and Go"), Complexity::Compound);
        assert_eq!(
            classifier.classify("What is HNSW? How does BM25 work?"),
            Complexity::Compound
        );
        assert_eq!(classifier.classify("Milvus 和 Elasticsearch 的区别"), Complexity::Compound);
        assert_eq!(classifier.score("how fast is it"), 0);
    }

    #[test]
    fn test_classifier_threshold_is_tunable() {
        let strict = ComplexityClassifier::new(3).unwrap();
        assert_eq!(strict.classify("Compare Rust and Go"), Complexity::Simple);
        assert_eq!(
            strict.classify("Compare Rust and Go. Which is faster and how does it scale?"),
            Complexity::Compound
        );
    }

    #[tokio::test]
    async fn test_floor_without_llm() {
        let generator = generator(config(true, true), None);
        let query = Query::new("  Compare Rust and Go  ")
            .with_history(vec![Turn::user("hello")]);

        let variants = generator.generate(&query, &ctx()).await;
        assert_eq!(
            variants,
            vec![QueryVariant::new("Compare Rust and Go", VariantOrigin::Original, 0)]
        );
    }

    #[tokio::test]
    async fn test_simple_query_is_never_decomposed() {
        let llm = Arc::new(ScriptedLlm::new());
        let generator = generator(config(true, false), Some(llm.clone()));

        let variants = generator
            .generate(&Query::new("What is machine learning?"), &ctx())
            .await;

        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].origin, VariantOrigin::Original);
        assert!(llm.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_generation_order() {
        let llm = Arc::new(ScriptedLlm::new());
        let generator = generator(config(true, true), Some(llm.clone()));

        let query = Query::new("Compare it with Go").with_history(vec![
            Turn::user("Tell me about Rust"),
            Turn::assistant("Rust is a language"),
        ]);
        let variants = generator.generate(&query, &ctx()).await;

        let summary: Vec<(&str, VariantOrigin, usize)> = variants
            .iter()
            .map(|v| (v.text.as_str(), v.origin, v.position))
            .collect();

        // the rewritten text is not compound, so no sub-questions
        assert_eq!(
            summary,
            vec![
                ("How is Rust memory safe?", VariantOrigin::Rewritten, 0),
                ("Rust memory safety explained", VariantOrigin::MultiQuery, 1),
                ("why is rust memory safe", VariantOrigin::MultiQuery, 2),
            ]
        );
    }

    #[tokio::test]
    async fn test_decomposition_and_dedup() {
        let mut llm = ScriptedLlm::new();
        llm.decomposition =
            r#"{"sub_questions": ["What is Rust?", "compare rust and go", "What is Go?"]}"#
                .to_string();
        let generator = generator(config(true, false), Some(Arc::new(llm)));

        let variants = generator.generate(&Query::new("Compare Rust and Go"), &ctx()).await;
        let texts: Vec<&str> = variants.iter().map(|v| v.text.as_str()).collect();

        assert_eq!(texts, vec!["Compare Rust and Go", "What is Rust?", "What is Go?"]);
        assert_eq!(variants[1].origin, VariantOrigin::DecomposedSubquestion);
        assert_eq!(variants[2].position, 2);
    }

    #[tokio::test]
    async fn test_coreference_failure_falls_back() {
        let mut llm = ScriptedLlm::new();
        llm.coreference = Err(ServiceError::invalid_request("llm", "bad prompt"));
        let generator = generator(config(false, false), Some(Arc::new(llm)));

        let query = Query::new("What does it cost?").with_history(vec![Turn::user("Milvus")]);
        let variants = generator.generate(&query, &ctx()).await;

        assert_eq!(
            variants,
            vec![QueryVariant::new("What does it cost?", VariantOrigin::Original, 0)]
        );
    }

    #[test]
    fn test_history_window_uses_last_pairs() {
        let history: Vec<Turn> = (0..10).map(|i| Turn::user(format!("turn {}", i))).collect();
        let recent = &history[history.len().saturating_sub(2 * 2)..];
        let prompt = coreference_prompt("q", recent);
        assert!(prompt.contains("turn 6"));
        assert!(!prompt.contains("turn 5"));
    }

    #[test]
    fn test_parse_string_list() {
        assert_eq!(
            parse_string_list(r#"{"queries": ["a", " ", "b"]}"#, "queries"),
            vec!["a", "b"]
        );
        assert_eq!(parse_string_list(r#"{"query": ["x"]}"#, "sub_questions"), vec!["x"]);
        assert!(parse_string_list("not json", "queries").is_empty());
        assert!(parse_string_list(r#"{"queries": []}"#, "queries").is_empty());
    }
}

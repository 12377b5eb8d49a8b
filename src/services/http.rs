//! JSON-over-HTTP clients for remote embedding, rerank and completion services

use super::{CompletionService, EmbeddingService, RerankService, ServiceError};
use crate::config::LlmConfig;
use crate::error::{RagError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const SYSTEM_PROMPT: &str =
    "You rewrite search queries for a document retrieval system. Always answer with a single JSON object.";

fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .build()
        .map_err(|e| RagError::Config(format!("Failed to build HTTP client: {}", e)))
}

fn classify_send_error(service: &str, err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::Timeout {
            service: service.to_string(),
            after_ms: 0,
        }
    } else if err.is_builder() {
        ServiceError::invalid_request(service, err.to_string())
    } else {
        ServiceError::Transport {
            service: service.to_string(),
            message: err.to_string(),
        }
    }
}

async fn post_json<B, R>(
    client: &reqwest::Client,
    service: &str,
    url: &str,
    body: &B,
    bearer: Option<&str>,
) -> std::result::Result<R, ServiceError>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let mut request = client.post(url).json(body);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| classify_send_error(service, e))?;

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(status_error(service, status, message));
    }

    response
        .json::<R>()
        .await
        .map_err(|e| ServiceError::invalid_response(service, e.to_string()))
}

fn status_error(service: &str, status: StatusCode, message: String) -> ServiceError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ServiceError::Status {
            service: service.to_string(),
            status: status.as_u16(),
            message,
        }
    } else {
        ServiceError::invalid_request(service, format!("HTTP {}: {}", status.as_u16(), message))
    }
}

/// Remote embedding endpoint: `{"texts": [...]}` -> `{"data": {"text_vectors": [[...]]}}`
#[derive(Debug, Clone)]
pub struct HttpEmbedding {
    client: reqwest::Client,
    url: String,
    dimension: usize,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: EmbedData,
}

#[derive(Deserialize)]
struct EmbedData {
    text_vectors: Vec<Vec<f32>>,
}

impl HttpEmbedding {
    pub fn new(url: impl Into<String>, dimension: usize) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            url: url.into(),
            dimension,
        })
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbedding {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ServiceError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| ServiceError::invalid_response("embedding", "empty vector list"))
    }

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, ServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response: EmbedResponse = post_json(
            &self.client,
            "embedding",
            &self.url,
            &EmbedRequest { texts },
            None,
        )
        .await?;

        let vectors = response.data.text_vectors;
        if vectors.len() != texts.len() {
            return Err(ServiceError::invalid_response(
                "embedding",
                format!("expected {} vectors, got {}", texts.len(), vectors.len()),
            ));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimension) {
            return Err(ServiceError::invalid_response(
                "embedding",
                format!("expected {}D vectors, got {}D", self.dimension, bad.len()),
            ));
        }

        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Remote cross-encoder: `{"query", "documents"}` -> `{"scores": [...]}`
#[derive(Debug, Clone)]
pub struct HttpReranker {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: &'a [String],
}

#[derive(Deserialize)]
struct RerankResponse {
    scores: Vec<f32>,
}

impl HttpReranker {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RerankService for HttpReranker {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[String],
    ) -> std::result::Result<Vec<f32>, ServiceError> {
        let response: RerankResponse = post_json(
            &self.client,
            "rerank",
            &self.url,
            &RerankRequest {
                query,
                documents: candidates,
            },
            None,
        )
        .await?;
        Ok(response.scores)
    }
}

/// OpenAI-compatible chat completion in JSON mode
#[derive(Debug, Clone)]
pub struct OpenAiCompletion {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatContent,
}

#[derive(Deserialize)]
struct ChatContent {
    content: Option<String>,
}

impl OpenAiCompletion {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        temperature: f32,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature,
        })
    }

    /// Reads the API key from the configured environment variable
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| RagError::MissingParameter(config.api_key_env.clone()))?;
        Self::new(
            &config.base_url,
            api_key,
            &config.model,
            config.temperature,
        )
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    async fn complete(&self, prompt: &str) -> std::result::Result<String, ServiceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response: ChatResponse =
            post_json(&self.client, "llm", &url, &request, Some(&self.api_key)).await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ServiceError::invalid_response("llm", "no completion content"))
    }
}

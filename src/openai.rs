//! Clients for OpenAI-compatible HTTP APIs: `/embeddings` for
//! [`OpenAiEmbedder`] and `/chat/completions` for [`OpenAiChat`].
//!
//! Requests are blocking. Server errors (5xx, 429) and transport failures are
//! retried with exponential backoff; other client errors fail immediately.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    answer::{self, Answer, AnswerGenerator},
    embedding::EmbeddingProvider,
    error::{Error, Result},
    knowledge_base::SearchResult,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4";
pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const API_KEY_ENV_VAR: &str = "OPENAI_API_KEY";

const DEFAULT_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const EXPONENTIAL_BACKOFF_BASE: u32 = 2;
const EMBEDDING_BATCH_SIZE: usize = 96;

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    agent: ureq::Agent,
    retry_attempts: u32,
    backoff: Duration,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            agent: agent_with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            backoff: Duration::from_secs(1),
        }
    }

    /// Client for `base_url` (default: the OpenAI API) with the key taken
    /// from `OPENAI_API_KEY`.
    pub fn from_env(base_url: Option<&str>) -> Self {
        let api_key = std::env::var(API_KEY_ENV_VAR).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!("{API_KEY_ENV_VAR} is not set; requests will be sent without credentials");
        }
        Self::new(base_url.unwrap_or(DEFAULT_BASE_URL), api_key)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = agent_with_timeout(timeout);
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    /// Delay before the first retry; doubles on each further attempt.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST `body` as JSON to `{base_url}/{path}` and return the response
    /// body. Errors are returned as messages for the caller to classify.
    fn post_json<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> std::result::Result<String, String> {
        let url = format!("{}/{path}", self.base_url);
        let json = serde_json::to_string(body).map_err(|e| e.to_string())?;
        let mut last_error = String::new();

        for attempt in 1..=self.retry_attempts {
            debug!(%url, attempt, "HTTP request");

            let mut request = self
                .agent
                .post(url.as_str())
                .header("Content-Type", "application/json");
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {key}"));
            }

            let error = match request
                .send(&json)
                .and_then(|mut resp| resp.body_mut().read_to_string())
            {
                Ok(text) => return Ok(text),
                Err(error) => error,
            };

            let retryable = match &error {
                ureq::Error::StatusCode(status) => *status >= 500 || *status == 429,
                ureq::Error::ConnectionFailed
                | ureq::Error::HostNotFound
                | ureq::Error::Timeout(_)
                | ureq::Error::Io(_) => true,
                _ => false,
            };
            if !retryable {
                return Err(format!("request to {url} failed: {error}"));
            }

            warn!(%url, attempt, attempts = self.retry_attempts, %error, "request failed");
            last_error = format!(
                "request to {url} failed after {attempt} attempts: {error}"
            );

            if attempt < self.retry_attempts {
                std::thread::sleep(
                    self.backoff * EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1),
                );
            }
        }

        Err(last_error)
    }
}

fn agent_with_timeout(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// Embeds text with an OpenAI-compatible `/embeddings` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: OpenAiClient,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(client: OpenAiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = EmbeddingsRequest {
            model: &self.model,
            input: texts,
        };
        let text = self
            .client
            .post_json("embeddings", &body)
            .map_err(Error::Embedding)?;
        let mut response: EmbeddingsResponse = serde_json::from_str(&text)
            .map_err(|e| Error::Embedding(format!("invalid embeddings response: {e}")))?;

        if response.data.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                response.data.len()
            )));
        }
        response.data.sort_by_key(|d| d.index);
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }
}

impl EmbeddingProvider for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.request(&[text.to_string()])?
            .pop()
            .ok_or_else(|| Error::Embedding("empty embeddings response".into()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBEDDING_BATCH_SIZE) {
            vectors.extend(self.request(batch)?);
        }
        Ok(vectors)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Answers questions with an OpenAI-compatible chat model.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    client: OpenAiClient,
    model: String,
    temperature: f32,
}

impl OpenAiChat {
    pub fn new(client: OpenAiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

impl AnswerGenerator for OpenAiChat {
    fn generate(&self, query: &str, passages: &[SearchResult]) -> Result<Answer> {
        if passages.is_empty() {
            return Ok(Answer::no_context());
        }

        let prompt = answer::build_prompt(query, passages);
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: [ChatMessage {
                role: "user",
                content: &prompt,
            }],
        };

        let text = self
            .client
            .post_json("chat/completions", &body)
            .map_err(Error::Generation)?;
        let response: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| Error::Generation(format!("invalid chat response: {e}")))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::Generation("model returned no answer".into()))?;

        debug!(passages = passages.len(), "generated answer");
        Ok(Answer {
            response: content,
            sources: answer::sources(passages),
        })
    }
}

//! OpenAI-compatible HTTP embedding provider.
//!
//! Talks to any endpoint exposing `POST /embeddings` with the OpenAI request
//! shape (OpenAI itself, Ollama, LM Studio, vLLM). Query and batch calls use
//! separate deadlines since a batch of hundreds of chunks legitimately takes
//! longer than an interactive query.

use anyhow::{anyhow, Context};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{EmbedError, EmbeddingProvider};
use crate::config::EmbeddingConfig;

pub struct HttpEmbeddingProvider {
    id: String,
    model: String,
    base_url: String,
    api_key: Option<String>,
    client: Client,
    query_timeout: Duration,
    batch_timeout: Duration,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn from_config(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        // Local endpoints run keyless; a missing env var only matters if the
        // server then rejects the request.
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        let client = Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            id: config.provider.clone(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
            query_timeout: Duration::from_secs(config.query_timeout_secs),
            batch_timeout: Duration::from_secs(config.batch_timeout_secs),
        })
    }

    fn request(
        &self,
        inputs: &[String],
        timeout: Duration,
        batch: bool,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let url = format!("{}/embeddings", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&serde_json::json!({ "model": self.model, "input": inputs }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().map_err(|err| {
            if err.is_timeout() {
                EmbedError::Timeout { attempts: 1 }
            } else {
                EmbedError::Provider(anyhow!(err).context(format!("embedding request to {url} failed")))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            // Array-input rejections come back as client errors; treating them
            // as systemic lets the breaker switch to per-item requests.
            if batch
                && (status == StatusCode::BAD_REQUEST
                    || status == StatusCode::PAYLOAD_TOO_LARGE
                    || status == StatusCode::UNPROCESSABLE_ENTITY)
            {
                return Err(EmbedError::BatchUnsupported(format!("{status}: {body}")));
            }
            return Err(EmbedError::Provider(anyhow!(
                "embedding request failed with {status}: {body}"
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .map_err(|err| EmbedError::Provider(anyhow!(err).context("invalid embeddings response")))?;
        if parsed.data.len() != inputs.len() {
            return Err(EmbedError::Provider(anyhow!(
                "provider returned {} embeddings for {} inputs",
                parsed.data.len(),
                inputs.len()
            )));
        }

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        debug!(count = data.len(), model = %self.model, "embedded texts");
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut vectors = self.request(&[text.to_string()], self.query_timeout, false)?;
        vectors
            .pop()
            .ok_or_else(|| EmbedError::Provider(anyhow!("provider returned no embedding")))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts, self.batch_timeout, true)
    }
}

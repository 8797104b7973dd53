//! Embedding providers and the surrounding pipeline.
//!
//! [`EmbeddingProvider`] is the seam between the index and whatever produces
//! vectors; [`batch::BatchManager`] wraps provider calls with retry and a
//! circuit breaker; [`cache`] persists vectors by content hash so unchanged
//! text never goes back over the network.

pub mod batch;
pub mod cache;
pub mod http;

use thiserror::Error;

/// Provider failures, classified by how the pipeline should react.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// Transient: the request deadline elapsed. Retried once before escalating.
    #[error("embedding request timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },
    /// Systemic: the provider rejects batched input. Trips the circuit breaker
    /// straight to its limit; per-item requests still work.
    #[error("provider does not support batch embedding: {0}")]
    BatchUnsupported(String),
    /// Everything else.
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

/// A source of embedding vectors.
pub trait EmbeddingProvider: Send + Sync {
    /// Stable provider id, part of the cache key (e.g. `"openai"`).
    fn id(&self) -> &str;
    fn model(&self) -> &str;
    /// Embed one query string with the interactive timeout.
    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
    /// Embed many texts in one request, same order out as in.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Cache-scoping key derived from provider identity. Credentials are excluded
/// so rotating an API key does not invalidate cached vectors.
pub fn provider_key(provider_id: &str, base_url: &str, model: &str) -> String {
    let digest = crate::chunker::sha256_hex(&format!("{provider_id}\n{base_url}\n{model}"));
    digest[..16].to_string()
}

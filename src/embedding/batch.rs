//! Circuit breaker around batch embedding calls.
//!
//! Batching is an optimization, not a requirement: when a provider times out
//! repeatedly or rejects array input, the manager disables batching for the
//! rest of the process and every caller falls back to per-item requests. A
//! sync therefore degrades in speed, never in correctness.

use std::ops::Range;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::EmbedError;
use crate::chunker::estimate_tokens;

#[derive(Debug)]
struct BatchState {
    enabled: bool,
    failure_count: u32,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct BatchManager {
    failure_limit: u32,
    state: Mutex<BatchState>,
}

impl BatchManager {
    pub fn new(enabled: bool, failure_limit: u32) -> Self {
        Self {
            failure_limit: failure_limit.max(1),
            state: Mutex::new(BatchState {
                enabled,
                failure_count: 0,
                last_error: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Run `op`, retrying exactly once and only on a timeout. The returned
    /// timeout error carries the total attempt count.
    pub fn run_with_timeout_retry<T>(
        &self,
        op: &dyn Fn() -> Result<T, EmbedError>,
    ) -> Result<T, EmbedError> {
        match op() {
            Err(EmbedError::Timeout { .. }) => {
                debug!("batch embedding timed out, retrying once");
                match op() {
                    Err(EmbedError::Timeout { .. }) => Err(EmbedError::Timeout { attempts: 2 }),
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Run `batch_op` under the breaker, falling back to `fallback` when
    /// batching is disabled or the batch attempt fails.
    ///
    /// A batch success resets the failure count. A failure adds its attempt
    /// count (a `BatchUnsupported` jumps straight to the limit); reaching the
    /// limit disables batching for the remainder of the process.
    pub fn run_with_fallback<T>(
        &self,
        batch_op: &dyn Fn() -> Result<T, EmbedError>,
        fallback: impl FnOnce() -> Result<T, EmbedError>,
    ) -> Result<T, EmbedError> {
        if !self.is_enabled() {
            return fallback();
        }
        match self.run_with_timeout_retry(batch_op) {
            Ok(value) => {
                self.lock().failure_count = 0;
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&err);
                fallback()
            }
        }
    }

    fn record_failure(&self, err: &EmbedError) {
        let mut state = self.lock();
        let added = match err {
            EmbedError::Timeout { attempts } => *attempts,
            EmbedError::BatchUnsupported(_) => self.failure_limit,
            EmbedError::Provider(_) => 1,
        };
        state.failure_count = (state.failure_count + added).min(self.failure_limit);
        state.last_error = Some(err.to_string());
        if state.enabled && state.failure_count >= self.failure_limit {
            state.enabled = false;
            warn!(
                failures = state.failure_count,
                error = %err,
                "disabling batch embedding, falling back to per-item requests"
            );
        } else {
            debug!(failures = state.failure_count, error = %err, "batch embedding failed");
        }
    }
}

/// Plan token-bounded request batches over `texts`, returning index ranges.
/// Every text lands in exactly one batch; a single text over the budget gets a
/// batch of its own.
pub fn plan_batches(texts: &[String], max_tokens: usize) -> Vec<Range<usize>> {
    let max_tokens = max_tokens.max(1);
    let mut batches = Vec::new();
    let mut start = 0usize;
    let mut tokens = 0usize;
    for (i, text) in texts.iter().enumerate() {
        let cost = estimate_tokens(text);
        if i > start && tokens + cost > max_tokens {
            batches.push(start..i);
            start = i;
            tokens = 0;
        }
        tokens += cost;
    }
    if start < texts.len() {
        batches.push(start..texts.len());
    }
    batches
}

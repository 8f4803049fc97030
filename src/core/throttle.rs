//! Rate-limited access to the summarization service.
//!
//! The caller owns the retry budget: rate limits back off
//! exponentially, transient failures retry after a short fixed delay,
//! and non-retryable failures surface immediately. Responses are cached
//! by request fingerprint so reruns and retried batches do not repeat
//! paid calls.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::adapters::{CallError, SummarizeRequest, Summarizer};
use crate::domain::Summary;

use super::cache::ResponseCache;

/// Retry policy for summarization calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff after a rate limit, in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Cap on the rate-limit backoff, in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each rate limit)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Fixed delay after a transient failure, in milliseconds
    #[serde(default = "default_transient_delay")]
    pub transient_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    5000
}
fn default_max_delay() -> u64 {
    60000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_transient_delay() -> u64 {
    2000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            transient_delay_ms: default_transient_delay(),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    pub fn transient_delay(&self) -> Duration {
        Duration::from_millis(self.transient_delay_ms)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Cache-fronted, retrying wrapper around a summarizer
pub struct RateLimitedCaller {
    service: Arc<dyn Summarizer>,
    cache: ResponseCache,
    policy: RetryPolicy,
}

impl RateLimitedCaller {
    pub fn new(service: Arc<dyn Summarizer>, cache: ResponseCache, policy: RetryPolicy) -> Self {
        Self {
            service,
            cache,
            policy,
        }
    }

    /// One logical summarization, however many attempts that takes
    #[instrument(skip(self, request), fields(service = self.service.name()))]
    pub async fn call(&self, request: &SummarizeRequest) -> Result<Summary, CallError> {
        let fingerprint = request.fingerprint();
        if let Some(cached) = self.cache.fetch(&fingerprint).await {
            debug!(%fingerprint, "Summary served from cache");
            return Ok(cached);
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.service.summarize(request).await {
                Ok(summary) => {
                    self.cache.store(&fingerprint, &summary).await;
                    return Ok(summary);
                }
                Err(CallError::RateLimited) => {
                    if !self.policy.should_retry(attempt) {
                        warn!(attempt, "Rate-limit retries exhausted");
                        return Err(CallError::RetriesExhausted);
                    }
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    sleep(delay).await;
                }
                Err(CallError::Transient(reason)) => {
                    if !self.policy.should_retry(attempt) {
                        warn!(attempt, %reason, "Transient-failure retries exhausted");
                        return Err(CallError::RetriesExhausted);
                    }
                    let delay = self.policy.transient_delay();
                    warn!(
                        attempt,
                        %reason,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, retrying"
                    );
                    sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

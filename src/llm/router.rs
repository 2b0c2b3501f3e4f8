//! Provider invocation with retries, deadlines and cancellation.
//!
//! The router owns the retry policy so adapters stay thin: transient
//! failures (*ModelUnavailable*) back off exponentially within the overall
//! budget; provider rejections and unsupported providers fail immediately.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AskError, Result};
use crate::llm::{Message, ModelProfile, ProviderRegistry};

/// Base delay for exponential backoff.
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Ceiling for a single backoff sleep.
const RETRY_MAX_DELAY_SECS: u64 = 8;

/// Retry and deadline settings for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct RouterOptions {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Deadline per attempt.
    pub attempt_timeout: Duration,
    /// Deadline across all attempts and backoffs.
    pub overall_timeout: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            attempt_timeout: Duration::from_secs(30),
            overall_timeout: Duration::from_secs(60),
        }
    }
}

/// Outcome of a successful invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Raw model text.
    pub text: String,
    /// Tokens billed, when reported.
    pub tokens_used: Option<u32>,
    /// Wall time across all attempts.
    pub latency: Duration,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Routes invocations to the registered provider adapters.
pub struct LlmRouter {
    registry: ProviderRegistry,
}

impl LlmRouter {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Invokes the profile's provider with the policy in `options`.
    pub async fn invoke(
        &self,
        profile: &ModelProfile,
        messages: &[Message],
        options: RouterOptions,
        cancel: &CancellationToken,
    ) -> Result<Invocation> {
        let client = self.registry.create(profile)?;
        let started = Instant::now();
        let deadline = started + options.overall_timeout;

        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
        let mut last_error: Option<AskError> = None;

        for attempt in 1..=options.max_retries.saturating_add(1) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            debug!(
                provider = %profile.provider,
                model = %profile.model,
                attempt,
                "Invoking model"
            );

            let attempt_budget = options.attempt_timeout.min(remaining);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(AskError::Cancelled),
                result = tokio::time::timeout(attempt_budget, client.complete(messages)) => {
                    match result {
                        Ok(r) => r,
                        Err(_) => Err(AskError::ModelUnavailable(format!(
                            "attempt timed out after {}s",
                            attempt_budget.as_secs()
                        ))),
                    }
                }
            };

            match outcome {
                Ok(completion) => {
                    return Ok(Invocation {
                        text: completion.text,
                        tokens_used: completion.tokens_used,
                        latency: started.elapsed(),
                        attempts: attempt,
                    });
                }
                Err(e @ (AskError::ModelRejected(_) | AskError::ModelUnsupported(_))) => {
                    return Err(e);
                }
                Err(AskError::Cancelled) => return Err(AskError::Cancelled),
                Err(e) => {
                    warn!(
                        provider = %profile.provider,
                        attempt,
                        error = %e,
                        "Model attempt failed"
                    );
                    last_error = Some(e);
                }
            }

            // Back off, but never past the overall deadline or a cancel.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let sleep = delay.min(remaining);
            tokio::select! {
                _ = cancel.cancelled() => return Err(AskError::Cancelled),
                _ = tokio::time::sleep(sleep) => {}
            }
            delay = (delay * 2).min(Duration::from_secs(RETRY_MAX_DELAY_SECS));
        }

        Err(AskError::ModelUnavailable(format!(
            "retries exhausted: {}",
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "overall deadline elapsed".to_string())
        )))
    }
}

//! Deadline and retry policy around a single provider call.
//!
//! Each attempt runs on its own thread and races a `recv_timeout` of the
//! provider's deadline. When the deadline wins, the attempt thread is
//! detached: blocking HTTP calls cannot be interrupted, and the client's own
//! timeout eventually reaps it. Failures are classified once, and only
//! `Transient`, `RateLimited` and `Timeout` are retried.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use imagegate_contracts::classify::{classify, timeout_error};
use imagegate_contracts::errors::{ClassifiedError, RawProviderError};
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random fraction added on top of each delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter_ratio: 0.3,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// `min(max_delay, initial_delay * 2^(attempt - 1))`, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay to sleep after failed attempt `attempt`. A rate-limit hint
    /// raises the base delay, still capped at `max_delay`.
    pub fn delay_for<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        error: &ClassifiedError,
        rng: &mut R,
    ) -> Duration {
        let mut base = self.base_delay(attempt);
        if let Some(hint) = error.retry_after {
            base = base.max(hint).min(self.max_delay);
        }
        let ratio = if self.jitter_ratio > 0.0 {
            rng.gen_range(0.0..self.jitter_ratio)
        } else {
            0.0
        };
        base + base.mul_f64(ratio)
    }
}

/// One call to a provider. Built fresh for every try, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationAttempt {
    pub prompt: String,
    pub provider_id: String,
    pub deadline: Duration,
    /// 1-based.
    pub attempt_number: u32,
}

/// Emitted once per scheduled retry, before the backoff sleep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryNotice {
    pub provider_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: ClassifiedError,
}

impl RetryNotice {
    pub fn message(&self) -> String {
        format!(
            "Attempt {}/{} failed: {} Retrying in {:.1}s.",
            self.attempt,
            self.max_attempts,
            self.error.user_message,
            self.delay.as_secs_f64()
        )
    }
}

enum AttemptFailure {
    Provider(RawProviderError),
    DeadlineExceeded,
    Crashed(String),
}

#[derive(Debug, Clone)]
pub struct ResilienceWrapper {
    policy: RetryPolicy,
    operation: String,
}

impl ResilienceWrapper {
    /// `operation` completes phrases like "Network timeout while {operation}".
    pub fn new(policy: RetryPolicy, operation: impl Into<String>) -> Self {
        Self {
            policy,
            operation: operation.into(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_retries + 1` attempts are spent. `on_retry` sees every retry
    /// decision before the backoff sleep starts.
    pub fn execute<T, F>(
        &self,
        prompt: &str,
        provider_id: &str,
        deadline: Duration,
        operation: F,
        on_retry: &mut dyn FnMut(&RetryNotice),
    ) -> Result<T, ClassifiedError>
    where
        T: Send + 'static,
        F: Fn(GenerationAttempt) -> Result<T, RawProviderError> + Send + Sync + 'static,
    {
        let operation = Arc::new(operation);
        let max_attempts = self.policy.max_attempts();
        let mut rng = rand::thread_rng();
        let mut attempt_number = 1;

        loop {
            let attempt = GenerationAttempt {
                prompt: prompt.to_string(),
                provider_id: provider_id.to_string(),
                deadline,
                attempt_number,
            };
            let error = match run_with_deadline(Arc::clone(&operation), attempt) {
                Ok(value) => return Ok(value),
                Err(AttemptFailure::Provider(raw)) => classify(&raw, &self.operation),
                Err(AttemptFailure::DeadlineExceeded) => {
                    timeout_error(provider_id, deadline, &self.operation)
                }
                Err(AttemptFailure::Crashed(detail)) => ClassifiedError::unknown(format!(
                    "The {provider_id} adapter stopped unexpectedly while {}.",
                    self.operation
                ))
                .with_detail(detail)
                .with_provider(provider_id),
            };

            if !error.is_retryable() || attempt_number >= max_attempts {
                return Err(error);
            }

            let delay = self.policy.delay_for(attempt_number, &error, &mut rng);
            on_retry(&RetryNotice {
                provider_id: provider_id.to_string(),
                attempt: attempt_number,
                max_attempts,
                delay,
                error,
            });
            thread::sleep(delay);
            attempt_number += 1;
        }
    }
}

fn run_with_deadline<T, F>(
    operation: Arc<F>,
    attempt: GenerationAttempt,
) -> Result<T, AttemptFailure>
where
    T: Send + 'static,
    F: Fn(GenerationAttempt) -> Result<T, RawProviderError> + Send + Sync + 'static,
{
    let deadline = attempt.deadline;
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("imagegate-attempt-{}", attempt.attempt_number))
        .spawn(move || {
            let outcome = (*operation)(attempt);
            // The receiver is gone once the deadline has fired.
            let _ = tx.send(outcome);
        });
    if let Err(err) = spawned {
        return Err(AttemptFailure::Crashed(format!(
            "failed to start attempt thread: {err}"
        )));
    }

    match rx.recv_timeout(deadline) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(raw)) => Err(AttemptFailure::Provider(raw)),
        Err(RecvTimeoutError::Timeout) => Err(AttemptFailure::DeadlineExceeded),
        Err(RecvTimeoutError::Disconnected) => Err(AttemptFailure::Crashed(
            "attempt thread exited without a result".to_string(),
        )),
    }
}

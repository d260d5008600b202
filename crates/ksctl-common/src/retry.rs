//! Bounded retries with exponential backoff
//!
//! Every policy has a finite attempt budget. A predicate decides which
//! errors deserve another attempt, so fatal failures such as a host key
//! mismatch surface on the first try.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Attempt budget and pacing of one retried operation
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, the first one included; at least one is always made
    pub max_attempts: u32,
    /// Pause after the first failure
    pub initial_delay: Duration,
    /// Upper bound of any pause
    pub max_delay: Duration,
    /// Growth of the pause after each failure
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Dialing a freshly booted VM: 5s doubling, six attempts
    pub fn ssh_dial() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(160),
            backoff_multiplier: 2.0,
        }
    }

    /// Transient channel faults inside one script attempt: flat 5s, five tries
    pub fn ssh_transient() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 1.0,
        }
    }

    /// Millisecond pauses for tests and local harnesses
    pub fn immediate(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 1.0,
        }
    }

    /// Pause before attempt `failed + 1`, without jitter
    pub fn delay_after(&self, failed: u32) -> Duration {
        let exp = failed.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or the attempt budget is spent
///
/// Pauses are jittered to 0.5x..1.5x of [`RetryConfig::delay_after`].
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let budget = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_retryable(&err) {
            debug!(operation = %operation_name, attempt, error = %err, "not retryable");
            return Err(err);
        }
        if attempt >= budget {
            warn!(operation = %operation_name, attempt, error = %err, "attempts exhausted");
            return Err(err);
        }

        let pause = config
            .delay_after(attempt)
            .mul_f64(rand::thread_rng().gen_range(0.5..1.5));
        warn!(
            operation = %operation_name,
            attempt,
            budget,
            error = %err,
            pause_ms = pause.as_millis() as u64,
            "retrying"
        );
        tokio::time::sleep(pause).await;
    }
}

/// Uniformly random pause in `[min, max)`, used between script attempts
pub fn jittered_pause(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let secs = rand::thread_rng().gen_range(min.as_secs_f64()..max.as_secs_f64());
    Duration::from_secs_f64(secs)
}

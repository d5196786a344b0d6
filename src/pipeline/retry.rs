use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::StageError;
use crate::clients::ClientError;
use crate::report::RunContext;
use crate::runner::RunnerError;

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never less than 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(8_000),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the delay after failed attempt `attempt` (1-based).
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }

    /// Jittered delay in `[ceiling / 2, ceiling]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        Duration::from_millis(millis)
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable: Display {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ClientError {
    fn is_retryable(&self) -> bool {
        ClientError::is_retryable(self)
    }
}

impl Retryable for RunnerError {
    fn is_retryable(&self) -> bool {
        RunnerError::is_retryable(self)
    }
}

/// Run `op` under `policy`, logging every failed attempt into `ctx`.
///
/// A non-retryable error stops immediately with [`StageError::Fatal`];
/// running out of attempts yields [`StageError::Transient`]. When
/// `attempt_timeout` is set, an attempt that exceeds it counts as a
/// retryable failure.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    ctx: &mut RunContext,
    what: &str,
    attempt_timeout: Option<Duration>,
    mut op: F,
) -> Result<T, StageError>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let failure = match attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_retryable() => {
                    return Err(StageError::Fatal(format!("{what}: {e}")));
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}s", limit.as_secs()),
            },
            None => match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => {
                    return Err(StageError::Fatal(format!("{what}: {e}")));
                }
                Err(e) => e.to_string(),
            },
        };

        if attempt >= max_attempts {
            ctx.error(format!("{what} attempt {attempt}/{max_attempts} failed: {failure}"));
            return Err(StageError::Transient(format!(
                "{what} failed after {attempt} attempts: {failure}"
            )));
        }

        let delay = policy.delay_for(attempt);
        ctx.warn(format!(
            "{what} attempt {attempt}/{max_attempts} failed: {failure}; retrying in {}ms",
            delay.as_millis()
        ));
        tokio::time::sleep(delay).await;
    }
}

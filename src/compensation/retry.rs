use crate::error::AppResult;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff around one candidate's whole pipeline run.
///
/// Only retryable (transient) errors re-enter the loop; permanent faults and
/// business rejections surface immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Symmetric jitter fraction applied to each backoff (0.3 = +/-30%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given retry (1-based): base * 2^(attempt - 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Apply jitter given a unit random sample in [0, 1).
    pub fn jittered(&self, delay: Duration, unit_sample: f64) -> Duration {
        let factor = 1.0 + self.jitter * (unit_sample * 2.0 - 1.0);
        delay.mul_f64(factor.max(0.0))
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.jittered(self.backoff(attempt), rand::rng().random());
                    warn!("attempt {attempt} failed, retrying in {delay:?}: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

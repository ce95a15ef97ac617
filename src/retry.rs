//! Bounded retry with exponential backoff around a single attempt.
//!
//! `run` makes up to `max_attempts` attempts, sleeping `base * 2^k` (capped)
//! after the k-th failure, and reports the last error once exhausted. It
//! knows nothing about the circuit breaker — the façade records only the
//! terminal outcome there.

use std::future::Future;
use tracing::{debug, warn};

use crate::config::RetryPolicy;

/// Terminal failure after all attempts were used up.
#[derive(Debug, thiserror::Error)]
#[error("exhausted {attempts} attempt(s): {source}")]
pub struct RetryError {
    /// Attempts actually made.
    pub attempts: u32,
    /// The last attempt's error.
    #[source]
    pub source: anyhow::Error,
}

/// Run `attempt` until it succeeds or the policy's attempt budget is spent.
///
/// Returns the value and the number of attempts made. The invoked function
/// must be safe to call more than once (idempotent or side-effect free on
/// failure).
pub async fn run<T, F, Fut>(policy: &RetryPolicy, attempt: F) -> Result<(T, u32), RetryError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error: Option<anyhow::Error> = None;

    for n in 0..max_attempts {
        match attempt().await {
            Ok(value) => {
                if n > 0 {
                    debug!(attempt = n + 1, "attempt succeeded after retries");
                }
                return Ok((value, n + 1));
            }
            Err(e) => {
                if n + 1 < max_attempts {
                    let delay = policy.delay_for_attempt(n);
                    warn!(
                        attempt = n + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, backing off"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                } else {
                    last_error = Some(e);
                }
            }
        }
    }

    Err(RetryError {
        attempts: max_attempts,
        // max_attempts >= 1, so at least one attempt ran and errored.
        source: last_error.unwrap_or_else(|| anyhow::anyhow!("no attempt was made")),
    })
}

/// Bounded retry for storage operations
///
/// Only transient persistence errors are retried; every other error is
/// returned from the first attempt. The closure is re-invoked from scratch on
/// each attempt, so a transactional operation is always retried as a whole.

use crate::config::RetryConfig;
use crate::error::Result;
use std::future::Future;

/// Run `attempt_fn` up to `policy.max_attempts` times with exponential backoff
pub async fn with_retry<T, F, Fut>(policy: &RetryConfig, operation: &str, mut attempt_fn: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff_for(attempt);
                tracing::warn!(
                    "🔁 {} failed transiently (attempt {}/{}), retrying in {:?}: {}",
                    operation,
                    attempt,
                    max_attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::error!("❌ {} gave up after {} attempts: {}", operation, attempt, e);
                }
                return Err(e);
            }
        }
    }
}

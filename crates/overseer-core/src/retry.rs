// Retry with exponential back-off for transient I/O.

use std::future::Future;
use std::time::Duration;

use crate::error::{OverseerError, Result};

/// Attempts beyond the first; 100ms -> 400ms -> 1.6s.
const BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(400),
    Duration::from_millis(1600),
];

/// Run `op`, retrying transient failures up to three times with exponential
/// back-off. Non-transient errors propagate immediately.
pub async fn retry_transient<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last: Option<OverseerError> = None;
    for (attempt, delay) in std::iter::once(Duration::ZERO)
        .chain(BACKOFF.iter().copied())
        .enumerate()
    {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                tracing::warn!(attempt, error = %err, "transient failure, retrying");
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| OverseerError::Fatal("retry exhausted with no error".to_string())))
}

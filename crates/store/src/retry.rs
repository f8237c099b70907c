//! Retry helper for transient store failures.

use crate::error::{StoreError, StoreResult};
use std::future::Future;
use std::time::Duration;

/// Total attempts for a retried operation.
pub const RETRY_ATTEMPTS: u32 = 3;

/// First backoff delay; doubles per attempt up to [`RETRY_MAX_DELAY`].
pub const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(100);
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(1);

/// Run `f` up to [`RETRY_ATTEMPTS`] times with exponential backoff, retrying
/// only errors classified transient by [`StoreError::is_transient`].
pub async fn with_retry<T, F, Fut>(op_name: &str, f: F) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut delay = RETRY_INITIAL_DELAY;
    let mut last_err: Option<StoreError> = None;

    for attempt in 0..RETRY_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(RETRY_MAX_DELAY);
        }
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < RETRY_ATTEMPTS => {
                tracing::warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    error = %e,
                    "transient store error, retrying"
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.expect("retry loop exited without an error"))
}

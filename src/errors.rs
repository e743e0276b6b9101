//! Typed provider errors and the bounded-retry helper.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Errors surfaced by the provider adapter.
///
/// `AlreadyExists` lets `create_launch_template` be handled with a `match`
/// instead of string-matching an error message.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("resource already exists")]
    AlreadyExists,

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Bounded exponential-backoff retry: 3 attempts, doubling backoff (1s,
/// 2s, then give up), used for every cloud-facing provider call.
pub async fn with_retries<T, F, Fut>(op_name: &str, mut f: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                warn!(op = op_name, attempt, error = %e, "retrying after transient error");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

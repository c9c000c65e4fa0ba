use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::observability::RETRIES_TOTAL;

use super::EngineError;

const FIRST_DELAY: Duration = Duration::from_millis(1);
const MAX_DELAY: Duration = Duration::from_millis(50);

/// Run `op` up to `attempts` times (at least once), starting over after
/// each [`EngineError::SerializationRetry`] with a doubling delay. Any other
/// outcome is returned as is.
///
/// ```ignore
/// let id = retry_serializable(5, || engine.create_registration(member, session)).await?;
/// ```
pub async fn retry_serializable<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let attempts = attempts.max(1);
    let mut delay = FIRST_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < attempts => {
                metrics::counter!(RETRIES_TOTAL).increment(1);
                debug!("serialization conflict, attempt {attempt}/{attempts}; retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use ulid::Ulid;

    use super::*;

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_serializable(5, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(EngineError::SerializationRetry)
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_serializable(3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::SerializationRetry)
        })
        .await;
        assert!(matches!(result, Err(EngineError::SerializationRetry)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let missing = Ulid::new();
        let result: Result<(), _> = retry_serializable(10, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::NotFound(missing))
        })
        .await;
        assert!(matches!(result, Err(EngineError::NotFound(id)) if id == missing));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let result = retry_serializable(0, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, EngineError>(())
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

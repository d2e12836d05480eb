//! Timeout combinators for external calls.
//!
//! A hung collaborator (fingerprint agent, IP service, store) must never
//! block the client. Reads and lookups that outlive their deadline are
//! dropped. Writes run on their own task and keep going after the caller
//! has given up on them, so a late write still lands (or fails) quietly.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::store::StoreError;

/// Await `fut` for at most `limit`, resolving to `fallback()` on expiry.
pub async fn with_timeout<F, T>(
    label: &'static str,
    limit: Duration,
    fut: F,
    fallback: impl FnOnce() -> T,
) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(value) => value,
        Err(_) => {
            debug!(operation = label, limit_ms = limit.as_millis() as u64, "Timed out, using fallback");
            fallback()
        }
    }
}

/// Await a store call for at most `limit`, failing with
/// [`StoreError::Timeout`] on expiry.
pub async fn store_timeout<F, T>(label: &'static str, limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    with_timeout(label, limit, fut, || Err(StoreError::Timeout)).await
}

/// Run a write on its own task and wait at most `limit` for its result.
///
/// On expiry the caller gets [`StoreError::Timeout`] while the write carries
/// on in the background; its eventual outcome is only logged.
pub async fn write_timeout<F, T, E>(label: &'static str, limit: Duration, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<StoreError> + Display + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = fut.await;
        // The receiver is gone once the caller timed out.
        if let Err(late) = tx.send(result) {
            match late {
                Ok(_) => debug!(operation = label, "Write completed after timeout"),
                Err(e) => debug!(operation = label, error = %e, "Write failed after timeout"),
            }
        }
    });

    match tokio::time::timeout(limit, rx).await {
        Ok(Ok(result)) => result,
        // The write task panicked.
        Ok(Err(_)) => Err(StoreError::Unavailable.into()),
        Err(_) => {
            debug!(operation = label, limit_ms = limit.as_millis() as u64, "Write timed out, continuing in background");
            Err(StoreError::Timeout.into())
        }
    }
}

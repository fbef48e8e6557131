//! Bounded retry for catalog transactions.
//!
//! The embedded store reports contention as SQLITE_BUSY / "database is
//! locked". Business code never loops on that itself; it wraps the
//! transaction in [`with_retry`] and gets either the result or a
//! `StorageError::Transient` once the bound is exhausted.

use crate::storage::StorageError;
use std::future::Future;
use std::time::Duration;

pub const MAX_RETRIES: u32 = 100;
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Whether the error is store contention worth retrying.
pub fn is_retriable(err: &anyhow::Error) -> bool {
    let Some(sqlx_err) = err.downcast_ref::<sqlx::Error>() else {
        return false;
    };
    match sqlx_err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_lowercase();
            message.contains("database is locked") || message.contains("database is busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Runs `op`, retrying retriable failures up to [`MAX_RETRIES`] times with
/// [`RETRY_DELAY`] between attempts. Non-retriable errors pass through
/// immediately.
pub async fn with_retry<T, Fut>(mut op: impl FnMut() -> Fut) -> Result<T, StorageError>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_retriable(&err) => {
                attempt += 1;
                if attempt > MAX_RETRIES {
                    return Err(StorageError::Transient(err.to_string()));
                }
                log::debug!("Catalog busy (attempt {}), retrying: {}", attempt, err);
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(err) => return Err(StorageError::Database(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn non_retriable_errors_pass_through() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("boom")) }
        })
        .await;

        assert!(matches!(result, Err(StorageError::Database(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_is_returned_as_is() {
        let result = with_retry(|| async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);
    }
}

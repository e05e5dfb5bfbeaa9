//! Bounded retry helper shared by the source adapters (spec §4.1: "a
//! failed poll retries with a fixed backoff up to `max_retries`, then
//! logs at `error!` and returns the last-known-good value to the
//! caller rather than propagating").
use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

/// Retry `op` up to `max_retries` times (so `max_retries + 1` attempts in
/// total), sleeping `delay` between attempts. Every failed attempt but the
/// last logs at `warn!`; the final failure logs at `error!` and is returned
/// to the caller, who is expected to fall back to a stale or sentinel
/// value rather than fail the whole loop.
pub async fn retry_with_backoff<T, E, F, Fut>(label: &str, max_retries: u32, delay: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_retries {
                    error!(target: "adapters::retry", %label, attempt, "giving up after {} attempts: {e}", attempt + 1);
                    return Err(e);
                }
                warn!(target: "adapters::retry", %label, attempt, "attempt failed, retrying: {e}");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_ok() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_with_backoff("test", 3, Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_with_backoff("test", 3, Duration::from_millis(1), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("transient")
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_with_backoff("test", 2, Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("permanent")
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

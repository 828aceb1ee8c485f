//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap external calls with a deadline
//! - Cancel operations cleanly on timeout
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities; the inner future is dropped on expiry
//! - Timeout errors are distinct from other errors and count as transient

use std::future::Future;
use std::time::Duration;

/// Run `fut` under an optional deadline.
///
/// `Err(limit)` reports the deadline that elapsed.
pub async fn with_deadline<F>(limit: Option<Duration>, fut: F) -> Result<F::Output, Duration>
where
    F: Future,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| limit),
        None => Ok(fut.await),
    }
}

/// Convert an optional millisecond setting into a deadline.
pub fn deadline_from_ms(ms: Option<u64>) -> Option<Duration> {
    ms.filter(|ms| *ms > 0).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_elapses() {
        let res = with_deadline(Some(Duration::from_millis(50)), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            7
        })
        .await;
        assert_eq!(res, Err(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_no_deadline() {
        let res = with_deadline(None, async { 7 }).await;
        assert_eq!(res, Ok(7));
    }

    #[test]
    fn test_zero_means_disabled() {
        assert_eq!(deadline_from_ms(Some(0)), None);
        assert_eq!(deadline_from_ms(Some(5)), Some(Duration::from_millis(5)));
    }
}

//! Exponential backoff with jitter.

use std::time::Duration;
use rand::Rng;

/// Delay policy between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Retry immediately.
    None,
    Fixed(Duration),
    /// `base * 2^(n-1)` capped at `max`, plus up to `jitter_ratio` of the delay.
    Exponential {
        base: Duration,
        max: Duration,
        jitter_ratio: f64,
    },
}

impl Backoff {
    /// Exponential backoff with the default 10% jitter.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max, jitter_ratio: 0.1 }
    }

    /// Delay before retry number `attempt` (1 = first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { base, max, jitter_ratio } => calculate_backoff(
                attempt,
                base.as_millis() as u64,
                max.as_millis() as u64,
                *jitter_ratio,
            ),
        }
    }
}

/// Calculate exponential backoff delay with jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64, jitter_ratio: f64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    // Jitter spreads retries from many callers that failed together.
    let jitter_range = (capped_delay as f64 * jitter_ratio.clamp(0.0, 1.0)) as u64;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let b1 = calculate_backoff(1, 100, 2000, 0.1);
        assert!(b1.as_millis() >= 100);
        assert!(b1.as_millis() < 110);

        let b2 = calculate_backoff(2, 100, 2000, 0.1);
        assert!(b2.as_millis() >= 200);

        let max = calculate_backoff(10, 100, 1000, 0.1);
        assert!(max.as_millis() >= 1000);
        assert!(max.as_millis() < 1100);
    }

    #[test]
    fn test_no_jitter_is_exact() {
        assert_eq!(calculate_backoff(3, 50, 10_000, 0.0), Duration::from_millis(200));
    }

    #[test]
    fn test_large_attempt_saturates() {
        let d = calculate_backoff(200, 100, 5000, 0.0);
        assert_eq!(d, Duration::from_millis(5000));
    }

    #[test]
    fn test_policies() {
        assert_eq!(Backoff::None.delay(3), Duration::ZERO);
        assert_eq!(Backoff::Fixed(Duration::from_millis(7)).delay(9), Duration::from_millis(7));
        let exp = Backoff::exponential(Duration::from_millis(10), Duration::from_secs(1));
        assert!(exp.delay(2) >= Duration::from_millis(20));
    }
}

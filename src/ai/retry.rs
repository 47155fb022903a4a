//! Exponential backoff for transient AI failures.

use std::time::Duration;

/// Markers in stderr that identify a transient, retry-worthy failure.
const TRANSIENT_MARKERS: &[&str] = &["rate limit", "429", "too many requests", "overloaded"];

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub multiplier: u64,
    pub jitter_ms: u64,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 8_000,
            multiplier: 2,
            jitter_ms: 500,
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based): capped exponential
    /// plus additive uniform jitter in [0, jitter_ms].
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_ms
            .saturating_mul(self.multiplier.saturating_pow(attempt))
            .min(self.cap_ms);
        Duration::from_millis(exp + jitter(self.jitter_ms))
    }
}

/// Workers only need de-synchronization, not statistical rigor: sub-second
/// clock nanos spread retries well enough without pulling in an RNG crate.
fn jitter(window_ms: u64) -> u64 {
    if window_ms == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    nanos % (window_ms + 1)
}

/// Whether a failed call should be retried, judged from the child's stderr.
pub fn is_transient(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let policy = BackoffPolicy {
            jitter_ms: 0,
            ..Default::default()
        };
        assert_eq!(policy.delay(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay(3), Duration::from_millis(8_000));
        assert_eq!(policy.delay(10), Duration::from_millis(8_000));
    }

    #[test]
    fn jitter_stays_in_window() {
        let policy = BackoffPolicy::default();
        for attempt in 0..4 {
            let d = policy.delay(attempt).as_millis() as u64;
            let exp = (1_000u64 * 2u64.pow(attempt)).min(8_000);
            assert!(d >= exp && d <= exp + 500, "delay {} out of range", d);
        }
    }

    #[test]
    fn transient_markers_match_case_insensitively() {
        assert!(is_transient("Error: Rate Limit exceeded"));
        assert!(is_transient("HTTP 429 Too Many Requests"));
        assert!(is_transient("the model is OVERLOADED"));
        assert!(!is_transient("permission denied"));
        assert!(!is_transient(""));
    }
}

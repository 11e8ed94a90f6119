//! Retry timing.

/// Seconds to wait before the next attempt after `retries` failures:
/// `retry_interval` times the retry count, capped at `max_factor`.
pub fn retry_delay(retry_interval: i32, retries: u32, max_factor: u32) -> i64 {
    if retries == 0 {
        return 0;
    }
    retry_interval.max(0) as i64 * retries.min(max_factor.max(1)) as i64
}

/// Whether a message that last failed at `last_attempt` may go again
pub fn retry_due(now: i64, last_attempt: i64, retry_interval: i32, retries: u32, max_factor: u32) -> bool {
    now >= last_attempt + retry_delay(retry_interval, retries, max_factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_and_capped() {
        assert_eq!(retry_delay(60, 0, 10), 0);
        assert_eq!(retry_delay(60, 1, 10), 60);
        assert_eq!(retry_delay(60, 3, 10), 180);
        assert_eq!(retry_delay(60, 50, 10), 600);
        assert_eq!(retry_delay(-5, 2, 10), 0);
    }

    #[test]
    fn test_due() {
        assert!(retry_due(1000, 900, 60, 1, 10));
        assert!(!retry_due(1000, 900, 60, 2, 10));
        assert!(retry_due(1020, 900, 60, 2, 10));
    }
}

//! Process-wide burst counters.
//!
//! A burst hands a queued message to a transport session that is still
//! open instead of starting a new worker.

use std::sync::atomic::{AtomicU64, Ordering};

static BURSTS: AtomicU64 = AtomicU64::new(0);

#[cfg(feature = "burst-miss")]
static BURST_MISSES: AtomicU64 = AtomicU64::new(0);

pub fn record_burst() {
    BURSTS.fetch_add(1, Ordering::Relaxed);
}

/// Messages handed to an already open session so far
pub fn bursts() -> u64 {
    BURSTS.load(Ordering::Relaxed)
}

/// A session closed because no queued message could follow it
#[cfg(feature = "burst-miss")]
pub fn record_miss() {
    BURST_MISSES.fetch_add(1, Ordering::Relaxed);
}

#[cfg(not(feature = "burst-miss"))]
pub fn record_miss() {}

#[cfg(feature = "burst-miss")]
pub fn misses() -> Option<u64> {
    Some(BURST_MISSES.load(Ordering::Relaxed))
}

#[cfg(not(feature = "burst-miss"))]
pub fn misses() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_moves() {
        let before = bursts();
        record_burst();
        assert!(bursts() > before);
        record_miss();
        assert_eq!(misses().is_some(), cfg!(feature = "burst-miss"));
    }
}

//! Time sources for bucket state.
//!
//! Bucket state lives in a store shared by several processes, so timestamps
//! are wall-clock nanoseconds since the UNIX epoch rather than `Instant`s.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current time, in nanoseconds since the UNIX epoch.
pub trait Clock: Send + Sync + Debug {
    /// Get the current time.
    fn now_nanos(&self) -> u64;
}

/// System clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        // A clock set before 1970 is treated as the epoch itself.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven clock for deterministic tests.
///
/// All clones share the same underlying time value.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock starting at the given time.
    pub fn new(start_nanos: u64) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(start_nanos)),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_past_2020() {
        let clock = SystemClock::new();
        // 2020-01-01T00:00:00Z
        assert!(clock.now_nanos() > 1_577_836_800_000_000_000);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();

        other.advance(Duration::from_nanos(500));
        assert_eq!(clock.now_nanos(), 1_500);

        clock.set(42);
        assert_eq!(other.now_nanos(), 42);
    }
}

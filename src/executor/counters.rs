//! Increment-only dispatch counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotone counter tracking how many splits a level has dispatched.
///
/// The queue owns one per level and never resets them; metrics collectors
/// read them through [`total`](LevelCounter::total).
#[derive(Debug, Default)]
pub struct LevelCounter {
    count: AtomicU64,
}

impl LevelCounter {
    pub fn new() -> Self {
        LevelCounter {
            count: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments() {
        let counter = LevelCounter::new();
        assert_eq!(counter.total(), 0);
        counter.increment();
        counter.increment();
        assert_eq!(counter.total(), 2);
    }
}

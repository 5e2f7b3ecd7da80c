//! Data usage accounting.

use crate::types::UsageStatus;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counts bytes transferred in the current accounting period.
///
/// Purely observational: nothing in the core throttles on the status. The
/// period is reset by whoever owns the billing cycle.
#[derive(Debug)]
pub struct DataUsageTracker {
    bytes: AtomicU64,
    cap: u64,
}

impl DataUsageTracker {
    /// Creates a tracker with the given cap.
    pub fn new(cap: u64) -> Self {
        Self {
            bytes: AtomicU64::new(0),
            cap,
        }
    }

    /// Adds transferred bytes. Saturates instead of wrapping.
    pub fn add_bytes(&self, n: u64) {
        let _ = self
            .bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_add(n))
            });
    }

    /// Bytes counted so far in this period.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// The configured cap.
    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// Current status relative to the cap.
    pub fn status(&self) -> UsageStatus {
        classify(self.bytes(), self.cap)
    }

    /// Starts a new period and returns the total of the previous one.
    pub fn reset(&self) -> u64 {
        self.bytes.swap(0, Ordering::Relaxed)
    }
}

/// Classifies a byte total against a cap.
///
/// Boundaries are inclusive on the upper bucket: exactly 50% is
/// `Moderate`, exactly 80% is `ApproachingLimit`, exactly 100% is
/// `LimitExceeded`. A zero cap is always exceeded.
pub fn classify(bytes: u64, cap: u64) -> UsageStatus {
    if cap == 0 {
        return UsageStatus::LimitExceeded;
    }
    // percent * cap compared without division, in u128 to avoid overflow
    let scaled = u128::from(bytes) * 100;
    let cap = u128::from(cap);
    if scaled >= cap * 100 {
        UsageStatus::LimitExceeded
    } else if scaled >= cap * 80 {
        UsageStatus::ApproachingLimit
    } else if scaled >= cap * 50 {
        UsageStatus::Moderate
    } else {
        UsageStatus::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_inclusive() {
        assert_eq!(classify(0, 1000), UsageStatus::Low);
        assert_eq!(classify(499, 1000), UsageStatus::Low);
        assert_eq!(classify(500, 1000), UsageStatus::Moderate);
        assert_eq!(classify(799, 1000), UsageStatus::Moderate);
        assert_eq!(classify(800, 1000), UsageStatus::ApproachingLimit);
        assert_eq!(classify(999, 1000), UsageStatus::ApproachingLimit);
        assert_eq!(classify(1000, 1000), UsageStatus::LimitExceeded);
        assert_eq!(classify(5000, 1000), UsageStatus::LimitExceeded);
    }

    #[test]
    fn zero_cap() {
        assert_eq!(classify(0, 0), UsageStatus::LimitExceeded);
    }

    #[test]
    fn huge_values_do_not_overflow() {
        assert_eq!(classify(u64::MAX, u64::MAX), UsageStatus::LimitExceeded);
        assert_eq!(classify(u64::MAX / 2, u64::MAX), UsageStatus::Low);
    }

    #[test]
    fn tracker_accumulates_and_resets() {
        let tracker = DataUsageTracker::new(100);
        tracker.add_bytes(30);
        tracker.add_bytes(30);
        assert_eq!(tracker.bytes(), 60);
        assert_eq!(tracker.status(), UsageStatus::Moderate);

        tracker.add_bytes(u64::MAX);
        assert_eq!(tracker.bytes(), u64::MAX);

        assert_eq!(tracker.reset(), u64::MAX);
        assert_eq!(tracker.bytes(), 0);
        assert_eq!(tracker.status(), UsageStatus::Low);
    }
}

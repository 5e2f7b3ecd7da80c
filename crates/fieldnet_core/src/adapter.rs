//! Request shaping for the current bandwidth level.

use crate::types::{BandwidthLevel, DataRequest};

/// Derives the request actually sent over a link of the given level.
///
/// | level  | payload cap | timeout | retry budget |
/// |--------|-------------|---------|--------------|
/// | Low    | ÷ 4         | × 2     | + 2          |
/// | Medium | ÷ 2         | × 1.5   | unchanged    |
/// | High   | unchanged   | unchanged | unchanged  |
///
/// Smaller payloads and looser timeouts make a mid-transfer failure less
/// likely on a constrained link; the extra attempts absorb its higher
/// transient failure rate. The input is never modified.
pub fn adapt(request: &DataRequest, level: BandwidthLevel) -> DataRequest {
    match level {
        BandwidthLevel::Low => DataRequest {
            max_payload_bytes: request.max_payload_bytes / 4,
            timeout: request.timeout.saturating_mul(2),
            retry_budget: request.retry_budget.saturating_add(2),
            ..request.clone()
        },
        BandwidthLevel::Medium => DataRequest {
            max_payload_bytes: request.max_payload_bytes / 2,
            timeout: request.timeout.saturating_add(request.timeout / 2),
            ..request.clone()
        },
        BandwidthLevel::High => request.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;
    use std::time::Duration;

    fn request() -> DataRequest {
        DataRequest::new("marketplace_items", Priority::Medium)
            .with_max_payload_bytes(1_000_000)
            .with_timeout(Duration::from_secs(30))
            .with_retry_budget(3)
    }

    #[test]
    fn low_shrinks_and_loosens() {
        let adapted = adapt(&request(), BandwidthLevel::Low);
        assert_eq!(adapted.max_payload_bytes, 250_000);
        assert_eq!(adapted.timeout, Duration::from_secs(60));
        assert_eq!(adapted.retry_budget, 5);
        assert_eq!(adapted.kind, "marketplace_items");
        assert_eq!(adapted.priority, Priority::Medium);
    }

    #[test]
    fn medium_halves_payload() {
        let adapted = adapt(&request(), BandwidthLevel::Medium);
        assert_eq!(adapted.max_payload_bytes, 500_000);
        assert_eq!(adapted.timeout, Duration::from_secs(45));
        assert_eq!(adapted.retry_budget, 3);
    }

    #[test]
    fn high_is_identity() {
        let original = request();
        assert_eq!(adapt(&original, BandwidthLevel::High), original);
    }

    #[test]
    fn original_is_untouched() {
        let original = request();
        let snapshot = original.clone();
        let _ = adapt(&original, BandwidthLevel::Low);
        assert_eq!(original, snapshot);
    }
}

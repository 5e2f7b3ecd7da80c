//! Core value types shared by every component.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Transport class of the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionTier {
    /// No network interface is up.
    None,
    /// 2G cellular (GPRS/EDGE).
    Cellular2G,
    /// 3G cellular.
    Cellular3G,
    /// 4G/LTE cellular.
    Cellular4G,
    /// Wi-Fi.
    Wifi,
    /// The platform could not tell.
    Unknown,
}

impl fmt::Display for ConnectionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Cellular2G => "2g",
            Self::Cellular3G => "3g",
            Self::Cellular4G => "4g",
            Self::Wifi => "wifi",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Snapshot of connectivity published by the network monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    /// Transport class.
    pub tier: ConnectionTier,
    /// Whether the server is currently reachable.
    pub reachable: bool,
}

impl NetworkStatus {
    /// Creates a status snapshot.
    pub const fn new(tier: ConnectionTier, reachable: bool) -> Self {
        Self { tier, reachable }
    }

    /// The status before the platform has reported anything.
    pub const fn unknown() -> Self {
        Self::new(ConnectionTier::Unknown, false)
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Measured throughput bucket.
///
/// Independent of [`ConnectionTier`]: a 4G label does not guarantee a
/// fast link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthLevel {
    /// Below the low threshold (100 KB/s by default).
    Low,
    /// Between the two thresholds.
    Medium,
    /// At or above the high threshold (500 KB/s by default).
    High,
}

impl fmt::Display for BandwidthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Request priority. `Critical` drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Optional, prefetch-style data.
    Low,
    /// Default for ordinary screens.
    Medium,
    /// Data the user is waiting on.
    High,
    /// Safety or money related data (health alerts, live bids).
    Critical,
}

/// Default payload cap for a request (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 1024 * 1024;

/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of attempts for a request.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// A logical data request issued by feature code.
///
/// Requests are immutable values. The queue derives an adapted copy at
/// admission time and never mutates the original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    /// Domain tag understood by the transport (e.g. `"flock_list"`).
    pub kind: String,
    /// Admission priority.
    pub priority: Priority,
    /// Largest payload the transport should fetch.
    pub max_payload_bytes: u64,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Number of attempts the retry executor may make.
    pub retry_budget: u32,
}

impl DataRequest {
    /// Creates a request with default size, timeout and retry budget.
    pub fn new(kind: impl Into<String>, priority: Priority) -> Self {
        Self {
            kind: kind.into(),
            priority,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }

    /// Sets the payload cap.
    #[must_use]
    pub fn with_max_payload_bytes(mut self, bytes: u64) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_retry_budget(mut self, attempts: u32) -> Self {
        self.retry_budget = attempts;
        self
    }
}

/// Identifier of an enqueued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Wraps a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Data usage bucket relative to the configured cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    /// Below 50% of the cap.
    Low,
    /// 50% to 80% of the cap.
    Moderate,
    /// 80% to 100% of the cap.
    ApproachingLimit,
    /// At or above the cap.
    LimitExceeded,
}

impl fmt::Display for UsageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Moderate => write!(f, "moderate"),
            Self::ApproachingLimit => write!(f, "approaching limit"),
            Self::LimitExceeded => write!(f, "limit exceeded"),
        }
    }
}

/// Stable identifier of a sync task; the idempotency key for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Rebuilds an id from its 16 raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the 16 raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Default number of flushes a sync task may take part in.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A mutation recorded while offline or busy, waiting to reach the server.
///
/// Delivery is at-least-once: receivers must treat [`SyncTask::id`] as an
/// idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
    /// Idempotency key.
    pub id: TaskId,
    /// Domain tag (e.g. `"health_record"`).
    pub kind: String,
    /// Opaque mutation body.
    pub payload: Vec<u8>,
    /// Failed flushes so far.
    pub retry_count: u32,
    /// Flush attempts allowed before the task is reported as failed.
    pub max_retries: u32,
}

impl SyncTask {
    /// Creates a new task with a fresh id.
    pub fn new(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: TaskId::generate(),
            kind: kind.into(),
            payload: payload.into(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Sets the retry limit.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// True if a failure of the next attempt exhausts the task.
    pub fn is_last_attempt(&self) -> bool {
        self.retry_count.saturating_add(1) >= self.max_retries
    }

    /// The copy that is re-queued after a failed attempt.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn request_defaults() {
        let request = DataRequest::new("flock_list", Priority::High);
        assert_eq!(request.max_payload_bytes, 1024 * 1024);
        assert_eq!(request.timeout, Duration::from_secs(30));
        assert_eq!(request.retry_budget, 3);
    }

    #[test]
    fn sync_task_attempts() {
        let task = SyncTask::new("fowl_data", b"{}".to_vec());
        assert_eq!(task.retry_count, 0);
        assert!(!task.is_last_attempt());

        let second = task.next_attempt();
        assert_eq!(second.id, task.id);
        assert_eq!(second.retry_count, 1);

        let third = second.next_attempt();
        assert!(third.is_last_attempt());
    }

    #[test]
    fn task_id_bytes_round_trip() {
        let id = TaskId::generate();
        assert_eq!(TaskId::from_bytes(*id.as_bytes()), id);
    }
}

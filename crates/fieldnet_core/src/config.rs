//! Configuration for the network resource manager.

use crate::types::BandwidthLevel;
use rand::Rng;
use std::time::Duration;

/// Top-level configuration, one section per component.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Retry behavior shared by the request queue and the sync scheduler.
    pub retry: RetryConfig,
    /// Bandwidth probing.
    pub bandwidth: BandwidthConfig,
    /// Request admission.
    pub queue: QueueConfig,
    /// Offline mutation flushing.
    pub sync: SyncConfig,
    /// Data usage accounting.
    pub usage: UsageConfig,
}

impl ManagerConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the bandwidth configuration.
    #[must_use]
    pub fn with_bandwidth(mut self, bandwidth: BandwidthConfig) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    /// Sets the queue configuration.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the sync configuration.
    #[must_use]
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Sets the usage configuration.
    #[must_use]
    pub fn with_usage(mut self, usage: UsageConfig) -> Self {
        self.usage = usage;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Default number of attempts when a caller does not specify one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles after each further failure.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Whether to add up to 25% random jitter to delays. Jittered delays
    /// are still capped at `max_delay`.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given default attempt count.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            add_jitter: false,
        }
    }

    /// Creates a configuration that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            add_jitter: false,
        }
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Delay to wait after failed attempt `attempt` (0-indexed):
    /// `base_delay * 2^attempt` plus optional jitter, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if self.add_jitter && !delay.is_zero() {
            let jitter = rand::thread_rng().gen_range(0.0..=0.25);
            (delay + delay.mul_f64(jitter)).min(self.max_delay)
        } else {
            delay
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Configuration for bandwidth probing.
#[derive(Debug, Clone)]
pub struct BandwidthConfig {
    /// Throughput below this (bytes/s) is [`BandwidthLevel::Low`].
    pub low_threshold_bps: f64,
    /// Throughput below this (bytes/s) is [`BandwidthLevel::Medium`].
    pub high_threshold_bps: f64,
    /// Probe attempts slower than this count as failures.
    pub probe_timeout: Duration,
    /// Interval between scheduled probes.
    pub probe_interval: Duration,
    /// Level assumed before the first probe completes.
    pub initial_level: BandwidthLevel,
}

impl BandwidthConfig {
    /// Sets the probe timeout.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Sets the interval between scheduled probes.
    #[must_use]
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Sets the level assumed before the first probe.
    #[must_use]
    pub fn with_initial_level(mut self, level: BandwidthLevel) -> Self {
        self.initial_level = level;
        self
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            low_threshold_bps: 100.0 * 1024.0,
            high_threshold_bps: 500.0 * 1024.0,
            probe_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_secs(60 * 60),
            initial_level: BandwidthLevel::Low,
        }
    }
}

/// Configuration for the priority request queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of queued (not yet admitted) requests.
    pub capacity: usize,
    /// Concurrent requests at [`BandwidthLevel::Low`].
    pub low_concurrency: usize,
    /// Concurrent requests at [`BandwidthLevel::Medium`].
    pub medium_concurrency: usize,
    /// Concurrent requests at [`BandwidthLevel::High`].
    pub high_concurrency: usize,
}

impl QueueConfig {
    /// Sets the queue capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the concurrency for each bandwidth level.
    #[must_use]
    pub fn with_concurrency(mut self, low: usize, medium: usize, high: usize) -> Self {
        self.low_concurrency = low;
        self.medium_concurrency = medium;
        self.high_concurrency = high;
        self
    }

    /// Admission limit for a bandwidth level (never below 1).
    pub fn concurrency_for(&self, level: BandwidthLevel) -> usize {
        let limit = match level {
            BandwidthLevel::Low => self.low_concurrency,
            BandwidthLevel::Medium => self.medium_concurrency,
            BandwidthLevel::High => self.high_concurrency,
        };
        limit.max(1)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            low_concurrency: 1,
            medium_concurrency: 2,
            high_concurrency: 4,
        }
    }
}

/// Configuration for the background sync scheduler.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Safety-net flush interval, independent of connectivity events.
    pub flush_interval: Duration,
}

impl SyncConfig {
    /// Sets the periodic flush interval.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
        }
    }
}

/// Configuration for data usage accounting.
#[derive(Debug, Clone)]
pub struct UsageConfig {
    /// Byte budget for one accounting period.
    pub cap_bytes: u64,
}

impl UsageConfig {
    /// Creates a usage configuration with the given cap.
    pub fn new(cap_bytes: u64) -> Self {
        Self { cap_bytes }
    }
}

impl Default for UsageConfig {
    fn default() -> Self {
        // 50 MiB per day for rural data plans
        Self::new(50 * 1024 * 1024)
    }
}

//! # FieldNet Core
//!
//! Adaptive network resource management for clients on slow, intermittent
//! rural connections.
//!
//! This crate provides:
//! - Connectivity monitoring and throughput-based bandwidth levels
//! - Priority-ordered request admission with a bandwidth-dependent
//!   concurrency bound
//! - Request shaping (payload cap, timeout, retry budget) per level
//! - Exponential-backoff retry that only retries transient failures
//! - A durable offline mutation queue with at-least-once delivery
//! - Data usage accounting against a cap
//! - Content degradation tables (image quality, batch sizes, feature gating)
//!
//! ## Architecture
//!
//! Feature code talks to [`NetworkResourceManager`]. The platform feeds
//! connectivity observations in; the manager owns all timing, ordering and
//! retry decisions and reports outcomes through handles and broadcast
//! streams. The transport, the bandwidth probe, the sync endpoint and the
//! task store are collaborators behind traits.
//!
//! ## Key Invariants
//!
//! - At most one bandwidth probe runs at a time
//! - Losing the connection drops the level to `Low` before anyone sees the
//!   new status
//! - Every request gets exactly one terminal outcome
//! - Sync tasks are delivered at least once and keyed by a stable id
//! - A task's retry count only grows and never exceeds its limit
//!
//! ## Example
//!
//! ```rust,no_run
//! use fieldnet_core::{
//!     ConnectionTier, DataRequest, ManagerConfig, MockDelivery, MockProbe, MockTransport,
//!     NetworkResourceManager, Priority, SyncTask, TaskLog,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> fieldnet_core::NetResult<()> {
//! let manager = NetworkResourceManager::new(
//!     ManagerConfig::default(),
//!     Arc::new(MockTransport::new()),
//!     Arc::new(MockProbe::new(1024, Duration::from_millis(5))),
//!     Arc::new(MockDelivery::new()),
//!     Arc::new(TaskLog::open("data/sync.log".as_ref())?),
//! );
//! manager.start().await?;
//! manager.report_connectivity(ConnectionTier::Cellular3G, true);
//!
//! let handle = manager.enqueue(DataRequest::new("flock_list", Priority::High))?;
//! let _outcome = handle.outcome().await;
//!
//! manager.schedule(SyncTask::new("health_record", b"{\"dose\":1}".to_vec()))?;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod bandwidth;
mod config;
mod error;
mod manager;
mod monitor;
pub mod policy;
mod queue;
mod retry;
mod sync;
mod transport;
mod types;
mod usage;

pub use adapter::adapt;
pub use bandwidth::{classify, classify_sample, BandwidthEstimator};
pub use config::{
    BandwidthConfig, ManagerConfig, QueueConfig, RetryConfig, SyncConfig, UsageConfig,
};
pub use error::{FailureKind, NetError, NetResult, PermanentKind, TransientKind};
pub use manager::NetworkResourceManager;
pub use monitor::{NetworkMonitor, Transition};
pub use queue::{PriorityRequestQueue, RequestEvent, RequestHandle, RequestOutcome};
pub use retry::RetryExecutor;
pub use sync::{
    compute_crc32, BackgroundSyncScheduler, CompactStats, FlushReport, LogRecord, LogScan,
    MemoryTaskStore, RecordType, SkippedRegion, SyncEvent, SyncTaskStore, TailDamage, TaskLog,
    DEFAULT_COMPACT_THRESHOLD, HEADER_SIZE, LOG_MAGIC, LOG_VERSION,
};
pub use transport::{
    BandwidthProbe, MockDelivery, MockProbe, MockTransport, ProgressReporter, SyncDelivery,
    Transport,
};
pub use types::{
    BandwidthLevel, ConnectionTier, DataRequest, NetworkStatus, Priority, RequestId, SyncTask,
    TaskId, UsageStatus, DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_MAX_RETRIES, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_RETRY_BUDGET,
};
pub use usage::{classify as classify_usage, DataUsageTracker};

/// Crate version, as reported by the `fieldnet` tool.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

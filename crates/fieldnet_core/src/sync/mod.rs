//! Offline mutation queue.
//!
//! Mutations made while the server is unreachable are written to a
//! [`SyncTaskStore`] first and delivered later by the
//! [`BackgroundSyncScheduler`]. Delivery is at-least-once: a crash between
//! delivery and removal from the store means the task is sent again after
//! restart, so receivers de-duplicate on the task id.

mod scheduler;
mod store;
mod task_log;

pub use scheduler::{BackgroundSyncScheduler, FlushReport, SyncEvent};
pub use store::{MemoryTaskStore, SyncTaskStore};
pub use task_log::{
    compute_crc32, CompactStats, LogRecord, LogScan, RecordType, SkippedRegion, TailDamage, TaskLog,
    DEFAULT_COMPACT_THRESHOLD, HEADER_SIZE, LOG_MAGIC, LOG_VERSION,
};

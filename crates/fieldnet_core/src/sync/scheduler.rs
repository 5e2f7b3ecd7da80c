//! Durable offline mutation queue.

use crate::config::SyncConfig;
use crate::error::{FailureKind, NetResult};
use crate::retry::RetryExecutor;
use crate::sync::store::SyncTaskStore;
use crate::transport::SyncDelivery;
use crate::types::{NetworkStatus, SyncTask, TaskId};
use crate::usage::DataUsageTracker;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Progress of queued mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The server accepted the task.
    Delivered {
        /// Task id.
        id: TaskId,
        /// Task kind.
        kind: String,
    },
    /// Delivery failed; the task will be retried in a later flush.
    Requeued {
        /// Task id.
        id: TaskId,
        /// Task kind.
        kind: String,
        /// Failed flushes so far.
        retry_count: u32,
    },
    /// An earlier task of the same kind failed in this flush, so this one
    /// waits for the next flush without using up a retry.
    Deferred {
        /// Task id.
        id: TaskId,
        /// Task kind.
        kind: String,
    },
    /// The task ran out of retries or was refused outright and was dropped.
    PermanentlyFailed {
        /// The dropped task.
        task: SyncTask,
        /// Why it failed.
        reason: FailureKind,
    },
}

/// Counts from one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Tasks handed to the delivery endpoint.
    pub attempted: usize,
    /// Tasks the server accepted.
    pub delivered: usize,
    /// Tasks put back with an incremented retry count.
    pub requeued: usize,
    /// Tasks skipped behind a failed task of the same kind.
    pub deferred: usize,
    /// Tasks dropped as permanently failed.
    pub failed: usize,
}

/// Queues mutations durably and delivers them when the server is reachable.
///
/// Each flush works on a snapshot of the queue; tasks scheduled while a
/// flush runs wait for the next one. Flushes never overlap.
pub struct BackgroundSyncScheduler {
    config: SyncConfig,
    delivery: Arc<dyn SyncDelivery>,
    store: Arc<dyn SyncTaskStore>,
    retry: RetryExecutor,
    network: watch::Receiver<NetworkStatus>,
    usage: Option<Arc<DataUsageTracker>>,
    queue: Mutex<VecDeque<SyncTask>>,
    flush_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    events: broadcast::Sender<SyncEvent>,
}

impl std::fmt::Debug for BackgroundSyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundSyncScheduler")
            .field("pending", &self.pending_len())
            .field("flush_interval", &self.config.flush_interval)
            .finish_non_exhaustive()
    }
}

impl BackgroundSyncScheduler {
    /// Creates a scheduler with an empty in-memory queue.
    ///
    /// Call [`BackgroundSyncScheduler::restore`] to pick up tasks left in
    /// the store by a previous run.
    pub fn new(
        config: SyncConfig,
        delivery: Arc<dyn SyncDelivery>,
        store: Arc<dyn SyncTaskStore>,
        retry: RetryExecutor,
        network: watch::Receiver<NetworkStatus>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            delivery,
            store,
            retry,
            network,
            usage: None,
            queue: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            events,
        }
    }

    /// Counts delivered payload bytes against a usage tracker.
    #[must_use]
    pub fn with_usage(mut self, usage: Arc<DataUsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Replaces the in-memory queue with the tasks pending in the store.
    ///
    /// Returns the number of restored tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn restore(&self) -> NetResult<usize> {
        let pending = self.store.load_pending()?;
        let count = pending.len();
        *self.queue.lock() = pending.into();
        if count > 0 {
            info!(count, "restored pending sync tasks");
        }
        Ok(count)
    }

    /// Persists a task and queues it for delivery.
    ///
    /// Wakes the flush loop if the server is reachable.
    ///
    /// # Errors
    ///
    /// Returns an error if the task could not be persisted; it is not
    /// queued in that case.
    pub fn schedule(&self, task: SyncTask) -> NetResult<TaskId> {
        self.store.persist(&task)?;
        let id = task.id;
        debug!(id = %id, kind = %task.kind, "sync task scheduled");
        self.queue.lock().push_back(task);

        if self.network.borrow().reachable {
            self.wake.notify_one();
        }
        Ok(id)
    }

    /// Subscribes to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Tasks waiting for delivery.
    pub fn pending_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Copy of the queue in delivery order.
    pub fn pending(&self) -> Vec<SyncTask> {
        self.queue.lock().iter().cloned().collect()
    }

    /// Attempts every task queued when the flush starts, once.
    ///
    /// Store failures are logged and do not abort the flush; the in-memory
    /// queue stays authoritative for this process.
    pub async fn flush(&self) -> FlushReport {
        let _flushing = self.flush_lock.lock().await;

        let snapshot: Vec<SyncTask> = self.queue.lock().drain(..).collect();
        let mut report = FlushReport::default();
        if snapshot.is_empty() {
            return report;
        }
        debug!(tasks = snapshot.len(), "flushing sync queue");

        let mut failed_kinds: HashSet<String> = HashSet::new();
        let mut carry = Vec::new();

        for task in snapshot {
            if failed_kinds.contains(&task.kind) {
                report.deferred += 1;
                self.emit(SyncEvent::Deferred {
                    id: task.id,
                    kind: task.kind.clone(),
                });
                carry.push(task);
                continue;
            }

            report.attempted += 1;
            let delivery: &dyn SyncDelivery = self.delivery.as_ref();
            let task_ref = &task;
            let result = self
                .retry
                .run(1, move |_: u32| delivery.deliver(task_ref))
                .await;

            match result {
                Ok(()) => {
                    self.forget(task.id);
                    if let Some(usage) = &self.usage {
                        usage.add_bytes(task.payload.len() as u64);
                    }
                    report.delivered += 1;
                    self.emit(SyncEvent::Delivered {
                        id: task.id,
                        kind: task.kind,
                    });
                }
                Err(err) => {
                    failed_kinds.insert(task.kind.clone());
                    if err.is_permanent() || task.is_last_attempt() {
                        warn!(
                            id = %task.id,
                            kind = %task.kind,
                            attempts = task.retry_count + 1,
                            error = %err,
                            "sync task permanently failed"
                        );
                        self.forget(task.id);
                        report.failed += 1;
                        self.emit(SyncEvent::PermanentlyFailed {
                            reason: err.failure_kind(),
                            task,
                        });
                    } else {
                        let next = task.next_attempt();
                        debug!(
                            id = %next.id,
                            kind = %next.kind,
                            retry_count = next.retry_count,
                            error = %err,
                            "sync task requeued"
                        );
                        if let Err(store_err) = self.store.persist(&next) {
                            warn!(id = %next.id, error = %store_err, "failed to persist retry count");
                        }
                        report.requeued += 1;
                        self.emit(SyncEvent::Requeued {
                            id: next.id,
                            kind: next.kind.clone(),
                            retry_count: next.retry_count,
                        });
                        carry.push(next);
                    }
                }
            }
        }

        if !carry.is_empty() {
            let mut queue = self.queue.lock();
            // ahead of tasks scheduled during the flush, keeping per-kind order
            for task in carry.into_iter().rev() {
                queue.push_front(task);
            }
        }

        info!(
            attempted = report.attempted,
            delivered = report.delivered,
            requeued = report.requeued,
            deferred = report.deferred,
            failed = report.failed,
            "sync flush finished"
        );
        report
    }

    /// Flushes on schedule, on reconnect and on demand until `shutdown` is
    /// cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut network = self.network.clone();
        let mut was_reachable = network.borrow_and_update().reachable;

        let period = self.config.flush_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if was_reachable && self.pending_len() > 0 {
            self.flush().await;
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                changed = network.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let reachable = network.borrow_and_update().reachable;
                    let restored = reachable && !was_reachable;
                    was_reachable = reachable;
                    if restored {
                        debug!("connection restored, flushing sync queue");
                        self.flush().await;
                    }
                }
                _ = self.wake.notified() => {
                    if self.network.borrow().reachable {
                        self.flush().await;
                    }
                }
                _ = ticker.tick() => {
                    if self.network.borrow().reachable && self.pending_len() > 0 {
                        self.flush().await;
                    }
                }
            }
        }
        debug!("sync scheduler stopped");
    }

    fn forget(&self, id: TaskId) {
        if let Err(err) = self.store.remove(id) {
            warn!(id = %id, error = %err, "failed to remove sync task from store");
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

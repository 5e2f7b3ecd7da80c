//! The facade feature code talks to.

use crate::bandwidth::BandwidthEstimator;
use crate::config::ManagerConfig;
use crate::error::{NetError, NetResult};
use crate::monitor::{NetworkMonitor, Transition};
use crate::queue::{PriorityRequestQueue, RequestEvent, RequestHandle};
use crate::retry::RetryExecutor;
use crate::sync::{BackgroundSyncScheduler, FlushReport, SyncEvent, SyncTaskStore};
use crate::transport::{BandwidthProbe, SyncDelivery, Transport};
use crate::types::{
    BandwidthLevel, ConnectionTier, DataRequest, NetworkStatus, RequestId, SyncTask, TaskId,
    UsageStatus,
};
use crate::usage::DataUsageTracker;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Owns one instance of every component and wires them together.
///
/// ```text
/// platform ──report_connectivity──▶ NetworkMonitor ──▶ BandwidthEstimator
///                                        │                    │
///                                        ▼                    ▼
///                           BackgroundSyncScheduler   PriorityRequestQueue
///                                        │                    │
///                                        └──▶ RetryExecutor ◀─┘
/// ```
///
/// Nothing runs in the background until [`NetworkResourceManager::start`];
/// requests and tasks accepted before that wait in their queues.
pub struct NetworkResourceManager {
    estimator: Arc<BandwidthEstimator>,
    monitor: Arc<NetworkMonitor>,
    queue: Arc<PriorityRequestQueue>,
    scheduler: Arc<BackgroundSyncScheduler>,
    usage: Arc<DataUsageTracker>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for NetworkResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkResourceManager")
            .field("status", &self.network_status())
            .field("bandwidth", &self.current_bandwidth_level())
            .field("queue", &self.queue)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl NetworkResourceManager {
    /// Builds every component from the configuration and collaborators.
    pub fn new(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        probe: Arc<dyn BandwidthProbe>,
        delivery: Arc<dyn SyncDelivery>,
        store: Arc<dyn SyncTaskStore>,
    ) -> Self {
        let usage = Arc::new(DataUsageTracker::new(config.usage.cap_bytes));
        let retry = RetryExecutor::new(config.retry.clone());
        let estimator = Arc::new(BandwidthEstimator::new(probe, config.bandwidth.clone()));
        let monitor = Arc::new(NetworkMonitor::new(Arc::clone(&estimator)));

        let queue = Arc::new(PriorityRequestQueue::new(
            config.queue.clone(),
            transport,
            retry.clone(),
            estimator.subscribe(),
            monitor.subscribe(),
            Arc::clone(&usage),
        ));
        let scheduler = Arc::new(
            BackgroundSyncScheduler::new(
                config.sync.clone(),
                delivery,
                store,
                retry,
                monitor.subscribe(),
            )
            .with_usage(Arc::clone(&usage)),
        );

        Self {
            estimator,
            monitor,
            queue,
            scheduler,
            usage,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Restores pending sync tasks and starts the background loops.
    ///
    /// Returns the number of restored tasks. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// - [`NetError::ShutDown`] after [`NetworkResourceManager::shutdown`]
    /// - a store error if pending tasks cannot be loaded
    pub async fn start(&self) -> NetResult<usize> {
        if self.shutdown.is_cancelled() {
            return Err(NetError::ShutDown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("network manager already started");
            return Ok(0);
        }

        let restored = match self.scheduler.restore() {
            Ok(count) => count,
            Err(err) => {
                self.started.store(false, Ordering::Release);
                return Err(err);
            }
        };

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            Arc::clone(&self.estimator).run_periodic(self.shutdown.clone()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.queue).run(self.shutdown.clone()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.scheduler).run(self.shutdown.clone()),
        ));
        drop(tasks);

        if self.monitor.is_reachable() {
            self.estimator.spawn_probe();
        }
        info!(restored, "network manager started");
        Ok(restored)
    }

    /// Stops the background loops and cancels every live request.
    ///
    /// Pending sync tasks stay in the store for the next start.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.queue.cancel_all();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        info!("network manager stopped");
    }

    /// Whether [`NetworkResourceManager::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Enqueues a request for priority-ordered, bandwidth-adapted execution.
    ///
    /// # Errors
    ///
    /// - [`NetError::QueueFull`] if the queue is at capacity
    /// - [`NetError::ShutDown`] after shutdown
    pub fn enqueue(&self, request: DataRequest) -> NetResult<RequestHandle> {
        if self.shutdown.is_cancelled() {
            return Err(NetError::ShutDown);
        }
        self.queue.enqueue(request)
    }

    /// Cancels a request. Returns true if it was still live.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.queue.cancel(id)
    }

    /// Subscribes to request lifecycle events.
    pub fn subscribe_requests(&self) -> broadcast::Receiver<RequestEvent> {
        self.queue.subscribe()
    }

    /// Requests waiting for admission.
    pub fn pending_requests(&self) -> usize {
        self.queue.pending_len()
    }

    /// Requests currently executing.
    pub fn in_flight_requests(&self) -> usize {
        self.queue.in_flight()
    }

    /// Durably queues a mutation for delivery.
    ///
    /// # Errors
    ///
    /// - [`NetError::ShutDown`] after shutdown
    /// - a store error if the task could not be persisted
    pub fn schedule(&self, task: SyncTask) -> NetResult<TaskId> {
        if self.shutdown.is_cancelled() {
            return Err(NetError::ShutDown);
        }
        self.scheduler.schedule(task)
    }

    /// Subscribes to sync events.
    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.scheduler.subscribe()
    }

    /// Mutations waiting for delivery.
    pub fn pending_sync(&self) -> usize {
        self.scheduler.pending_len()
    }

    /// Flushes the sync queue now, regardless of reachability.
    pub async fn flush_now(&self) -> FlushReport {
        self.scheduler.flush().await
    }

    /// Feeds a connectivity observation from the platform.
    pub fn report_connectivity(&self, tier: ConnectionTier, reachable: bool) -> Transition {
        self.monitor.report(tier, reachable)
    }

    /// Current connectivity snapshot.
    pub fn network_status(&self) -> NetworkStatus {
        self.monitor.status()
    }

    /// Subscribes to connectivity changes.
    pub fn subscribe_network(&self) -> watch::Receiver<NetworkStatus> {
        self.monitor.subscribe()
    }

    /// Last published bandwidth level.
    pub fn current_bandwidth_level(&self) -> BandwidthLevel {
        self.estimator.current()
    }

    /// Subscribes to bandwidth level changes.
    pub fn subscribe_bandwidth(&self) -> watch::Receiver<BandwidthLevel> {
        self.estimator.subscribe()
    }

    /// Runs a probe now, or returns the current level if one is running.
    pub async fn estimate_bandwidth(&self) -> BandwidthLevel {
        self.estimator.estimate_once().await
    }

    /// Data usage relative to the cap.
    pub fn current_usage_status(&self) -> UsageStatus {
        self.usage.status()
    }

    /// The usage tracker, for reading totals or resetting the period.
    pub fn usage(&self) -> &DataUsageTracker {
        &self.usage
    }
}

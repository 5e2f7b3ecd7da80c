//! Priority-ordered request admission.
//!
//! Requests wait in a max-heap keyed by `(priority, -sequence)`, so the
//! highest priority drains first and equal priorities drain in arrival
//! order. A drain loop admits requests while the server is reachable and
//! fewer than `concurrency_for(level)` are in flight, adapting each one to
//! the bandwidth level at the moment of admission.
//!
//! Every request ends with exactly one terminal outcome, delivered both
//! through its [`RequestHandle`] and the broadcast event stream. The entry
//! map is the single source of truth: whoever removes an entry under the
//! lock is the one that reports its outcome.

use crate::adapter::adapt;
use crate::config::QueueConfig;
use crate::error::{FailureKind, NetError, NetResult};
use crate::retry::RetryExecutor;
use crate::transport::{ProgressReporter, Transport};
use crate::types::{BandwidthLevel, DataRequest, NetworkStatus, Priority, RequestId};
use crate::usage::DataUsageTracker;
use bytes::Bytes;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of the request event channel.
const EVENT_CAPACITY: usize = 256;

// cancelled heap slots tolerated before the heap is rebuilt
const STALE_SLACK: usize = 64;

/// Lifecycle notifications for enqueued requests.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    /// The request left the queue and started executing.
    Admitted {
        /// Request id.
        id: RequestId,
        /// The request as adapted for the level at admission.
        adapted: DataRequest,
    },
    /// The transport reported download progress.
    Progress {
        /// Request id.
        id: RequestId,
        /// Fraction between 0 and 1.
        fraction: f32,
    },
    /// The request completed.
    Succeeded {
        /// Request id.
        id: RequestId,
        /// Payload size.
        bytes: usize,
    },
    /// The request failed for good.
    Failed {
        /// Request id.
        id: RequestId,
        /// User-actionable reason.
        reason: FailureKind,
    },
    /// The request was cancelled.
    Cancelled {
        /// Request id.
        id: RequestId,
    },
}

impl RequestEvent {
    /// The request this event belongs to.
    pub fn id(&self) -> RequestId {
        match self {
            Self::Admitted { id, .. }
            | Self::Progress { id, .. }
            | Self::Succeeded { id, .. }
            | Self::Failed { id, .. }
            | Self::Cancelled { id } => *id,
        }
    }

    /// True for `Succeeded`, `Failed` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

/// Terminal result of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The payload returned by the transport.
    Succeeded(Bytes),
    /// Why the request failed.
    Failed(FailureKind),
    /// The request was cancelled before completing.
    Cancelled,
}

/// Caller-side handle to an enqueued request.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    outcome: oneshot::Receiver<RequestOutcome>,
}

impl RequestHandle {
    /// The request id, used for cancellation and event correlation.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the terminal outcome.
    ///
    /// Resolves to `Cancelled` if the queue is dropped first.
    pub async fn outcome(self) -> RequestOutcome {
        self.outcome.await.unwrap_or(RequestOutcome::Cancelled)
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Pending {
    priority: Priority,
    seq: u64,
    id: RequestId,
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Queued,
    Admitted,
}

#[derive(Debug)]
struct Entry {
    request: DataRequest,
    state: EntryState,
    outcome: Option<oneshot::Sender<RequestOutcome>>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct QueueState {
    // may hold ids already cancelled; they are skipped when popped
    heap: BinaryHeap<Pending>,
    entries: HashMap<RequestId, Entry>,
    queued: usize,
    in_flight: usize,
    next_seq: u64,
}

impl QueueState {
    fn remove(&mut self, id: RequestId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        match entry.state {
            EntryState::Queued => {
                self.queued = self.queued.saturating_sub(1);
                self.prune_heap();
            }
            EntryState::Admitted => self.in_flight = self.in_flight.saturating_sub(1),
        }
        Some(entry)
    }

    /// Drops heap slots of cancelled requests once they outnumber live ones.
    fn prune_heap(&mut self) {
        if self.heap.len() <= self.queued.saturating_mul(2).max(STALE_SLACK) {
            return;
        }
        let entries = &self.entries;
        self.heap.retain(|pending| {
            entries
                .get(&pending.id)
                .is_some_and(|entry| entry.state == EntryState::Queued)
        });
    }
}

/// Admits requests by priority under a bandwidth-dependent concurrency bound.
pub struct PriorityRequestQueue {
    config: QueueConfig,
    transport: Arc<dyn Transport>,
    retry: RetryExecutor,
    bandwidth: watch::Receiver<BandwidthLevel>,
    network: watch::Receiver<NetworkStatus>,
    usage: Arc<DataUsageTracker>,
    state: Mutex<QueueState>,
    events: broadcast::Sender<RequestEvent>,
    wake: Notify,
}

impl std::fmt::Debug for PriorityRequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityRequestQueue")
            .field("pending", &self.pending_len())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl PriorityRequestQueue {
    /// Creates a queue that reads the level and reachability from the given
    /// channels.
    pub fn new(
        config: QueueConfig,
        transport: Arc<dyn Transport>,
        retry: RetryExecutor,
        bandwidth: watch::Receiver<BandwidthLevel>,
        network: watch::Receiver<NetworkStatus>,
        usage: Arc<DataUsageTracker>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            transport,
            retry,
            bandwidth,
            network,
            usage,
            state: Mutex::new(QueueState::default()),
            events,
            wake: Notify::new(),
        }
    }

    /// Adds a request to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::QueueFull`] if `capacity` requests are already
    /// waiting for admission.
    pub fn enqueue(&self, request: DataRequest) -> NetResult<RequestHandle> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.state.lock();
            if state.queued >= self.config.capacity {
                return Err(NetError::QueueFull {
                    capacity: self.config.capacity,
                });
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            let id = RequestId::new(seq);
            state.heap.push(Pending {
                priority: request.priority,
                seq,
                id,
            });
            state.entries.insert(
                id,
                Entry {
                    request,
                    state: EntryState::Queued,
                    outcome: Some(tx),
                    cancel: CancellationToken::new(),
                },
            );
            state.queued += 1;
            id
        };

        debug!(id = %id, "request queued");
        self.wake.notify_one();
        Ok(RequestHandle { id, outcome: rx })
    }

    /// Cancels a request. Returns true if it was still live.
    ///
    /// A queued request is removed and reported immediately. An admitted one
    /// is interrupted at its next await point and reported by its executor.
    pub fn cancel(&self, id: RequestId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.entries.get(&id) {
                None => return false,
                Some(entry) if entry.state == EntryState::Admitted => {
                    if entry.cancel.is_cancelled() {
                        return false;
                    }
                    entry.cancel.cancel();
                    None
                }
                Some(_) => state.remove(id),
            }
        };

        if let Some(entry) = removed {
            self.complete(id, entry, RequestOutcome::Cancelled);
        }
        true
    }

    /// Cancels every live request.
    pub fn cancel_all(&self) {
        let ids: Vec<RequestId> = self.state.lock().entries.keys().copied().collect();
        for id in ids {
            self.cancel(id);
        }
    }

    /// Subscribes to request events.
    pub fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.events.subscribe()
    }

    /// Requests waiting for admission.
    pub fn pending_len(&self) -> usize {
        self.state.lock().queued
    }

    /// Requests currently executing.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Admits as many requests as reachability and the concurrency bound
    /// allow. Returns the number admitted.
    pub fn admit_ready(self: &Arc<Self>) -> usize {
        if !self.network.borrow().reachable {
            return 0;
        }
        let level = *self.bandwidth.borrow();
        let limit = self.config.concurrency_for(level);

        let mut admitted = Vec::new();
        {
            let mut state = self.state.lock();
            while state.in_flight < limit {
                let Some(next) = state.heap.pop() else {
                    break;
                };
                let Some(entry) = state.entries.get_mut(&next.id) else {
                    continue;
                };
                if entry.state != EntryState::Queued {
                    continue;
                }
                entry.state = EntryState::Admitted;
                admitted.push((next.id, adapt(&entry.request, level), entry.cancel.clone()));
                state.queued -= 1;
                state.in_flight += 1;
            }
        }

        let count = admitted.len();
        for (id, request, cancel) in admitted {
            debug!(id = %id, kind = %request.kind, level = %level, "request admitted");
            let _ = self.events.send(RequestEvent::Admitted {
                id,
                adapted: request.clone(),
            });
            tokio::spawn(Arc::clone(self).execute(id, request, cancel));
        }
        count
    }

    /// Drains the queue until `shutdown` is cancelled.
    ///
    /// Re-evaluates admission on every enqueue, completion, reachability
    /// change and bandwidth change.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut network = self.network.clone();
        let mut bandwidth = self.bandwidth.clone();

        loop {
            self.admit_ready();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                changed = network.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = bandwidth.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("request queue stopped");
    }

    async fn execute(
        self: Arc<Self>,
        id: RequestId,
        request: DataRequest,
        cancel: CancellationToken,
    ) {
        let reporter = ProgressReporter::new(id, self.events.clone());
        let transport: &dyn Transport = self.transport.as_ref();
        let request_ref = &request;
        let reporter_ref = &reporter;

        let attempt = move |_: u32| async move {
            match tokio::time::timeout(
                request_ref.timeout,
                transport.execute(request_ref, reporter_ref),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(NetError::timeout(format!(
                    "{} exceeded {} ms",
                    request_ref.kind,
                    request_ref.timeout.as_millis()
                ))),
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => RequestOutcome::Cancelled,
            result = self.retry.run(request.retry_budget.max(1), attempt) => match result {
                Ok(payload) => {
                    self.usage.add_bytes(payload.len() as u64);
                    RequestOutcome::Succeeded(payload)
                }
                Err(err) => {
                    warn!(id = %id, kind = %request.kind, error = %err, "request failed");
                    RequestOutcome::Failed(err.failure_kind())
                }
            },
        };

        let entry = self.state.lock().remove(id);
        if let Some(entry) = entry {
            self.complete(id, entry, outcome);
        }
        self.wake.notify_one();
    }

    fn complete(&self, id: RequestId, mut entry: Entry, outcome: RequestOutcome) {
        let event = match &outcome {
            RequestOutcome::Succeeded(payload) => RequestEvent::Succeeded {
                id,
                bytes: payload.len(),
            },
            RequestOutcome::Failed(reason) => RequestEvent::Failed {
                id,
                reason: *reason,
            },
            RequestOutcome::Cancelled => RequestEvent::Cancelled { id },
        };
        debug!(id = %id, ?event, "request finished");
        let _ = self.events.send(event);
        if let Some(tx) = entry.outcome.take() {
            let _ = tx.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::error::PermanentKind;
    use crate::transport::MockTransport;
    use crate::types::ConnectionTier;
    use std::time::Duration;

    struct Harness {
        queue: Arc<PriorityRequestQueue>,
        transport: Arc<MockTransport>,
        usage: Arc<DataUsageTracker>,
        level: watch::Sender<BandwidthLevel>,
        network: watch::Sender<NetworkStatus>,
        shutdown: CancellationToken,
    }

    impl Harness {
        fn new(transport: MockTransport, config: QueueConfig) -> Self {
            let transport = Arc::new(transport);
            let usage = Arc::new(DataUsageTracker::new(1024));
            let (level, level_rx) = watch::channel(BandwidthLevel::Low);
            let (network, network_rx) = watch::channel(NetworkStatus::unknown());
            let retry = RetryExecutor::new(
                RetryConfig::new(3).with_base_delay(Duration::from_millis(10)),
            );
            let queue = Arc::new(PriorityRequestQueue::new(
                config,
                Arc::clone(&transport) as Arc<dyn Transport>,
                retry,
                level_rx,
                network_rx,
                Arc::clone(&usage),
            ));
            let shutdown = CancellationToken::new();
            tokio::spawn(Arc::clone(&queue).run(shutdown.clone()));
            Self {
                queue,
                transport,
                usage,
                level,
                network,
                shutdown,
            }
        }

        fn go_online(&self) {
            self.network
                .send_replace(NetworkStatus::new(ConnectionTier::Wifi, true));
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn drains_by_priority_then_fifo() {
        let h = Harness::new(MockTransport::new(), QueueConfig::default());

        let mut handles = Vec::new();
        for (kind, priority) in [
            ("low", Priority::Low),
            ("high-1", Priority::High),
            ("critical", Priority::Critical),
            ("high-2", Priority::High),
            ("medium", Priority::Medium),
        ] {
            handles.push(h.queue.enqueue(DataRequest::new(kind, priority)).unwrap());
        }
        settle().await;
        assert!(h.transport.executed().is_empty());

        h.go_online();
        for handle in handles {
            assert!(matches!(handle.outcome().await, RequestOutcome::Succeeded(_)));
        }

        let order: Vec<String> = h.transport.executed().into_iter().map(|r| r.kind).collect();
        assert_eq!(order, ["critical", "high-1", "high-2", "medium", "low"]);
        assert_eq!(h.transport.peak_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_follows_level() {
        let h = Harness::new(MockTransport::held(), QueueConfig::default());
        h.level.send_replace(BandwidthLevel::High);
        h.go_online();

        for i in 0..6 {
            h.queue
                .enqueue(DataRequest::new(format!("item-{i}"), Priority::Medium))
                .unwrap();
        }
        settle().await;
        assert_eq!(h.queue.in_flight(), 4);
        assert_eq!(h.queue.pending_len(), 2);

        h.transport.release(6);
        settle().await;
        assert_eq!(h.queue.in_flight(), 0);
        assert_eq!(h.queue.pending_len(), 0);
        assert_eq!(h.transport.peak_in_flight(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn adapts_at_admission() {
        let h = Harness::new(MockTransport::new(), QueueConfig::default());
        let mut events = h.queue.subscribe();
        let request = DataRequest::new("flock_list", Priority::High)
            .with_max_payload_bytes(4000)
            .with_retry_budget(1);

        h.level.send_replace(BandwidthLevel::Medium);
        h.go_online();
        let handle = h.queue.enqueue(request).unwrap();
        handle.outcome().await;

        match events.recv().await.unwrap() {
            RequestEvent::Admitted { adapted, .. } => {
                assert_eq!(adapted.max_payload_bytes, 2000);
                assert_eq!(adapted.timeout, Duration::from_secs(45));
            }
            other => panic!("expected Admitted, got {other:?}"),
        }
        assert_eq!(h.transport.executed()[0].max_payload_bytes, 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_when_full() {
        let h = Harness::new(
            MockTransport::new(),
            QueueConfig::default().with_capacity(2),
        );
        h.queue.enqueue(DataRequest::new("a", Priority::Low)).unwrap();
        h.queue.enqueue(DataRequest::new("b", Priority::Low)).unwrap();

        let err = h
            .queue
            .enqueue(DataRequest::new("c", Priority::Critical))
            .unwrap_err();
        assert!(matches!(err, NetError::QueueFull { capacity: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_queued_request() {
        let h = Harness::new(MockTransport::new(), QueueConfig::default());
        let mut events = h.queue.subscribe();
        let handle = h
            .queue
            .enqueue(DataRequest::new("weather", Priority::Low))
            .unwrap();
        let id = handle.id();

        assert!(h.queue.cancel(id));
        assert!(!h.queue.cancel(id));
        assert_eq!(handle.outcome().await, RequestOutcome::Cancelled);
        assert_eq!(events.recv().await.unwrap(), RequestEvent::Cancelled { id });

        h.go_online();
        settle().await;
        assert!(h.transport.executed().is_empty());
        assert_eq!(h.queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_admitted_request_once() {
        let h = Harness::new(MockTransport::held(), QueueConfig::default());
        let mut events = h.queue.subscribe();
        h.go_online();

        let handle = h
            .queue
            .enqueue(DataRequest::new("auction_bids", Priority::Critical))
            .unwrap();
        let id = handle.id();
        settle().await;
        assert_eq!(h.queue.in_flight(), 1);

        assert!(h.queue.cancel(id));
        assert!(!h.queue.cancel(id));
        assert_eq!(handle.outcome().await, RequestOutcome::Cancelled);
        settle().await;
        assert_eq!(h.queue.in_flight(), 0);

        let mut terminal = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.is_terminal() {
                terminal.push(event);
            }
        }
        assert_eq!(terminal, vec![RequestEvent::Cancelled { id }]);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_classified() {
        let h = Harness::new(MockTransport::new(), QueueConfig::default());
        h.level.send_replace(BandwidthLevel::High);
        h.go_online();

        h.transport.push_result(Err(NetError::permanent(
            PermanentKind::Unauthorized,
            "expired",
        )));
        let denied = h
            .queue
            .enqueue(DataRequest::new("profile", Priority::High).with_retry_budget(3))
            .unwrap();
        assert_eq!(
            denied.outcome().await,
            RequestOutcome::Failed(FailureKind::Unauthorized)
        );
        assert_eq!(h.transport.executed().len(), 1);

        for _ in 0..2 {
            h.transport.push_result(Err(NetError::timeout("slow")));
        }
        let flaky = h
            .queue
            .enqueue(DataRequest::new("prices", Priority::High).with_retry_budget(2))
            .unwrap();
        assert_eq!(
            flaky.outcome().await,
            RequestOutcome::Failed(FailureKind::Unreachable)
        );
        assert_eq!(h.transport.executed().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn success_counts_bytes() {
        let h = Harness::new(
            MockTransport::new().with_payload(vec![0u8; 100]),
            QueueConfig::default(),
        );
        h.go_online();
        let handle = h
            .queue
            .enqueue(DataRequest::new("vet_list", Priority::Medium))
            .unwrap();
        assert!(matches!(handle.outcome().await, RequestOutcome::Succeeded(p) if p.len() == 100));
        assert_eq!(h.usage.bytes(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn losing_connection_pauses_admission() {
        let h = Harness::new(MockTransport::held(), QueueConfig::default());
        h.level.send_replace(BandwidthLevel::High);
        h.go_online();

        h.queue.enqueue(DataRequest::new("a", Priority::Low)).unwrap();
        settle().await;
        assert_eq!(h.queue.in_flight(), 1);

        h.network.send_replace(NetworkStatus::new(ConnectionTier::None, false));
        h.queue.enqueue(DataRequest::new("b", Priority::Low)).unwrap();
        settle().await;
        // admitted work keeps running, new work waits
        assert_eq!(h.queue.in_flight(), 1);
        assert_eq!(h.queue.pending_len(), 1);

        h.go_online();
        settle().await;
        assert_eq!(h.queue.in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_requests_do_not_pile_up_offline() {
        let h = Harness::new(MockTransport::new(), QueueConfig::default().with_capacity(8));
        let kept = h
            .queue
            .enqueue(DataRequest::new("kept", Priority::Low))
            .unwrap();

        for i in 0..1000 {
            let handle = h
                .queue
                .enqueue(DataRequest::new(format!("tmp-{i}"), Priority::High))
                .unwrap();
            assert!(h.queue.cancel(handle.id()));
        }

        assert_eq!(h.queue.pending_len(), 1);
        assert!(h.queue.state.lock().heap.len() <= STALE_SLACK + 1);

        h.go_online();
        assert!(matches!(kept.outcome().await, RequestOutcome::Succeeded(_)));
        let order: Vec<String> = h.transport.executed().into_iter().map(|r| r.kind).collect();
        assert_eq!(order, ["kept"]);
    }

    #[test]
    fn pending_ordering() {
        let mut heap = BinaryHeap::new();
        heap.push(Pending {
            priority: Priority::Medium,
            seq: 0,
            id: RequestId::new(0),
        });
        heap.push(Pending {
            priority: Priority::Medium,
            seq: 1,
            id: RequestId::new(1),
        });
        heap.push(Pending {
            priority: Priority::Critical,
            seq: 2,
            id: RequestId::new(2),
        });

        let ids: Vec<u64> = std::iter::from_fn(|| heap.pop())
            .map(|p| p.id.as_u64())
            .collect();
        assert_eq!(ids, vec![2, 0, 1]);
    }
}

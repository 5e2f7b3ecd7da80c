//! Collaborator seams: the transport, the bandwidth probe and the sync
//! delivery endpoint.
//!
//! The core never builds wire messages. The networking layer implements
//! these traits; the mocks below stand in for it in tests.

use crate::error::{NetError, NetResult};
use crate::queue::RequestEvent;
use crate::types::{DataRequest, RequestId, SyncTask};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};

/// Executes an adapted request against the server.
///
/// Implementations should honor `request.max_payload_bytes` and
/// `request.timeout`, and return transient errors for link failures so the
/// retry executor can tell them apart from permanent ones.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one attempt of the request.
    async fn execute(&self, request: &DataRequest, progress: &ProgressReporter)
        -> NetResult<Bytes>;
}

/// Fetches the small fixed-size reference payload used to measure throughput.
#[async_trait]
pub trait BandwidthProbe: Send + Sync {
    /// Downloads the reference payload and returns the number of bytes received.
    async fn fetch_reference(&self) -> NetResult<usize>;
}

/// Sends one queued mutation to the server.
///
/// Delivery is at-least-once; the receiving side must de-duplicate on
/// [`SyncTask::id`].
#[async_trait]
pub trait SyncDelivery: Send + Sync {
    /// Delivers the task.
    async fn deliver(&self, task: &SyncTask) -> NetResult<()>;
}

/// Lets a transport publish download progress for the request it is executing.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    id: RequestId,
    events: broadcast::Sender<RequestEvent>,
}

impl ProgressReporter {
    pub(crate) fn new(id: RequestId, events: broadcast::Sender<RequestEvent>) -> Self {
        Self { id, events }
    }

    /// The request this reporter belongs to.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Publishes progress as a fraction between 0 and 1.
    pub fn report(&self, fraction: f32) {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        let _ = self.events.send(RequestEvent::Progress {
            id: self.id,
            fraction,
        });
    }
}

/// A scripted transport for testing.
///
/// Each call pops the next scripted result; once the script is empty every
/// call succeeds with the default payload. A held transport parks every call
/// until [`MockTransport::release`] hands out permits.
#[derive(Debug)]
pub struct MockTransport {
    executed: Mutex<Vec<DataRequest>>,
    script: Mutex<VecDeque<NetResult<Bytes>>>,
    default_payload: Bytes,
    gate: Option<Semaphore>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockTransport {
    /// Creates a transport that answers every call immediately.
    pub fn new() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            default_payload: Bytes::from_static(b"ok"),
            gate: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Creates a transport whose calls wait for [`MockTransport::release`].
    pub fn held() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    /// Sets the payload returned when the script is empty.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.default_payload = payload.into();
        self
    }

    /// Queues the result of a future call.
    pub fn push_result(&self, result: NetResult<Bytes>) {
        self.script.lock().push_back(result);
    }

    /// Lets `calls` parked calls proceed.
    pub fn release(&self, calls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(calls);
        }
    }

    /// Requests seen so far, in call order.
    pub fn executed(&self) -> Vec<DataRequest> {
        self.executed.lock().clone()
    }

    /// Calls currently inside `execute`.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(
        &self,
        request: &DataRequest,
        progress: &ProgressReporter,
    ) -> NetResult<Bytes> {
        self.executed.lock().push(request.clone());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let result = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(self.default_payload.clone()));
        if result.is_ok() {
            progress.report(1.0);
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// A probe that returns a fixed byte count after a fixed delay.
#[derive(Debug)]
pub struct MockProbe {
    bytes: usize,
    delay: Duration,
    fail: bool,
    calls: AtomicUsize,
}

impl MockProbe {
    /// Creates a probe that receives `bytes` in `delay`.
    pub fn new(bytes: usize, delay: Duration) -> Self {
        Self {
            bytes,
            delay,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates a probe that always fails with a transient error.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0, Duration::ZERO)
        }
    }

    /// Number of probes started.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BandwidthProbe for MockProbe {
    async fn fetch_reference(&self) -> NetResult<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(NetError::transient(
                crate::error::TransientKind::ConnectionRefused,
                "probe endpoint unreachable",
            ));
        }
        Ok(self.bytes)
    }
}

/// A sync endpoint that records deliveries and can be told to fail.
#[derive(Debug, Default)]
pub struct MockDelivery {
    delivered: Mutex<Vec<SyncTask>>,
    attempts: Mutex<Vec<SyncTask>>,
    failing: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
    permanent: AtomicBool,
}

impl MockDelivery {
    /// Creates an endpoint that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every delivery fail (transiently unless `set_permanent` is on).
    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Makes deliveries of one task kind fail.
    pub fn fail_kind(&self, kind: impl Into<String>) {
        self.failing.lock().insert(kind.into());
    }

    /// Makes failures permanent instead of transient.
    pub fn set_permanent(&self, permanent: bool) {
        self.permanent.store(permanent, Ordering::SeqCst);
    }

    /// Successfully delivered tasks, in delivery order.
    pub fn delivered(&self) -> Vec<SyncTask> {
        self.delivered.lock().clone()
    }

    /// Every task handed to `deliver`, successful or not.
    pub fn attempts(&self) -> Vec<SyncTask> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl SyncDelivery for MockDelivery {
    async fn deliver(&self, task: &SyncTask) -> NetResult<()> {
        self.attempts.lock().push(task.clone());

        let fails =
            self.fail_all.load(Ordering::SeqCst) || self.failing.lock().contains(&task.kind);
        if fails {
            return Err(if self.permanent.load(Ordering::SeqCst) {
                NetError::validation(format!("server rejected {}", task.kind))
            } else {
                NetError::timeout(format!("delivery of {} timed out", task.kind))
            });
        }

        self.delivered.lock().push(task.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    #[tokio::test]
    async fn mock_transport_follows_script() {
        let (events, _rx) = broadcast::channel(8);
        let reporter = ProgressReporter::new(RequestId::new(1), events);
        let transport = MockTransport::new().with_payload("payload");
        transport.push_result(Err(NetError::timeout("first call")));

        let request = DataRequest::new("flock_list", Priority::Low);
        assert!(transport.execute(&request, &reporter).await.is_err());
        assert_eq!(
            transport.execute(&request, &reporter).await.unwrap(),
            Bytes::from_static(b"payload")
        );
        assert_eq!(transport.executed().len(), 2);
    }

    #[test]
    fn progress_is_clamped() {
        let (events, mut rx) = broadcast::channel(8);
        let reporter = ProgressReporter::new(RequestId::new(7), events);

        reporter.report(1.7);
        reporter.report(f32::NAN);

        match rx.try_recv().unwrap() {
            RequestEvent::Progress { id, fraction } => {
                assert_eq!(id, RequestId::new(7));
                assert_eq!(fraction, 1.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            RequestEvent::Progress { fraction, .. } if fraction == 0.0
        ));
    }

    #[tokio::test]
    async fn mock_delivery_failures() {
        let delivery = MockDelivery::new();
        delivery.fail_kind("health_record");

        let ok = SyncTask::new("user_profile", b"a".to_vec());
        let bad = SyncTask::new("health_record", b"b".to_vec());
        assert!(delivery.deliver(&ok).await.is_ok());

        let err = delivery.deliver(&bad).await.unwrap_err();
        assert!(err.is_retryable());

        delivery.set_permanent(true);
        let err = delivery.deliver(&bad).await.unwrap_err();
        assert!(err.is_permanent());

        assert_eq!(delivery.delivered(), vec![ok]);
        assert_eq!(delivery.attempts().len(), 3);
    }
}

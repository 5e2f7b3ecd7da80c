//! Throughput measurement and classification.
//!
//! The estimator downloads a small reference payload through a
//! [`BandwidthProbe`], converts the elapsed time into bytes per second and
//! publishes the resulting [`BandwidthLevel`] on a watch channel. Only one
//! probe runs at a time; callers that arrive while a probe is running get
//! the last published level instead of starting another measurement.
//!
//! A probe that straddles a disconnect measures a link that no longer
//! exists, so its sample is dropped. If a probe was requested after the
//! disconnect while the stale one was still running, the stale probe
//! measures again before it finishes.

use crate::config::BandwidthConfig;
use crate::transport::BandwidthProbe;
use crate::types::BandwidthLevel;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Classifies a throughput sample in bytes per second.
pub fn classify(bytes_per_sec: f64, config: &BandwidthConfig) -> BandwidthLevel {
    if bytes_per_sec < config.low_threshold_bps {
        BandwidthLevel::Low
    } else if bytes_per_sec < config.high_threshold_bps {
        BandwidthLevel::Medium
    } else {
        BandwidthLevel::High
    }
}

/// Classifies `bytes` received in `elapsed`. A zero duration is `High`.
pub fn classify_sample(bytes: usize, elapsed: Duration, config: &BandwidthConfig) -> BandwidthLevel {
    if elapsed.is_zero() {
        return BandwidthLevel::High;
    }
    classify(bytes as f64 / elapsed.as_secs_f64(), config)
}

/// Measures achievable throughput and publishes the current level.
pub struct BandwidthEstimator {
    probe: Arc<dyn BandwidthProbe>,
    config: BandwidthConfig,
    level: watch::Sender<BandwidthLevel>,
    probing: AtomicBool,
    // a caller was turned away while a probe was running
    rerun: AtomicBool,
    // bumped by force_low so a probe started before a disconnect cannot
    // overwrite the forced level
    epoch: AtomicU64,
}

impl std::fmt::Debug for BandwidthEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthEstimator")
            .field("level", &self.current())
            .field("probing", &self.is_probing())
            .finish_non_exhaustive()
    }
}

/// Clears the single-flight flag however the probe ends.
struct ProbeGuard<'a>(&'a AtomicBool);

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl BandwidthEstimator {
    /// Creates an estimator starting at `config.initial_level`.
    pub fn new(probe: Arc<dyn BandwidthProbe>, config: BandwidthConfig) -> Self {
        let (level, _) = watch::channel(config.initial_level);
        Self {
            probe,
            config,
            level,
            probing: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    /// The last published level.
    pub fn current(&self) -> BandwidthLevel {
        *self.level.borrow()
    }

    /// Subscribes to level changes.
    pub fn subscribe(&self) -> watch::Receiver<BandwidthLevel> {
        self.level.subscribe()
    }

    /// Returns true while a probe is running.
    pub fn is_probing(&self) -> bool {
        self.probing.load(Ordering::SeqCst)
    }

    /// Drops the level to `Low` without measuring.
    ///
    /// A probe already in flight still completes but its result is not
    /// published.
    pub fn force_low(&self) {
        self.rerun.store(false, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.publish(BandwidthLevel::Low);
    }

    /// Runs one probe and publishes the result.
    ///
    /// Returns the current level without probing if another probe is
    /// already running; that probe measures again if its own sample turns
    /// out to be stale. A failed or timed-out probe yields `Low`.
    pub async fn estimate_once(&self) -> BandwidthLevel {
        loop {
            if self
                .probing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                self.rerun.store(true, Ordering::SeqCst);
                if self.probing.load(Ordering::SeqCst) {
                    debug!("bandwidth probe already running");
                    return self.current();
                }
                // the running probe finished in between
                continue;
            }

            if let Some(level) = self.probe_once().await {
                return level;
            }
            if !self.rerun.swap(false, Ordering::SeqCst) {
                return self.current();
            }
            debug!("probe requested after reconnect, measuring again");
        }
    }

    /// Measures once while holding the single-flight flag. Returns `None`
    /// if the connection was lost during the measurement.
    async fn probe_once(&self) -> Option<BandwidthLevel> {
        let _guard = ProbeGuard(&self.probing);
        self.rerun.store(false, Ordering::SeqCst);

        let epoch = self.epoch.load(Ordering::SeqCst);
        let start = Instant::now();
        let measured =
            match tokio::time::timeout(self.config.probe_timeout, self.probe.fetch_reference())
                .await
            {
                Ok(Ok(bytes)) => {
                    let elapsed = start.elapsed();
                    let level = classify_sample(bytes, elapsed, &self.config);
                    debug!(
                        bytes,
                        elapsed_ms = elapsed.as_millis() as u64,
                        level = %level,
                        "bandwidth probe finished"
                    );
                    level
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "bandwidth probe failed");
                    BandwidthLevel::Low
                }
                Err(_) => {
                    warn!(
                        timeout_ms = self.config.probe_timeout.as_millis() as u64,
                        "bandwidth probe timed out"
                    );
                    BandwidthLevel::Low
                }
            };

        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("connection lost during probe, discarding sample");
            return None;
        }
        self.publish(measured);
        Some(measured)
    }

    /// Starts a probe on the current runtime without waiting for it.
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn spawn_probe(self: &Arc<Self>) -> Option<JoinHandle<BandwidthLevel>> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!("no runtime, skipping bandwidth probe");
                return None;
            }
        };
        let estimator = Arc::clone(self);
        Some(handle.spawn(async move { estimator.estimate_once().await }))
    }

    /// Probes every `config.probe_interval` until `shutdown` is cancelled.
    ///
    /// The first scheduled probe runs one interval after the call.
    pub async fn run_periodic(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.probe_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.estimate_once().await;
                }
            }
        }
        debug!("bandwidth estimator stopped");
    }

    fn publish(&self, level: BandwidthLevel) {
        let changed = self.level.send_if_modified(|current| {
            if *current == level {
                false
            } else {
                *current = level;
                true
            }
        });
        if changed {
            info!(level = %level, "bandwidth level changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockProbe;

    fn estimator(probe: MockProbe) -> Arc<BandwidthEstimator> {
        Arc::new(BandwidthEstimator::new(
            Arc::new(probe),
            BandwidthConfig::default(),
        ))
    }

    #[test]
    fn classify_thresholds() {
        let config = BandwidthConfig::default();
        assert_eq!(classify(0.0, &config), BandwidthLevel::Low);
        assert_eq!(classify(102_399.0, &config), BandwidthLevel::Low);
        assert_eq!(classify(102_400.0, &config), BandwidthLevel::Medium);
        assert_eq!(classify(511_999.0, &config), BandwidthLevel::Medium);
        assert_eq!(classify(512_000.0, &config), BandwidthLevel::High);
    }

    #[test]
    fn zero_elapsed_is_high() {
        let config = BandwidthConfig::default();
        assert_eq!(
            classify_sample(1024, Duration::ZERO, &config),
            BandwidthLevel::High
        );
        assert_eq!(
            classify_sample(1024, Duration::from_millis(100), &config),
            BandwidthLevel::Low
        );
    }

    #[tokio::test(start_paused = true)]
    async fn probe_publishes_level() {
        // 1 KiB in 5 ms is 200 KiB/s
        let estimator = estimator(MockProbe::new(1024, Duration::from_millis(5)));
        let mut rx = estimator.subscribe();
        assert_eq!(*rx.borrow(), BandwidthLevel::Low);

        assert_eq!(estimator.estimate_once().await, BandwidthLevel::Medium);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), BandwidthLevel::Medium);
        assert!(!estimator.is_probing());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_probe_yields_low() {
        let estimator = Arc::new(BandwidthEstimator::new(
            Arc::new(MockProbe::failing()),
            BandwidthConfig::default().with_initial_level(BandwidthLevel::High),
        ));
        assert_eq!(estimator.estimate_once().await, BandwidthLevel::Low);
        assert_eq!(estimator.current(), BandwidthLevel::Low);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_times_out() {
        let estimator = Arc::new(BandwidthEstimator::new(
            Arc::new(MockProbe::new(1024, Duration::from_secs(60))),
            BandwidthConfig::default()
                .with_probe_timeout(Duration::from_secs(10))
                .with_initial_level(BandwidthLevel::Medium),
        ));
        let start = Instant::now();
        assert_eq!(estimator.estimate_once().await, BandwidthLevel::Low);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_probe() {
        let probe = Arc::new(MockProbe::new(1024, Duration::from_millis(1)));
        let estimator = Arc::new(BandwidthEstimator::new(
            Arc::clone(&probe) as Arc<dyn BandwidthProbe>,
            BandwidthConfig::default(),
        ));

        let first = estimator.spawn_probe().unwrap();
        tokio::task::yield_now().await;
        assert!(estimator.is_probing());

        // the second caller gets the current level back immediately
        assert_eq!(estimator.estimate_once().await, BandwidthLevel::Low);

        assert_eq!(first.await.unwrap(), BandwidthLevel::High);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn force_low_discards_in_flight_sample() {
        let estimator = estimator(MockProbe::new(1024, Duration::from_millis(1)));
        let probe = estimator.spawn_probe().unwrap();
        tokio::task::yield_now().await;

        estimator.force_low();
        assert_eq!(probe.await.unwrap(), BandwidthLevel::Low);
        assert_eq!(estimator.current(), BandwidthLevel::Low);
    }

    #[tokio::test(start_paused = true)]
    async fn measures_again_when_reconnect_arrives_mid_measurement() {
        // 1 MiB in 1 s is a High link
        let probe = Arc::new(MockProbe::new(1024 * 1024, Duration::from_secs(1)));
        let estimator = Arc::new(BandwidthEstimator::new(
            Arc::clone(&probe) as Arc<dyn BandwidthProbe>,
            BandwidthConfig::default(),
        ));

        let first = estimator.spawn_probe().unwrap();
        tokio::task::yield_now().await;

        // link drops and comes back while the first probe is still running
        estimator.force_low();
        let second = estimator.spawn_probe().unwrap();
        assert_eq!(second.await.unwrap(), BandwidthLevel::Low);
        assert!(estimator.is_probing());

        assert_eq!(first.await.unwrap(), BandwidthLevel::High);
        assert_eq!(probe.calls(), 2);
        assert_eq!(estimator.current(), BandwidthLevel::High);
        assert!(!estimator.is_probing());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_without_reconnect_measures_once() {
        let probe = Arc::new(MockProbe::new(1024 * 1024, Duration::from_secs(1)));
        let estimator = Arc::new(BandwidthEstimator::new(
            Arc::clone(&probe) as Arc<dyn BandwidthProbe>,
            BandwidthConfig::default(),
        ));

        // a caller turned away before the disconnect does not count
        let first = estimator.spawn_probe().unwrap();
        tokio::task::yield_now().await;
        estimator.estimate_once().await;
        estimator.force_low();

        assert_eq!(first.await.unwrap(), BandwidthLevel::Low);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_probe_until_shutdown() {
        let probe = Arc::new(MockProbe::new(1024, Duration::ZERO));
        let estimator = Arc::new(BandwidthEstimator::new(
            Arc::clone(&probe) as Arc<dyn BandwidthProbe>,
            BandwidthConfig::default().with_probe_interval(Duration::from_secs(60)),
        ));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&estimator).run_periodic(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(probe.calls(), 2);
        assert_eq!(estimator.current(), BandwidthLevel::High);

        shutdown.cancel();
        task.await.unwrap();
    }
}

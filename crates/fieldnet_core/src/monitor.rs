//! Connectivity observation.

use crate::bandwidth::BandwidthEstimator;
use crate::types::{ConnectionTier, NetworkStatus};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// What a connectivity report changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Identical to the previous report.
    Unchanged,
    /// Reachable to unreachable.
    Lost,
    /// Unreachable to reachable.
    Restored,
    /// Same reachability, different transport class.
    TierChanged,
}

/// Publishes the latest [`NetworkStatus`] to every component.
///
/// The platform feeds observations through [`NetworkMonitor::report`].
/// Losing the connection drops the bandwidth level to `Low` before the new
/// status becomes visible; regaining it starts a background probe.
#[derive(Debug)]
pub struct NetworkMonitor {
    status: watch::Sender<NetworkStatus>,
    estimator: Arc<BandwidthEstimator>,
}

impl NetworkMonitor {
    /// Creates a monitor in the `{Unknown, unreachable}` state.
    pub fn new(estimator: Arc<BandwidthEstimator>) -> Self {
        let (status, _) = watch::channel(NetworkStatus::unknown());
        Self { status, estimator }
    }

    /// Subscribes to status changes. The receiver always holds the latest
    /// snapshot.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    /// Current snapshot.
    pub fn status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    /// Whether the server is currently reachable.
    pub fn is_reachable(&self) -> bool {
        self.status().reachable
    }

    /// Records an observation from the platform.
    pub fn report(&self, tier: ConnectionTier, reachable: bool) -> Transition {
        let next = NetworkStatus::new(tier, reachable);
        let mut transition = Transition::Unchanged;

        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            transition = match (current.reachable, next.reachable) {
                (true, false) => Transition::Lost,
                (false, true) => Transition::Restored,
                _ => Transition::TierChanged,
            };
            if transition == Transition::Lost {
                self.estimator.force_low();
            }
            *current = next;
            true
        });

        match transition {
            Transition::Unchanged => {}
            Transition::Lost => {
                info!(tier = %tier, "connection lost");
            }
            Transition::Restored => {
                info!(tier = %tier, "connection restored");
                self.estimator.spawn_probe();
            }
            Transition::TierChanged => {
                debug!(tier = %tier, reachable, "connection tier changed");
                if reachable {
                    self.estimator.spawn_probe();
                }
            }
        }
        transition
    }
}

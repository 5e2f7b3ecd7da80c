//! Bounded exponential-backoff retry.

use crate::config::RetryConfig;
use crate::error::{NetError, NetResult};
use std::future::Future;
use tracing::{debug, warn};

/// Runs an operation until it succeeds, fails permanently, or runs out of
/// attempts.
///
/// After failed attempt `k` (0-indexed) the executor sleeps
/// `base_delay * 2^k` before attempt `k + 1`; there is no sleep after the
/// final attempt. Only [`NetError::is_retryable`] errors are retried, so a
/// request that can never succeed does not burn a scarce link.
///
/// The executor does not know what the operation does; the request queue
/// and the sync scheduler share it.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Creates an executor with the given backoff configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the backoff configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation` with the configured default attempt count.
    pub async fn run_default<T, F, Fut>(&self, operation: F) -> NetResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = NetResult<T>>,
    {
        self.run(self.config.max_attempts, operation).await
    }

    /// Runs `operation` at most `max_attempts` times (at least once).
    ///
    /// The operation receives the 0-indexed attempt number.
    ///
    /// # Errors
    ///
    /// - the first non-retryable error, unchanged
    /// - [`NetError::RetriesExhausted`] wrapping the last error once every
    ///   attempt has failed
    pub async fn run<T, F, Fut>(&self, max_attempts: u32, mut operation: F) -> NetResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = NetResult<T>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let err = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(attempt = attempt + 1, error = %err, "non-retryable failure");
                return Err(err);
            }

            if attempt + 1 >= max_attempts {
                warn!(attempts = max_attempts, error = %err, "retries exhausted");
                return Err(NetError::RetriesExhausted {
                    attempts: max_attempts,
                    last: Box::new(err),
                });
            }

            let delay = self.config.delay_for_attempt(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PermanentKind, TransientKind};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn executor() -> RetryExecutor {
        RetryExecutor::new(RetryConfig::new(5).with_base_delay(Duration::from_millis(100)))
    }

    #[tokio::test(start_paused = true)]
    async fn always_transient_uses_every_attempt() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&stamps);

        let result: NetResult<()> = executor()
            .run(4, |_| {
                let recorded = Arc::clone(&recorded);
                async move {
                    recorded.lock().push(Instant::now());
                    Err(NetError::transient(TransientKind::Io, "reset by peer"))
                }
            })
            .await;

        match result {
            Err(NetError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert!(last.is_retryable());
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }

        let stamps = stamps.lock();
        assert_eq!(stamps.len(), 4);
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_stops_immediately() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        let start = Instant::now();

        let result: NetResult<()> = executor()
            .run(4, |_| {
                let counter = Arc::clone(&counter);
                async move {
                    *counter.lock() += 1;
                    Err(NetError::permanent(PermanentKind::Unauthorized, "token expired"))
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(NetError::Permanent {
                kind: PermanentKind::Unauthorized,
                ..
            })
        ));
        assert_eq!(*calls.lock(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let value = executor()
            .run(5, |attempt| async move {
                if attempt < 2 {
                    Err(NetError::timeout("slow"))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_runs_once() {
        let start = Instant::now();
        let result: NetResult<()> = executor()
            .run(0, |_| async { Err(NetError::timeout("down")) })
            .await;

        assert!(matches!(
            result,
            Err(NetError::RetriesExhausted { attempts: 1, .. })
        ));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn run_default_uses_configured_attempts() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        let executor = RetryExecutor::new(
            RetryConfig::new(3).with_base_delay(Duration::from_millis(10)),
        );

        let _ = executor
            .run_default(|_| {
                let counter = Arc::clone(&counter);
                async move {
                    *counter.lock() += 1;
                    Err::<(), _>(NetError::timeout("down"))
                }
            })
            .await;

        assert_eq!(*calls.lock(), 3);
    }
}

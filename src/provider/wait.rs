//! Readiness polling with exponential backoff and cancellation.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PollConfig;
use crate::error::{ApplyError, Result};

/// Backoff settings for one wait.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitConfig {
    /// Delay before the second check.
    pub initial_delay: Duration,
    /// Cap for the exponential growth.
    pub max_delay: Duration,
    /// Upper bound on the total wait.
    pub timeout: Duration,
    /// Extra random fraction added to each delay, between 0 and 1.
    pub jitter: f64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl WaitConfig {
    /// Builds the backoff for a wait bounded by `timeout`.
    #[must_use]
    pub fn from_poll(poll: &PollConfig, timeout: Duration) -> Self {
        Self {
            initial_delay: poll.initial_delay(),
            max_delay: poll.max_delay(),
            timeout,
            jitter: poll.jitter.clamp(0.0, 1.0),
        }
    }

    /// Returns a copy with a different timeout.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }
}

/// Polls `check` until it yields a value, the timeout passes or `cancel` fires.
///
/// `check` returns `Ok(Some(_))` when settled and `Ok(None)` to keep
/// waiting. Retryable errors are logged and polled through; any other error
/// ends the wait.
///
/// # Errors
///
/// Returns [`ApplyError::Timeout`] naming `resource` and `expected_state`,
/// [`ApplyError::Cancelled`], or the first non-retryable error of `check`.
pub async fn wait_until<T, F, Fut>(
    config: &WaitConfig,
    cancel: &CancellationToken,
    resource: &str,
    expected_state: &str,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    let deadline = start + config.timeout;
    let mut delay = config.initial_delay;
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        if cancel.is_cancelled() {
            return Err(cancelled(resource));
        }

        match check().await {
            Ok(Some(value)) => {
                debug!(resource, attempts, elapsed_ms = start.elapsed().as_millis(), "Reached {expected_state}");
                return Ok(value);
            }
            Ok(None) => {}
            Err(e) if e.is_retryable() => {
                warn!(resource, attempt = attempts, error = %e, "Readiness check failed, retrying");
            }
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ApplyError::Timeout {
                resource: resource.to_string(),
                expected_state: expected_state.to_string(),
                waited_secs: start.elapsed().as_secs(),
            }
            .into());
        }

        let sleep_for = jittered_delay(delay, config.jitter).min(deadline - now);
        debug!(resource, attempt = attempts, delay_ms = sleep_for.as_millis(), "Not {expected_state} yet");

        tokio::select! {
            () = tokio::time::sleep(sleep_for) => {}
            () = cancel.cancelled() => return Err(cancelled(resource)),
        }

        delay = (delay * 2).min(config.max_delay);
    }
}

fn cancelled(resource: &str) -> crate::error::TierformError {
    ApplyError::Cancelled {
        resource: resource.to_string(),
    }
    .into()
}

/// Adds up to `jitter_factor` of `base` at random.
fn jittered_delay(base: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0.0..jitter_factor);
    Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProviderError, TierformError};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(timeout: Duration) -> WaitConfig {
        WaitConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            timeout,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_settles_immediately() {
        let cancel = CancellationToken::new();
        let value = tokio_test::block_on(wait_until(&fast(Duration::from_secs(1)), &cancel, "vpc", "ready", || async {
            Ok(Some(7))
        }));
        assert_eq!(tokio_test::assert_ok!(value), 7);
    }

    #[tokio::test]
    async fn test_retries_until_settled() {
        let counter = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result = wait_until(&fast(Duration::from_secs(5)), &cancel, "db", "ready", || {
            let c = Arc::clone(&counter);
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                Ok((n >= 2).then_some(n))
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_names_resource() {
        let cancel = CancellationToken::new();
        let err = wait_until(&fast(Duration::from_millis(40)), &cancel, "cache", "ready", || async {
            Ok::<Option<()>, TierformError>(None)
        })
        .await
        .unwrap_err();

        match err {
            TierformError::Apply(ApplyError::Timeout { resource, expected_state, .. }) => {
                assert_eq!(resource, "cache");
                assert_eq!(expected_state, "ready");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = wait_until(&fast(Duration::from_secs(10)), &cancel, "asg", "ready", || async {
            Ok::<Option<()>, TierformError>(None)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TierformError::Apply(ApplyError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_retryable_errors_polled_through() {
        let counter = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result = wait_until(&fast(Duration::from_secs(5)), &cancel, "lb", "ready", || {
            let c = Arc::clone(&counter);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProviderError::network("connection reset").into())
                } else {
                    Ok(Some(()))
                }
            }
        })
        .await;
        assert!(result.is_ok());

        let fatal = wait_until(&fast(Duration::from_secs(5)), &cancel, "lb", "ready", || async {
            Err::<Option<()>, _>(ProviderError::rejected("lb", 400, "bad").into())
        })
        .await;
        assert!(fatal.is_err());
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(100);
        assert_eq!(jittered_delay(base, 0.0), base);
        for _ in 0..50 {
            let d = jittered_delay(base, 0.5);
            assert!(d >= base && d < Duration::from_millis(150));
        }
    }

    #[test]
    fn test_from_poll() {
        let config = WaitConfig::from_poll(&PollConfig::default(), Duration::from_secs(120));
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.timeout, Duration::from_secs(120));
    }
}

use std::future::Future;
use std::time::Duration;

use tokio::signal;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Jitter applied to each backoff delay (±20%).
const BACKOFF_JITTER_PERCENT: f64 = 0.2;

/// Floor for any backoff delay.
const MIN_RETRY_DELAY_MS: u64 = 100;

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is a critical
/// initialization failure that should halt the application.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
                panic!("Critical: cannot install Ctrl+C signal handler");
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                panic!("Critical: cannot install SIGTERM signal handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

/// Random value in `[0.0, 1.0)`.
pub fn rand_jitter() -> f64 {
    use rand::Rng;
    rand::rng().random::<f64>()
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at `max`, with jitter and a 100ms floor.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let delay_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        .min(max.as_millis() as u64);

    let jitter = (delay_ms as f64 * BACKOFF_JITTER_PERCENT * (rand_jitter() * 2.0 - 1.0)) as i64;
    let final_delay = (delay_ms as i64 + jitter).max(MIN_RETRY_DELAY_MS as i64) as u64;

    Duration::from_millis(final_delay)
}

/// Run `operation` up to `max_attempts` times with exponential backoff,
/// returning the first success or the last error.
pub async fn retry_with_backoff<T, E, F, Fut>(
    what: &str,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(what, attempt, "Connected after retrying");
                }
                return Ok(value);
            }
            Err(e) if attempt < max_attempts => {
                let delay = backoff_delay(attempt, base_delay, max_delay);
                warn!(
                    what,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Connection attempt failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(what, attempts = attempt, error = %e, "Giving up after repeated failures");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_rand_jitter_returns_value_in_range() {
        for _ in 0..1000 {
            let jitter = rand_jitter();
            assert!((0.0..1.0).contains(&jitter));
        }
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(10);

        let first = backoff_delay(1, base, max).as_millis();
        assert!((400..=600).contains(&first), "first delay {first}");

        let third = backoff_delay(3, base, max).as_millis();
        assert!((1600..=2400).contains(&third), "third delay {third}");

        let capped = backoff_delay(30, base, max).as_millis();
        assert!(capped <= 12_000, "capped delay {capped}");
    }

    #[test]
    fn test_backoff_delay_floor() {
        let delay = backoff_delay(1, Duration::ZERO, Duration::ZERO);
        assert_eq!(delay, Duration::from_millis(MIN_RETRY_DELAY_MS));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, String> = retry_with_backoff(
            "test",
            5,
            Duration::from_millis(1),
            Duration::from_millis(1),
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("attempt {n}")) } else { Ok(n) }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> = retry_with_backoff(
            "test",
            2,
            Duration::from_millis(1),
            Duration::from_millis(1),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), "down");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}

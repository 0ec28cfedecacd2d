use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::time::Duration;
use tracing::{debug, warn};

fn sink_policy(base_delay_ms: u64) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: Duration::from_millis(base_delay_ms),
        initial_interval: Duration::from_millis(base_delay_ms),
        randomization_factor: 0.3,
        multiplier: 2.0,
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Retry `op` up to `attempts` times with jittered exponential delays.
///
/// Intended for sink writes only; fetch and authenticate calls fail soft and
/// wait for the next poll cycle instead of retrying in-cycle.
pub async fn retry_bounded<F, Fut, T, E>(
    op: F,
    attempts: u32,
    base_delay_ms: u64,
    what: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut policy = sink_policy(base_delay_ms);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = what, attempt, "succeeded after retries");
                }
                return Ok(value);
            }
            Err(error) if attempt >= attempts => {
                warn!(operation = what, attempt, error = %error, "giving up");
                return Err(error);
            }
            Err(error) => {
                let delay = policy
                    .next_backoff()
                    .unwrap_or_else(|| Duration::from_millis(base_delay_ms));
                warn!(
                    operation = what,
                    attempt,
                    retry_after_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

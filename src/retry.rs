//! Bounded retry with a fixed delay between attempts

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Run `op` up to `attempts` times, sleeping `delay` between failures
///
/// Returns the first success, or the error from the last attempt once all
/// attempts are used up. The delay never grows between attempts. With
/// `attempts == 0` the operation still runs exactly once.
///
/// Once `cancel` fires no further attempt starts; the error from the
/// attempt that already ran is returned.
pub async fn run<T, E, F, Fut>(
    mut op: F,
    attempts: u32,
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("Operation succeeded on attempt {}/{}", attempt, max_attempts);
                }
                return Ok(value);
            }
            Err(e) if attempt >= max_attempts => {
                debug!("Operation failed after {} attempt(s): {}", attempt, e);
                return Err(e);
            }
            Err(e) if cancel.is_cancelled() => {
                debug!("Operation cancelled after attempt {}: {}", attempt, e);
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "Operation failed (attempt {}/{}), retrying after {:?}: {}",
                    attempt, max_attempts, delay, e
                );
                attempt += 1;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Operation cancelled while waiting to retry: {}", e);
                        return Err(e);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

//! Fixed-interval retry for transient agent failures.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

/// Run `op` until it succeeds, sleeping `wait` between attempts.
///
/// Returns `None` when `shutdown` fires (or its sender is gone) before an
/// attempt succeeds.
pub async fn retry_until<T, E, F, Fut>(
    shutdown: &mut watch::Receiver<bool>,
    wait: Duration,
    mut op: F,
) -> Option<T>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    loop {
        if *shutdown.borrow() {
            return None;
        }
        tokio::select! {
            _ = shutdown.changed() => return None,
            result = op() => match result {
                Ok(value) => return Some(value),
                Err(e) => warn!(error = %e, wait = ?wait, "request failed, will retry"),
            },
        }
        tokio::select! {
            _ = shutdown.changed() => return None,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

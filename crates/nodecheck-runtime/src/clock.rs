use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Source of wall-clock time and delays for the reconcile loop
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by the system time and the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Residual delay needed to hold a cadence of `interval`.
///
/// Returns `None` when the work already took the whole interval, in which case
/// the next tick starts immediately.
pub fn residual_delay(
    interval: Duration,
    started: DateTime<Utc>,
    finished: DateTime<Utc>,
) -> Option<Duration> {
    let took = (finished - started).to_std().unwrap_or(Duration::ZERO);
    match interval.checked_sub(took) {
        Some(remaining) if !remaining.is_zero() => Some(remaining),
        _ => None,
    }
}

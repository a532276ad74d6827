//! Time provider abstraction.
//!
//! Every wait in the runtime (probe intervals, RPC timeouts, retry backoff,
//! reminder ticks) goes through [`TimeProvider`] so a test can drive the
//! whole cluster on tokio's paused clock.

use std::cell::Cell;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during time operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The operation timed out.
    #[error("operation timed out")]
    Elapsed,
}

/// Provider trait for time operations.
///
/// Two clocks:
///
/// - `now()` is monotonic and local to the provider. Use it for deadlines
///   and durations measured inside one process.
/// - `timer()` is wall-clock time since the UNIX epoch. Anything written to
///   a shared table and read back by another silo (heartbeats, suspicion
///   votes, reminder start times) uses it, since `now()` values from two
///   processes share no origin.
#[async_trait(?Send)]
pub trait TimeProvider {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Current time since the provider's epoch.
    fn now(&self) -> Duration;

    /// Wall-clock time since the UNIX epoch.
    fn timer(&self) -> Duration;
}

/// Run `future`, giving up after `duration`.
///
/// Returns `Err(TimeError::Elapsed)` if the sleep on `time` finishes first.
pub async fn timeout<F>(
    time: &dyn TimeProvider,
    duration: Duration,
    future: F,
) -> Result<F::Output, TimeError>
where
    F: Future,
{
    tokio::select! {
        biased;
        output = future => Ok(output),
        _ = time.sleep(duration) => Err(TimeError::Elapsed),
    }
}

/// Real time provider using Tokio's time facilities.
///
/// Uses `tokio::time::Instant`, so it follows the paused clock in tests.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start_time: tokio::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn timer(&self) -> Duration {
        wall_clock()
    }
}

thread_local! {
    /// Last wall-clock reading and the tokio instant it was taken at.
    static WALL_ANCHOR: Cell<Option<(tokio::time::Instant, Duration)>> = const { Cell::new(None) };
}

/// Wall-clock time advanced by tokio's clock.
///
/// The first reading on a thread comes from [`SystemTime`]; later readings
/// add the tokio time elapsed since, so a paused test clock moves the wall
/// clock too and every provider on the thread reads the same value. The
/// result never goes backwards.
fn wall_clock() -> Duration {
    let now = tokio::time::Instant::now();
    WALL_ANCHOR.with(|anchor| {
        let wall = match anchor.get() {
            Some((at, wall)) => wall + now.saturating_duration_since(at),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default(),
        };
        anchor.set(Some((now, wall)));
        wall
    })
}

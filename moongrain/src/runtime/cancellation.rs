//! Cooperative cancellation for grain calls.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use tokio::sync::Notify;

#[derive(Default)]
struct CancelState {
    cancelled: Cell<bool>,
    notify: Notify,
}

/// Token a caller passes along with a grain call to request cancellation.
///
/// Cancellation is cooperative: a request still queued when the token fires
/// fails with [`GrainError::Cancelled`](crate::error::GrainError::Cancelled)
/// instead of running, and a running handler may poll
/// [`is_cancelled`](Self::is_cancelled) or await
/// [`cancelled`](Self::cancelled) between steps. Nothing is preempted.
#[derive(Clone, Default)]
pub struct GrainCancellationToken {
    state: Rc<CancelState>,
}

impl fmt::Debug for GrainCancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrainCancellationToken")
            .field("cancelled", &self.state.cancelled.get())
            .finish()
    }
}

impl GrainCancellationToken {
    /// New, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.state.cancelled.replace(true) {
            self.state.notify.notify_waiters();
        }
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.get()
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wakes_waiter() {
        let token = GrainCancellationToken::new();
        let clone = token.clone();

        let waiter = async {
            clone.cancelled().await;
            true
        };
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            token.cancel();
        };
        let (woke, ()) = tokio::join!(waiter, canceller);

        assert!(woke);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_returns_immediately() {
        let token = GrainCancellationToken::new();
        token.cancel();
        token.cancel();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }
}

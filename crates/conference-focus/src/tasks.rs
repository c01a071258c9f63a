//! Task pools and timeout primitives.
//!
//! The focus runs blocking-ish collaborator calls (bridge allocation, room
//! joins, IQ round-trips, invite runners) on a semaphore-bounded spawn
//! wrapper, and drives its timeouts as cancelable one-shot tasks that post
//! a message back to the owning mailbox.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bounded pool for I/O-bound work.
///
/// Tasks are spawned on the shared runtime; the semaphore bounds how many
/// run concurrently. The semaphore is never closed.
#[derive(Clone)]
pub struct IoPool {
    permits: Arc<Semaphore>,
}

impl IoPool {
    /// Create a pool allowing `limit` concurrent tasks.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Spawn a future; it waits for a permit before running.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            fut.await
        })
    }

    /// Permits currently available; mostly useful in tests.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// A cancelable one-shot timeout that posts `message` to `mailbox` on
/// expiry.
///
/// Canceling is always safe, including after the timer fired or from the
/// handler of the very message it posted. Dropping the handle cancels the
/// timer, which makes re-arming a simple field assignment.
pub struct ScheduledTimeout {
    token: CancellationToken,
}

impl ScheduledTimeout {
    /// Arm a timeout.
    pub fn schedule<M: Send + 'static>(
        delay: Duration,
        mailbox: mpsc::Sender<M>,
        message: M,
    ) -> Self {
        let token = CancellationToken::new();
        let fired = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = fired.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = mailbox.send(message).await;
                }
            }
        });
        Self { token }
    }

    /// Cancel the timeout. A message already in flight may still be
    /// delivered; handlers must tolerate a stale fire.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for ScheduledTimeout {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once() {
        let (tx, mut rx) = mpsc::channel::<&'static str>(4);
        let _timeout = ScheduledTimeout::schedule(Duration::from_secs(5), tx, "fired");

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some("fired"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancel_suppresses_fire() {
        let (tx, mut rx) = mpsc::channel::<&'static str>(4);
        let timeout = ScheduledTimeout::schedule(Duration::from_secs(5), tx, "fired");

        timeout.cancel();
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let (tx, mut rx) = mpsc::channel::<&'static str>(4);
        drop(ScheduledTimeout::schedule(Duration::from_secs(1), tx, "fired"));

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_io_pool_bounds_concurrency() {
        let pool = IoPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Cooperative stop signal shared by the producer, workers and the metrics
/// emitter. Clones observe the same flag, and once set it stays set.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    stopped: AtomicBool,
    wake: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every task parked in [`cancelled`](Self::cancelled).
    /// Returns `false` if the token was already cancelled.
    pub fn cancel(&self) -> bool {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shared.wake.notify_waiters();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        let woken = self.shared.wake.notified();
        tokio::pin!(woken);
        // Registered before the flag is read: a cancel landing after the
        // read still wakes this waiter.
        woken.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        woken.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::poll;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_waiter_parked_before_cancel_is_woken() {
        let token = ShutdownToken::new();
        let waiter = token.cancelled();
        tokio::pin!(waiter);

        // First poll reads the flag as unset and parks.
        assert!(poll!(waiter.as_mut()).is_pending());
        assert!(token.clone().cancel());
        assert!(poll!(waiter.as_mut()).is_ready());
    }

    #[tokio::test]
    async fn test_cancel_is_sticky_and_reported_once() {
        let token = ShutdownToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());

        assert!(token.cancel());
        assert!(!observer.cancel());
        assert!(observer.is_cancelled());
        assert!(poll!(Box::pin(observer.cancelled())).is_ready());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cancel_never_strands_a_waiter() {
        for _ in 0..200 {
            let token = ShutdownToken::new();
            let waiters: Vec<_> = (0..3)
                .map(|_| {
                    let token = token.clone();
                    tokio::spawn(async move { token.cancelled().await })
                })
                .collect();
            let canceller = tokio::spawn(async move { token.cancel() });

            let joined = timeout(
                Duration::from_secs(5),
                futures::future::join_all(waiters),
            )
            .await
            .expect("a waiter missed the cancellation");
            assert!(joined.into_iter().all(|r| r.is_ok()));
            assert!(canceller.await.unwrap());
        }
    }
}

//! # Burst Valve
//!
//! Bounds how many requests may be in flight (sent but not yet received)
//! across the whole run. The valve is a fixed pool of `burst_limit` tokens
//! backed by a `tokio::sync::Semaphore`.
//!
//! A token is a [`BurstToken`] value: acquiring one takes a permit out of the
//! pool and dropping it puts the permit back. Because the token is moved
//! (never copied) from the sender to the receiver inside a round-trip record,
//! a token can only be released once, by whoever ends up owning it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::warn;

/// Global in-flight limiter shared by every sender task
#[derive(Debug, Clone)]
pub struct BurstValve {
    permits: Option<Arc<Semaphore>>,
    capacity: usize,
    stall_interval: Duration,
}

/// One acquired unit of burst capacity, released on drop
#[derive(Debug)]
#[must_use = "dropping a burst token releases it immediately"]
pub struct BurstToken {
    _permit: Option<OwnedSemaphorePermit>,
}

impl BurstToken {
    /// A token that holds no capacity, used when the valve is disabled
    pub fn unmetered() -> Self {
        Self { _permit: None }
    }

    /// Return the token to the valve
    pub fn release(self) {}
}

impl BurstValve {
    /// Create a valve with `burst_limit` tokens; a limit of 0 disables it
    pub fn new(burst_limit: usize) -> Self {
        Self::with_stall_interval(burst_limit, crate::defaults::STALL_WARNING_INTERVAL)
    }

    pub fn with_stall_interval(burst_limit: usize, stall_interval: Duration) -> Self {
        let permits = (burst_limit > 0).then(|| Arc::new(Semaphore::new(burst_limit)));
        Self {
            permits,
            capacity: burst_limit,
            stall_interval,
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn is_enabled(&self) -> bool {
        self.permits.is_some()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens currently available, or `None` for a disabled valve
    pub fn available(&self) -> Option<usize> {
        self.permits.as_ref().map(|p| p.available_permits())
    }

    /// Wait for a token
    ///
    /// Never fails: every `stall_interval` spent waiting is logged and the
    /// wait resumes, so a slow receiver throttles the run instead of
    /// aborting it.
    pub async fn acquire(&self) -> BurstToken {
        let Some(permits) = &self.permits else {
            return BurstToken::unmetered();
        };

        loop {
            match timeout(self.stall_interval, Arc::clone(permits).acquire_owned()).await {
                Ok(Ok(permit)) => {
                    return BurstToken {
                        _permit: Some(permit),
                    }
                }
                Ok(Err(_)) => {
                    // The semaphore is never closed while the valve is alive.
                    warn!("burst valve closed, continuing unthrottled");
                    return BurstToken::unmetered();
                }
                Err(_) => warn!(
                    "blocked on send/recv valve (all {} tokens outstanding)",
                    self.capacity
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_disabled_valve_never_blocks() {
        let valve = BurstValve::disabled();
        assert!(!valve.is_enabled());
        assert_eq!(valve.available(), None);

        let tokens: Vec<_> = acquire_many(&valve, 1000).await;
        assert_eq!(tokens.len(), 1000);
    }

    async fn acquire_many(valve: &BurstValve, n: usize) -> Vec<BurstToken> {
        let mut tokens = Vec::with_capacity(n);
        for _ in 0..n {
            tokens.push(valve.acquire().await);
        }
        tokens
    }

    #[tokio::test]
    async fn test_release_returns_capacity() {
        let valve = BurstValve::new(2);
        let first = valve.acquire().await;
        let second = valve.acquire().await;
        assert_eq!(valve.available(), Some(0));

        first.release();
        assert_eq!(valve.available(), Some(1));
        drop(second);
        assert_eq!(valve.available(), Some(2));
    }

    #[tokio::test]
    async fn test_acquire_waits_past_stall_interval() {
        let valve = BurstValve::with_stall_interval(1, Duration::from_millis(10));
        let held = valve.acquire().await;

        let waiter = {
            let valve = valve.clone();
            tokio::spawn(async move { valve.acquire().await })
        };

        // Several stall intervals elapse; the waiter must still be parked.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        held.release();
        let token = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resume after release")
            .unwrap();
        assert_eq!(valve.available(), Some(0));
        drop(token);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stalled_acquire_logs_warning() {
        let valve = BurstValve::with_stall_interval(2, Duration::from_millis(10));
        let _held = acquire_many(&valve, 2).await;

        let waited = tokio::time::timeout(Duration::from_millis(50), valve.acquire()).await;
        assert!(waited.is_err());
        assert!(logs_contain("blocked on send/recv valve"));
        assert!(logs_contain("all 2 tokens outstanding"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_outstanding_tokens_never_exceed_limit() {
        const LIMIT: usize = 5;
        let valve = BurstValve::new(LIMIT);
        let outstanding = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let valve = valve.clone();
                let outstanding = Arc::clone(&outstanding);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    for _ in 0..200 {
                        let token = valve.acquire().await;
                        let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        outstanding.fetch_sub(1, Ordering::SeqCst);
                        token.release();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= LIMIT);
        assert_eq!(valve.available(), Some(LIMIT));
    }
}

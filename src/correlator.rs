//! # Round-Trip Correlator
//!
//! Pairs asynchronous sends with their matching receives. The sender task
//! starts a [`RoundTrip`] right before each wire send and pushes it once the
//! send succeeded; the receiver task pops the oldest one and then waits for
//! its response. Because a stream delivers responses in request order and
//! only successful sends are queued, FIFO order on the queue is exactly the
//! pairing order.
//!
//! One correlator is created per stream, with a single producer (the stream's
//! sender task) and a single consumer (its receiver task), so the pairing
//! never depends on how other streams interleave.
//!
//! Both halves wait indefinitely on a full or empty queue, logging a warning
//! every stall interval. A stalled queue is a liveness signal for the
//! operator, not an error.

use crate::valve::BurstToken;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::time::timeout;
use tracing::warn;

/// Errors surfaced by the correlator
#[derive(Debug, Error)]
pub enum CorrelatorError {
    /// The receiving half was dropped, so no more round trips can be claimed
    #[error("round-trip receiver for stream {0} has exited")]
    ReceiverGone(usize),
}

/// Correlation record for one in-flight request
///
/// Carries the send timestamp and the burst token acquired for the request.
/// Completing the round trip consumes it, which releases the token.
#[derive(Debug)]
pub struct RoundTrip {
    start: Instant,
    token: BurstToken,
}

impl RoundTrip {
    /// Start a round trip now, holding `token` until it completes
    pub fn start(token: BurstToken) -> Self {
        Self {
            start: Instant::now(),
            token,
        }
    }

    pub fn started_at(&self) -> Instant {
        self.start
    }

    /// Finish the round trip, returning its latency and releasing its token
    pub fn complete(self) -> Duration {
        let elapsed = self.start.elapsed();
        self.token.release();
        elapsed
    }
}

/// Create the two halves of a correlator for stream `stream_id`
pub fn correlator(
    stream_id: usize,
    capacity: usize,
    stall_interval: Duration,
) -> (RoundTripSender, RoundTripReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        RoundTripSender {
            stream_id,
            tx,
            stall_interval,
        },
        RoundTripReceiver {
            stream_id,
            rx,
            stall_interval,
        },
    )
}

/// Producer half, owned by a stream's sender task
#[derive(Debug)]
pub struct RoundTripSender {
    stream_id: usize,
    tx: mpsc::Sender<RoundTrip>,
    stall_interval: Duration,
}

impl RoundTripSender {
    /// Enqueue a round trip, waiting while the queue is full
    pub async fn push(&self, mut round_trip: RoundTrip) -> Result<(), CorrelatorError> {
        loop {
            match self.tx.send_timeout(round_trip, self.stall_interval).await {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => {
                    warn!("blocked on send round trips (stream {})", self.stream_id);
                    round_trip = returned;
                }
                Err(SendTimeoutError::Closed(_)) => {
                    return Err(CorrelatorError::ReceiverGone(self.stream_id))
                }
            }
        }
    }
}

/// Consumer half, owned by a stream's receiver task
#[derive(Debug)]
pub struct RoundTripReceiver {
    stream_id: usize,
    rx: mpsc::Receiver<RoundTrip>,
    stall_interval: Duration,
}

impl RoundTripReceiver {
    /// Claim the oldest unclaimed round trip, waiting while the queue is empty
    ///
    /// Returns `None` once the sender half is gone and the queue is drained.
    pub async fn pop(&mut self) -> Option<RoundTrip> {
        loop {
            match timeout(self.stall_interval, self.rx.recv()).await {
                Ok(next) => return next,
                Err(_) => warn!("blocked on recv round trips (stream {})", self.stream_id),
            }
        }
    }

    /// Number of round trips currently waiting to be claimed
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const STALL: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_pop_returns_push_order_exactly_once() {
        let (tx, mut rx) = correlator(0, 1024, STALL);
        let mut starts = Vec::new();
        for _ in 0..500 {
            let rt = RoundTrip::start(BurstToken::unmetered());
            starts.push(rt.started_at());
            tx.push(rt).await.unwrap();
        }
        drop(tx);

        let mut popped = Vec::new();
        while let Some(rt) = rx.pop().await {
            popped.push(rt.started_at());
        }
        assert_eq!(popped, starts);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_pairing_preserves_order() {
        // A small queue forces the producer to block on a full queue.
        let (tx, mut rx) = correlator(7, 8, STALL);

        let producer = tokio::spawn(async move {
            let mut starts = Vec::new();
            for _ in 0..2_000 {
                let rt = RoundTrip::start(BurstToken::unmetered());
                starts.push(rt.started_at());
                tx.push(rt).await.unwrap();
            }
            starts
        });
        let consumer = tokio::spawn(async move {
            let mut popped = Vec::new();
            while let Some(rt) = rx.pop().await {
                popped.push(rt.started_at());
            }
            popped
        });

        let starts = producer.await.unwrap();
        let popped = consumer.await.unwrap();
        assert_eq!(popped.len(), 2_000);
        assert_eq!(popped, starts);
    }

    #[tokio::test]
    async fn test_pop_keeps_waiting_on_empty_queue() {
        let (tx, mut rx) = correlator(1, 4, STALL);
        let round_trip = RoundTrip::start(BurstToken::unmetered());
        let consumer = tokio::spawn(async move { rx.pop().await.map(RoundTrip::complete) });

        tokio::time::sleep(STALL * 5).await;
        assert!(!consumer.is_finished());

        tx.push(round_trip).await.unwrap();
        let elapsed = consumer.await.unwrap().expect("round trip after stall");
        assert!(elapsed >= STALL * 5);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stalled_pop_logs_warning() {
        let (_tx, mut rx) = correlator(4, 4, STALL);

        let popped = tokio::time::timeout(STALL * 5, rx.pop()).await;
        assert!(popped.is_err());
        assert!(logs_contain("blocked on recv round trips (stream 4)"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stalled_push_logs_warning() {
        let (tx, rx) = correlator(5, 1, STALL);
        tx.push(RoundTrip::start(BurstToken::unmetered()))
            .await
            .unwrap();

        let pushed =
            tokio::time::timeout(STALL * 5, tx.push(RoundTrip::start(BurstToken::unmetered())))
                .await;
        assert!(pushed.is_err());
        assert!(logs_contain("blocked on send round trips (stream 5)"));
        assert_eq!(rx.pending(), 1);
    }

    #[tokio::test]
    async fn test_push_fails_once_receiver_is_gone() {
        let (tx, rx) = correlator(3, 4, STALL);
        drop(rx);
        let err = tx
            .push(RoundTrip::start(BurstToken::unmetered()))
            .await
            .unwrap_err();
        assert!(matches!(err, CorrelatorError::ReceiverGone(3)));
    }

    #[tokio::test]
    async fn test_completing_releases_burst_token() {
        let valve = crate::valve::BurstValve::new(1);
        let (tx, mut rx) = correlator(0, 4, STALL);

        tx.push(RoundTrip::start(valve.acquire().await)).await.unwrap();
        assert_eq!(valve.available(), Some(0));
        assert_eq!(rx.pending(), 1);

        rx.pop().await.unwrap().complete();
        assert_eq!(valve.available(), Some(1));
    }
}

//! # Worker Pool Execution Loops
//!
//! Each function in this module is the body of one spawned worker task:
//!
//! - [`run_unary`]: time one `request()` per iteration.
//! - [`run_stream`]: time an in-line send and/or receive per iteration.
//! - [`run_sender`] / [`run_receiver`]: the two halves of an asynchronous
//!   stream. The sender takes a burst token, sends and pushes a
//!   [`RoundTrip`]; the receiver claims the oldest round trip, receives and
//!   records its latency. The correlator and the valve are the only
//!   synchronization between the two.
//!
//! Request failures never stop a loop (except a failed receive, which ends
//! that stream's receiver). A failed iteration produces no sample but still
//! counts toward the request limit.
//!
//! Every loop checks the shutdown signal between iterations. Nothing
//! interrupts a request that is already in flight.

use crate::client::{Client, Stream};
use crate::correlator::{RoundTrip, RoundTripReceiver, RoundTripSender};
use crate::metrics::LatencyRecorder;
use crate::valve::BurstValve;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

/// How many requests each worker issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestLimit {
    Bounded(u64),
    Unbounded,
}

impl RequestLimit {
    /// Map the CLI convention where 0 means "run until interrupted"
    pub fn from_count(count: u64) -> Self {
        if count == 0 {
            RequestLimit::Unbounded
        } else {
            RequestLimit::Bounded(count)
        }
    }

    pub fn is_reached(&self, completed: u64) -> bool {
        match self {
            RequestLimit::Bounded(n) => completed >= *n,
            RequestLimit::Unbounded => false,
        }
    }
}

/// Which in-line operations a synchronous stream worker performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOps {
    pub send: bool,
    pub recv: bool,
}

/// State shared by every worker of a run
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub recorder: Arc<LatencyRecorder>,
    pub limit: RequestLimit,
    pub delay: Option<Duration>,
    pub shutdown: watch::Receiver<bool>,
}

impl WorkerContext {
    fn should_stop(&self, iterations: u64) -> bool {
        self.limit.is_reached(iterations) || *self.shutdown.borrow()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Drive one unary worker; returns the number of samples it produced
pub async fn run_unary(id: usize, client: Arc<dyn Client>, ctx: WorkerContext) -> u64 {
    let mut iterations = 0;
    let mut samples = 0;

    while !ctx.should_stop(iterations) {
        let start = Instant::now();
        match client.request().await {
            Ok(()) => {
                ctx.recorder.record(start.elapsed());
                samples += 1;
            }
            Err(e) => warn!("worker {}: request failed: {:#}", id, e),
        }
        iterations += 1;
        ctx.pause().await;
    }

    debug!("unary worker {} finished after {} requests", id, iterations);
    samples
}

/// Drive one synchronous stream worker; returns the number of samples it produced
pub async fn run_stream(
    id: usize,
    stream: Arc<dyn Stream>,
    ops: StreamOps,
    ctx: WorkerContext,
) -> u64 {
    let mut iterations = 0;
    let mut samples = 0;

    while !ctx.should_stop(iterations) {
        let start = Instant::now();
        let mut outcome = Ok(());
        if ops.send {
            outcome = stream.do_send().await;
        }
        if ops.recv && outcome.is_ok() {
            outcome = stream.do_recv().await;
        }
        match outcome {
            Ok(()) => {
                ctx.recorder.record(start.elapsed());
                samples += 1;
            }
            Err(e) => warn!("stream worker {}: {:#}", id, e),
        }
        iterations += 1;
        ctx.pause().await;
    }

    debug!("stream worker {} finished after {} iterations", id, iterations);
    samples
}

/// Sending half of an asynchronous stream; returns the number of sends issued
///
/// The round trip is started right before the wire send but only enqueued
/// once the send succeeded. A failed send drops it, which releases its burst
/// token, and the receiver never waits for a response to it.
pub async fn run_sender(
    id: usize,
    stream: Arc<dyn Stream>,
    valve: BurstValve,
    round_trips: RoundTripSender,
    ctx: WorkerContext,
) -> u64 {
    let mut iterations = 0;

    while !ctx.should_stop(iterations) {
        let round_trip = RoundTrip::start(valve.acquire().await);
        iterations += 1;
        match stream.do_send().await {
            Ok(()) => {
                if let Err(e) = round_trips.push(round_trip).await {
                    warn!("sender {} stopping: {}", id, e);
                    break;
                }
            }
            Err(e) => warn!("sender {}: send failed: {:#}", id, e),
        }
        ctx.pause().await;
    }

    debug!("sender {} finished after {} sends", id, iterations);
    iterations
}

/// Receiving half of an asynchronous stream; returns the number of samples it produced
///
/// Claims the oldest sent round trip, then waits for its response. Runs
/// until the sender is gone and every round trip it enqueued is answered.
pub async fn run_receiver(
    id: usize,
    stream: Arc<dyn Stream>,
    mut round_trips: RoundTripReceiver,
    ctx: WorkerContext,
) -> u64 {
    let mut samples = 0;

    while !ctx.should_stop(samples) {
        let Some(round_trip) = round_trips.pop().await else {
            break;
        };
        if let Err(e) = stream.do_recv().await {
            warn!("receiver {} exiting: {:#}", id, e);
            break;
        }
        ctx.recorder.record(round_trip.complete());
        samples += 1;
        ctx.pause().await;
    }

    debug!("receiver {} finished after {} receives", id, samples);
    samples
}

//! # fperf Library
//!
//! A pluggable load-generation harness. It drives an arbitrary network client
//! at configurable concurrency, measures per-request latency and throughput,
//! and reports live statistics.
//!
//! ## Execution Modes
//!
//! - **Unary**: each worker issues one request at a time and times it.
//! - **Synchronous stream**: each worker times an in-line send and/or receive
//!   over an ordered stream.
//! - **Asynchronous stream**: a sender and a receiver task per stream run at
//!   independent paces; a per-stream correlator pairs each receive with the
//!   send it answers, and an optional burst valve bounds the number of
//!   requests in flight.
//!
//! ## Architecture Overview
//!
//! - `histogram`: concurrency-safe exponential-bucket latency accumulator
//! - `valve`: bounded token pool limiting outstanding requests
//! - `correlator`: FIFO queue pairing asynchronous sends with receives
//! - `worker`: the execution loops that drive plug-in clients
//! - `reporter`: periodic interval summaries and metrics-sink forwarding
//! - `benchmark`: configuration, mode selection and the run orchestrator
//! - `client`: the plug-in contract, the registry and the builtin plug-ins
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use fperf::{BenchmarkConfig, BenchmarkRunner, Registry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BenchmarkConfig {
//!         target: "demo".to_string(),
//!         requests: fperf::RequestLimit::Bounded(1000),
//!         ..Default::default()
//!     };
//!
//!     let runner = BenchmarkRunner::new(config, Arc::new(Registry::with_builtins()));
//!     let report = runner.run().await?;
//!
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

/// Run configuration, mode resolution and the orchestrator
///
/// Contains `BenchmarkConfig` and `BenchmarkRunner`. The runner builds
/// connections and streams through the registry, spawns the workers and the
/// reporter, and owns shutdown.
pub mod benchmark;

/// Command-line interface
///
/// Argument parsing with clap and the human-readable duration parser shared
/// with plug-in argument parsers.
pub mod cli;

/// Plug-in contract, registry and builtin clients
pub mod client;

/// Round-trip correlation for pipelined streams
pub mod correlator;

/// Exponential-bucket latency histogram
pub mod histogram;

/// Log subscriber setup and the colorized console formatter
pub mod logging;

/// Latency recording and per-interval summaries
///
/// Every sample goes both into the cumulative histogram and into a sample
/// buffer that the reporter swaps out once per tick.
pub mod metrics;

/// Periodic reporting task
pub mod reporter;

/// Final run report and JSON output
pub mod results;

/// External time-series metrics sink
pub mod sink;

/// Backpressure valve bounding requests in flight
pub mod valve;

/// Worker execution loops
pub mod worker;

pub use benchmark::{BenchError, BenchmarkConfig, BenchmarkRunner, ExecutionMode};
pub use cli::{Args, CallType};
pub use client::{Capabilities, Capability, Client, Registry, Stream};
pub use histogram::{Histogram, HistogramOptions, HistogramSnapshot};
pub use results::RunReport;
pub use worker::RequestLimit;

/// The current version of fperf
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Number of client connections
    pub const CONNECTIONS: usize = 1;

    /// Streams opened on every connection
    pub const STREAMS_PER_CONNECTION: usize = 1;

    /// Worker tasks per stream, or per connection in unary mode
    pub const WORKERS_PER_STREAM: usize = 1;

    /// Target server address
    pub const SERVER_ADDRESS: &str = "127.0.0.1:8804";

    /// Interval between statistics reports
    pub const TICK: Duration = Duration::from_secs(2);

    /// Histogram shape used for the final distribution
    ///
    /// With these values the first bucket starts at 10µs and the buckets
    /// grow by 1.8x, so the last boundary sits around 121ms.
    pub const HISTOGRAM_BUCKETS: usize = 16;
    pub const HISTOGRAM_GROWTH_FACTOR: f64 = 1.8;
    pub const HISTOGRAM_MIN_BUCKET_WIDTH_NS: u64 = 1_000;
    pub const HISTOGRAM_MIN_VALUE_NS: u64 = 10_000;

    /// Initial capacity of the per-interval sample buffer
    pub const SAMPLE_BUFFER_CAPACITY: usize = 500_000;

    /// How long a valve or correlator wait lasts before it logs a stall warning
    pub const STALL_WARNING_INTERVAL: Duration = Duration::from_secs(1);

    /// Round trips a single stream may have queued between its sender and receiver
    pub const CORRELATOR_CAPACITY: usize = 10 * 1024 * 1024;

    /// Database receiving the per-tick summary points
    pub const INFLUX_DATABASE: &str = "fperf";
}

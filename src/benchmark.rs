//! # Benchmark Engine Module
//!
//! This module contains the orchestrator that turns a validated
//! [`BenchmarkConfig`] into a running load test. It handles the complete run
//! lifecycle: plug-in lookup, connection setup, mode selection, worker and
//! reporter startup, and shutdown.
//!
//! ## Run Lifecycle
//!
//! 1. **Lookup**: resolve the target plug-in in the [`Registry`]. An unknown
//!    name fails before any client is created.
//! 2. **Construction**: build one client per connection from the plug-in's
//!    own arguments and resolve the execution mode from the first client's
//!    declared capabilities.
//! 3. **Dial**: connect every client to the server. Any failure is fatal.
//! 4. **Streams**: in stream modes, open the configured number of streams on
//!    every client. Any failure is fatal.
//! 5. **Measurement**: spawn the workers and the reporter, then wait until
//!    every worker reaches its request limit or a termination signal arrives.
//! 6. **Summary**: snapshot the histogram into a [`RunReport`].
//!
//! ## Shutdown
//!
//! On a termination signal the shutdown flag is raised and the worker tasks
//! are dropped without being joined. Requests already in flight are not
//! waited for; the report covers every sample recorded up to that point.
//!
//! ## Error Handling
//!
//! Only startup failures surface as a [`BenchError`]. Request failures,
//! coordination stalls and metrics-sink failures are logged by the component
//! that sees them and never abort the run.

use crate::{
    cli::{Args, CallType},
    client::{Capabilities, Capability, Client, Registry, Stream},
    correlator::correlator,
    histogram::{HistogramError, HistogramOptions},
    metrics::LatencyRecorder,
    reporter::Reporter,
    results::{RunIdentity, RunReport},
    sink::{InfluxSink, MetricsSink},
    valve::BurstValve,
    worker::{self, RequestLimit, StreamOps, WorkerContext},
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The execution loop driving every worker of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// One `request()` per iteration
    Unary,
    /// In-line send and/or receive per iteration
    SyncStream,
    /// Independent sender and receiver tasks per stream
    AsyncStream,
}

impl ExecutionMode {
    pub fn required_capability(&self) -> Capability {
        match self {
            ExecutionMode::Unary => Capability::Unary,
            ExecutionMode::SyncStream | ExecutionMode::AsyncStream => Capability::Stream,
        }
    }

    pub fn uses_streams(&self) -> bool {
        self.required_capability() == Capability::Stream
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Unary => write!(f, "unary"),
            ExecutionMode::SyncStream => write!(f, "stream"),
            ExecutionMode::AsyncStream => write!(f, "async stream"),
        }
    }
}

/// Fatal startup errors; nothing is benchmarked once one of these is returned
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("unknown client {name:?} (registered clients: {registered})")]
    UnknownClient { name: String, registered: String },

    #[error("failed to create {client} client: {error:#}")]
    ClientInit { client: String, error: anyhow::Error },

    #[error("connection {connection} failed to dial {addr}: {error:#}")]
    Dial {
        connection: usize,
        addr: String,
        error: anyhow::Error,
    },

    #[error("client {client} does not support the {capability} capability required by {mode} mode")]
    MissingCapability {
        client: String,
        capability: Capability,
        mode: ExecutionMode,
    },

    #[error("failed to create stream {stream} on connection {connection}: {error:#}")]
    Stream {
        connection: usize,
        stream: usize,
        error: anyhow::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Histogram(#[from] HistogramError),
}

/// Immutable parameters of one run
///
/// Built once from the command line by [`BenchmarkConfig::from_args`] and
/// never modified afterwards; every task only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Registered name of the plug-in to drive
    pub target: String,
    /// Arguments handed to the plug-in's factory
    pub client_args: Vec<String>,
    pub server: String,
    pub connections: usize,
    pub streams: usize,
    /// Worker tasks per stream, or per connection in unary mode
    pub workers: usize,
    /// Requests issued by every worker
    pub requests: RequestLimit,
    /// Maximum outstanding asynchronous requests, 0 disables the valve
    pub burst: usize,
    pub send: bool,
    pub recv: bool,
    pub delay: Option<Duration>,
    pub tick: Duration,
    pub call_type: CallType,
    pub async_mode: bool,
    pub influxdb: Option<String>,
    pub histogram: HistogramOptions,
    /// Round trips one stream may have queued between sender and receiver
    pub correlator_capacity: usize,
    /// Wait before a blocked valve or correlator logs a warning
    pub stall_interval: Duration,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            client_args: Vec::new(),
            server: crate::defaults::SERVER_ADDRESS.to_string(),
            connections: crate::defaults::CONNECTIONS,
            streams: crate::defaults::STREAMS_PER_CONNECTION,
            workers: crate::defaults::WORKERS_PER_STREAM,
            requests: RequestLimit::Unbounded,
            burst: 0,
            send: true,
            recv: true,
            delay: None,
            tick: crate::defaults::TICK,
            call_type: CallType::Auto,
            async_mode: false,
            influxdb: None,
            histogram: HistogramOptions::default(),
            correlator_capacity: crate::defaults::CORRELATOR_CAPACITY,
            stall_interval: crate::defaults::STALL_WARNING_INTERVAL,
        }
    }
}

impl BenchmarkConfig {
    /// Create a validated configuration from command-line arguments
    pub fn from_args(args: &Args) -> Result<Self, BenchError> {
        let config = Self {
            target: args.target.clone().unwrap_or_default(),
            client_args: args.client_args.clone(),
            server: args.server.clone(),
            connections: args.connections,
            streams: args.streams,
            workers: args.workers,
            requests: RequestLimit::from_count(args.requests),
            burst: args.burst,
            send: args.send,
            recv: args.recv,
            delay: args.delay.filter(|d| !d.is_zero()),
            tick: args.tick,
            call_type: args.call_type,
            async_mode: args.async_mode,
            influxdb: args.influxdb.clone().filter(|addr| !addr.is_empty()),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BenchError> {
        if self.target.trim().is_empty() {
            return Err(BenchError::Config("no client selected".to_string()));
        }
        for (name, value) in [
            ("connection", self.connections),
            ("stream", self.streams),
            ("workers", self.workers),
            ("correlator capacity", self.correlator_capacity),
        ] {
            if value == 0 {
                return Err(BenchError::Config(format!("{} count must be > 0", name)));
            }
        }
        if self.tick.is_zero() {
            return Err(BenchError::Config("tick must be > 0".to_string()));
        }
        if self.server.trim().is_empty() {
            return Err(BenchError::Config("server address is empty".to_string()));
        }
        Ok(())
    }

    /// Workers actually spawned per stream in `mode`
    pub fn effective_workers(&self, mode: ExecutionMode) -> usize {
        if mode == ExecutionMode::AsyncStream {
            1
        } else {
            self.workers
        }
    }
}

impl std::fmt::Display for BenchmarkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "  Client:             {}", self.target)?;
        writeln!(f, "  Server:             {}", self.server)?;
        writeln!(f, "  Connections:        {}", self.connections)?;
        writeln!(f, "  Streams/Connection: {}", self.streams)?;
        writeln!(f, "  Workers:            {}", self.workers)?;
        match self.requests {
            RequestLimit::Bounded(n) => writeln!(f, "  Requests/Worker:    {}", n)?,
            RequestLimit::Unbounded => writeln!(f, "  Requests/Worker:    until interrupted")?,
        }
        if self.burst > 0 {
            writeln!(f, "  Burst Limit:        {}", self.burst)?;
        }
        if let Some(delay) = self.delay {
            writeln!(f, "  Delay:              {:?}", delay)?;
        }
        writeln!(f, "  Tick:               {:?}", self.tick)?;
        if let Some(influxdb) = &self.influxdb {
            writeln!(f, "  InfluxDB:           {}", influxdb)?;
        }
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Pick the execution mode for a client with `capabilities`
///
/// `auto` prefers streams when the client supports them. The async flag only
/// affects stream modes.
pub fn resolve_mode(
    client: &str,
    call_type: CallType,
    async_mode: bool,
    capabilities: Capabilities,
) -> Result<ExecutionMode, BenchError> {
    let stream_mode = if async_mode {
        ExecutionMode::AsyncStream
    } else {
        ExecutionMode::SyncStream
    };

    let mode = match call_type {
        CallType::Unary => ExecutionMode::Unary,
        CallType::Stream => stream_mode,
        CallType::Auto if capabilities.stream => stream_mode,
        CallType::Auto => ExecutionMode::Unary,
    };

    let capability = mode.required_capability();
    if !capabilities.supports(capability) {
        return Err(BenchError::MissingCapability {
            client: client.to_string(),
            capability,
            mode,
        });
    }
    if mode == ExecutionMode::Unary && async_mode {
        warn!("--async has no effect on unary clients, ignoring it");
    }
    Ok(mode)
}

/// Wait for SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Orchestrates one benchmark run
///
/// The registry is injected so that tests can register fake plug-ins.
pub struct BenchmarkRunner {
    config: BenchmarkConfig,
    registry: Arc<Registry>,
}

impl BenchmarkRunner {
    pub fn new(config: BenchmarkConfig, registry: Arc<Registry>) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Run until every worker finishes or a termination signal arrives
    pub async fn run(&self) -> Result<RunReport, BenchError> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until every worker finishes or `interrupt` completes
    pub async fn run_until<F>(&self, interrupt: F) -> Result<RunReport, BenchError>
    where
        F: Future<Output = ()>,
    {
        let config = &self.config;
        config.validate()?;

        let entry = self
            .registry
            .lookup(&config.target)
            .ok_or_else(|| BenchError::UnknownClient {
                name: config.target.clone(),
                registered: self.registry.names().join(", "),
            })?;
        let recorder = Arc::new(LatencyRecorder::new(config.histogram)?);

        let mut clients = Vec::with_capacity(config.connections);
        for _ in 0..config.connections {
            let client = entry
                .create(&config.client_args)
                .map_err(|error| BenchError::ClientInit {
                    client: config.target.clone(),
                    error,
                })?;
            clients.push(client);
        }
        let capabilities = clients
            .first()
            .map(|c| c.capabilities())
            .unwrap_or_default();
        let mode = resolve_mode(
            &config.target,
            config.call_type,
            config.async_mode,
            capabilities,
        )?;
        if mode == ExecutionMode::SyncStream && !config.send && !config.recv {
            return Err(BenchError::Config(
                "stream mode needs --send or --recv enabled".to_string(),
            ));
        }
        if mode == ExecutionMode::AsyncStream && config.workers > 1 {
            warn!(
                "Async stream mode runs one sender/receiver pair per stream. Forcing workers = 1."
            );
        }
        if mode != ExecutionMode::AsyncStream && config.burst > 0 {
            warn!("--burst only applies to async stream mode, ignoring it");
        }

        let mut dialed: Vec<Arc<dyn Client>> = Vec::with_capacity(clients.len());
        for (connection, mut client) in clients.into_iter().enumerate() {
            client
                .dial(&config.server)
                .await
                .map_err(|error| BenchError::Dial {
                    connection,
                    addr: config.server.clone(),
                    error,
                })?;
            dialed.push(Arc::from(client));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut streams: Vec<Arc<dyn Stream>> = Vec::new();
        if mode.uses_streams() {
            for (connection, client) in dialed.iter().enumerate() {
                for stream in 0..config.streams {
                    let created = client
                        .create_stream(shutdown_rx.clone())
                        .await
                        .map_err(|error| BenchError::Stream {
                            connection,
                            stream,
                            error,
                        })?;
                    streams.push(Arc::from(created));
                }
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let identity = RunIdentity {
            run_id: run_id.clone(),
            client: config.target.clone(),
            mode,
            server: config.server.clone(),
            started_at: chrono::Utc::now(),
        };
        info!("Starting {} benchmark {} ({} mode)", config.target, run_id, mode);
        info!("Configuration:\n{}", config);

        let mut reporter = Reporter::new(
            Arc::clone(&recorder),
            config.tick,
            run_id.as_str(),
            config.target.as_str(),
        );
        if let Some(addr) = &config.influxdb {
            match InfluxSink::connect(addr).await {
                Ok(sink) => {
                    debug!("Writing metrics to {}", sink.write_url());
                    reporter = reporter.with_sink(Arc::new(sink) as Arc<dyn MetricsSink>);
                }
                Err(e) => warn!("metrics sink disabled: {:#}", e),
            }
        }

        let ctx = WorkerContext {
            recorder: Arc::clone(&recorder),
            limit: config.requests,
            delay: config.delay,
            shutdown: shutdown_rx,
        };
        let started = Instant::now();
        let mut workers = self.spawn_workers(mode, &dialed, &streams, &ctx);
        let reporter_handle = tokio::spawn(reporter.run());

        let interrupted = tokio::select! {
            samples = join_workers(&mut workers) => {
                debug!("all workers finished, {} samples", samples);
                false
            }
            _ = interrupt => {
                info!("Received termination signal, stopping benchmark");
                true
            }
        };
        let elapsed = started.elapsed();
        let _ = shutdown_tx.send(true);
        reporter_handle.abort();
        // Outstanding workers are dropped here, not joined.
        drop(workers);

        Ok(RunReport::new(
            identity,
            recorder.snapshot(),
            elapsed,
            interrupted,
        ))
    }

    fn spawn_workers(
        &self,
        mode: ExecutionMode,
        clients: &[Arc<dyn Client>],
        streams: &[Arc<dyn Stream>],
        ctx: &WorkerContext,
    ) -> JoinSet<u64> {
        let config = &self.config;
        let workers_per_slot = config.effective_workers(mode);
        let mut set = JoinSet::new();
        let mut id = 0;

        match mode {
            ExecutionMode::Unary => {
                for client in clients {
                    for _ in 0..workers_per_slot {
                        set.spawn(worker::run_unary(id, Arc::clone(client), ctx.clone()));
                        id += 1;
                    }
                }
            }
            ExecutionMode::SyncStream => {
                let ops = StreamOps {
                    send: config.send,
                    recv: config.recv,
                };
                for stream in streams {
                    for _ in 0..workers_per_slot {
                        set.spawn(worker::run_stream(
                            id,
                            Arc::clone(stream),
                            ops,
                            ctx.clone(),
                        ));
                        id += 1;
                    }
                }
            }
            ExecutionMode::AsyncStream => {
                let valve = BurstValve::with_stall_interval(config.burst, config.stall_interval);
                for stream in streams {
                    let (tx, rx) = correlator(id, config.correlator_capacity, config.stall_interval);
                    // Only the receiver's count is a number of samples.
                    let sender = worker::run_sender(
                        id,
                        Arc::clone(stream),
                        valve.clone(),
                        tx,
                        ctx.clone(),
                    );
                    set.spawn(async move {
                        sender.await;
                        0
                    });
                    set.spawn(worker::run_receiver(
                        id,
                        Arc::clone(stream),
                        rx,
                        ctx.clone(),
                    ));
                    id += 1;
                }
            }
        }

        debug!("spawned {} worker tasks", set.len());
        set
    }
}

/// Wait for every worker, returning the number of samples they produced
async fn join_workers(workers: &mut JoinSet<u64>) -> u64 {
    let mut samples = 0;
    while let Some(result) = workers.join_next().await {
        match result {
            Ok(n) => samples += n,
            Err(e) => warn!("worker task failed: {}", e),
        }
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("fperf").chain(extra.iter().copied())).unwrap()
    }

    #[test]
    fn test_from_args() {
        let config = BenchmarkConfig::from_args(&args(&[
            "--connection",
            "2",
            "-N",
            "50",
            "--burst",
            "8",
            "--delay",
            "0s",
            "--influxdb",
            "",
            "demo",
            "--latency",
            "1ms",
        ]))
        .unwrap();

        assert_eq!(config.target, "demo");
        assert_eq!(config.client_args, vec!["--latency", "1ms"]);
        assert_eq!(config.connections, 2);
        assert_eq!(config.requests, RequestLimit::Bounded(50));
        assert_eq!(config.burst, 8);
        assert_eq!(config.delay, None);
        assert_eq!(config.influxdb, None);
        assert_eq!(config.histogram, HistogramOptions::default());
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            BenchmarkConfig::from_args(&args(&[])),
            Err(BenchError::Config(_))
        ));
        assert!(BenchmarkConfig::from_args(&args(&["--connection", "0", "demo"])).is_err());
        assert!(BenchmarkConfig::from_args(&args(&["--stream", "0", "demo"])).is_err());
        assert!(BenchmarkConfig::from_args(&args(&["--workers", "0", "demo"])).is_err());
        assert!(BenchmarkConfig::from_args(&args(&["--tick", "0s", "demo"])).is_err());
        assert!(BenchmarkConfig::from_args(&args(&["--server", " ", "demo"])).is_err());
    }

    #[test]
    fn test_resolve_mode() {
        let cases = [
            (CallType::Auto, false, Capabilities::BOTH, Some(ExecutionMode::SyncStream)),
            (CallType::Auto, true, Capabilities::BOTH, Some(ExecutionMode::AsyncStream)),
            (CallType::Auto, false, Capabilities::UNARY, Some(ExecutionMode::Unary)),
            (CallType::Auto, true, Capabilities::UNARY, Some(ExecutionMode::Unary)),
            (CallType::Unary, false, Capabilities::BOTH, Some(ExecutionMode::Unary)),
            (CallType::Unary, false, Capabilities::STREAM, None),
            (CallType::Stream, false, Capabilities::UNARY, None),
            (CallType::Stream, true, Capabilities::STREAM, Some(ExecutionMode::AsyncStream)),
            (CallType::Auto, false, Capabilities::default(), None),
        ];

        for (call_type, async_mode, caps, expected) in cases {
            let resolved = resolve_mode("fake", call_type, async_mode, caps).ok();
            assert_eq!(
                resolved, expected,
                "{} async={} caps={:?}",
                call_type, async_mode, caps
            );
        }
    }

    #[test]
    fn test_missing_capability_message() {
        let err = resolve_mode("http", CallType::Stream, false, Capabilities::UNARY).unwrap_err();
        assert_eq!(
            err.to_string(),
            "client http does not support the stream capability required by stream mode"
        );
    }

    #[test]
    fn test_effective_workers() {
        let config = BenchmarkConfig {
            workers: 4,
            ..Default::default()
        };
        assert_eq!(config.effective_workers(ExecutionMode::Unary), 4);
        assert_eq!(config.effective_workers(ExecutionMode::SyncStream), 4);
        assert_eq!(config.effective_workers(ExecutionMode::AsyncStream), 1);
    }

    #[test]
    fn test_config_display() {
        let config = BenchmarkConfig {
            target: "demo".to_string(),
            requests: RequestLimit::Bounded(10),
            ..Default::default()
        };
        let text = config.to_string();
        assert!(text.contains("Client:             demo"));
        assert!(text.contains("Requests/Worker:    10"));
        assert!(!text.contains("Burst"));
    }
}

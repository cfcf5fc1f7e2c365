use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// fperf - drive a pluggable network client at configurable concurrency and
/// report live latency and throughput
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
#[clap(override_usage = "fperf [OPTIONS] <CLIENT> [CLIENT_ARGS]...")]
pub struct Args {
    /// Number of connections (clients) to create
    #[clap(long = "connection", default_value_t = crate::defaults::CONNECTIONS, help_heading = "Concurrency")]
    pub connections: usize,

    /// Number of streams per connection
    #[clap(long = "stream", default_value_t = crate::defaults::STREAMS_PER_CONNECTION, help_heading = "Concurrency")]
    pub streams: usize,

    /// Number of worker tasks per stream (per connection in unary mode)
    #[clap(long = "workers", visible_alias = "goroutine", default_value_t = crate::defaults::WORKERS_PER_STREAM, help_heading = "Concurrency")]
    pub workers: usize,

    /// Runtime worker threads, 0 uses one per CPU
    #[clap(long, visible_alias = "cpu", default_value_t = 0, help_heading = "Concurrency")]
    pub threads: usize,

    /// Number of requests per worker, 0 runs until interrupted
    #[clap(short = 'N', long = "requests", default_value_t = 0, help_heading = "Workload")]
    pub requests: u64,

    /// Maximum requests in flight across the run, 0 disables the limit (use with --async)
    #[clap(long, default_value_t = 0, help_heading = "Workload")]
    pub burst: usize,

    /// Perform the send action in stream mode
    #[clap(long, default_value_t = true, action = ArgAction::Set, help_heading = "Workload")]
    pub send: bool,

    /// Perform the receive action in stream mode
    #[clap(long, default_value_t = true, action = ArgAction::Set, help_heading = "Workload")]
    pub recv: bool,

    /// Delay before sending the next request (e.g. "10ms")
    #[clap(long, value_parser = parse_duration, help_heading = "Workload")]
    pub delay: Option<Duration>,

    /// Send and receive in separate tasks
    #[clap(long = "async", default_value_t = false, help_heading = "Workload")]
    pub async_mode: bool,

    /// Call type of the client
    #[clap(long = "type", value_enum, default_value_t = CallType::Auto, help_heading = "Workload")]
    pub call_type: CallType,

    /// Address of the target server
    #[clap(long, default_value = crate::defaults::SERVER_ADDRESS, help_heading = "Target")]
    pub server: String,

    /// Interval between statistics reports
    #[clap(long, default_value = "2s", value_parser = parse_duration, help_heading = "Reporting")]
    pub tick: Duration,

    /// Write per-tick statistics to the InfluxDB instance at this address
    #[clap(long, help_heading = "Reporting")]
    pub influxdb: Option<String>,

    /// Write the final run report as JSON to this file
    #[clap(short = 'o', long, help_heading = "Reporting")]
    pub output_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = ArgAction::Count, help_heading = "Logging")]
    pub verbose: u8,

    /// Also write logs to this file
    #[clap(long, help_heading = "Logging")]
    pub log_file: Option<PathBuf>,

    /// List the registered clients and exit
    #[clap(long, default_value_t = false)]
    pub list_clients: bool,

    /// Registered client to benchmark
    #[clap(value_name = "CLIENT")]
    pub target: Option<String>,

    /// Arguments passed through to the client
    #[clap(value_name = "CLIENT_ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    pub client_args: Vec<String>,
}

/// Which request model to drive the client with
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum CallType {
    /// Stream if the client supports it, unary otherwise
    #[clap(name = "auto")]
    Auto,

    /// One request per call
    #[clap(name = "unary")]
    Unary,

    /// Send/receive over streams
    #[clap(name = "stream")]
    Stream,
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallType::Auto => write!(f, "auto"),
            CallType::Unary => write!(f, "unary"),
            CallType::Stream => write!(f, "stream"),
        }
    }
}

/// Parse duration from string (e.g., "10s", "5m", "1h", "250ms", "50us")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix("us") {
        (stripped, "us")
    } else if let Some(stripped) = s.strip_suffix("ns") {
        (stripped, "ns")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let nanos_per_unit = match unit {
        "ns" => 1.0,
        "us" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 60e9,
        "h" => 3600e9,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };
    let duration = Duration::from_nanos((num * nanos_per_unit).round() as u64);

    Ok(duration)
}

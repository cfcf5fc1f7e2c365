use crate::benchmark::ExecutionMode;
use crate::histogram::HistogramSnapshot;
use crate::metrics::utils::{format_latency, format_request_rate};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Percentiles estimated in every report
pub const REPORT_PERCENTILES: [f64; 4] = [50.0, 90.0, 99.0, 99.9];

/// Final summary of one run, bounded or interrupted
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub version: String,
    pub client: String,
    pub mode: ExecutionMode,
    pub server: String,
    /// Set when the run was stopped by a termination signal
    pub interrupted: bool,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub elapsed: Duration,
    pub total_requests: u64,
    pub mean_latency_ns: Option<f64>,
    pub requests_per_second: f64,
    pub percentiles: Vec<PercentileEstimate>,
    pub histogram: HistogramSnapshot,
    pub system_info: SystemInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PercentileEstimate {
    pub percentile: f64,
    pub latency_ns: u64,
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub fperf_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
            fperf_version: crate::VERSION.to_string(),
        }
    }
}

/// Identity of the run a report describes
#[derive(Debug, Clone)]
pub struct RunIdentity {
    pub run_id: String,
    pub client: String,
    pub mode: ExecutionMode,
    pub server: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl RunReport {
    pub fn new(
        identity: RunIdentity,
        histogram: HistogramSnapshot,
        elapsed: Duration,
        interrupted: bool,
    ) -> Self {
        let percentiles = REPORT_PERCENTILES
            .iter()
            .filter_map(|&p| {
                histogram.percentile(p).map(|latency_ns| PercentileEstimate {
                    percentile: p,
                    latency_ns,
                })
            })
            .collect();
        let requests_per_second = if elapsed.is_zero() {
            0.0
        } else {
            histogram.count as f64 / elapsed.as_secs_f64()
        };

        Self {
            run_id: identity.run_id,
            version: crate::VERSION.to_string(),
            client: identity.client,
            mode: identity.mode,
            server: identity.server,
            interrupted,
            started_at: identity.started_at,
            elapsed,
            total_requests: histogram.count,
            mean_latency_ns: histogram.mean_ns(),
            requests_per_second,
            percentiles,
            histogram,
            system_info: SystemInfo::default(),
        }
    }

    /// Write the report as pretty-printed JSON
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        info!("Results written to: {:?}", path);
        Ok(())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Run {} ({} client, {} mode){}",
            self.run_id,
            self.client,
            self.mode,
            if self.interrupted { ", interrupted" } else { "" }
        )?;
        writeln!(f, "  Requests:   {}", self.total_requests)?;
        writeln!(f, "  Elapsed:    {:.2?}", self.elapsed)?;
        writeln!(
            f,
            "  Throughput: {}",
            format_request_rate(self.requests_per_second)
        )?;
        if let Some(mean) = self.mean_latency_ns {
            writeln!(f, "  Mean:       {}", format_latency(mean as u64))?;
        }
        for estimate in &self.percentiles {
            writeln!(
                f,
                "  P{:<9} {}",
                format!("{}:", estimate.percentile),
                format_latency(estimate.latency_ns)
            )?;
        }
        writeln!(f)?;
        write!(f, "{}", self.histogram)
    }
}

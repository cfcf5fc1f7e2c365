//! # Exponential-Bucket Latency Histogram
//!
//! A concurrency-safe latency accumulator shared by every worker task. Bucket
//! boundaries grow geometrically from a minimum tracked value, with a minimum
//! bucket width so that the first few buckets do not collapse to nothing:
//!
//! ```text
//! b[0]   = min_value
//! b[i+1] = max(b[i] * growth_factor, b[i] + min_bucket_width)
//! ```
//!
//! Bucket `i` covers the half-open interval `[b[i], b[i+1])`. Values below
//! `b[0]` land in the underflow bucket and values at or above the last
//! boundary land in the overflow bucket.
//!
//! ## Concurrency
//!
//! All counters live behind a single `parking_lot::Mutex`. `add` holds the
//! lock for a binary search plus a handful of increments, and `snapshot`
//! holds it only for an O(bucket count) copy, so neither side can starve the
//! other and no update is ever lost or torn.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while building a histogram from invalid shape parameters
#[derive(Debug, Error, PartialEq)]
pub enum HistogramError {
    #[error("histogram bucket count must be greater than 0")]
    NoBuckets,

    #[error("histogram growth factor must be a finite number greater than 1, got {0}")]
    InvalidGrowthFactor(f64),
}

/// Shape parameters for a [`Histogram`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramOptions {
    /// Number of regular buckets between underflow and overflow
    pub num_buckets: usize,

    /// Multiplier applied to each boundary to obtain the next one
    pub growth_factor: f64,

    /// Smallest allowed distance between two consecutive boundaries (ns)
    pub min_bucket_width: u64,

    /// Lower bound of the first bucket (ns)
    pub min_value: u64,
}

impl Default for HistogramOptions {
    fn default() -> Self {
        Self {
            num_buckets: crate::defaults::HISTOGRAM_BUCKETS,
            growth_factor: crate::defaults::HISTOGRAM_GROWTH_FACTOR,
            min_bucket_width: crate::defaults::HISTOGRAM_MIN_BUCKET_WIDTH_NS,
            min_value: crate::defaults::HISTOGRAM_MIN_VALUE_NS,
        }
    }
}

impl HistogramOptions {
    fn validate(&self) -> Result<(), HistogramError> {
        if self.num_buckets == 0 {
            return Err(HistogramError::NoBuckets);
        }
        if !self.growth_factor.is_finite() || self.growth_factor <= 1.0 {
            return Err(HistogramError::InvalidGrowthFactor(self.growth_factor));
        }
        Ok(())
    }

    /// Compute the `num_buckets + 1` boundaries described by these options
    fn boundaries(&self) -> Vec<u64> {
        let mut boundaries = Vec::with_capacity(self.num_buckets + 1);
        let mut current = self.min_value;
        boundaries.push(current);
        for _ in 0..self.num_buckets {
            // `as` saturates on overflow, which keeps the sequence monotonic.
            let grown = (current as f64 * self.growth_factor) as u64;
            current = grown.max(current.saturating_add(self.min_bucket_width));
            boundaries.push(current);
        }
        boundaries
    }
}

/// Where a value was placed inside the histogram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketIndex {
    Underflow,
    Bucket(usize),
    Overflow,
}

#[derive(Debug, Clone)]
struct HistogramState {
    count: u64,
    sum: u128,
    min: u64,
    max: u64,
    underflow: u64,
    buckets: Vec<u64>,
    overflow: u64,
}

/// Concurrency-safe exponential-bucket histogram of nanosecond latencies
#[derive(Debug)]
pub struct Histogram {
    options: HistogramOptions,
    boundaries: Vec<u64>,
    state: Mutex<HistogramState>,
}

impl Histogram {
    /// Build a histogram, failing fast on an invalid shape
    pub fn new(options: HistogramOptions) -> Result<Self, HistogramError> {
        options.validate()?;
        let boundaries = options.boundaries();

        Ok(Self {
            options,
            boundaries,
            state: Mutex::new(HistogramState {
                count: 0,
                sum: 0,
                min: u64::MAX,
                max: 0,
                underflow: 0,
                buckets: vec![0; options.num_buckets],
                overflow: 0,
            }),
        })
    }

    pub fn options(&self) -> &HistogramOptions {
        &self.options
    }

    /// The `num_buckets + 1` bucket boundaries, in nanoseconds
    pub fn boundaries(&self) -> &[u64] {
        &self.boundaries
    }

    /// Locate the bucket a value belongs to
    pub fn bucket_for(&self, value_ns: u64) -> BucketIndex {
        let position = self.boundaries.partition_point(|&b| b <= value_ns);
        if position == 0 {
            BucketIndex::Underflow
        } else if position == self.boundaries.len() {
            BucketIndex::Overflow
        } else {
            BucketIndex::Bucket(position - 1)
        }
    }

    /// Record one sample
    pub fn add(&self, value_ns: u64) {
        let index = self.bucket_for(value_ns);

        let mut state = self.state.lock();
        state.count += 1;
        state.sum += u128::from(value_ns);
        state.min = state.min.min(value_ns);
        state.max = state.max.max(value_ns);
        match index {
            BucketIndex::Underflow => state.underflow += 1,
            BucketIndex::Bucket(i) => state.buckets[i] += 1,
            BucketIndex::Overflow => state.overflow += 1,
        }
    }

    /// Take a consistent point-in-time copy of every counter
    pub fn snapshot(&self) -> HistogramSnapshot {
        let state = self.state.lock().clone();

        HistogramSnapshot {
            boundaries: self.boundaries.clone(),
            count: state.count,
            sum_ns: state.sum,
            min_ns: if state.count == 0 { 0 } else { state.min },
            max_ns: state.max,
            underflow: state.underflow,
            buckets: state.buckets,
            overflow: state.overflow,
        }
    }
}

/// Point-in-time copy of a [`Histogram`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub boundaries: Vec<u64>,
    pub count: u64,
    pub sum_ns: u128,
    pub min_ns: u64,
    pub max_ns: u64,
    pub underflow: u64,
    pub buckets: Vec<u64>,
    pub overflow: u64,
}

impl HistogramSnapshot {
    pub fn mean_ns(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum_ns as f64 / self.count as f64)
        }
    }

    /// Estimate the value at percentile `p` (0-100) from bucket midpoints
    ///
    /// Underflow samples are represented by the observed minimum and overflow
    /// samples by the observed maximum, since neither bucket has a finite
    /// midpoint.
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.count == 0 {
            return None;
        }

        let p = p.clamp(0.0, 100.0);
        let rank = ((p / 100.0) * self.count as f64).ceil().max(1.0) as u64;

        let mut seen = self.underflow;
        if seen >= rank {
            return Some(self.min_ns);
        }
        for (i, &n) in self.buckets.iter().enumerate() {
            seen += n;
            if seen >= rank {
                let lo = self.boundaries[i];
                let hi = self.boundaries[i + 1];
                let mid = lo + (hi - lo) / 2;
                return Some(mid.clamp(self.min_ns, self.max_ns));
            }
        }
        Some(self.max_ns)
    }
}

impl fmt::Display for HistogramSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use crate::metrics::utils::format_latency;

        let mean = self.mean_ns().map_or(0, |m| m as u64);
        writeln!(
            f,
            "Count: {}  Min: {}  Max: {}  Avg: {}",
            self.count,
            format_latency(self.min_ns),
            format_latency(self.max_ns),
            format_latency(mean),
        )?;
        writeln!(
            f,
            "------------------------------------------------------------"
        )?;
        if self.count == 0 {
            return Ok(());
        }

        let total = self.count as f64;
        let mut cumulative = 0u64;
        let mut row = |f: &mut fmt::Formatter<'_>, label: String, n: u64| -> fmt::Result {
            cumulative += n;
            let pct = n as f64 * 100.0 / total;
            let bar = "#".repeat((pct / 2.0).round() as usize);
            writeln!(
                f,
                "{:<26} {:>10} {:>7.2}% {:>7.2}%  {}",
                label,
                n,
                pct,
                cumulative as f64 * 100.0 / total,
                bar
            )
        };

        row(f, format!("[{:>9}, {:>9})", "0", format_latency(self.boundaries[0])), self.underflow)?;
        for (i, &n) in self.buckets.iter().enumerate() {
            let label = format!(
                "[{:>9}, {:>9})",
                format_latency(self.boundaries[i]),
                format_latency(self.boundaries[i + 1])
            );
            row(f, label, n)?;
        }
        let last = self.boundaries[self.boundaries.len() - 1];
        row(f, format!("[{:>9}, {:>9})", format_latency(last), "inf"), self.overflow)
    }
}

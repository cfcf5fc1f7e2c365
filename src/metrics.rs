//! # Latency Sample Collection
//!
//! Every completed request produces exactly one latency sample, which is fed
//! to two places at once:
//!
//! - the cumulative [`Histogram`], printed as the final distribution, and
//! - the [`SampleBuffer`], which the reporter drains once per tick.
//!
//! [`LatencyRecorder`] bundles both so that workers only ever make one call.

use crate::histogram::{Histogram, HistogramError, HistogramOptions, HistogramSnapshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Mutex-protected buffer of samples gathered since the last tick
///
/// The reporter swaps the whole vector out under the lock, so the hand-off
/// and the reset happen as one atomic step.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    samples: Mutex<Vec<Duration>>,
}

impl SampleBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn push(&self, sample: Duration) {
        self.samples.lock().push(sample);
    }

    /// Take every buffered sample, leaving an empty buffer of the same capacity
    pub fn take(&self) -> Vec<Duration> {
        let mut samples = self.samples.lock();
        let capacity = samples.capacity();
        std::mem::replace(&mut *samples, Vec::with_capacity(capacity))
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared sink for latency samples produced by worker tasks
#[derive(Debug)]
pub struct LatencyRecorder {
    histogram: Histogram,
    samples: SampleBuffer,
    recorded: AtomicU64,
}

impl LatencyRecorder {
    pub fn new(options: HistogramOptions) -> Result<Self, HistogramError> {
        Ok(Self {
            histogram: Histogram::new(options)?,
            samples: SampleBuffer::with_capacity(crate::defaults::SAMPLE_BUFFER_CAPACITY),
            recorded: AtomicU64::new(0),
        })
    }

    /// Record one completed request
    pub fn record(&self, elapsed: Duration) {
        // Saturate instead of wrapping for pathological multi-century samples.
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.histogram.add(nanos);
        self.samples.push(elapsed);
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain the samples gathered since the previous call
    pub fn drain_interval(&self) -> Vec<Duration> {
        self.samples.take()
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        self.histogram.snapshot()
    }

    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    /// Total number of samples recorded over the whole run
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }
}

/// Mean latency and throughput derived from one tick's samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntervalSummary {
    pub count: usize,
    pub mean_latency: Duration,
    pub requests_per_second: f64,
}

impl IntervalSummary {
    /// Summarize samples collected over `interval`
    ///
    /// Returns `None` when there are no samples (or the interval is zero), so
    /// callers never divide by zero.
    pub fn from_samples(samples: &[Duration], interval: Duration) -> Option<Self> {
        if samples.is_empty() || interval.is_zero() {
            return None;
        }

        let count = samples.len();
        let sum: Duration = samples.iter().sum();
        let mean_latency = Duration::from_nanos((sum.as_nanos() / count as u128) as u64);

        Some(Self {
            count,
            mean_latency,
            requests_per_second: count as f64 / interval.as_secs_f64(),
        })
    }
}

/// Utility functions for metrics formatting
pub mod utils {
    /// Format latency value for human-readable output
    pub fn format_latency(latency_ns: u64) -> String {
        if latency_ns < 1_000 {
            format!("{}ns", latency_ns)
        } else if latency_ns < 1_000_000 {
            format!("{:.2}μs", latency_ns as f64 / 1_000.0)
        } else if latency_ns < 1_000_000_000 {
            format!("{:.2}ms", latency_ns as f64 / 1_000_000.0)
        } else {
            format!("{:.2}s", latency_ns as f64 / 1_000_000_000.0)
        }
    }

    /// Format a request rate for human-readable output
    pub fn format_request_rate(requests_per_second: f64) -> String {
        if requests_per_second < 1_000.0 {
            format!("{:.0} req/s", requests_per_second)
        } else if requests_per_second < 1_000_000.0 {
            format!("{:.2}K req/s", requests_per_second / 1_000.0)
        } else {
            format!("{:.2}M req/s", requests_per_second / 1_000_000.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_interval_summary() {
        let samples = [
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(30),
        ];
        let summary = IntervalSummary::from_samples(&samples, Duration::from_secs(1)).unwrap();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.mean_latency, Duration::from_millis(20));
        assert_eq!(summary.requests_per_second, 3.0);

        let summary = IntervalSummary::from_samples(&samples, Duration::from_secs(2)).unwrap();
        assert_eq!(summary.requests_per_second, 1.5);
    }

    #[test]
    fn test_interval_summary_without_samples() {
        assert!(IntervalSummary::from_samples(&[], Duration::from_secs(1)).is_none());
        assert!(
            IntervalSummary::from_samples(&[Duration::from_millis(1)], Duration::ZERO).is_none()
        );
    }

    #[test]
    fn test_sample_buffer_take_resets() {
        let buffer = SampleBuffer::with_capacity(4);
        buffer.push(Duration::from_micros(1));
        buffer.push(Duration::from_micros(2));

        let taken = buffer.take();
        assert_eq!(taken.len(), 2);
        assert!(buffer.is_empty());

        buffer.push(Duration::from_micros(3));
        assert_eq!(buffer.take(), vec![Duration::from_micros(3)]);
    }

    #[test]
    fn test_recorder_feeds_histogram_and_buffer() {
        let recorder = Arc::new(LatencyRecorder::new(HistogramOptions::default()).unwrap());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let recorder = Arc::clone(&recorder);
                std::thread::spawn(move || {
                    for i in 0..1_000u64 {
                        recorder.record(Duration::from_nanos(i * 100));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(recorder.recorded(), 4_000);
        assert_eq!(recorder.snapshot().count, 4_000);
        assert_eq!(recorder.drain_interval().len(), 4_000);
        assert!(recorder.drain_interval().is_empty());
    }

    #[test]
    fn test_format_latency() {
        assert_eq!(utils::format_latency(500), "500ns");
        assert_eq!(utils::format_latency(1500), "1.50μs");
        assert_eq!(utils::format_latency(1500000), "1.50ms");
        assert_eq!(utils::format_latency(1500000000), "1.50s");
    }

    #[test]
    fn test_format_request_rate() {
        assert_eq!(utils::format_request_rate(3.0), "3 req/s");
        assert_eq!(utils::format_request_rate(1500.0), "1.50K req/s");
        assert_eq!(utils::format_request_rate(2_500_000.0), "2.50M req/s");
    }
}

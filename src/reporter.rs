//! Periodic reporting task.
//!
//! Once per tick the reporter swaps out the interval sample buffer, logs the
//! mean latency and throughput of what it drained, and forwards the same
//! figures to the metrics sink when one is configured. Throughput is the
//! drained count over the configured tick, not over the measured wall time
//! between ticks. The task never stops
//! on its own; the runner aborts it once the workers are done.

use crate::metrics::utils::{format_latency, format_request_rate};
use crate::metrics::{IntervalSummary, LatencyRecorder};
use crate::sink::{MetricsSink, SummaryPoint};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub struct Reporter {
    recorder: Arc<LatencyRecorder>,
    tick: Duration,
    sink: Option<Arc<dyn MetricsSink>>,
    run_id: String,
    client: String,
    reported: u64,
}

impl Reporter {
    pub fn new(
        recorder: Arc<LatencyRecorder>,
        tick: Duration,
        run_id: impl Into<String>,
        client: impl Into<String>,
    ) -> Self {
        Self {
            recorder,
            tick,
            sink: None,
            run_id: run_id.into(),
            client: client.into(),
            reported: 0,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Samples reported so far, across all ticks
    pub fn reported(&self) -> u64 {
        self.reported
    }

    /// Drain the samples recorded since the previous call and report them as
    /// one tick
    pub async fn report(&mut self) -> Option<IntervalSummary> {
        let samples = self.recorder.drain_interval();
        let Some(summary) = IntervalSummary::from_samples(&samples, self.tick) else {
            info!("no progress in the last {:?}", self.tick);
            return None;
        };
        self.reported += summary.count as u64;

        info!(
            "latency {} qps {} total {}",
            format_latency(summary.mean_latency.as_nanos() as u64),
            format_request_rate(summary.requests_per_second),
            self.reported
        );

        if let Some(sink) = &self.sink {
            let point = SummaryPoint {
                run_id: self.run_id.clone(),
                client: self.client.clone(),
                mean_latency: summary.mean_latency,
                requests_per_second: summary.requests_per_second,
                timestamp: Utc::now(),
            };
            if let Err(e) = sink.push(&point).await {
                warn!("failed to push metrics point: {:#}", e);
            }
        }

        Some(summary)
    }

    /// Report on every tick, forever
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.report().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::HistogramOptions;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    fn recorder() -> Arc<LatencyRecorder> {
        Arc::new(LatencyRecorder::new(HistogramOptions::default()).unwrap())
    }

    #[derive(Default)]
    struct CapturingSink {
        points: Mutex<Vec<SummaryPoint>>,
    }

    #[async_trait]
    impl MetricsSink for CapturingSink {
        async fn push(&self, point: &SummaryPoint) -> Result<()> {
            self.points.lock().push(point.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl MetricsSink for FailingSink {
        async fn push(&self, _point: &SummaryPoint) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_empty_tick_reports_no_progress() {
        let mut reporter = Reporter::new(recorder(), Duration::from_secs(1), "run", "demo");
        assert!(reporter.report().await.is_none());
        assert!(logs_contain("no progress"));
        assert_eq!(reporter.reported(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_tick_mean_and_throughput() {
        let recorder = recorder();
        for ms in [10, 20, 30] {
            recorder.record(Duration::from_millis(ms));
        }
        let sink = Arc::new(CapturingSink::default());
        let mut reporter = Reporter::new(recorder.clone(), Duration::from_secs(1), "run-1", "demo")
            .with_sink(sink.clone());

        let summary = reporter.report().await.unwrap();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.mean_latency, Duration::from_millis(20));
        assert!((summary.requests_per_second - 3.0).abs() < f64::EPSILON);
        assert!(logs_contain("latency 20.00ms"));

        let points = sink.points.lock();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].run_id, "run-1");
        assert_eq!(points[0].client, "demo");
        assert_eq!(points[0].mean_latency, Duration::from_millis(20));

        // The next interval starts empty.
        drop(points);
        assert!(reporter.report().await.is_none());
        assert_eq!(reporter.reported(), 3);
        assert_eq!(recorder.snapshot().count, 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_sink_failure_is_logged() {
        let recorder = recorder();
        recorder.record(Duration::from_millis(1));
        let mut reporter = Reporter::new(recorder, Duration::from_secs(1), "run", "demo")
            .with_sink(Arc::new(FailingSink));

        assert!(reporter.report().await.is_some());
        assert!(logs_contain("failed to push metrics point"));
    }

    #[tokio::test]
    async fn test_throughput_uses_configured_tick() {
        let recorder = recorder();
        for _ in 0..4 {
            recorder.record(Duration::from_millis(5));
        }
        let mut reporter = Reporter::new(recorder, Duration::from_secs(2), "run", "demo");

        let summary = reporter.report().await.unwrap();
        assert!((summary.requests_per_second - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_run_pushes_a_point_per_tick() {
        let recorder = recorder();
        for _ in 0..5 {
            recorder.record(Duration::from_millis(1));
        }
        let sink = Arc::new(CapturingSink::default());
        let reporter = Reporter::new(recorder, Duration::from_millis(50), "run", "demo")
            .with_sink(sink.clone());

        let task = tokio::spawn(reporter.run());
        tokio::time::sleep(Duration::from_millis(80)).await;
        task.abort();

        let points = sink.points.lock();
        assert!(!points.is_empty());
        assert!((points[0].requests_per_second - 100.0).abs() < 1e-6);
    }
}

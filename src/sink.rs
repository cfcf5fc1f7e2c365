//! External time-series metrics sink.
//!
//! The reporter pushes one [`SummaryPoint`] per tick. Delivery failures are
//! the reporter's to log; a sink never affects the benchmark itself.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use std::time::Duration;
use tracing::{debug, warn};

/// One per-tick summary, tagged with the run and the client under test
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryPoint {
    pub run_id: String,
    pub client: String,
    pub mean_latency: Duration,
    pub requests_per_second: f64,
    pub timestamp: DateTime<Utc>,
}

impl SummaryPoint {
    /// Render as an InfluxDB line-protocol record with second precision
    ///
    /// Latency is written in microseconds and throughput as an integer.
    pub fn to_line_protocol(&self) -> String {
        format!(
            "benchmark,run={},client={} latency={},qps={}i {}",
            escape_tag(&self.run_id),
            escape_tag(&self.client),
            self.mean_latency.as_nanos() as f64 / 1_000.0,
            self.requests_per_second.round() as i64,
            self.timestamp.timestamp()
        )
    }
}

fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Destination for per-tick summary points
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn push(&self, point: &SummaryPoint) -> Result<()>;
}

/// InfluxDB 1.x HTTP API sink
#[derive(Debug, Clone)]
pub struct InfluxSink {
    http: reqwest::Client,
    write_url: Url,
}

impl InfluxSink {
    /// Connect to the InfluxDB instance at `addr` and make sure the database exists
    ///
    /// A failure to create the database is logged and otherwise ignored; the
    /// subsequent writes report their own errors.
    pub async fn connect(addr: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build InfluxDB HTTP client")?;
        let base = base_url(addr)?;

        let mut query_url = base.join("query")?;
        query_url.query_pairs_mut().append_pair(
            "q",
            &format!("CREATE DATABASE {}", crate::defaults::INFLUX_DATABASE),
        );
        match http.post(query_url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("InfluxDB database {} ready", crate::defaults::INFLUX_DATABASE)
            }
            Ok(response) => warn!("InfluxDB create database returned {}", response.status()),
            Err(e) => warn!("failed to create InfluxDB database: {}", e),
        }

        Ok(Self {
            http,
            write_url: write_url(&base)?,
        })
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }
}

fn base_url(addr: &str) -> Result<Url> {
    let raw = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    };
    let mut url = Url::parse(&raw).with_context(|| format!("invalid InfluxDB address {:?}", addr))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn write_url(base: &Url) -> Result<Url> {
    let mut url = base.join("write")?;
    url.query_pairs_mut()
        .append_pair("db", crate::defaults::INFLUX_DATABASE)
        .append_pair("precision", "s");
    Ok(url)
}

#[async_trait]
impl MetricsSink for InfluxSink {
    async fn push(&self, point: &SummaryPoint) -> Result<()> {
        let response = self
            .http
            .post(self.write_url.clone())
            .body(point.to_line_protocol())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("InfluxDB write returned {}", response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point() -> SummaryPoint {
        SummaryPoint {
            run_id: "6f1c".to_string(),
            client: "tcp-echo".to_string(),
            mean_latency: Duration::from_micros(1_500),
            requests_per_second: 2_499.6,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_line_protocol() {
        assert_eq!(
            point().to_line_protocol(),
            "benchmark,run=6f1c,client=tcp-echo latency=1500,qps=2500i 1700000000"
        );
    }

    #[test]
    fn test_tag_escaping() {
        assert_eq!(escape_tag("a b,c=d"), "a\\ b\\,c\\=d");
    }

    #[test]
    fn test_urls() {
        let base = base_url("127.0.0.1:8086").unwrap();
        assert_eq!(base.as_str(), "http://127.0.0.1:8086/");
        assert_eq!(
            write_url(&base).unwrap().as_str(),
            "http://127.0.0.1:8086/write?db=fperf&precision=s"
        );

        let prefixed = base_url("https://metrics.example.com/influx").unwrap();
        assert_eq!(
            write_url(&prefixed).unwrap().as_str(),
            "https://metrics.example.com/influx/write?db=fperf&precision=s"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_not_fatal_on_connect() {
        let sink = InfluxSink::connect("127.0.0.1:1").await.unwrap();
        assert!(sink.push(&point()).await.is_err());
    }
}

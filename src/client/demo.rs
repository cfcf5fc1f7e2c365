//! Simulated plug-in that sleeps instead of talking to a server.
//!
//! Useful for exercising the harness itself: every request takes
//! `--latency` plus a uniformly random `[0, --jitter)` extra delay.

use super::{parse_client_args, Capabilities, Client, ClientError, Stream};
use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::info;

pub const NAME: &str = "demo";

/// Options of the demo client
#[derive(Parser, Debug, Clone)]
#[clap(name = "demo", about = "Simulated client with configurable latency")]
pub struct DemoArgs {
    /// Base latency of every request
    #[clap(long, default_value = "100ms", value_parser = crate::cli::parse_duration)]
    pub latency: Duration,

    /// Upper bound of the random extra latency added to each request
    #[clap(long, default_value = "0ms", value_parser = crate::cli::parse_duration)]
    pub jitter: Duration,
}

#[derive(Debug)]
pub struct DemoClient {
    args: DemoArgs,
    connected: bool,
}

impl DemoClient {
    pub fn new(args: DemoArgs) -> Self {
        Self {
            args,
            connected: false,
        }
    }

    pub fn from_args(args: &[String]) -> Result<Self> {
        Ok(Self::new(parse_client_args(NAME, args)?))
    }

    fn delay(&self) -> Duration {
        simulated_delay(self.args.latency, self.args.jitter)
    }
}

fn simulated_delay(latency: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return latency;
    }
    let extra = rand::thread_rng().gen_range(0..jitter.as_nanos() as u64);
    latency + Duration::from_nanos(extra)
}

#[async_trait]
impl Client for DemoClient {
    async fn dial(&mut self, addr: &str) -> Result<()> {
        info!("Dial to {}", addr);
        self.connected = true;
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::BOTH
    }

    async fn request(&self) -> Result<()> {
        if !self.connected {
            return Err(ClientError::NotConnected.into());
        }
        tokio::time::sleep(self.delay()).await;
        Ok(())
    }

    async fn create_stream(&self, _shutdown: watch::Receiver<bool>) -> Result<Box<dyn Stream>> {
        if !self.connected {
            return Err(ClientError::NotConnected.into());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(DemoStream {
            latency: self.args.latency,
            jitter: self.args.jitter,
            tx,
            rx: Mutex::new(rx),
        }))
    }
}

/// In-memory stream: each send is "answered" one delay after it is received
struct DemoStream {
    latency: Duration,
    jitter: Duration,
    tx: mpsc::UnboundedSender<()>,
    rx: Mutex<mpsc::UnboundedReceiver<()>>,
}

#[async_trait]
impl Stream for DemoStream {
    async fn do_send(&self) -> Result<()> {
        self.tx
            .send(())
            .map_err(|_| anyhow::anyhow!("demo stream closed"))
    }

    async fn do_recv(&self) -> Result<()> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("demo stream closed"))?;
        tokio::time::sleep(simulated_delay(self.latency, self.jitter)).await;
        Ok(())
    }
}

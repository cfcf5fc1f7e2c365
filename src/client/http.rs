//! HTTP plug-in: one request per call, unary only.

use super::{parse_client_args, Capabilities, Client, ClientError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use reqwest::{Method, Url};
use std::time::Duration;
use tracing::debug;

pub const NAME: &str = "http";

/// Options of the HTTP client
#[derive(Parser, Debug, Clone)]
#[clap(name = "http", about = "HTTP performance benchmark client")]
pub struct HttpArgs {
    /// Request method (GET, POST, HEAD, OPTIONS, PUT, DELETE)
    #[clap(long, default_value = "GET")]
    pub method: String,

    /// Value of the User-Agent header
    #[clap(long, default_value = "fperf-http-client")]
    pub user_agent: String,

    /// Timeout of a single request
    #[clap(long, default_value = "10s", value_parser = crate::cli::parse_duration)]
    pub timeout: Duration,

    /// Open a new connection for every request
    #[clap(long, default_value_t = false)]
    pub no_keepalive: bool,

    /// Target URL; defaults to the server address
    pub url: Option<String>,
}

#[derive(Debug)]
pub struct HttpClient {
    args: HttpArgs,
    method: Method,
    target: Option<(reqwest::Client, Url)>,
}

impl HttpClient {
    pub fn new(args: HttpArgs) -> Result<Self> {
        let method = Method::from_bytes(args.method.to_uppercase().as_bytes()).map_err(|_| {
            ClientError::InvalidArguments(format!("unknown HTTP method {:?}", args.method))
        })?;
        Ok(Self {
            args,
            method,
            target: None,
        })
    }

    pub fn from_args(args: &[String]) -> Result<Self> {
        Self::new(parse_client_args(NAME, args)?)
    }
}

/// Turn a bare `host:port` into an `http://` URL
fn normalize_url(raw: &str) -> Result<Url> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };
    Url::parse(&with_scheme).with_context(|| format!("invalid URL {:?}", raw))
}

#[async_trait]
impl Client for HttpClient {
    async fn dial(&mut self, addr: &str) -> Result<()> {
        let url = normalize_url(self.args.url.as_deref().unwrap_or(addr))?;

        let mut builder = reqwest::Client::builder()
            .timeout(self.args.timeout)
            .user_agent(self.args.user_agent.clone());
        if self.args.no_keepalive {
            builder = builder.pool_max_idle_per_host(0);
        }
        let client = builder.build().context("failed to build HTTP client")?;

        debug!("HTTP client targeting {} {}", self.method, url);
        self.target = Some((client, url));
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::UNARY
    }

    async fn request(&self) -> Result<()> {
        let (client, url) = self.target.as_ref().ok_or(ClientError::NotConnected)?;
        let response = client
            .request(self.method.clone(), url.clone())
            .send()
            .await?;
        // Drain the body so the connection can be reused.
        response.bytes().await?;
        Ok(())
    }
}

//! # Client Plug-in Contract and Registry
//!
//! A plug-in is anything that can connect to a server and issue requests
//! against it. The harness never looks at payloads, only at timing and at
//! success or failure, so the contract is deliberately small:
//!
//! - [`Client::dial`] connects to the target address once, at startup.
//! - [`Client::request`] performs one blocking request (unary capability).
//! - [`Client::create_stream`] opens an ordered channel (stream capability)
//!   whose [`Stream::do_send`] and [`Stream::do_recv`] may be driven from two
//!   different tasks at the same time.
//!
//! Plug-ins declare what they support through [`Client::capabilities`]; the
//! unsupported capability methods fall back to a [`ClientError::Unsupported`]
//! error.
//!
//! Plug-ins are discovered through an explicit [`Registry`] that maps a name
//! to a factory and a description. The binary populates it from the builtin
//! list; tests build their own registry with fakes.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::watch;

pub mod demo;
pub mod http;
pub mod tcp_echo;

pub use demo::DemoClient;
pub use http::HttpClient;
pub use tcp_echo::TcpEchoClient;

/// One of the two request models a plug-in may implement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    Unary,
    Stream,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Unary => write!(f, "unary"),
            Capability::Stream => write!(f, "stream"),
        }
    }
}

/// The set of capabilities a plug-in declares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub unary: bool,
    pub stream: bool,
}

impl Capabilities {
    pub const UNARY: Self = Self {
        unary: true,
        stream: false,
    };
    pub const STREAM: Self = Self {
        unary: false,
        stream: true,
    };
    pub const BOTH: Self = Self {
        unary: true,
        stream: true,
    };

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Unary => self.unary,
            Capability::Stream => self.stream,
        }
    }
}

/// Errors raised by the plug-in contract itself
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client does not implement the {0} capability")]
    Unsupported(Capability),

    #[error("client is not connected, dial must succeed first")]
    NotConnected,

    #[error("invalid client arguments: {0}")]
    InvalidArguments(String),
}

/// An ordered send/receive channel opened over a [`Client`]
///
/// The i-th successful `do_recv` corresponds to the i-th `do_send` on the
/// same stream.
#[async_trait]
pub trait Stream: Send + Sync {
    async fn do_send(&self) -> Result<()>;

    async fn do_recv(&self) -> Result<()>;
}

/// A connection to the benchmark target, created by a plug-in factory
#[async_trait]
pub trait Client: Send + Sync {
    /// Connect to the target address; failure aborts the run
    async fn dial(&mut self, addr: &str) -> Result<()>;

    /// Request models this client implements
    fn capabilities(&self) -> Capabilities;

    /// Issue one request and wait for its completion
    async fn request(&self) -> Result<()> {
        Err(ClientError::Unsupported(Capability::Unary).into())
    }

    /// Open a new stream; `shutdown` flips to `true` when the run is stopping
    async fn create_stream(&self, shutdown: watch::Receiver<bool>) -> Result<Box<dyn Stream>> {
        let _ = shutdown;
        Err(ClientError::Unsupported(Capability::Stream).into())
    }
}

/// Factory building an undialed client from the plug-in's own arguments
pub type ClientFactory = Box<dyn Fn(&[String]) -> Result<Box<dyn Client>> + Send + Sync>;

/// A registered plug-in
pub struct RegistryEntry {
    factory: ClientFactory,
    description: String,
}

impl RegistryEntry {
    /// Build a new, undialed client
    pub fn create(&self, args: &[String]) -> Result<Box<dyn Client>> {
        (self.factory)(args)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Name → factory mapping of every available plug-in
#[derive(Default)]
pub struct Registry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every builtin plug-in
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (name, factory, description) in builtin_clients() {
            registry.register(name, factory, description);
        }
        registry
    }

    /// Register a plug-in, replacing any previous one with the same name
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: ClientFactory,
        description: impl Into<String>,
    ) {
        self.entries.insert(
            name.into(),
            RegistryEntry {
                factory,
                description: description.into(),
            },
        );
    }

    pub fn lookup(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// `(name, description)` pairs, sorted by name
    pub fn descriptions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.as_str(), entry.description()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("clients", &self.names())
            .finish()
    }
}

/// The static list of builtin plug-ins
fn builtin_clients() -> Vec<(&'static str, ClientFactory, &'static str)> {
    let demo_factory: ClientFactory =
        Box::new(|args: &[String]| Ok(Box::new(DemoClient::from_args(args)?) as Box<dyn Client>));
    let http_factory: ClientFactory =
        Box::new(|args: &[String]| Ok(Box::new(HttpClient::from_args(args)?) as Box<dyn Client>));
    let tcp_echo_factory: ClientFactory = Box::new(|args: &[String]| {
        Ok(Box::new(TcpEchoClient::from_args(args)?) as Box<dyn Client>)
    });

    vec![
        (
            demo::NAME,
            demo_factory,
            "Simulated client with configurable latency, unary and stream",
        ),
        (http::NAME, http_factory, "HTTP performance benchmark client"),
        (
            tcp_echo::NAME,
            tcp_echo_factory,
            "Length-prefixed TCP echo client, unary and stream",
        ),
    ]
}

/// Parse plug-in arguments with clap, prefixing the plug-in name as argv[0]
pub(crate) fn parse_client_args<T: clap::Parser>(name: &str, args: &[String]) -> Result<T> {
    T::try_parse_from(std::iter::once(name.to_string()).chain(args.iter().cloned()))
        .map_err(|e| ClientError::InvalidArguments(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullClient;

    #[async_trait]
    impl Client for NullClient {
        async fn dial(&mut self, _addr: &str) -> Result<()> {
            Ok(())
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = Registry::with_builtins();
        assert_eq!(registry.names(), vec!["demo", "http", "tcp-echo"]);
        assert!(registry.lookup("demo").is_some());
        assert!(registry.lookup("missing").is_none());
        assert!(registry
            .descriptions()
            .all(|(_, description)| !description.is_empty()));
    }

    #[test]
    fn test_register_and_create() {
        let mut registry = Registry::new();
        assert!(registry.is_empty());

        registry.register(
            "null",
            Box::new(|_: &[String]| Ok(Box::new(NullClient) as Box<dyn Client>)),
            "does nothing",
        );
        assert_eq!(registry.len(), 1);

        let entry = registry.lookup("null").unwrap();
        assert_eq!(entry.description(), "does nothing");
        let client = entry.create(&[]).unwrap();
        assert_eq!(client.capabilities(), Capabilities::default());
    }

    #[tokio::test]
    async fn test_unsupported_capabilities_error() {
        let client = NullClient;
        let err = client.request().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::Unsupported(Capability::Unary))
        ));

        let (_tx, rx) = watch::channel(false);
        let err = client.create_stream(rx).await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::Unsupported(Capability::Stream))
        ));
    }

    #[test]
    fn test_capabilities() {
        assert!(Capabilities::BOTH.supports(Capability::Unary));
        assert!(Capabilities::BOTH.supports(Capability::Stream));
        assert!(!Capabilities::UNARY.supports(Capability::Stream));
        assert!(!Capabilities::STREAM.supports(Capability::Unary));
        assert_eq!(Capability::Stream.to_string(), "stream");
    }
}

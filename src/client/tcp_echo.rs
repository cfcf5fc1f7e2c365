//! TCP echo plug-in.
//!
//! Frames are a 4-byte little-endian length followed by the payload. The
//! server is expected to echo every frame back unchanged. The dialed
//! connection serves unary requests. A request that fails partway through a
//! frame leaves that connection out of sync, so it is dropped and the next
//! request reconnects. Every stream opens its own connection
//! and splits it into independently locked read and write halves, so a
//! sender task and a receiver task can drive the same stream concurrently.

use super::{parse_client_args, Capabilities, Client, ClientError, Stream};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::debug;

pub const NAME: &str = "tcp-echo";

/// Frames larger than this are treated as a corrupted stream
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Options of the TCP echo client
#[derive(Parser, Debug, Clone)]
#[clap(name = "tcp-echo", about = "Length-prefixed TCP echo client")]
pub struct TcpEchoArgs {
    /// Payload size of every frame in bytes
    #[clap(short = 's', long, default_value_t = 64)]
    pub payload_size: usize,
}

#[derive(Debug)]
pub struct TcpEchoClient {
    payload: Vec<u8>,
    address: Option<String>,
    connection: Mutex<Option<TcpStream>>,
}

impl TcpEchoClient {
    pub fn new(args: TcpEchoArgs) -> Result<Self> {
        if args.payload_size > MAX_FRAME_SIZE {
            return Err(ClientError::InvalidArguments(format!(
                "payload size {} exceeds the {} byte frame limit",
                args.payload_size, MAX_FRAME_SIZE
            ))
            .into());
        }
        Ok(Self {
            payload: vec![0xA5; args.payload_size],
            address: None,
            connection: Mutex::new(None),
        })
    }

    pub fn from_args(args: &[String]) -> Result<Self> {
        Self::new(parse_client_args(NAME, args)?)
    }
}

async fn connect(addr: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Write one length-prefixed frame
async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, returning its payload length
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> Result<usize> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(anyhow!("frame too large: {} bytes", len));
    }
    buf.resize(len, 0);
    reader.read_exact(buf).await?;
    Ok(len)
}

#[async_trait]
impl Client for TcpEchoClient {
    async fn dial(&mut self, addr: &str) -> Result<()> {
        let stream = connect(addr).await?;
        debug!("tcp-echo connected to {}", addr);
        self.address = Some(addr.to_string());
        *self.connection.get_mut() = Some(stream);
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::BOTH
    }

    async fn request(&self) -> Result<()> {
        let addr = self.address.as_deref().ok_or(ClientError::NotConnected)?;
        let mut connection = self.connection.lock().await;
        if connection.is_none() {
            debug!("tcp-echo reconnecting to {}", addr);
            *connection = Some(connect(addr).await?);
        }
        let Some(stream) = connection.as_mut() else {
            return Err(ClientError::NotConnected.into());
        };

        let mut buf = Vec::with_capacity(self.payload.len());
        let result = match write_frame(stream, &self.payload).await {
            Ok(()) => read_frame(stream, &mut buf).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if result.is_err() {
            *connection = None;
        }
        result
    }

    async fn create_stream(&self, _shutdown: watch::Receiver<bool>) -> Result<Box<dyn Stream>> {
        let addr = self.address.as_deref().ok_or(ClientError::NotConnected)?;
        let (reader, writer) = connect(addr).await?.into_split();
        Ok(Box::new(TcpEchoStream {
            payload: self.payload.clone(),
            reader: Mutex::new((reader, Vec::with_capacity(self.payload.len()))),
            writer: Mutex::new(writer),
        }))
    }
}

struct TcpEchoStream {
    payload: Vec<u8>,
    reader: Mutex<(OwnedReadHalf, Vec<u8>)>,
    writer: Mutex<OwnedWriteHalf>,
}

#[async_trait]
impl Stream for TcpEchoStream {
    async fn do_send(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &self.payload).await
    }

    async fn do_recv(&self) -> Result<()> {
        let mut guard = self.reader.lock().await;
        let (reader, buf) = &mut *guard;
        read_frame(reader, buf).await?;
        Ok(())
    }
}

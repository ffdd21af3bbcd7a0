use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::Result;

/// Byte stream a session runs over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Builds the ordered, reliable byte stream a session speaks MQTT over.
///
/// Invoked once per connection attempt; reconnects call it again. TLS and
/// WebSocket stacks plug in by implementing this on their own connectors.
#[async_trait]
pub trait Transport: Sync + Send {
    async fn connect(&self) -> Result<Box<dyn AsyncStream>>;
}

/// Plain TCP transport.
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    pub fn new<T: Into<String>>(addr: T) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<Box<dyn AsyncStream>> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// In-memory transport for tests: every [`accept`](DuplexAcceptor::accept)
/// call queues one duplex pipe whose far end the session will pick up on its
/// next connection attempt.
pub struct DuplexTransport {
    rx: Mutex<futures::channel::mpsc::UnboundedReceiver<DuplexStream>>,
}

pub struct DuplexAcceptor {
    tx: futures::channel::mpsc::UnboundedSender<DuplexStream>,
}

impl DuplexTransport {
    pub fn pair() -> (Self, DuplexAcceptor) {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        (Self { rx: Mutex::new(rx) }, DuplexAcceptor { tx })
    }
}

impl DuplexAcceptor {
    /// Provision the next connection; returns the broker-side stream.
    pub fn accept(&self) -> DuplexStream {
        let (client, broker) = tokio::io::duplex(64 * 1024);
        let _ = self.tx.unbounded_send(client);
        broker
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn connect(&self) -> Result<Box<dyn AsyncStream>> {
        use futures::StreamExt;
        let stream = self.rx.lock().await.next().await;
        match stream {
            Some(io) => Ok(Box::new(io)),
            None => Err(anyhow::anyhow!("transport exhausted")),
        }
    }
}

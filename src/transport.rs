//! Byte stream transports that sessions run on.
//!
//! A session only needs an ordered, reliable sink and stream of byte chunks.
//! Encryption or authentication can be layered underneath by implementing
//! [Dialer] and [Listener] for a transport that yields such a pair.
use anyhow::Context as _;
use futures::prelude::*;
use futures::stream::BoxStream;
use std::pin::Pin;

use crate::utils::DynError;

pub type BoxByteSink = Pin<Box<dyn Sink<Vec<u8>, Error = DynError> + Send>>;

pub type BoxByteStream = BoxStream<'static, Result<Vec<u8>, DynError>>;

/// Duplex byte connection to a peer.
pub struct Connection {
    pub(crate) send: BoxByteSink,
    pub(crate) receive: BoxByteStream,
}

impl Connection {
    pub fn new<Sink_, TryStream_>(send: Sink_, receive: TryStream_) -> Self
    where
        Sink_: Sink<Vec<u8>> + Send + 'static,
        Sink_::Error: std::error::Error + Send + Sync + 'static,
        TryStream_: TryStream<Ok = Vec<u8>> + Send + 'static,
        TryStream_::Error: std::error::Error + Send + Sync + 'static,
    {
        Self {
            send: Box::pin(send.sink_map_err(|error| DynError::new(error))),
            receive: receive.map_err(|error| DynError::new(error)).boxed(),
        }
    }

    /// Create a connection from a raw byte stream like a TCP socket.
    pub fn from_io(io: impl AsyncRead + AsyncWrite + Send + 'static) -> Self {
        let (read, write) = io.split();
        Self::new(write.into_sink(), crate::utils::read_to_stream(read))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("send", &"BoxByteSink")
            .field("receive", &"BoxByteStream")
            .finish()
    }
}

/// Source of incoming connections for a [crate::Server].
#[async_trait::async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> std::io::Result<Connection>;
}

#[async_trait::async_trait]
impl Listener for async_std::net::TcpListener {
    async fn accept(&self) -> std::io::Result<Connection> {
        let (stream, address) = async_std::net::TcpListener::accept(self).await?;
        tracing::debug!(%address, "accepted connection");
        Ok(Connection::from_io(stream))
    }
}

#[cfg(unix)]
#[async_trait::async_trait]
impl Listener for async_std::os::unix::net::UnixListener {
    async fn accept(&self) -> std::io::Result<Connection> {
        let (stream, address) = async_std::os::unix::net::UnixListener::accept(self).await?;
        tracing::debug!(?address, "accepted connection");
        Ok(Connection::from_io(stream))
    }
}

/// Establishes connections for a [crate::Client].
///
/// A dialer holds everything needed to connect again, so
/// [crate::Client::reconnect] can reuse it.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> anyhow::Result<Connection>;
}

/// Connects to a TCP address.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    address: String,
}

impl TcpDialer {
    pub fn new(address: impl ToString) -> Self {
        Self {
            address: address.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> anyhow::Result<Connection> {
        let stream = async_std::net::TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("Failed to connect to {}", self.address))?;
        Ok(Connection::from_io(stream))
    }
}

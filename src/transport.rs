//! Byte-stream transports: outbound connectors and inbound listeners.
//!
//! Anything that is `AsyncRead + AsyncWrite` can carry a connection. TCP and
//! Unix domain sockets are provided; other streams can be plugged in by
//! implementing [`Connector`].

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpListener as TokioTcpListener, TcpStream, UnixListener as TokioUnixListener, UnixStream,
    },
};
use tracing::trace;

use crate::error::*;

/// A bidirectional byte stream usable by a connection.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Opens a fresh transport for every connection attempt a client makes.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> std::io::Result<Box<dyn Transport>>;
}

/// Connects to a TCP address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> std::io::Result<Box<dyn Transport>> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        trace!("TCP connection established to: {}", self.addr);
        Ok(Box::new(stream))
    }
}

/// Connects to a Unix domain socket.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
}

impl UnixConnector {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> std::io::Result<Box<dyn Transport>> {
        let stream = UnixStream::connect(&self.path).await?;
        trace!("Unix connection established to: {:?}", self.path);
        Ok(Box::new(stream))
    }
}

/// TCP listener for accepting RPC connections.
pub(crate) struct TcpListener {
    /// The underlying tokio TCP listener.
    inner: TokioTcpListener,
}

impl TcpListener {
    /// Binds a TCP listener to the given address.
    pub async fn bind(addr: &str) -> Result<Self> {
        trace!("Binding TCP listener to address: {}", addr);
        let listener = TokioTcpListener::bind(addr).await?;
        Ok(Self { inner: listener })
    }
}

/// Unix domain socket listener for accepting RPC connections.
pub(crate) struct UnixListener {
    /// The underlying tokio Unix listener.
    inner: TokioUnixListener,
}

impl UnixListener {
    /// Binds a Unix listener to the given path.
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Self> {
        trace!("Binding Unix listener to path: {:?}", path.as_ref());
        let listener = TokioUnixListener::bind(path)?;
        Ok(Self { inner: listener })
    }
}

/// Types that can accept incoming connections.
#[async_trait]
pub(crate) trait Accept: Send + Sync {
    /// The stream type produced by accepting a connection.
    type Stream: Transport;
    async fn accept(&self) -> Result<Self::Stream>;
}

#[async_trait]
impl Accept for TcpListener {
    type Stream = TcpStream;
    async fn accept(&self) -> Result<TcpStream> {
        let (stream, addr) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        trace!("Accepted TCP connection from: {}", addr);
        Ok(stream)
    }
}

#[async_trait]
impl Accept for UnixListener {
    type Stream = UnixStream;
    async fn accept(&self) -> Result<UnixStream> {
        let (stream, _) = self.inner.accept().await?;
        trace!("Accepted Unix connection");
        Ok(stream)
    }
}

/// Either a TCP or Unix domain socket listener.
pub(crate) enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix domain socket listener.
    Unix(UnixListener),
}

impl Listener {
    /// Returns the bound address. Only TCP listeners have one.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self {
            Listener::Tcp(tcp_listener) => Ok(tcp_listener.inner.local_addr()?),
            Listener::Unix(_) => Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets don't have a SocketAddr",
            ))),
        }
    }
}

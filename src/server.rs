//! Server engine: listening acceptor and single-connection sessions.
//!
//! Every accepted connection gets its own [`ServerConnection`], whose wire format
//! is detected from the first byte the peer sends. Requests are passed to a
//! synchronous [`Handler`] on tokio's blocking pool, and its outcome is written
//! back as a response or an error unless the request was a notification.

use std::{io, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use rmpv::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    codec::WireFormat,
    connection::{Dispatch, Link, DEFAULT_READ_BUFFER_SIZE},
    error::*,
    message::*,
    transport::{Accept, Listener, TcpListener, Transport, UnixListener},
};

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(50);

/// Application logic behind a server.
///
/// Called once per inbound request with the method name and its arguments. A
/// returned [`ServiceError`] is reported to the caller as an error response.
/// Implementations may block.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, method: &str, params: Params) -> std::result::Result<Value, ServiceError>;
}

impl<F> Handler for F
where
    F: Fn(&str, Params) -> std::result::Result<Value, ServiceError> + Send + Sync + 'static,
{
    fn handle(&self, method: &str, params: Params) -> std::result::Result<Value, ServiceError> {
        self(method, params)
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Size of the buffer inbound bytes are read into.
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }
}

/// Server side of a connection: runs the handler for every inbound request.
struct ServerRole<H> {
    handler: Arc<H>,
}

impl<H: Handler> Dispatch for ServerRole<H> {
    fn dispatch(&self, link: &Arc<Link>, message: Message) {
        match message {
            Message::Request(request) => {
                let handler = self.handler.clone();
                let link = link.clone();
                tokio::spawn(serve_request(handler, link, request));
            }
            Message::Response(response) => {
                warn!("{}", ProtocolError::UnexpectedResponse { id: response.id });
            }
            Message::Error(error) => {
                warn!("{}", ProtocolError::UnexpectedResponse { id: error.id });
            }
        }
    }

    fn connection_lost(&self, error: Option<Arc<io::Error>>) {
        match error {
            Some(e) => debug!("client connection failed: {}", e),
            None => trace!("client disconnected"),
        }
    }
}

/// Runs the handler for one request and writes the reply, if one is expected.
async fn serve_request<H: Handler>(handler: Arc<H>, link: Arc<Link>, request: Request) {
    let Request { id, method, params } = request;
    let name = method.clone();
    let outcome = tokio::task::spawn_blocking(move || handler.handle(&method, params)).await;

    let Some(id) = id else {
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!("notification {} failed: {}", name, e),
            Err(e) => error!("notification handler for {} panicked: {}", name, e),
        }
        return;
    };

    let frame = link.encode(|codec| match &outcome {
        Ok(Ok(value)) => codec.encode_response(id, value),
        Ok(Err(e)) => {
            debug!("request {} ({}) failed: {}", id, name, e);
            codec.encode_error(id, &e.description)
        }
        Err(e) => {
            error!("handler for {} panicked: {}", name, e);
            codec.encode_error(id, "handler panicked")
        }
    });
    // A result the wire format can not carry is reported as an error instead.
    let frame = match frame {
        Ok(frame) => frame,
        Err(e) => {
            warn!("could not encode reply to {}: {}", id, e);
            match link.encode(|codec| codec.encode_error(id, &e.to_string())) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("could not encode error reply to {}: {}", id, e);
                    return;
                }
            }
        }
    };
    if let Err(e) = link.send(&frame).await {
        debug!("could not send reply to {}: {}", id, e);
    }
}

/// Server side of a single established connection.
///
/// Dropping the value does not close the connection; it keeps serving until
/// the peer disconnects or [`ServerConnection::close`] is called.
#[derive(Clone)]
pub struct ServerConnection {
    link: Arc<Link>,
}

impl ServerConnection {
    /// Starts serving `stream` with `handler`.
    pub fn new<S, H>(stream: S, handler: H, config: ServerConfig) -> Self
    where
        S: Transport,
        H: Handler,
    {
        Self::with_shared_handler(stream, Arc::new(handler), &config)
    }

    fn with_shared_handler<S, H>(stream: S, handler: Arc<H>, config: &ServerConfig) -> Self
    where
        S: Transport,
        H: Handler,
    {
        let role = Arc::new(ServerRole { handler });
        Self {
            link: Link::spawn(stream, None, role, config.read_buffer_size),
        }
    }

    /// The wire format the peer speaks, once its first message has arrived.
    pub fn format(&self) -> Option<WireFormat> {
        self.link.format()
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    /// Pushes a notification to the peer. Fails with [`RpcError::FormatUnknown`]
    /// until the peer has sent something.
    pub async fn send_notification(&self, method: &str, params: impl Into<Params>) -> Result<()> {
        let params = params.into();
        let (_, frame) = self
            .link
            .encode(|codec| codec.encode_request(true, method, &params))?;
        trace!("pushing notification {}", method);
        self.link.send(&frame).await
    }

    /// Waits until the peer disconnects. A transport failure is returned as
    /// [`RpcError::Disconnect`] carrying the I/O error.
    pub async fn wait_closed(&self) -> Result<()> {
        match self.link.closed().await {
            None => Ok(()),
            Some(source) => Err(RpcError::Disconnect {
                source: Some(source),
            }),
        }
    }

    /// Closes the connection and waits for it to shut down.
    pub async fn close(&self) {
        self.link.close().await;
    }
}

/// RPC server listening on TCP or Unix domain sockets. The handler is shared
/// by every connection.
pub struct Server<H> {
    /// Handler invoked for each request.
    handler: Arc<H>,
    config: ServerConfig,
    /// The configured listener (TCP or Unix).
    listener: Option<Listener>,
    shutdown: CancellationToken,
}

impl<H: Handler> Server<H> {
    /// Creates a server with no listener yet.
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            config: ServerConfig::default(),
            listener: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the bound address of the server. Only valid for TCP listeners that have already
    /// been bound, otherwise returns an error.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.listener {
            Some(listener) => listener.local_addr(),
            None => Err(no_listener()),
        }
    }

    /// Configures the server to listen on a TCP address.
    pub async fn tcp(mut self, addr: &str) -> Result<Self> {
        self.listener = Some(Listener::Tcp(TcpListener::bind(addr).await?));
        Ok(self)
    }

    /// Configures the server to listen on a Unix domain socket.
    pub async fn unix<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.listener = Some(Listener::Unix(UnixListener::bind(path)?));
        Ok(self)
    }

    /// Accepts connections until the server is closed through a [`ServerHandle`].
    /// A failed accept is logged and does not stop the server.
    pub async fn run(self) -> Result<()> {
        let listener = self.listener.as_ref().ok_or_else(no_listener)?;
        match listener {
            Listener::Tcp(tcp_listener) => self.run_internal(tcp_listener).await,
            Listener::Unix(unix_listener) => self.run_internal(unix_listener).await,
        }
    }

    /// Runs the accept loop in the background.
    pub fn spawn(self) -> ServerHandle {
        let local_addr = self.local_addr().ok();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(self.run());
        ServerHandle {
            local_addr,
            shutdown,
            task,
        }
    }

    /// Internal run loop for accepting connections.
    async fn run_internal<L: Accept>(&self, listener: &L) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("server closed, no longer accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };
            let stream = match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    continue;
                }
            };
            ServerConnection::with_shared_handler(stream, self.handler.clone(), &self.config);
            trace!("serving new connection");
        }
    }
}

impl<F> Server<F>
where
    F: Fn(&str, Params) -> std::result::Result<Value, ServiceError> + Send + Sync + 'static,
{
    /// Helper method to create a Server from a closure.
    pub fn from_fn(f: F) -> Self {
        Self::new(f)
    }
}

/// Handle to a server running in the background.
pub struct ServerHandle {
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    /// The bound TCP address, if the server listens on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stops accepting connections and waits until the listener is released.
    /// Connections already accepted keep running.
    pub async fn close(self) -> Result<()> {
        self.shutdown.cancel();
        self.task.await.map_err(io::Error::other)?
    }
}

fn no_listener() -> RpcError {
    RpcError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "No listener configured",
    ))
}

//! Client engine: lazy, race-safe connection setup and call correlation.
//!
//! A [`Client`] does not connect when it is built. The first call or
//! notification opens the connection through a gate that lets exactly one
//! caller connect while everyone else waits for, and then shares, the outcome.
use std::{
    collections::HashMap,
    future::Future,
    io,
    path::Path,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, PoisonError, RwLock,
    },
    task::{Context, Poll},
    time::Duration,
};

use rmpv::Value;
use tokio::{
    sync::{oneshot, Mutex},
    time::timeout,
};
use tracing::{debug, trace, warn};

use crate::{
    codec::WireFormat,
    connection::{Dispatch, Link, DEFAULT_READ_BUFFER_SIZE},
    error::*,
    message::*,
    transport::{Connector, TcpConnector, UnixConnector},
};

/// Default limit on how long establishing a connection may take.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Callback for notifications pushed by the peer.
pub type NotificationCallback = Arc<dyn Fn(String, Params) + Send + Sync>;

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Wire format used for the connection.
    pub format: WireFormat,
    /// Limit on a single connection attempt.
    pub connect_timeout: Duration,
    /// Size of the buffer inbound bytes are read into.
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            format: WireFormat::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }
}

/// Lifecycle of a client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection has been attempted yet.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// A live connection is available.
    Connected,
    /// The connection was lost or the client was closed.
    Closed,
}

/// Calls awaiting a response, keyed by request id.
#[derive(Default)]
struct PendingCalls {
    inner: StdMutex<PendingInner>,
}

#[derive(Default)]
struct PendingInner {
    calls: HashMap<RequestId, oneshot::Sender<Result<Value>>>,
    /// Set once the connection is gone; nothing may register after that.
    lost: bool,
}

impl PendingCalls {
    fn lock(&self) -> std::sync::MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: RequestId, sender: oneshot::Sender<Result<Value>>) -> Result<()> {
        let mut inner = self.lock();
        if inner.lost {
            return Err(RpcError::Disconnect { source: None });
        }
        if let Some(previous) = inner.calls.insert(id, sender) {
            warn!("request id {} reused while still outstanding", id);
            // Receiver may be gone already; ignore send errors.
            drop(previous.send(Err(RpcError::Protocol(ProtocolError::InvalidMessage(
                format!("request id {} was reused before a response arrived", id),
            )))));
        }
        Ok(())
    }

    fn remove(&self, id: RequestId) {
        self.lock().calls.remove(&id);
    }

    /// Completes the call registered under `id`.
    fn resolve(
        &self,
        id: RequestId,
        result: Result<Value>,
    ) -> std::result::Result<(), ProtocolError> {
        let sender = self.lock().calls.remove(&id);
        match sender {
            Some(sender) => {
                // Receiver may be dropped if the caller gave up waiting; ignore send errors.
                drop(sender.send(result));
                Ok(())
            }
            None => Err(ProtocolError::UnexpectedResponse { id }),
        }
    }

    /// Fails every outstanding call and refuses new ones. Returns how many were failed.
    fn fail_all(&self, source: Option<Arc<io::Error>>) -> usize {
        let calls = {
            let mut inner = self.lock();
            inner.lost = true;
            std::mem::take(&mut inner.calls)
        };
        let count = calls.len();
        for (_, sender) in calls {
            drop(sender.send(Err(RpcError::Disconnect {
                source: source.clone(),
            })));
        }
        count
    }

    fn len(&self) -> usize {
        self.lock().calls.len()
    }

    fn is_lost(&self) -> bool {
        self.lock().lost
    }
}

/// Removes a registered call again unless disarmed, e.g. when the caller
/// stops waiting while its frame is still being written.
struct Registration<'a> {
    pending: &'a PendingCalls,
    id: Option<RequestId>,
}

impl Registration<'_> {
    fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.pending.remove(id);
        }
    }
}

/// Client side of a connection: resolves responses and forwards notifications.
struct ClientRole {
    pending: PendingCalls,
    on_notification: Arc<RwLock<Option<NotificationCallback>>>,
}

impl Dispatch for ClientRole {
    fn dispatch(&self, _link: &Arc<Link>, message: Message) {
        match message {
            Message::Response(response) => {
                if let Err(e) = self.pending.resolve(response.id, Ok(response.result)) {
                    warn!("{}", e);
                }
            }
            Message::Error(error) => {
                let result = Err(RpcError::Remote {
                    description: error.description,
                });
                if let Err(e) = self.pending.resolve(error.id, result) {
                    warn!("{}", e);
                }
            }
            Message::Request(Request {
                id: Some(id),
                method,
                ..
            }) => {
                warn!(
                    "{} (method {:?}); clients do not serve requests",
                    ProtocolError::UnexpectedRequest { id },
                    method
                );
            }
            Message::Request(Request {
                id: None,
                method,
                params,
            }) => {
                let callback = self
                    .on_notification
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match callback {
                    Some(callback) => {
                        tokio::task::spawn_blocking(move || callback(method, params));
                    }
                    None => debug!("unhandled notification: method={}", method),
                }
            }
        }
    }

    fn connection_lost(&self, error: Option<Arc<io::Error>>) {
        let failed = self.pending.fail_all(error);
        if failed > 0 {
            debug!("connection lost with {} calls outstanding", failed);
        }
    }
}

/// One established connection of a client.
struct Session {
    link: Arc<Link>,
    role: Arc<ClientRole>,
}

impl Session {
    /// Pending calls are failed before the link reports closed, so a lost
    /// role already counts as dead.
    fn is_live(&self) -> bool {
        !self.link.is_closed() && !self.role.pending.is_lost()
    }

    async fn request(&self, method: &str, params: &Params) -> Result<PendingReply> {
        let (id, frame) = self
            .link
            .encode(|codec| codec.encode_request(false, method, params))?;
        let id = id.ok_or_else(|| {
            RpcError::Protocol(ProtocolError::InvalidMessage(
                "codec issued no id for a call".into(),
            ))
        })?;
        let (sender, receiver) = oneshot::channel();
        self.role.pending.register(id, sender)?;
        let registration = Registration {
            pending: &self.role.pending,
            id: Some(id),
        };
        trace!("calling {} with id {}", method, id);
        self.link.send(&frame).await?;
        registration.disarm();
        Ok(PendingReply { id, receiver })
    }

    async fn notify(&self, method: &str, params: &Params) -> Result<()> {
        let (_, frame) = self
            .link
            .encode(|codec| codec.encode_request(true, method, params))?;
        trace!("notifying {}", method);
        self.link.send(&frame).await
    }
}

/// Why a connection attempt failed; shared with every caller that joined the attempt.
#[derive(Debug, Clone)]
enum ConnectFailure {
    Timeout(Duration),
    Io(Arc<io::Error>),
}

impl From<ConnectFailure> for RpcError {
    fn from(failure: ConnectFailure) -> Self {
        match failure {
            ConnectFailure::Timeout(limit) => RpcError::ConnectTimeout(limit),
            ConnectFailure::Io(source) => RpcError::Connect { source },
        }
    }
}

/// State guarded by the connect gate.
#[derive(Default)]
struct Gate {
    /// Outcome of the most recent failed attempt, tagged with the number of
    /// attempts settled once it finished.
    last_failure: Option<(u64, ConnectFailure)>,
}

struct ClientInner {
    connector: Box<dyn Connector>,
    config: ClientConfig,
    on_notification: Arc<RwLock<Option<NotificationCallback>>>,
    gate: Mutex<Gate>,
    /// Number of connection attempts that have finished, successfully or not.
    settled: AtomicU64,
    connecting: AtomicBool,
    closed: AtomicBool,
    current: StdMutex<Option<Arc<Session>>>,
}

impl ClientInner {
    fn current(&self) -> std::sync::MutexGuard<'_, Option<Arc<Session>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_session(&self) -> Option<Arc<Session>> {
        self.current()
            .as_ref()
            .filter(|session| session.is_live())
            .cloned()
    }

    /// Returns the live session, connecting first if there is none.
    async fn session(&self) -> Result<Arc<Session>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        if let Some(session) = self.live_session() {
            return Ok(session);
        }

        let seen = self.settled.load(Ordering::SeqCst);
        let mut gate = self.gate.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        if let Some(session) = self.live_session() {
            return Ok(session);
        }
        // An attempt that was still running when we arrived has failed: share its outcome.
        if let Some((settled, failure)) = &gate.last_failure {
            if *settled > seen {
                return Err(failure.clone().into());
            }
        }

        self.connecting.store(true, Ordering::SeqCst);
        debug!("connecting ({} format)", self.config.format);
        let outcome = timeout(self.config.connect_timeout, self.connector.connect()).await;
        self.connecting.store(false, Ordering::SeqCst);
        let settled = self.settled.fetch_add(1, Ordering::SeqCst) + 1;

        let failure = match outcome {
            Ok(Ok(stream)) => {
                let role = Arc::new(ClientRole {
                    pending: PendingCalls::default(),
                    on_notification: self.on_notification.clone(),
                });
                let link = Link::spawn(
                    stream,
                    Some(self.config.format.codec()),
                    role.clone(),
                    self.config.read_buffer_size,
                );
                let session = Arc::new(Session { link, role });
                *self.current() = Some(session.clone());
                gate.last_failure = None;
                debug!("connected");
                return Ok(session);
            }
            Ok(Err(e)) => ConnectFailure::Io(Arc::new(e)),
            Err(_) => ConnectFailure::Timeout(self.config.connect_timeout),
        };
        warn!("connection attempt failed: {:?}", failure);
        gate.last_failure = Some((settled, failure.clone()));
        Err(failure.into())
    }
}

/// A reply that has not arrived yet. Resolves to the call's result.
#[derive(Debug)]
pub struct PendingReply {
    id: RequestId,
    receiver: oneshot::Receiver<Result<Value>>,
}

impl PendingReply {
    /// The id the call was sent with.
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::Disconnect { source: None })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// RPC client. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a client that opens its connection through `connector` on first use.
    pub fn new<C: Connector>(connector: C, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                connector: Box::new(connector),
                config,
                on_notification: Arc::new(RwLock::new(None)),
                gate: Mutex::new(Gate::default()),
                settled: AtomicU64::new(0),
                connecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                current: StdMutex::new(None),
            }),
        }
    }

    /// Creates a client for a TCP address.
    pub fn tcp(addr: &str, config: ClientConfig) -> Self {
        Self::new(TcpConnector::new(addr), config)
    }

    /// Creates a client for a Unix domain socket.
    pub fn unix<P: AsRef<Path>>(path: P, config: ClientConfig) -> Self {
        Self::new(UnixConnector::new(path), config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Installs the callback invoked for notifications pushed by the peer.
    pub fn on_notification<F>(&self, callback: F)
    where
        F: Fn(String, Params) + Send + Sync + 'static,
    {
        *self
            .inner
            .on_notification
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub fn state(&self) -> ClientState {
        if self.inner.closed.load(Ordering::SeqCst) {
            return ClientState::Closed;
        }
        if self.inner.connecting.load(Ordering::SeqCst) {
            return ClientState::Connecting;
        }
        match self.inner.current().as_ref() {
            Some(session) if session.is_live() => ClientState::Connected,
            Some(_) => ClientState::Closed,
            None => ClientState::Disconnected,
        }
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner
            .current()
            .as_ref()
            .map_or(0, |session| session.role.pending.len())
    }

    /// Sends a call, connecting first if needed, and returns without waiting for the reply.
    pub async fn call_async(
        &self,
        method: &str,
        params: impl Into<Params>,
    ) -> Result<PendingReply> {
        let params = params.into();
        let session = self.inner.session().await?;
        session.request(method, &params).await
    }

    /// Sends a call and waits for its result.
    pub async fn call(&self, method: &str, params: impl Into<Params>) -> Result<Value> {
        self.call_async(method, params).await?.await
    }

    /// Sends a notification. No reply is expected and none is tracked.
    pub async fn notify(&self, method: &str, params: impl Into<Params>) -> Result<()> {
        let params = params.into();
        let session = self.inner.session().await?;
        session.notify(method, &params).await
    }

    /// Waits until the current connection, if any, has shut down.
    pub async fn wait_closed(&self) {
        let session = self.inner.current().clone();
        if let Some(session) = session {
            session.link.closed().await;
        }
    }

    /// Closes the connection and waits for it to shut down. Outstanding calls fail
    /// with [`RpcError::Disconnect`]; later operations fail with [`RpcError::Closed`].
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        // Let an in-flight connection attempt finish so its session is closed too.
        let _gate = self.inner.gate.lock().await;
        let session = self.inner.current().take();
        if let Some(session) = session {
            session.link.close().await;
        }
    }
}

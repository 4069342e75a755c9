//! Connection session shared by the client and server roles.
//!
//! A [`Link`] binds one codec to one transport. A background task reads the
//! transport, feeds the codec and hands every decoded message to the role that
//! owns the connection. Outgoing frames are written directly under a writer
//! lock; there is no send queue.
use std::{
    io,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use tokio::{
    io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{watch, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    codec::{Codec, WireFormat},
    error::*,
    message::Message,
    transport::Transport,
};

/// Default size of the buffer each connection reads into.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Role-specific handling of decoded messages.
///
/// `dispatch` is called from the reader task in wire order and must not block;
/// any real work is spawned as an independent task.
pub(crate) trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, link: &Arc<Link>, message: Message);

    /// Called once when the transport closes, with the I/O error if it failed.
    fn connection_lost(&self, error: Option<Arc<io::Error>>);
}

#[derive(Debug, Clone)]
enum LinkState {
    Open,
    Closed(Option<Arc<io::Error>>),
}

/// One live connection: codec, write half and lifecycle state.
pub(crate) struct Link {
    /// Unset until the first inbound bytes when acting as a server.
    codec: StdMutex<Option<Box<dyn Codec>>>,
    writer: Mutex<WriteHalf<Box<dyn Transport>>>,
    state: watch::Sender<LinkState>,
    shutdown: CancellationToken,
}

impl Link {
    /// Wraps `stream` and starts the reader task that feeds `role`.
    pub fn spawn<S, D>(
        stream: S,
        codec: Option<Box<dyn Codec>>,
        role: Arc<D>,
        read_buffer_size: usize,
    ) -> Arc<Self>
    where
        S: Transport,
        D: Dispatch,
    {
        let stream: Box<dyn Transport> = Box::new(stream);
        let (read_half, write_half) = split(stream);
        let (state, _) = watch::channel(LinkState::Open);
        let link = Arc::new(Self {
            codec: StdMutex::new(codec),
            writer: Mutex::new(write_half),
            state,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(read_loop(
            link.clone(),
            read_half,
            role,
            read_buffer_size.max(1),
        ));
        link
    }

    fn codec(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn Codec>>> {
        self.codec.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The wire format, once known.
    pub fn format(&self) -> Option<WireFormat> {
        self.codec().as_ref().map(|codec| codec.format())
    }

    /// Runs `f` against the codec. Fails when the format has not been established.
    pub fn encode<T>(&self, f: impl FnOnce(&mut dyn Codec) -> Result<T>) -> Result<T> {
        match self.codec().as_mut() {
            Some(codec) => f(&mut **codec),
            None => Err(RpcError::FormatUnknown),
        }
    }

    /// Decodes a chunk of inbound bytes, choosing the codec on the first chunk if needed.
    fn feed(&self, bytes: &[u8]) -> std::result::Result<Vec<Message>, ProtocolError> {
        let mut codec = self.codec();
        if codec.is_none() {
            let first = bytes[0];
            let format = WireFormat::detect(first)
                .ok_or(ProtocolError::UnrecognizedFormat { byte: first })?;
            debug!("detected {} wire format", format);
            *codec = Some(format.codec());
        }
        Ok(codec
            .as_mut()
            .map(|codec| codec.feed(bytes))
            .unwrap_or_default())
    }

    /// Writes one encoded frame to the transport.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        if let LinkState::Closed(source) = &*self.state.borrow() {
            return Err(RpcError::Disconnect {
                source: source.clone(),
            });
        }
        trace!("sending {} byte frame", frame.len());
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.borrow(), LinkState::Closed(_))
    }

    /// Waits until the connection has shut down. Returns the transport error, if any.
    pub async fn closed(&self) -> Option<Arc<io::Error>> {
        let mut state = self.state.subscribe();
        let error = match state
            .wait_for(|state| matches!(state, LinkState::Closed(_)))
            .await
        {
            Ok(state) => match &*state {
                LinkState::Closed(error) => error.clone(),
                LinkState::Open => None,
            },
            Err(_) => None,
        };
        error
    }

    /// Stops reading, shuts the transport down and waits for the reader to finish.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.closed().await;
    }

    /// Best effort: a writer stuck on a full transport is left to be dropped with the link.
    async fn shutdown_writer(&self) {
        let Ok(mut writer) = self.writer.try_lock() else {
            trace!("writer busy, skipping shutdown");
            return;
        };
        if let Err(e) = writer.shutdown().await {
            trace!("error shutting down writer: {}", e);
        }
    }
}

/// Reads the transport until it closes, dispatching every decoded message in order.
async fn read_loop<D: Dispatch>(
    link: Arc<Link>,
    mut reader: ReadHalf<Box<dyn Transport>>,
    role: Arc<D>,
    read_buffer_size: usize,
) {
    let mut buffer = vec![0; read_buffer_size];
    let error = loop {
        let read = tokio::select! {
            _ = link.shutdown.cancelled() => {
                trace!("connection closed locally");
                break None;
            }
            read = reader.read(&mut buffer) => read,
        };
        match read {
            Ok(0) => {
                trace!("connection closed by peer");
                break None;
            }
            Ok(n) => match link.feed(&buffer[..n]) {
                Ok(messages) => {
                    for message in messages {
                        role.dispatch(&link, message);
                    }
                }
                Err(e) => {
                    warn!("closing connection: {}", e);
                    break None;
                }
            },
            Err(e) => {
                debug!("connection read failed: {}", e);
                break Some(Arc::new(e));
            }
        }
    };
    link.shutdown_writer().await;
    role.connection_lost(error.clone());
    link.state.send_replace(LinkState::Closed(error));
}

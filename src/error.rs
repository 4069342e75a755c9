use std::{io, sync::Arc, time::Duration};

use thiserror::Error;

/// Errors that can occur during RPC operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Error occurred during I/O operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error occurred during MessagePack serialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] rmpv::encode::Error),

    /// Error occurred during MessagePack deserialization.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmpv::decode::Error),

    /// Error occurred while encoding or decoding JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error related to the RPC protocol.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Both positional and named arguments were supplied to one call.
    #[error("positional and named arguments can not be combined in one call")]
    ArgumentConflict,

    /// Named arguments were supplied to a codec that has no way to carry them.
    #[error("MessagePack-RPC does not support named arguments")]
    NamedParamsUnsupported,

    /// The wire format of a connection is not known yet, so nothing can be sent on it.
    #[error("wire format not yet established for this connection")]
    FormatUnknown,

    /// The peer answered a call with an error.
    #[error(
        "Remote error: {}",
        .description.as_deref().unwrap_or("<no description>")
    )]
    Remote { description: Option<String> },

    /// The connection was lost while the operation was outstanding.
    #[error("Connection lost")]
    Disconnect {
        #[source]
        source: Option<Arc<io::Error>>,
    },

    /// Establishing the underlying connection failed.
    #[error("Connect failed: {source}")]
    Connect {
        #[source]
        source: Arc<io::Error>,
    },

    /// Establishing the underlying connection took longer than allowed.
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The client was closed explicitly.
    #[error("Client is closed")]
    Closed,
}

/// Violations of the RPC protocol by the peer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// A response or error arrived for an id with no outstanding call.
    #[error("Unexpected response with id {id}")]
    UnexpectedResponse { id: u32 },

    /// A request carrying an id arrived at an endpoint that does not serve requests.
    #[error("Unexpected request with id {id}")]
    UnexpectedRequest { id: u32 },

    /// The first byte of a connection matched neither wire format.
    #[error("Unrecognized wire format (leading byte {byte:#04x})")]
    UnrecognizedFormat { byte: u8 },

    /// A decoded value did not have the shape of an RPC message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A value can not be represented in the selected wire format.
    #[error("Value not representable: {0}")]
    Unrepresentable(String),
}

/// An error signalled by a server handler.
///
/// The description is sent back to the caller as the error text of the response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{description}")]
pub struct ServiceError {
    pub description: String,
}

impl ServiceError {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

impl From<String> for ServiceError {
    fn from(description: String) -> Self {
        Self { description }
    }
}

impl From<&str> for ServiceError {
    fn from(description: &str) -> Self {
        Self::new(description)
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

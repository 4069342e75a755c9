//! Per-connection wire codecs.
//!
//! A codec turns outgoing calls into frames and reassembles inbound bytes into
//! [`Message`]s. Each connection owns exactly one codec, and its format never
//! changes once chosen.
use std::fmt;

use rmp::Marker;

use crate::{
    error::*,
    json::JsonCodec,
    message::{Message, Params, RequestId},
    msgpack::MsgPackCodec,
};

/// The two supported wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON-RPC 2.0, values concatenated on the stream.
    #[default]
    Json,
    /// MessagePack-RPC tuples.
    MsgPack,
}

impl WireFormat {
    /// Picks the format from the first byte a peer sent. A JSON object opens with
    /// `{`; a MessagePack-RPC message is a fixed array of three or four elements.
    pub fn detect(first: u8) -> Option<Self> {
        if first == b'{' {
            return Some(WireFormat::Json);
        }
        match Marker::from_u8(first) {
            Marker::FixArray(3) | Marker::FixArray(4) => Some(WireFormat::MsgPack),
            _ => None,
        }
    }

    /// Creates a fresh codec for this format.
    pub fn codec(self) -> Box<dyn Codec> {
        match self {
            WireFormat::Json => Box::new(JsonCodec::new()),
            WireFormat::MsgPack => Box::new(MsgPackCodec::new()),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireFormat::Json => f.write_str("json"),
            WireFormat::MsgPack => f.write_str("msgpack"),
        }
    }
}

/// Allocates request ids, counting up from zero and wrapping after `u32::MAX`.
#[derive(Debug, Default)]
pub struct RequestIds {
    next: RequestId,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts counting at `next`.
    pub fn starting_at(next: RequestId) -> Self {
        Self { next }
    }

    pub fn next_id(&mut self) -> RequestId {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

/// Stateful encoder/decoder for one connection.
pub trait Codec: Send {
    fn format(&self) -> WireFormat;

    /// Encodes a call. Notifications get no id; calls draw a fresh one, which is
    /// returned alongside the frame.
    fn encode_request(
        &mut self,
        notify: bool,
        method: &str,
        params: &Params,
    ) -> Result<(Option<RequestId>, Vec<u8>)>;

    fn encode_response(&mut self, id: RequestId, result: &rmpv::Value) -> Result<Vec<u8>>;

    fn encode_error(&mut self, id: RequestId, description: &str) -> Result<Vec<u8>>;

    /// Appends newly arrived bytes and returns every message that is now complete.
    /// Trailing partial data stays buffered; malformed input is logged and dropped.
    fn feed(&mut self, bytes: &[u8]) -> Vec<Message>;
}

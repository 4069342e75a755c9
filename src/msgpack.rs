//! MessagePack-RPC codec.
//!
//! Messages are bare MessagePack arrays written back to back:
//! `[0, id, method, params]` for requests, `[1, id, error, result]` for
//! responses and `[2, method, params]` for notifications.
use std::io::{self, Cursor};

use bytes::{Buf, BytesMut};
use rmpv::Value;
use tracing::{trace, warn};

use crate::{
    codec::{Codec, RequestIds, WireFormat},
    error::*,
    message::*,
};

const REQUEST_MESSAGE: u64 = 0;
const RESPONSE_MESSAGE: u64 = 1;
const NOTIFICATION_MESSAGE: u64 = 2;

/// Codec state for one MessagePack-RPC connection.
#[derive(Debug, Default)]
pub struct MsgPackCodec {
    ids: RequestIds,
    buffer: BytesMut,
}

impl MsgPackCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a codec drawing request ids from `ids`.
    pub fn with_ids(ids: RequestIds) -> Self {
        Self {
            ids,
            buffer: BytesMut::new(),
        }
    }

    /// Number of bytes waiting for the rest of a message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Codec for MsgPackCodec {
    fn format(&self) -> WireFormat {
        WireFormat::MsgPack
    }

    fn encode_request(
        &mut self,
        notify: bool,
        method: &str,
        params: &Params,
    ) -> Result<(Option<RequestId>, Vec<u8>)> {
        let params = match params {
            Params::Positional(values) => values.clone(),
            Params::Named(map) if map.is_empty() => Vec::new(),
            Params::Named(_) => return Err(RpcError::NamedParamsUnsupported),
        };
        let (id, value) = if notify {
            let value = Value::Array(vec![
                Value::Integer(NOTIFICATION_MESSAGE.into()),
                Value::String(method.into()),
                Value::Array(params),
            ]);
            (None, value)
        } else {
            let id = self.ids.next_id();
            let value = Value::Array(vec![
                Value::Integer(REQUEST_MESSAGE.into()),
                Value::Integer(id.into()),
                Value::String(method.into()),
                Value::Array(params),
            ]);
            (Some(id), value)
        };
        Ok((id, write(&value)?))
    }

    fn encode_response(&mut self, id: RequestId, result: &Value) -> Result<Vec<u8>> {
        write(&Value::Array(vec![
            Value::Integer(RESPONSE_MESSAGE.into()),
            Value::Integer(id.into()),
            Value::Nil,
            result.clone(),
        ]))
    }

    fn encode_error(&mut self, id: RequestId, description: &str) -> Result<Vec<u8>> {
        write(&Value::Array(vec![
            Value::Integer(RESPONSE_MESSAGE.into()),
            Value::Integer(id.into()),
            Value::String(description.into()),
            Value::Nil,
        ]))
    }

    fn feed(&mut self, bytes: &[u8]) -> Vec<Message> {
        self.buffer.extend_from_slice(bytes);
        let mut messages = Vec::new();
        while !self.buffer.is_empty() {
            let (decoded, consumed) = {
                let mut cursor = Cursor::new(&self.buffer[..]);
                let decoded = rmpv::decode::read_value(&mut cursor);
                (decoded, cursor.position() as usize)
            };
            match decoded {
                Ok(value) => {
                    self.buffer.advance(consumed);
                    match from_value(value) {
                        Ok(message) => {
                            trace!("decoded message: {:?}", message);
                            messages.push(message);
                        }
                        Err(e) => warn!("discarding msgpack value: {}", e),
                    }
                }
                Err(e) if is_incomplete(&e) => break,
                Err(e) => {
                    warn!(
                        "discarding {} undecodable msgpack bytes: {}",
                        self.buffer.len(),
                        e
                    );
                    self.buffer.clear();
                }
            }
        }
        messages
    }
}

fn write(value: &Value) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    rmpv::encode::write_value(&mut buffer, value)?;
    Ok(buffer)
}

/// A read that ran out of bytes means the rest of the value has not arrived yet.
fn is_incomplete(error: &rmpv::decode::Error) -> bool {
    match error {
        rmpv::decode::Error::InvalidMarkerRead(e) | rmpv::decode::Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

fn invalid(reason: &str) -> RpcError {
    RpcError::Protocol(ProtocolError::InvalidMessage(reason.into()))
}

fn request_id(value: &Value) -> Result<RequestId> {
    value
        .as_u64()
        .and_then(|id| RequestId::try_from(id).ok())
        .ok_or_else(|| invalid("invalid request id"))
}

fn method_name(value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid("invalid method name"))
}

fn positional(value: &Value) -> Result<Params> {
    match value {
        Value::Array(params) => Ok(Params::Positional(params.clone())),
        _ => Err(invalid("invalid params")),
    }
}

/// Renders the error slot of a response as text.
fn describe(error: &Value) -> String {
    match error {
        Value::String(s) => match s.as_str() {
            Some(s) => s.to_string(),
            None => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        },
        other => other.to_string(),
    }
}

/// Interprets a decoded MessagePack value as an RPC message.
fn from_value(value: Value) -> Result<Message> {
    let array = match value {
        Value::Array(array) => array,
        _ => return Err(invalid("message is not an array")),
    };
    let kind = array
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid("missing message type"))?;
    match kind {
        REQUEST_MESSAGE => {
            if array.len() != 4 {
                return Err(invalid("invalid request message length"));
            }
            Ok(Message::Request(Request {
                id: Some(request_id(&array[1])?),
                method: method_name(&array[2])?,
                params: positional(&array[3])?,
            }))
        }
        RESPONSE_MESSAGE => {
            if array.len() != 4 {
                return Err(invalid("invalid response message length"));
            }
            let id = request_id(&array[1])?;
            if array[2].is_nil() {
                Ok(Message::Response(Response {
                    id,
                    result: array[3].clone(),
                }))
            } else {
                Ok(Message::Error(ErrorResponse {
                    id,
                    description: Some(describe(&array[2])),
                }))
            }
        }
        NOTIFICATION_MESSAGE => {
            if array.len() != 3 {
                return Err(invalid("invalid notification message length"));
            }
            Ok(Message::Request(Request {
                id: None,
                method: method_name(&array[1])?,
                params: positional(&array[2])?,
            }))
        }
        _ => Err(invalid("unknown message type")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    lazy_static::lazy_static! {
        static ref TEST_PARAMS: Vec<Params> = vec![
            Params::none(),
            Params::Positional(vec![Value::String("param1".into()), Value::Integer(42.into())]),
            Params::Positional(vec![Value::Boolean(true), Value::F64(2.14)]),
            Params::Positional(vec![
                Value::Array(vec![Value::String("nested".into()), Value::Integer(1.into())]),
                Value::Map(vec![
                    (Value::String("key".into()), Value::Boolean(true)),
                    (Value::String("value".into()), Value::F64(1.718)),
                ]),
            ]),
        ];
    }

    #[test]
    fn test_request_round_trip() {
        let mut sender = MsgPackCodec::new();
        let mut receiver = MsgPackCodec::new();
        for params in TEST_PARAMS.iter() {
            for notify in [false, true] {
                let (id, bytes) = sender.encode_request(notify, "method", params).unwrap();
                assert_eq!(id.is_none(), notify);
                let messages = receiver.feed(&bytes);
                assert_eq!(
                    messages,
                    vec![Message::Request(Request {
                        id,
                        method: "method".into(),
                        params: params.clone(),
                    })]
                );
            }
        }
        assert_eq!(receiver.buffered(), 0);
    }

    #[test]
    fn test_wire_layout() {
        let mut codec = MsgPackCodec::new();
        let (id, bytes) = codec
            .encode_request(false, "echo", &Params::from([Value::from(42)]))
            .unwrap();
        assert_eq!(id, Some(0));
        assert_eq!(bytes, vec![0x94, 0x00, 0x00, 0xa4, b'e', b'c', b'h', b'o', 0x91, 42]);

        let (id, bytes) = codec
            .encode_request(true, "log", &Params::none())
            .unwrap();
        assert_eq!(id, None);
        assert_eq!(bytes, vec![0x93, 0x02, 0xa3, b'l', b'o', b'g', 0x90]);

        let bytes = codec.encode_response(7, &Value::Nil).unwrap();
        assert_eq!(bytes, vec![0x94, 0x01, 0x07, 0xc0, 0xc0]);
    }

    #[test]
    fn test_responses_and_errors() {
        let mut codec = MsgPackCodec::new();
        let mut bytes = codec.encode_response(3, &Value::from("ok")).unwrap();
        bytes.extend(codec.encode_error(4, "not found").unwrap());
        assert_eq!(
            codec.feed(&bytes),
            vec![
                Message::Response(Response {
                    id: 3,
                    result: Value::from("ok"),
                }),
                Message::Error(ErrorResponse {
                    id: 4,
                    description: Some("not found".into()),
                }),
            ]
        );
    }

    #[test]
    fn test_non_string_error_slot() {
        let mut codec = MsgPackCodec::new();
        let bytes = write(&Value::Array(vec![
            Value::from(1),
            Value::from(9),
            Value::from(-32601),
            Value::Nil,
        ]))
        .unwrap();
        assert_eq!(
            codec.feed(&bytes),
            vec![Message::Error(ErrorResponse {
                id: 9,
                description: Some("-32601".into()),
            })]
        );
    }

    #[test]
    fn test_chunked_feed() {
        let mut sender = MsgPackCodec::new();
        let mut stream = Vec::new();
        for params in TEST_PARAMS.iter() {
            stream.extend(sender.encode_request(false, "m", params).unwrap().1);
        }
        let whole = MsgPackCodec::new().feed(&stream);
        assert_eq!(whole.len(), TEST_PARAMS.len());

        for chunk_size in [1, 2, 3, 7, 16] {
            let mut receiver = MsgPackCodec::new();
            let mut messages = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                messages.extend(receiver.feed(chunk));
            }
            assert_eq!(messages, whole, "chunk size {}", chunk_size);
            assert_eq!(receiver.buffered(), 0);
        }
    }

    #[test]
    fn test_partial_message_stays_buffered() {
        let mut sender = MsgPackCodec::new();
        let (_, bytes) = sender
            .encode_request(false, "partial", &Params::from([Value::from("abc")]))
            .unwrap();
        let mut receiver = MsgPackCodec::new();
        assert!(receiver.feed(&bytes[..bytes.len() - 1]).is_empty());
        assert_eq!(receiver.buffered(), bytes.len() - 1);
        assert_eq!(receiver.feed(&bytes[bytes.len() - 1..]).len(), 1);
    }

    #[test]
    fn test_invalid_values_are_discarded() {
        let invalid_values = vec![
            Value::Nil,
            Value::Boolean(true),
            Value::Integer(42.into()),
            Value::String("not an array".into()),
            Value::Array(vec![]),
            Value::Array(vec![Value::Integer(999.into())]),
            Value::Array(vec![Value::Integer(REQUEST_MESSAGE.into())]),
            Value::Array(vec![
                Value::from(REQUEST_MESSAGE),
                Value::from(u64::from(u32::MAX) + 1),
                Value::from("m"),
                Value::Array(vec![]),
            ]),
            Value::Array(vec![
                Value::from(NOTIFICATION_MESSAGE),
                Value::from("m"),
                Value::from("not params"),
            ]),
        ];
        let mut codec = MsgPackCodec::new();
        for value in invalid_values {
            assert!(codec.feed(&write(&value).unwrap()).is_empty());
        }

        // A valid message after the garbage still decodes.
        let bytes = codec.encode_response(1, &Value::from(true)).unwrap();
        assert_eq!(codec.feed(&bytes).len(), 1);
    }

    #[test]
    fn test_undecodable_bytes_are_dropped() {
        let mut codec = MsgPackCodec::new();
        assert!(codec.feed(&[0xc1]).is_empty());
        assert_eq!(codec.buffered(), 0);

        let bytes = codec.encode_response(2, &Value::from(1)).unwrap();
        assert_eq!(codec.feed(&bytes).len(), 1);
    }

    #[test]
    fn test_named_params_rejected() {
        let mut codec = MsgPackCodec::new();
        let mut named = BTreeMap::new();
        named.insert("a".to_string(), Value::from(1));
        assert!(matches!(
            codec.encode_request(false, "m", &Params::Named(named)),
            Err(RpcError::NamedParamsUnsupported)
        ));
        // The rejected call must not consume an id.
        let (id, _) = codec.encode_request(false, "m", &Params::none()).unwrap();
        assert_eq!(id, Some(0));
    }

    #[test]
    fn test_ids_wrap_on_the_wire() {
        let mut sender = MsgPackCodec::with_ids(RequestIds::starting_at(u32::MAX));
        let mut receiver = MsgPackCodec::new();
        let (first, bytes) = sender.encode_request(false, "m", &Params::none()).unwrap();
        assert_eq!(first, Some(u32::MAX));
        assert_eq!(
            bytes,
            vec![0x94, 0x00, 0xce, 0xff, 0xff, 0xff, 0xff, 0xa1, b'm', 0x90]
        );
        let mut stream = bytes;

        let (second, bytes) = sender.encode_request(false, "m", &Params::none()).unwrap();
        assert_eq!(second, Some(0));
        assert_eq!(bytes, vec![0x94, 0x00, 0x00, 0xa1, b'm', 0x90]);
        stream.extend(bytes);

        let ids: Vec<_> = receiver
            .feed(&stream)
            .into_iter()
            .map(|message| match message {
                Message::Request(request) => request.id,
                other => panic!("unexpected message {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![Some(u32::MAX), Some(0)]);
    }
}


//! JSON-RPC 2.0 codec.
//!
//! Messages are JSON objects written back to back with no framing. Inbound
//! bytes are parsed incrementally; whatever follows the last complete value
//! stays buffered until more data arrives.
use rmpv::Value;
use serde::Serialize;
use serde_json::{Map, Number, Value as Json};
use tracing::{trace, warn};

use crate::{
    codec::{Codec, RequestIds, WireFormat},
    error::*,
    message::*,
};

const VERSION: &str = "2.0";

/// Error code used for every handler failure.
pub const SERVER_ERROR_CODE: i64 = -32000;

#[derive(Serialize)]
struct OutgoingRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
}

#[derive(Serialize)]
struct OutgoingResponse {
    jsonrpc: &'static str,
    id: RequestId,
    result: Json,
}

#[derive(Serialize)]
struct OutgoingError<'a> {
    jsonrpc: &'static str,
    id: RequestId,
    error: ErrorObject<'a>,
}

#[derive(Serialize)]
struct ErrorObject<'a> {
    code: i64,
    message: &'a str,
}

/// Codec state for one JSON-RPC connection.
#[derive(Debug, Default)]
pub struct JsonCodec {
    ids: RequestIds,
    buffer: Vec<u8>,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a codec drawing request ids from `ids`.
    pub fn with_ids(ids: RequestIds) -> Self {
        Self {
            ids,
            buffer: Vec::new(),
        }
    }

    /// Number of bytes waiting for the rest of a message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Splits complete JSON values off the front of the buffer.
    fn take_values(&mut self) -> Vec<Json> {
        let mut values = Vec::new();
        let consumed = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Json>();
            let mut consumed = 0;
            loop {
                match stream.next() {
                    Some(Ok(value)) => {
                        consumed = stream.byte_offset();
                        values.push(value);
                    }
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => {
                        warn!(
                            "discarding {} unparseable json bytes: {}",
                            self.buffer.len() - consumed,
                            e
                        );
                        consumed = self.buffer.len();
                        break;
                    }
                    None => {
                        consumed = self.buffer.len();
                        break;
                    }
                }
            }
            consumed
        };
        self.buffer.drain(..consumed);
        values
    }
}

impl Codec for JsonCodec {
    fn format(&self) -> WireFormat {
        WireFormat::Json
    }

    fn encode_request(
        &mut self,
        notify: bool,
        method: &str,
        params: &Params,
    ) -> Result<(Option<RequestId>, Vec<u8>)> {
        let params = if params.is_empty() {
            None
        } else {
            Some(match params {
                Params::Positional(values) => Json::Array(
                    values
                        .iter()
                        .map(value_to_json)
                        .collect::<Result<Vec<_>>>()?,
                ),
                Params::Named(map) => {
                    let mut object = Map::new();
                    for (key, value) in map {
                        object.insert(key.clone(), value_to_json(value)?);
                    }
                    Json::Object(object)
                }
            })
        };
        let id = if notify { None } else { Some(self.ids.next_id()) };
        let request = OutgoingRequest {
            jsonrpc: VERSION,
            method,
            params,
            id,
        };
        Ok((id, serde_json::to_vec(&request)?))
    }

    fn encode_response(&mut self, id: RequestId, result: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&OutgoingResponse {
            jsonrpc: VERSION,
            id,
            result: value_to_json(result)?,
        })?)
    }

    fn encode_error(&mut self, id: RequestId, description: &str) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&OutgoingError {
            jsonrpc: VERSION,
            id,
            error: ErrorObject {
                code: SERVER_ERROR_CODE,
                message: description,
            },
        })?)
    }

    fn feed(&mut self, bytes: &[u8]) -> Vec<Message> {
        self.buffer.extend_from_slice(bytes);
        self.take_values()
            .into_iter()
            .filter_map(|value| match from_json(value) {
                Ok(message) => {
                    trace!("decoded message: {:?}", message);
                    Some(message)
                }
                Err(e) => {
                    warn!("discarding json value: {}", e);
                    None
                }
            })
            .collect()
    }
}

fn invalid(reason: &str) -> RpcError {
    RpcError::Protocol(ProtocolError::InvalidMessage(reason.into()))
}

/// Reads the `id` member. `Ok(None)` when absent or null.
fn request_id(object: &Map<String, Json>) -> Result<Option<RequestId>> {
    match object.get("id") {
        None | Some(Json::Null) => Ok(None),
        Some(id) => id
            .as_u64()
            .and_then(|id| RequestId::try_from(id).ok())
            .map(Some)
            .ok_or_else(|| invalid("id is not a 32-bit unsigned integer")),
    }
}

/// Interprets a parsed JSON value as an RPC message.
fn from_json(value: Json) -> Result<Message> {
    let object = match value {
        Json::Object(object) => object,
        _ => return Err(invalid("not a json-rpc 2.0 object")),
    };
    if object.get("jsonrpc").and_then(Json::as_str) != Some(VERSION) {
        return Err(invalid("not a json-rpc 2.0 object"));
    }
    let id = request_id(&object)?;
    if object.contains_key("method") {
        let method = match object.get("method").and_then(Json::as_str) {
            Some(method) if !method.is_empty() => method.to_string(),
            _ => return Err(invalid("method name is empty")),
        };
        let params = match object.get("params") {
            Some(Json::Array(values)) => {
                Params::Positional(values.iter().cloned().map(json_to_value).collect())
            }
            Some(Json::Object(map)) => Params::Named(
                map.iter()
                    .map(|(key, value)| (key.clone(), json_to_value(value.clone())))
                    .collect(),
            ),
            _ => Params::none(),
        };
        Ok(Message::Request(Request { id, method, params }))
    } else if let Some(result) = object.get("result") {
        let id = id.ok_or_else(|| invalid("response without id"))?;
        Ok(Message::Response(Response {
            id,
            result: json_to_value(result.clone()),
        }))
    } else if let Some(error) = object.get("error") {
        let id = id.ok_or_else(|| invalid("error without id"))?;
        let description = match error.get("message") {
            Some(Json::String(message)) => Some(message.clone()),
            Some(message) => Some(message.to_string()),
            None => error.get("code").map(|code| match code {
                Json::String(code) => code.clone(),
                code => code.to_string(),
            }),
        };
        Ok(Message::Error(ErrorResponse { id, description }))
    } else {
        Err(invalid("unknown message shape"))
    }
}

/// Converts a JSON value into the crate's dynamic value type.
pub fn json_to_value(json: Json) -> Value {
    match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Boolean(b),
        Json::Number(n) => {
            if let Some(n) = n.as_u64() {
                Value::from(n)
            } else if let Some(n) = n.as_i64() {
                Value::from(n)
            } else {
                Value::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Value::String(s.into()),
        Json::Array(values) => Value::Array(values.into_iter().map(json_to_value).collect()),
        Json::Object(map) => Value::Map(
            map.into_iter()
                .map(|(key, value)| (Value::String(key.into()), json_to_value(value)))
                .collect(),
        ),
    }
}

/// Converts a dynamic value into JSON.
///
/// Map keys that are not strings are rendered with their display form. Binary
/// and extension values have no JSON counterpart and are rejected.
pub fn value_to_json(value: &Value) -> Result<Json> {
    Ok(match value {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(n) => {
            if let Some(n) = n.as_u64() {
                Json::Number(n.into())
            } else if let Some(n) = n.as_i64() {
                Json::Number(n.into())
            } else {
                return Err(unrepresentable("integer out of range"));
            }
        }
        Value::F32(f) => float(f64::from(*f)),
        Value::F64(f) => float(*f),
        Value::String(s) => match s.as_str() {
            Some(s) => Json::String(s.to_string()),
            None => return Err(unrepresentable("string is not valid utf-8")),
        },
        Value::Binary(_) => return Err(unrepresentable("binary data")),
        Value::Array(values) => Json::Array(
            values
                .iter()
                .map(value_to_json)
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Map(entries) => {
            let mut object = Map::new();
            for (key, value) in entries {
                let key = match key.as_str() {
                    Some(key) => key.to_string(),
                    None => key.to_string(),
                };
                object.insert(key, value_to_json(value)?);
            }
            Json::Object(object)
        }
        Value::Ext(..) => return Err(unrepresentable("extension type")),
    })
}

/// Non-finite floats have no JSON form and become null.
fn float(f: f64) -> Json {
    Number::from_f64(f).map(Json::Number).unwrap_or(Json::Null)
}

fn unrepresentable(reason: &str) -> RpcError {
    RpcError::Protocol(ProtocolError::Unrepresentable(reason.into()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn named(entries: &[(&str, Value)]) -> Params {
        Params::Named(
            entries
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn test_request_layout() {
        let mut codec = JsonCodec::new();
        let (id, bytes) = codec
            .encode_request(false, "echo", &Params::from([Value::from(42)]))
            .unwrap();
        assert_eq!(id, Some(0));
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"jsonrpc":"2.0","method":"echo","params":[42],"id":0}"#
        );

        let (id, bytes) = codec
            .encode_request(false, "ping", &Params::none())
            .unwrap();
        assert_eq!(id, Some(1));
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"jsonrpc":"2.0","method":"ping","id":1}"#
        );

        let (id, bytes) = codec
            .encode_request(true, "log", &named(&[("text", Value::from("hello"))]))
            .unwrap();
        assert_eq!(id, None);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"jsonrpc":"2.0","method":"log","params":{"text":"hello"}}"#
        );
    }

    #[test]
    fn test_empty_named_map_omits_params() {
        let mut codec = JsonCodec::new();
        let (_, bytes) = codec
            .encode_request(true, "tick", &Params::Named(BTreeMap::new()))
            .unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"jsonrpc":"2.0","method":"tick"}"#
        );
    }

    #[test]
    fn test_error_layout() {
        let mut codec = JsonCodec::new();
        let bytes = codec.encode_error(7, "not found").unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"jsonrpc":"2.0","id":7,"error":{"code":-32000,"message":"not found"}}"#
        );
        let bytes = codec.encode_response(8, &Value::from("done")).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"jsonrpc":"2.0","id":8,"result":"done"}"#
        );
    }

    #[test]
    fn test_request_round_trip() {
        let cases = vec![
            Params::none(),
            Params::from([Value::from("a"), Value::from(-3), Value::F64(1.5)]),
            Params::from([Value::Array(vec![Value::Nil, Value::Boolean(false)])]),
            named(&[("x", Value::from(1)), ("y", Value::from("two"))]),
        ];
        let mut sender = JsonCodec::new();
        let mut receiver = JsonCodec::new();
        for params in cases {
            for notify in [false, true] {
                let (id, bytes) = sender.encode_request(notify, "method", &params).unwrap();
                assert_eq!(
                    receiver.feed(&bytes),
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
    fn test_chunked_feed() {
        let mut sender = JsonCodec::new();
        let mut stream = Vec::new();
        stream.extend(
            sender
                .encode_request(false, "greet", &Params::from([Value::from("héllo wörld")]))
                .unwrap()
                .1,
        );
        stream.extend(b"\n");
        stream.extend(sender.encode_response(3, &Value::from(true)).unwrap());
        stream.extend(sender.encode_error(4, "boom").unwrap());
        let whole = JsonCodec::new().feed(&stream);
        assert_eq!(whole.len(), 3);

        for chunk_size in [1, 2, 5, 13] {
            let mut receiver = JsonCodec::new();
            let mut messages = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                messages.extend(receiver.feed(chunk));
            }
            assert_eq!(messages, whole, "chunk size {}", chunk_size);
            assert_eq!(receiver.buffered(), 0);
        }
    }

    #[test]
    fn test_discarded_values() {
        let mut codec = JsonCodec::new();
        let inputs = [
            r#"{"method":"no_version","id":1}"#,
            r#"{"jsonrpc":"1.0","method":"old","id":1}"#,
            r#"{"jsonrpc":"2.0","method":"","id":1}"#,
            r#"{"jsonrpc":"2.0","result":1}"#,
            r#"{"jsonrpc":"2.0","error":{"code":1}}"#,
            r#"{"jsonrpc":"2.0","id":1}"#,
            r#"{"jsonrpc":"2.0","method":"m","id":-1}"#,
            r#"[1,2,3]"#,
        ];
        for input in inputs {
            assert!(codec.feed(input.as_bytes()).is_empty(), "{}", input);
        }
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_error_description_preference() {
        let mut codec = JsonCodec::new();
        let messages = codec.feed(
            concat!(
                r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no such method"}}"#,
                r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601}}"#,
                r#"{"jsonrpc":"2.0","id":3,"error":{}}"#,
            )
            .as_bytes(),
        );
        let descriptions: Vec<_> = messages
            .into_iter()
            .map(|message| match message {
                Message::Error(error) => error.description,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            descriptions,
            vec![Some("no such method".into()), Some("-32601".into()), None]
        );
    }

    #[test]
    fn test_garbage_is_dropped() {
        let mut codec = JsonCodec::new();
        assert!(codec.feed(b"{\"jsonrpc\": nope}").is_empty());
        assert_eq!(codec.buffered(), 0);
        let bytes = codec.encode_response(1, &Value::Nil).unwrap();
        assert_eq!(codec.feed(&bytes).len(), 1);
    }

    #[test]
    fn test_value_conversion() {
        let value = Value::Map(vec![
            (Value::from("list"), Value::Array(vec![Value::from(1), Value::from(-1)])),
            (Value::from(5), Value::F64(0.25)),
            (Value::from("nan"), Value::F64(f64::NAN)),
        ]);
        let json = value_to_json(&value).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"list": [1, -1], "5": 0.25, "nan": null})
        );
        assert!(value_to_json(&Value::Binary(vec![1, 2])).is_err());
        assert_eq!(
            json_to_value(serde_json::json!([u64::MAX, -7, 2.5])),
            Value::Array(vec![Value::from(u64::MAX), Value::from(-7), Value::F64(2.5)])
        );
    }

    #[test]
    fn test_ids_wrap_on_the_wire() {
        let mut sender = JsonCodec::with_ids(RequestIds::starting_at(u32::MAX));
        let mut receiver = JsonCodec::new();
        let (first, bytes) = sender.encode_request(false, "m", &Params::none()).unwrap();
        assert_eq!(first, Some(u32::MAX));
        assert_eq!(bytes, br#"{"jsonrpc":"2.0","method":"m","id":4294967295}"#);
        let mut stream = bytes;

        let (second, bytes) = sender.encode_request(false, "m", &Params::none()).unwrap();
        assert_eq!(second, Some(0));
        assert_eq!(bytes, br#"{"jsonrpc":"2.0","method":"m","id":0}"#);
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


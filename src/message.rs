//! Format-neutral RPC message model exchanged between codecs and connections.
//!
//! Both wire formats decode into [`Message`], and every outgoing frame is
//! produced from the pieces described here.
use std::collections::BTreeMap;

use rmpv::Value;

use crate::error::*;

/// Identifier correlating a call with its response. Unique only among the calls
/// outstanding on one connection.
pub type RequestId = u32;

/// Arguments of a call: either an ordered list or a map of named values.
#[derive(PartialEq, Clone, Debug)]
pub enum Params {
    Positional(Vec<Value>),
    Named(BTreeMap<String, Value>),
}

impl Params {
    /// Builds call arguments from both argument styles, rejecting calls that populate both.
    pub fn new(positional: Vec<Value>, named: BTreeMap<String, Value>) -> Result<Self> {
        match (positional.is_empty(), named.is_empty()) {
            (false, false) => Err(RpcError::ArgumentConflict),
            (true, false) => Ok(Params::Named(named)),
            _ => Ok(Params::Positional(positional)),
        }
    }

    /// No arguments at all.
    pub fn none() -> Self {
        Params::Positional(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Params::Positional(values) => values.is_empty(),
            Params::Named(map) => map.is_empty(),
        }
    }

    /// Positional arguments, or an empty slice for named calls.
    pub fn positional(&self) -> &[Value] {
        match self {
            Params::Positional(values) => values,
            Params::Named(_) => &[],
        }
    }

    /// Looks up a named argument.
    pub fn named(&self, key: &str) -> Option<&Value> {
        match self {
            Params::Positional(_) => None,
            Params::Named(map) => map.get(key),
        }
    }

    /// Returns the first positional argument, if any.
    pub fn first(&self) -> Option<&Value> {
        self.positional().first()
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::none()
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl From<&[Value]> for Params {
    fn from(values: &[Value]) -> Self {
        Params::Positional(values.to_vec())
    }
}

impl<const N: usize> From<[Value; N]> for Params {
    fn from(values: [Value; N]) -> Self {
        Params::Positional(values.into())
    }
}

impl From<BTreeMap<String, Value>> for Params {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Params::Named(map)
    }
}

/// A decoded RPC message.
#[derive(PartialEq, Clone, Debug)]
pub enum Message {
    Request(Request),
    Response(Response),
    Error(ErrorResponse),
}

/// A call or, when `id` is absent, a notification.
#[derive(PartialEq, Clone, Debug)]
pub struct Request {
    pub id: Option<RequestId>,
    pub method: String,
    pub params: Params,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A successful reply to a call.
#[derive(PartialEq, Clone, Debug)]
pub struct Response {
    pub id: RequestId,
    pub result: Value,
}

/// A failed reply to a call.
#[derive(PartialEq, Clone, Debug)]
pub struct ErrorResponse {
    pub id: RequestId,
    pub description: Option<String>,
}

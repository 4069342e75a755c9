//! Bidirectional JSON-RPC 2.0 and MessagePack-RPC in Rust.
//!
//! One persistent connection carries calls and notifications in both
//! directions. Each connection speaks exactly one wire format: clients choose
//! theirs up front, servers detect it from the first byte the peer sends.
//!
//! To implement a server:
//! 1. Implement the `Handler` trait, or use a closure with `Server::from_fn`
//! 2. Call `server.tcp(addr)` or `server.unix(path)`
//! 3. Call `server.run()`, or `server.spawn()` to get a closable `ServerHandle`
//!
//! An already-accepted stream can be served on its own with `ServerConnection`,
//! which can also push notifications to the peer.
//!
//! To implement a client:
//! 1. Create a `Client` via `Client::tcp(addr, config)` or `Client::unix(path, config)`
//! 2. Use `client.call()`, `client.call_async()` or `client.notify()`; the first
//!    of these opens the connection
//! 3. Optionally install `client.on_notification()` for notifications pushed by the server
//!
//! Callers outside an async runtime can use `blocking::BlockingClient`.
//!
//! Uses `tokio` for async I/O, `rmpv` for MessagePack and `serde_json` for JSON.

pub mod blocking;
mod client;
mod codec;
mod connection;
mod error;
mod json;
mod message;
mod msgpack;
mod server;
mod transport;

pub use client::*;
pub use codec::*;
pub use connection::DEFAULT_READ_BUFFER_SIZE;
pub use error::*;
pub use json::{json_to_value, value_to_json, JsonCodec, SERVER_ERROR_CODE};
pub use message::*;
pub use msgpack::MsgPackCodec;
pub use server::*;
pub use transport::{Connector, TcpConnector, Transport, UnixConnector};

pub use rmpv::Value;

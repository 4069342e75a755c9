//! A synchronous facade over [`Client`] for callers outside an async runtime.
//!
//! The blocking client owns a small private runtime that drives the connection
//! in the background. Its methods must not be called from within another
//! async runtime.
use std::path::Path;

use rmpv::Value;
use tokio::runtime::{Builder, Runtime};

use crate::{
    client::{Client, ClientConfig, ClientState, PendingReply},
    error::*,
    message::Params,
    transport::Connector,
};

/// Blocking RPC client.
pub struct BlockingClient {
    client: Client,
    runtime: Runtime,
}

impl BlockingClient {
    pub fn new<C: Connector>(connector: C, config: ClientConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("duorpc-blocking")
            .enable_all()
            .build()?;
        Ok(Self {
            client: Client::new(connector, config),
            runtime,
        })
    }

    pub fn tcp(addr: &str, config: ClientConfig) -> Result<Self> {
        Self::new(crate::transport::TcpConnector::new(addr), config)
    }

    pub fn unix<P: AsRef<Path>>(path: P, config: ClientConfig) -> Result<Self> {
        Self::new(crate::transport::UnixConnector::new(path), config)
    }

    /// The async client driven by this facade.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn state(&self) -> ClientState {
        self.client.state()
    }

    /// Installs the callback invoked for notifications pushed by the peer.
    pub fn on_notification<F>(&self, callback: F)
    where
        F: Fn(String, Params) + Send + Sync + 'static,
    {
        self.client.on_notification(callback);
    }

    /// Sends a call and blocks until its result arrives.
    pub fn call(&self, method: &str, params: impl Into<Params>) -> Result<Value> {
        self.runtime.block_on(self.client.call(method, params))
    }

    /// Sends a call and returns as soon as it is written. Use [`BlockingClient::wait`]
    /// to collect the result.
    pub fn call_async(&self, method: &str, params: impl Into<Params>) -> Result<PendingReply> {
        self.runtime.block_on(self.client.call_async(method, params))
    }

    /// Blocks until a reply from [`BlockingClient::call_async`] resolves.
    pub fn wait(&self, reply: PendingReply) -> Result<Value> {
        self.runtime.block_on(reply)
    }

    pub fn notify(&self, method: &str, params: impl Into<Params>) -> Result<()> {
        self.runtime.block_on(self.client.notify(method, params))
    }

    /// Closes the connection and blocks until it has shut down.
    pub fn close(&self) {
        self.runtime.block_on(self.client.close());
    }
}

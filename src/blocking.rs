//! Synchronous facade
//!
//! [`BlockingClient`] owns a small tokio runtime and drives a [`BytesClient`]
//! on it, for callers that are not async. Events still fire on the runtime's
//! worker thread.
//!
//! Must not be used from inside another tokio runtime.

use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::{Builder, Runtime};

use crate::client::{BytesClient, ClientOptions};
use crate::entity::{ConnectArgs, ConnectResult, DisconnectArgs, DisconnectResult, SendOptions};
use crate::error::{BytesIoError, BytesIoResult};
use crate::reply::Reply;
use crate::transport::Transport;

/// Blocking wrapper around a [`BytesClient`].
pub struct BlockingClient {
    runtime: Runtime,
    client: BytesClient,
}

impl BlockingClient {
    pub fn new<T: Transport>(transport: T) -> BytesIoResult<Self> {
        Self::with_options(transport, ClientOptions::default())
    }

    pub fn with_options<T: Transport>(transport: T, options: ClientOptions) -> BytesIoResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("bytesio-blocking")
            .enable_all()
            .build()
            .map_err(|e| BytesIoError::io(format!("failed to start runtime: {}", e)))?;

        Ok(Self {
            runtime,
            client: BytesClient::with_options(transport, options),
        })
    }

    /// The async client behind this facade, e.g. for subscribing to events.
    pub fn client(&self) -> &BytesClient {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn connect(&self) -> ConnectResult {
        self.runtime.block_on(self.client.connect())
    }

    pub fn connect_with(&self, args: ConnectArgs) -> ConnectResult {
        self.runtime.block_on(self.client.connect_with(args))
    }

    pub fn disconnect(&self) -> DisconnectResult {
        self.runtime.block_on(self.client.disconnect())
    }

    pub fn disconnect_with(&self, args: DisconnectArgs) -> DisconnectResult {
        self.runtime.block_on(self.client.disconnect_with(args))
    }

    pub fn send(&self, data: &[u8]) -> BytesIoResult<()> {
        self.runtime.block_on(self.client.send(data))
    }

    pub fn send_with_options(&self, data: &[u8], options: &SendOptions) -> BytesIoResult<()> {
        self.runtime
            .block_on(self.client.send_with_options(data, options))
    }

    pub fn send_and_await_reply(&self, data: &[u8], timeout: Duration) -> Reply<Bytes> {
        self.runtime
            .block_on(self.client.send_and_await_reply(data, timeout))
    }

    pub fn send_and_await_matched_reply<M>(&self, data: &[u8], timeout: Duration, matcher: M) -> Reply<Bytes>
    where
        M: Fn(&[u8], &[u8]) -> bool + Send + Sync + 'static,
    {
        self.runtime
            .block_on(self.client.send_and_await_matched_reply(data, timeout, matcher))
    }
}

impl std::fmt::Debug for BlockingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingClient")
            .field("client", &self.client)
            .finish()
    }
}

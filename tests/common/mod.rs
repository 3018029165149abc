//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytesio::{BytesIoError, BytesIoResult, Connection, Transport};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};

/// In-memory transport: each `open` creates a duplex pipe, keeps one end
/// and hands the other to the test through `peers`.
pub struct DuplexTransport {
    peers: mpsc::UnboundedSender<DuplexStream>,
}

impl DuplexTransport {
    pub fn new() -> (Self, Peers) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers }, Peers { rx: Mutex::new(rx) })
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn open(&self) -> BytesIoResult<Connection> {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        self.peers
            .send(remote)
            .map_err(|_| BytesIoError::connection("peer receiver dropped"))?;
        Ok(Connection::from_stream(local))
    }

    fn endpoint(&self) -> String {
        "duplex://test".to_string()
    }

    fn protocol(&self) -> &'static str {
        "DUPLEX"
    }
}

/// Remote ends of the connections a [`DuplexTransport`] opened.
pub struct Peers {
    rx: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

impl Peers {
    pub async fn next(&self) -> DuplexStream {
        tokio::time::timeout(Duration::from_secs(2), self.rx.lock().await.recv())
            .await
            .expect("no connection opened")
            .expect("transport dropped")
    }
}

/// A transport whose connect never finishes.
pub struct PendingTransport;

#[async_trait]
impl Transport for PendingTransport {
    async fn open(&self) -> BytesIoResult<Connection> {
        std::future::pending().await
    }

    fn endpoint(&self) -> String {
        "pending://".to_string()
    }
}

/// A transport that rejects its parameters.
pub struct BadParamTransport;

#[async_trait]
impl Transport for BadParamTransport {
    async fn open(&self) -> BytesIoResult<Connection> {
        Err(BytesIoError::configuration("port must not be empty"))
    }

    fn endpoint(&self) -> String {
        "bad://".to_string()
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Run `future` with a two second limit.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("operation did not finish in time")
}

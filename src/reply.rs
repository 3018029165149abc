//! Request/reply correlation
//!
//! A request is correlated with its reply by subscribing a transient handler
//! to an inbound event, sending, and waiting for the first frame the matcher
//! accepts or for the timeout. The handler is removed on every path, so a
//! late frame never reaches a finished request.
//!
//! ```rust,no_run
//! use bytesio::{BytesClient, ReplyStatus, TcpTransport};
//! use std::time::Duration;
//!
//! # async fn run() {
//! let client = BytesClient::new(TcpTransport::new("127.0.0.1:9000"));
//! client.connect().await;
//!
//! // Accept only frames that echo the request's first byte
//! let reply = client
//!     .send_and_await_matched_reply(b"\x07status", Duration::from_millis(500), |sent, received| {
//!         received.first() == sent.first()
//!     })
//!     .await;
//!
//! match reply.status() {
//!     ReplyStatus::Completed => println!("{:?}", reply.data()),
//!     ReplyStatus::Timeout => println!("no answer"),
//!     ReplyStatus::Error => println!("{:?}", reply.error()),
//! }
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::client::BytesClient;
use crate::entity::{DataReceivedEventArgs, SendOptions};
use crate::error::{BytesIoError, BytesIoResult};
use crate::event::Event;
use crate::unpacker::TypedUnpacker;

/// How a correlated request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// A matching reply arrived.
    Completed,
    /// Nothing matched before the timeout.
    Timeout,
    /// The request could not be sent or the reply could not be converted.
    Error,
}

/// Result of a request/reply exchange.
#[derive(Debug, Clone)]
pub struct Reply<T> {
    client: BytesClient,
    status: ReplyStatus,
    data: Option<T>,
    error: Option<BytesIoError>,
}

impl<T> Reply<T> {
    pub fn completed(client: BytesClient, data: T) -> Self {
        Self {
            client,
            status: ReplyStatus::Completed,
            data: Some(data),
            error: None,
        }
    }

    pub fn timeout(client: BytesClient, timeout: Duration) -> Self {
        Self {
            client,
            status: ReplyStatus::Timeout,
            data: None,
            error: Some(BytesIoError::timeout("reply", timeout.as_millis() as u64)),
        }
    }

    pub fn failed(client: BytesClient, error: BytesIoError) -> Self {
        Self {
            client,
            status: ReplyStatus::Error,
            data: None,
            error: Some(error),
        }
    }

    /// The client the request went through.
    pub fn client(&self) -> &BytesClient {
        &self.client
    }

    pub fn status(&self) -> ReplyStatus {
        self.status
    }

    pub fn is_completed(&self) -> bool {
        self.status == ReplyStatus::Completed
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Why the reply did not complete. Timeouts carry a
    /// [`BytesIoError::Timeout`] for convenience.
    pub fn error(&self) -> Option<&BytesIoError> {
        self.error.as_ref()
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }

    /// Collapse into a `Result`, treating timeouts as errors.
    pub fn into_result(self) -> BytesIoResult<T> {
        match (self.data, self.error) {
            (Some(data), _) => Ok(data),
            (None, Some(error)) => Err(error),
            (None, None) => Err(BytesIoError::invalid_data("reply completed without data")),
        }
    }

    /// Map the payload of a completed reply. A failed conversion turns the
    /// reply into [`ReplyStatus::Error`]; timeouts and errors pass through.
    pub fn convert<U, F>(self, f: F) -> Reply<U>
    where
        F: FnOnce(T) -> BytesIoResult<U>,
    {
        let Reply {
            client,
            status,
            data,
            error,
        } = self;

        match (status, data) {
            (ReplyStatus::Completed, Some(data)) => match f(data) {
                Ok(converted) => Reply::completed(client, converted),
                Err(e) => Reply::failed(client, BytesIoError::reply_conversion(e.to_string())),
            },
            (status, _) => Reply {
                client,
                status,
                data: None,
                error,
            },
        }
    }
}

/// Something that can be put on the wire as one request.
pub trait Request {
    fn to_bytes(&self) -> BytesIoResult<Bytes>;
}

impl Request for Vec<u8> {
    fn to_bytes(&self) -> BytesIoResult<Bytes> {
        Ok(Bytes::copy_from_slice(self))
    }
}

impl Request for Bytes {
    fn to_bytes(&self) -> BytesIoResult<Bytes> {
        Ok(self.clone())
    }
}

/// Subscribe `accept` to `event`, run `send`, then wait for the first value
/// `accept` produces. The subscription is dropped before returning.
async fn correlate<E, T, S, A>(
    client: &BytesClient,
    event: &Event<E>,
    send: S,
    timeout: Duration,
    accept: A,
) -> Reply<T>
where
    S: Future<Output = BytesIoResult<()>>,
    A: Fn(&E) -> Option<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));
    let _pending = event.subscribe_scoped(move |args: &E| {
        if slot.lock().is_none() {
            return;
        }
        if let Some(value) = accept(args) {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(value);
            }
        }
    });

    if let Err(error) = send.await {
        return Reply::failed(client.clone(), error);
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Reply::completed(client.clone(), value),
        Ok(Err(_)) => Reply::failed(
            client.clone(),
            BytesIoError::invalid_operation("reply source closed"),
        ),
        Err(_) => {
            debug!("No reply from {} within {:?}", client.endpoint(), timeout);
            Reply::timeout(client.clone(), timeout)
        }
    }
}

impl BytesClient {
    /// Send `data` and wait for the next received frame.
    pub async fn send_and_await_reply(&self, data: &[u8], timeout: Duration) -> Reply<Bytes> {
        self.send_and_await_matched_reply(data, timeout, |_, _| true)
            .await
    }

    /// Send `data` and wait for a received frame `matcher(sent, received)`
    /// accepts.
    pub async fn send_and_await_matched_reply<M>(
        &self,
        data: &[u8],
        timeout: Duration,
        matcher: M,
    ) -> Reply<Bytes>
    where
        M: Fn(&[u8], &[u8]) -> bool + Send + Sync + 'static,
    {
        self.send_and_await_matched_reply_with_options(data, timeout, &SendOptions::default(), matcher)
            .await
    }

    pub async fn send_and_await_matched_reply_with_options<M>(
        &self,
        data: &[u8],
        timeout: Duration,
        options: &SendOptions,
        matcher: M,
    ) -> Reply<Bytes>
    where
        M: Fn(&[u8], &[u8]) -> bool + Send + Sync + 'static,
    {
        let sent = Bytes::copy_from_slice(data);
        correlate(
            self,
            &self.events().data_received,
            self.send_with_options(data, options),
            timeout,
            move |args: &DataReceivedEventArgs| {
                matcher(&sent[..], &args.data[..]).then(|| args.data.clone())
            },
        )
        .await
    }
}

impl<T> TypedUnpacker<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Send `request` through `client` and wait for a typed frame from this
    /// unpacker that `matcher(request, response)` accepts.
    ///
    /// The unpacker's raw half must be bound to `client`.
    pub async fn send_and_await_reply<Q, M>(
        &self,
        client: &BytesClient,
        request: &Q,
        timeout: Duration,
        options: &SendOptions,
        matcher: M,
    ) -> Reply<T>
    where
        Q: Request + Clone + Send + Sync + 'static,
        M: Fn(&Q, &T) -> bool + Send + Sync + 'static,
    {
        let frame = match request.to_bytes() {
            Ok(frame) => frame,
            Err(error) => return Reply::failed(client.clone(), error),
        };

        let sent = request.clone();
        correlate(
            client,
            self.data_parsed(),
            client.send_with_options(&frame, options),
            timeout,
            move |response: &T| matcher(&sent, response).then(|| response.clone()),
        )
        .await
    }
}

//! # Bytes client
//!
//! [`BytesClient`] drives one connection opened by a [`Transport`]:
//!
//! - **Lifecycle**: `connect` / `disconnect` are serialized by one async lock
//!   per client and report through [`ConnectResult`] / [`DisconnectResult`].
//! - **Receive pump**: each connection gets one task that reads into pooled
//!   [`MemoryBlock`]s and pushes them through the pipeline. End of stream,
//!   read faults and cancellation funnel into a single continuation that
//!   decides how the connection ends.
//! - **Send**: writes go through one lock so frames never interleave, with an
//!   optional pause after each write.
//! - **Events**: six [`Event`]s fan out lifecycle and data notifications. A
//!   panicking handler is caught and re-raised as `exception_occurred`.
//!
//! With an [`Unpacker`] bound, received blocks are handed to it and
//! `data_received` fires once per frame instead of once per chunk.
//!
//! ```rust,no_run
//! use bytesio::{BytesClient, TcpTransport};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = BytesClient::new(TcpTransport::new("127.0.0.1:9000"));
//!     client.on_data_received(|e| println!("received {} bytes", e.data.len()));
//!
//!     if client.connect().await.is_success() {
//!         client.send(b"hello").await.ok();
//!         let reply = client.send_and_await_reply(b"ping", Duration::from_secs(1)).await;
//!         println!("{:?}", reply.status());
//!         client.disconnect().await;
//!     }
//! }
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

use crate::constants::{DEFAULT_BLOCK_SIZE, DEFAULT_MAX_RETAINED_BLOCKS, DEFAULT_REPLY_TIMEOUT_MS};
use crate::entity::{
    ConnectArgs, ConnectErrorKind, ConnectResult, ConnectedEventArgs, ConnectionFailedEventArgs,
    ConnectionState, DataReceivedEventArgs, DataSentEventArgs, DisconnectArgs,
    DisconnectErrorKind, DisconnectResult, DisconnectedEventArgs, DisconnectionReason,
    ExceptionEventArgs, SendOptions,
};
use crate::error::{BytesIoError, BytesIoResult};
use crate::event::{Event, Subscription, SubscriptionId};
use crate::logging::{log_packet, PacketDirection};
use crate::pool::{MemoryBlock, MemoryBlockPool};
use crate::transport::{BoxReader, BoxWriter, Connection, Transport};
use crate::unpacker::Unpacker;

// ============================================================================
// Options and statistics
// ============================================================================

/// Per-client configuration.
///
/// ```rust
/// use bytesio::ClientOptions;
/// use std::time::Duration;
///
/// let options = ClientOptions::new()
///     .with_receive_buffer_size(4096)
///     .with_connect_timeout(Duration::from_secs(3))
///     .with_packet_logging(true);
///
/// assert_eq!(options.receive_buffer_size, 4096);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Size of one pooled receive block.
    pub receive_buffer_size: usize,
    /// Idle receive blocks kept for reuse.
    pub max_retained_blocks: usize,
    /// Default timeout for request/reply helpers built on the client.
    pub reply_timeout: Duration,
    /// Timeout applied by [`BytesClient::connect`]. `None` waits for the transport.
    pub connect_timeout: Option<Duration>,
    /// Log every sent and received chunk as hex.
    pub packet_logging: bool,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    pub fn with_max_retained_blocks(mut self, count: usize) -> Self {
        self.max_retained_blocks = count;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            receive_buffer_size: DEFAULT_BLOCK_SIZE,
            max_retained_blocks: DEFAULT_MAX_RETAINED_BLOCKS,
            reply_timeout: Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS),
            connect_timeout: None,
            packet_logging: false,
        }
    }
}

/// Snapshot of client counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub chunks_received: u64,
    pub frames_parsed: u64,
    pub send_errors: u64,
    pub callback_faults: u64,
}

#[derive(Default)]
struct StatsCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    chunks_received: AtomicU64,
    frames_parsed: AtomicU64,
    send_errors: AtomicU64,
    callback_faults: AtomicU64,
}

impl StatsCounters {
    fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ClientStats {
        ClientStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            frames_parsed: self.frames_parsed.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            callback_faults: self.callback_faults.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Events raised by a [`BytesClient`].
#[derive(Debug)]
pub struct ClientEvents {
    pub connected: Event<ConnectedEventArgs>,
    pub connection_failed: Event<ConnectionFailedEventArgs>,
    pub disconnected: Event<DisconnectedEventArgs>,
    /// Once per raw chunk, or once per frame while an unpacker is bound.
    pub data_received: Event<DataReceivedEventArgs>,
    pub data_sent: Event<DataSentEventArgs>,
    pub exception_occurred: Event<ExceptionEventArgs>,
}

impl ClientEvents {
    fn new() -> Self {
        Self {
            connected: Event::new("connected"),
            connection_failed: Event::new("connection_failed"),
            disconnected: Event::new("disconnected"),
            data_received: Event::new("data_received"),
            data_sent: Event::new("data_sent"),
            exception_occurred: Event::new("exception_occurred"),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

struct Session {
    generation: u64,
    _shutdown: oneshot::Sender<()>,
}

struct Binding {
    unpacker: Arc<Unpacker>,
    _forward: Subscription<Bytes>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    options: RwLock<ClientOptions>,
    pool: MemoryBlockPool,
    state: Mutex<ConnectionState>,
    lifecycle: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    /// Wakes sends stuck in a write or pause when the connection is closed.
    write_abort: Notify,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
    healthy: AtomicBool,
    binding: RwLock<Option<Binding>>,
    last_message_time: Mutex<Option<DateTime<Local>>>,
    packet_logging: AtomicBool,
    stats: StatsCounters,
    events: ClientEvents,
}

enum ReceiveOutcome {
    Completed,
    Cancelled,
    Faulted(BytesIoError),
}

/// Puts the state back to `Disconnected` when a connect or disconnect is
/// abandoned halfway, e.g. because its future was dropped.
struct StateReset<'a> {
    state: &'a Mutex<ConnectionState>,
    armed: bool,
}

impl<'a> StateReset<'a> {
    fn new(state: &'a Mutex<ConnectionState>) -> Self {
        Self { state, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StateReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.state.lock() = ConnectionState::Disconnected;
        }
    }
}

/// Byte-stream client over any [`Transport`].
///
/// Cloning is cheap; every clone drives the same connection.
#[derive(Clone)]
pub struct BytesClient {
    inner: Arc<ClientInner>,
}

impl BytesClient {
    pub fn new<T: Transport>(transport: T) -> Self {
        Self::with_options(transport, ClientOptions::default())
    }

    pub fn with_options<T: Transport>(transport: T, options: ClientOptions) -> Self {
        Self::from_shared(Arc::new(transport), options)
    }

    /// Build a client around a transport that is shared elsewhere.
    pub fn from_shared(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                pool: MemoryBlockPool::new(options.receive_buffer_size, options.max_retained_blocks),
                packet_logging: AtomicBool::new(options.packet_logging),
                options: RwLock::new(options),
                state: Mutex::new(ConnectionState::Disconnected),
                lifecycle: tokio::sync::Mutex::new(()),
                writer: tokio::sync::Mutex::new(None),
                write_abort: Notify::new(),
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                healthy: AtomicBool::new(false),
                binding: RwLock::new(None),
                last_message_time: Mutex::new(None),
                stats: StatsCounters::default(),
                events: ClientEvents::new(),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn events(&self) -> &ClientEvents {
        &self.inner.events
    }

    pub fn on_connected<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectedEventArgs) + Send + Sync + 'static,
    {
        self.inner.events.connected.subscribe(handler)
    }

    pub fn on_connection_failed<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectionFailedEventArgs) + Send + Sync + 'static,
    {
        self.inner.events.connection_failed.subscribe(handler)
    }

    pub fn on_disconnected<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&DisconnectedEventArgs) + Send + Sync + 'static,
    {
        self.inner.events.disconnected.subscribe(handler)
    }

    pub fn on_data_received<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&DataReceivedEventArgs) + Send + Sync + 'static,
    {
        self.inner.events.data_received.subscribe(handler)
    }

    pub fn on_data_sent<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&DataSentEventArgs) + Send + Sync + 'static,
    {
        self.inner.events.data_sent.subscribe(handler)
    }

    pub fn on_exception_occurred<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ExceptionEventArgs) + Send + Sync + 'static,
    {
        self.inner.events.exception_occurred.subscribe(handler)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn endpoint(&self) -> String {
        self.inner.transport.endpoint()
    }

    /// Wall-clock time of the last received chunk.
    pub fn last_message_received_time(&self) -> Option<DateTime<Local>> {
        *self.inner.last_message_time.lock()
    }

    pub fn options(&self) -> ClientOptions {
        *self.inner.options.read()
    }

    /// The pool receive blocks are drawn from.
    pub fn pool(&self) -> &MemoryBlockPool {
        &self.inner.pool
    }

    pub fn receive_buffer_size(&self) -> usize {
        self.inner.pool.block_size()
    }

    /// Change the receive block size. Fails while connected.
    pub fn set_receive_buffer_size(&self, size: usize) -> BytesIoResult<()> {
        if size == 0 {
            return Err(BytesIoError::configuration("receive buffer size must be positive"));
        }
        let state = self.inner.state.lock();
        if *state != ConnectionState::Disconnected {
            return Err(BytesIoError::invalid_operation(
                "receive buffer size cannot change while connected",
            ));
        }
        self.inner.pool.set_block_size(size);
        self.inner.options.write().receive_buffer_size = size;
        Ok(())
    }

    /// Change how many idle receive blocks are kept.
    pub fn set_max_retained_blocks(&self, count: usize) {
        self.inner.pool.set_max_retained(count);
        self.inner.options.write().max_retained_blocks = count;
    }

    pub fn set_packet_logging(&self, enabled: bool) {
        self.inner.packet_logging.store(enabled, Ordering::Relaxed);
        self.inner.options.write().packet_logging = enabled;
    }

    pub fn get_stats(&self) -> ClientStats {
        self.inner.stats.snapshot()
    }

    // ------------------------------------------------------------------------
    // Unpacker binding
    // ------------------------------------------------------------------------

    /// Route received blocks through `unpacker`; `data_received` then fires
    /// once per frame. Replaces any previously bound unpacker.
    pub fn bind_unpacker(&self, unpacker: Arc<Unpacker>) {
        let client = Arc::downgrade(&self.inner);
        let forward = unpacker.data_parsed().subscribe_scoped(move |frame: &Bytes| {
            if let Some(inner) = client.upgrade() {
                let client = BytesClient { inner };
                let args = DataReceivedEventArgs { data: frame.clone() };
                client.raise(&client.inner.events.data_received, &args);
            }
        });

        *self.inner.binding.write() = Some(Binding {
            unpacker,
            _forward: forward,
        });
    }

    /// Stop routing through the bound unpacker and return it.
    pub fn unbind_unpacker(&self) -> Option<Arc<Unpacker>> {
        self.inner
            .binding
            .write()
            .take()
            .map(|binding| binding.unpacker)
    }

    pub fn unpacker(&self) -> Option<Arc<Unpacker>> {
        self.inner
            .binding
            .read()
            .as_ref()
            .map(|binding| binding.unpacker.clone())
    }

    // ------------------------------------------------------------------------
    // Connect / disconnect
    // ------------------------------------------------------------------------

    /// Connect using the configured connect timeout.
    pub async fn connect(&self) -> ConnectResult {
        self.connect_with(ConnectArgs::default()).await
    }

    pub async fn connect_with(&self, args: ConnectArgs) -> ConnectResult {
        let _lifecycle = self.inner.lifecycle.lock().await;

        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Connected {
                return ConnectResult::failed(ConnectErrorKind::IsConnected, None);
            }
            *state = ConnectionState::Connecting;
        }
        let reset = StateReset::new(&self.inner.state);

        let endpoint = self.endpoint();
        debug!("Connecting to {}", endpoint);

        let timeout = args.timeout.or(self.inner.options.read().connect_timeout);
        let opened = match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.inner.transport.open()).await {
                Ok(opened) => opened,
                Err(_) => {
                    return self.fail_connect(
                        ConnectErrorKind::Timeout,
                        BytesIoError::timeout("connect", limit.as_millis() as u64),
                    );
                }
            },
            None => self.inner.transport.open().await,
        };

        let Connection { reader, writer } = match opened {
            Ok(connection) => connection,
            Err(error) => {
                let kind = if error.is_configuration() {
                    ConnectErrorKind::ConnectionParameterError
                } else {
                    ConnectErrorKind::Error
                };
                return self.fail_connect(kind, error);
            }
        };

        *self.inner.writer.lock().await = Some(writer);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.inner.session.lock() = Some(Session {
            generation,
            _shutdown: shutdown_tx,
        });
        self.inner.healthy.store(true, Ordering::SeqCst);
        *self.inner.state.lock() = ConnectionState::Connected;
        reset.disarm();
        info!("Connected to {}", endpoint);

        self.raise(
            &self.inner.events.connected,
            &ConnectedEventArgs { endpoint },
        );

        tokio::spawn(receive_task(
            Arc::downgrade(&self.inner),
            self.inner.pool.clone(),
            reader,
            shutdown_rx,
            generation,
        ));

        ConnectResult::success()
    }

    fn fail_connect(&self, kind: ConnectErrorKind, error: BytesIoError) -> ConnectResult {
        *self.inner.state.lock() = ConnectionState::Disconnected;
        warn!("Connect to {} failed ({:?}): {}", self.endpoint(), kind, error);
        self.raise(
            &self.inner.events.connection_failed,
            &ConnectionFailedEventArgs {
                kind,
                error: Some(error.clone()),
            },
        );
        ConnectResult::failed(kind, Some(error))
    }

    /// Close the connection with reason [`DisconnectionReason::Active`].
    pub async fn disconnect(&self) -> DisconnectResult {
        self.disconnect_with(DisconnectArgs::default()).await
    }

    pub async fn disconnect_with(&self, args: DisconnectArgs) -> DisconnectResult {
        self.disconnect_session(None, args).await
    }

    /// Disconnect, optionally only if the connection is still the one with
    /// the given generation.
    async fn disconnect_session(&self, expected: Option<u64>, args: DisconnectArgs) -> DisconnectResult {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if let Some(expected) = expected {
            if self.inner.generation.load(Ordering::SeqCst) != expected {
                return DisconnectResult::failed(DisconnectErrorKind::NoConnection, None);
            }
        }

        {
            let mut state = self.inner.state.lock();
            if *state != ConnectionState::Connected {
                return DisconnectResult::failed(DisconnectErrorKind::NoConnection, None);
            }
            *state = ConnectionState::Disconnecting;
        }
        let reset = StateReset::new(&self.inner.state);

        // Dropping the session signals the receive task to stop
        let session = self.inner.session.lock().take();
        drop(session);
        self.inner.healthy.store(false, Ordering::SeqCst);
        // A send blocked on a peer that stopped reading holds the writer
        self.inner.write_abort.notify_waiters();

        let writer = self.inner.writer.lock().await.take();
        let mut result = DisconnectResult::success();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                debug!("Transport shutdown failed: {}", err);
                result = DisconnectResult::failed(DisconnectErrorKind::Error, Some(err.into()));
            }
        }

        if let Some(unpacker) = self.unpacker() {
            unpacker.clear();
        }

        *self.inner.state.lock() = ConnectionState::Disconnected;
        reset.disarm();
        info!(
            "Disconnected from {} ({:?})",
            self.endpoint(),
            args.reason
        );

        self.raise(
            &self.inner.events.disconnected,
            &DisconnectedEventArgs {
                reason: args.reason,
                error: args.error,
            },
        );
        result
    }

    async fn on_receive_finished(&self, generation: u64, outcome: ReceiveOutcome) {
        match outcome {
            ReceiveOutcome::Cancelled => debug!("Receive loop {} cancelled", generation),
            ReceiveOutcome::Completed => {
                debug!("Peer closed connection {}", generation);
                self.disconnect_session(
                    Some(generation),
                    DisconnectArgs::new(DisconnectionReason::Passive),
                )
                .await;
            }
            ReceiveOutcome::Faulted(error) => {
                warn!("Receive loop {} failed: {}", generation, error);
                self.inner.healthy.store(false, Ordering::SeqCst);
                self.raise_exception_event(error.clone());
                self.disconnect_session(
                    Some(generation),
                    DisconnectArgs::with_error(DisconnectionReason::Error, error),
                )
                .await;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------------

    pub async fn send(&self, data: &[u8]) -> BytesIoResult<()> {
        self.send_with_options(data, &SendOptions::default()).await
    }

    /// Write `data` completely, then hold the send lock for `pause_time`.
    ///
    /// A disconnect interrupts the write or the pause; the send then fails
    /// with a connection error.
    pub async fn send_with_options(&self, data: &[u8], options: &SendOptions) -> BytesIoResult<()> {
        // Registered before the state check so a disconnect cannot slip between
        let abort = self.inner.write_abort.notified();
        tokio::pin!(abort);

        let mut writer = self.inner.writer.lock().await;
        let stream = match writer.as_mut() {
            Some(stream) if self.is_connected() => stream,
            _ => return Err(BytesIoError::NotConnected),
        };

        let written = tokio::select! {
            written = async {
                stream.write_all(data).await?;
                stream.flush().await
            } => written,
            _ = &mut abort => {
                debug!("Send to {} interrupted by disconnect", self.endpoint());
                return Err(BytesIoError::connection("connection closed during send"));
            }
        };

        if let Err(err) = written {
            drop(writer);
            let error = BytesIoError::from(err);
            warn!("Send to {} failed: {}", self.endpoint(), error);
            StatsCounters::add(&self.inner.stats.send_errors, 1);
            self.inner.healthy.store(false, Ordering::SeqCst);
            self.raise_exception(error.clone());
            return Err(error);
        }

        StatsCounters::add(&self.inner.stats.bytes_sent, data.len() as u64);
        StatsCounters::add(&self.inner.stats.frames_sent, 1);
        if self.inner.packet_logging.load(Ordering::Relaxed) {
            log_packet(self.inner.transport.protocol(), PacketDirection::Send, data);
        }

        self.raise(
            &self.inner.events.data_sent,
            &DataSentEventArgs {
                data: Bytes::copy_from_slice(data),
            },
        );

        if !options.pause_time.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(options.pause_time) => {}
                _ = &mut abort => {}
            }
        }
        drop(writer);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------------

    /// Push a received block into the pipeline.
    ///
    /// Used by the receive loop and by transports that deliver data
    /// themselves. The block is owned by the pipeline from here on.
    pub fn receive_block(&self, block: MemoryBlock) {
        *self.inner.last_message_time.lock() = Some(Local::now());
        StatsCounters::add(&self.inner.stats.chunks_received, 1);
        StatsCounters::add(&self.inner.stats.bytes_received, block.len() as u64);
        if self.inner.packet_logging.load(Ordering::Relaxed) {
            log_packet(self.inner.transport.protocol(), PacketDirection::Receive, &block);
        }

        match self.unpacker() {
            Some(unpacker) => match catch_unwind(AssertUnwindSafe(|| unpacker.input(block))) {
                Ok(report) => {
                    StatsCounters::add(&self.inner.stats.frames_parsed, report.frames as u64);
                    self.report_failures(report.failures);
                }
                Err(payload) => {
                    // The partial frame may be inconsistent after a calculator panic
                    unpacker.clear();
                    self.report_failures(vec![BytesIoError::from_panic(payload)]);
                }
            },
            None => {
                let args = DataReceivedEventArgs {
                    data: Bytes::copy_from_slice(&block),
                };
                drop(block);
                self.raise(&self.inner.events.data_received, &args);
            }
        }
    }

    /// Push received bytes that are not held in a pooled block. The bytes are
    /// copied into pooled blocks, one block per `receive_buffer_size` bytes.
    pub fn receive_bytes(&self, data: &[u8]) {
        if data.is_empty() {
            *self.inner.last_message_time.lock() = Some(Local::now());
            return;
        }
        for chunk in data.chunks(self.inner.pool.block_size()) {
            let mut block = self.inner.pool.get();
            block.buffer_mut()[..chunk.len()].copy_from_slice(chunk);
            block.set_segment(0, chunk.len());
            self.receive_block(block);
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    pub(crate) fn raise<T>(&self, event: &Event<T>, args: &T) {
        let failures = event.emit(args);
        self.report_failures(failures);
    }

    fn report_failures(&self, failures: Vec<BytesIoError>) {
        for failure in failures {
            StatsCounters::add(&self.inner.stats.callback_faults, 1);
            self.raise_exception(failure);
        }
    }

    fn raise_exception_event(&self, error: BytesIoError) {
        let args = ExceptionEventArgs { error };
        for failure in self.inner.events.exception_occurred.emit(&args) {
            error!("Exception handler panicked: {}", failure);
        }
    }

    /// Report an asynchronous failure, then close the connection if the
    /// transport is no longer usable.
    fn raise_exception(&self, error: BytesIoError) {
        self.raise_exception_event(error.clone());

        if self.is_connected() && !self.inner.healthy.load(Ordering::SeqCst) {
            let generation = self.inner.generation.load(Ordering::SeqCst);
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let client = self.clone();
                    runtime.spawn(async move {
                        client
                            .disconnect_session(
                                Some(generation),
                                DisconnectArgs::with_error(DisconnectionReason::Error, error),
                            )
                            .await;
                    });
                }
                Err(_) => warn!("No runtime available to close broken connection"),
            }
        }
    }
}

impl fmt::Debug for BytesClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytesClient")
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Receive loop
// ============================================================================

async fn receive_task(
    client: Weak<ClientInner>,
    pool: MemoryBlockPool,
    reader: BoxReader,
    shutdown: oneshot::Receiver<()>,
    generation: u64,
) {
    let outcome = pump(&client, pool, reader, shutdown).await;
    if let Some(inner) = client.upgrade() {
        BytesClient { inner }
            .on_receive_finished(generation, outcome)
            .await;
    }
}

async fn pump(
    client: &Weak<ClientInner>,
    pool: MemoryBlockPool,
    mut reader: BoxReader,
    mut shutdown: oneshot::Receiver<()>,
) -> ReceiveOutcome {
    loop {
        let mut block = pool.get();
        let read = tokio::select! {
            biased;
            _ = &mut shutdown => return ReceiveOutcome::Cancelled,
            read = reader.read(block.buffer_mut()) => read,
        };

        match read {
            Ok(0) => return ReceiveOutcome::Completed,
            Ok(n) => {
                block.set_segment(0, n);
                let Some(inner) = client.upgrade() else {
                    return ReceiveOutcome::Cancelled;
                };
                BytesClient { inner }.receive_block(block);
            }
            Err(err) => return ReceiveOutcome::Faulted(err.into()),
        }
    }
}

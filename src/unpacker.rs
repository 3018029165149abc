//! # Stream unpacker
//!
//! Turns an arbitrary, non-aligned byte stream into discrete frames.
//!
//! ## Framing loop
//!
//! Every call to [`Unpacker::input`] appends the new block to the
//! accumulator and then carves out as many frames as possible:
//!
//! 1. With a start mark configured, the accumulator is realigned so that it
//!    begins with the mark. Leading noise is skipped. When the mark is not
//!    present at all, a [`UnpackErrorKind::StartMarkNotMatch`] is reported and
//!    only the last `mark.len() - 1` bytes are kept, enough to complete a mark
//!    split across two chunks.
//! 2. The [`PacketLengthCalculator`] inspects the accumulator and returns the
//!    total frame length, or a value `<= 0` when it cannot tell yet.
//! 3. A complete frame is copied out, published on
//!    [`data_parsed`](Unpacker::data_parsed) and skipped. Coalesced frames
//!    are handled by looping.
//!
//! When an interrupt timeout is set, a partial frame that waits longer than
//! the timeout for its next fragment is dropped on the next input instead of
//! being prepended to it.
//!
//! ## Concurrency
//!
//! Input runs under one lock per unpacker, so frames are published in arrival
//! order even with several producers. Handlers run while that lock is held and
//! must not feed the same unpacker again.
//!
//! ```rust
//! use bytesio::unpacker::{LengthPrefix, Unpacker};
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//!
//! let unpacker = Unpacker::new(LengthPrefix::u16_be());
//! let frames = Arc::new(Mutex::new(Vec::new()));
//! let sink = frames.clone();
//! unpacker.data_parsed().subscribe(move |frame| sink.lock().push(frame.clone()));
//!
//! unpacker.input_bytes(&[0x00, 0x05, b'h']);
//! unpacker.input_bytes(b"ello");
//! assert_eq!(&frames.lock()[0][2..], b"hello");
//! ```

use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{BytesIoError, BytesIoResult};
use crate::event::{Event, Subscription};
use crate::packet::MemoryPacket;
use crate::pool::MemoryBlock;

// ============================================================================
// Protocol contract
// ============================================================================

/// Computes the length of the frame at the front of the accumulator.
///
/// Must be deterministic and free of side effects. Returns the total frame
/// length (header, marker and checksum included) or `<= 0` while there is not
/// enough data to decide.
pub trait PacketLengthCalculator: Send + Sync {
    fn calculate(&self, packet: &MemoryPacket) -> i64;
}

impl<F> PacketLengthCalculator for F
where
    F: Fn(&MemoryPacket) -> i64 + Send + Sync,
{
    fn calculate(&self, packet: &MemoryPacket) -> i64 {
        self(packet)
    }
}

/// Frames preceded by an unsigned length field counting the payload only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthPrefix {
    width: usize,
    big_endian: bool,
}

impl LengthPrefix {
    pub fn u8() -> Self {
        Self {
            width: 1,
            big_endian: true,
        }
    }

    pub fn u16_be() -> Self {
        Self {
            width: 2,
            big_endian: true,
        }
    }

    pub fn u16_le() -> Self {
        Self {
            width: 2,
            big_endian: false,
        }
    }

    pub fn u32_be() -> Self {
        Self {
            width: 4,
            big_endian: true,
        }
    }

    pub fn header_len(&self) -> usize {
        self.width
    }
}

impl PacketLengthCalculator for LengthPrefix {
    fn calculate(&self, packet: &MemoryPacket) -> i64 {
        if packet.len() < self.width {
            return 0;
        }
        let header = packet.iter().take(self.width);
        let payload = if self.big_endian {
            header.fold(0u64, |acc, b| (acc << 8) | u64::from(b))
        } else {
            header
                .enumerate()
                .fold(0u64, |acc, (i, b)| acc | (u64::from(b) << (8 * i)))
        };
        (self.width as u64 + payload) as i64
    }
}

/// Non-fatal framing problems reported to the error handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnpackErrorKind {
    /// The accumulator did not contain the start mark.
    StartMarkNotMatch,
    /// A typed unpacker could not build its response from a frame.
    ResponseRejected(BytesIoError),
}

type ErrorHandler = Arc<dyn Fn(&UnpackErrorKind) + Send + Sync>;

/// Frames and handler failures produced by one [`Unpacker::input`] call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InputReport {
    pub frames: usize,
    pub failures: Vec<BytesIoError>,
}

// ============================================================================
// Unpacker
// ============================================================================

struct UnpackerState {
    cache: Option<MemoryPacket>,
    start_mark: Option<Bytes>,
    interrupt_timeout: Duration,
    fragment_started_at: Option<Instant>,
}

/// Framing state machine for one byte stream.
pub struct Unpacker {
    state: Mutex<UnpackerState>,
    calculator: Box<dyn PacketLengthCalculator>,
    error_handler: RwLock<Option<ErrorHandler>>,
    parsed: Event<Bytes>,
}

impl Unpacker {
    pub fn new<C>(calculator: C) -> Self
    where
        C: PacketLengthCalculator + 'static,
    {
        Self {
            state: Mutex::new(UnpackerState {
                cache: None,
                start_mark: None,
                interrupt_timeout: Duration::ZERO,
                fragment_started_at: None,
            }),
            calculator: Box::new(calculator),
            error_handler: RwLock::new(None),
            parsed: Event::new("data_parsed"),
        }
    }

    pub fn with_start_mark(mut self, mark: impl Into<Bytes>) -> Self {
        self.state.get_mut().start_mark = Some(mark.into());
        self
    }

    /// Drop a partial frame whose next fragment arrives later than `timeout`.
    /// `Duration::ZERO` disables the check.
    pub fn with_interrupt_timeout(mut self, timeout: Duration) -> Self {
        self.state.get_mut().interrupt_timeout = timeout;
        self
    }

    pub fn with_error_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&UnpackErrorKind) + Send + Sync + 'static,
    {
        self.set_error_handler(handler);
        self
    }

    pub fn start_mark(&self) -> Option<Bytes> {
        self.state.lock().start_mark.clone()
    }

    pub fn set_start_mark(&self, mark: Option<Bytes>) {
        self.state.lock().start_mark = mark;
    }

    pub fn interrupt_timeout(&self) -> Duration {
        self.state.lock().interrupt_timeout
    }

    pub fn set_interrupt_timeout(&self, timeout: Duration) {
        let mut state = self.state.lock();
        state.interrupt_timeout = timeout;
        if timeout.is_zero() {
            state.fragment_started_at = None;
        }
    }

    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&UnpackErrorKind) + Send + Sync + 'static,
    {
        *self.error_handler.write() = Some(Arc::new(handler));
    }

    /// Published once per resolved frame, in arrival order.
    pub fn data_parsed(&self) -> &Event<Bytes> {
        &self.parsed
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered_len(&self) -> usize {
        self.state
            .lock()
            .cache
            .as_ref()
            .map_or(0, MemoryPacket::len)
    }

    /// Drop any partial frame.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.cache = None;
        state.fragment_started_at = None;
    }

    /// Feed a chunk that is not held in a block. The bytes are copied.
    pub fn input_bytes(&self, data: &[u8]) -> InputReport {
        self.input(MemoryBlock::copy_from_slice(data))
    }

    /// Take ownership of a received block and publish every frame it completes.
    pub fn input(&self, block: MemoryBlock) -> InputReport {
        let mut report = InputReport::default();
        let now = Instant::now();

        let mut guard = self.state.lock();
        let UnpackerState {
            cache,
            start_mark,
            interrupt_timeout,
            fragment_started_at,
        } = &mut *guard;

        match cache.as_mut() {
            None => *cache = Some(MemoryPacket::from_block(block)),
            Some(packet) => {
                let stale = !interrupt_timeout.is_zero()
                    && fragment_started_at
                        .is_some_and(|started| now.duration_since(started) > *interrupt_timeout);
                if stale {
                    debug!(
                        "Discarding {} bytes of interrupted frame after {:?}",
                        packet.len(),
                        interrupt_timeout
                    );
                    packet.clear();
                    *fragment_started_at = None;
                }
                packet.append(block);
            }
        }

        while let Some(packet) = cache.as_mut() {
            if packet.is_empty() {
                *cache = None;
                break;
            }
            let cache_len = packet.len();

            if let Some(mark) = start_mark.as_ref().filter(|mark| !mark.is_empty()) {
                if cache_len < mark.len() {
                    if !interrupt_timeout.is_zero() {
                        *fragment_started_at = Some(now);
                    }
                    break;
                }
                match packet.index_of(mark) {
                    Some(0) => {}
                    Some(position) => {
                        debug!("Skipping {} bytes before start mark", position);
                        packet.skip(position);
                        continue;
                    }
                    None => {
                        let keep = mark.len() - 1;
                        debug!(
                            "Start mark not found in {} bytes, keeping last {}",
                            cache_len, keep
                        );
                        packet.skip(cache_len - keep);
                        if packet.is_empty() {
                            *cache = None;
                            *fragment_started_at = None;
                        } else if !interrupt_timeout.is_zero() {
                            *fragment_started_at = Some(now);
                        }
                        if let Some(failure) = self.report(UnpackErrorKind::StartMarkNotMatch) {
                            report.failures.push(failure);
                        }
                        break;
                    }
                }
            }

            let packet_len = self.calculator.calculate(packet);
            if packet_len <= 0 || packet_len as u64 > cache_len as u64 {
                if !interrupt_timeout.is_zero() {
                    *fragment_started_at = Some(now);
                }
                break;
            }

            let packet_len = packet_len as usize;
            let frame = match packet.read(packet_len, 0) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("Failed to extract frame: {}", err);
                    break;
                }
            };
            report.failures.extend(self.parsed.emit(&frame));
            report.frames += 1;
            packet.skip(packet_len);

            if packet.is_empty() {
                *cache = None;
                *fragment_started_at = None;
            }
        }

        report
    }

    /// Call the error handler, returning its panic if it had one.
    fn report(&self, kind: UnpackErrorKind) -> Option<BytesIoError> {
        let handler = self.error_handler.read().clone();
        let Some(handler) = handler else {
            debug!("Unhandled unpack error: {:?}", kind);
            return None;
        };
        catch_unwind(AssertUnwindSafe(|| handler(&kind)))
            .err()
            .map(BytesIoError::from_panic)
    }
}

impl fmt::Debug for Unpacker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Unpacker")
            .field("buffered", &state.cache.as_ref().map_or(0, MemoryPacket::len))
            .field("start_mark", &state.start_mark)
            .field("interrupt_timeout", &state.interrupt_timeout)
            .finish()
    }
}

// ============================================================================
// Typed unpacker
// ============================================================================

/// Response types that can be built from one frame.
pub trait FromFrame: Sized {
    fn from_frame(frame: Bytes) -> BytesIoResult<Self>;
}

/// Unpacker that publishes protocol responses instead of raw frames.
///
/// Wraps a raw [`Unpacker`] (which is what gets bound to a client) and a
/// factory that converts each frame. Frames the factory rejects are reported
/// to the raw unpacker's error handler as
/// [`UnpackErrorKind::ResponseRejected`].
pub struct TypedUnpacker<T> {
    raw: Arc<Unpacker>,
    parsed: Event<T>,
    _bridge: Subscription<Bytes>,
}

impl<T> TypedUnpacker<T>
where
    T: Send + Sync + 'static,
{
    pub fn new<F>(raw: Arc<Unpacker>, factory: F) -> Self
    where
        F: Fn(Bytes) -> BytesIoResult<T> + Send + Sync + 'static,
    {
        let parsed = Event::new("typed_data_parsed");
        let typed = parsed.clone();
        let source = Arc::downgrade(&raw);

        let bridge = raw.data_parsed().subscribe_scoped(move |frame: &Bytes| {
            let failure = match factory(frame.clone()) {
                Ok(response) => typed.emit(&response).into_iter().next(),
                Err(error) => source
                    .upgrade()
                    .and_then(|unpacker| unpacker.report(UnpackErrorKind::ResponseRejected(error))),
            };
            // Re-raise so the frame dispatcher reports it to its emitter
            if let Some(failure) = failure {
                resume_unwind(Box::new(failure.to_string()));
            }
        });

        Self {
            raw,
            parsed,
            _bridge: bridge,
        }
    }

    /// Build responses with [`FromFrame::from_frame`].
    pub fn for_type(raw: Arc<Unpacker>) -> Self
    where
        T: FromFrame,
    {
        Self::new(raw, T::from_frame)
    }

    /// The raw unpacker to bind to a client.
    pub fn raw(&self) -> &Arc<Unpacker> {
        &self.raw
    }

    /// Published once per successfully converted frame.
    pub fn data_parsed(&self) -> &Event<T> {
        &self.parsed
    }

    pub fn input(&self, block: MemoryBlock) -> InputReport {
        self.raw.input(block)
    }
}

impl<T> fmt::Debug for TypedUnpacker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedUnpacker")
            .field("raw", &self.raw)
            .field("subscribers", &self.parsed.len())
            .finish()
    }
}

//! # BytesIO - Stream Framing and Request/Reply Client Toolkit
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! Building blocks for clients that talk framed binary protocols over byte
//! streams (TCP sockets, serial lines), plus a Modbus master built on them.
//!
//! ## Features
//!
//! - **Pooled receive buffers**: owning blocks that return to their pool on drop
//! - **Framing engine**: reassembles variable-length frames from fragmented
//!   and coalesced chunks, with start-mark recovery and inter-fragment timeout
//! - **Event fan-out**: ordered observers that may unsubscribe mid-dispatch;
//!   a panicking handler is reported, never propagated
//! - **Request/reply correlation**: send and wait for the matching frame,
//!   with a timeout and no leaked listeners
//! - **Transports**: TCP, and serial under the `rtu` feature
//! - **Modbus adapter**: RTU and TCP framing, FC01-FC06, FC15, FC16
//!
//! ## Pipeline
//!
//! | Stage | Type |
//! |-------|------|
//! | transport read | [`Transport`] / [`Connection`] |
//! | receive buffer | [`MemoryBlock`] from a [`MemoryBlockPool`] |
//! | accumulate | [`MemoryPacket`] |
//! | frame | [`Unpacker`] with a [`PacketLengthCalculator`] |
//! | typed response | [`TypedUnpacker`] / [`FromFrame`] |
//! | correlate | [`Reply`] via `send_and_await_reply` |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bytesio::{BytesClient, LengthPrefix, TcpTransport, Unpacker};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = BytesClient::new(TcpTransport::new("127.0.0.1:7000"));
//!
//!     // Frames are a big-endian u16 length followed by the payload
//!     client.bind_unpacker(Arc::new(Unpacker::new(LengthPrefix::u16_be())));
//!     client.on_data_received(|e| println!("frame: {:02X?}", &e.data[..]));
//!
//!     if client.connect().await.is_success() {
//!         let reply = client
//!             .send_and_await_reply(b"\x00\x04ping", Duration::from_secs(1))
//!             .await;
//!         println!("{:?}", reply.status());
//!         client.disconnect().await;
//!     }
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Default sizes, caps and timeouts
pub mod constants;

/// Pooled receive buffers
pub mod pool;

/// Accumulator for partially received frames
pub mod packet;

/// Framing state machine
pub mod unpacker;

/// Observer lists
pub mod event;

/// Connect/disconnect vocabulary and event arguments
pub mod entity;

/// Transport contract and TCP / serial transports
pub mod transport;

/// Byte-stream client
pub mod client;

/// Request/reply correlation
pub mod reply;

/// Synchronous facade
pub mod blocking;

/// Hex packet logging
pub mod logging;

// ============================================================================
// Protocol adapters
// ============================================================================

/// Modbus RTU / TCP master
pub mod modbus;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use bytesio::tokio) ===
pub use tokio;

// === Client API ===
pub use blocking::BlockingClient;
pub use client::{BytesClient, ClientEvents, ClientOptions, ClientStats};
pub use reply::{Reply, ReplyStatus, Request};

// === Error handling ===
pub use error::{BytesIoError, BytesIoResult};

// === Lifecycle ===
pub use entity::{
    ConnectArgs, ConnectErrorKind, ConnectResult, ConnectedEventArgs, ConnectionFailedEventArgs,
    ConnectionState, DataReceivedEventArgs, DataSentEventArgs, DisconnectArgs,
    DisconnectErrorKind, DisconnectResult, DisconnectedEventArgs, DisconnectionReason,
    ExceptionEventArgs, SendOptions,
};
pub use event::{Event, Subscription, SubscriptionId};

// === Buffers and framing ===
pub use packet::MemoryPacket;
pub use pool::{BlockView, ByteArrayPool, MemoryBlock, MemoryBlockPool};
pub use unpacker::{
    FromFrame, InputReport, LengthPrefix, PacketLengthCalculator, TypedUnpacker, UnpackErrorKind,
    Unpacker,
};

// === Transports ===
pub use transport::{BoxReader, BoxWriter, Connection, TcpTransport, Transport};

#[cfg(feature = "rtu")]
pub use transport::SerialTransport;

// === Modbus ===
pub use modbus::{ModbusClient, ModbusFraming, ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};

// === Defaults ===
pub use constants::{DEFAULT_BLOCK_SIZE, DEFAULT_MAX_RETAINED_BLOCKS, DEFAULT_REPLY_TIMEOUT_MS};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "BytesIO v{} - Stream framing and request/reply client toolkit by Evan Liu",
        VERSION
    )
}

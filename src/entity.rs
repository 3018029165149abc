//! Lifecycle vocabulary shared by clients and transports
//!
//! Connect and disconnect report through closed result enums instead of
//! errors so that "already connected" or "nothing to disconnect" can be
//! handled without matching on error variants.

use std::time::Duration;

use bytes::Bytes;

use crate::error::BytesIoError;

// ============================================================================
// Connection state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

// ============================================================================
// Connect
// ============================================================================

/// Outcome code of a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// Connected successfully.
    None,
    /// Rejected because the client is already connected.
    IsConnected,
    /// The transport failed to connect.
    Error,
    /// The connection parameters are invalid.
    ConnectionParameterError,
    /// The attempt did not finish within the requested timeout.
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResult {
    pub kind: ConnectErrorKind,
    pub error: Option<BytesIoError>,
}

impl ConnectResult {
    pub fn success() -> Self {
        Self {
            kind: ConnectErrorKind::None,
            error: None,
        }
    }

    pub fn failed(kind: ConnectErrorKind, error: Option<BytesIoError>) -> Self {
        Self { kind, error }
    }

    pub fn is_success(&self) -> bool {
        self.kind == ConnectErrorKind::None
    }
}

/// Options for one connect attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectArgs {
    /// Abort the attempt after this long. `None` waits for the transport.
    pub timeout: Option<Duration>,
}

impl ConnectArgs {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

// ============================================================================
// Disconnect
// ============================================================================

/// Outcome code of a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectErrorKind {
    None,
    /// There was no connection to close.
    NoConnection,
    /// Closing the transport failed. The client is disconnected anyway.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectResult {
    pub kind: DisconnectErrorKind,
    pub error: Option<BytesIoError>,
}

impl DisconnectResult {
    pub fn success() -> Self {
        Self {
            kind: DisconnectErrorKind::None,
            error: None,
        }
    }

    pub fn failed(kind: DisconnectErrorKind, error: Option<BytesIoError>) -> Self {
        Self { kind, error }
    }

    pub fn is_success(&self) -> bool {
        self.kind == DisconnectErrorKind::None
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectionReason {
    /// Closed by the local user.
    #[default]
    Active,
    /// Closed by the remote peer (end of stream).
    Passive,
    /// Closed because of a transport or callback fault.
    Error,
    /// Closed by a liveness timeout.
    Timeout,
    /// Connect attempt timed out.
    ConnectTimeout,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectArgs {
    pub reason: DisconnectionReason,
    pub error: Option<BytesIoError>,
}

impl DisconnectArgs {
    pub fn new(reason: DisconnectionReason) -> Self {
        Self {
            reason,
            error: None,
        }
    }

    pub fn with_error(reason: DisconnectionReason, error: BytesIoError) -> Self {
        Self {
            reason,
            error: Some(error),
        }
    }
}

// ============================================================================
// Send
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Pause after the write completes, before the next send may start.
    pub pause_time: Duration,
}

impl SendOptions {
    pub fn with_pause_time(pause_time: Duration) -> Self {
        Self { pause_time }
    }
}

// ============================================================================
// Event arguments
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedEventArgs {
    /// Transport description, e.g. `tcp://127.0.0.1:502`.
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFailedEventArgs {
    pub kind: ConnectErrorKind,
    pub error: Option<BytesIoError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedEventArgs {
    pub reason: DisconnectionReason,
    pub error: Option<BytesIoError>,
}

/// One raw chunk, or one frame when an unpacker is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataReceivedEventArgs {
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSentEventArgs {
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionEventArgs {
    pub error: BytesIoError,
}

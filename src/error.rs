//! Error types and result handling
//!
//! Every fallible operation in the crate returns [`BytesIoResult`]. The error
//! carries owned messages instead of boxed sources so it can be cloned into
//! connect results, replies and exception events.

use thiserror::Error;

/// Result type used throughout the crate.
pub type BytesIoResult<T> = Result<T, BytesIoError>;

/// Errors raised by clients, transports, unpackers and protocol adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BytesIoError {
    /// Underlying I/O failure.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection could not be established or was lost.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Operation requires an active connection.
    #[error("Not connected")]
    NotConnected,

    /// Operation did not complete in time.
    #[error("Timeout: {operation} timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Invalid connection parameters or options.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Operation is not allowed in the current state.
    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    /// Byte range outside of the buffered data.
    #[error("Out of range: offset {offset} + count {count} exceeds {available} bytes")]
    OutOfRange {
        offset: usize,
        count: usize,
        available: usize,
    },

    /// Protocol violation in a received frame.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Malformed frame (bad length, bad checksum).
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Invalid request or response data.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Unsupported function code.
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Exception response returned by a remote device.
    #[error("Device exception: function 0x{function:02X}, code 0x{code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// A user supplied callback panicked.
    #[error("Callback failed: {message}")]
    Callback { message: String },

    /// Reply payload could not be converted to the requested type.
    #[error("Reply conversion failed: {message}")]
    ReplyConversion { message: String },
}

impl BytesIoError {
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_operation<S: Into<String>>(message: S) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn callback<S: Into<String>>(message: S) -> Self {
        Self::Callback {
            message: message.into(),
        }
    }

    pub fn reply_conversion<S: Into<String>>(message: S) -> Self {
        Self::ReplyConversion {
            message: message.into(),
        }
    }

    /// Whether retrying the operation later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Connection { .. } | Self::NotConnected | Self::Io { .. }
        )
    }

    /// Whether this error came from the connection parameters rather than the peer.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Build a callback error from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "callback panicked".to_string()
        };
        Self::Callback { message }
    }
}

impl From<std::io::Error> for BytesIoError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidInput | ErrorKind::AddrNotAvailable => {
                Self::configuration(err.to_string())
            }
            ErrorKind::TimedOut => Self::timeout("io", 0),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => Self::connection(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err: BytesIoError =
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad address").into();
        assert!(err.is_configuration());

        let err: BytesIoError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(err, BytesIoError::Connection { .. }));
        assert!(err.is_recoverable());

        let err: BytesIoError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(err, BytesIoError::io("boom"));
    }

    #[test]
    fn test_display() {
        let err = BytesIoError::timeout("send_and_await_reply", 3000);
        assert_eq!(
            err.to_string(),
            "Timeout: send_and_await_reply timed out after 3000 ms"
        );

        let err = BytesIoError::OutOfRange {
            offset: 4,
            count: 8,
            available: 10,
        };
        assert!(err.to_string().contains("exceeds 10 bytes"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_from_panic_payload() {
        let err = BytesIoError::from_panic(Box::new("handler blew up"));
        assert_eq!(err, BytesIoError::callback("handler blew up"));

        let err = BytesIoError::from_panic(Box::new(String::from("owned")));
        assert_eq!(err, BytesIoError::callback("owned"));

        let err = BytesIoError::from_panic(Box::new(42u32));
        assert_eq!(err, BytesIoError::callback("callback panicked"));
    }
}

//! # Transport layer
//!
//! A [`Transport`] knows how to open one connection and hands the client a
//! [`Connection`]: a readable half the receive loop pulls chunks from and a
//! writable half sends go through. Everything else (pooling, framing,
//! correlation, events) lives in the client, so a transport only deals with
//! its socket or port.
//!
//! ## Contract
//!
//! - `open` either returns a ready connection or an error. Invalid parameters
//!   should be reported as [`BytesIoError::Configuration`] so the client can
//!   answer with `ConnectionParameterError`.
//! - A read of `0` bytes means the peer closed the stream.
//! - Dropping the open future must abandon the attempt without leaking a
//!   half-open resource. Tokio's connect futures already behave this way.
//!
//! ## Provided transports
//!
//! - [`TcpTransport`]: TCP client over `tokio::net::TcpStream`
//! - [`SerialTransport`]: serial port over `tokio-serial` (feature `rtu`)

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{BytesIoError, BytesIoResult};

/// Readable half of a connection.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable half of a connection.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open connection split into its two halves.
pub struct Connection {
    pub reader: BoxReader,
    pub writer: BoxWriter,
}

impl Connection {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Split a bidirectional stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens connections for a [`BytesClient`](crate::BytesClient).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a fresh connection.
    async fn open(&self) -> BytesIoResult<Connection>;

    /// Human readable endpoint, e.g. `tcp://127.0.0.1:502`.
    fn endpoint(&self) -> String;

    /// Short tag used in packet logs.
    fn protocol(&self) -> &'static str {
        "STREAM"
    }
}

// ============================================================================
// TCP
// ============================================================================

/// TCP client transport.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    address: String,
    nodelay: bool,
}

impl TcpTransport {
    /// Transport for a `host:port` address. Host names are resolved on every
    /// connect.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            nodelay: true,
        }
    }

    pub fn from_socket_addr(address: SocketAddr) -> Self {
        Self::new(address.to_string())
    }

    /// Toggle `TCP_NODELAY` (on by default).
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self) -> BytesIoResult<Connection> {
        if self.address.trim().is_empty() {
            return Err(BytesIoError::configuration("TCP address is empty"));
        }

        let stream = TcpStream::connect(self.address.as_str()).await?;
        stream.set_nodelay(self.nodelay)?;
        debug!(
            "TCP connected to {} from {:?}",
            self.address,
            stream.local_addr().ok()
        );

        let (reader, writer) = stream.into_split();
        Ok(Connection::new(reader, writer))
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}", self.address)
    }

    fn protocol(&self) -> &'static str {
        "TCP"
    }
}

// ============================================================================
// Serial
// ============================================================================

#[cfg(feature = "rtu")]
pub use serial::SerialTransport;

#[cfg(feature = "rtu")]
mod serial {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};
    use tracing::debug;

    use super::{Connection, Transport};
    use crate::error::{BytesIoError, BytesIoResult};

    /// Serial port transport (RS-232 / RS-485).
    #[derive(Debug, Clone)]
    pub struct SerialTransport {
        port: String,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    }

    impl SerialTransport {
        /// 8N1 on the given port.
        pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
            Self {
                port: port.into(),
                baud_rate,
                data_bits: DataBits::Eight,
                parity: Parity::None,
                stop_bits: StopBits::One,
            }
        }

        pub fn with_format(mut self, data_bits: DataBits, parity: Parity, stop_bits: StopBits) -> Self {
            self.data_bits = data_bits;
            self.parity = parity;
            self.stop_bits = stop_bits;
            self
        }

        pub fn port(&self) -> &str {
            &self.port
        }

        pub fn baud_rate(&self) -> u32 {
            self.baud_rate
        }

        /// Silent interval of 3.5 character times between frames.
        ///
        /// Fixed at 1.75 ms above 19200 baud.
        pub fn inter_frame_delay(&self) -> Duration {
            if self.baud_rate > 19200 {
                Duration::from_micros(1750)
            } else {
                // 11 bits per character
                let micros = 3.5 * 11.0 * 1_000_000.0 / f64::from(self.baud_rate.max(1));
                Duration::from_micros(micros.ceil() as u64)
            }
        }
    }

    #[async_trait]
    impl Transport for SerialTransport {
        async fn open(&self) -> BytesIoResult<Connection> {
            if self.port.trim().is_empty() || self.baud_rate == 0 {
                return Err(BytesIoError::configuration(format!(
                    "invalid serial parameters: port '{}', baud {}",
                    self.port, self.baud_rate
                )));
            }

            let stream = tokio_serial::new(&self.port, self.baud_rate)
                .data_bits(self.data_bits)
                .parity(self.parity)
                .stop_bits(self.stop_bits)
                .open_native_async()
                .map_err(|e| match e.kind() {
                    tokio_serial::ErrorKind::InvalidInput | tokio_serial::ErrorKind::NoDevice => {
                        BytesIoError::configuration(e.to_string())
                    }
                    _ => BytesIoError::connection(e.to_string()),
                })?;
            debug!("Serial port {} opened at {} baud", self.port, self.baud_rate);

            Ok(Connection::from_stream(stream))
        }

        fn endpoint(&self) -> String {
            format!("serial://{}@{}", self.port, self.baud_rate)
        }

        fn protocol(&self) -> &'static str {
            "SERIAL"
        }
    }

}

/// In-memory transport for unit tests: every `open` hands the client one end
/// of a duplex pipe and sends the other end to the test.
#[cfg(test)]
pub(crate) struct PipeTransport {
    peers: tokio::sync::mpsc::UnboundedSender<tokio::io::DuplexStream>,
}

#[cfg(test)]
impl PipeTransport {
    pub(crate) fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<tokio::io::DuplexStream>) {
        let (peers, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { peers }, rx)
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for PipeTransport {
    async fn open(&self) -> BytesIoResult<Connection> {
        let (local, remote) = tokio::io::duplex(4096);
        self.peers
            .send(remote)
            .map_err(|_| BytesIoError::connection("test peer gone"))?;
        Ok(Connection::from_stream(local))
    }

    fn endpoint(&self) -> String {
        "pipe://test".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_open_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let transport = TcpTransport::from_socket_addr(address);
        assert_eq!(transport.endpoint(), format!("tcp://{}", address));
        let mut connection = transport.open().await.unwrap();
        connection.writer.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        connection.reader.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_refused_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpTransport::from_socket_addr(address)
            .open()
            .await
            .unwrap_err();
        assert!(!err.is_configuration());
    }

    #[tokio::test]
    async fn test_tcp_bad_address_is_a_parameter_error() {
        let err = TcpTransport::new("  ").open().await.unwrap_err();
        assert!(err.is_configuration());

        let err = TcpTransport::new("no-port-here").open().await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_connection_from_duplex_stream() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut connection = Connection::from_stream(client);
        server.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        connection.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }
}

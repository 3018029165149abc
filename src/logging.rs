//! Packet logging
//!
//! When packet logging is enabled on a client, every chunk written or read is
//! emitted at `info` level as a hex dump:
//!
//! ```text
//! [BYTESIO-TCP] send 01 03 00 00 00 0A C5 CD
//! [BYTESIO-TCP] recv 01 03 14 00 01 ...
//! ```

use std::fmt;

use tracing::info;

/// Direction of a logged packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Send,
    Receive,
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Receive => f.write_str("recv"),
        }
    }
}

/// Format raw bytes as space separated upper-case hex.
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log one packet with its transport tag and direction.
pub fn log_packet(protocol: &str, direction: PacketDirection, data: &[u8]) {
    info!(
        "[BYTESIO-{}] {} {}",
        protocol,
        direction,
        format_hex_packet(data)
    );
}

//! Modbus framing constants
//!
//! Sizes follow the Modbus application protocol: a PDU is at most 253 bytes,
//! RTU adds one address byte and a two byte CRC, TCP prepends the MBAP header.

// ============================================================================
// Frame layout
// ============================================================================

/// Bytes before the length field of an MBAP header:
/// Transaction ID(2) + Protocol ID(2) + Length(2)
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU size (RS485 ADU 256 - address 1 - CRC 2)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Fixed RTU head: slave address + function code
pub const RTU_HEAD_LEN: usize = 2;

/// RTU checksum length
pub const CRC_LEN: usize = 2;

/// Maximum RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = 1 + MAX_PDU_SIZE + CRC_LEN;

/// Bit set in the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Quantity limits
// ============================================================================

/// FC03/FC04: 1 + 1 + N*2 <= 253
pub const MAX_READ_REGISTERS: usize = 125;

/// FC16: 1 + 2 + 2 + 1 + N*2 <= 253
pub const MAX_WRITE_REGISTERS: usize = 123;

/// FC01/FC02
pub const MAX_READ_COILS: usize = 2000;

/// FC15
pub const MAX_WRITE_COILS: usize = 1968;

// ============================================================================
// Function codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

// ============================================================================
// Exception codes
// ============================================================================

pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;

/// Human readable name of an exception code.
pub fn exception_message(code: u8) -> &'static str {
    match code {
        EXCEPTION_ILLEGAL_FUNCTION => "Illegal Function",
        EXCEPTION_ILLEGAL_DATA_ADDRESS => "Illegal Data Address",
        EXCEPTION_ILLEGAL_DATA_VALUE => "Illegal Data Value",
        EXCEPTION_SERVER_DEVICE_FAILURE => "Server Device Failure",
        EXCEPTION_ACKNOWLEDGE => "Acknowledge",
        EXCEPTION_SERVER_DEVICE_BUSY => "Server Device Busy",
        EXCEPTION_MEMORY_PARITY_ERROR => "Memory Parity Error",
        EXCEPTION_GATEWAY_PATH_UNAVAILABLE => "Gateway Path Unavailable",
        EXCEPTION_GATEWAY_TARGET_FAILED => "Gateway Target Failed to Respond",
        _ => "Unknown Exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_limits() {
        assert_eq!(MAX_MBAP_LENGTH, 254);
        assert_eq!(MAX_RTU_FRAME_SIZE, 256);
        assert!(1 + 1 + MAX_READ_REGISTERS * 2 <= MAX_PDU_SIZE);
        assert!(1 + 2 + 2 + 1 + MAX_WRITE_REGISTERS * 2 <= MAX_PDU_SIZE);
        assert!(1 + 2 + 2 + 1 + MAX_WRITE_COILS.div_ceil(8) <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_exception_messages() {
        assert_eq!(exception_message(0x02), "Illegal Data Address");
        assert_eq!(exception_message(0x7F), "Unknown Exception");
    }
}

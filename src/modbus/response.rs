//! Modbus responses

use bytes::Bytes;
use tracing::debug;

use super::constants::*;
use super::frame::{crc16, ModbusFunction, SlaveId};
use super::request::ModbusRequest;
use crate::error::{BytesIoError, BytesIoResult};

/// A response frame split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusResponse {
    pub slave_id: SlaveId,
    /// Function code as received, exception flag included.
    pub function_code: u8,
    /// MBAP transaction id for TCP frames.
    pub transaction_id: Option<u16>,
    payload: Bytes,
    frame: Bytes,
}

impl ModbusResponse {
    /// Parse `slave + pdu + crc`, rejecting checksum mismatches.
    pub fn from_rtu_frame(frame: Bytes) -> BytesIoResult<Self> {
        if frame.len() < RTU_HEAD_LEN + CRC_LEN {
            return Err(BytesIoError::frame(format!(
                "RTU frame too short: {} bytes",
                frame.len()
            )));
        }

        let body_len = frame.len() - CRC_LEN;
        let received = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
        let calculated = crc16(&frame[..body_len]);
        if received != calculated {
            return Err(BytesIoError::frame(format!(
                "CRC mismatch: expected 0x{:04X}, got 0x{:04X}",
                calculated, received
            )));
        }

        let response = Self {
            slave_id: frame[0],
            function_code: frame[1],
            transaction_id: None,
            payload: frame.slice(RTU_HEAD_LEN..body_len),
            frame,
        };
        response.log_parsed();
        Ok(response)
    }

    /// Parse `mbap + unit + pdu`.
    pub fn from_tcp_frame(frame: Bytes) -> BytesIoResult<Self> {
        if frame.len() < MBAP_HEADER_LEN + 2 {
            return Err(BytesIoError::frame(format!(
                "MBAP frame too short: {} bytes",
                frame.len()
            )));
        }

        let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
        if protocol_id != 0 {
            return Err(BytesIoError::protocol(format!(
                "Unexpected MBAP protocol id {}",
                protocol_id
            )));
        }

        let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
        if length > MAX_MBAP_LENGTH || frame.len() != MBAP_HEADER_LEN + length {
            return Err(BytesIoError::frame(format!(
                "MBAP length {} does not match frame of {} bytes",
                length,
                frame.len()
            )));
        }

        let response = Self {
            slave_id: frame[6],
            function_code: frame[7],
            transaction_id: Some(u16::from_be_bytes([frame[0], frame[1]])),
            payload: frame.slice(MBAP_HEADER_LEN + 2..),
            frame,
        };
        response.log_parsed();
        Ok(response)
    }

    fn log_parsed(&self) {
        if self.is_exception() {
            debug!(
                "Modbus response: slave={} FC={:02X} exception={:02X}",
                self.slave_id,
                self.function_code,
                self.exception_code().unwrap_or(0)
            );
        } else {
            debug!(
                "Modbus response: slave={} FC={:02X} data_len={}",
                self.slave_id,
                self.function_code,
                self.payload.len()
            );
        }
    }

    /// Function the response answers, exception flag stripped.
    pub fn function(&self) -> BytesIoResult<ModbusFunction> {
        ModbusFunction::from_u8(self.function_code & !EXCEPTION_FLAG)
    }

    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.payload.first().copied()
        } else {
            None
        }
    }

    /// `Err(Exception)` for an exception response.
    pub fn check_exception(&self) -> BytesIoResult<()> {
        match self.exception_code() {
            Some(code) => Err(BytesIoError::Exception {
                function: self.function_code & !EXCEPTION_FLAG,
                code,
                message: exception_message(code).to_string(),
            }),
            None if self.is_exception() => Err(BytesIoError::frame("Exception response without code")),
            None => Ok(()),
        }
    }

    /// PDU bytes after the function code.
    pub fn data(&self) -> &[u8] {
        &self.payload
    }

    /// The frame exactly as received.
    pub fn frame(&self) -> &Bytes {
        &self.frame
    }

    /// Registers of an FC03/FC04 response.
    pub fn parse_registers(&self) -> BytesIoResult<Vec<u16>> {
        let values = self.counted_payload()?;
        if values.len() % 2 != 0 {
            return Err(BytesIoError::invalid_data(format!(
                "Odd register byte count {}",
                values.len()
            )));
        }
        Ok(values
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Bits of an FC01/FC02 response, LSB first, padded to whole bytes.
    pub fn parse_bits(&self) -> BytesIoResult<Vec<bool>> {
        let values = self.counted_payload()?;
        Ok(values
            .iter()
            .flat_map(|&byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
            .collect())
    }

    /// Payload behind the byte count prefix of a read response.
    fn counted_payload(&self) -> BytesIoResult<&[u8]> {
        self.check_exception()?;
        let (&byte_count, values) = self
            .payload
            .split_first()
            .ok_or_else(|| BytesIoError::invalid_data("Missing byte count"))?;
        if values.len() != byte_count as usize {
            return Err(BytesIoError::invalid_data(format!(
                "Byte count {} but {} data bytes",
                byte_count,
                values.len()
            )));
        }
        Ok(values)
    }

    /// Whether this response answers `request`.
    pub fn matches(&self, request: &ModbusRequest) -> bool {
        if self.slave_id != request.slave_id
            || self.function_code & !EXCEPTION_FLAG != request.function.to_u8()
        {
            return false;
        }
        match self.transaction_id {
            Some(id) => id == request.transaction_id,
            None => true,
        }
    }
}

//! Function codes, checksums and frame length calculators

use crc::{Crc, CRC_16_MODBUS};

use super::constants::*;
use crate::error::{BytesIoError, BytesIoResult};
use crate::packet::MemoryPacket;

/// Modbus slave (unit) address.
pub type SlaveId = u8;

/// CRC-16/MODBUS, appended little-endian to RTU frames.
pub const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Supported function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusFunction {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
}

impl ModbusFunction {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::ReadCoils => FC_READ_COILS,
            Self::ReadDiscreteInputs => FC_READ_DISCRETE_INPUTS,
            Self::ReadHoldingRegisters => FC_READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters => FC_READ_INPUT_REGISTERS,
            Self::WriteSingleCoil => FC_WRITE_SINGLE_COIL,
            Self::WriteSingleRegister => FC_WRITE_SINGLE_REGISTER,
            Self::WriteMultipleCoils => FC_WRITE_MULTIPLE_COILS,
            Self::WriteMultipleRegisters => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn from_u8(code: u8) -> BytesIoResult<Self> {
        match code {
            FC_READ_COILS => Ok(Self::ReadCoils),
            FC_READ_DISCRETE_INPUTS => Ok(Self::ReadDiscreteInputs),
            FC_READ_HOLDING_REGISTERS => Ok(Self::ReadHoldingRegisters),
            FC_READ_INPUT_REGISTERS => Ok(Self::ReadInputRegisters),
            FC_WRITE_SINGLE_COIL => Ok(Self::WriteSingleCoil),
            FC_WRITE_SINGLE_REGISTER => Ok(Self::WriteSingleRegister),
            FC_WRITE_MULTIPLE_COILS => Ok(Self::WriteMultipleCoils),
            FC_WRITE_MULTIPLE_REGISTERS => Ok(Self::WriteMultipleRegisters),
            _ => Err(BytesIoError::InvalidFunction { code }),
        }
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::ReadCoils | Self::ReadDiscreteInputs | Self::ReadHoldingRegisters | Self::ReadInputRegisters
        )
    }

    pub fn is_write(self) -> bool {
        !self.is_read()
    }
}

/// Wire framing of a Modbus connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusFraming {
    /// Slave + PDU + CRC. Used on serial lines and RTU-over-TCP gateways.
    Rtu,
    /// MBAP header + unit id + PDU.
    Tcp,
}

/// Length of the RTU response frame at the head of `packet`.
///
/// Returns `0` until enough header bytes are present to decide.
pub fn rtu_packet_length(packet: &MemoryPacket) -> i64 {
    let (Some(_slave), Some(function)) = (packet.byte_at(0), packet.byte_at(1)) else {
        return 0;
    };

    if function & EXCEPTION_FLAG != 0 {
        return (RTU_HEAD_LEN + 1 + CRC_LEN) as i64;
    }

    match function {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
            match packet.byte_at(RTU_HEAD_LEN) {
                Some(byte_count) => (RTU_HEAD_LEN + 1 + byte_count as usize + CRC_LEN) as i64,
                None => 0,
            }
        }
        FC_WRITE_SINGLE_COIL
        | FC_WRITE_SINGLE_REGISTER
        | FC_WRITE_MULTIPLE_COILS
        | FC_WRITE_MULTIPLE_REGISTERS => (RTU_HEAD_LEN + 4 + CRC_LEN) as i64,
        // Unknown function: take what is there
        _ => packet.len() as i64,
    }
}

/// Length of the MBAP frame at the head of `packet`.
pub fn tcp_packet_length(packet: &MemoryPacket) -> i64 {
    let (Some(hi), Some(lo)) = (packet.byte_at(4), packet.byte_at(5)) else {
        return 0;
    };
    (MBAP_HEADER_LEN + u16::from_be_bytes([hi, lo]) as usize) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryBlock;
    use crate::unpacker::Unpacker;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn packet(data: &[u8]) -> MemoryPacket {
        MemoryPacket::from_block(MemoryBlock::copy_from_slice(data))
    }

    #[test]
    fn test_function_codes() {
        for code in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0F, 0x10] {
            assert_eq!(ModbusFunction::from_u8(code).unwrap().to_u8(), code);
        }
        assert_eq!(
            ModbusFunction::from_u8(0x2B),
            Err(BytesIoError::InvalidFunction { code: 0x2B })
        );
        assert!(ModbusFunction::ReadInputRegisters.is_read());
        assert!(ModbusFunction::WriteMultipleCoils.is_write());
    }

    #[test]
    fn test_crc_known_vector() {
        let crc = crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(crc.to_le_bytes(), [0xC5, 0xCD]);
    }

    #[test]
    fn test_rtu_length_read_response() {
        let head = [0x01, 0x03, 0x04, 0xD0, 0xD1, 0xD2, 0xD3];
        assert_eq!(rtu_packet_length(&packet(&head)), 9);
        assert_eq!(rtu_packet_length(&packet(&[0x01])), 0);
        assert_eq!(rtu_packet_length(&packet(&[0x01, 0x03])), 0);
    }

    #[test]
    fn test_rtu_length_write_and_exception() {
        assert_eq!(rtu_packet_length(&packet(&[0x01, 0x06])), 8);
        assert_eq!(rtu_packet_length(&packet(&[0x01, 0x10, 0x00])), 8);
        assert_eq!(rtu_packet_length(&packet(&[0x01, 0x83])), 5);
        assert_eq!(rtu_packet_length(&packet(&[0x01, 0x2B, 0x0E, 0x01])), 4);
    }

    #[test]
    fn test_tcp_length() {
        let header = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05];
        assert_eq!(tcp_packet_length(&packet(&header)), 11);
        assert_eq!(tcp_packet_length(&packet(&header[..5])), 0);
    }

    #[test]
    fn test_rtu_unpacker_waits_for_crc() {
        let unpacker = Unpacker::new(rtu_packet_length);
        let frames = Arc::new(Mutex::new(Vec::<Bytes>::new()));
        let sink = frames.clone();
        unpacker.data_parsed().subscribe(move |f: &Bytes| sink.lock().push(f.clone()));

        let mut frame = vec![0x01, 0x03, 0x04, 0xD0, 0xD1, 0xD2, 0xD3];
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        assert_eq!(unpacker.input_bytes(&frame[..7]).frames, 0);
        assert!(frames.lock().is_empty());
        assert_eq!(unpacker.buffered_len(), 7);

        assert_eq!(unpacker.input_bytes(&frame[7..]).frames, 1);
        assert_eq!(frames.lock()[0], Bytes::from(frame));
    }
}

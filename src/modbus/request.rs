//! Modbus requests

use bytes::{BufMut, Bytes, BytesMut};

use super::constants::*;
use super::frame::{crc16, ModbusFraming, ModbusFunction, SlaveId};
use crate::error::{BytesIoError, BytesIoResult};
use crate::reply::Request;

/// One Modbus request.
///
/// `data` holds the function specific payload after address and quantity:
/// the coil value for FC05, the register value for FC06 and the packed
/// coils or registers for FC15/FC16. The byte count of multi-writes is added
/// when the frame is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: u16,
    pub quantity: u16,
    pub data: Vec<u8>,
    pub framing: ModbusFraming,
    /// MBAP transaction id, TCP framing only.
    pub transaction_id: u16,
}

impl ModbusRequest {
    pub fn new_read(slave_id: SlaveId, function: ModbusFunction, address: u16, quantity: u16) -> Self {
        Self {
            slave_id,
            function,
            address,
            quantity,
            data: Vec::new(),
            framing: ModbusFraming::Rtu,
            transaction_id: 0,
        }
    }

    pub fn new_write_single_coil(slave_id: SlaveId, address: u16, value: bool) -> Self {
        let word: u16 = if value { 0xFF00 } else { 0x0000 };
        Self {
            data: word.to_be_bytes().to_vec(),
            ..Self::new_read(slave_id, ModbusFunction::WriteSingleCoil, address, 1)
        }
    }

    pub fn new_write_single_register(slave_id: SlaveId, address: u16, value: u16) -> Self {
        Self {
            data: value.to_be_bytes().to_vec(),
            ..Self::new_read(slave_id, ModbusFunction::WriteSingleRegister, address, 1)
        }
    }

    /// Coils are packed LSB first.
    pub fn new_write_multiple_coils(slave_id: SlaveId, address: u16, values: &[bool]) -> Self {
        let mut data = Vec::with_capacity(values.len().div_ceil(8));
        for chunk in values.chunks(8) {
            let mut byte = 0u8;
            for (i, &coil) in chunk.iter().enumerate() {
                if coil {
                    byte |= 1 << i;
                }
            }
            data.push(byte);
        }

        Self {
            data,
            ..Self::new_read(
                slave_id,
                ModbusFunction::WriteMultipleCoils,
                address,
                values.len() as u16,
            )
        }
    }

    pub fn new_write_multiple_registers(slave_id: SlaveId, address: u16, values: &[u16]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 2);
        for &value in values {
            data.extend_from_slice(&value.to_be_bytes());
        }

        Self {
            data,
            ..Self::new_read(
                slave_id,
                ModbusFunction::WriteMultipleRegisters,
                address,
                values.len() as u16,
            )
        }
    }

    pub fn with_framing(mut self, framing: ModbusFraming) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: u16) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    fn validate(&self) -> BytesIoResult<()> {
        let quantity = self.quantity as usize;
        let limit = match self.function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => MAX_READ_COILS,
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => MAX_READ_REGISTERS,
            ModbusFunction::WriteMultipleCoils => MAX_WRITE_COILS,
            ModbusFunction::WriteMultipleRegisters => MAX_WRITE_REGISTERS,
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => 1,
        };
        if quantity == 0 || quantity > limit {
            return Err(BytesIoError::invalid_data(format!(
                "Invalid quantity {} for {:?} (1..={})",
                quantity, self.function, limit
            )));
        }

        let expected = match self.function {
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => Some(2),
            ModbusFunction::WriteMultipleCoils => Some(quantity.div_ceil(8)),
            ModbusFunction::WriteMultipleRegisters => Some(quantity * 2),
            _ => None,
        };
        if let Some(expected) = expected {
            if self.data.len() != expected {
                return Err(BytesIoError::invalid_data(format!(
                    "{:?} expects {} data bytes, got {}",
                    self.function,
                    expected,
                    self.data.len()
                )));
            }
        }
        Ok(())
    }

    /// Function code plus payload.
    pub fn pdu(&self) -> BytesIoResult<Bytes> {
        self.validate()?;

        let mut pdu = BytesMut::with_capacity(6 + self.data.len());
        pdu.put_u8(self.function.to_u8());
        pdu.put_u16(self.address);
        match self.function {
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
                pdu.put_slice(&self.data);
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                pdu.put_u16(self.quantity);
                pdu.put_u8(self.data.len() as u8);
                pdu.put_slice(&self.data);
            }
            _ => pdu.put_u16(self.quantity),
        }

        if pdu.len() > MAX_PDU_SIZE {
            return Err(BytesIoError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                pdu.len(),
                MAX_PDU_SIZE
            )));
        }
        Ok(pdu.freeze())
    }

    /// The complete frame for the configured framing.
    pub fn to_frame(&self) -> BytesIoResult<Bytes> {
        let pdu = self.pdu()?;
        let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len() + CRC_LEN);

        match self.framing {
            ModbusFraming::Rtu => {
                frame.put_u8(self.slave_id);
                frame.put_slice(&pdu);
                let crc = crc16(&frame);
                frame.put_u16_le(crc);
            }
            ModbusFraming::Tcp => {
                frame.put_u16(self.transaction_id);
                // Protocol id is always 0
                frame.put_u16(0);
                frame.put_u16((1 + pdu.len()) as u16);
                frame.put_u8(self.slave_id);
                frame.put_slice(&pdu);
            }
        }
        Ok(frame.freeze())
    }
}

impl Request for ModbusRequest {
    fn to_bytes(&self) -> BytesIoResult<Bytes> {
        self.to_frame()
    }
}

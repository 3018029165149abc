//! # Modbus adapter
//!
//! A Modbus master built on the framing core: length calculators tell the
//! [`Unpacker`](crate::Unpacker) where RTU and MBAP frames end, requests
//! encode themselves through [`Request`](crate::Request), and
//! [`ModbusClient`] correlates each request with its response.
//!
//! ## Frame formats
//!
//! - **RTU**: Slave ID + PDU + CRC-16 (little-endian)
//! - **TCP**: MBAP header (transaction, protocol, length) + Unit ID + PDU
//!
//! ## Supported function codes
//!
//! | Code | Operation | Method |
//! |------|-----------|--------|
//! | 0x01 | Read Coils | `read_01` / `read_coils` |
//! | 0x02 | Read Discrete Inputs | `read_02` / `read_discrete_inputs` |
//! | 0x03 | Read Holding Registers | `read_03` / `read_holding_registers` |
//! | 0x04 | Read Input Registers | `read_04` / `read_input_registers` |
//! | 0x05 | Write Single Coil | `write_05` / `write_single_coil` |
//! | 0x06 | Write Single Register | `write_06` / `write_single_register` |
//! | 0x0F | Write Multiple Coils | `write_0f` / `write_multiple_coils` |
//! | 0x10 | Write Multiple Registers | `write_10` / `write_multiple_registers` |

pub mod client;
pub mod constants;
pub mod frame;
pub mod request;
pub mod response;

pub use client::ModbusClient;
pub use frame::{crc16, rtu_packet_length, tcp_packet_length, ModbusFraming, ModbusFunction, SlaveId};
pub use request::ModbusRequest;
pub use response::ModbusResponse;

//! Modbus master over a [`BytesClient`]
//!
//! The wrapper owns its byte client, binds a Modbus unpacker to it once at
//! construction and correlates each request with the response carrying the
//! same slave id and function code (and transaction id over TCP).

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::frame::{rtu_packet_length, tcp_packet_length, ModbusFraming, ModbusFunction, SlaveId};
use super::request::ModbusRequest;
use super::response::ModbusResponse;
use crate::client::{BytesClient, ClientStats};
use crate::entity::{ConnectResult, DisconnectResult, SendOptions};
use crate::error::{BytesIoError, BytesIoResult};
use crate::event::{Event, Subscription};
use crate::transport::TcpTransport;
use crate::unpacker::{TypedUnpacker, UnpackErrorKind, Unpacker};

/// Modbus master.
///
/// ```rust,no_run
/// use bytesio::ModbusClient;
///
/// # async fn run() -> bytesio::BytesIoResult<()> {
/// let modbus = ModbusClient::tcp("192.168.1.100:502");
/// modbus.connect().await;
///
/// let registers = modbus.read_03(1, 0, 10).await?;
/// modbus.write_06(1, 100, 0x1234).await?;
/// println!("{:?}", registers);
/// # Ok(())
/// # }
/// ```
pub struct ModbusClient {
    client: BytesClient,
    unpacker: TypedUnpacker<ModbusResponse>,
    packet_received: Event<ModbusResponse>,
    _forward: Subscription<ModbusResponse>,
    framing: ModbusFraming,
    timeout: Duration,
    send_options: SendOptions,
    transaction_id: AtomicU16,
}

impl ModbusClient {
    pub fn new(client: BytesClient, framing: ModbusFraming) -> Self {
        let raw = match framing {
            ModbusFraming::Rtu => Unpacker::new(rtu_packet_length),
            ModbusFraming::Tcp => Unpacker::new(tcp_packet_length),
        };
        let raw = Arc::new(raw.with_error_handler(|kind: &UnpackErrorKind| {
            warn!("Dropped Modbus frame: {:?}", kind);
        }));
        client.bind_unpacker(raw.clone());

        let unpacker = TypedUnpacker::new(raw, move |frame| match framing {
            ModbusFraming::Rtu => ModbusResponse::from_rtu_frame(frame),
            ModbusFraming::Tcp => ModbusResponse::from_tcp_frame(frame),
        });

        let packet_received = Event::new("modbus_packet_received");
        let outer = packet_received.clone();
        let forward = unpacker
            .data_parsed()
            .subscribe_scoped(move |response: &ModbusResponse| {
                // Surface handler panics to the typed dispatcher, which
                // reports them as client exceptions
                if let Some(failure) = outer.emit(response).into_iter().next() {
                    std::panic::resume_unwind(Box::new(failure.to_string()));
                }
            });

        let timeout = client.options().reply_timeout;
        Self {
            client,
            unpacker,
            packet_received,
            _forward: forward,
            framing,
            timeout,
            send_options: SendOptions::default(),
            transaction_id: AtomicU16::new(0),
        }
    }

    /// Modbus TCP to `host:port`.
    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new(BytesClient::new(TcpTransport::new(address)), ModbusFraming::Tcp)
    }

    /// RTU frames through a serial-to-Ethernet gateway.
    pub fn rtu_over_tcp(address: impl Into<String>) -> Self {
        Self::new(BytesClient::new(TcpTransport::new(address)), ModbusFraming::Rtu)
    }

    /// Modbus RTU on a serial port, pausing one inter-frame gap after every
    /// request.
    #[cfg(feature = "rtu")]
    pub fn rtu(port: impl Into<String>, baud_rate: u32) -> Self {
        let transport = crate::transport::SerialTransport::new(port, baud_rate);
        let pause = transport.inter_frame_delay();
        Self::new(BytesClient::new(transport), ModbusFraming::Rtu)
            .with_send_options(SendOptions::with_pause_time(pause))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_send_options(mut self, options: SendOptions) -> Self {
        self.send_options = options;
        self
    }

    pub fn client(&self) -> &BytesClient {
        &self.client
    }

    pub fn framing(&self) -> ModbusFraming {
        self.framing
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Every response received, matched or not.
    pub fn packet_received(&self) -> &Event<ModbusResponse> {
        &self.packet_received
    }

    pub async fn connect(&self) -> ConnectResult {
        self.client.connect().await
    }

    pub async fn disconnect(&self) -> DisconnectResult {
        self.client.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn get_stats(&self) -> ClientStats {
        self.client.get_stats()
    }

    fn next_transaction_id(&self) -> u16 {
        loop {
            let id = self.transaction_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send a request and wait for its response. Exception responses are
    /// returned as [`BytesIoError::Exception`].
    pub async fn execute_request(&self, request: ModbusRequest) -> BytesIoResult<ModbusResponse> {
        let mut request = request.with_framing(self.framing);
        if self.framing == ModbusFraming::Tcp {
            request.transaction_id = self.next_transaction_id();
        }
        debug!(
            "Modbus request: slave={} FC={:02X} addr={} qty={}",
            request.slave_id,
            request.function.to_u8(),
            request.address,
            request.quantity
        );

        let response = self
            .unpacker
            .send_and_await_reply(
                &self.client,
                &request,
                self.timeout,
                &self.send_options,
                |request: &ModbusRequest, response: &ModbusResponse| response.matches(request),
            )
            .await
            .into_result()?;

        response.check_exception()?;
        Ok(response)
    }

    // ------------------------------------------------------------------------
    // Function codes
    // ------------------------------------------------------------------------

    /// FC01
    pub async fn read_01(&self, slave_id: SlaveId, address: u16, quantity: u16) -> BytesIoResult<Vec<bool>> {
        self.read_bits(ModbusFunction::ReadCoils, slave_id, address, quantity)
            .await
    }

    /// FC02
    pub async fn read_02(&self, slave_id: SlaveId, address: u16, quantity: u16) -> BytesIoResult<Vec<bool>> {
        self.read_bits(ModbusFunction::ReadDiscreteInputs, slave_id, address, quantity)
            .await
    }

    /// FC03
    pub async fn read_03(&self, slave_id: SlaveId, address: u16, quantity: u16) -> BytesIoResult<Vec<u16>> {
        self.read_registers(ModbusFunction::ReadHoldingRegisters, slave_id, address, quantity)
            .await
    }

    /// FC04
    pub async fn read_04(&self, slave_id: SlaveId, address: u16, quantity: u16) -> BytesIoResult<Vec<u16>> {
        self.read_registers(ModbusFunction::ReadInputRegisters, slave_id, address, quantity)
            .await
    }

    /// FC05
    pub async fn write_05(&self, slave_id: SlaveId, address: u16, value: bool) -> BytesIoResult<()> {
        self.execute_request(ModbusRequest::new_write_single_coil(slave_id, address, value))
            .await?;
        Ok(())
    }

    /// FC06
    pub async fn write_06(&self, slave_id: SlaveId, address: u16, value: u16) -> BytesIoResult<()> {
        self.execute_request(ModbusRequest::new_write_single_register(slave_id, address, value))
            .await?;
        Ok(())
    }

    /// FC15
    pub async fn write_0f(&self, slave_id: SlaveId, address: u16, values: &[bool]) -> BytesIoResult<()> {
        if values.is_empty() || values.len() > super::constants::MAX_WRITE_COILS {
            return Err(BytesIoError::invalid_data("Invalid quantity"));
        }
        self.execute_request(ModbusRequest::new_write_multiple_coils(slave_id, address, values))
            .await?;
        Ok(())
    }

    /// FC16
    pub async fn write_10(&self, slave_id: SlaveId, address: u16, values: &[u16]) -> BytesIoResult<()> {
        if values.is_empty() || values.len() > super::constants::MAX_WRITE_REGISTERS {
            return Err(BytesIoError::invalid_data("Invalid quantity"));
        }
        self.execute_request(ModbusRequest::new_write_multiple_registers(slave_id, address, values))
            .await?;
        Ok(())
    }

    async fn read_bits(
        &self,
        function: ModbusFunction,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> BytesIoResult<Vec<bool>> {
        if quantity == 0 || quantity as usize > super::constants::MAX_READ_COILS {
            return Err(BytesIoError::invalid_data("Invalid quantity"));
        }
        let response = self
            .execute_request(ModbusRequest::new_read(slave_id, function, address, quantity))
            .await?;
        let bits = response.parse_bits()?;
        Ok(bits.into_iter().take(quantity as usize).collect())
    }

    async fn read_registers(
        &self,
        function: ModbusFunction,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> BytesIoResult<Vec<u16>> {
        if quantity == 0 || quantity as usize > super::constants::MAX_READ_REGISTERS {
            return Err(BytesIoError::invalid_data("Invalid quantity"));
        }
        let response = self
            .execute_request(ModbusRequest::new_read(slave_id, function, address, quantity))
            .await?;
        let registers = response.parse_registers()?;
        if registers.len() != quantity as usize {
            return Err(BytesIoError::invalid_data(format!(
                "Requested {} registers, received {}",
                quantity,
                registers.len()
            )));
        }
        Ok(registers)
    }

    // ------------------------------------------------------------------------
    // Semantic aliases
    // ------------------------------------------------------------------------

    pub async fn read_coils(&self, slave_id: SlaveId, address: u16, quantity: u16) -> BytesIoResult<Vec<bool>> {
        self.read_01(slave_id, address, quantity).await
    }

    pub async fn read_discrete_inputs(
        &self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> BytesIoResult<Vec<bool>> {
        self.read_02(slave_id, address, quantity).await
    }

    pub async fn read_holding_registers(
        &self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> BytesIoResult<Vec<u16>> {
        self.read_03(slave_id, address, quantity).await
    }

    pub async fn read_input_registers(
        &self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> BytesIoResult<Vec<u16>> {
        self.read_04(slave_id, address, quantity).await
    }

    pub async fn write_single_coil(&self, slave_id: SlaveId, address: u16, value: bool) -> BytesIoResult<()> {
        self.write_05(slave_id, address, value).await
    }

    pub async fn write_single_register(&self, slave_id: SlaveId, address: u16, value: u16) -> BytesIoResult<()> {
        self.write_06(slave_id, address, value).await
    }

    pub async fn write_multiple_coils(&self, slave_id: SlaveId, address: u16, values: &[bool]) -> BytesIoResult<()> {
        self.write_0f(slave_id, address, values).await
    }

    pub async fn write_multiple_registers(
        &self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> BytesIoResult<()> {
        self.write_10(slave_id, address, values).await
    }
}

impl std::fmt::Debug for ModbusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusClient")
            .field("client", &self.client)
            .field("framing", &self.framing)
            .field("timeout", &self.timeout)
            .finish()
    }
}

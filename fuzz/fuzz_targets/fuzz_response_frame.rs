#![no_main]

use bytes::Bytes;
use bytesio::ModbusResponse;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let frame = Bytes::copy_from_slice(data);

    if let Ok(response) = ModbusResponse::from_rtu_frame(frame.clone()) {
        let _ = response.function();
        let _ = response.check_exception();
        let _ = response.parse_registers();
        let _ = response.parse_bits();
    }

    if let Ok(response) = ModbusResponse::from_tcp_frame(frame) {
        assert!(response.transaction_id.is_some());
        let _ = response.parse_registers();
        let _ = response.parse_bits();
    }
});

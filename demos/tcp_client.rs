//! Modbus over bytesio
//!
//! Polls a Modbus TCP slave a few times, then mirrors the first register it
//! read into a write-back area.
//!
//! ```bash
//! cargo run --example tcp_client [address] [slave]
//! ```
//!
//! Needs a reachable Modbus TCP slave (127.0.0.1:502 unless given).

use std::time::Duration;

use bytesio::{BytesIoResult, ModbusClient};

const POLLS: usize = 3;

#[tokio::main]
async fn main() -> BytesIoResult<()> {
    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1:502".to_string());
    let slave: u8 = args.next().and_then(|s| s.parse().ok()).unwrap_or(1);

    let client = ModbusClient::tcp(address.clone()).with_timeout(Duration::from_secs(2));
    client.packet_received().subscribe(|response| {
        println!(
            "  <- tx {:?} slave {} fc {:02X} ({} bytes)",
            response.transaction_id,
            response.slave_id,
            response.function_code,
            response.frame().len()
        )
    });

    let result = client.connect().await;
    if !result.is_success() {
        println!("{}: {:?} {:?}", address, result.kind, result.error);
        return Ok(());
    }

    let mut first = 0;
    for round in 1..=POLLS {
        let holding = client.read_holding_registers(slave, 0, 4).await?;
        let inputs = client.read_input_registers(slave, 0, 2).await?;
        let flags = client.read_coils(slave, 0, 4).await?;
        println!("poll {}: holding={:?} input={:?} coils={:?}", round, holding, inputs, flags);
        first = holding[0];
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    client.write_single_register(slave, 40, first).await?;
    client.write_multiple_registers(slave, 41, &[first, first.wrapping_add(1)]).await?;
    client.write_multiple_coils(slave, 8, &[true, false, true]).await?;
    client.write_single_coil(slave, 12, first % 2 == 0).await?;
    println!("mirrored {} into registers 40-42", first);

    let stats = client.get_stats();
    println!(
        "{} requests, {} responses, {} bytes in",
        stats.frames_sent, stats.frames_parsed, stats.bytes_received
    );

    client.disconnect().await;
    Ok(())
}

//! BytesIO Demo
//!
//! Runs a local length-prefixed echo server and walks through the client
//! features against it:
//! - Framing of fragmented and coalesced frames (no connection required)
//! - Connect, send and request/reply correlation
//! - Events and statistics
//!
//! Usage: cargo run --bin demo [bind_address]
//! Example: cargo run --bin demo 127.0.0.1:7000

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytesio::{BytesClient, ClientOptions, LengthPrefix, ReplyStatus, TcpTransport, Unpacker};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", bytesio::info());
    println!("==========================================\n");

    // =========================================================================
    // Part 1: Framing (no connection required)
    // =========================================================================
    println!("Part 1: Framing");
    println!("---------------");

    let unpacker = Unpacker::new(LengthPrefix::u16_be());
    unpacker
        .data_parsed()
        .subscribe(|frame: &Bytes| println!("  parsed frame: {:02X?}", &frame[..]));

    println!("  feeding [00 05 'h'] then ['e' 'l' 'l' 'o']");
    unpacker.input_bytes(&[0x00, 0x05, b'h']);
    unpacker.input_bytes(b"ello");

    println!("  feeding two frames in one chunk");
    let report = unpacker.input_bytes(b"\x00\x02hi\x00\x03bye");
    println!("  -> {} frames\n", report.frames);

    // =========================================================================
    // Part 2: Client against a local echo server
    // =========================================================================
    println!("Part 2: Client");
    println!("--------------");

    let bind = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:0".to_string());
    let listener = TcpListener::bind(&bind).await?;
    let address = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut socket, peer)) = listener.accept().await {
            println!("  server: accepted {}", peer);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let client = BytesClient::with_options(
        TcpTransport::from_socket_addr(address),
        ClientOptions::new()
            .with_connect_timeout(Duration::from_secs(3))
            .with_packet_logging(true),
    );
    client.bind_unpacker(Arc::new(Unpacker::new(LengthPrefix::u16_be())));
    client.on_connected(|e| println!("  connected to {}", e.endpoint));
    client.on_disconnected(|e| println!("  disconnected ({:?})", e.reason));
    client.on_data_received(|e| println!("  received frame of {} bytes", e.data.len()));

    let result = client.connect().await;
    if !result.is_success() {
        println!("  connect failed: {:?}", result);
        return Ok(());
    }

    client.send(b"\x00\x03abc").await?;

    let reply = client
        .send_and_await_matched_reply(b"\x00\x04ping", Duration::from_secs(1), |sent, received| {
            sent == received
        })
        .await;
    match reply.status() {
        ReplyStatus::Completed => println!("  reply: {:?}", reply.data()),
        ReplyStatus::Timeout => println!("  reply timed out"),
        ReplyStatus::Error => println!("  reply failed: {:?}", reply.error()),
    }

    let silent = client
        .send_and_await_matched_reply(b"\x00\x01x", Duration::from_millis(200), |_, _| false)
        .await;
    println!("  unmatched request -> {:?}", silent.status());

    tokio::time::sleep(Duration::from_millis(50)).await;
    client.disconnect().await;

    // =========================================================================
    // Part 3: Statistics
    // =========================================================================
    println!("\nPart 3: Statistics");
    println!("------------------");
    let stats = client.get_stats();
    println!("  bytes sent:      {}", stats.bytes_sent);
    println!("  bytes received:  {}", stats.bytes_received);
    println!("  frames parsed:   {}", stats.frames_parsed);
    println!("  idle blocks:     {}", client.pool().idle_count());

    Ok(())
}

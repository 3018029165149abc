//! Connection lifecycle, receive loop and event fan-out

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use bytesio::{
    BytesClient, BytesIoError, ClientOptions, ConnectArgs, ConnectErrorKind, ConnectionState,
    DisconnectErrorKind, DisconnectionReason, LengthPrefix, SendOptions, Unpacker,
};
use common::{wait_until, within, BadParamTransport, DuplexTransport, PendingTransport};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + 'static) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    (log, move |item| sink.lock().push(item))
}

#[tokio::test]
async fn test_connect_receive_disconnect() {
    let (transport, peers) = DuplexTransport::new();
    let client = BytesClient::new(transport);

    let (events, push) = recorder::<String>();
    let push = Arc::new(push);
    let p = push.clone();
    client.on_connected(move |e| p(format!("connected {}", e.endpoint)));
    let p = push.clone();
    client.on_data_received(move |e| p(format!("data {}", String::from_utf8_lossy(&e.data))));
    let p = push.clone();
    client.on_disconnected(move |e| p(format!("disconnected {:?}", e.reason)));

    assert!(client.connect().await.is_success());
    assert_eq!(client.state(), ConnectionState::Connected);
    let mut peer = peers.next().await;

    peer.write_all(b"hello").await.unwrap();
    assert!(wait_until(|| events.lock().len() >= 2).await);
    assert!(client.last_message_received_time().is_some());

    client.send(b"out").await.unwrap();
    let mut buf = [0u8; 3];
    within(peer.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"out");

    assert!(client.disconnect().await.is_success());
    assert_eq!(
        *events.lock(),
        vec![
            "connected duplex://test".to_string(),
            "data hello".to_string(),
            "disconnected Active".to_string(),
        ]
    );

    let stats = client.get_stats();
    assert_eq!(stats.bytes_received, 5);
    assert_eq!(stats.bytes_sent, 3);
    assert_eq!(stats.frames_sent, 1);
}

#[tokio::test]
async fn test_peer_close_is_passive_disconnect() {
    let (transport, peers) = DuplexTransport::new();
    let client = BytesClient::new(transport);
    let (reasons, push) = recorder();
    client.on_disconnected(move |e| push((e.reason, e.error.clone())));

    client.connect().await;
    drop(peers.next().await);

    assert!(wait_until(|| !reasons.lock().is_empty()).await);
    assert_eq!(*reasons.lock(), vec![(DisconnectionReason::Passive, None)]);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.disconnect().await.kind, DisconnectErrorKind::NoConnection);
}

#[tokio::test]
async fn test_parameter_error_leaves_client_disconnected() {
    let client = BytesClient::new(BadParamTransport);
    let (failures, push) = recorder();
    client.on_connection_failed(move |e| push(e.kind));

    let result = client.connect().await;
    assert_eq!(result.kind, ConnectErrorKind::ConnectionParameterError);
    assert!(matches!(result.error, Some(BytesIoError::Configuration { .. })));
    assert_eq!(*failures.lock(), vec![ConnectErrorKind::ConnectionParameterError]);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_timeout() {
    let client = BytesClient::with_options(
        PendingTransport,
        ClientOptions::new().with_connect_timeout(Duration::from_secs(10)),
    );

    // Per-call timeout wins over the configured one
    let started = Instant::now();
    let result = client
        .connect_with(ConnectArgs::with_timeout(Duration::from_millis(50)))
        .await;
    assert_eq!(result.kind, ConnectErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_abandoned_connect_leaves_client_disconnected() {
    let client = BytesClient::new(PendingTransport);

    let attempt = tokio::time::timeout(Duration::from_millis(20), client.connect()).await;
    assert!(attempt.is_err());

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.set_receive_buffer_size(1024).is_ok());
    assert_eq!(client.disconnect().await.kind, DisconnectErrorKind::NoConnection);
}

#[tokio::test]
async fn test_stale_receive_loop_does_not_close_new_connection() {
    let (transport, peers) = DuplexTransport::new();
    let client = BytesClient::new(transport);

    client.connect().await;
    let first = peers.next().await;
    client.disconnect().await;

    assert!(client.connect().await.is_success());
    let _second = peers.next().await;
    drop(first);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_handler_panic_becomes_exception_event() {
    let (transport, peers) = DuplexTransport::new();
    let client = BytesClient::new(transport);

    let (seen, push) = recorder();
    client.on_data_received(|_| panic!("handler bug"));
    client.on_data_received(move |e| push(e.data.clone()));
    let (exceptions, push) = recorder();
    client.on_exception_occurred(move |e| push(e.error.clone()));

    client.connect().await;
    let mut peer = peers.next().await;
    peer.write_all(b"x").await.unwrap();

    assert!(wait_until(|| !exceptions.lock().is_empty()).await);
    // The second handler still ran and the connection survived
    assert_eq!(*seen.lock(), vec![Bytes::from_static(b"x")]);
    assert!(matches!(exceptions.lock()[0], BytesIoError::Callback { ref message } if message.contains("handler bug")));
    assert!(client.is_connected());
    assert_eq!(client.get_stats().callback_faults, 1);
}

#[tokio::test]
async fn test_bound_unpacker_raises_per_frame() {
    let (transport, peers) = DuplexTransport::new();
    let client = BytesClient::new(transport);
    let unpacker = Arc::new(Unpacker::new(LengthPrefix::u8()));
    client.bind_unpacker(unpacker.clone());

    let (frames, push) = recorder();
    client.on_data_received(move |e| push(e.data.clone()));

    client.connect().await;
    let mut peer = peers.next().await;
    peer.write_all(b"\x02ab\x03cd").await.unwrap();

    assert!(wait_until(|| frames.lock().len() == 1).await);
    assert!(wait_until(|| unpacker.buffered_len() == 3).await);

    // Disconnect drops the partial frame
    client.disconnect().await;
    assert_eq!(unpacker.buffered_len(), 0);
    assert_eq!(*frames.lock(), vec![Bytes::from_static(b"\x02ab")]);
    assert_eq!(client.get_stats().frames_parsed, 1);

    assert!(client.unbind_unpacker().is_some());
    assert!(client.unpacker().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_do_not_interleave() {
    let (transport, peers) = DuplexTransport::new();
    let client = BytesClient::new(transport);
    client.connect().await;
    let mut peer = peers.next().await;

    let mut tasks = Vec::new();
    for id in 0..8u8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.send(&[id; 512]).await.unwrap();
        }));
    }

    let mut received = vec![0u8; 8 * 512];
    within(peer.read_exact(&mut received)).await.unwrap();
    for task in tasks {
        task.await.unwrap();
    }

    for frame in received.chunks(512) {
        assert!(frame.iter().all(|&b| b == frame[0]));
    }
}

#[tokio::test]
async fn test_send_pause_holds_next_send() {
    let (transport, peers) = DuplexTransport::new();
    let client = BytesClient::new(transport);
    client.connect().await;
    let _peer = peers.next().await;

    let pause = SendOptions::with_pause_time(Duration::from_millis(40));
    let started = Instant::now();
    client.send_with_options(b"a", &pause).await.unwrap();
    client.send_with_options(b"b", &pause).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[tokio::test]
async fn test_write_failure_disconnects_with_error() {
    let (transport, peers) = DuplexTransport::new();
    let client = BytesClient::new(transport);
    let (reasons, push) = recorder();
    client.on_disconnected(move |e| push(e.reason));

    client.connect().await;
    drop(peers.next().await);

    // Either the read side notices first or the failed write does
    let _ = client.send(b"lost").await;
    assert!(wait_until(|| !client.is_connected()).await);
    assert!(wait_until(|| !reasons.lock().is_empty()).await);
    let reason = reasons.lock()[0];
    assert!(matches!(reason, DisconnectionReason::Passive | DisconnectionReason::Error));
}

//! Framing invariants under arbitrary chunking

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytesio::{
    LengthPrefix, MemoryBlockPool, MemoryPacket, PacketLengthCalculator, UnpackErrorKind, Unpacker,
};
use parking_lot::Mutex;
use proptest::prelude::*;

fn collecting(unpacker: &Unpacker) -> Arc<Mutex<Vec<Bytes>>> {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    unpacker
        .data_parsed()
        .subscribe(move |frame: &Bytes| sink.lock().push(frame.clone()));
    frames
}

fn encode(payloads: &[Vec<u8>]) -> (Vec<u8>, Vec<Vec<u8>>) {
    let mut stream = Vec::new();
    let mut frames = Vec::new();
    for payload in payloads {
        let mut frame = vec![payload.len() as u8];
        frame.extend_from_slice(payload);
        stream.extend_from_slice(&frame);
        frames.push(frame);
    }
    (stream, frames)
}

/// Feed `stream` in pieces whose sizes cycle through `sizes`.
fn feed(unpacker: &Unpacker, stream: &[u8], sizes: &[usize]) -> usize {
    let mut pos = 0;
    let mut chunks = 0;
    for size in sizes.iter().cycle() {
        if pos >= stream.len() {
            break;
        }
        let end = (pos + size).min(stream.len());
        unpacker.input_bytes(&stream[pos..end]);
        pos = end;
        chunks += 1;
    }
    chunks
}

/// `AA 55 len payload`
fn marked_length(packet: &MemoryPacket) -> i64 {
    match packet.byte_at(2) {
        Some(len) => 3 + i64::from(len),
        None => 0,
    }
}

proptest! {
    #[test]
    fn prop_fragmented_frame_parses_once(
        payload in prop::collection::vec(any::<u8>(), 0..200),
        sizes in prop::collection::vec(1usize..8, 1..16),
    ) {
        let unpacker = Unpacker::new(LengthPrefix::u16_be());
        let frames = collecting(&unpacker);

        let mut stream = (payload.len() as u16).to_be_bytes().to_vec();
        stream.extend_from_slice(&payload);

        let mut pos = 0;
        for size in sizes.iter().cycle() {
            if pos >= stream.len() {
                break;
            }
            prop_assert!(frames.lock().is_empty());
            let end = (pos + size).min(stream.len());
            unpacker.input_bytes(&stream[pos..end]);
            pos = end;
        }

        prop_assert_eq!(frames.lock().len(), 1);
        prop_assert_eq!(&frames.lock()[0][..], &stream[..]);
        prop_assert_eq!(unpacker.buffered_len(), 0);
    }

    #[test]
    fn prop_frames_survive_any_chunking(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 1..12),
        sizes in prop::collection::vec(1usize..64, 1..16),
    ) {
        let unpacker = Unpacker::new(LengthPrefix::u8());
        let frames = collecting(&unpacker);
        let (stream, expected) = encode(&payloads);

        feed(&unpacker, &stream, &sizes);

        let parsed: Vec<Vec<u8>> = frames.lock().iter().map(|f| f.to_vec()).collect();
        prop_assert_eq!(parsed, expected);
        prop_assert_eq!(unpacker.buffered_len(), 0);
    }

    #[test]
    fn prop_start_mark_skips_leading_noise(
        noise in prop::collection::vec(any::<u8>().prop_filter("no mark byte", |b| *b != 0xAA), 0..32),
        payload in prop::collection::vec(any::<u8>(), 0..16),
    ) {
        let unpacker = Unpacker::new(marked_length).with_start_mark(&b"\xAA\x55"[..]);
        let frames = collecting(&unpacker);

        let mut frame = vec![0xAA, 0x55, payload.len() as u8];
        frame.extend_from_slice(&payload);
        let mut stream = noise.clone();
        stream.extend_from_slice(&frame);
        stream.extend_from_slice(&frame);

        unpacker.input_bytes(&stream);

        let parsed = frames.lock();
        prop_assert_eq!(parsed.len(), 2);
        prop_assert_eq!(&parsed[0][..], &frame[..]);
        prop_assert_eq!(&parsed[1][..], &frame[..]);
    }
}

#[test]
fn test_hello_split_across_chunks() {
    let unpacker = Unpacker::new(LengthPrefix::u16_be());
    let frames = collecting(&unpacker);

    assert_eq!(unpacker.input_bytes(&[0x00, 0x05, b'h']).frames, 0);
    assert_eq!(unpacker.buffered_len(), 3);
    assert_eq!(unpacker.input_bytes(b"ello").frames, 1);
    assert_eq!(*frames.lock(), vec![Bytes::from_static(b"\x00\x05hello")]);
}

#[test]
fn test_missing_start_mark_keeps_tail() {
    let misses = Arc::new(Mutex::new(0));
    let counter = misses.clone();
    let unpacker = Unpacker::new(marked_length)
        .with_start_mark(&b"\xAA\x55"[..])
        .with_error_handler(move |kind| {
            assert_eq!(*kind, UnpackErrorKind::StartMarkNotMatch);
            *counter.lock() += 1;
        });
    let frames = collecting(&unpacker);

    // The mark straddles two chunks
    unpacker.input_bytes(&[0x01, 0x02, 0xAA]);
    assert_eq!(*misses.lock(), 1);
    assert_eq!(unpacker.buffered_len(), 1);

    unpacker.input_bytes(&[0x55, 0x01, 0x7F]);
    assert_eq!(*frames.lock(), vec![Bytes::from_static(&[0xAA, 0x55, 0x01, 0x7F])]);
}

#[test]
fn test_interrupted_fragment_is_dropped() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let spy = seen.clone();
    let prefix = LengthPrefix::u8();
    let unpacker = Unpacker::new(move |packet: &MemoryPacket| {
        spy.lock().push(packet.to_vec());
        prefix.calculate(packet)
    })
    .with_interrupt_timeout(Duration::from_millis(30));
    let frames = collecting(&unpacker);

    unpacker.input_bytes(&[0x03, b'a']);
    std::thread::sleep(Duration::from_millis(60));
    unpacker.input_bytes(&[0x01, b'z']);

    assert_eq!(*seen.lock(), vec![vec![0x03, b'a'], vec![0x01, b'z']]);
    assert_eq!(*frames.lock(), vec![Bytes::from_static(b"\x01z")]);
}

#[test]
fn test_prompt_fragment_is_kept() {
    let unpacker = Unpacker::new(LengthPrefix::u8()).with_interrupt_timeout(Duration::from_secs(5));
    let frames = collecting(&unpacker);

    unpacker.input_bytes(&[0x03, b'a']);
    unpacker.input_bytes(&[b'b', b'c']);

    assert_eq!(*frames.lock(), vec![Bytes::from_static(b"\x03abc")]);
}

#[test]
fn test_pool_retains_up_to_cap() {
    let pool = MemoryBlockPool::new(64, 2);

    let blocks: Vec<_> = (0..5).map(|_| pool.get()).collect();
    assert_eq!(pool.on_loan_count(), 5);
    drop(blocks);

    assert_eq!(pool.idle_count(), 2);
    assert_eq!(pool.on_loan_count(), 0);
    assert_eq!(pool.allocated_count(), 5);

    // Steady state reuses cached arrays
    for _ in 0..100 {
        let first = pool.get();
        let second = pool.get();
        drop((first, second));
    }
    assert_eq!(pool.allocated_count(), 5);
}

#[test]
fn test_unpacker_returns_blocks_to_pool() {
    let pool = MemoryBlockPool::new(16, 4);
    let unpacker = Unpacker::new(LengthPrefix::u8());
    let frames = collecting(&unpacker);

    for chunk in [&b"\x04ab"[..], &b"cd\x01"[..], &b"e"[..]] {
        let mut block = pool.get();
        block.buffer_mut()[..chunk.len()].copy_from_slice(chunk);
        block.set_segment(0, chunk.len());
        unpacker.input(block);
    }

    assert_eq!(frames.lock().len(), 2);
    assert_eq!(pool.on_loan_count(), 0);
    assert!(pool.allocated_count() <= 2);
}

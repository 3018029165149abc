#![no_main]

use arbitrary::Arbitrary;
use bytes::Bytes;
use bytesio::modbus::rtu_packet_length;
use bytesio::Unpacker;
use libfuzzer_sys::fuzz_target;
use std::sync::{Arc, Mutex};

/// A byte stream plus the cut points it is delivered at.
#[derive(Debug, Arbitrary)]
struct Delivery {
    stream: Vec<u8>,
    cuts: Vec<u8>,
    start_mark: Option<Vec<u8>>,
}

fuzz_target!(|delivery: Delivery| {
    let mut unpacker = Unpacker::new(rtu_packet_length);
    if let Some(mark) = delivery.start_mark.filter(|m| !m.is_empty() && m.len() <= 4) {
        unpacker = unpacker.with_start_mark(mark);
    }

    let total = Arc::new(Mutex::new(0usize));
    let sink = total.clone();
    unpacker
        .data_parsed()
        .subscribe(move |frame: &Bytes| *sink.lock().unwrap() += frame.len());

    let mut rest = &delivery.stream[..];
    for cut in delivery.cuts {
        if rest.is_empty() {
            break;
        }
        let n = (cut as usize % rest.len()) + 1;
        let (chunk, tail) = rest.split_at(n);
        unpacker.input_bytes(chunk);
        rest = tail;
    }
    if !rest.is_empty() {
        unpacker.input_bytes(rest);
    }

    // Nothing is invented: emitted plus buffered never exceeds what went in
    let emitted = *total.lock().unwrap();
    assert!(emitted + unpacker.buffered_len() <= delivery.stream.len());
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use quic_client_core::varint::{read_varint, varint_len, write_varint};

fuzz_target!(|data: &[u8]| {
    let mut buf = data;
    let Ok(value) = read_varint(&mut buf) else { return };
    let consumed = data.len() - buf.len();
    assert!(consumed >= varint_len(value));

    let mut out = Vec::new();
    write_varint(&mut out, value);
    assert_eq!(out.len(), varint_len(value));
    assert_eq!(read_varint(&mut &out[..]).ok(), Some(value));
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use quic_client_core::packet::{decode_header, CoalescedPackets};

fuzz_target!(|data: &[u8]| {
    for cid_len in [0, 8, 20] {
        if let Ok(partial) = decode_header(data, cid_len) {
            assert!(partial.len <= data.len());
            assert!(partial.pn_offset <= partial.len);
        }
        for packet in CoalescedPackets::new(data, cid_len) {
            match packet {
                Ok((_, bytes)) => assert!(!bytes.is_empty()),
                Err(_) => break,
            }
        }
    }
});

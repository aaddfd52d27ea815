#![no_main]

use libfuzzer_sys::fuzz_target;
use quic_client_core::frame::{self, Frames};

fuzz_target!(|data: &[u8]| {
    // Decoding must never panic, and whatever decodes must re-encode to
    // something that decodes to the same frame.
    for frame in Frames::new(data) {
        let Ok(frame) = frame else { break };
        let mut buf = Vec::new();
        frame::encode(&frame, &mut buf);
        let (again, used) = frame::decode(&buf).expect("re-encoded frame decodes");
        assert_eq!(used, buf.len());
        assert_eq!(again, frame);
    }
});

//! Splitting a UDP datagram into its coalesced QUIC packets.

use crate::error::Result;
use crate::packet::{decode_header, PartialDecode};

/// Iterator over the packets coalesced in one datagram.
///
/// Long header packets are bounded by their Length field; a short header
/// packet runs to the end of the datagram. Iteration stops after the first
/// undecodable header since nothing after it can be located.
pub struct CoalescedPackets<'a> {
    buf: &'a [u8],
    local_cid_len: usize,
    done: bool,
}

impl<'a> CoalescedPackets<'a> {
    pub fn new(datagram: &'a [u8], local_cid_len: usize) -> Self {
        Self {
            buf: datagram,
            local_cid_len,
            done: false,
        }
    }
}

impl<'a> Iterator for CoalescedPackets<'a> {
    type Item = Result<(PartialDecode, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.buf.is_empty() {
            return None;
        }
        match decode_header(self.buf, self.local_cid_len) {
            Ok(decoded) => {
                let (packet, rest) = self.buf.split_at(decoded.len);
                self.buf = rest;
                Some(Ok((decoded, packet)))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

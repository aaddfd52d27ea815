//! Packet number spaces (RFC 9000 §12.3).
//!
//! Each space has its own send counter, its own record of received packet
//! numbers for ACK generation, and its own CRYPTO stream in each direction.

use std::time::Duration;

use crate::packet::number::{decode_pn, pn_length};
use crate::transport::assembler::Assembler;
use crate::transport::range_set::RangeSet;
use crate::transport::stream::SendBuffer;
use crate::transport::Instant;

/// Received ranges beyond this are forgotten, lowest first.
const MAX_ACK_RANGES: usize = 32;

/// An ACK is sent after this many ack-eliciting 1-RTT packets.
const ACK_ELICITING_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpaceId {
    Initial,
    Handshake,
    /// 0-RTT and 1-RTT share the application data space.
    Data,
}

impl SpaceId {
    pub const ALL: [SpaceId; 3] = [SpaceId::Initial, SpaceId::Handshake, SpaceId::Data];

    pub const fn index(self) -> usize {
        self as usize
    }
}

pub struct PacketNumberSpace {
    next_pn: u64,
    /// Largest of our packet numbers the peer acknowledged.
    largest_acked: Option<u64>,

    received: RangeSet,
    /// Packet numbers below this were received but their ranges have been
    /// forgotten; they still count as duplicates.
    forgotten_below: u64,
    largest_received: Option<u64>,
    largest_received_time: Instant,
    /// Ack-eliciting packets received since the last ACK we sent.
    unacked_eliciting: u32,
    ack_deadline: Option<Instant>,
    /// A received packet changed the ACK (out of order, or non-eliciting
    /// after eliciting) and the next ACK should reflect it.
    ack_dirty: bool,

    pub crypto_send: SendBuffer,
    pub crypto_recv: Assembler,
    discarded: bool,
}

impl Default for PacketNumberSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketNumberSpace {
    pub fn new() -> Self {
        Self {
            next_pn: 0,
            largest_acked: None,
            received: RangeSet::new(),
            forgotten_below: 0,
            largest_received: None,
            largest_received_time: 0,
            unacked_eliciting: 0,
            ack_deadline: None,
            ack_dirty: false,
            crypto_send: SendBuffer::new(),
            crypto_recv: Assembler::new(),
            discarded: false,
        }
    }

    // --- Send side ---

    /// Packet number for the next packet; the counter advances.
    pub fn take_pn(&mut self) -> u64 {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    pub fn peek_pn(&self) -> u64 {
        self.next_pn
    }

    /// Truncated length to encode `pn` with.
    pub fn pn_len(&self, pn: u64) -> usize {
        pn_length(pn, self.largest_acked)
    }

    pub fn largest_acked(&self) -> Option<u64> {
        self.largest_acked
    }

    pub fn on_ack_received(&mut self, largest: u64) {
        self.largest_acked = Some(self.largest_acked.map_or(largest, |l| l.max(largest)));
    }

    // --- Receive side ---

    /// Reconstruct a truncated packet number against the largest received.
    pub fn decode_pn(&self, truncated: u64, len: usize) -> u64 {
        decode_pn(truncated, len, self.largest_received)
    }

    pub fn largest_received(&self) -> Option<u64> {
        self.largest_received
    }

    pub fn is_duplicate(&self, pn: u64) -> bool {
        pn < self.forgotten_below || self.received.contains(pn)
    }

    /// Record an authenticated packet.
    ///
    /// `immediate` asks for an ACK without delay (Initial and Handshake).
    pub fn on_packet_received(
        &mut self,
        pn: u64,
        ack_eliciting: bool,
        immediate: bool,
        max_ack_delay: Duration,
        now: Instant,
    ) {
        let out_of_order = self.largest_received.is_some_and(|l| pn < l)
            || self.received.max_end().is_some_and(|end| pn > end);
        self.received.insert_one(pn);
        if let Some(end) = self.received.truncate_low(MAX_ACK_RANGES) {
            self.forgotten_below = self.forgotten_below.max(end);
        }
        if self.largest_received.map_or(true, |l| pn > l) {
            self.largest_received = Some(pn);
            self.largest_received_time = now;
        }

        if !ack_eliciting {
            self.ack_dirty |= self.unacked_eliciting > 0;
            return;
        }
        self.unacked_eliciting += 1;
        let deadline = if immediate || out_of_order || self.unacked_eliciting >= ACK_ELICITING_THRESHOLD {
            now
        } else {
            now + max_ack_delay.as_micros() as u64
        };
        self.ack_deadline = Some(self.ack_deadline.map_or(deadline, |d| d.min(deadline)));
    }

    /// When an ACK must be sent by, if one is owed.
    pub fn ack_deadline(&self) -> Option<Instant> {
        self.ack_deadline
    }

    pub fn ack_due(&self, now: Instant) -> bool {
        self.ack_deadline.is_some_and(|d| d <= now)
    }

    /// Something was received that a future ACK should report.
    pub fn has_ack_ranges(&self) -> bool {
        !self.received.is_empty()
    }

    pub fn wants_ack(&self) -> bool {
        self.ack_deadline.is_some() || self.ack_dirty
    }

    pub fn ack_ranges(&self) -> Vec<std::ops::Range<u64>> {
        self.received.iter().collect()
    }

    /// Time since the largest packet was received, scaled by `exponent`.
    pub fn ack_delay(&self, now: Instant, exponent: u8) -> u64 {
        now.saturating_sub(self.largest_received_time) >> exponent
    }

    pub fn on_ack_sent(&mut self) {
        self.unacked_eliciting = 0;
        self.ack_deadline = None;
        self.ack_dirty = false;
    }

    // --- Lifetime ---

    /// Keys for this space were discarded; nothing is sent or accepted
    /// here again.
    pub fn discard(&mut self) {
        self.discarded = true;
        self.ack_deadline = None;
        self.ack_dirty = false;
        self.unacked_eliciting = 0;
        self.crypto_send = SendBuffer::new();
        self.crypto_recv.clear();
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(25);

    #[test]
    fn send_counter_is_strictly_increasing() {
        let mut space = PacketNumberSpace::new();
        assert_eq!(space.take_pn(), 0);
        assert_eq!(space.take_pn(), 1);
        assert_eq!(space.peek_pn(), 2);
        assert_eq!(space.pn_len(1000), 2);
        space.on_ack_received(990);
        assert_eq!(space.pn_len(1000), 1);
        space.on_ack_received(5);
        assert_eq!(space.largest_acked(), Some(990));
    }

    #[test]
    fn delayed_ack_after_single_packet() {
        let mut space = PacketNumberSpace::new();
        space.on_packet_received(0, true, false, DELAY, 1_000);
        assert_eq!(space.ack_deadline(), Some(26_000));
        assert!(!space.ack_due(2_000));
        assert!(space.ack_due(26_000));
    }

    #[test]
    fn second_eliciting_packet_acks_immediately() {
        let mut space = PacketNumberSpace::new();
        space.on_packet_received(0, true, false, DELAY, 1_000);
        space.on_packet_received(1, true, false, DELAY, 2_000);
        assert!(space.ack_due(2_000));
        space.on_ack_sent();
        assert!(!space.wants_ack());
        assert_eq!(space.ack_ranges(), vec![0..2]);
    }

    #[test]
    fn handshake_spaces_ack_immediately() {
        let mut space = PacketNumberSpace::new();
        space.on_packet_received(0, true, true, DELAY, 500);
        assert!(space.ack_due(500));
    }

    #[test]
    fn reordering_triggers_immediate_ack() {
        let mut space = PacketNumberSpace::new();
        space.on_packet_received(5, true, false, DELAY, 0);
        space.on_ack_sent();
        space.on_packet_received(3, true, false, DELAY, 100);
        assert!(space.ack_due(100));
        assert_eq!(space.ack_ranges(), vec![3..4, 5..6]);
        assert!(space.is_duplicate(3));
        assert!(!space.is_duplicate(4));
    }

    #[test]
    fn forgotten_ranges_still_count_as_duplicates() {
        let mut space = PacketNumberSpace::new();
        for pn in (0..80).step_by(2) {
            space.on_packet_received(pn, false, false, DELAY, 0);
        }
        assert_eq!(space.ack_ranges().len(), MAX_ACK_RANGES);
        assert_eq!(space.ack_ranges()[0], 16..17);
        assert!(space.is_duplicate(0));
        assert!(space.is_duplicate(14));
        // A gap below the floor is indistinguishable from a replay.
        assert!(space.is_duplicate(13));
        assert!(!space.is_duplicate(17));
        assert!(space.is_duplicate(78));
        assert!(!space.is_duplicate(80));
    }

    #[test]
    fn non_eliciting_packets_do_not_schedule_acks() {
        let mut space = PacketNumberSpace::new();
        space.on_packet_received(0, false, false, DELAY, 0);
        assert!(!space.wants_ack());
        assert!(space.has_ack_ranges());
    }

    #[test]
    fn ack_delay_uses_exponent() {
        let mut space = PacketNumberSpace::new();
        space.on_packet_received(0, true, false, DELAY, 1_000);
        assert_eq!(space.ack_delay(9_000, 3), 1_000);
    }

    #[test]
    fn pn_reconstruction_uses_largest_received() {
        let mut space = PacketNumberSpace::new();
        space.on_packet_received(0xa82f30ea, false, false, DELAY, 0);
        assert_eq!(space.decode_pn(0x9b32, 2), 0xa82f9b32);
    }

    #[test]
    fn discard_clears_ack_state() {
        let mut space = PacketNumberSpace::new();
        space.on_packet_received(0, true, true, DELAY, 0);
        space.discard();
        assert!(space.is_discarded());
        assert!(!space.wants_ack());
    }
}

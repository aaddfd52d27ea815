//! RTT estimation and sent-packet bookkeeping (RFC 9002 §5, §A.1).

use std::collections::BTreeMap;
use std::ops::Range;

use crate::transport::stream::Dir;
use crate::transport::Instant;

/// Minimum RTT granularity: 1ms in microseconds.
pub const GRANULARITY: u64 = 1_000;

// ---------------------------------------------------------------------------
// RTT
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RttEstimator {
    initial: u64,
    /// Smoothed RTT estimate (microseconds).
    smoothed: Option<u64>,
    /// RTT variance (microseconds).
    var: u64,
    /// Minimum observed RTT (microseconds).
    min: u64,
    /// Most recent RTT sample (microseconds).
    latest: u64,
}

impl RttEstimator {
    pub fn new(initial_rtt: u64) -> Self {
        Self {
            initial: initial_rtt,
            smoothed: None,
            var: initial_rtt / 2,
            min: u64::MAX,
            latest: initial_rtt,
        }
    }

    /// Update from a newly-acked largest packet (RFC 9002 §5.3).
    ///
    /// `ack_delay` is only subtracted once the handshake is confirmed, capped
    /// at the peer's `max_ack_delay`, and never below `min_rtt`.
    pub fn update(&mut self, latest_rtt: u64, ack_delay: u64, max_ack_delay: u64, handshake_confirmed: bool) {
        self.latest = latest_rtt;
        self.min = self.min.min(latest_rtt);

        match self.smoothed {
            None => {
                self.smoothed = Some(latest_rtt);
                self.var = latest_rtt / 2;
            }
            Some(srtt) => {
                let ack_delay = if handshake_confirmed {
                    ack_delay.min(max_ack_delay)
                } else {
                    0
                };
                let adjusted = if latest_rtt >= self.min + ack_delay {
                    latest_rtt - ack_delay
                } else {
                    latest_rtt
                };
                self.var = (3 * self.var + srtt.abs_diff(adjusted)) / 4;
                self.smoothed = Some((7 * srtt + adjusted) / 8);
            }
        }
    }

    /// Smoothed RTT, or the configured initial RTT before any sample.
    pub fn get(&self) -> u64 {
        self.smoothed.unwrap_or(self.initial)
    }

    pub fn has_sample(&self) -> bool {
        self.smoothed.is_some()
    }

    pub fn var(&self) -> u64 {
        self.var
    }

    pub fn latest(&self) -> u64 {
        self.latest
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    /// srtt + max(4 * rttvar, granularity); the PTO before `max_ack_delay`
    /// and backoff.
    pub fn pto_base(&self) -> u64 {
        self.get() + (4 * self.var).max(GRANULARITY)
    }
}

// ---------------------------------------------------------------------------
// Sent packets
// ---------------------------------------------------------------------------

/// Retransmittable content of a sent packet. On loss, data frames are
/// re-queued by range and control frames by value (or re-derived from
/// current state for limits).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    Crypto { offset: u64, len: u64 },
    Stream { id: u64, offset: u64, len: u64, fin: bool },
    ResetStream { id: u64 },
    StopSending { id: u64 },
    MaxData,
    MaxStreamData { id: u64 },
    MaxStreams(Dir),
    DataBlocked,
    StreamDataBlocked { id: u64 },
    StreamsBlocked(Dir),
    RetireConnectionId(u64),
    Ping,
}

impl SentFrame {
    pub fn stream_range(offset: u64, len: u64) -> Range<u64> {
        offset..offset + len
    }
}

/// Metadata for a sent packet awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub pn: u64,
    pub time_sent: Instant,
    pub size: u64,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    pub frames: Vec<SentFrame>,
}

/// Sent-but-unacked packets of one packet number space, ordered by number.
#[derive(Debug, Default)]
pub struct SentPackets {
    packets: BTreeMap<u64, SentPacket>,
    ack_eliciting_in_flight: usize,
    pub time_of_last_ack_eliciting: Option<Instant>,
    pub loss_time: Option<Instant>,
    pub largest_acked: Option<u64>,
}

impl SentPackets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_packet_sent(&mut self, pkt: SentPacket) {
        if pkt.ack_eliciting && pkt.in_flight {
            self.ack_eliciting_in_flight += 1;
            self.time_of_last_ack_eliciting = Some(pkt.time_sent);
        }
        self.packets.insert(pkt.pn, pkt);
    }

    pub fn remove(&mut self, pn: u64) -> Option<SentPacket> {
        let pkt = self.packets.remove(&pn)?;
        if pkt.ack_eliciting && pkt.in_flight {
            self.ack_eliciting_in_flight -= 1;
        }
        Some(pkt)
    }

    /// Remove and return every packet inside `ranges`, ascending.
    pub fn on_ack_ranges(&mut self, ranges: impl IntoIterator<Item = Range<u64>>) -> Vec<SentPacket> {
        let mut acked = Vec::new();
        for range in ranges {
            let pns: Vec<u64> = self.packets.range(range).map(|(&pn, _)| pn).collect();
            for pn in pns {
                if let Some(pkt) = self.remove(pn) {
                    acked.push(pkt);
                }
            }
        }
        acked.sort_by_key(|p| p.pn);
        acked
    }

    pub fn get(&self, pn: u64) -> Option<&SentPacket> {
        self.packets.get(&pn)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SentPacket> {
        self.packets.values()
    }

    /// Packet numbers below `pn`, ascending.
    pub fn pns_below(&self, pn: u64) -> Vec<u64> {
        self.packets.range(..pn).map(|(&pn, _)| pn).collect()
    }

    pub fn has_ack_eliciting_in_flight(&self) -> bool {
        self.ack_eliciting_in_flight > 0
    }

    /// Oldest unacked ack-eliciting packet, used for PTO probes.
    pub fn oldest_ack_eliciting(&self) -> Option<&SentPacket> {
        self.packets.values().find(|p| p.ack_eliciting && p.in_flight)
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Forget everything (keys discarded). Returns the in-flight bytes that
    /// leave the congestion window.
    pub fn clear(&mut self) -> u64 {
        let bytes = self.packets.values().filter(|p| p.in_flight).map(|p| p.size).sum();
        self.packets.clear();
        self.ack_eliciting_in_flight = 0;
        self.time_of_last_ack_eliciting = None;
        self.loss_time = None;
        bytes
    }
}

//! Loss detection and probe timeouts (RFC 9002 §6).

use std::ops::Range;

use crate::transport::recovery::{RttEstimator, SentPacket, SentPackets, GRANULARITY};
use crate::transport::space::SpaceId;
use crate::transport::Instant;

/// Time threshold for loss detection: 9/8 (RFC 9002 §6.1.2).
const TIME_THRESHOLD_NUM: u64 = 9;
const TIME_THRESHOLD_DEN: u64 = 8;

/// Packet number threshold for loss detection (RFC 9002 §6.1.1).
const PACKET_THRESHOLD: u64 = 3;

/// Persistent congestion spans this many PTOs (RFC 9002 §7.6.1).
const PERSISTENT_CONGESTION_THRESHOLD: u64 = 3;

/// Caps the PTO backoff shift.
const MAX_PTO_BACKOFF: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Loss(SpaceId),
    Pto(SpaceId),
}

/// What an expired loss detection timer asks of the connection.
#[derive(Debug)]
pub enum Timeout {
    /// Packets crossed the time threshold.
    Lost { space: SpaceId, lost: Vec<SentPacket> },
    /// Send one or two ack-eliciting probes in `space`.
    Probe(SpaceId),
}

#[derive(Debug, Default)]
pub struct AckOutcome {
    pub acked: Vec<SentPacket>,
    pub lost: Vec<SentPacket>,
    pub persistent_congestion: bool,
}

pub struct LossDetector {
    spaces: [SentPackets; 3],
    pub rtt: RttEstimator,
    pto_count: u32,
    /// Max ack delay advertised by the peer (microseconds).
    max_ack_delay: u64,
    timer: Option<(Instant, TimerKind)>,
}

impl LossDetector {
    pub fn new(initial_rtt: u64, max_ack_delay: u64) -> Self {
        Self {
            spaces: Default::default(),
            rtt: RttEstimator::new(initial_rtt),
            pto_count: 0,
            max_ack_delay,
            timer: None,
        }
    }

    pub fn set_max_ack_delay(&mut self, max_ack_delay: u64) {
        self.max_ack_delay = max_ack_delay;
    }

    pub fn space(&self, space: SpaceId) -> &SentPackets {
        &self.spaces[space.index()]
    }

    pub fn on_packet_sent(&mut self, space: SpaceId, pkt: SentPacket) {
        self.spaces[space.index()].on_packet_sent(pkt);
    }

    /// Process the ranges of an ACK frame (ascending, already validated
    /// against the packets we sent).
    pub fn on_ack_received(
        &mut self,
        space: SpaceId,
        ranges: &[Range<u64>],
        ack_delay: u64,
        handshake_confirmed: bool,
        now: Instant,
    ) -> AckOutcome {
        let Some(largest) = ranges.last().map(|r| r.end - 1) else {
            return AckOutcome::default();
        };
        let sent = &mut self.spaces[space.index()];
        sent.largest_acked = Some(sent.largest_acked.map_or(largest, |l| l.max(largest)));

        let acked = sent.on_ack_ranges(ranges.iter().rev().cloned());
        if acked.is_empty() {
            return AckOutcome::default();
        }

        if let Some(newest) = acked.last().filter(|p| p.pn == largest) {
            if acked.iter().any(|p| p.ack_eliciting) {
                let sample = now.saturating_sub(newest.time_sent);
                let ack_delay = if space == SpaceId::Data { ack_delay } else { 0 };
                self.rtt
                    .update(sample, ack_delay, self.max_ack_delay, handshake_confirmed);
                tracing::trace!(
                    space = ?space,
                    latest_rtt = sample,
                    srtt = self.rtt.get(),
                    "rtt sample"
                );
            }
        }

        // A client keeps backing off until the server validated its address.
        if space != SpaceId::Initial {
            self.pto_count = 0;
        }

        let lost = self.detect_lost(space, now);
        let persistent_congestion = self.is_persistent_congestion(&lost, &acked);
        AckOutcome {
            acked,
            lost,
            persistent_congestion,
        }
    }

    /// Declare packets below the largest acknowledged lost once they cross
    /// the packet or time threshold, and arm the loss timer for the rest.
    pub fn detect_lost(&mut self, space: SpaceId, now: Instant) -> Vec<SentPacket> {
        let rtt_base = self.rtt.get().max(self.rtt.latest());
        let loss_delay = (rtt_base * TIME_THRESHOLD_NUM / TIME_THRESHOLD_DEN).max(GRANULARITY);

        let sent = &mut self.spaces[space.index()];
        sent.loss_time = None;
        let Some(largest) = sent.largest_acked else {
            return Vec::new();
        };

        let mut lost = Vec::new();
        for pn in sent.pns_below(largest) {
            let Some(time_sent) = sent.get(pn).map(|p| p.time_sent) else {
                continue;
            };
            if largest >= pn + PACKET_THRESHOLD || now >= time_sent + loss_delay {
                if let Some(pkt) = sent.remove(pn) {
                    lost.push(pkt);
                }
            } else {
                let deadline = time_sent + loss_delay;
                sent.loss_time = Some(sent.loss_time.map_or(deadline, |t: Instant| t.min(deadline)));
            }
        }
        if !lost.is_empty() {
            tracing::debug!(space = ?space, count = lost.len(), "packets lost");
        }
        lost
    }

    /// Lost ack-eliciting packets spanning more than the persistent
    /// congestion duration with nothing acknowledged in between.
    fn is_persistent_congestion(&self, lost: &[SentPacket], acked: &[SentPacket]) -> bool {
        if !self.rtt.has_sample() {
            return false;
        }
        let mut eliciting = lost.iter().filter(|p| p.ack_eliciting);
        let Some(first) = eliciting.next() else {
            return false;
        };
        let last = eliciting.last().unwrap_or(first);
        let duration =
            (self.rtt.pto_base() + self.max_ack_delay) * PERSISTENT_CONGESTION_THRESHOLD;
        if last.time_sent.saturating_sub(first.time_sent) < duration {
            return false;
        }
        !acked
            .iter()
            .any(|p| p.time_sent > first.time_sent && p.time_sent < last.time_sent)
    }

    fn pto_backoff(&self) -> u64 {
        1 << self.pto_count.min(MAX_PTO_BACKOFF)
    }

    /// PTO duration for `space`, including backoff.
    pub fn pto_duration(&self, space: SpaceId) -> u64 {
        let base = match space {
            SpaceId::Data => self.rtt.pto_base() + self.max_ack_delay,
            _ => self.rtt.pto_base(),
        };
        base * self.pto_backoff()
    }

    /// Re-arm the loss detection timer (RFC 9002 §A.8). Call after every
    /// send, ACK and timeout.
    ///
    /// `peer_validated` is true once the server can no longer be blocked
    /// by the anti-amplification limit (handshake confirmed, or a Handshake
    /// packet acknowledged).
    pub fn set_timer(
        &mut self,
        now: Instant,
        handshake_confirmed: bool,
        has_handshake_keys: bool,
        peer_validated: bool,
    ) {
        let loss = SpaceId::ALL
            .into_iter()
            .filter_map(|s| self.spaces[s.index()].loss_time.map(|t| (t, s)))
            .min();
        if let Some((t, space)) = loss {
            self.timer = Some((t, TimerKind::Loss(space)));
            return;
        }

        let any_in_flight = self.spaces.iter().any(SentPackets::has_ack_eliciting_in_flight);
        if !any_in_flight {
            if peer_validated {
                self.timer = None;
            } else {
                let space = if has_handshake_keys {
                    SpaceId::Handshake
                } else {
                    SpaceId::Initial
                };
                self.timer = Some((now + self.pto_duration(space), TimerKind::Pto(space)));
            }
            return;
        }

        let mut best: Option<(Instant, SpaceId)> = None;
        for space in SpaceId::ALL {
            let sent = &self.spaces[space.index()];
            if !sent.has_ack_eliciting_in_flight() {
                continue;
            }
            if space == SpaceId::Data && !handshake_confirmed {
                break;
            }
            let Some(last) = sent.time_of_last_ack_eliciting else {
                continue;
            };
            let t = last + self.pto_duration(space);
            if best.map_or(true, |(b, _)| t < b) {
                best = Some((t, space));
            }
        }
        self.timer = best.map(|(t, space)| (t, TimerKind::Pto(space)));
    }

    pub fn timer(&self) -> Option<Instant> {
        self.timer.map(|(t, _)| t)
    }

    /// Fire the timer if due.
    pub fn on_timeout(&mut self, now: Instant) -> Option<Timeout> {
        let (deadline, kind) = self.timer?;
        if now < deadline {
            return None;
        }
        self.timer = None;
        Some(match kind {
            TimerKind::Loss(space) => Timeout::Lost {
                space,
                lost: self.detect_lost(space, now),
            },
            TimerKind::Pto(space) => {
                self.pto_count += 1;
                tracing::debug!(space = ?space, pto_count = self.pto_count, "probe timeout");
                Timeout::Probe(space)
            }
        })
    }

    /// Drop a packet number space. Returns in-flight bytes to release from
    /// the congestion controller.
    pub fn discard_space(&mut self, space: SpaceId) -> u64 {
        self.pto_count = 0;
        self.spaces[space.index()].clear()
    }

    /// Every packet in flight, for resending 0-RTT data after rejection.
    pub fn drain_space(&mut self, space: SpaceId) -> Vec<SentPacket> {
        let sent = &mut self.spaces[space.index()];
        let pns = sent.pns_below(u64::MAX);
        pns.into_iter().filter_map(|pn| sent.remove(pn)).collect()
    }

    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::recovery::SentFrame;

    const MAX_ACK_DELAY: u64 = 25_000;

    fn pkt(pn: u64, time_sent: Instant) -> SentPacket {
        SentPacket {
            pn,
            time_sent,
            size: 1200,
            ack_eliciting: true,
            in_flight: true,
            frames: vec![SentFrame::Ping],
        }
    }

    fn detector() -> LossDetector {
        LossDetector::new(333_000, MAX_ACK_DELAY)
    }

    #[test]
    fn ack_produces_rtt_sample() {
        let mut ld = detector();
        ld.on_packet_sent(SpaceId::Initial, pkt(0, 1_000));
        let out = ld.on_ack_received(SpaceId::Initial, &[0..1], 0, false, 51_000);
        assert_eq!(out.acked.len(), 1);
        assert!(out.lost.is_empty());
        assert_eq!(ld.rtt.get(), 50_000);
    }

    #[test]
    fn packet_threshold_loss() {
        let mut ld = detector();
        for pn in 0..5 {
            ld.on_packet_sent(SpaceId::Data, pkt(pn, 1_000 + pn));
        }
        let out = ld.on_ack_received(SpaceId::Data, &[3..5], 0, true, 2_000);
        let lost: Vec<u64> = out.lost.iter().map(|p| p.pn).collect();
        // 4 - 0 >= 3 and 4 - 1 >= 3; pn 2 is within the threshold.
        assert_eq!(lost, vec![0, 1]);
        assert!(ld.space(SpaceId::Data).loss_time.is_some());
    }

    #[test]
    fn time_threshold_loss_via_timer() {
        let mut ld = detector();
        ld.on_packet_sent(SpaceId::Data, pkt(0, 0));
        ld.on_packet_sent(SpaceId::Data, pkt(1, 10_000));
        let out = ld.on_ack_received(SpaceId::Data, &[1..2], 0, true, 110_000);
        assert!(out.lost.is_empty());
        // srtt = 100ms, loss delay = 112.5ms after pn 0 was sent.
        ld.set_timer(110_000, true, true, true);
        assert_eq!(ld.timer(), Some(112_500));
        assert!(ld.on_timeout(112_499).is_none());
        match ld.on_timeout(112_500) {
            Some(Timeout::Lost { space, lost }) => {
                assert_eq!(space, SpaceId::Data);
                assert_eq!(lost.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pto_doubles() {
        let mut ld = detector();
        ld.on_packet_sent(SpaceId::Handshake, pkt(0, 0));
        ld.set_timer(0, false, true, false);
        let first = ld.timer().unwrap();
        // 333ms + 4 * 166.5ms
        assert_eq!(first, 999_000);
        assert!(matches!(ld.on_timeout(first), Some(Timeout::Probe(SpaceId::Handshake))));
        ld.set_timer(first, false, true, false);
        assert_eq!(ld.timer(), Some(2 * 999_000));
        assert_eq!(ld.pto_count(), 1);
    }

    #[test]
    fn data_space_pto_waits_for_confirmation() {
        let mut ld = detector();
        ld.on_packet_sent(SpaceId::Data, pkt(0, 0));
        ld.set_timer(0, false, true, false);
        assert!(ld.timer().is_none());
        ld.set_timer(0, true, true, true);
        assert_eq!(ld.timer(), Some(999_000 + MAX_ACK_DELAY));
    }

    #[test]
    fn client_arms_anti_deadlock_pto() {
        let mut ld = detector();
        ld.set_timer(5, false, false, false);
        assert_eq!(ld.timer(), Some(5 + 999_000));
        ld.set_timer(5, true, true, true);
        assert_eq!(ld.timer(), None);
    }

    #[test]
    fn persistent_congestion_detected() {
        let mut ld = detector();
        ld.on_packet_sent(SpaceId::Data, pkt(0, 0));
        ld.on_ack_received(SpaceId::Data, &[0..1], 0, true, 10_000);
        // The lost packets span 180ms, more than three PTOs.
        for pn in 1..5 {
            ld.on_packet_sent(SpaceId::Data, pkt(pn, pn * 60_000));
        }
        ld.on_packet_sent(SpaceId::Data, pkt(10, 400_000));
        let out = ld.on_ack_received(SpaceId::Data, &[10..11], 0, true, 401_000);
        assert_eq!(out.lost.len(), 4);
        assert!(out.persistent_congestion);
    }

    #[test]
    fn discard_releases_bytes() {
        let mut ld = detector();
        ld.on_packet_sent(SpaceId::Initial, pkt(0, 0));
        ld.on_packet_sent(SpaceId::Initial, pkt(1, 0));
        assert_eq!(ld.discard_space(SpaceId::Initial), 2400);
        assert!(!ld.space(SpaceId::Initial).has_ack_eliciting_in_flight());
    }
}
